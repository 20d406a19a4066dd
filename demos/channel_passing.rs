//! Channel passing over the in-memory transport.
//!
//! The client opens one request channel to the server. Every request
//! carries a fresh reply channel and the server answers on it; one request
//! also carries a byte stream the client uploads through.

use chanpass::{ByteStream, Channel, Direction, MemoryConfig, SessionConfig, session_pair};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    Add { a: i64, b: i64, reply: Channel },
    Upload { name: String, body: ByteStream, reply: Channel },
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Sum(i64),
    Stored { name: String, bytes: usize },
}

async fn serve(inbox: Channel) -> chanpass::Result<()> {
    while let Some(request) = inbox.recv::<Request>().await? {
        match request {
            Request::Add { a, b, reply } => {
                reply.send(&Response::Sum(a + b)).await?;
                reply.close().await?;
            }
            Request::Upload { name, body, reply } => {
                let mut bytes = 0;
                while let Some(chunk) = body.read().await? {
                    bytes += chunk.len();
                }
                reply.send(&Response::Stored { name, bytes }).await?;
                reply.close().await?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chanpass=debug".into()),
        )
        .init();

    println!("=== Channel passing demo ===\n");

    let (server, client) = session_pair(SessionConfig::default(), MemoryConfig::default());

    let requests = client.create_channel(Direction::Write, None)?;
    let inbox = server.accept().await.ok_or("server session closed")?;
    println!("Request channel {} open", inbox.id());

    let server_task = tokio::spawn(serve(inbox));

    // 1. Plain request with a reply channel
    let reply = requests.create_channel(Direction::Read)?;
    requests
        .send(&Request::Add {
            a: 10,
            b: 32,
            reply: reply.clone(),
        })
        .await?;
    println!("add(10, 32) = {:?}", reply.recv::<Response>().await?);

    // 2. Upload through a passed byte stream
    let body = requests.create_byte_stream()?;
    let reply = requests.create_channel(Direction::Read)?;
    requests
        .send(&Request::Upload {
            name: "notes.txt".into(),
            body: body.clone(),
            reply: reply.clone(),
        })
        .await?;
    for line in ["first line\n", "second line\n"] {
        body.write(line.as_bytes()).await?;
    }
    body.close().await?;
    println!("upload -> {:?}", reply.recv::<Response>().await?);

    requests.close().await?;
    server_task.await??;

    client.close().await?;
    server.close().await?;
    println!("\nBoth sessions closed");
    Ok(())
}
