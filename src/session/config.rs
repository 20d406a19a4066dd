use crate::wire::types::Role;

pub const DEFAULT_CLOSE_CONCURRENCY: usize = 16;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which half of the id space this side allocates from.
    pub role: Role,
    /// Channels force-closed at the same time while the session shuts down.
    pub close_concurrency: usize,
    /// Session events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Acceptor,
            close_concurrency: DEFAULT_CLOSE_CONCURRENCY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_close_concurrency(mut self, limit: usize) -> Self {
        self.close_concurrency = limit.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
