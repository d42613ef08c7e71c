use std::collections::HashMap;

/// Static worker-name → queue-name map, handed to workers at construction.
/// A task published for worker X lands on the queue registered for X; a
/// worker with no explicit route consumes the queue named after itself.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    routes: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Builder-style so registries read as a literal map.
    pub fn with_route(mut self, worker: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(worker.into(), queue.into());
        self
    }

    /// Queue for a registered worker name, if any.
    pub fn queue_for(&self, worker: &str) -> Option<&str> {
        self.routes.get(worker).map(String::as_str)
    }

    /// Queue a worker consumes from: its registered route, or its own name.
    pub fn own_queue<'a>(&'a self, worker: &'a str) -> &'a str {
        self.queue_for(worker).unwrap_or(worker)
    }
}
