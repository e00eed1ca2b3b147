use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A handler takes the request's query string and body and returns the
/// response body verbatim.
pub type Handler = Arc<dyn Fn(&str, &[u8]) -> String + Send + Sync>;

/// The mutable path-to-handler map the listener serves from.
///
/// This is the narrow surface the certificate machinery shares with the
/// host's request routing: the challenge responder installs and removes
/// entries, the listener dispatches into it. Clones share the same table.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, Handler>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler at `path`, replacing any previous one.
    pub fn insert(&self, path: impl Into<String>, handler: Handler) {
        self.routes
            .write()
            .expect("route table lock poisoned")
            .insert(path.into(), handler);
    }

    /// Remove the handler at `path`. Returns whether one was present.
    pub fn remove(&self, path: &str) -> bool {
        self.routes
            .write()
            .expect("route table lock poisoned")
            .remove(path)
            .is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes
            .read()
            .expect("route table lock poisoned")
            .contains_key(path)
    }

    /// Run the handler registered at `path`, if any. The handler is cloned
    /// out of the table so it never runs under the lock.
    pub fn dispatch(&self, path: &str, query: &str, body: &[u8]) -> Option<String> {
        let handler = self
            .routes
            .read()
            .expect("route table lock poisoned")
            .get(path)
            .cloned()?;
        Some(handler(query, body))
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("route table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
