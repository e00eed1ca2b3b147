use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use tracing::debug;

use crate::routes::RouteTable;

/// Path prefix the authority probes during `http-01` validation.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub fn challenge_path(token: &str) -> String {
    format!("{CHALLENGE_PATH_PREFIX}{token}")
}

/// Capability to answer `http-01` challenges.
///
/// A binding lives for exactly one authorization's validation phase: the
/// issuance workflow registers it before signaling readiness and removes it
/// once the authority has validated, on the success and failure paths alike.
#[enum_dispatch]
pub trait Http01Api {
    /// Install a responder returning `key_authorization` verbatim for
    /// `token`. Registering the same token twice is idempotent.
    fn register(&self, token: &str, key_authorization: &str);

    /// Remove the responder for `token`. A no-op when nothing is registered.
    fn unregister(&self, token: &str);

    /// The key authorization currently served for `token`, if any.
    fn lookup(&self, token: &str) -> Option<String>;
}

/// An `http-01` responder.
#[enum_dispatch(Http01Api)]
#[derive(Clone)]
pub enum Http01Responder {
    Routes(RouteResponder),
}

impl Http01Responder {
    pub fn new_routes(routes: RouteTable) -> Self {
        Self::Routes(RouteResponder::new(routes))
    }
}

/// Responder backed by the listener's route table.
#[derive(Clone)]
pub struct RouteResponder {
    routes: RouteTable,
}

impl RouteResponder {
    pub fn new(routes: RouteTable) -> Self {
        Self { routes }
    }
}

impl Http01Api for RouteResponder {
    fn register(&self, token: &str, key_authorization: &str) {
        debug!("installing http-01 responder for token {token}");
        let key_authorization = key_authorization.to_string();
        self.routes.insert(
            challenge_path(token),
            Arc::new(move |_query, _body| key_authorization.clone()),
        );
    }

    fn unregister(&self, token: &str) {
        if self.routes.remove(&challenge_path(token)) {
            debug!("removed http-01 responder for token {token}");
        }
    }

    fn lookup(&self, token: &str) -> Option<String> {
        self.routes.dispatch(&challenge_path(token), "", &[])
    }
}
