//! Automatic TLS for a domain's listener.
//!
//! This library keeps a domain-validated certificate fresh for the lifetime
//! of a process: it checks the stored certificate's remaining validity,
//! obtains or renews it through the ACME protocol with Let's Encrypt as the
//! authority, persists the PEM artifacts to disk, and swaps the live secure
//! context into the running listener without dropping connections.
//!
//! # Features
//!
//! - Automatic certificate issuance and renewal
//! - `http-01` challenge handling through the listener's own route table
//! - Provisioning gate before the first TLS handshake, with graceful
//!   degradation to plain HTTP when no certificate can be obtained
//! - Hot-swap of TLS materials on renewal, no socket rebind
//!
//! # Usage
//!
//! The one-call path wraps listener startup entirely:
//!
//! ```rust,no_run
//! use autotls::{RouteTable, ServerBinding, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let routes = RouteTable::new();
//!     let config = ServerConfig::builder()
//!         .port(443)
//!         .domain("example.com")
//!         .storage_dir("/var/lib/autotls")
//!         .build();
//!     let handle = ServerBinding::start(config, routes).await?;
//!     println!("listening on {}", handle.local_addr());
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```
//!
//! The pieces compose individually as well: a [`RenewalEngine`] over a
//! [`CredentialStore`] and any [`Issuer`], driven by a
//! [`LifecycleScheduler`] or by hand.

mod acme_client;
mod challenge;
mod renewal;
mod routes;
mod scheduler;
mod server;
mod store;
#[cfg(test)]
mod test_support;

pub use acme_client::{AcmeIssuer, IssuanceError};
pub use challenge::{challenge_path, Http01Api, Http01Responder, RouteResponder, CHALLENGE_PATH_PREFIX};
pub use renewal::{Issuer, RenewalEngine, RenewalOutcome, RenewalPolicy};
pub use routes::{Handler, RouteTable};
pub use scheduler::{LifecycleScheduler, LifecycleState};
pub use server::{spawn_plain_listener, ServerBinding, ServerConfig, ServerHandle};
pub use store::{CredentialBundle, CredentialStore, Environment, StoreError};
