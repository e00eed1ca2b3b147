use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{debug, error, info, warn};

use crate::acme_client::AcmeIssuer;
use crate::challenge::Http01Responder;
use crate::renewal::{RenewalEngine, RenewalPolicy};
use crate::routes::RouteTable;
use crate::scheduler::{LifecycleScheduler, LifecycleState};
use crate::store::{CredentialBundle, CredentialStore, Environment};

/// Listener configuration. With a `domain` set, certificate automation is
/// enabled; without one the listener is a plain pass-through.
#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct ServerConfig {
    pub port: u16,
    #[builder(default = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_addr: IpAddr,
    /// Port for the plain listener answering `http-01` challenges, which
    /// must arrive unencrypted.
    #[builder(default = 80)]
    pub challenge_port: u16,
    pub domain: Option<String>,
    /// Contact address for the authority account. Defaults to
    /// `support@{domain}`.
    pub email: Option<String>,
    /// Use the staging directory instead of production.
    #[builder(default)]
    pub staging: bool,
    #[builder(default = PathBuf::from("."))]
    pub storage_dir: PathBuf,
    #[builder(default = Duration::from_secs(30 * 24 * 3600))]
    pub renewal_threshold: Duration,
    #[builder(default = Duration::from_secs(3600))]
    pub check_interval: Duration,
    #[builder(default = Duration::from_secs(120))]
    pub issuance_timeout: Duration,
    /// Send permissive CORS headers on responses.
    #[builder(default = true)]
    pub use_cors: bool,
    /// Fail startup instead of degrading to plain HTTP when no usable
    /// certificate can be obtained.
    #[builder(default)]
    pub require_certificate: bool,
}

impl ServerConfig {
    pub fn environment(&self) -> Environment {
        if self.staging {
            Environment::Staging
        } else {
            Environment::Production
        }
    }

    fn renewal_policy(&self) -> Option<RenewalPolicy> {
        let domain = self.domain.clone()?;
        let email = self
            .email
            .clone()
            .unwrap_or_else(|| format!("support@{domain}"));
        Some(
            RenewalPolicy::builder()
                .domain(domain)
                .email(email)
                .environment(self.environment())
                .renewal_threshold(self.renewal_threshold)
                .check_interval(self.check_interval)
                .issuance_timeout(self.issuance_timeout)
                .build(),
        )
    }
}

type TlsSlot = Arc<RwLock<Option<TlsAcceptor>>>;

/// Handle to a bound server.
///
/// Owns the live secure context: a slot that is empty in plain or degraded
/// mode and replaced wholesale on every renewal. Swapping never rebinds the
/// socket and never touches connections already accepted.
pub struct ServerHandle {
    local_addr: SocketAddr,
    challenge_addr: Option<SocketAddr>,
    tls: TlsSlot,
    state: RwLock<LifecycleState>,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerHandle {
    pub(crate) fn new(local_addr: SocketAddr, challenge_addr: Option<SocketAddr>) -> Self {
        Self {
            local_addr,
            challenge_addr,
            tls: Arc::new(RwLock::new(None)),
            state: RwLock::new(LifecycleState::Idle),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn challenge_addr(&self) -> Option<SocketAddr> {
        self.challenge_addr
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.read().expect("state lock poisoned")
    }

    pub(crate) fn set_lifecycle_state(&self, state: LifecycleState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    pub fn has_secure_context(&self) -> bool {
        self.tls.read().expect("tls slot lock poisoned").is_some()
    }

    /// How many times the secure context has been installed or replaced.
    pub fn secure_context_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replace the TLS materials used for new handshakes. In-flight
    /// handshakes and accepted connections are unaffected.
    pub fn set_secure_context(&self, bundle: &CredentialBundle) -> Result<()> {
        let acceptor = build_acceptor(bundle)?;
        *self.tls.write().expect("tls slot lock poisoned") = Some(acceptor);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the accept loops and the renewal task.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task list lock poisoned").push(task);
    }
}

/// Builds a TLS acceptor from in-memory PEM material, leaf first, issuer
/// chain appended.
fn build_acceptor(bundle: &CredentialBundle) -> Result<TlsAcceptor> {
    let mut certs = CertificateDer::pem_slice_iter(bundle.certificate_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate")?;
    if !bundle.chain_pem.trim().is_empty() {
        let chain = CertificateDer::pem_slice_iter(bundle.chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("failed to parse issuer chain")?;
        certs.extend(chain);
    }
    let key = PrivateKeyDer::from_pem_slice(bundle.private_key_pem.as_bytes())
        .context("failed to parse private key")?;

    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&TLS12, &TLS13])
        .context("failed to build TLS config")?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Starts listeners with the certificate lifecycle wrapped around them.
pub struct ServerBinding;

impl ServerBinding {
    /// Bind and serve.
    ///
    /// Without a domain this starts a single plain listener and returns
    /// immediately. With a domain it binds the challenge listener, runs one
    /// renewal check before the main listener accepts traffic, and keeps the
    /// certificate fresh in the background for the life of the handle.
    /// Absence of a usable certificate degrades to plain HTTP with a
    /// warning instead of failing startup, unless `require_certificate`
    /// is set.
    pub async fn start(config: ServerConfig, routes: RouteTable) -> Result<Arc<ServerHandle>> {
        let Some(policy) = config.renewal_policy() else {
            warn!("domain not configured; starting listener without certificate automation");
            let listener = TcpListener::bind((config.listen_addr, config.port))
                .await
                .context("failed to bind listener")?;
            let handle = Arc::new(ServerHandle::new(listener.local_addr()?, None));
            handle.track(spawn_accept_loop(
                listener,
                routes,
                None,
                config.use_cors,
            ));
            return Ok(handle);
        };

        let challenge_listener = TcpListener::bind((config.listen_addr, config.challenge_port))
            .await
            .context("failed to bind challenge listener")?;
        let main_listener = TcpListener::bind((config.listen_addr, config.port))
            .await
            .context("failed to bind listener")?;
        let handle = Arc::new(ServerHandle::new(
            main_listener.local_addr()?,
            Some(challenge_listener.local_addr()?),
        ));

        // The authority probes this listener during the provisioning gate,
        // so it must accept before the first issuance attempt.
        handle.track(spawn_accept_loop(
            challenge_listener,
            routes.clone(),
            None,
            config.use_cors,
        ));

        let store = CredentialStore::new(&config.storage_dir);
        let responder = Http01Responder::new_routes(routes.clone());
        let issuer = AcmeIssuer::new(policy.environment, responder);
        let engine = RenewalEngine::new(store, issuer);
        let scheduler = LifecycleScheduler::new(engine, policy, handle.clone());

        // Provisioning gate: complete before the main listener accepts, so
        // the first TLS handshake sees the freshest available credentials.
        scheduler.provision().await;
        if config.require_certificate && !handle.has_secure_context() {
            handle.shutdown();
            bail!("no usable certificate and require_certificate is set");
        }

        handle.track(spawn_accept_loop(
            main_listener,
            routes,
            Some(handle.tls.clone()),
            config.use_cors,
        ));
        handle.track(scheduler.spawn());

        info!("listening on {}", handle.local_addr());
        Ok(handle)
    }
}

/// Bind a plain listener serving `routes`, without certificate automation.
/// Used by tooling that needs the challenge endpoint reachable while running
/// the renewal workflow out of band.
pub async fn spawn_plain_listener(
    addr: impl Into<SocketAddr>,
    routes: RouteTable,
    use_cors: bool,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr.into())
        .await
        .context("failed to bind listener")?;
    let local_addr = listener.local_addr()?;
    Ok((local_addr, spawn_accept_loop(listener, routes, None, use_cors)))
}

fn spawn_accept_loop(
    listener: TcpListener,
    routes: RouteTable,
    tls: Option<TlsSlot>,
    use_cors: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("accept failed: {err}");
                    continue;
                }
            };
            let routes = routes.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, routes, tls, use_cors).await {
                    debug!("connection from {peer} ended with error: {err:#}");
                }
            });
        }
    })
}

async fn serve_connection(
    stream: TcpStream,
    routes: RouteTable,
    tls: Option<TlsSlot>,
    use_cors: bool,
) -> Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let routes = routes.clone();
        async move { handle_request(req, routes, use_cors).await }
    });

    // The acceptor is cloned out of the slot per connection, so a hot-swap
    // only affects handshakes that start after it.
    let acceptor = tls.and_then(|slot| slot.read().expect("tls slot lock poisoned").clone());
    match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .context("failed to accept tls connection")?;
            http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
                .context("failed to serve connection")?;
        }
        None => {
            http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
                .context("failed to serve connection")?;
        }
    }
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    routes: RouteTable,
    use_cors: bool,
) -> Result<Response<String>> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .context("failed to read request body")?
        .to_bytes();

    let mut response = match routes.dispatch(&path, &query, &body) {
        Some(body) => Response::builder()
            .status(StatusCode::OK)
            .body(body)
            .expect("static response"),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(String::new())
            .expect("static response"),
    };
    if use_cors {
        response.headers_mut().insert(
            hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
            hyper::header::HeaderValue::from_static("*"),
        );
    }
    Ok(response)
}
