use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::renewal::{Issuer, RenewalEngine, RenewalOutcome, RenewalPolicy};
use crate::server::ServerHandle;

/// Certificate automation state of a bound server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No secure context installed yet; the listener serves plain HTTP.
    Idle,
    /// A secure context is live and periodic checks keep it fresh.
    Running,
}

/// Drives the renewal engine for the lifetime of a bound server: once
/// synchronously before the listener accepts traffic, then on a fixed
/// period.
///
/// The periodic loop is sequential (check, then sleep), so two renewal
/// attempts for the same domain can never overlap; a slow attempt defers
/// the next tick instead of racing it.
pub struct LifecycleScheduler<I> {
    engine: RenewalEngine<I>,
    policy: RenewalPolicy,
    handle: Arc<ServerHandle>,
}

impl<I: Issuer + 'static> LifecycleScheduler<I> {
    pub fn new(engine: RenewalEngine<I>, policy: RenewalPolicy, handle: Arc<ServerHandle>) -> Self {
        Self {
            engine,
            policy,
            handle,
        }
    }

    /// The pre-serve provisioning gate. Runs one renewal check and installs
    /// whatever usable credentials the store then holds. Failure leaves the
    /// listener in degraded plain-HTTP mode rather than failing startup.
    pub async fn provision(&self) {
        if let Err(err) = self.engine.maybe_renew(&self.policy).await {
            warn!(
                "initial certificate check for {} failed: {err:?}",
                self.policy.domain
            );
        }
        match self
            .engine
            .store()
            .read(&self.policy.domain, self.policy.environment)
        {
            Ok(bundle) => match self.handle.set_secure_context(&bundle) {
                Ok(()) => {
                    self.handle.set_lifecycle_state(LifecycleState::Running);
                    info!("serving TLS for {}", self.policy.domain);
                }
                Err(err) => warn!("failed to install secure context: {err:?}"),
            },
            Err(_) => {
                warn!(
                    "no usable certificate for {}; serving without TLS until one is issued",
                    self.policy.domain
                );
            }
        }
    }

    /// Move the scheduler into its background task. Must be called after
    /// [`provision`](Self::provision) so the first periodic tick never
    /// precedes the gate.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "scheduling certificate checks for {} every {:?}",
            self.policy.domain, self.policy.check_interval
        );
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        loop {
            sleep(self.policy.check_interval).await;
            match self.engine.maybe_renew(&self.policy).await {
                Ok(RenewalOutcome::Skipped) => {}
                Ok(RenewalOutcome::Renewed) => self.install_renewed(),
                Err(err) => {
                    error!(
                        "certificate renewal for {} failed: {err:?}",
                        self.policy.domain
                    );
                }
            }
        }
    }

    fn install_renewed(&self) {
        let bundle = match self
            .engine
            .store()
            .read(&self.policy.domain, self.policy.environment)
        {
            Ok(bundle) => bundle,
            Err(err) => {
                error!("renewed credentials unreadable: {err}");
                return;
            }
        };
        match self.handle.set_secure_context(&bundle) {
            Ok(()) => {
                if self.handle.lifecycle_state() == LifecycleState::Idle {
                    self.handle.set_lifecycle_state(LifecycleState::Running);
                    info!("serving TLS for {} after degraded start", self.policy.domain);
                } else {
                    info!("hot-swapped secure context for {}", self.policy.domain);
                }
            }
            Err(err) => error!("failed to install renewed secure context: {err:?}"),
        }
    }
}

#[cfg(test)]
mod tests;
