use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::acme_client::IssuanceError;
use crate::store::{CredentialBundle, CredentialStore, Environment};

/// Capability to obtain signed credentials for a domain. Injected into the
/// renewal engine so the workflow can be exercised without a live authority.
pub trait Issuer: Send + Sync {
    fn request_certificate(
        &self,
        domain: &str,
        email: &str,
    ) -> impl Future<Output = Result<CredentialBundle, IssuanceError>> + Send;
}

/// When and how to renew one domain's certificate.
///
/// `renewal_threshold` must exceed the worst-case latency of one issuance
/// attempt, and `check_interval` should be much smaller than the threshold
/// so an expiring certificate is noticed promptly.
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
pub struct RenewalPolicy {
    pub domain: String,
    pub email: String,
    #[builder(default)]
    pub environment: Environment,
    /// Remaining validity below which the certificate is due for renewal.
    #[builder(default = Duration::from_secs(30 * 24 * 3600))]
    pub renewal_threshold: Duration,
    /// How often the background check runs.
    #[builder(default = Duration::from_secs(3600))]
    pub check_interval: Duration,
    /// Upper bound on one issuance attempt, so a stuck authority round-trip
    /// cannot wedge the renewal task.
    #[builder(default = Duration::from_secs(120))]
    pub issuance_timeout: Duration,
}

impl RenewalPolicy {
    /// Policy for `domain` with the conventional `support@{domain}` contact.
    pub fn for_domain(domain: &str) -> Self {
        Self::builder()
            .domain(domain)
            .email(format!("support@{domain}"))
            .build()
    }
}

/// What a renewal check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The stored certificate is still comfortably valid; nothing was
    /// touched.
    Skipped,
    /// New credentials were obtained and persisted. The caller should swap
    /// the live secure context.
    Renewed,
}

/// Orchestrates one renewal check: freshness probe, issuance, persistence.
pub struct RenewalEngine<I> {
    store: CredentialStore,
    issuer: I,
}

impl<I: Issuer> RenewalEngine<I> {
    pub fn new(store: CredentialStore, issuer: I) -> Self {
        Self { store, issuer }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Renew the certificate if it is missing, unreadable, or expiring
    /// within the policy threshold. The steady-state `Skipped` path performs
    /// no network activity and no writes.
    pub async fn maybe_renew(&self, policy: &RenewalPolicy) -> Result<RenewalOutcome> {
        if self.store.is_valid_within_threshold(
            &policy.domain,
            policy.environment,
            policy.renewal_threshold,
        ) {
            info!("certificate for {} is up to date", policy.domain);
            return Ok(RenewalOutcome::Skipped);
        }

        let bundle = tokio::time::timeout(
            policy.issuance_timeout,
            self.issuer.request_certificate(&policy.domain, &policy.email),
        )
        .await
        .unwrap_or(Err(IssuanceError::Timeout))
        .context("certificate issuance failed")?;

        self.store
            .write(&bundle)
            .context("failed to persist renewed credentials")?;
        info!("stored renewed credentials for {}", policy.domain);
        Ok(RenewalOutcome::Renewed)
    }
}
