use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use time::OffsetDateTime;

use crate::acme_client::IssuanceError;
use crate::renewal::Issuer;
use crate::store::{CredentialBundle, Environment};

/// A freshly signed bundle whose certificate expires `valid_for_days` from
/// now. Negative values produce an already-expired certificate.
pub(crate) fn issued_bundle(
    domain: &str,
    environment: Environment,
    valid_for_days: i64,
) -> CredentialBundle {
    let mut params =
        CertificateParams::new(vec![domain.to_string()]).expect("certificate params");
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + time::Duration::days(valid_for_days);
    let key = KeyPair::generate().expect("key pair");
    let cert = params.self_signed(&key).expect("self signed certificate");
    CredentialBundle {
        domain: domain.to_string(),
        environment,
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
        chain_pem: String::new(),
    }
}

/// Issuer double with observable call behavior.
pub(crate) struct StubIssuer {
    pub environment: Environment,
    /// Validity of the certificates it signs.
    pub valid_for_days: i64,
    /// Fail this many calls before starting to succeed.
    pub fail_first: usize,
    /// Time each call takes.
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl StubIssuer {
    pub fn new(environment: Environment, valid_for_days: i64) -> Self {
        Self {
            environment,
            valid_for_days,
            fail_first: 0,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Issuer for StubIssuer {
    fn request_certificate(
        &self,
        domain: &str,
        _email: &str,
    ) -> impl std::future::Future<Output = Result<CredentialBundle, IssuanceError>> + Send {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let domain = domain.to_string();
        let environment = self.environment;
        let valid_for_days = self.valid_for_days;
        let fail = call < self.fail_first;
        let delay = self.delay;
        let in_flight = self.in_flight.clone();
        let max_in_flight = self.max_in_flight.clone();
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            if fail {
                return Err(IssuanceError::Order("stub failure".into()));
            }
            Ok(issued_bundle(&domain, environment, valid_for_days))
        }
    }
}
