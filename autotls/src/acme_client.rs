use std::time::Duration;

use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::challenge::{Http01Api, Http01Responder};
use crate::renewal::Issuer;
use crate::store::{CredentialBundle, Environment};

/// Why an issuance attempt failed. There is no retry inside the client; the
/// next scheduled check retries from scratch.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("failed to register account with the authority: {0}")]
    Account(String),
    #[error("failed to create or drive order: {0}")]
    Order(String),
    #[error("authorization for {domain} offers no http-01 challenge")]
    ChallengeUnsupported { domain: String },
    #[error("challenge validation failed: {0}")]
    Validation(String),
    #[error("failed to generate signing request: {0}")]
    Csr(String),
    #[error("failed to finalize order: {0}")]
    Finalize(String),
    #[error("issuance attempt timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
struct PendingChallenge {
    token: String,
    url: String,
}

/// ACME issuance client answering domain-ownership proofs over `http-01`.
///
/// Each call to [`request_certificate`](Self::request_certificate) registers
/// a fresh account with the authority; account continuity is not required
/// for domain-validated issuance.
pub struct AcmeIssuer {
    environment: Environment,
    responder: Http01Responder,
}

impl AcmeIssuer {
    pub fn new(environment: Environment, responder: Http01Responder) -> Self {
        Self {
            environment,
            responder,
        }
    }

    pub fn directory_url(&self) -> &'static str {
        match self.environment {
            Environment::Production => LetsEncrypt::Production.url(),
            Environment::Staging => LetsEncrypt::Staging.url(),
        }
    }

    /// Run one full order through the authority and return the signed
    /// credentials. Challenge responders are removed on every exit path;
    /// since removal cannot fail it never masks the original error.
    pub async fn request_certificate(
        &self,
        domain: &str,
        email: &str,
    ) -> Result<CredentialBundle, IssuanceError> {
        info!("requesting new certificate for {domain}");
        let mut pending = Vec::new();
        let result = self
            .request_certificate_inner(domain, email, &mut pending)
            .await;
        for challenge in &pending {
            debug!("removing http-01 responder for token {}", challenge.token);
            self.responder.unregister(&challenge.token);
        }
        result
    }

    async fn request_certificate_inner(
        &self,
        domain: &str,
        email: &str,
        pending: &mut Vec<PendingChallenge>,
    ) -> Result<CredentialBundle, IssuanceError> {
        let contact = format!("mailto:{email}");
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.directory_url(),
            None,
        )
        .await
        .map_err(|err| IssuanceError::Account(err.to_string()))?;

        let key = KeyPair::generate().map_err(|err| IssuanceError::Csr(err.to_string()))?;

        debug!("creating new order for {domain}");
        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|err| IssuanceError::Order(err.to_string()))?;

        let mut challenges_ready = false;
        loop {
            order
                .refresh()
                .await
                .map_err(|err| IssuanceError::Order(err.to_string()))?;
            match order.state().status {
                // Need to answer the challenges
                OrderStatus::Pending => {
                    if challenges_ready {
                        debug!("challenges are ready, waiting for order to be ready");
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    debug!("order is pending, answering authorizations");
                    self.authorize(&mut order, pending).await?;
                    if pending.is_empty() {
                        return Err(IssuanceError::Validation("no challenges found".into()));
                    }
                    self.confirm_responders(pending)?;
                    for challenge in &*pending {
                        debug!("setting challenge ready for {}", challenge.url);
                        order
                            .set_challenge_ready(&challenge.url)
                            .await
                            .map_err(|err| IssuanceError::Validation(err.to_string()))?;
                    }
                    challenges_ready = true;
                    continue;
                }
                // To upload the CSR
                OrderStatus::Ready => {
                    debug!("order is ready, uploading CSR");
                    let csr = make_csr(&key, domain)?;
                    order
                        .finalize(csr.as_ref())
                        .await
                        .map_err(|err| IssuanceError::Finalize(err.to_string()))?;
                    continue;
                }
                // Need to wait for the CSR to be accepted
                OrderStatus::Processing => {
                    debug!("order is processing, waiting for the CSR to be accepted");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                // Certificate is ready
                OrderStatus::Valid => {
                    debug!("order is valid, downloading certificate");
                    let full_chain = download_certificate(order).await?;
                    let (certificate_pem, chain_pem) = split_chain(&full_chain)?;
                    return Ok(CredentialBundle {
                        domain: domain.to_string(),
                        environment: self.environment,
                        certificate_pem,
                        private_key_pem: key.serialize_pem(),
                        chain_pem,
                    });
                }
                // Something went wrong
                OrderStatus::Invalid => {
                    return Err(IssuanceError::Validation("order is invalid".into()))
                }
            }
        }
    }

    /// Register a responder for every pending authorization. Challenge types
    /// other than `http-01` are skipped; an authorization offering nothing
    /// else cannot be answered at all and fails the attempt up front.
    async fn authorize(
        &self,
        order: &mut Order,
        pending: &mut Vec<PendingChallenge>,
    ) -> Result<(), IssuanceError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|err| IssuanceError::Order(err.to_string()))?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                _ => {
                    return Err(IssuanceError::Validation(format!(
                        "unsupported authorization status: {:?}",
                        authz.status
                    )))
                }
            }

            let Identifier::Dns(identifier) = &authz.identifier;

            let Some(challenge) = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
            else {
                return Err(IssuanceError::ChallengeUnsupported {
                    domain: identifier.clone(),
                });
            };

            let key_authorization = order.key_authorization(challenge);
            debug!("installing http-01 responder for {identifier}");
            self.responder
                .register(&challenge.token, key_authorization.as_str());
            pending.push(PendingChallenge {
                token: challenge.token.clone(),
                url: challenge.url.clone(),
            });
        }
        Ok(())
    }

    /// Self check that every responder is reachable before telling the
    /// authority to probe. The responders are in-process, so a plain lookup
    /// suffices.
    fn confirm_responders(&self, pending: &[PendingChallenge]) -> Result<(), IssuanceError> {
        for challenge in pending {
            if self.responder.lookup(&challenge.token).is_none() {
                return Err(IssuanceError::Validation(format!(
                    "responder for token {} was not installed",
                    challenge.token
                )));
            }
        }
        Ok(())
    }
}

impl Issuer for AcmeIssuer {
    fn request_certificate(
        &self,
        domain: &str,
        email: &str,
    ) -> impl std::future::Future<Output = Result<CredentialBundle, IssuanceError>> + Send {
        self.request_certificate(domain, email)
    }
}

fn make_csr(key: &KeyPair, domain: &str) -> Result<Vec<u8>, IssuanceError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|err| IssuanceError::Csr(err.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;
    let csr = params
        .serialize_request(key)
        .map_err(|err| IssuanceError::Csr(err.to_string()))?;
    Ok(csr.der().as_ref().to_vec())
}

async fn download_certificate(mut order: Order) -> Result<String, IssuanceError> {
    let mut tries = 0;
    loop {
        tries += 1;
        if tries > 5 {
            return Err(IssuanceError::Finalize(
                "certificate was not made available".into(),
            ));
        }
        match order
            .certificate()
            .await
            .map_err(|err| IssuanceError::Finalize(err.to_string()))?
        {
            Some(cert_chain_pem) => return Ok(cert_chain_pem),
            None => sleep(Duration::from_secs(1)).await,
        }
    }
}

/// Split the authority's PEM response into the leaf certificate and the
/// issuer chain that follows it.
fn split_chain(full_chain_pem: &str) -> Result<(String, String), IssuanceError> {
    const END_MARKER: &str = "-----END CERTIFICATE-----";
    let Some(end) = full_chain_pem.find(END_MARKER) else {
        return Err(IssuanceError::Finalize(
            "no certificate in authority response".into(),
        ));
    };
    let split = end + END_MARKER.len();
    let leaf = format!("{}\n", full_chain_pem[..split].trim_start());
    let chain = full_chain_pem[split..].trim_start().to_string();
    Ok((leaf, chain))
}

#[cfg(test)]
mod tests;
