use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use x509_parser::prelude::Pem;

/// Which ACME directory the credentials belong to. Staging must be used for
/// non-production testing to stay clear of production rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Staging => write!(f, "staging"),
        }
    }
}

/// The three PEM artifacts for one (domain, environment) pair.
///
/// A bundle is never mutated after it is written; the next successful renewal
/// supersedes it wholesale.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub domain: String,
    pub environment: Environment,
    /// Leaf certificate.
    pub certificate_pem: String,
    /// Private key matching the leaf.
    pub private_key_pem: String,
    /// Issuer chain as returned by the authority. May be empty when the
    /// authority signs with a root directly.
    pub chain_pem: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored credentials for {domain} ({environment})")]
    NotFound {
        domain: String,
        environment: Environment,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk credential storage.
///
/// Artifacts live flat in one directory under deterministic names:
/// `{domain}_{environment}_{cert|privkey|chain}.pem`. The store is
/// single-writer (the renewal engine) with any number of readers.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self, domain: &str, environment: Environment) -> PathBuf {
        self.artifact_path(domain, environment, "cert")
    }

    pub fn key_path(&self, domain: &str, environment: Environment) -> PathBuf {
        self.artifact_path(domain, environment, "privkey")
    }

    pub fn chain_path(&self, domain: &str, environment: Environment) -> PathBuf {
        self.artifact_path(domain, environment, "chain")
    }

    fn artifact_path(&self, domain: &str, environment: Environment, kind: &str) -> PathBuf {
        self.dir.join(format!("{domain}_{environment}_{kind}.pem"))
    }

    /// True iff all three artifacts are present.
    pub fn exists(&self, domain: &str, environment: Environment) -> bool {
        self.cert_path(domain, environment).exists()
            && self.key_path(domain, environment).exists()
            && self.chain_path(domain, environment).exists()
    }

    /// Whether the stored certificate remains valid for at least `threshold`
    /// from now. Missing or unparseable artifacts count as not valid, so the
    /// caller falls through to issuance instead of aborting.
    pub fn is_valid_within_threshold(
        &self,
        domain: &str,
        environment: Environment,
        threshold: Duration,
    ) -> bool {
        if !self.exists(domain, environment) {
            debug!("no stored credentials for {domain} ({environment})");
            return false;
        }
        let cert_pem = match fs::read_to_string(self.cert_path(domain, environment)) {
            Ok(pem) => pem,
            Err(err) => {
                warn!("failed to read certificate for {domain}: {err}");
                return false;
            }
        };
        let not_after = match read_not_after(&cert_pem) {
            Ok(not_after) => not_after,
            Err(err) => {
                warn!("failed to parse certificate for {domain}: {err:#}");
                return false;
            }
        };
        let now = OffsetDateTime::now_utc();
        debug!("certificate for {domain} expires in {}", not_after - now);
        now + threshold < not_after
    }

    /// Persist a bundle. Each artifact goes through a temp file and rename,
    /// and the certificate is written last, so an interrupted write never
    /// leaves a certificate newer than its key and chain.
    pub fn write(&self, bundle: &CredentialBundle) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let domain = &bundle.domain;
        let environment = bundle.environment;
        write_replace(&self.chain_path(domain, environment), &bundle.chain_pem)?;
        write_replace(&self.key_path(domain, environment), &bundle.private_key_pem)?;
        write_replace(&self.cert_path(domain, environment), &bundle.certificate_pem)?;
        debug!("stored credentials for {domain} ({environment}) in {}", self.dir.display());
        Ok(())
    }

    /// Load the stored bundle, failing with `NotFound` when any artifact is
    /// missing.
    pub fn read(
        &self,
        domain: &str,
        environment: Environment,
    ) -> Result<CredentialBundle, StoreError> {
        if !self.exists(domain, environment) {
            return Err(StoreError::NotFound {
                domain: domain.to_string(),
                environment,
            });
        }
        Ok(CredentialBundle {
            domain: domain.to_string(),
            environment,
            certificate_pem: fs::read_to_string(self.cert_path(domain, environment))?,
            private_key_pem: fs::read_to_string(self.key_path(domain, environment))?,
            chain_pem: fs::read_to_string(self.chain_path(domain, environment))?,
        })
    }
}

fn write_replace(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("pem.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse the expiry timestamp out of the first certificate in `cert_pem`.
pub(crate) fn read_not_after(cert_pem: &str) -> Result<OffsetDateTime> {
    let pem = Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("invalid pem")?
        .context("no certificate in pem")?;
    let cert = pem.parse_x509().context("invalid x509 certificate")?;
    Ok(cert.validity().not_after.to_datetime())
}
