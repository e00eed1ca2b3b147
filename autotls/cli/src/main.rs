use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autotls::{
    spawn_plain_listener, AcmeIssuer, CredentialStore, Environment, Http01Responder,
    RenewalEngine, RenewalOutcome, RenewalPolicy, RouteTable, ServerBinding, ServerConfig,
};
use clap::Parser;
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use toml_edit::ser::to_document;
use tracing::{error, info};

#[derive(Parser)]
enum Command {
    /// Serve with automatic certificate provisioning and renewal
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "autotls.toml")]
        config: PathBuf,
    },
    /// Run the renewal check without serving, answering challenges on the
    /// plain listener
    Renew {
        /// Path to the configuration file
        #[arg(short, long, default_value = "autotls.toml")]
        config: PathBuf,
        /// Run only once and exit
        #[arg(long)]
        once: bool,
    },
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Address to listen on
    listen_addr: String,
    /// Port for the main listener
    port: u16,
    /// Port for the plain listener answering http-01 challenges
    challenge_port: u16,
    /// Domain to issue certificates for; empty disables automation
    domain: String,
    /// Contact email for the authority account; empty means support@{domain}
    email: String,
    /// Use the staging authority directory
    staging: bool,
    /// Directory holding the credential artifacts
    storage_dir: PathBuf,
    /// Renewal check interval in seconds
    check_interval: u64,
    /// Number of days before expiration to trigger renewal
    renew_days_before: u64,
    /// Issuance timeout in seconds
    renew_timeout: u64,
    /// Send permissive CORS headers
    use_cors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            port: 443,
            challenge_port: 80,
            domain: "example.com".into(),
            email: "".into(),
            staging: true,
            storage_dir: ".".into(),
            check_interval: 3600,
            renew_days_before: 30,
            renew_timeout: 120,
            use_cors: true,
        }
    }
}

impl Config {
    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = to_document(self)?;

        for (i, (mut key, _value)) in doc.iter_mut().enumerate() {
            let decor = key.leaf_decor_mut();
            let docstring = Self::FIELD_DOCS[i].unwrap_or("");

            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            decor.set_prefix(comment);
        }
        Ok(doc.to_string())
    }

    fn listen_addr(&self) -> Result<IpAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.listen_addr))
    }

    fn environment(&self) -> Environment {
        if self.staging {
            Environment::Staging
        } else {
            Environment::Production
        }
    }

    fn email(&self) -> String {
        if self.email.is_empty() {
            format!("support@{}", self.domain)
        } else {
            self.email.clone()
        }
    }

    fn server_config(&self) -> Result<ServerConfig> {
        let domain = (!self.domain.is_empty()).then(|| self.domain.clone());
        let email = domain.as_ref().map(|_| self.email());
        Ok(ServerConfig::builder()
            .port(self.port)
            .listen_addr(self.listen_addr()?)
            .challenge_port(self.challenge_port)
            .maybe_domain(domain)
            .maybe_email(email)
            .staging(self.staging)
            .storage_dir(self.storage_dir.clone())
            .check_interval(Duration::from_secs(self.check_interval))
            .renewal_threshold(Duration::from_secs(self.renew_days_before * 24 * 3600))
            .issuance_timeout(Duration::from_secs(self.renew_timeout))
            .use_cors(self.use_cors)
            .build())
    }

    fn renewal_policy(&self) -> Result<RenewalPolicy> {
        if self.domain.is_empty() {
            bail!("domain is required for certificate renewal");
        }
        Ok(RenewalPolicy::builder()
            .domain(self.domain.clone())
            .email(self.email())
            .environment(self.environment())
            .renewal_threshold(Duration::from_secs(self.renew_days_before * 24 * 3600))
            .check_interval(Duration::from_secs(self.check_interval))
            .issuance_timeout(Duration::from_secs(self.renew_timeout))
            .build())
    }
}

fn load_config(config: &PathBuf) -> Result<Config> {
    let content = fs::read_to_string(config)?;
    toml_edit::de::from_str(&content).context("failed to parse configuration")
}

async fn serve(config: &PathBuf) -> Result<()> {
    let config = load_config(config).context("failed to load configuration")?;
    let routes = RouteTable::new();
    let handle = ServerBinding::start(config.server_config()?, routes)
        .await
        .context("failed to start server")?;
    info!("serving on {}", handle.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    handle.shutdown();
    Ok(())
}

async fn renew(config: &PathBuf, once: bool) -> Result<()> {
    let config = load_config(config).context("failed to load configuration")?;
    let policy = config.renewal_policy()?;

    let routes = RouteTable::new();
    let responder = Http01Responder::new_routes(routes.clone());
    let (challenge_addr, challenge_task) = spawn_plain_listener(
        (config.listen_addr()?, config.challenge_port),
        routes,
        config.use_cors,
    )
    .await
    .context("failed to bind challenge listener")?;
    info!("answering challenges on {challenge_addr}");

    let store = CredentialStore::new(&config.storage_dir);
    let issuer = AcmeIssuer::new(policy.environment, responder);
    let engine = RenewalEngine::new(store, issuer);

    if once {
        match engine.maybe_renew(&policy).await? {
            RenewalOutcome::Renewed => info!("renewed certificate for {}", policy.domain),
            RenewalOutcome::Skipped => info!("certificate for {} is up to date", policy.domain),
        }
        challenge_task.abort();
        return Ok(());
    }

    loop {
        match engine.maybe_renew(&policy).await {
            Ok(RenewalOutcome::Renewed) => info!("renewed certificate for {}", policy.domain),
            Ok(RenewalOutcome::Skipped) => {}
            Err(err) => error!("renewal failed: {err:?}"),
        }
        tokio::time::sleep(policy.check_interval).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    match args.command {
        Command::Serve { config } => {
            serve(&config).await?;
        }
        Command::Renew { config, once } => {
            renew(&config, once).await?;
        }
        Command::Cfg { write_to } => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{}", toml_str),
            }
        }
    }
    Ok(())
}
