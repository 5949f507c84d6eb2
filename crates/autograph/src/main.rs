use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use autograph::signing::AnySigner;
use autograph::{build_state, run, Config};

/// How often PKI signers are checked for pending certificate renewal.
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
struct Args {
    /// Path to the service configuration.
    #[clap(long, env = "AUTOGRAPH_CONFIG", default_value = "autograph.json")]
    config: PathBuf,
    /// Override the configured listen address.
    #[clap(long, env = "AUTOGRAPH_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());

    let state = Arc::new(build_state(&config).await?);

    for signer in state.signers.values() {
        spawn_renewal_task(signer.clone());
    }

    tracing::info!(
        %listen,
        signers = state.signers.len(),
        principals = state.principals.len(),
        "autograph listening"
    );
    run(&listen, state).await
}

/// PKI end-entity certificates are re-issued ahead of expiry; the swap
/// is atomic and in-flight signs finish against the old state.
fn spawn_renewal_task(signer: Arc<AnySigner>) {
    let AnySigner::ContentSignaturePki(_) = signer.as_ref() else {
        return;
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let AnySigner::ContentSignaturePki(pki) = signer.as_ref() else {
                return;
            };
            if !pki.needs_renewal() {
                continue;
            }
            if let Err(e) = pki.rotate().await {
                tracing::error!(signer = %pki.id(), error = ?e, "certificate renewal failed");
            }
        }
    });
}
