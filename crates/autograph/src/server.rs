use anyhow::{Context as _, Result};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::authorize::{Authorizations, Principal};
use crate::config::Config;
use crate::handlers;
use crate::nonce::NonceCache;
use crate::signing::{build_registry, AnySigner};

/// Everything the handlers need, built once at startup. The signer
/// registry, principal table and authorization matrix are read-only;
/// the nonce cache is the only mutable shared structure.
pub struct AppState {
    pub principals: HashMap<String, Principal>,
    pub authorizations: Authorizations,
    pub signers: HashMap<String, Arc<AnySigner>>,
    pub nonces: NonceCache,
    pub max_skew: Duration,
    pub trust_forwarded: bool,
    /// Port assumed when the Host header carries none.
    pub fallback_port: u16,
    pub monitoring_key: Option<String>,
    pub max_body_bytes: usize,
}

/// Validates the configuration and constructs the shared state,
/// including signer initialization and PKI chain materialization.
pub async fn build_state(config: &Config) -> Result<AppState> {
    config.validate()?;

    let signers = build_registry(&config.signers).await?;

    let principals: HashMap<String, Principal> = config
        .authorizations
        .iter()
        .map(|auth| {
            (
                auth.id.clone(),
                Principal {
                    id: auth.id.clone(),
                    key: auth.key.clone(),
                },
            )
        })
        .collect();
    let authorizations = Authorizations::new(
        config
            .authorizations
            .iter()
            .map(|auth| (auth.id.clone(), auth.signers.clone())),
    );

    let max_skew = Duration::from_secs(config.server.max_skew_secs);
    // Twice the skew so nothing that passed the timestamp check can be
    // replayed after its cache entry expires.
    let nonces = NonceCache::new(max_skew * 2, config.server.nonce_capacity);

    let fallback_port = config
        .server
        .listen
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .context("listen address has no port")?;

    Ok(AppState {
        principals,
        authorizations,
        signers,
        nonces,
        max_skew,
        trust_forwarded: config.server.trust_forwarded,
        fallback_port,
        monitoring_key: config.monitoring.as_ref().map(|m| m.key.clone()),
        max_body_bytes: config.server.max_body_bytes,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/sign/file", post(handlers::sign_file))
        .route("/sign/data", post(handlers::sign_data))
        .route("/sign/hash", post(handlers::sign_hash))
        .route("/__monitor__", get(handlers::monitor))
        .route("/__heartbeat__", get(handlers::heartbeat))
        .route("/__lbheartbeat__", get(handlers::lbheartbeat))
        .route("/__version__", get(handlers::version))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(listen: &str, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    axum::serve(listener, router(state))
        .await
        .context("server terminated")?;

    Ok(())
}
