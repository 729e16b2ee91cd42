// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP/WebSocket listener assembly: the `/ws` operator bridge plus one
//! `/slack/events` webhook per HTTP-mode Slack account, bound with TLS
//! (default) or plaintext (`insecure_dev_mode`, local development only).

pub mod auth;
pub mod slack;
pub mod tls;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::config::HttpConfig;
use crate::control::service::AgentHandle;
use crate::crypto::token::StoredToken;
use auth::{require_bearer_token, BearerAuthState};
use slack::{slack_events_handler, SlackWebhookState};

/// Assemble the router and bind it, blocking until shutdown.
///
/// `/ws` requires a valid bearer token (checked via middleware before the
/// WebSocket upgrade). `/slack/events` is intentionally left outside the
/// bearer-auth layer — Slack authenticates each request itself via its own
/// HMAC signature (`slack::verify_slack_signature`).
pub async fn serve(config: &HttpConfig, agent: AgentHandle, token_hash: StoredToken, slack_states: Vec<SlackWebhookState>) -> anyhow::Result<()> {
    let auth_state = BearerAuthState { token_hash };

    let mut router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(agent.clone())
        .route_layer(axum::middleware::from_fn_with_state(auth_state, require_bearer_token));

    for state in slack_states {
        router = router.route("/slack/events", post(slack_events_handler)).with_state(state);
    }

    let router = router.layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    let addr: std::net::SocketAddr = config.bind.parse().map_err(|e| anyhow::anyhow!("invalid http.bind address '{}': {e}", config.bind))?;

    if config.insecure_dev_mode {
        info!(%addr, "HTTP gateway listening (insecure_dev_mode: TLS disabled)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router.into_make_service()).await?;
    } else {
        let cert_dir = config.tls_cert_dir.clone().unwrap_or_else(tls::default_cert_dir);
        let runtime = tls::load_or_generate(&cert_dir)?;
        info!(%addr, fingerprint = %runtime.fingerprint_sha256, "HTTPS gateway listening");
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&runtime.cert_path, &runtime.key_path).await?;
        axum_server::bind_rustls(addr, tls_config).serve(router.into_make_service()).await?;
    }

    Ok(())
}
