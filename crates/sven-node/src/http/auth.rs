// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer token middleware for the gateway's HTTP/WebSocket listener.
//!
//! Runs before every request (except the upgrade handshake itself has
//! already completed by the time a WebSocket's first frame arrives, so this
//! must run as Axum middleware ahead of the route, not inside the handler).

use axum::{
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::crypto::token::StoredToken;

#[derive(Clone)]
pub struct BearerAuthState {
    pub token_hash: StoredToken,
}

pub async fn require_bearer_token<B>(State(state): State<BearerAuthState>, req: Request<B>, next: Next<B>) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if state.token_hash.verify(token) => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::token::RawToken;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app(token_hash: StoredToken) -> Router {
        Router::new().route("/ping", get(ok_handler)).route_layer(axum::middleware::from_fn_with_state(BearerAuthState { token_hash }, require_bearer_token))
    }

    #[tokio::test]
    async fn rejects_missing_authorization_header() {
        let raw = RawToken::generate();
        let app = app(raw.into_stored());
        let resp = app.oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_correct_bearer_token() {
        let raw = RawToken::generate();
        let token = raw.as_str().to_string();
        let app = app(raw.into_stored());
        let resp = app
            .oneshot(Request::builder().uri("/ping").header("authorization", format!("Bearer {token}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_wrong_bearer_token() {
        let raw = RawToken::generate();
        let app = app(raw.into_stored());
        let resp = app.oneshot(Request::builder().uri("/ping").header("authorization", "Bearer wrong").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
