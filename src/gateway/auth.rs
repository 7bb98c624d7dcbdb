//! Bearer-key authentication.
//!
//! Maps configured API keys to principals. Authentication proper is
//! an external concern; the core only ever sees the resolved
//! [`Principal`]. With no keys configured the gateway boots open and
//! injects a single development principal (logged loudly at startup).

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::ApiError;

use super::AppState;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub project_ids: Vec<String>,
}

/// Resolved API-key table.
pub struct KeyTable {
    keys: HashMap<String, Principal>,
}

impl KeyTable {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let mut keys = HashMap::new();
        for entry in &cfg.api_keys {
            let key = crate::config::resolve_secret(Some(&entry.key));
            if key.is_empty() {
                warn!(user = %entry.user_id, "api key resolved empty, skipping entry");
                continue;
            }
            keys.insert(
                key,
                Principal {
                    user_id: entry.user_id.clone(),
                    organization_id: entry.organization_id.clone(),
                    project_ids: entry.project_ids.clone(),
                },
            );
        }
        if keys.is_empty() {
            warn!("no API keys configured, gateway is open (development principal)");
        }
        Self { keys }
    }

    /// Resolve a bearer token to a principal.
    pub fn resolve(&self, token: Option<&str>) -> Result<Principal, ApiError> {
        if self.keys.is_empty() {
            return Ok(Principal {
                user_id: "local-dev".to_string(),
                organization_id: None,
                project_ids: Vec::new(),
            });
        }
        match token {
            Some(t) => self
                .keys
                .get(t)
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("unknown API key".into())),
            None => Err(ApiError::Unauthorized(
                "missing Authorization header".into(),
            )),
        }
    }
}

pub(crate) async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: middleware::Next,
) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);

    match state.keys.resolve(token.as_deref()) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}
