//! Authentication capability for the upgrade endpoint.
//!
//! The browser WebSocket API cannot attach arbitrary headers to the
//! handshake, so clients smuggle their bearer token through the
//! `Sec-WebSocket-Protocol` header; the production authenticator lifts it
//! into a standard `Authorization` header before validating.

use std::collections::HashMap;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub const SUBPROTOCOL_HEADER: &str = "sec-websocket-protocol";

/// The parts of an upgrade request the authenticator may inspect or
/// rewrite.
pub struct UpgradeRequest {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

pub trait Authenticator: Send + Sync {
    /// Validate the upgrade request, rewriting headers as needed.
    fn authenticate(&self, req: &mut UpgradeRequest) -> bool;

    /// Derive the user identity for the request.
    fn identity(&self, req: &UpgradeRequest) -> String;
}

/// Accept-everything authenticator for development and tests.
///
/// Identity comes from the `userId` query parameter. Without one, a
/// millisecond timestamp is used — unstable across reconnects, so
/// anonymous clients effectively lose the one-connection-per-identity
/// guarantee.
pub struct InsecureAuth;

impl Authenticator for InsecureAuth {
    fn authenticate(&self, _req: &mut UpgradeRequest) -> bool {
        true
    }

    fn identity(&self, req: &UpgradeRequest) -> String {
        match req.query.get("userId") {
            Some(uid) if !uid.is_empty() => uid.clone(),
            _ => anonymous_identity(),
        }
    }
}

fn anonymous_identity() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    uid: String,
    exp: usize,
}

/// HS256 bearer-token authenticator.
pub struct JwtAuth {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    fn claims(&self, req: &UpgradeRequest) -> Option<Claims> {
        let raw = req.headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .ok()
            .map(|data| data.claims)
    }
}

impl Authenticator for JwtAuth {
    fn authenticate(&self, req: &mut UpgradeRequest) -> bool {
        if let Some(token) = req.headers.get(SUBPROTOCOL_HEADER).cloned() {
            req.headers.insert(AUTHORIZATION, token);
        }
        match self.claims(req) {
            Some(_) => true,
            None => {
                tracing::warn!("upgrade token rejected");
                false
            }
        }
    }

    fn identity(&self, req: &UpgradeRequest) -> String {
        self.claims(req)
            .map(|claims| claims.uid)
            .unwrap_or_else(anonymous_identity)
    }
}
