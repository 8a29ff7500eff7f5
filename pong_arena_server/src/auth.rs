use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::CoreError;
use crate::state::AppState;
use crate::store::Store;
use crate::util::now_secs;

type HmacSha256 = Hmac<Sha256>;

/// The verified identity attached to a request or socket.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// Verifies access tokens and that the named session is still live. The only
/// trust boundary the core assumes from outside; shared by the REST
/// middleware and all three socket endpoints.
pub struct SessionGate {
    secret: Vec<u8>,
    access_ttl_secs: u64,
    store: Arc<Store>,
}

impl SessionGate {
    pub fn new(secret: &str, access_ttl_secs: u64, store: Arc<Store>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl_secs,
            store,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_sig(&self, payload: &str, sig: &str) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        // Constant-time comparison via hmac crate
        mac.verify_slice(&hex::decode(sig).unwrap_or_default())
            .is_ok()
    }

    /// Mint an access token for a fresh session. The login/2FA flow lives
    /// outside the core; this is its entry point (and the tests').
    pub async fn issue(&self, user_id: Uuid) -> String {
        let session = self.store.sessions.create(user_id, self.access_ttl_secs).await;
        let expires_at = now_secs() + self.access_ttl_secs;
        let payload = format!("{user_id}.{}.{expires_at}", session.id);
        let sig = self.sign(&payload);
        format!("{payload}.{sig}")
    }

    pub async fn revoke(&self, session_id: Uuid) -> bool {
        self.store.sessions.revoke(session_id).await
    }

    /// Verify signature and expiry, then require the named session to be
    /// live (not revoked, not expired).
    pub async fn verify(&self, token: &str) -> Result<AuthContext, CoreError> {
        let unauthorized = || CoreError::Unauthorized("invalid access token".into());

        let mut parts = token.split('.');
        let (user_id, session_id, expires_at, sig) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(u), Some(s), Some(e), Some(sig), None) => (u, s, e, sig),
            _ => return Err(unauthorized()),
        };

        let payload = format!("{user_id}.{session_id}.{expires_at}");
        if !self.verify_sig(&payload, sig) {
            return Err(unauthorized());
        }

        let expires_at: u64 = expires_at.parse().map_err(|_| unauthorized())?;
        if expires_at <= now_secs() {
            return Err(CoreError::Unauthorized("token expired".into()));
        }

        let user_id: Uuid = user_id.parse().map_err(|_| unauthorized())?;
        let session_id: Uuid = session_id.parse().map_err(|_| unauthorized())?;

        if !self.store.sessions.is_live(session_id, user_id).await {
            return Err(CoreError::Unauthorized("session revoked or expired".into()));
        }

        Ok(AuthContext {
            user_id,
            session_id,
        })
    }
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn strip_bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
}

/// Axum middleware guarding the REST API. Attaches an [`AuthContext`] to the
/// request extensions on success.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(strip_bearer)
        .map(str::to_string);

    let token = match token {
        Some(t) => t,
        None => {
            return CoreError::Unauthorized("missing bearer token".into()).into_response();
        }
    };

    match state.gate.verify(&token).await {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}
