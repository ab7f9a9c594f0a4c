//! Viewer credentials.

use base64::Engine;
use serde::Deserialize;

/// Optional bearer token. Anonymous viewers carry no token and can
/// still read public sessions and chat into local-only ones.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenClaims {
    sub: Option<String>,
}

impl Credentials {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            access_token: access_token.filter(|token| !token.is_empty()),
        }
    }

    pub fn anonymous() -> Self {
        Self { access_token: None }
    }

    pub fn bearer(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Best-effort viewer id from the token's `sub` claim. Unverified,
    /// used only for the owned-vs-foreign classification; the server
    /// enforces actual access.
    pub fn viewer_id(&self) -> Option<String> {
        let token = self.access_token.as_deref()?;
        let payload = token.split('.').nth(1)?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .ok()?;
        let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
        claims.sub
    }
}
