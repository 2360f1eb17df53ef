//! Request signing seam.
//!
//! The identity subsystem (DID keys, JWS) lives outside this crate; the client
//! only needs something that turns a request payload into a bearer token.

use crate::error::{GatewayError, GatewayResult};

/// Produces the authorization token for one request payload.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> GatewayResult<String>;
}

/// Pre-shared token, identical for every request.
#[derive(Clone)]
pub struct StaticTokenSigner {
    token: String,
}

impl StaticTokenSigner {
    pub fn new(token: impl Into<String>) -> GatewayResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(GatewayError::signing("empty gateway token"));
        }
        Ok(Self { token })
    }
}

impl std::fmt::Debug for StaticTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenSigner").finish_non_exhaustive()
    }
}

impl RequestSigner for StaticTokenSigner {
    fn sign(&self, _payload: &[u8]) -> GatewayResult<String> {
        Ok(self.token.clone())
    }
}
