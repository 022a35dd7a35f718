//! Request authentication for the HTTP ingress.
//!
//! Two mechanisms, tried in order: bearer tokens (cheap, for trusted
//! callers) and HTTP signatures (delegated to a [`SignatureVerifier`]
//! capability — the cryptography itself lives outside this crate).

use async_trait::async_trait;
use axum::http::request::Parts;

/// Metadata key under which the verified signing actor IRI is recorded.
pub const ACTOR_IRI_KEY: &str = "actor-iri";

/// Error surfaced by authentication collaborators.
#[derive(Debug, thiserror::Error)]
#[error("auth: {0}")]
pub struct AuthError(pub String);

/// Outcome of HTTP signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The signature verified; the signing actor's IRI.
    Verified { actor_iri: String },
    /// The request carried no valid signature.
    Unverified,
}

/// Verifies the HTTP signature on an inbound request.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_request(&self, parts: &Parts, body: &[u8]) -> Result<Verification, AuthError>;
}

/// Supplies the bearer tokens required for an endpoint/method pair. An
/// empty list means no token authorization is required.
pub trait AuthTokenManager: Send + Sync {
    fn required_auth_tokens(&self, endpoint: &str, method: &str) -> Result<Vec<String>, AuthError>;
}

/// Checks the `Authorization: Bearer` header against the tokens required
/// for one endpoint/method pair.
pub struct TokenVerifier {
    required: Vec<String>,
}

impl TokenVerifier {
    /// Resolve the required tokens for the endpoint at construction.
    pub fn new(
        manager: &dyn AuthTokenManager,
        endpoint: &str,
        method: &str,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            required: manager.required_auth_tokens(endpoint, method)?,
        })
    }

    /// True when no tokens are required or a presented bearer token
    /// matches.
    pub fn verify(&self, parts: &Parts) -> bool {
        if self.required.is_empty() {
            return true;
        }

        parts
            .headers
            .get_all(axum::http::header::AUTHORIZATION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.strip_prefix("Bearer "))
            .any(|token| self.required.iter().any(|required| required == token))
    }
}

/// Token manager backed by a static token list (from configuration).
pub struct StaticTokenManager {
    tokens: Vec<String>,
}

impl StaticTokenManager {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

impl AuthTokenManager for StaticTokenManager {
    fn required_auth_tokens(&self, _endpoint: &str, _method: &str) -> Result<Vec<String>, AuthError> {
        Ok(self.tokens.clone())
    }
}

/// Signature verifier that rejects every request.
///
/// Used when no signature verification capability is wired in, so that
/// only bearer-token callers are accepted.
pub struct RejectAllVerifier;

#[async_trait]
impl SignatureVerifier for RejectAllVerifier {
    async fn verify_request(&self, _parts: &Parts, _body: &[u8]) -> Result<Verification, AuthError> {
        Ok(Verification::Unverified)
    }
}
