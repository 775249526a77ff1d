//! Connection gatekeeper: bearer-credential verification.
//!
//! Every connection must present a credential in its `Join` handshake frame
//! before any room-scoped event is processed. Verification binds an
//! [`Identity`] to the connection for its entire lifetime; that identity, not
//! any client-supplied value, is the sole source of presence and chat
//! attribution.
//!
//! Credential issuance (login/registration) is an external concern. The
//! in-process [`TokenRegistry`] holds tokens that were issued elsewhere and
//! handed to this server; it validates membership in O(1).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Token size in bytes (256-bit).
const TOKEN_SIZE: usize = 32;

/// A verified user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username: username.into(),
        }
    }
}

/// Authentication failures. Both are fatal at handshake time: the connection
/// is terminated with no retry and no partial admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredential,
    InvalidCredential,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "Authentication error: no credential provided"),
            Self::InvalidCredential => write!(f, "Authentication error: invalid credential"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Credential verification seam.
///
/// The server consumes this as a black box; swap in whatever verifier the
/// deployment uses (shared-secret tokens, a session-store lookup, ...).
pub trait Authenticator: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Registry of issued bearer tokens.
///
/// Tokens are 256-bit random values in hex. Lookup is a plain map read;
/// the token is server-generated random data, not a user-chosen password,
/// so constant-time comparison is not required here.
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a fresh token bound to `identity` and return it.
    pub fn issue(&self, identity: Identity) -> String {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.tokens
            .write()
            .expect("token registry lock poisoned")
            .insert(token.clone(), identity);
        token
    }

    /// Revoke a token. Returns the identity it was bound to, if any.
    pub fn revoke(&self, token: &str) -> Option<Identity> {
        self.tokens
            .write()
            .expect("token registry lock poisoned")
            .remove(token)
    }

    /// Number of live tokens.
    pub fn token_count(&self) -> usize {
        self.tokens
            .read()
            .expect("token registry lock poisoned")
            .len()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for TokenRegistry {
    fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .read()
            .expect("token registry lock poisoned")
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}
