// common/src/error.rs
use thiserror::Error;

/// Failures while reconstructing or applying key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad key material: {0}")]
    BadKeyMaterial(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("malformed ciphertext")]
    MalformedCiphertext,
}

/// Failures while constructing a broker from its options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("project id is not a valid UUID: {0}")]
    InvalidProjectId(String),
    #[error("secret code is not base64 for a {expected}-byte key")]
    InvalidSecretCode { expected: usize },
    #[error(transparent)]
    File(#[from] config::ConfigError),
}

/// Protocol-level failures. Every variant is terminal for the session(s)
/// involved; the `Display` text is what goes out in the `ERROR` envelope.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed JSON, unknown command, missing fields.
    #[error("{0}")]
    BadInput(String),
    /// Command out of order, duplicate activation.
    #[error("{0}")]
    StateViolation(String),
    /// Alias disagreement between widget and authenticator.
    #[error("user alias do not match")]
    PeerMismatch,
    /// The record registry returned an empty record for the alias.
    #[error("user not found")]
    UserNotFound,
    /// The challenge reply failed decryption or signature checks.
    #[error("access denied")]
    AccessDenied,
    /// Record registry call or an application callback failed.
    #[error("{0}")]
    Upstream(String),
    /// Connection dropped or the ping went unanswered.
    #[error("connection failed")]
    Transport,
}

impl BrokerError {
    /// Whether the failure terminates both sides of an established pair.
    pub fn affects_peer(&self) -> bool {
        matches!(self, BrokerError::PeerMismatch | BrokerError::AccessDenied)
    }
}
