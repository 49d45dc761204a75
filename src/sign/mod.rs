//! JAR v1 signing: identity generation, the `META-INF` text artifacts and
//! the PKCS#7 signature block.

pub mod identity;
pub mod manifest;
pub mod pkcs7;

pub use identity::SigningIdentity;
pub use manifest::{EntryDigests, SignatureManifest};

/// Result alias for signing operations.
pub type SignResult<T> = Result<T, SignError>;

/// Errors surfaced while producing the signing artifacts.
#[derive(Debug)]
pub enum SignError {
    KeyGeneration(String),
    Certificate(String),
    Signature(String),
    Der(der::Error),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::KeyGeneration(msg) => write!(f, "Key generation failed: {msg}"),
            SignError::Certificate(msg) => write!(f, "Certificate construction failed: {msg}"),
            SignError::Signature(msg) => write!(f, "Signing failed: {msg}"),
            SignError::Der(err) => write!(f, "DER encoding failed: {err}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<der::Error> for SignError {
    fn from(value: der::Error) -> Self {
        SignError::Der(value)
    }
}
