use thiserror::Error;

/// Key custody errors
///
/// Vendor-specific failure shapes collapse into [`KeyCustodyError::Backend`];
/// only "not found" is kept distinct.
#[derive(Debug, Error)]
pub enum KeyCustodyError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("No pending certificate request: {0}")]
    RequestNotFound(String),

    #[error("Invalid key name: {0}")]
    InvalidName(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key custody backend error: {0}")]
    Backend(String),
}

impl KeyCustodyError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KeyCustodyError::KeyNotFound(_) | KeyCustodyError::RequestNotFound(_)
        )
    }
}

impl From<rcgen::Error> for KeyCustodyError {
    fn from(e: rcgen::Error) -> Self {
        KeyCustodyError::Crypto(e.to_string())
    }
}
