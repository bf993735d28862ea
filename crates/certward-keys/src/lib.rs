//! Key algorithms and key custody
//!
//! Signing keys live in a custody service (an HSM-backed vault in
//! production). This crate defines the algorithm model shared with the
//! issuance engine, the [`KeyCustody`] boundary, and [`LocalKeyCustody`], a
//! software implementation for development CAs and tests.

pub mod algorithm;
pub mod custody;
pub mod error;
pub mod local;

pub use algorithm::{EllipticCurve, KeySpec, KeyType, PublicKey, SignatureAlgorithm};
pub use custody::{
    validate_key_name, CertificatePolicy, KeyCustody, KeyHandle, KeyReference, MergedCertificate,
    PendingCertificate,
};
pub use error::KeyCustodyError;
pub use local::LocalKeyCustody;

// Re-export for implementors of the custody trait
pub use async_trait::async_trait;
