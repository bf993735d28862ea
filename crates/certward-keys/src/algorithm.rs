//! Key and signature algorithm model

use rcgen::PublicKeyData;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// JOSE-style signature algorithm names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
}

impl SignatureAlgorithm {
    /// Development default for internal CAs that do not declare an algorithm
    pub const DEVELOPMENT_DEFAULT: SignatureAlgorithm = SignatureAlgorithm::RS384;

    pub fn key_type(self) -> KeyType {
        match self {
            SignatureAlgorithm::RS256 | SignatureAlgorithm::RS384 | SignatureAlgorithm::RS512 => {
                KeyType::Rsa
            }
            SignatureAlgorithm::ES256 | SignatureAlgorithm::ES384 => KeyType::Ec,
        }
    }

    /// Curve required by ECDSA algorithms
    pub fn curve(self) -> Option<EllipticCurve> {
        match self {
            SignatureAlgorithm::ES256 => Some(EllipticCurve::P256),
            SignatureAlgorithm::ES384 => Some(EllipticCurve::P384),
            _ => None,
        }
    }

    /// Whether a key of `spec` can produce signatures with this algorithm
    pub fn is_compatible_with(self, spec: &KeySpec) -> bool {
        match (self.curve(), spec) {
            (None, KeySpec::Rsa { .. }) => true,
            (Some(curve), KeySpec::Ec { curve: key_curve }) => curve == *key_curve,
            _ => false,
        }
    }

    /// The rcgen algorithm producing this signature
    pub fn rcgen(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            SignatureAlgorithm::RS256 => &rcgen::PKCS_RSA_SHA256,
            SignatureAlgorithm::RS384 => &rcgen::PKCS_RSA_SHA384,
            SignatureAlgorithm::RS512 => &rcgen::PKCS_RSA_SHA512,
            SignatureAlgorithm::ES256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            SignatureAlgorithm::ES384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignatureAlgorithm::RS256 => "RS256",
            SignatureAlgorithm::RS384 => "RS384",
            SignatureAlgorithm::RS512 => "RS512",
            SignatureAlgorithm::ES256 => "ES256",
            SignatureAlgorithm::ES384 => "ES384",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" => Ok(SignatureAlgorithm::RS256),
            "RS384" => Ok(SignatureAlgorithm::RS384),
            "RS512" => Ok(SignatureAlgorithm::RS512),
            "ES256" => Ok(SignatureAlgorithm::ES256),
            "ES384" => Ok(SignatureAlgorithm::ES384),
            other => Err(format!("unsupported signature algorithm: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "EC")]
    Ec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EllipticCurve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl fmt::Display for EllipticCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EllipticCurve::P256 => f.write_str("P-256"),
            EllipticCurve::P384 => f.write_str("P-384"),
        }
    }
}

/// Shape of an asymmetric key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum KeySpec {
    #[serde(rename = "RSA")]
    Rsa { size: u32 },
    #[serde(rename = "EC")]
    Ec { curve: EllipticCurve },
}

impl KeySpec {
    pub const RSA_SIZES: [u32; 3] = [2048, 3072, 4096];

    pub fn key_type(&self) -> KeyType {
        match self {
            KeySpec::Rsa { .. } => KeyType::Rsa,
            KeySpec::Ec { .. } => KeyType::Ec,
        }
    }

    /// RSA modulus size in bits
    pub fn size(&self) -> Option<u32> {
        match self {
            KeySpec::Rsa { size } => Some(*size),
            KeySpec::Ec { .. } => None,
        }
    }

    pub fn curve(&self) -> Option<EllipticCurve> {
        match self {
            KeySpec::Rsa { .. } => None,
            KeySpec::Ec { curve } => Some(*curve),
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            KeySpec::Rsa { size } => Self::RSA_SIZES.contains(size),
            KeySpec::Ec { .. } => true,
        }
    }

    /// Algorithm used when a key of this shape signs a request for itself
    pub fn natural_algorithm(&self) -> SignatureAlgorithm {
        match self {
            KeySpec::Rsa { .. } => SignatureAlgorithm::RS256,
            KeySpec::Ec {
                curve: EllipticCurve::P256,
            } => SignatureAlgorithm::ES256,
            KeySpec::Ec {
                curve: EllipticCurve::P384,
            } => SignatureAlgorithm::ES384,
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { size } => write!(f, "RSA-{}", size),
            KeySpec::Ec { curve } => write!(f, "EC-{}", curve),
        }
    }
}

/// A public key as carried in a certificate's subjectPublicKey bit string
///
/// `raw` is the PKCS#1 `RSAPublicKey` for RSA keys and the uncompressed point
/// for EC keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub spec: KeySpec,
    pub raw: Vec<u8>,
}

impl PublicKey {
    pub fn new(spec: KeySpec, raw: Vec<u8>) -> Self {
        Self { spec, raw }
    }
}

impl PublicKeyData for PublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.raw
    }

    // Only the key identifier in SubjectPublicKeyInfo depends on this, so any
    // algorithm of the right key family works.
    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.spec.natural_algorithm().rcgen()
    }
}
