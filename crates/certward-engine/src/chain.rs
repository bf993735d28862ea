//! PEM chain helpers and certificate thumbprints

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// Split a PEM chain into DER certificates, leaf first
pub fn split_chain(pem: &str) -> Result<Vec<Vec<u8>>, EngineError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Codec(format!("invalid PEM chain: {}", e)))?;

    if certs.is_empty() {
        return Err(EngineError::Codec(
            "PEM chain contains no certificates".to_string(),
        ));
    }
    Ok(certs)
}

/// Leaf certificate of a PEM chain
pub fn leaf_certificate(pem: &str) -> Result<Vec<u8>, EngineError> {
    split_chain(pem)?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Codec("PEM chain contains no certificates".to_string()))
}

pub fn encode_certificate(der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Append `issuer_chain` below `leaf_pem`
pub fn join_chain(leaf_pem: &str, issuer_chain: &str) -> String {
    let mut chain = leaf_pem.trim_end().to_string();
    chain.push('\n');
    let issuer_chain = issuer_chain.trim();
    if !issuer_chain.is_empty() {
        chain.push_str(issuer_chain);
        chain.push('\n');
    }
    chain
}

/// Lowercase hex of raw bytes, same form as the digest thumbprints
pub fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        out.push_str(&format!("{:02x}", b));
        out
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbprints {
    pub sha1: String,
    pub sha256: String,
}

/// SHA-1 and SHA-256 over the DER encoding, lowercase hex
pub fn thumbprints(der: &[u8]) -> Thumbprints {
    let mut sha1 = Sha1::new();
    sha1.update(der);
    let mut sha256 = Sha256::new();
    sha256.update(der);

    Thumbprints {
        sha1: format!("{:x}", sha1.finalize()),
        sha256: format!("{:x}", sha256.finalize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_lower_matches_digest_format() {
        assert_eq!(hex_lower(&[0x00, 0xab, 0x10]), "00ab10");

        let digest = Sha256::digest(b"certward");
        assert_eq!(hex_lower(&digest), format!("{:x}", digest));
    }

    #[test]
    fn test_encode_then_split() {
        let der = vec![0x30u8; 100];
        let pem = encode_certificate(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.lines().all(|line| line.len() <= 64));

        let chain = join_chain(&pem, &encode_certificate(&[0x31u8; 10]));
        let certs = split_chain(&chain).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], der);
        assert_eq!(leaf_certificate(&chain).unwrap(), der);
    }

    #[test]
    fn test_join_without_issuer() {
        let pem = encode_certificate(&[1, 2, 3]);
        assert_eq!(join_chain(&pem, ""), pem);
    }

    #[test]
    fn test_empty_chain_is_codec_error() {
        assert!(matches!(split_chain("no pem here"), Err(EngineError::Codec(_))));
    }

    #[test]
    fn test_thumbprints() {
        let prints = thumbprints(b"abc");
        assert_eq!(prints.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            prints.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
