//! Cryptographic primitives: signature verification and file-hashing, as specified in spec.md
//! §4.2. Ed25519 is the mandatory signature scheme; SHA-256 is the mandatory digest, SHA-512 is
//! recognized but optional. Unknown algorithms downgrade safely to "no evidence from this entry"
//! rather than an error, per spec.md §7 (`UnknownKeyAlgorithm`, `UnknownHashAlgorithm`).

use crate::schema::key::Key;
use aws_lc_rs::digest;
use aws_lc_rs::signature::{self, UnparsedPublicKey};

/// Verifies `sig` over `msg` under the public key material in `key`.
///
/// Returns `Ok(true)` if the signature is valid, `Ok(false)` if it is not, and `Err` only if
/// `key`'s scheme is not one this build recognizes (treated by callers as "no valid signature
/// from this entry", never as a hard failure).
pub(crate) fn verify_signature(key: &Key, msg: &[u8], sig: &[u8]) -> Result<bool, UnknownKeyAlgorithm> {
    match key {
        Key::Ed25519 { keyval, .. } => {
            let public = UnparsedPublicKey::new(&signature::ED25519, keyval.public.as_ref());
            Ok(public.verify(msg, sig).is_ok())
        }
        Key::Unrecognized => Err(UnknownKeyAlgorithm),
    }
}

/// Signals that a key uses a scheme this build does not implement.
#[derive(Debug)]
pub(crate) struct UnknownKeyAlgorithm;

/// A recognized file-hash algorithm, used when checking `FileInfo::hashes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Parses the JSON key under which this algorithm's digest is carried (e.g. `"sha256"`).
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha256 => &digest::SHA256,
            Self::Sha512 => &digest::SHA512,
        }
    }
}

/// Computes the digest of `bytes` under `algorithm`.
pub fn digest_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> Vec<u8> {
    digest::digest(algorithm.ring_algorithm(), bytes)
        .as_ref()
        .to_vec()
}

/// A streaming digest accumulator, used by the cache and transport layers to verify a file's
/// hash without buffering the whole (possibly attacker-controlled-length) byte stream twice.
pub(crate) struct StreamingDigest {
    context: digest::Context,
    algorithm: HashAlgorithm,
}

impl StreamingDigest {
    pub(crate) fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            context: digest::Context::new(algorithm.ring_algorithm()),
            algorithm,
        }
    }

    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.context.update(chunk);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.context.finish().as_ref().to_vec()
    }

    pub(crate) fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// The key-id of a public key: the hex-lowercase SHA-256 digest of the canonical encoding of
/// `{ keytype, keyval: { public } }`, per spec.md §4.2. `scheme` is deliberately not part of this
/// input -- unlike the rest of a signed document, a key's id is a property of its key material
/// alone, so we canonicalize a narrower, dedicated struct rather than the whole `Key` enum (which
/// also serializes `scheme` and any `_extra` fields).
pub fn key_id(key: &Key) -> Result<Vec<u8>, crate::error::Error> {
    #[derive(serde::Serialize)]
    struct KeyIdKeyval<'a> {
        public: &'a crate::schema::decoded::Decoded<crate::schema::decoded::Hex>,
    }

    #[derive(serde::Serialize)]
    struct KeyIdInput<'a> {
        keytype: &'a str,
        keyval: KeyIdKeyval<'a>,
    }

    let canonical = match key {
        Key::Ed25519 { keyval, .. } => crate::canonical::to_canonical_bytes(&KeyIdInput {
            keytype: "ed25519",
            keyval: KeyIdKeyval {
                public: &keyval.public,
            },
        })?,
        // An unrecognized keytype carries no material to narrow down to; fall back to hashing
        // whatever was preserved so two distinct unrecognized keys still reliably hash distinctly.
        Key::Unrecognized => crate::canonical::to_canonical_bytes(key)?,
    };
    Ok(digest_bytes(HashAlgorithm::Sha256, &canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::key::{Ed25519Key, Ed25519Scheme};
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{Ed25519KeyPair, KeyPair};
    use std::collections::HashMap;

    #[test]
    fn verifies_a_genuine_ed25519_signature() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();

        let key = Key::Ed25519 {
            keyval: Ed25519Key {
                public: pair.public_key().as_ref().to_vec().into(),
                _extra: HashMap::new(),
            },
            scheme: Ed25519Scheme::Ed25519,
            _extra: HashMap::new(),
        };

        let msg = b"canonical signed bytes";
        let sig = pair.sign(msg);

        assert!(verify_signature(&key, msg, sig.as_ref()).unwrap());
        assert!(!verify_signature(&key, b"tampered", sig.as_ref()).unwrap());
    }

    #[test]
    fn sha256_matches_known_vector() {
        let digest = digest_bytes(HashAlgorithm::Sha256, b"hello");
        assert_eq!(
            hex::encode(digest),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
