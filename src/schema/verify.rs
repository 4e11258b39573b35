//! Threshold signature verification, shared by every `verify_*` constructor in `crate::trust`.

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{Role, RoleKeys, Signed};
use std::collections::{HashMap, HashSet};

/// Checks that at least `authorized.threshold` *distinct* key IDs in `authorized.keyids` produced
/// a valid signature over `signed.signed`'s canonical form, using the key material in `keys`.
///
/// A key ID in `authorized.keyids` with no corresponding entry in `keys`, or whose scheme this
/// build does not recognize, simply contributes no valid signature -- it is not itself an error
/// (spec.md §7: `UnknownKeyAlgorithm` downgrades safely).
pub(crate) fn verify_signatures<T: Role>(
    signed: &Signed<T>,
    authorized: &RoleKeys,
    keys: &HashMap<Decoded<Hex>, Key>,
) -> Result<()> {
    let canonical = signed.signed.canonical_form()?;
    let authorized_ids: HashSet<&Decoded<Hex>> = authorized.keyids.iter().collect();

    let mut valid_signers = HashSet::new();
    for signature in &signed.signatures {
        if !authorized_ids.contains(&signature.keyid) {
            continue;
        }
        let Some(key) = keys.get(&signature.keyid) else {
            continue;
        };
        match crate::crypto::verify_signature(key, &canonical, signature.sig.as_ref()) {
            Ok(true) => {
                valid_signers.insert(&signature.keyid);
            }
            Ok(false) | Err(_) => {}
        }
    }

    let valid = valid_signers.len() as u64;
    snafu::ensure!(
        valid >= authorized.threshold.get(),
        error::SignatureMismatchSnafu {
            role: T::TYPE.as_str(),
            threshold: authorized.threshold.get(),
            valid,
            total: signed.signatures.len(),
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::key::{Ed25519Key, Ed25519Scheme};
    use crate::schema::{Signature, Timestamp, VersionedFileInfo};
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{Ed25519KeyPair, KeyPair};
    use chrono::{Duration, Utc};
    use std::num::NonZeroU64;

    fn keypair() -> Ed25519KeyPair {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn fixture_timestamp() -> Timestamp {
        Timestamp {
            spec_version: "1.0.0".to_string(),
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc::now() + Duration::days(1),
            snapshot: VersionedFileInfo {
                version: NonZeroU64::new(1).unwrap(),
                file_info: crate::schema::FileInfo {
                    length: 0,
                    hashes: HashMap::new(),
                    _extra: HashMap::new(),
                },
            },
            _extra: HashMap::new(),
        }
    }

    #[test]
    fn meets_threshold_with_one_of_two_signatures() {
        let pair = keypair();
        let keyid: Decoded<Hex> = vec![1, 2, 3, 4].into();
        let mut keys = HashMap::new();
        keys.insert(
            keyid.clone(),
            Key::Ed25519 {
                keyval: Ed25519Key {
                    public: pair.public_key().as_ref().to_vec().into(),
                    _extra: HashMap::new(),
                },
                scheme: Ed25519Scheme::Ed25519,
                _extra: HashMap::new(),
            },
        );

        let timestamp = fixture_timestamp();
        let canonical = timestamp.canonical_form().unwrap();
        let sig = pair.sign(&canonical);

        let signed = Signed {
            signed: timestamp,
            signatures: vec![Signature {
                keyid: keyid.clone(),
                sig: sig.as_ref().to_vec().into(),
            }],
        };

        let authorized = RoleKeys {
            keyids: vec![keyid],
            threshold: NonZeroU64::new(1).unwrap(),
            _extra: HashMap::new(),
        };

        verify_signatures(&signed, &authorized, &keys).unwrap();
    }

    #[test]
    fn fails_below_threshold() {
        let pair = keypair();
        let keyid: Decoded<Hex> = vec![9, 9, 9].into();
        let mut keys = HashMap::new();
        keys.insert(
            keyid.clone(),
            Key::Ed25519 {
                keyval: Ed25519Key {
                    public: pair.public_key().as_ref().to_vec().into(),
                    _extra: HashMap::new(),
                },
                scheme: Ed25519Scheme::Ed25519,
                _extra: HashMap::new(),
            },
        );

        let timestamp = fixture_timestamp();
        let signed = Signed {
            signed: timestamp,
            signatures: vec![],
        };

        let authorized = RoleKeys {
            keyids: vec![keyid],
            threshold: NonZeroU64::new(1).unwrap(),
            _extra: HashMap::new(),
        };

        assert!(verify_signatures(&signed, &authorized, &keys).is_err());
    }
}
