//! The key material carried in a `root.json` (or delegation) key table.
//!
//! Ed25519 is the only scheme this build signs or verifies (spec.md §4.2: "Ed25519 is the
//! required scheme; additional schemes may be plugged in via algorithm tag on the key"). Keys
//! using a scheme we don't recognize still deserialize successfully, as `Key::Unrecognized` --
//! they simply never contribute a valid signature (spec.md's `UnknownKeyAlgorithm`, which
//! downgrades safely rather than erroring the whole document).

use crate::schema::decoded::{Decoded, Hex};
use serde::{Deserialize, Serialize};
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use std::collections::HashMap;
use serde_json::Value;

/// A public key, tagged by its `keytype`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "keytype")]
pub enum Key {
    /// An Ed25519 public key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The key material.
        keyval: Ed25519Key,
        /// The signing scheme; always `ed25519`.
        scheme: Ed25519Scheme,
        /// Extra fields preserved for canonical re-serialization.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },

    /// A key using a scheme this build does not implement. Carries no material; it can never
    /// produce a valid signature, but its presence in a key table does not itself invalidate the
    /// document (spec.md §4.2, §7 `UnknownKeyAlgorithm`).
    #[serde(other)]
    Unrecognized,
}

/// The `keyval` object for an Ed25519 key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Ed25519Key {
    /// The raw Ed25519 public key bytes, hex-encoded.
    pub public: Decoded<Hex>,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// The signing scheme used by an Ed25519 key. Only one scheme exists for this key type.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Ed25519Scheme {
    /// The only defined scheme for Ed25519 keys.
    Ed25519,
}

forward_display_to_serde!(Ed25519Scheme);
forward_from_str_to_serde!(Ed25519Scheme);
