//! The four TUF role payloads (root, timestamp, snapshot, targets/index), their signed envelope,
//! and the file-info records that bind one role's claims about another role's bytes.

mod de;
pub mod decoded;
pub mod key;
pub(crate) mod verify;

use crate::canonical::to_canonical_bytes;
use crate::error::{self, Error, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;
use std::num::NonZeroU64;

/// Parses `bytes` as a `Signed<T>`, first checking that the envelope's `signed._type` field names
/// the role the caller expects. A mismatched `_type` is reported as `InvalidType` rather than the
/// more opaque `serde_json` error that a direct deserialize would produce, since a mix-and-match
/// attack (serving role B's bytes where role A was requested) is exactly the failure mode this
/// distinction exists to surface clearly.
pub(crate) fn parse_role<T>(role: RoleType, bytes: &[u8]) -> Result<Signed<T>>
where
    T: Role + DeserializeOwned,
{
    let envelope: Value = serde_json::from_slice(bytes).context(error::ParseSnafu {
        role: role.as_str(),
    })?;
    let found = envelope
        .get("signed")
        .and_then(|signed| signed.get("_type"))
        .and_then(Value::as_str)
        .unwrap_or("<missing>");
    if found != role.as_str() {
        return error::InvalidTypeSnafu {
            expected: role.as_str(),
            found: found.to_string(),
        }
        .fail();
    }
    serde_json::from_value(envelope).context(error::ParseSnafu { role: role.as_str() })
}

/// The type of metadata role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    /// The root role delegates trust to the keys authorized for all other top-level roles.
    Root,
    /// The snapshot role signs version (and optionally length/hash) information for root and the
    /// package index, so that both are fetched at a consistent point in time.
    Snapshot,
    /// The targets role's signature indicates which per-package metadata is trusted.
    Targets,
    /// The timestamp role is re-signed frequently to bound how stale a client's view of
    /// `snapshot` can be without detection.
    Timestamp,
}

forward_display_to_serde!(RoleType);
forward_from_str_to_serde!(RoleType);

impl RoleType {
    /// The role's name as it appears in a document's `_type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Timestamp => "timestamp",
            Self::Snapshot => "snapshot",
            Self::Targets => "targets",
        }
    }
}

/// Common behavior every role payload provides.
pub trait Role: Serialize {
    /// The role this payload belongs to.
    const TYPE: RoleType;

    /// The instant after which this payload must no longer be trusted.
    fn expires(&self) -> DateTime<Utc>;

    /// Monotonically increasing version; a client must never adopt a lower version than one it
    /// has already trusted.
    fn version(&self) -> NonZeroU64;

    /// The canonical (signed) byte form of this payload, per spec.md §4.1.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }
}

/// A role payload together with the signatures asserted over its canonical form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role payload.
    pub signed: T,
    /// Signatures over the canonical encoding of `signed`, each naming the key ID that produced
    /// it.
    pub signatures: Vec<Signature>,
}

/// One signature in a `Signed` envelope.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The key ID (from `root.json`) that produced this signature.
    pub keyid: Decoded<Hex>,
    /// The signature bytes.
    pub sig: Decoded<Hex>,
}

/// A file's identity: its size and one or more labeled digests. At least one hash algorithm that
/// this build recognizes must be present for verification to succeed, but unrecognized algorithms
/// in the map are simply ignored rather than causing a hard failure (spec.md §3, §4.2).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileInfo {
    /// The file's length in bytes.
    pub length: u64,

    /// Digests of the file, keyed by algorithm name (e.g. `"sha256"`).
    pub hashes: HashMap<String, Decoded<Hex>>,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl FileInfo {
    /// Checks `length` and every recognized hash in `self.hashes` against `bytes`. Succeeds only
    /// if at least one recognized algorithm was present and every recognized algorithm matched.
    pub(crate) fn verify(&self, role: &'static str, bytes: &[u8]) -> Result<()> {
        let actual_len = bytes.len() as u64;
        error::ensure_length_matches(role, self.length, actual_len)?;

        let mut recognized = 0usize;
        for (algo, expected) in &self.hashes {
            let Some(algorithm) = crate::crypto::HashAlgorithm::from_key(algo) else {
                continue;
            };
            recognized += 1;
            let calculated = crate::crypto::digest_bytes(algorithm, bytes);
            if calculated != expected.as_ref() {
                return error::HashMismatchSnafu {
                    role: role.to_string(),
                    expected: hex::encode(expected.as_ref()),
                    calculated: hex::encode(&calculated),
                }
                .fail();
            }
        }
        if recognized == 0 {
            return error::UnknownHashAlgorithmSnafu {
                found: self.hashes.keys().cloned().collect::<Vec<_>>(),
            }
            .fail();
        }
        Ok(())
    }
}

/// A `FileInfo` paired with the version number of the file it describes, used where a role needs
/// to assert both (root, within `snapshot`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VersionedFileInfo {
    /// The version of the described file.
    pub version: NonZeroU64,
    #[serde(flatten)]
    pub file_info: FileInfo,
}

/// The package index, in both archive forms a transport may serve. `tar` information is
/// optional; a transport that only ever serves `.tar.gz` need not populate it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IndexFileInfo {
    /// File-info for the gzip-compressed index archive.
    pub tar_gz: FileInfo,
    /// File-info for the uncompressed index archive, if the repository publishes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar: Option<FileInfo>,
}

/// Authorized key IDs and signature threshold for one role, as asserted by `root.json`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// Key IDs authorized to sign for this role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The number of distinct valid signatures, from the keys above, required to accept a
    /// document for this role.
    pub threshold: NonZeroU64,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// `root.json`: the trust anchor. Names the public keys and per-role thresholds for every role,
/// including itself.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    /// TUF specification version this document claims compliance with.
    pub spec_version: String,

    /// Whether the repository publishes consistent-snapshot (version-prefixed) filenames for
    /// `root.json` and `snapshot.json`.
    pub consistent_snapshot: bool,

    /// This root's version. A client never adopts a root with a lower version than one it has
    /// already trusted.
    pub version: NonZeroU64,

    /// When this root expires.
    pub expires: DateTime<Utc>,

    /// Every key referenced by `roles`, keyed by key ID. Each key ID is validated during
    /// deserialization to match the hash of its own key material.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The authorized keys and threshold for each of the four roles.
    pub roles: HashMap<RoleType, RoleKeys>,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Root {
    /// The authorized keys and threshold for `role`, or `None` if root's `roles` table omits it
    /// (a malformed root for our purposes -- every caller should treat this as `InvalidType` or
    /// similar rather than silently skipping verification).
    pub(crate) fn role_keys(&self, role: RoleType) -> Option<&RoleKeys> {
        self.roles.get(&role)
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

/// `timestamp.json`: names the current version (and digest) of `snapshot.json`. Re-signed often
/// so a client can detect a frozen mirror quickly.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    /// TUF specification version this document claims compliance with.
    pub spec_version: String,

    /// This timestamp's version.
    pub version: NonZeroU64,

    /// When this timestamp expires.
    pub expires: DateTime<Utc>,

    /// File-info (and version) for the `snapshot.json` this timestamp vouches for.
    pub snapshot: VersionedFileInfo,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

/// `snapshot.json`: names the current version of `root.json` and the current file-info of the
/// package index, so both are fetched against a single, internally consistent point in time.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "snapshot")]
pub struct Snapshot {
    /// TUF specification version this document claims compliance with.
    pub spec_version: String,

    /// This snapshot's version.
    pub version: NonZeroU64,

    /// When this snapshot expires.
    pub expires: DateTime<Utc>,

    /// File-info (and version) for the `root.json` this snapshot was built against.
    pub root: VersionedFileInfo,

    /// File-info for the package index, in both archive forms a transport may serve.
    pub index: IndexFileInfo,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

/// A `targets.json` entry extracted from the package index: the file-info for every logical
/// target path this document vouches for. There is no delegation support -- the index is a flat
/// map from path to file-info.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    /// TUF specification version this document claims compliance with.
    pub spec_version: String,

    /// This targets document's version.
    pub version: NonZeroU64,

    /// When this targets document expires.
    pub expires: DateTime<Utc>,

    /// File-info for every target path this document describes.
    pub targets: HashMap<String, FileInfo>,

    /// Extra fields preserved for canonical re-serialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Targets {
    /// Looks up a logical target path's file-info.
    pub fn find_target(&self, target_path: &str) -> Result<&FileInfo> {
        self.targets
            .get(target_path)
            .ok_or_else(|| Error::TargetNotFound {
                target_file: target_path.to_string(),
                backtrace: snafu::Backtrace::new(),
            })
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}
