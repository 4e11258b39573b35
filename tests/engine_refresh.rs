//! End-to-end scenario tests for `engine::Repository::refresh`, covering spec.md §8's testable
//! properties against a programmatically signed fixture repository served over a `file://`
//! transport. Grounded on the fixture-building pattern in `src/schema/verify.rs`'s own test
//! module (generate an Ed25519 key, hand-build a role payload, sign its canonical form) and on
//! `tests/test_utils.rs` in the teacher workspace for the `Url::from_directory_path` /
//! `tempfile::tempdir` plumbing -- though unlike the teacher, there are no pre-baked `tests/data`
//! fixtures to load, since nothing here can run the Rust toolchain to generate them.

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{Ed25519KeyPair, KeyPair};
use chrono::{Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;
use tuf_repo_client::error::Error;
use tuf_repo_client::schema::decoded::{Decoded, Hex};
use tuf_repo_client::schema::key::{Ed25519Key, Ed25519Scheme, Key};
use tuf_repo_client::schema::{
    FileInfo, IndexFileInfo, Role, RoleKeys, RoleType, Root, Signature, Signed, Snapshot, Targets,
    Timestamp, VersionedFileInfo,
};
use tuf_repo_client::trust::key_id;
use tuf_repo_client::{filesystem_transport, Cache, ExpirationEnforcement, Limits, Repository};
use url::Url;

fn sha256_hex(bytes: &[u8]) -> Decoded<Hex> {
    digest(&SHA256, bytes).as_ref().to_vec().into()
}

fn new_keypair() -> Ed25519KeyPair {
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
    Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
}

fn public_key_of(pair: &Ed25519KeyPair) -> Key {
    Key::Ed25519 {
        keyval: Ed25519Key {
            public: pair.public_key().as_ref().to_vec().into(),
            _extra: HashMap::new(),
        },
        scheme: Ed25519Scheme::Ed25519,
        _extra: HashMap::new(),
    }
}

fn sign_with<T: Role>(payload: T, signers: &[(&Ed25519KeyPair, &Decoded<Hex>)]) -> Signed<T> {
    let canonical = payload.canonical_form().unwrap();
    let signatures = signers
        .iter()
        .map(|(pair, keyid)| Signature {
            keyid: (*keyid).clone(),
            sig: pair.sign(&canonical).as_ref().to_vec().into(),
        })
        .collect();
    Signed {
        signed: payload,
        signatures,
    }
}

fn role_keys(keyid: &Decoded<Hex>) -> RoleKeys {
    RoleKeys {
        keyids: vec![keyid.clone()],
        threshold: NonZeroU64::new(1).unwrap(),
        _extra: HashMap::new(),
    }
}

/// One key authorized for `timestamp`/`snapshot`/`targets`, plus one (possibly distinct) key
/// authorized for `root`, stitched into a `Root` document.
fn root_doc(
    version: u64,
    expires: chrono::DateTime<Utc>,
    root_keyid: &Decoded<Hex>,
    root_key: &Key,
    service_keyid: &Decoded<Hex>,
    service_key: &Key,
) -> Root {
    let mut keys = HashMap::new();
    keys.insert(root_keyid.clone(), root_key.clone());
    keys.insert(service_keyid.clone(), service_key.clone());

    let mut roles = HashMap::new();
    roles.insert(RoleType::Root, role_keys(root_keyid));
    roles.insert(RoleType::Timestamp, role_keys(service_keyid));
    roles.insert(RoleType::Snapshot, role_keys(service_keyid));
    roles.insert(RoleType::Targets, role_keys(service_keyid));

    Root {
        spec_version: "1.0.0".to_string(),
        consistent_snapshot: false,
        version: NonZeroU64::new(version).unwrap(),
        expires,
        keys,
        roles,
        _extra: HashMap::new(),
    }
}

fn index_tar_gz(entries: &[(&str, &Signed<Targets>)]) -> Vec<u8> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for (member_path, signed) in entries {
            let bytes = serde_json::to_vec(signed).unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, *member_path, bytes.as_slice())
                .unwrap();
        }
        builder.finish().unwrap();
    }
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar_bytes).unwrap();
    gz.finish().unwrap()
}

fn file_info_for(bytes: &[u8]) -> FileInfo {
    FileInfo {
        length: bytes.len() as u64,
        hashes: HashMap::from([("sha256".to_string(), sha256_hex(bytes))]),
        _extra: HashMap::new(),
    }
}

/// Builds a one-package targets entry, signs it, and returns both the signed document and its
/// serialized bytes (the latter is what goes inside the index archive).
fn targets_doc(
    service_pair: &Ed25519KeyPair,
    service_keyid: &Decoded<Hex>,
    package_contents: &[u8],
) -> Signed<Targets> {
    let mut targets = HashMap::new();
    targets.insert(
        "demo/1.0.0/demo-1.0.0.tar.gz".to_string(),
        file_info_for(package_contents),
    );
    let doc = Targets {
        spec_version: "1.0.0".to_string(),
        version: NonZeroU64::new(1).unwrap(),
        expires: Utc::now() + Duration::days(1),
        targets,
        _extra: HashMap::new(),
    };
    sign_with(doc, &[(service_pair, service_keyid)])
}

/// Writes a complete, internally consistent repository (root/timestamp/snapshot/index) into
/// `dir`. `root` must already be signed appropriately for its own rotation state; the snapshot and
/// timestamp are always signed by `service_pair` (this crate's fixtures never rotate the
/// timestamp/snapshot/targets key, only the root key, to keep the cross-signing in
/// `rotate_to_new_root` tractable).
fn write_repo(
    dir: &Path,
    root: &Signed<Root>,
    service_pair: &Ed25519KeyPair,
    service_keyid: &Decoded<Hex>,
    snapshot_version: u64,
    index_bytes: &[u8],
    root_file_name: &str,
) {
    std::fs::create_dir_all(dir).unwrap();

    let root_bytes = serde_json::to_vec(root).unwrap();
    std::fs::write(dir.join(root_file_name), &root_bytes).unwrap();
    std::fs::write(dir.join("00-index.tar.gz"), index_bytes).unwrap();

    let snapshot = Snapshot {
        spec_version: "1.0.0".to_string(),
        version: NonZeroU64::new(snapshot_version).unwrap(),
        expires: Utc::now() + Duration::days(1),
        root: VersionedFileInfo {
            version: root.signed.version,
            file_info: file_info_for(&root_bytes),
        },
        index: IndexFileInfo {
            tar_gz: file_info_for(index_bytes),
            tar: None,
        },
        _extra: HashMap::new(),
    };
    let signed_snapshot = sign_with(snapshot, &[(service_pair, service_keyid)]);
    let snapshot_bytes = serde_json::to_vec(&signed_snapshot).unwrap();
    std::fs::write(dir.join("snapshot.json"), &snapshot_bytes).unwrap();

    let timestamp = Timestamp {
        spec_version: "1.0.0".to_string(),
        version: NonZeroU64::new(snapshot_version).unwrap(),
        expires: Utc::now() + Duration::days(1),
        snapshot: VersionedFileInfo {
            version: signed_snapshot.signed.version,
            file_info: file_info_for(&snapshot_bytes),
        },
        _extra: HashMap::new(),
    };
    let signed_timestamp = sign_with(timestamp, &[(service_pair, service_keyid)]);
    std::fs::write(
        dir.join("timestamp.json"),
        serde_json::to_vec(&signed_timestamp).unwrap(),
    )
    .unwrap();
}

fn seed_cache_with_root(cache_dir: &Path, root: &Signed<Root>) -> Arc<Cache> {
    std::fs::create_dir_all(cache_dir).unwrap();
    std::fs::write(
        cache_dir.join("root.json"),
        serde_json::to_vec(root).unwrap(),
    )
    .unwrap();
    Arc::new(Cache::new(Some(cache_dir.to_path_buf())).unwrap())
}

#[test]
fn fresh_bootstrap_then_unchanged_repository_short_circuits() {
    let service_pair = new_keypair();
    let service_key = public_key_of(&service_pair);
    let service_keyid: Decoded<Hex> = key_id(&service_key).unwrap().into();

    let root_pair = new_keypair();
    let root_key = public_key_of(&root_pair);
    let root_keyid: Decoded<Hex> = key_id(&root_key).unwrap().into();

    let root = root_doc(
        1,
        Utc::now() + Duration::days(365),
        &root_keyid,
        &root_key,
        &service_keyid,
        &service_key,
    );
    let signed_root = sign_with(root, &[(&root_pair, &root_keyid)]);

    let targets = targets_doc(&service_pair, &service_keyid, b"package bytes");
    let index_bytes = index_tar_gz(&[("demo/1.0.0/targets.json", &targets)]);

    let repo_dir = tempfile::tempdir().unwrap();
    write_repo(
        repo_dir.path(),
        &signed_root,
        &service_pair,
        &service_keyid,
        1,
        &index_bytes,
        "root.json",
    );

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = seed_cache_with_root(cache_dir.path(), &signed_root);

    let metadata_url = Url::from_directory_path(repo_dir.path()).unwrap();
    let transport = filesystem_transport(metadata_url.clone(), metadata_url, cache);

    let repo = Repository::refresh(
        transport.clone(),
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(repo.snapshot().version.get(), 1);
    assert_eq!(repo.timestamp().version.get(), 1);

    // Nothing on the server changed; the second cycle must stop after the timestamp round-trip
    // (spec.md §4.6 step 3) and still report the same trusted state.
    let repo_again = Repository::refresh(
        transport,
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(repo_again.snapshot().version.get(), 1);
}

#[test]
fn persistent_hash_mismatch_on_index_is_fatal() {
    let service_pair = new_keypair();
    let service_key = public_key_of(&service_pair);
    let service_keyid: Decoded<Hex> = key_id(&service_key).unwrap().into();

    let root_pair = new_keypair();
    let root_key = public_key_of(&root_pair);
    let root_keyid: Decoded<Hex> = key_id(&root_key).unwrap().into();

    let root = root_doc(
        1,
        Utc::now() + Duration::days(365),
        &root_keyid,
        &root_key,
        &service_keyid,
        &service_key,
    );
    let signed_root = sign_with(root, &[(&root_pair, &root_keyid)]);

    let targets = targets_doc(&service_pair, &service_keyid, b"package bytes");
    let index_bytes = index_tar_gz(&[("demo/1.0.0/targets.json", &targets)]);

    let repo_dir = tempfile::tempdir().unwrap();
    write_repo(
        repo_dir.path(),
        &signed_root,
        &service_pair,
        &service_keyid,
        1,
        &index_bytes,
        "root.json",
    );

    // snapshot.json still asserts the hash of the real index, but the bytes actually served for
    // "00-index.tar.gz" are something else entirely: a hash mismatch at step 6 that will recur
    // identically on every retry, since nothing about the corruption is transient.
    std::fs::write(repo_dir.path().join("00-index.tar.gz"), b"corrupted bytes").unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = seed_cache_with_root(cache_dir.path(), &signed_root);

    let metadata_url = Url::from_directory_path(repo_dir.path()).unwrap();
    let transport = filesystem_transport(metadata_url.clone(), metadata_url, cache);

    let err = Repository::refresh(
        transport,
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap_err();

    // The first hash mismatch triggers root recovery (spec.md §8 scenario 6: "recovery
    // triggered"); recovery finds no newer root to install, so the cycle retries and hits the
    // same mismatch again, which is reported as `DoubleRecovery` rather than a second bare
    // `HashMismatch` (spec.md §7 "Recovery": at most one recovery cycle per `refresh()` call).
    assert!(matches!(err, Error::DoubleRecovery { .. }), "{err:?}");
}

#[test]
fn snapshot_rollback_is_rejected_and_does_not_recover() {
    let service_pair = new_keypair();
    let service_key = public_key_of(&service_pair);
    let service_keyid: Decoded<Hex> = key_id(&service_key).unwrap().into();

    let root_pair = new_keypair();
    let root_key = public_key_of(&root_pair);
    let root_keyid: Decoded<Hex> = key_id(&root_key).unwrap().into();

    let root = root_doc(
        1,
        Utc::now() + Duration::days(365),
        &root_keyid,
        &root_key,
        &service_keyid,
        &service_key,
    );
    let signed_root = sign_with(root, &[(&root_pair, &root_keyid)]);

    let targets = targets_doc(&service_pair, &service_keyid, b"package bytes");
    let index_bytes = index_tar_gz(&[("demo/1.0.0/targets.json", &targets)]);

    let repo_dir = tempfile::tempdir().unwrap();
    write_repo(
        repo_dir.path(),
        &signed_root,
        &service_pair,
        &service_keyid,
        2,
        &index_bytes,
        "root.json",
    );

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = seed_cache_with_root(cache_dir.path(), &signed_root);

    let metadata_url = Url::from_directory_path(repo_dir.path()).unwrap();
    let transport = filesystem_transport(metadata_url.clone(), metadata_url, cache);

    let repo = Repository::refresh(
        transport.clone(),
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(repo.snapshot().version.get(), 2);

    // A mirror (or attacker) now serves an older, previously-valid snapshot/timestamp pair. This
    // must never be accepted even though every signature on it is genuine.
    write_repo(
        repo_dir.path(),
        &signed_root,
        &service_pair,
        &service_keyid,
        1,
        &index_bytes,
        "root.json",
    );

    let err = Repository::refresh(
        transport,
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::DoubleRecovery { .. }), "{err:?}");
}

#[test]
fn root_rotation_is_followed_within_the_hop_bound() {
    let service_pair = new_keypair();
    let service_key = public_key_of(&service_pair);
    let service_keyid: Decoded<Hex> = key_id(&service_key).unwrap().into();

    let root1_pair = new_keypair();
    let root1_key = public_key_of(&root1_pair);
    let root1_keyid: Decoded<Hex> = key_id(&root1_key).unwrap().into();

    let root2_pair = new_keypair();
    let root2_key = public_key_of(&root2_pair);
    let root2_keyid: Decoded<Hex> = key_id(&root2_key).unwrap().into();

    let root1 = root_doc(
        1,
        Utc::now() + Duration::days(365),
        &root1_keyid,
        &root1_key,
        &service_keyid,
        &service_key,
    );
    let signed_root1 = sign_with(root1, &[(&root1_pair, &root1_keyid)]);

    let root2 = root_doc(
        2,
        Utc::now() + Duration::days(365),
        &root2_keyid,
        &root2_key,
        &service_keyid,
        &service_key,
    );
    // The TUF root chain rule: a successor root needs signatures from both the old root's
    // root-role threshold and its own declared root-role threshold.
    let signed_root2 = sign_with(
        root2,
        &[(&root1_pair, &root1_keyid), (&root2_pair, &root2_keyid)],
    );

    let targets = targets_doc(&service_pair, &service_keyid, b"package bytes");
    let index_bytes = index_tar_gz(&[("demo/1.0.0/targets.json", &targets)]);

    let repo_dir = tempfile::tempdir().unwrap();
    // snapshot.json names root v2, so the engine must fetch "2.root.json" during step 5.
    write_repo(
        repo_dir.path(),
        &signed_root2,
        &service_pair,
        &service_keyid,
        1,
        &index_bytes,
        "2.root.json",
    );

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = seed_cache_with_root(cache_dir.path(), &signed_root1);

    let metadata_url = Url::from_directory_path(repo_dir.path()).unwrap();
    let transport = filesystem_transport(metadata_url.clone(), metadata_url, cache);

    let repo = Repository::refresh(
        transport,
        Limits::default(),
        ExpirationEnforcement::Safe,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(repo.root().version.get(), 2);
    assert_eq!(repo.snapshot().version.get(), 1);
}
