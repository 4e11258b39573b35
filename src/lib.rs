// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A secure repository client core implementing [The Update Framework] (TUF) trust model for a
//! package-distribution system: root/timestamp/snapshot/targets metadata, threshold signatures,
//! rollback/freeze/mix-and-match/endless-data/key-compromise defenses, and a package index served
//! as a single tar(.gz) archive rather than per-package delegated roles.
//!
//! This crate is deliberately synchronous and single-threaded (see [`engine`] module docs): the
//! embedding application supplies the clock, the transport, and any concurrency around calls to
//! [`engine::Repository::refresh`].
//!
//! [The Update Framework]: https://theupdateframework.github.io/
//!
//! # Testing
//!
//! Unit tests live alongside each module and run with `cargo test`. HTTP-backed integration tests
//! (behind the `http` feature, using `httptest`) exercise [`engine::Repository::refresh`] against
//! a local server standing in for a repository.

#![forbid(missing_debug_implementations, missing_copy_implementations)]
#![deny(rust_2018_idioms)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc
)]

mod cache;
mod canonical;
mod crypto;
pub mod engine;
pub mod error;
pub mod schema;
pub mod transport;
pub mod trust;

pub use crate::cache::Cache;
pub use crate::engine::Repository;
pub use crate::transport::{
    filesystem_transport, ClientSettings, Event, FilesystemTransport, MustCache, PackageId,
    RawTransport, RemoteFile, RepositoryTransport, TransportError, TransportErrorKind,
};
#[cfg(feature = "http")]
pub use crate::transport::{http_transport, HttpTransport};
pub use crate::trust::Trusted;

/// Whether [`engine::Repository::refresh`] should fail when cached or fetched metadata is expired
/// (`Safe`), or ignore expiry (`Unsafe`). Only use `Unsafe` for offline/vendored use cases where
/// there is no mirror to go stale against; it forfeits TUF's freeze-attack protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationEnforcement {
    /// Expirations are enforced. You MUST use this option to get TUF's security guarantees.
    Safe,

    /// Expirations are not enforced. Does NOT provide TUF's freeze-attack protection; use only if
    /// you are sure you need it.
    Unsafe,
}

impl Default for ExpirationEnforcement {
    fn default() -> Self {
        Self::Safe
    }
}

/// Limits on remote metadata fetches, to bound an endless-data or unbounded-root-chain attack
/// (spec.md §4.6, §7). Clients should set these high enough to tolerate legitimate repository
/// growth but low enough to bound resource use against a hostile mirror.
///
/// The [`Default`] implementation sets:
/// * `max_root_size`: 1 MiB
/// * `max_targets_size`: 10 MiB
/// * `max_timestamp_size`: 1 MiB
/// * `max_root_updates`: 1024
/// * `root_hop_bound`: 2
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// The maximum allowable size in bytes for a downloaded `root.json`.
    pub max_root_size: u64,

    /// The maximum allowable size in bytes for the package index archive, if its size is not
    /// asserted by `snapshot.json`.
    pub max_targets_size: u64,

    /// The maximum allowable size in bytes for the downloaded `timestamp.json`.
    pub max_timestamp_size: u64,

    /// The maximum number of root versions root recovery will fetch in one walk (spec.md §4.6,
    /// "Root Recovery"), bounding an attacker who can keep producing plausible-looking next
    /// versions forever.
    pub max_root_updates: u64,

    /// The maximum number of root-rotation ("snapshot names a newer root") hops permitted within
    /// one call to [`engine::Repository::refresh`] (SPEC_FULL B.1, spec.md §4.6 normal path step
    /// 5: "bounded by hop count, default 2").
    pub root_hop_bound: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_root_size: 1024 * 1024,
            max_targets_size: 1024 * 1024 * 10,
            max_timestamp_size: 1024 * 1024,
            max_root_updates: 1024,
            root_hop_bound: 2,
        }
    }
}
