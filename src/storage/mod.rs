// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Connector Storage Module
//!
//! Persistence for the per-site authorization whitelist.
//!
//! ## Storage Layout
//!
//! ```text
//! {DATA_DIR}/
//!   connector/
//!     whitelist.json   # Single wholesale record: {"whitelist": [entries]}
//! ```
//!
//! The whitelist is read and written as one document; there are no partial
//! updates. Writes go through a temp file and an atomic rename, so a reader
//! never observes a half-written state. The store keeps an in-memory cache
//! that is invalidated on every write and exposes an explicit
//! `refresh()`/`subscribe()` contract instead of getter side effects.

pub mod paths;
pub mod whitelist;

pub use paths::StoragePaths;
pub use whitelist::{StorageError, StorageResult, WhitelistEntry, WhitelistStore};
