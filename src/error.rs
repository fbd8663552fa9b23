// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bridge error taxonomy.
//!
//! Every error that crosses a trust boundary fails closed: a channel that
//! cannot be reached means the request is treated as rejected, a stale
//! decision is dropped, and a failed sign-and-broadcast is relayed as a
//! rejection payload. None of these are fatal to the broker itself.

use thiserror::Error;

use crate::models::TabId;
use crate::storage::StorageError;
use crate::wallets::WalletStoreError;

/// Errors raised by the connector bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The messaging channel to a page agent could not be reached (tab
    /// closed or navigated away). Treated as an implicit rejection.
    #[error("channel to tab {tab_id} unreachable")]
    Channel { tab_id: TabId },

    /// Whitelist persistence is unavailable. The connect flow still
    /// completes in-memory without durable whitelisting.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A decision arrived whose uid/tab no longer matches the active
    /// request. Dropped silently, never user-visible.
    #[error("stale decision for tab {tab_id}")]
    StaleRequest { tab_id: TabId },

    /// The delegated sign-and-broadcast call failed. Relayed verbatim to
    /// the page agent as a rejection payload, never retried.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The external wallet store could not serve a request.
    #[error(transparent)]
    Wallet(#[from] WalletStoreError),

    /// An origin URL could not be parsed or has no host.
    #[error("invalid origin: {0}")]
    BadOrigin(String),
}
