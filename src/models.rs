// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Connector Data Model
//!
//! Core types exchanged between the page agent, the broker, and the approval
//! window. All types derive `Serialize`/`Deserialize` for the cross-context
//! messaging channel.
//!
//! ## Identifier Types
//!
//! - [`TabId`]: the browser tab a page agent lives in; the broker's request
//!   tables are keyed by it.
//! - [`RequestId`]: unique id for one approval cycle (UUID v4).
//! - [`RequestUid`]: per-broker monotonic counter guarding against stale
//!   signing decisions.
//! - [`WalletId`]: opaque wallet identifier owned by the wallet store.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::identity::WalletChecksum;

// =============================================================================
// Identifier Types
// =============================================================================

/// Browser tab identifier. One pending approval is allowed per tab.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct TabId(pub u32);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one approval cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    /// Mint a fresh request id.
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation uid for signing requests. A decision whose uid does not match
/// the currently pending request for its tab is stale and must be dropped.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct RequestUid(pub u64);

impl fmt::Display for RequestUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque wallet identifier, owned by the external wallet store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalletId(pub String);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WalletId {
    fn from(value: String) -> Self {
        WalletId(value)
    }
}

impl From<&str> for WalletId {
    fn from(value: &str) -> Self {
        WalletId(value.to_string())
    }
}

impl From<WalletId> for String {
    fn from(value: WalletId) -> Self {
        value.0
    }
}

// =============================================================================
// Protocol & Wallet Kind
// =============================================================================

/// Chain protocol a page agent speaks. Whitelist entries are keyed by
/// `(origin_url, protocol)`, so the same site may hold one authorization per
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Cardano,
    Ergo,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Cardano => write!(f, "cardano"),
            Protocol::Ergo => write!(f, "ergo"),
        }
    }
}

/// Which checksum algorithm a wallet's identity summary uses.
///
/// Legacy sequential wallets and modern wallets use non-interchangeable
/// algorithms. The kind is always passed explicitly; it is never inferred
/// from the shape of a wallet record downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    /// Older sequential wallets.
    Legacy,
    /// Current wallet scheme.
    Modern,
}

// =============================================================================
// Request Types
// =============================================================================

/// A pending site-connection approval. Created by the broker when a page
/// agent asks to connect; lives for one approval cycle and is destroyed on
/// decision or tab teardown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionRequest {
    /// Unique id for this approval cycle.
    pub request_id: RequestId,
    /// Tab the requesting page agent lives in.
    pub tab_id: TabId,
    /// Normalized origin of the requesting page (`scheme://host[:port]`).
    pub origin_url: String,
    /// Chain protocol the site wants access to.
    pub protocol: Protocol,
    /// Optional dApp-supplied identity the auth token is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_auth_id: Option<String>,
}

/// A pending transaction-signing approval. One active per popup; `uid`
/// prevents a stale or duplicate decision from being misapplied when a new
/// request supersedes this one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SigningRequest {
    /// Unique id for this approval cycle.
    pub request_id: RequestId,
    /// Tab the requesting page agent lives in.
    pub tab_id: TabId,
    /// Correlation uid checked against inbound decisions.
    pub uid: RequestUid,
    /// Opaque transaction description, rendered by the approval window.
    pub payload: serde_json::Value,
}

// =============================================================================
// Views
// =============================================================================

/// Wallet identity shown on the connect screen so the user can confirm
/// "this is the wallet I expect" before approving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletIdentitySummary {
    /// The wallet being summarized.
    pub wallet_id: WalletId,
    /// Human-chosen wallet name.
    pub display_name: String,
    /// Current balance in the protocol's smallest unit.
    pub balance: u64,
    /// Deterministic visual/textual fingerprint of the wallet's public key.
    pub checksum: WalletChecksum,
}

/// One currently-open page agent session. Independent of the whitelist: a
/// site can be connected in the current browser session without being
/// durably whitelisted, and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedSite {
    pub tab_id: TabId,
    pub origin_url: String,
    pub protocol: Protocol,
}

/// Read-only projection of all currently-open page agent sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectedSitesView {
    pub sites: Vec<ConnectedSite>,
}

// =============================================================================
// Origin Normalization
// =============================================================================

/// Reduce a raw page URL to the `scheme://host[:port]` form used as the
/// whitelist key. Path, query, and fragment are dropped. An origin that
/// fails to parse or has no host is rejected outright.
pub fn normalize_origin(raw: &str) -> Result<String, BridgeError> {
    let url = Url::parse(raw).map_err(|e| BridgeError::BadOrigin(format!("{raw}: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| BridgeError::BadOrigin(format!("{raw}: no host")))?;

    match url.port() {
        Some(port) => Ok(format!("{}://{host}:{port}", url.scheme())),
        None => Ok(format!("{}://{host}", url.scheme())),
    }
}
