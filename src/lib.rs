// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! dApp Connector Bridge
//!
//! This crate implements the trust boundary between untrusted dApp pages and
//! the wallet: it brokers per-site connection approvals, persists them to a
//! whitelist, and coordinates per-transaction signing decisions. The page
//! agent and the approval window are external collaborators reached over
//! message channels; the broker is the only component allowed to persist a
//! site's access.
//!
//! ## Modules
//!
//! - `broker` - Background broker (per-request state, auto-approval, relays)
//! - `approval` - Approval window controller (one per user-facing decision)
//! - `storage` - Whitelist persistence (single wholesale JSON record)
//! - `identity` - Wallet checksum resolver (human-verifiable fingerprints)
//! - `wallets` - Narrow contract to the external wallet store
//! - `messages` - Cross-context message envelopes

pub mod approval;
pub mod broker;
pub mod config;
pub mod error;
pub mod identity;
pub mod messages;
pub mod models;
pub mod storage;
pub mod wallets;
