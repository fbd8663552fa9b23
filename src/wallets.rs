// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Narrow contract to the external wallet store.
//!
//! The bridge never touches key material or builds transactions; it only
//! needs "list wallets", "get balance", and "sign and broadcast". Listing
//! and balance are synchronous lookups; signing crosses into key handling
//! (password unlock, possibly a hardware device) and is asynchronous.
//!
//! [`InMemoryWalletStore`] is a complete in-process implementation used by
//! tests and by hosts that keep wallets in memory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Protocol, WalletId, WalletKind};

/// Errors from the external wallet store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletStoreError {
    #[error("wallet {0} not found")]
    UnknownWallet(WalletId),
    #[error("wrong spending password")]
    WrongPassword,
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// One wallet as the wallet store describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletRecord {
    pub wallet_id: WalletId,
    pub display_name: String,
    /// Chain the wallet belongs to. The connect screen only offers wallets
    /// matching the requesting site's protocol.
    pub protocol: Protocol,
    /// Which checksum algorithm identifies this wallet.
    pub kind: WalletKind,
    /// Public key the identity checksum is derived from.
    pub public_key: Vec<u8>,
}

/// Future returned by [`WalletStore::sign_and_broadcast`].
pub type SignFuture<'a> = Pin<Box<dyn Future<Output = Result<String, WalletStoreError>> + Send + 'a>>;

/// What the bridge requires from the wallet layer.
pub trait WalletStore: Send + Sync {
    /// All wallets, regardless of protocol.
    fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletStoreError>;

    /// Balance of one wallet, in the protocol's smallest unit.
    fn balance(&self, wallet_id: &WalletId) -> Result<u64, WalletStoreError>;

    /// Sign the payload with the wallet's key and broadcast. Resolves to the
    /// transaction id. The bridge relays failures verbatim and never retries.
    fn sign_and_broadcast(
        &self,
        wallet_id: &WalletId,
        payload: &serde_json::Value,
        password: &str,
    ) -> SignFuture<'_>;
}

/// In-memory wallet store.
#[derive(Default)]
pub struct InMemoryWalletStore {
    wallets: Vec<WalletRecord>,
    balances: HashMap<WalletId, u64>,
    password: String,
    /// When set, the next sign attempt fails broadcast with this message.
    broadcast_failure: Mutex<Option<String>>,
}

impl InMemoryWalletStore {
    /// Create an empty store guarded by the given spending password.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            wallets: Vec::new(),
            balances: HashMap::new(),
            password: password.into(),
            broadcast_failure: Mutex::new(None),
        }
    }

    /// Add a wallet with a starting balance.
    pub fn add_wallet(&mut self, record: WalletRecord, balance: u64) {
        self.balances.insert(record.wallet_id.clone(), balance);
        self.wallets.push(record);
    }

    /// Make the next broadcast fail with the given message.
    pub fn fail_next_broadcast(&self, message: impl Into<String>) {
        *self.failure_lock() = Some(message.into());
    }

    fn failure_lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.broadcast_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WalletStore for InMemoryWalletStore {
    fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletStoreError> {
        Ok(self.wallets.clone())
    }

    fn balance(&self, wallet_id: &WalletId) -> Result<u64, WalletStoreError> {
        self.balances
            .get(wallet_id)
            .copied()
            .ok_or_else(|| WalletStoreError::UnknownWallet(wallet_id.clone()))
    }

    fn sign_and_broadcast(
        &self,
        wallet_id: &WalletId,
        _payload: &serde_json::Value,
        password: &str,
    ) -> SignFuture<'_> {
        let wallet_id = wallet_id.clone();
        let password = password.to_string();
        Box::pin(async move {
            if !self.balances.contains_key(&wallet_id) {
                return Err(WalletStoreError::UnknownWallet(wallet_id));
            }
            if password != self.password {
                return Err(WalletStoreError::WrongPassword);
            }
            if let Some(message) = self.failure_lock().take() {
                return Err(WalletStoreError::Broadcast(message));
            }
            Ok(Uuid::new_v4().to_string())
        })
    }
}
