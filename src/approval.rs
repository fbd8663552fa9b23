// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Approval window controller.
//!
//! One controller per user-facing decision. It retrieves the pending request
//! from the broker, prepares the wallet list for the screen, and forwards
//! the user's decision. If the window is dismissed without a decision (the
//! user closes it via the window chrome), the controller's drop hook
//! synthesizes a rejection so the page agent is never left hanging.
//!
//! Two listing policies live here and must not be conflated: the connect
//! screen only offers wallets matching the requesting site's protocol; the
//! connected-sites management screen shows all wallets.

use std::sync::Arc;

use crate::broker::{Broker, ConnectDecision, SignDecision};
use crate::error::BridgeError;
use crate::identity::checksum_for;
use crate::models::{
    ConnectionRequest, RequestUid, SigningRequest, TabId, WalletIdentitySummary,
};
use crate::wallets::WalletRecord;

/// How the broker asks the host to open an approval window, and how the
/// controller closes it after a decision. Implemented by the embedding
/// extension; tests use a recording fake.
pub trait ApprovalLauncher: Send + Sync {
    fn open_connect_window(&self, tab_id: TabId);
    fn open_sign_window(&self, tab_id: TabId);
    fn close_window(&self, tab_id: TabId);
}

/// Controller for one approval window, bound to the tab whose request it
/// decides. Dropping it without a decision rejects the pending request.
pub struct ApprovalController {
    broker: Arc<Broker>,
    tab_id: TabId,
    decided: bool,
}

impl ApprovalController {
    /// Attach to the window opened for `tab_id`.
    pub fn attach(broker: Arc<Broker>, tab_id: TabId) -> Self {
        tracing::debug!(%tab_id, "approval controller attached");
        Self {
            broker,
            tab_id,
            decided: false,
        }
    }

    /// Pending connection request for this window's tab. Repeated reads
    /// return the same request until the broker resolves or supersedes it.
    pub async fn fetch_pending_connect(&self) -> Option<ConnectionRequest> {
        self.broker.peek_pending_connect(self.tab_id).await
    }

    /// Pending signing request for this window's tab.
    pub async fn fetch_pending_sign(&self) -> Option<SigningRequest> {
        self.broker.peek_pending_sign(self.tab_id).await
    }

    /// Wallets offered on the connect screen: only those matching the
    /// pending request's protocol, enriched with balance and checksum.
    pub async fn connect_wallet_choices(
        &self,
    ) -> Result<Vec<WalletIdentitySummary>, BridgeError> {
        let Some(request) = self.fetch_pending_connect().await else {
            return Ok(Vec::new());
        };

        let records = self.broker.wallet_store().list_wallets()?;
        records
            .into_iter()
            .filter(|record| record.protocol == request.protocol)
            .map(|record| self.summarize(record))
            .collect()
    }

    /// Wallets shown on the management screen: all of them, regardless of
    /// protocol.
    pub async fn management_wallets(&self) -> Result<Vec<WalletIdentitySummary>, BridgeError> {
        let records = self.broker.wallet_store().list_wallets()?;
        records
            .into_iter()
            .map(|record| self.summarize(record))
            .collect()
    }

    fn summarize(&self, record: WalletRecord) -> Result<WalletIdentitySummary, BridgeError> {
        let balance = self.broker.wallet_store().balance(&record.wallet_id)?;
        let checksum = checksum_for(&record.public_key, record.kind);
        Ok(WalletIdentitySummary {
            wallet_id: record.wallet_id,
            display_name: record.display_name,
            balance,
            checksum,
        })
    }

    /// Forward the user's connect decision and close the window. Terminal.
    pub async fn submit_connect_decision(
        mut self,
        decision: ConnectDecision,
    ) -> Result<(), BridgeError> {
        self.decided = true;
        let result = self.broker.resolve_connect(self.tab_id, decision).await;
        self.broker.close_approval_window(self.tab_id);
        result
    }

    /// Forward the user's signing decision and close the window. Terminal.
    pub async fn submit_sign_decision(
        mut self,
        uid: RequestUid,
        decision: SignDecision,
    ) -> Result<(), BridgeError> {
        self.decided = true;
        let result = self.broker.resolve_sign(self.tab_id, uid, decision).await;
        self.broker.close_approval_window(self.tab_id);
        result
    }

    /// The unload hook: the window was dismissed without an explicit
    /// decision. Rejects whatever is pending for the tab. The window is
    /// already closing, so no close is issued.
    pub async fn dismissed(mut self) {
        self.decided = true;
        tracing::info!(tab_id = %self.tab_id, "approval window dismissed, rejecting pending request");
        self.broker.reject_pending(self.tab_id).await;
    }
}

impl Drop for ApprovalController {
    /// Backstop for hosts that drop the controller instead of calling
    /// [`ApprovalController::dismissed`]. Needs a running runtime to
    /// deliver the rejection.
    fn drop(&mut self) {
        if self.decided {
            return;
        }
        let broker = self.broker.clone();
        let tab_id = self.tab_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    broker.reject_pending(tab_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(%tab_id, "controller dropped outside a runtime; pending request not rejected");
            }
        }
    }
}
