// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Background Broker
//!
//! The trust boundary of the connector. The broker owns the in-flight
//! request tables (keyed by tab), decides whether a site is pre-authorized,
//! opens the approval window when it is not, and relays the final decision
//! back to the originating page agent. It is the only component that writes
//! the whitelist.
//!
//! ## Request Lifecycle
//!
//! Connect: `RECEIVED -> auto-approved (whitelist hit) -> RESPONDED`, or
//! `RECEIVED -> AWAITING_USER -> ACCEPTED|REJECTED -> RESPONDED`.
//! Sign: `PENDING -> CONFIRMED|REJECTED -> RESPONDED`. `RESPONDED` is
//! terminal; late decisions for an already-responded request are dropped.
//!
//! Signing is never auto-approved, even for whitelisted sites: connection
//! whitelisting authorizes visibility of wallet data, never unattended
//! signing.
//!
//! ## Failure Semantics
//!
//! A page agent that cannot be reached (tab closed, navigated away) is an
//! implicit rejection: logged, never retried, never fatal to the broker.

mod sessions;

pub use sessions::AgentChannel;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64ct::{Base64Unpadded, Encoding};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalLauncher;
use crate::error::BridgeError;
use crate::messages::{AgentEvent, ConnectorReply, ConnectorRequest};
use crate::models::{
    normalize_origin, ConnectedSitesView, ConnectionRequest, Protocol, RequestId, RequestUid,
    SigningRequest, TabId, WalletId,
};
use crate::storage::{WhitelistEntry, WhitelistStore};
use crate::wallets::WalletStore;

use sessions::{AgentSession, SessionRegistry};

/// How many terminal responses are remembered for duplicate detection.
const MAX_RESPONDED_HISTORY: usize = 64;

/// User decision on a connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    Accepted { wallet_id: WalletId },
    Rejected,
}

/// User decision on a signing request.
#[derive(Clone)]
pub enum SignDecision {
    Confirmed { password: String },
    Rejected,
}

/// Key identifying a terminal response in the bounded history.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RespondedKey {
    Connect(TabId),
    Sign(TabId, RequestUid),
}

/// Bounded log of recently-responded requests. Entries falling off the cap
/// are indistinguishable from never-seen ones; both are dropped without a
/// response, so exactly-once delivery holds either way.
#[derive(Debug, Default)]
struct RespondedLog {
    entries: VecDeque<RespondedKey>,
}

impl RespondedLog {
    fn record(&mut self, key: RespondedKey) {
        self.entries.push_back(key);
        while self.entries.len() > MAX_RESPONDED_HISTORY {
            self.entries.pop_front();
        }
    }

    fn contains(&self, key: &RespondedKey) -> bool {
        self.entries.contains(key)
    }
}

/// The background broker. One logical actor shared by all tabs; request
/// tables are keyed by tab so concurrent flows never cross-talk.
pub struct Broker {
    whitelist: Arc<WhitelistStore>,
    wallets: Arc<dyn WalletStore>,
    launcher: Arc<dyn ApprovalLauncher>,
    sessions: RwLock<SessionRegistry>,
    pending_connects: Mutex<HashMap<TabId, ConnectionRequest>>,
    pending_signs: Mutex<HashMap<TabId, SigningRequest>>,
    responded: Mutex<RespondedLog>,
    next_uid: AtomicU64,
    token_secret: [u8; 32],
    shutdown: CancellationToken,
}

impl Broker {
    /// Create a broker over the given collaborators. The auth-token secret
    /// is freshly generated; tokens do not survive a broker restart, but
    /// whitelist entries (which carry the minted token) do.
    pub fn new(
        whitelist: Arc<WhitelistStore>,
        wallets: Arc<dyn WalletStore>,
        launcher: Arc<dyn ApprovalLauncher>,
    ) -> Self {
        let mut token_secret = [0u8; 32];
        token_secret[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        token_secret[16..].copy_from_slice(Uuid::new_v4().as_bytes());

        Self {
            whitelist,
            wallets,
            launcher,
            sessions: RwLock::new(SessionRegistry::default()),
            pending_connects: Mutex::new(HashMap::new()),
            pending_signs: Mutex::new(HashMap::new()),
            responded: Mutex::new(RespondedLog::default()),
            next_uid: AtomicU64::new(1),
            token_secret,
            shutdown: CancellationToken::new(),
        }
    }

    // ========== Session Lifecycle ==========

    /// A page agent opened in `tab_id`. Re-registering a tab replaces the
    /// previous session (tab navigated); any request pending for the old
    /// session is discarded without a response, since its channel is gone.
    pub async fn register_agent(
        &self,
        tab_id: TabId,
        origin_url: &str,
        protocol: Protocol,
        channel: AgentChannel,
    ) -> Result<(), BridgeError> {
        let origin_url = normalize_origin(origin_url)?;
        tracing::info!(%tab_id, origin = %origin_url, %protocol, "page agent registered");

        let replaced = self.sessions.write().await.insert(
            tab_id,
            AgentSession {
                origin_url,
                protocol,
                wallet_id: None,
                channel,
            },
        );

        if replaced.is_some() {
            self.discard_pending(tab_id).await;
        }
        Ok(())
    }

    /// The tab closed. Cancels any in-flight request for it (implicit
    /// rejection; there is no channel left to answer on).
    pub async fn unregister_agent(&self, tab_id: TabId) {
        self.sessions.write().await.remove(tab_id);
        self.discard_pending(tab_id).await;
        tracing::info!(%tab_id, "page agent unregistered");
    }

    async fn discard_pending(&self, tab_id: TabId) {
        if self.pending_connects.lock().await.remove(&tab_id).is_some() {
            tracing::debug!(%tab_id, "pending connect discarded with session");
        }
        if self.pending_signs.lock().await.remove(&tab_id).is_some() {
            tracing::debug!(%tab_id, "pending sign discarded with session");
        }
    }

    // ========== Connect Flow ==========

    /// A page agent asks to connect. Whitelist hit answers immediately with
    /// the stored token and never opens the approval window; a miss parks
    /// the request in `AWAITING_USER` and signals the window to open. Only
    /// one pending approval per tab: a newer request rejects and replaces an
    /// older one.
    pub async fn handle_connect(
        &self,
        tab_id: TabId,
        app_auth_id: Option<String>,
    ) -> Result<(), BridgeError> {
        let (origin_url, protocol) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(tab_id)
                .ok_or(BridgeError::Channel { tab_id })?;
            (session.origin_url.clone(), session.protocol)
        };

        if self.shutdown.is_cancelled() {
            tracing::warn!(%tab_id, "connect during shutdown rejected");
            self.send_to_agent(tab_id, rejected_connect(tab_id)).await;
            return Ok(());
        }

        // Storage trouble fails closed: prompt the user instead.
        let hit = match self.whitelist.find_for(&origin_url, protocol) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, origin = %origin_url, "whitelist lookup failed, prompting user");
                None
            }
        };

        if let Some(entry) = hit {
            self.authorize_session(tab_id, entry.wallet_id.clone()).await;
            self.responded
                .lock()
                .await
                .record(RespondedKey::Connect(tab_id));
            self.send_to_agent(
                tab_id,
                AgentEvent::ConnectResponse {
                    accepted: true,
                    wallet_id: Some(entry.wallet_id),
                    auth_token: Some(entry.auth_token),
                    tab_id,
                },
            )
            .await;
            tracing::info!(%tab_id, origin = %origin_url, %protocol, "connect auto-approved from whitelist");
            return Ok(());
        }

        let request = ConnectionRequest {
            request_id: RequestId::generate(),
            tab_id,
            origin_url: origin_url.clone(),
            protocol,
            app_auth_id,
        };

        {
            let mut pending = self.pending_connects.lock().await;
            if let Some(old) = pending.remove(&tab_id) {
                tracing::info!(%tab_id, old_request = %old.request_id, "pending connect superseded, rejecting it");
                self.responded
                    .lock()
                    .await
                    .record(RespondedKey::Connect(tab_id));
                self.send_to_agent(tab_id, rejected_connect(tab_id)).await;
            }
            pending.insert(tab_id, request);
        }

        self.launcher.open_connect_window(tab_id);
        tracing::info!(%tab_id, origin = %origin_url, %protocol, "connect awaiting user");
        Ok(())
    }

    /// Apply the user's connect decision. On acceptance a fresh auth token
    /// is minted and durably whitelisted; a storage failure is returned to
    /// the caller (approval window shows a generic failure) but the connect
    /// flow still completes in-memory. A decision with no matching pending
    /// request is dropped silently.
    pub async fn resolve_connect(
        &self,
        tab_id: TabId,
        decision: ConnectDecision,
    ) -> Result<(), BridgeError> {
        let Some(request) = self.pending_connects.lock().await.remove(&tab_id) else {
            let duplicate = self
                .responded
                .lock()
                .await
                .contains(&RespondedKey::Connect(tab_id));
            tracing::debug!(%tab_id, duplicate, "connect decision without pending request dropped");
            return Ok(());
        };

        self.responded
            .lock()
            .await
            .record(RespondedKey::Connect(tab_id));

        match decision {
            ConnectDecision::Accepted { wallet_id } => {
                let auth_token = self.mint_auth_token(&wallet_id, request.app_auth_id.as_deref());

                let persisted = self.persist_approval(&request, &wallet_id, &auth_token);
                if let Err(e) = &persisted {
                    tracing::warn!(
                        error = %e,
                        origin = %request.origin_url,
                        "whitelist write failed; access granted for this session only"
                    );
                }

                self.authorize_session(tab_id, wallet_id.clone()).await;
                self.send_to_agent(
                    tab_id,
                    AgentEvent::ConnectResponse {
                        accepted: true,
                        wallet_id: Some(wallet_id),
                        auth_token: Some(auth_token),
                        tab_id,
                    },
                )
                .await;
                tracing::info!(%tab_id, request_id = %request.request_id, origin = %request.origin_url, "connect accepted");
                persisted.map_err(BridgeError::from)
            }
            ConnectDecision::Rejected => {
                self.send_to_agent(tab_id, rejected_connect(tab_id)).await;
                tracing::info!(%tab_id, request_id = %request.request_id, origin = %request.origin_url, "connect rejected");
                Ok(())
            }
        }
    }

    /// Read-modify-write of the whitelist record, replacing any previous
    /// entry for the same `(origin_url, protocol)`.
    fn persist_approval(
        &self,
        request: &ConnectionRequest,
        wallet_id: &WalletId,
        auth_token: &str,
    ) -> Result<(), crate::storage::StorageError> {
        let mut entries = self.whitelist.list()?;
        entries.retain(|entry| {
            !(entry.origin_url == request.origin_url && entry.protocol == request.protocol)
        });
        entries.push(WhitelistEntry {
            origin_url: request.origin_url.clone(),
            protocol: request.protocol,
            wallet_id: wallet_id.clone(),
            app_auth_id: request.app_auth_id.clone(),
            auth_token: auth_token.to_string(),
            created_at: Utc::now(),
        });
        self.whitelist.replace(entries)
    }

    // ========== Sign Flow ==========

    /// A page agent asks for a transaction signature. Always requires the
    /// user: whitelisting covers visibility, never unattended signing. A
    /// site whose session was never granted a wallet is refused outright.
    /// Returns the uid the page agent correlates the eventual response with.
    pub async fn handle_sign(
        &self,
        tab_id: TabId,
        payload: serde_json::Value,
    ) -> Result<RequestUid, BridgeError> {
        let authorized = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(tab_id)
                .ok_or(BridgeError::Channel { tab_id })?;
            session.wallet_id.is_some()
        };

        let uid = RequestUid(self.next_uid.fetch_add(1, Ordering::Relaxed));

        if !authorized || self.shutdown.is_cancelled() {
            tracing::warn!(%tab_id, %uid, "sign request refused (no authorized session)");
            self.responded
                .lock()
                .await
                .record(RespondedKey::Sign(tab_id, uid));
            self.send_to_agent(
                tab_id,
                AgentEvent::SignResponse {
                    uid,
                    tab_id,
                    ok: false,
                    tx_id: None,
                    error: Some("origin not authorized".to_string()),
                },
            )
            .await;
            return Ok(uid);
        }

        let request = SigningRequest {
            request_id: RequestId::generate(),
            tab_id,
            uid,
            payload,
        };

        {
            let mut pending = self.pending_signs.lock().await;
            if let Some(old) = pending.remove(&tab_id) {
                tracing::info!(%tab_id, old_uid = %old.uid, "pending sign superseded, rejecting it");
                self.responded
                    .lock()
                    .await
                    .record(RespondedKey::Sign(tab_id, old.uid));
                self.send_to_agent(tab_id, rejected_sign(tab_id, old.uid)).await;
            }
            pending.insert(tab_id, request);
        }

        self.launcher.open_sign_window(tab_id);
        tracing::info!(%tab_id, %uid, "sign awaiting user");
        Ok(uid)
    }

    /// Apply the user's signing decision. The uid must match the currently
    /// pending request for the tab; mismatches are stale and dropped
    /// silently. On confirmation the payload is signed and broadcast by the
    /// wallet store; failures are relayed to the page agent as a terminal
    /// error payload and never retried here.
    pub async fn resolve_sign(
        &self,
        tab_id: TabId,
        uid: RequestUid,
        decision: SignDecision,
    ) -> Result<(), BridgeError> {
        let request = {
            let mut pending = self.pending_signs.lock().await;
            match pending.get(&tab_id) {
                Some(active) if active.uid == uid => pending.remove(&tab_id),
                Some(active) => {
                    tracing::debug!(%tab_id, got = %uid, active = %active.uid, "stale sign decision dropped");
                    return Ok(());
                }
                None => {
                    let duplicate = self
                        .responded
                        .lock()
                        .await
                        .contains(&RespondedKey::Sign(tab_id, uid));
                    tracing::debug!(%tab_id, %uid, duplicate, "sign decision without pending request dropped");
                    return Ok(());
                }
            }
        };
        let Some(request) = request else {
            return Ok(());
        };

        self.responded
            .lock()
            .await
            .record(RespondedKey::Sign(tab_id, uid));

        match decision {
            SignDecision::Confirmed { password } => {
                let wallet_id = {
                    let sessions = self.sessions.read().await;
                    sessions.get(tab_id).and_then(|s| s.wallet_id.clone())
                };
                let Some(wallet_id) = wallet_id else {
                    tracing::warn!(%tab_id, %uid, "sign confirmed but session lost its authorization");
                    self.send_to_agent(
                        tab_id,
                        AgentEvent::SignResponse {
                            uid,
                            tab_id,
                            ok: false,
                            tx_id: None,
                            error: Some("origin not authorized".to_string()),
                        },
                    )
                    .await;
                    return Ok(());
                };

                match self
                    .wallets
                    .sign_and_broadcast(&wallet_id, &request.payload, &password)
                    .await
                {
                    Ok(tx_id) => {
                        tracing::info!(%tab_id, %uid, %tx_id, "sign confirmed and broadcast");
                        self.send_to_agent(
                            tab_id,
                            AgentEvent::SignResponse {
                                uid,
                                tab_id,
                                ok: true,
                                tx_id: Some(tx_id),
                                error: None,
                            },
                        )
                        .await;
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(%tab_id, %uid, error = %e, "sign-and-broadcast failed, relaying");
                        self.send_to_agent(
                            tab_id,
                            AgentEvent::SignResponse {
                                uid,
                                tab_id,
                                ok: false,
                                tx_id: None,
                                error: Some(e.to_string()),
                            },
                        )
                        .await;
                        Err(BridgeError::Signing(e.to_string()))
                    }
                }
            }
            SignDecision::Rejected => {
                tracing::info!(%tab_id, %uid, "sign rejected");
                self.send_to_agent(tab_id, rejected_sign(tab_id, uid)).await;
                Ok(())
            }
        }
    }

    /// Reject whatever request is pending for the tab, sign first. The
    /// approval window's unload hook routes through here so no page agent
    /// is ever left hanging.
    pub async fn reject_pending(&self, tab_id: TabId) {
        let sign_uid = self
            .pending_signs
            .lock()
            .await
            .get(&tab_id)
            .map(|request| request.uid);
        if let Some(uid) = sign_uid {
            let _ = self.resolve_sign(tab_id, uid, SignDecision::Rejected).await;
            return;
        }
        let _ = self.resolve_connect(tab_id, ConnectDecision::Rejected).await;
    }

    // ========== Whitelist Management ==========

    /// Remove a site's durable authorization. Live sessions for that origin
    /// are stripped of their wallet grant and notified, forcing a fresh
    /// connect flow on their next call.
    pub async fn revoke_site(
        &self,
        origin_url: &str,
        protocol: Protocol,
    ) -> Result<(), BridgeError> {
        let origin_url = normalize_origin(origin_url)?;

        let mut entries = self.whitelist.list()?;
        let before = entries.len();
        entries.retain(|entry| !(entry.origin_url == origin_url && entry.protocol == protocol));
        let removed = before - entries.len();
        self.whitelist.replace(entries)?;

        let mut sessions = self.sessions.write().await;
        for (tab_id, session) in sessions.iter_mut() {
            if session.origin_url == origin_url && session.protocol == protocol {
                session.wallet_id = None;
                if !session.channel.send(AgentEvent::AuthorizationRevoked {
                    origin_url: origin_url.clone(),
                    protocol,
                }) {
                    tracing::warn!(tab_id = %tab_id, "revocation notice undeliverable");
                }
            }
        }

        tracing::info!(origin = %origin_url, %protocol, removed, "site authorization revoked");
        Ok(())
    }

    /// Read-only snapshot of live page-agent sessions.
    pub async fn list_connected_sites(&self) -> ConnectedSitesView {
        self.sessions.read().await.snapshot()
    }

    // ========== Approval Window Support ==========

    /// Pending connection request for a tab, if any. Repeated reads return
    /// the same request until it is resolved or superseded.
    pub async fn peek_pending_connect(&self, tab_id: TabId) -> Option<ConnectionRequest> {
        self.pending_connects.lock().await.get(&tab_id).cloned()
    }

    /// Pending signing request for a tab, if any.
    pub async fn peek_pending_sign(&self, tab_id: TabId) -> Option<SigningRequest> {
        self.pending_signs.lock().await.get(&tab_id).cloned()
    }

    /// Protocol of the tab's live session, if any.
    pub async fn protocol_for(&self, tab_id: TabId) -> Option<Protocol> {
        self.sessions.read().await.get(tab_id).map(|s| s.protocol)
    }

    pub(crate) fn wallet_store(&self) -> &Arc<dyn WalletStore> {
        &self.wallets
    }

    pub(crate) fn close_approval_window(&self, tab_id: TabId) {
        self.launcher.close_window(tab_id);
    }

    // ========== Shutdown ==========

    /// Reject every in-flight request and refuse new ones. Used on
    /// extension reload so no page agent waits on a broker that is gone.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let connects: Vec<TabId> = self.pending_connects.lock().await.drain().map(|(t, _)| t).collect();
        for tab_id in connects {
            self.responded
                .lock()
                .await
                .record(RespondedKey::Connect(tab_id));
            self.send_to_agent(tab_id, rejected_connect(tab_id)).await;
        }

        let signs: Vec<(TabId, RequestUid)> = self
            .pending_signs
            .lock()
            .await
            .drain()
            .map(|(tab_id, request)| (tab_id, request.uid))
            .collect();
        for (tab_id, uid) in signs {
            self.responded
                .lock()
                .await
                .record(RespondedKey::Sign(tab_id, uid));
            self.send_to_agent(tab_id, rejected_sign(tab_id, uid)).await;
        }

        tracing::info!("broker shut down, all pending requests rejected");
    }

    // ========== Message Contract ==========

    /// Dispatch one envelope from a trusted extension context.
    pub async fn handle_envelope(
        &self,
        request: ConnectorRequest,
    ) -> Result<ConnectorReply, BridgeError> {
        match request {
            ConnectorRequest::ConnectRetrieveData { tab_id } => {
                Ok(ConnectorReply::ConnectionRequestData {
                    request: self.peek_pending_connect(tab_id).await,
                })
            }
            ConnectorRequest::ConnectResponse {
                accepted,
                wallet_id,
                tab_id,
            } => {
                let decision = match (accepted, wallet_id) {
                    (true, Some(wallet_id)) => ConnectDecision::Accepted { wallet_id },
                    (true, None) => {
                        tracing::warn!(%tab_id, "accepted connect without wallet, failing closed");
                        ConnectDecision::Rejected
                    }
                    (false, _) => ConnectDecision::Rejected,
                };
                self.resolve_connect(tab_id, decision).await?;
                Ok(ConnectorReply::Ok)
            }
            ConnectorRequest::TxSignWindowRetrieveData { tab_id } => {
                Ok(ConnectorReply::SigningRequestData {
                    request: self.peek_pending_sign(tab_id).await,
                })
            }
            ConnectorRequest::SignConfirmed {
                uid,
                tab_id,
                password,
            } => {
                self.resolve_sign(tab_id, uid, SignDecision::Confirmed { password })
                    .await?;
                Ok(ConnectorReply::Ok)
            }
            ConnectorRequest::SignRejected { uid, tab_id } => {
                self.resolve_sign(tab_id, uid, SignDecision::Rejected).await?;
                Ok(ConnectorReply::Ok)
            }
            ConnectorRequest::GetConnectedSites => Ok(ConnectorReply::ConnectedSites {
                view: self.list_connected_sites().await,
            }),
            ConnectorRequest::RemoveWalletFromWhitelist {
                origin_url,
                protocol,
            } => {
                self.revoke_site(&origin_url, protocol).await?;
                Ok(ConnectorReply::Ok)
            }
            ConnectorRequest::GetProtocol { tab_id } => self
                .protocol_for(tab_id)
                .await
                .map(|protocol| ConnectorReply::Protocol { protocol })
                .ok_or(BridgeError::Channel { tab_id }),
        }
    }

    // ========== Internals ==========

    async fn authorize_session(&self, tab_id: TabId, wallet_id: WalletId) {
        if let Some(session) = self.sessions.write().await.get_mut(tab_id) {
            session.wallet_id = Some(wallet_id);
        }
    }

    /// Deliver an event to a tab's page agent. An unreachable channel is an
    /// implicit rejection: logged, never retried.
    async fn send_to_agent(&self, tab_id: TabId, event: AgentEvent) -> bool {
        let delivered = {
            let sessions = self.sessions.read().await;
            sessions
                .get(tab_id)
                .map(|session| session.channel.send(event))
                .unwrap_or(false)
        };
        if !delivered {
            tracing::warn!(%tab_id, "page agent unreachable, response dropped");
        }
        delivered
    }

    /// Opaque token bound to the wallet identity and the dApp's auth id,
    /// with a fresh nonce per mint.
    fn mint_auth_token(&self, wallet_id: &WalletId, app_auth_id: Option<&str>) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.token_secret)
            .expect("hmac accepts keys of any length");
        mac.update(wallet_id.0.as_bytes());
        mac.update(b"\0");
        if let Some(app_auth_id) = app_auth_id {
            mac.update(app_auth_id.as_bytes());
        }
        mac.update(b"\0");
        mac.update(Uuid::new_v4().as_bytes());
        let tag: [u8; 32] = mac.finalize().into_bytes().into();
        Base64Unpadded::encode_string(&tag)
    }
}

fn rejected_connect(tab_id: TabId) -> AgentEvent {
    AgentEvent::ConnectResponse {
        accepted: false,
        wallet_id: None,
        auth_token: None,
        tab_id,
    }
}

fn rejected_sign(tab_id: TabId, uid: RequestUid) -> AgentEvent {
    AgentEvent::SignResponse {
        uid,
        tab_id,
        ok: false,
        tx_id: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WalletKind;
    use crate::storage::StoragePaths;
    use crate::wallets::{InMemoryWalletStore, WalletRecord};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PASSWORD: &str = "correct horse";

    #[derive(Default)]
    struct RecordingLauncher {
        connect_opens: StdMutex<Vec<TabId>>,
        sign_opens: StdMutex<Vec<TabId>>,
        closes: StdMutex<Vec<TabId>>,
    }

    impl RecordingLauncher {
        fn connect_opens(&self) -> Vec<TabId> {
            self.connect_opens.lock().unwrap().clone()
        }
        fn sign_opens(&self) -> Vec<TabId> {
            self.sign_opens.lock().unwrap().clone()
        }
        fn closes(&self) -> Vec<TabId> {
            self.closes.lock().unwrap().clone()
        }
    }

    impl ApprovalLauncher for RecordingLauncher {
        fn open_connect_window(&self, tab_id: TabId) {
            self.connect_opens.lock().unwrap().push(tab_id);
        }
        fn open_sign_window(&self, tab_id: TabId) {
            self.sign_opens.lock().unwrap().push(tab_id);
        }
        fn close_window(&self, tab_id: TabId) {
            self.closes.lock().unwrap().push(tab_id);
        }
    }

    fn wallet(id: &str, protocol: Protocol, kind: WalletKind) -> WalletRecord {
        WalletRecord {
            wallet_id: id.into(),
            display_name: format!("Wallet {id}"),
            protocol,
            kind,
            public_key: format!("pk-{id}").into_bytes(),
        }
    }

    struct Fixture {
        broker: Arc<Broker>,
        launcher: Arc<RecordingLauncher>,
        wallets: Arc<InMemoryWalletStore>,
        whitelist: Arc<WhitelistStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let whitelist = Arc::new(WhitelistStore::open(&StoragePaths::new(dir.path())).unwrap());

        let mut store = InMemoryWalletStore::new(PASSWORD);
        store.add_wallet(wallet("w1", Protocol::Cardano, WalletKind::Modern), 5_000_000);
        store.add_wallet(wallet("w2", Protocol::Ergo, WalletKind::Legacy), 700);
        let wallets = Arc::new(store);

        let launcher = Arc::new(RecordingLauncher::default());
        let broker = Arc::new(Broker::new(
            whitelist.clone(),
            wallets.clone(),
            launcher.clone(),
        ));
        Fixture {
            broker,
            launcher,
            wallets,
            whitelist,
            _dir: dir,
        }
    }

    async fn attach_agent(
        broker: &Broker,
        tab_id: TabId,
        origin: &str,
        protocol: Protocol,
    ) -> UnboundedReceiver<AgentEvent> {
        let (channel, rx) = AgentChannel::channel();
        broker
            .register_agent(tab_id, origin, protocol, channel)
            .await
            .unwrap();
        rx
    }

    fn expect_connect_response(rx: &mut UnboundedReceiver<AgentEvent>) -> (bool, Option<String>) {
        match rx.try_recv().expect("expected a connect response") {
            AgentEvent::ConnectResponse {
                accepted,
                auth_token,
                ..
            } => (accepted, auth_token),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn expect_sign_response(
        rx: &mut UnboundedReceiver<AgentEvent>,
    ) -> (RequestUid, bool, Option<String>, Option<String>) {
        match rx.try_recv().expect("expected a sign response") {
            AgentEvent::SignResponse {
                uid,
                ok,
                tx_id,
                error,
                ..
            } => (uid, ok, tx_id, error),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_connect_awaits_user() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example/swap", Protocol::Cardano).await;

        fx.broker.handle_connect(tab, None).await.unwrap();

        assert!(rx.try_recv().is_err(), "no response before the user decides");
        assert_eq!(fx.launcher.connect_opens(), vec![tab]);
        let pending = fx.broker.peek_pending_connect(tab).await.unwrap();
        assert_eq!(pending.origin_url, "https://dapp.example");
        assert_eq!(pending.protocol, Protocol::Cardano);
    }

    #[tokio::test]
    async fn accept_persists_entry_and_responds_with_token() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;

        fx.broker.handle_connect(tab, Some("app-1".into())).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();

        let (accepted, token) = expect_connect_response(&mut rx);
        assert!(accepted);
        let token = token.expect("accepted response carries a token");

        let entries = fx.whitelist.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin_url, "https://dapp.example");
        assert_eq!(entries[0].protocol, Protocol::Cardano);
        assert_eq!(entries[0].wallet_id, "w1".into());
        assert_eq!(entries[0].app_auth_id.as_deref(), Some("app-1"));
        assert_eq!(entries[0].auth_token, token);
    }

    #[tokio::test]
    async fn whitelisted_connect_auto_approves_without_ui() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let (_, first_token) = expect_connect_response(&mut rx);

        // Second connect from the same origin: no new window, same token.
        fx.broker.handle_connect(tab, None).await.unwrap();
        let (accepted, token) = expect_connect_response(&mut rx);
        assert!(accepted);
        assert_eq!(token, first_token);
        assert_eq!(fx.launcher.connect_opens().len(), 1);
    }

    #[tokio::test]
    async fn same_origin_other_protocol_still_prompts() {
        let fx = fixture();
        let tab_a = TabId(1);
        let mut rx_a = attach_agent(&fx.broker, tab_a, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab_a, None).await.unwrap();
        fx.broker
            .resolve_connect(tab_a, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx_a);

        let tab_b = TabId(2);
        let mut rx_b = attach_agent(&fx.broker, tab_b, "https://dapp.example", Protocol::Ergo).await;
        fx.broker.handle_connect(tab_b, None).await.unwrap();
        assert!(rx_b.try_recv().is_err());
        assert_eq!(fx.launcher.connect_opens(), vec![tab_a, tab_b]);
    }

    #[tokio::test]
    async fn reject_sends_response_and_skips_whitelist() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        fx.broker
            .resolve_connect(tab, ConnectDecision::Rejected)
            .await
            .unwrap();

        let (accepted, token) = expect_connect_response(&mut rx);
        assert!(!accepted);
        assert!(token.is_none());
        assert!(fx.whitelist.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_connect_decision_is_dropped() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        fx.broker
            .resolve_connect(tab, ConnectDecision::Rejected)
            .await
            .unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();

        let _ = expect_connect_response(&mut rx);
        assert!(rx.try_recv().is_err(), "exactly one terminal response");
        assert!(fx.whitelist.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_connect_supersedes_and_rejects_first() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;

        fx.broker.handle_connect(tab, None).await.unwrap();
        let first = fx.broker.peek_pending_connect(tab).await.unwrap();

        fx.broker.handle_connect(tab, None).await.unwrap();
        let (accepted, _) = expect_connect_response(&mut rx);
        assert!(!accepted, "superseded request is rejected first");

        let second = fx.broker.peek_pending_connect(tab).await.unwrap();
        assert_ne!(first.request_id, second.request_id);
    }

    #[tokio::test]
    async fn revoke_forces_fresh_prompt_and_notifies_agent() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        fx.broker
            .revoke_site("https://dapp.example", Protocol::Cardano)
            .await
            .unwrap();

        assert!(fx.whitelist.list().unwrap().is_empty());
        match rx.try_recv().unwrap() {
            AgentEvent::AuthorizationRevoked { origin_url, protocol } => {
                assert_eq!(origin_url, "https://dapp.example");
                assert_eq!(protocol, Protocol::Cardano);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Next connect must traverse the approval window again.
        fx.broker.handle_connect(tab, None).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(fx.launcher.connect_opens().len(), 2);
    }

    #[tokio::test]
    async fn sign_is_never_auto_approved() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        fx.broker
            .handle_sign(tab, json!({"amount": "12"}))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err(), "whitelisted or not, signing waits for the user");
        assert_eq!(fx.launcher.sign_opens(), vec![tab]);
    }

    #[tokio::test]
    async fn sign_from_unconnected_site_is_refused() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;

        let uid = fx.broker.handle_sign(tab, json!({})).await.unwrap();

        let (got_uid, ok, _, error) = expect_sign_response(&mut rx);
        assert_eq!(got_uid, uid);
        assert!(!ok);
        assert_eq!(error.as_deref(), Some("origin not authorized"));
        assert!(fx.launcher.sign_opens().is_empty());
    }

    #[tokio::test]
    async fn sign_confirm_broadcasts_and_relays_tx_id() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        let uid = fx.broker.handle_sign(tab, json!({"to": "addr1"})).await.unwrap();
        fx.broker
            .resolve_sign(tab, uid, SignDecision::Confirmed { password: PASSWORD.into() })
            .await
            .unwrap();

        let (got_uid, ok, tx_id, error) = expect_sign_response(&mut rx);
        assert_eq!(got_uid, uid);
        assert!(ok);
        assert!(tx_id.is_some());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn stale_sign_uid_is_dropped_silently() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        let uid = fx.broker.handle_sign(tab, json!({})).await.unwrap();

        fx.broker
            .resolve_sign(tab, RequestUid(uid.0 + 100), SignDecision::Rejected)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "stale uid produces no response");
        assert!(fx.broker.peek_pending_sign(tab).await.is_some());

        fx.broker
            .resolve_sign(tab, uid, SignDecision::Rejected)
            .await
            .unwrap();
        let (_, ok, _, error) = expect_sign_response(&mut rx);
        assert!(!ok);
        assert!(error.is_none(), "user rejection carries no error payload");
        assert!(rx.try_recv().is_err(), "exactly one terminal response");
    }

    #[tokio::test]
    async fn broadcast_failure_is_relayed_not_retried() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        let uid = fx.broker.handle_sign(tab, json!({})).await.unwrap();
        fx.wallets.fail_next_broadcast("mempool full");

        let result = fx.broker
            .resolve_sign(tab, uid, SignDecision::Confirmed { password: PASSWORD.into() })
            .await;
        assert!(matches!(result, Err(BridgeError::Signing(_))));

        let (_, ok, tx_id, error) = expect_sign_response(&mut rx);
        assert!(!ok);
        assert!(tx_id.is_none());
        assert!(error.unwrap().contains("mempool full"));
        assert!(rx.try_recv().is_err(), "failure is terminal, nothing follows");
    }

    #[tokio::test]
    async fn wrong_password_relayed_as_error_payload() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx);

        let uid = fx.broker.handle_sign(tab, json!({})).await.unwrap();
        let result = fx.broker
            .resolve_sign(tab, uid, SignDecision::Confirmed { password: "nope".into() })
            .await;
        assert!(matches!(result, Err(BridgeError::Signing(_))));

        let (_, ok, _, error) = expect_sign_response(&mut rx);
        assert!(!ok);
        assert!(error.unwrap().contains("password"));
    }

    #[tokio::test]
    async fn tabs_resolve_independently() {
        let fx = fixture();
        let tab_a = TabId(1);
        let tab_b = TabId(2);
        let mut rx_a = attach_agent(&fx.broker, tab_a, "https://a.example", Protocol::Cardano).await;
        let mut rx_b = attach_agent(&fx.broker, tab_b, "https://b.example", Protocol::Cardano).await;

        fx.broker.handle_connect(tab_a, None).await.unwrap();
        fx.broker.handle_connect(tab_b, None).await.unwrap();

        fx.broker
            .resolve_connect(tab_a, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();

        let (accepted, _) = expect_connect_response(&mut rx_a);
        assert!(accepted);
        assert!(rx_b.try_recv().is_err(), "tab B untouched by tab A's decision");
        assert!(fx.broker.peek_pending_connect(tab_b).await.is_some());
    }

    #[tokio::test]
    async fn unregister_discards_pending_without_response() {
        let fx = fixture();
        let tab = TabId(1);
        let _rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        fx.broker.unregister_agent(tab).await;
        assert!(fx.broker.peek_pending_connect(tab).await.is_none());

        // A late decision for the gone tab is a silent no-op.
        fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        assert!(fx.whitelist.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_every_pending_request() {
        let fx = fixture();
        let tab_a = TabId(1);
        let tab_b = TabId(2);
        let mut rx_a = attach_agent(&fx.broker, tab_a, "https://a.example", Protocol::Cardano).await;
        let mut rx_b = attach_agent(&fx.broker, tab_b, "https://b.example", Protocol::Cardano).await;

        fx.broker.handle_connect(tab_a, None).await.unwrap();
        fx.broker.handle_connect(tab_b, None).await.unwrap();
        fx.broker
            .resolve_connect(tab_b, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await
            .unwrap();
        let _ = expect_connect_response(&mut rx_b);
        fx.broker.handle_sign(tab_b, json!({})).await.unwrap();

        fx.broker.shutdown().await;

        let (accepted, _) = expect_connect_response(&mut rx_a);
        assert!(!accepted);
        let (_, ok, _, _) = expect_sign_response(&mut rx_b);
        assert!(!ok);
    }

    #[tokio::test]
    async fn storage_failure_still_completes_connect_in_memory() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        // Break the record path: replace the connector directory with a file
        // so the temp-file write fails.
        let connector = StoragePaths::new(fx._dir.path()).connector_dir();
        std::fs::remove_dir_all(&connector).unwrap();
        std::fs::write(&connector, b"").unwrap();

        let result = fx.broker
            .resolve_connect(tab, ConnectDecision::Accepted { wallet_id: "w1".into() })
            .await;
        assert!(matches!(result, Err(BridgeError::Storage(_))));

        // The page agent still got its acceptance for this session.
        let (accepted, token) = expect_connect_response(&mut rx);
        assert!(accepted);
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn auth_tokens_are_unique_per_mint() {
        let fx = fixture();
        let a = fx.broker.mint_auth_token(&"w1".into(), Some("app"));
        let b = fx.broker.mint_auth_token(&"w1".into(), Some("app"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn envelope_dispatch_covers_the_contract() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Ergo).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        let reply = fx.broker
            .handle_envelope(ConnectorRequest::ConnectRetrieveData { tab_id: tab })
            .await
            .unwrap();
        match reply {
            ConnectorReply::ConnectionRequestData { request } => {
                assert_eq!(request.unwrap().origin_url, "https://dapp.example");
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = fx.broker
            .handle_envelope(ConnectorRequest::ConnectResponse {
                accepted: true,
                wallet_id: Some("w2".into()),
                tab_id: tab,
            })
            .await
            .unwrap();
        assert_eq!(reply, ConnectorReply::Ok);
        let (accepted, _) = expect_connect_response(&mut rx);
        assert!(accepted);

        let reply = fx.broker
            .handle_envelope(ConnectorRequest::GetProtocol { tab_id: tab })
            .await
            .unwrap();
        assert_eq!(
            reply,
            ConnectorReply::Protocol {
                protocol: Protocol::Ergo
            }
        );

        let reply = fx.broker
            .handle_envelope(ConnectorRequest::GetConnectedSites)
            .await
            .unwrap();
        match reply {
            ConnectorReply::ConnectedSites { view } => assert_eq!(view.sites.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = fx.broker
            .handle_envelope(ConnectorRequest::RemoveWalletFromWhitelist {
                origin_url: "https://dapp.example".into(),
                protocol: Protocol::Ergo,
            })
            .await
            .unwrap();
        assert_eq!(reply, ConnectorReply::Ok);
        assert!(fx.whitelist.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_envelope_without_wallet_fails_closed() {
        let fx = fixture();
        let tab = TabId(1);
        let mut rx = attach_agent(&fx.broker, tab, "https://dapp.example", Protocol::Cardano).await;
        fx.broker.handle_connect(tab, None).await.unwrap();

        fx.broker
            .handle_envelope(ConnectorRequest::ConnectResponse {
                accepted: true,
                wallet_id: None,
                tab_id: tab,
            })
            .await
            .unwrap();

        let (accepted, _) = expect_connect_response(&mut rx);
        assert!(!accepted);
        assert!(fx.whitelist.list().unwrap().is_empty());
    }
}
