// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Page-agent session registry.
//!
//! One [`AgentSession`] per open tab with an active page agent. Sessions are
//! browser-session-scoped and independent of the durable whitelist; the
//! connected-sites screen renders a snapshot of this registry.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::messages::AgentEvent;
use crate::models::{ConnectedSite, ConnectedSitesView, Protocol, TabId, WalletId};

/// Sending half of a page agent's event channel.
#[derive(Debug, Clone)]
pub struct AgentChannel {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentChannel {
    /// Create a channel pair. The receiver belongs to the page agent glue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns `false` when the receiving context is gone.
    pub(crate) fn send(&self, event: AgentEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// One live page-agent session.
#[derive(Debug)]
pub(crate) struct AgentSession {
    /// Normalized origin the agent registered with.
    pub origin_url: String,
    pub protocol: Protocol,
    /// Wallet this session was granted visibility of, once a connect flow
    /// has been accepted. Cleared on revocation.
    pub wallet_id: Option<WalletId>,
    pub channel: AgentChannel,
}

/// All live sessions, keyed by tab.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<TabId, AgentSession>,
}

impl SessionRegistry {
    /// Insert a session, returning the one it replaced (tab navigated).
    pub fn insert(&mut self, tab_id: TabId, session: AgentSession) -> Option<AgentSession> {
        self.sessions.insert(tab_id, session)
    }

    pub fn remove(&mut self, tab_id: TabId) -> Option<AgentSession> {
        self.sessions.remove(&tab_id)
    }

    pub fn get(&self, tab_id: TabId) -> Option<&AgentSession> {
        self.sessions.get(&tab_id)
    }

    pub fn get_mut(&mut self, tab_id: TabId) -> Option<&mut AgentSession> {
        self.sessions.get_mut(&tab_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TabId, &mut AgentSession)> {
        self.sessions.iter_mut()
    }

    /// Read-only projection for the connected-sites screen, ordered by tab.
    pub fn snapshot(&self) -> ConnectedSitesView {
        let mut sites: Vec<ConnectedSite> = self
            .sessions
            .iter()
            .map(|(tab_id, session)| ConnectedSite {
                tab_id: *tab_id,
                origin_url: session.origin_url.clone(),
                protocol: session.protocol,
            })
            .collect();
        sites.sort_by_key(|site| site.tab_id);
        ConnectedSitesView { sites }
    }
}
