// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cross-context message envelopes.
//!
//! The broker exchanges these over the extension's messaging channel with
//! the approval window and the management screens ([`ConnectorRequest`] /
//! [`ConnectorReply`]) and delivers terminal outcomes to page agents as
//! [`AgentEvent`]s. Envelopes are externally observable wire shapes; field
//! and tag names are part of the contract.

use serde::{Deserialize, Serialize};

use crate::models::{
    ConnectedSitesView, ConnectionRequest, Protocol, RequestUid, SigningRequest, TabId, WalletId,
};

/// Inbound messages the broker accepts from trusted extension contexts
/// (approval window, connected-sites screen).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorRequest {
    /// Approval window asks for the pending connection request of its tab.
    ConnectRetrieveData { tab_id: TabId },
    /// Approval window submits the user's connect decision.
    ConnectResponse {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wallet_id: Option<WalletId>,
        tab_id: TabId,
    },
    /// Sign window asks for the pending signing request of its tab.
    TxSignWindowRetrieveData { tab_id: TabId },
    /// Sign window confirms signing with the spending password.
    SignConfirmed {
        uid: RequestUid,
        tab_id: TabId,
        password: String,
    },
    /// Sign window rejects signing.
    SignRejected { uid: RequestUid, tab_id: TabId },
    /// Management screen asks for the live page-agent sessions.
    GetConnectedSites,
    /// Management screen revokes a site's durable authorization.
    RemoveWalletFromWhitelist {
        origin_url: String,
        protocol: Protocol,
    },
    /// Sign window asks which protocol its tab's session speaks.
    GetProtocol { tab_id: TabId },
}

/// Replies the broker returns for [`ConnectorRequest`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ConnectorReply {
    /// Pending connection request, if any.
    ConnectionRequestData {
        request: Option<ConnectionRequest>,
    },
    /// Pending signing request, if any.
    SigningRequestData { request: Option<SigningRequest> },
    /// Snapshot of live sessions.
    ConnectedSites { view: ConnectedSitesView },
    /// Protocol of a tab's session.
    Protocol {
        #[serde(rename = "type")]
        protocol: Protocol,
    },
    /// Acknowledgement for fire-and-forget requests.
    Ok,
}

/// Terminal outcomes the broker delivers to a page agent's channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Final answer to a connect request. On acceptance carries the wallet
    /// and the auth token the page agent presents on repeated connects.
    ConnectResponse {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wallet_id: Option<WalletId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        tab_id: TabId,
    },
    /// Final answer to a signing request. `tx_id` on success, `error` when
    /// signing or broadcast failed (still terminal, never retried).
    SignResponse {
        uid: RequestUid,
        tab_id: TabId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        tx_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The site's durable authorization was revoked; the page agent must
    /// re-request connect on its next call.
    AuthorizationRevoked {
        origin_url: String,
        protocol: Protocol,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_confirmed_wire_shape() {
        let msg = ConnectorRequest::SignConfirmed {
            uid: RequestUid(3),
            tab_id: TabId(12),
            password: "hunter2".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "sign_confirmed",
                "uid": 3,
                "tab_id": 12,
                "password": "hunter2",
            })
        );
    }

    #[test]
    fn get_protocol_reply_uses_type_field() {
        let reply = ConnectorReply::Protocol {
            protocol: Protocol::Ergo,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"reply": "protocol", "type": "ergo"})
        );
    }

    #[test]
    fn rejected_connect_response_omits_optionals() {
        let event = AgentEvent::ConnectResponse {
            accepted: false,
            wallet_id: None,
            auth_token: None,
            tab_id: TabId(4),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "connect_response", "accepted": false, "tab_id": 4})
        );
    }

    #[test]
    fn envelopes_round_trip() {
        let msg = ConnectorRequest::RemoveWalletFromWhitelist {
            origin_url: "https://dapp.example".into(),
            protocol: Protocol::Cardano,
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: ConnectorRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }
}
