//! The client-facing WebSocket ingress (spec.md §1, §4.4's connection
//! driver). One axum WS upgrade maps to one ingress connection, which runs
//! a sequence of turns through [`gproxy_forwarder::TurnForwarder`] exactly
//! as the loopback integration test in `gproxy-forwarder` drives it —
//! this module only supplies the axum-specific `ClientSink` and the
//! client-read pump that feeds `ClientSignal`s into the forwarder.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gproxy_account::{AccountSnapshot, Headers, header_set};
use gproxy_forwarder::{
    ClientSignal, ClientSink, ClientWriteError, Disposition, ForwarderConfig, NoopHooks, SessionParams, TurnForwarder,
    TurnOutcome, resolve_turn_error,
};
use gproxy_protocol::RequestEnvelope;
use gproxy_state::StateStore;
use gproxy_storage::AccountRepo;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::bootstrap::AppState;

#[derive(Debug, serde::Deserialize)]
pub struct IngressQuery {
    /// Which configured account this session should run against. Request
    /// routing/auth is explicitly out of core's scope (spec.md §1); a real
    /// deployment resolves this from an authenticated API key upstream of
    /// this handler and hands the core a concrete `account_id` instead.
    pub account_id: Option<i64>,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub session_hash: String,
    #[serde(default)]
    pub strict_affinity: bool,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<IngressQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

fn auth_headers(account: &AccountSnapshot) -> Headers {
    let mut headers = Headers::new();
    match &account.credential {
        gproxy_account::Credential::OAuth(cred) => {
            header_set(&mut headers, "authorization", format!("Bearer {}", cred.access_token));
        }
        gproxy_account::Credential::ApiKey { api_key } => {
            header_set(&mut headers, "authorization", format!("Bearer {api_key}"));
        }
    }
    headers
}

struct AxumClientSink {
    sender: Mutex<SplitSink<WebSocket, WsMessage>>,
}

#[async_trait]
impl ClientSink for AxumClientSink {
    async fn write_json(&self, value: &Value) -> Result<(), ClientWriteError> {
        let text = serde_json::to_string(value).map_err(|err| ClientWriteError(err.to_string()))?;
        self.sender
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| ClientWriteError(err.to_string()))
    }
}

/// Pumps client frames into the forwarder's signal channel: a text frame is
/// always a new `response.create` and is forwarded as `Preempt` whether or
/// not a turn is currently in flight (the driver loop below treats an idle
/// `Preempt` as "start the next turn" and an in-flight one as the spec's
/// actual preemption).
async fn pump_client_reads(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    signals: mpsc::Sender<ClientSignal>,
) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(payload) => {
                    if signals.send(ClientSignal::Preempt(payload)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dropping malformed client frame");
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => {
                let _ = signals.send(ClientSignal::Disconnected).await;
                return;
            }
            Ok(_) => {}
        }
    }
    let _ = signals.send(ClientSignal::Disconnected).await;
}

async fn handle_socket(socket: WebSocket, state: AppState, query: IngressQuery) {
    let (sink, mut stream) = socket.split();

    // Read the client's first payload before resolving the account: if it
    // names a `previous_response_id`, C3's response bindings (spec.md §4.3's
    // primary read trigger) take over account/conn stickiness for this
    // reconnect instead of picking an arbitrary schedulable account.
    let first_payload = match next_client_payload(&mut stream).await {
        Some(payload) => payload,
        None => return,
    };
    let previous_response_id = RequestEnvelope::from_value(first_payload.clone())
        .previous_response_id()
        .map(str::to_string);

    let (account_hint, conn_hint) = match &previous_response_id {
        Some(rid) => resolve_previous_response_hints(&state.state_store, rid).await,
        None => (None, None),
    };

    let Some(account) = resolve_account(&state, query.account_id.or(account_hint)).await else {
        tracing::warn!(account_id = ?query.account_id, "rejecting ingress connection: no schedulable account");
        return;
    };

    let owner_id = Uuid::now_v7().to_string();
    let session = SessionParams {
        ws_url: account.base_url.clone(),
        headers: auth_headers(&account),
        proxy: state.global.load().proxy.clone(),
        group_id: query.group_id,
        session_hash: query.session_hash,
        owner_id,
        strict_affinity: query.strict_affinity,
        account,
        preferred_conn_id_hint: conn_hint,
    };

    let forwarder = Arc::new(TurnForwarder::new(
        state.context_pool.clone(),
        state.state_store.clone(),
        state.fallback.clone(),
        state.corrector_stats.clone(),
        Some(state.usage_log_repo.clone()),
        ForwarderConfig::default(),
        session,
    ));

    let client = AxumClientSink { sender: Mutex::new(sink) };
    let (signal_tx, mut signal_rx) = mpsc::channel::<ClientSignal>(8);
    let reader = tokio::spawn(pump_client_reads(stream, signal_tx));

    let hooks = NoopHooks;
    let mut turn_index: u32 = 0;
    let mut pending_payload: Option<Value> = Some(first_payload);

    loop {
        let payload = match pending_payload.take() {
            Some(payload) => payload,
            None => match signal_rx.recv().await {
                Some(ClientSignal::Preempt(payload)) => payload,
                Some(ClientSignal::Disconnected) | None => break,
            },
        };
        turn_index += 1;

        match forwarder.run_turn(turn_index, payload, &client, &mut signal_rx, &hooks).await {
            Ok(TurnOutcome::Terminal { .. }) => continue,
            Err(turn_error) => {
                let resolution = resolve_turn_error(&turn_error);
                if let Some(event) = &resolution.client_event {
                    let _ = client.write_json(event).await;
                }
                match resolution.disposition {
                    Disposition::ContinueTurn => {
                        pending_payload = turn_error.preempt_payload;
                        continue;
                    }
                    Disposition::CloseGracefully | Disposition::FailRequest => break,
                }
            }
        }
    }

    reader.abort();
}

/// Reads frames until the first parseable text payload (or the stream
/// ends/errs first). Mirrors `pump_client_reads`'s frame handling, but
/// returns instead of forwarding, since this one payload still needs to
/// shape account/session resolution before a [`TurnForwarder`] exists to
/// hand it to.
async fn next_client_payload(stream: &mut futures_util::stream::SplitStream<WebSocket>) -> Option<Value> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(payload) => return Some(payload),
                Err(err) => {
                    tracing::debug!(error = %err, "dropping malformed client frame");
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Resolves C3's `previous_response_id` read trigger (spec.md §4.3): the
/// account that last owned this response, and the conn it last ran on, as a
/// hint for the fresh ingress connection resuming it. Either can be absent
/// (response aged out, or never bound a conn) without blocking the turn —
/// C1/C2 fall back to a normal dial either way.
async fn resolve_previous_response_hints(state: &StateStore, response_id: &str) -> (Option<i64>, Option<gproxy_pool::ConnId>) {
    let account_hint = state.lookup_response_account(response_id).await;
    let conn_hint = state.get_response_conn(response_id).await.and_then(|id| id.parse().ok());
    (account_hint, conn_hint)
}

async fn resolve_account(state: &AppState, requested: Option<i64>) -> Option<AccountSnapshot> {
    let active = state.account_repo.list_active().await.ok()?;
    match requested {
        Some(id) => active.into_iter().find(|a| a.id == id),
        None => active.into_iter().next(),
    }
}
