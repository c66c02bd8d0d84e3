//! The C4 Turn Forwarder (spec.md §4.4): drives one turn of a client's
//! session through an upstream WS connection held by the Ingress Context
//! Pool (C2), with the C5 recovery logic folded in at the points spec.md
//! §4.5 calls for it.

use std::sync::Arc;
use std::time::Duration;

use gproxy_account::{AccountSnapshot, FallbackCooldownMap, Headers};
use gproxy_account::fallback::CooldownLevel;
use gproxy_context::{AcquireContextRequest, ContextLease, ContextPool};
use gproxy_pool::dial::{Dialer, TungsteniteDialer};
use gproxy_protocol::{RequestEnvelope, StreamEnvelope, parse_light};
use gproxy_state::StateStore;
use gproxy_storage::{UsageLog, UsageLogRepo};
use gproxy_toolcorrect::{CorrectorStats, correct_bytes};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::errors::{AbortReason, ClientCloseError, TurnError, classify_close_code, UpstreamCloseClass};
use crate::recovery::{
    PreviousResponseRecovery, apply_previous_response_recovery, normalize_previous_response_id,
    preflight_tool_output_check, recover_previous_response_not_found,
};
use crate::turn::{ClientSignal, ClientSink, PartialTurnResult, TurnHooks, TurnOutcome};

/// An upstream error event that recovery can act on transparently, without
/// surfacing anything to the client, as long as nothing has reached the
/// client yet this turn.
const MAX_PREVIOUS_RESPONSE_RECOVERY_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How long a turn may sit idle before the next turn preflight-pings
    /// the held conn. Zero means "ping before every turn ≥2" (spec.md's
    /// open question on this threshold; see DESIGN.md).
    pub preflight_ping_idle_threshold: Duration,
    pub ping_budget: Duration,
    pub write_timeout: Duration,
    /// How long to keep draining upstream after the client disconnects,
    /// waiting for a terminal event, before giving up.
    pub drain_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            preflight_ping_idle_threshold: Duration::ZERO,
            ping_budget: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-connection identity: the account this session runs against, and the
/// coordinates the context pool needs to (re)acquire a conn for it.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub account: AccountSnapshot,
    pub group_id: String,
    pub session_hash: String,
    pub owner_id: String,
    pub ws_url: String,
    pub headers: Headers,
    pub proxy: Option<String>,
    pub strict_affinity: bool,
    /// C3's `response_id -> conn_id` binding for the `previous_response_id`
    /// the client's first payload named, resolved by the ingress layer
    /// before the session (and so before this session's own `group_id` +
    /// `session_hash` ever had a conn bound to them). Used only as a
    /// fallback when `get_session_conn` has nothing yet — e.g. turn one of
    /// a reconnect that is resuming a response started on another ingress
    /// connection.
    pub preferred_conn_id_hint: Option<gproxy_pool::ConnId>,
}

/// Drives a sequence of turns for one ingress client connection. Holds at
/// most one [`ContextLease`] at a time, reused across turns until a
/// preflight ping or a write fails and forces a fresh dial (spec.md §8
/// scenarios 1-3).
pub struct TurnForwarder<D: Dialer = TungsteniteDialer> {
    context_pool: Arc<ContextPool<D>>,
    state: Arc<StateStore>,
    fallback: Arc<FallbackCooldownMap>,
    corrector_stats: Arc<CorrectorStats>,
    usage_log_repo: Option<Arc<dyn UsageLogRepo>>,
    config: ForwarderConfig,
    session: SessionParams,
    lease: Mutex<Option<ContextLease>>,
    last_turn_finished_at: Mutex<Option<tokio::time::Instant>>,
}

impl<D: Dialer> TurnForwarder<D> {
    pub fn new(
        context_pool: Arc<ContextPool<D>>,
        state: Arc<StateStore>,
        fallback: Arc<FallbackCooldownMap>,
        corrector_stats: Arc<CorrectorStats>,
        usage_log_repo: Option<Arc<dyn UsageLogRepo>>,
        config: ForwarderConfig,
        session: SessionParams,
    ) -> Self {
        Self {
            context_pool,
            state,
            fallback,
            corrector_stats,
            usage_log_repo,
            config,
            session,
            lease: Mutex::new(None),
            last_turn_finished_at: Mutex::new(None),
        }
    }

    /// Drives one turn to completion. `hooks.before_turn`/`after_turn` fire
    /// exactly once regardless of internal write/recovery retries.
    pub async fn run_turn(
        &self,
        turn_index: u32,
        payload: Value,
        client: &dyn ClientSink,
        signals: &mut mpsc::Receiver<ClientSignal>,
        hooks: &dyn TurnHooks,
    ) -> Result<TurnOutcome, TurnError> {
        hooks.before_turn(turn_index).await;
        let result = self
            .send_and_relay(turn_index, RequestEnvelope::from_value(payload), client, signals)
            .await;
        *self.last_turn_finished_at.lock().await = Some(tokio::time::Instant::now());

        if let Err(ref err) = result {
            if crate::errors::should_clear_session_last_response_id(err.stage) {
                self.state
                    .clear_session_last_response_id(&self.session.group_id, &self.session.session_hash)
                    .await;
            }
            if err.stage == AbortReason::UpstreamRestart {
                self.fallback.mark(
                    self.session.account.id,
                    CooldownLevel::Transient,
                    Some(std::time::SystemTime::now() + Duration::from_secs(30)),
                    "upstream_restart",
                );
            }
        }

        hooks.after_turn(turn_index, result.as_ref().map_err(|e| e)).await;
        result
    }

    async fn send_and_relay(
        &self,
        turn_index: u32,
        mut payload: RequestEnvelope,
        client: &dyn ClientSink,
        signals: &mut mpsc::Receiver<ClientSignal>,
    ) -> Result<TurnOutcome, TurnError> {
        if self.session.account.store_disabled() {
            preflight_tool_output_check(&payload)?;
        }

        let expected_prev = self.expected_previous_response_id().await;
        payload = normalize_previous_response_id(payload, expected_prev.as_deref());

        let mut wrote_downstream = false;
        let mut write_retry_used = false;
        let mut recovery_attempts = 0u32;

        loop {
            let has_prev_or_fco = payload.previous_response_id().is_some() || payload.has_function_call_output();
            self.ensure_lease(turn_index, has_prev_or_fco)
                .await
                .map_err(|e| TurnError::new(AbortReason::ContinuationUnavailable, wrote_downstream, e))?;

            if turn_index >= 2 && self.should_preflight_ping().await && self.preflight_ping().await.is_err() {
                self.reacquire_fresh(turn_index, has_prev_or_fco)
                    .await
                    .map_err(|e| TurnError::new(AbortReason::ContinuationUnavailable, wrote_downstream, e))?;
            }

            if let Err(write_err) = self.write_upstream(&payload).await {
                // Write-safety invariant: a retry is only permitted while
                // nothing has reached the client for this turn yet.
                if !wrote_downstream && !write_retry_used {
                    write_retry_used = true;
                    self.reacquire_fresh(turn_index, has_prev_or_fco)
                        .await
                        .map_err(|e| TurnError::new(AbortReason::ContinuationUnavailable, wrote_downstream, e))?;
                    continue;
                }
                return Err(write_err);
            }

            match self.relay_loop(client, signals, &mut wrote_downstream).await {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if err.stage == AbortReason::PreviousResponse
                        && !err.wrote_downstream
                        && recovery_attempts < MAX_PREVIOUS_RESPONSE_RECOVERY_ATTEMPTS =>
                {
                    let expected = self.expected_previous_response_id().await;
                    let decision = recover_previous_response_not_found(&payload, expected.as_deref());
                    if decision == PreviousResponseRecovery::AbortPreserveToolOutputs {
                        return Err(err);
                    }
                    let (rewritten, _) = apply_previous_response_recovery(payload.clone(), expected.as_deref(), decision);
                    payload = rewritten;
                    recovery_attempts += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn expected_previous_response_id(&self) -> Option<String> {
        self.state
            .get_session_turn_state(&self.session.group_id, &self.session.session_hash)
            .await
            .and_then(|t| t.last_response_id)
    }

    async fn ensure_lease(&self, turn_index: u32, has_prev_or_fco: bool) -> anyhow::Result<()> {
        let mut guard = self.lease.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let lease = self
            .context_pool
            .acquire(self.acquire_request(turn_index, has_prev_or_fco).await)
            .await?;
        *guard = Some(lease);
        Ok(())
    }

    async fn reacquire_fresh(&self, turn_index: u32, has_prev_or_fco: bool) -> anyhow::Result<()> {
        let mut guard = self.lease.lock().await;
        if let Some(old) = guard.take() {
            old.mark_broken().await;
        }
        let lease = self
            .context_pool
            .acquire(self.acquire_request(turn_index, has_prev_or_fco).await)
            .await?;
        *guard = Some(lease);
        Ok(())
    }

    /// `preferred_conn_id` comes from C3's session→conn binding: a hint
    /// from a previous turn on this same session, not a guarantee (the
    /// conn may be gone; C1 falls back to a fresh dial either way).
    async fn acquire_request(&self, turn_index: u32, has_prev_or_fco: bool) -> AcquireContextRequest {
        let preferred_conn_id = self
            .state
            .get_session_conn(&self.session.group_id, &self.session.session_hash)
            .await
            .and_then(|id| id.parse().ok())
            .or(self.session.preferred_conn_id_hint);
        AcquireContextRequest {
            account: self.session.account.clone(),
            group_id: self.session.group_id.clone(),
            session_hash: self.session.session_hash.clone(),
            owner_id: self.session.owner_id.clone(),
            ws_url: self.session.ws_url.clone(),
            headers: self.session.headers.clone(),
            proxy: self.session.proxy.clone(),
            turn_index,
            has_previous_response_id: has_prev_or_fco,
            strict_affinity: self.session.strict_affinity,
            store_disabled: self.session.account.store_disabled(),
            preferred_conn_id,
        }
    }

    async fn should_preflight_ping(&self) -> bool {
        let threshold = self.config.preflight_ping_idle_threshold;
        if threshold.is_zero() {
            return true;
        }
        match *self.last_turn_finished_at.lock().await {
            Some(at) => at.elapsed() >= threshold,
            None => false,
        }
    }

    async fn preflight_ping(&self) -> Result<(), ()> {
        let guard = self.lease.lock().await;
        let Some(lease) = guard.as_ref() else { return Ok(()) };
        lease.ping(self.config.ping_budget).await.map_err(|_| ())
    }

    async fn write_upstream(&self, payload: &RequestEnvelope) -> Result<(), TurnError> {
        let guard = self.lease.lock().await;
        let lease = guard.as_ref().expect("ensure_lease populated the lease slot");
        let value = payload.clone().into_value();
        match tokio::time::timeout(self.config.write_timeout, lease.write_json(&value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TurnError::new(AbortReason::WriteUpstream, false, e)),
            Err(_) => Err(TurnError::new(AbortReason::WriteUpstream, false, anyhow::anyhow!("write upstream timed out"))),
        }
    }

    async fn relay_loop(
        &self,
        client: &dyn ClientSink,
        signals: &mut mpsc::Receiver<ClientSignal>,
        wrote_downstream: &mut bool,
    ) -> Result<TurnOutcome, TurnError> {
        let mut partial = PartialTurnResult::default();
        let mut response_id: Option<String> = None;
        let mut draining = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            let guard = self.lease.lock().await;
            let lease = guard.as_ref().expect("lease held for the duration of the relay loop");

            let drain_sleep = async {
                match drain_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = drain_sleep, if draining => {
                    return Ok(TurnOutcome::Terminal {
                        response_id,
                        partial,
                        wrote_downstream: *wrote_downstream,
                    });
                }

                signal = signals.recv(), if !draining => {
                    match signal {
                        Some(ClientSignal::Preempt(next_payload)) => {
                            let mut err = TurnError::new(
                                AbortReason::ClientPreempted,
                                *wrote_downstream,
                                anyhow::anyhow!("client sent a new turn mid-relay"),
                            );
                            err.partial = Some(partial.clone());
                            drop(guard);
                            return Err(err.with_preempt_payload(next_payload));
                        }
                        Some(ClientSignal::Disconnected) | None => {
                            draining = true;
                            drain_deadline = Some(tokio::time::Instant::now() + self.config.drain_timeout);
                        }
                    }
                }

                read = lease.read_message() => {
                    match read {
                        Ok(Some(msg)) => {
                            drop(guard);
                            match self
                                .handle_upstream_message(msg, client, &mut response_id, &mut partial, wrote_downstream, draining)
                                .await?
                            {
                                MessageOutcome::Continue => {}
                                MessageOutcome::Terminal => {
                                    return Ok(TurnOutcome::Terminal {
                                        response_id,
                                        partial,
                                        wrote_downstream: *wrote_downstream,
                                    });
                                }
                            }
                        }
                        Ok(None) => {
                            return Ok(TurnOutcome::Terminal {
                                response_id,
                                partial,
                                wrote_downstream: *wrote_downstream,
                            });
                        }
                        Err(e) => {
                            drop(guard);
                            return Err(TurnError::new(AbortReason::ReadUpstream, *wrote_downstream, e).with_partial(partial));
                        }
                    }
                }
            }
        }
    }

    async fn handle_upstream_message(
        &self,
        msg: Message,
        client: &dyn ClientSink,
        response_id: &mut Option<String>,
        partial: &mut PartialTurnResult,
        wrote_downstream: &mut bool,
        draining: bool,
    ) -> Result<MessageOutcome, TurnError> {
        let bytes: &[u8] = match &msg {
            Message::Text(t) => t.as_bytes(),
            Message::Binary(b) => b.as_ref(),
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                let reason = frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default();
                return match classify_close_code(code) {
                    UpstreamCloseClass::UpstreamRestart => {
                        Err(TurnError::new(AbortReason::UpstreamRestart, *wrote_downstream, anyhow::anyhow!("upstream restarting (close {code})")).with_partial(partial.clone()))
                    }
                    UpstreamCloseClass::PolicyViolation => Err(TurnError::new(
                        AbortReason::PolicyViolation,
                        *wrote_downstream,
                        ClientCloseError { code, reason },
                    )
                    .with_partial(partial.clone())),
                    UpstreamCloseClass::ClientDisconnect | UpstreamCloseClass::Other => Ok(MessageOutcome::Terminal),
                };
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(MessageOutcome::Continue),
        };

        let Some(light) = parse_light(bytes) else {
            return Ok(MessageOutcome::Continue);
        };
        if let Some(rid) = &light.response_id {
            *response_id = Some(rid.clone());
        }

        if light.is_error() {
            if let Ok(env) = StreamEnvelope::from_bytes(bytes) {
                if let Some(err_info) = env.error() {
                    if err_info.is_previous_response_not_found() {
                        return Err(TurnError::new(
                            AbortReason::PreviousResponse,
                            *wrote_downstream,
                            anyhow::anyhow!(err_info.message.unwrap_or_default()),
                        )
                        .with_partial(partial.clone()));
                    }
                    if err_info.is_tool_output_not_found() {
                        return Err(TurnError::new(
                            AbortReason::ToolOutput,
                            *wrote_downstream,
                            anyhow::anyhow!(err_info.message.unwrap_or_default()),
                        )
                        .with_partial(partial.clone()));
                    }
                }
            }
            let (out_bytes, _) = correct_bytes(bytes, &self.corrector_stats);
            self.relay_to_client(client, &out_bytes, wrote_downstream, draining).await?;
            return Err(TurnError::new(AbortReason::UpstreamError, true, anyhow::anyhow!("upstream error event")).with_partial(partial.clone()));
        }

        let (out_bytes, _) = correct_bytes(bytes, &self.corrector_stats);
        self.relay_to_client(client, &out_bytes, wrote_downstream, draining).await?;

        if light.is_terminal() {
            self.on_terminal(bytes, response_id.clone(), partial).await;
            return Ok(MessageOutcome::Terminal);
        }
        Ok(MessageOutcome::Continue)
    }

    /// Writes `bytes` to the client. In drain mode (client already gone), a
    /// write failure is swallowed rather than classified as a failure
    /// (spec.md §4.4's client-disconnect-drain behavior).
    async fn relay_to_client(
        &self,
        client: &dyn ClientSink,
        bytes: &[u8],
        wrote_downstream: &mut bool,
        draining: bool,
    ) -> Result<(), TurnError> {
        let value: Value = serde_json::from_slice(bytes).unwrap_or(Value::Null);
        match tokio::time::timeout(self.config.write_timeout, client.write_json(&value)).await {
            Ok(Ok(())) => {
                *wrote_downstream = true;
                Ok(())
            }
            _ if draining => Ok(()),
            Ok(Err(e)) => Err(TurnError::new(AbortReason::WriteClient, *wrote_downstream, e)),
            Err(_) => Err(TurnError::new(AbortReason::WriteClient, *wrote_downstream, anyhow::anyhow!("client write timed out"))),
        }
    }

    /// Persists response bindings and the session's `last_response_id` on a
    /// successful terminal event, then gates the usage log (and, through
    /// it, any downstream billing) on first-insert (spec.md §4.3, §4.4).
    async fn on_terminal(&self, bytes: &[u8], response_id: Option<String>, partial: &mut PartialTurnResult) {
        let Ok(env) = StreamEnvelope::from_bytes(bytes) else { return };
        if let Some(usage) = env.usage() {
            partial.accumulate_usage(usage);
        }
        partial.request_id = response_id.clone();

        let is_success = matches!(env.event_type(), Some("response.completed" | "response.done"));
        if !is_success {
            return;
        }
        let Some(rid) = response_id else { return };

        self.state.bind_response_account(&rid, self.session.account.id).await;
        let conn_id = {
            let guard = self.lease.lock().await;
            guard.as_ref().map(|l| l.conn_id().to_string())
        };
        if let Some(conn_id) = &conn_id {
            self.state.bind_response_conn(&rid, conn_id).await;
            self.state
                .bind_session_conn(&self.session.group_id, &self.session.session_hash, conn_id)
                .await;
        }

        let pending = env.function_call_ids();
        if !pending.is_empty() {
            self.state.bind_pending_tool_calls(&self.session.group_id, &rid, pending.clone()).await;
        }
        self.state
            .bind_session_turn_state(
                &self.session.group_id,
                &self.session.session_hash,
                gproxy_state::TurnState {
                    last_response_id: Some(rid.clone()),
                    pending_tool_call_ids: pending,
                },
            )
            .await;

        if let Some(repo) = &self.usage_log_repo {
            let log = UsageLog {
                idempotency_key: rid,
                account_id: self.session.account.id,
                model: self
                    .session
                    .account
                    .model_mapping
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or_default(),
                input_tokens: partial.usage.input_tokens,
                output_tokens: partial.usage.output_tokens,
                cached_tokens: partial.usage.cached_tokens,
                created_at: time::OffsetDateTime::now_utc(),
            };
            match repo.create(log).await {
                Ok(true) => tracing::debug!(account_id = self.session.account.id, "usage log inserted; billing-eligible"),
                Ok(false) => tracing::debug!(account_id = self.session.account.id, "duplicate usage log; billing skipped"),
                Err(err) => tracing::warn!(account_id = self.session.account.id, error = %err, "failed to persist usage log"),
            }
        }
    }
}

enum MessageOutcome {
    Continue,
    Terminal,
}

impl TurnError {
    fn with_preempt_payload(mut self, payload: Value) -> Self {
        self.preempt_payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_account::{AccountStatus, AuthType, Credential};
    use gproxy_context::{ContextPool, ContextPoolConfig};
    use gproxy_pool::{ConnPool, ConnPoolConfig};
    use gproxy_state::StateStoreConfig;
    use gproxy_storage::InMemoryCache;

    fn sample_account() -> AccountSnapshot {
        AccountSnapshot {
            id: 1,
            platform: "openai".into(),
            auth_type: AuthType::ApiKey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency: 4,
            credential: Credential::ApiKey { api_key: "sk-test".into() },
            base_url: "wss://example.test".into(),
            model_mapping: Default::default(),
            extra_flags: Default::default(),
        }
    }

    fn sample_forwarder(preferred_conn_id_hint: Option<gproxy_pool::ConnId>) -> TurnForwarder {
        let conn_pool = Arc::new(ConnPool::<TungsteniteDialer>::new(ConnPoolConfig::default()));
        let context_pool = Arc::new(ContextPool::with_conn_pool(ContextPoolConfig::default(), conn_pool));
        let state = Arc::new(StateStore::new(StateStoreConfig::default(), Arc::new(InMemoryCache::new())));
        let session = SessionParams {
            account: sample_account(),
            group_id: "grp".into(),
            session_hash: "hash-1".into(),
            owner_id: "owner-1".into(),
            ws_url: "wss://example.test".into(),
            headers: Vec::new(),
            proxy: None,
            strict_affinity: false,
            preferred_conn_id_hint,
        };
        TurnForwarder::new(
            context_pool,
            state,
            Arc::new(FallbackCooldownMap::new()),
            Arc::new(CorrectorStats::new()),
            None,
            ForwarderConfig::default(),
            session,
        )
    }

    #[tokio::test]
    async fn preferred_conn_id_hint_is_used_when_session_has_no_binding_yet() {
        let hint: gproxy_pool::ConnId = uuid::Uuid::now_v7();
        let forwarder = sample_forwarder(Some(hint));
        let req = forwarder.acquire_request(1, false).await;
        assert_eq!(req.preferred_conn_id, Some(hint));
    }

    #[tokio::test]
    async fn session_conn_binding_wins_over_the_hint() {
        let hint: gproxy_pool::ConnId = uuid::Uuid::now_v7();
        let forwarder = sample_forwarder(Some(hint));
        let bound: gproxy_pool::ConnId = uuid::Uuid::now_v7();
        forwarder.state.bind_session_conn("grp", "hash-1", &bound.to_string()).await;
        let req = forwarder.acquire_request(1, false).await;
        assert_eq!(req.preferred_conn_id, Some(bound));
    }
}
