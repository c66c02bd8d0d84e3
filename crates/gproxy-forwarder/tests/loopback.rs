//! End-to-end check of the turn loop over a real WS loopback: spec.md §8's
//! scenario 1 ("keep the lease across turns"). Everything else — recovery
//! decisions, the disposition table, write-safety gating — is covered by
//! focused unit tests in the crate itself, which don't need a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gproxy_account::{AccountSnapshot, AccountStatus, AuthType, Credential, FallbackCooldownMap};
use gproxy_context::{ContextPool, ContextPoolConfig};
use gproxy_forwarder::{ClientSignal, ClientSink, ClientWriteError, ForwarderConfig, NoopHooks, SessionParams, TurnForwarder, TurnOutcome};
use gproxy_pool::dial::TungsteniteDialer;
use gproxy_pool::{ConnPool, ConnPoolConfig};
use gproxy_state::{StateStore, StateStoreConfig};
use gproxy_storage::DistributedCache;
use gproxy_toolcorrect::CorrectorStats;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct FakeCache {
    entries: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl DistributedCache for FakeCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> anyhow::Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

struct FakeClient {
    received: AsyncMutex<Vec<Value>>,
}

#[async_trait]
impl ClientSink for FakeClient {
    async fn write_json(&self, value: &Value) -> Result<(), ClientWriteError> {
        self.received.lock().await.push(value.clone());
        Ok(())
    }
}

fn sample_account() -> AccountSnapshot {
    AccountSnapshot {
        id: 1,
        platform: "openai".into(),
        auth_type: AuthType::ApiKey,
        status: AccountStatus::Active,
        schedulable: true,
        concurrency: 4,
        credential: Credential::ApiKey {
            api_key: "sk-test".into(),
        },
        base_url: "wss://example.test".into(),
        model_mapping: Default::default(),
        extra_flags: Default::default(),
    }
}

/// A minimal scripted upstream: accepts connections, replies to each
/// incoming text frame with the next canned event in `script`, then idles
/// (so the context pool's "hold the conn open" behavior has something to
/// hold onto) until the test drops the client side.
async fn spawn_fake_upstream(script: Vec<Value>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dial_count = Arc::new(AtomicUsize::new(0));
    let counter = dial_count.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let script = script.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                for reply in script {
                    match ws.next().await {
                        Some(Ok(Message::Text(_))) => {}
                        _ => return,
                    }
                    let text = serde_json::to_string(&reply).unwrap();
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                while ws.next().await.is_some() {}
            });
        }
    });
    (format!("ws://{addr}"), dial_count)
}

#[tokio::test]
async fn two_turns_reuse_a_single_upstream_dial() {
    let turn1 = json!({
        "type": "response.completed",
        "response": {"id": "resp_1", "usage": {"input_tokens": 3, "output_tokens": 2}},
    });
    let turn2 = json!({
        "type": "response.completed",
        "response": {"id": "resp_2", "usage": {"input_tokens": 4, "output_tokens": 1}},
    });
    let (ws_url, dial_count) = spawn_fake_upstream(vec![turn1, turn2]).await;

    let conn_pool = Arc::new(ConnPool::<TungsteniteDialer>::new(ConnPoolConfig::default()));
    let context_pool = Arc::new(ContextPool::with_conn_pool(ContextPoolConfig::default(), conn_pool));
    let state = Arc::new(StateStore::new(StateStoreConfig::default(), Arc::new(FakeCache::default())));
    let fallback = Arc::new(FallbackCooldownMap::new());
    let corrector = Arc::new(CorrectorStats::new());

    let config = ForwarderConfig {
        // A real preflight ping round-trip isn't exercised by this fake
        // server; keep this scenario focused on lease reuse.
        preflight_ping_idle_threshold: Duration::from_secs(3600),
        ..ForwarderConfig::default()
    };

    let session = SessionParams {
        account: sample_account(),
        group_id: "grp".into(),
        session_hash: "hash-1".into(),
        owner_id: "owner-1".into(),
        ws_url,
        headers: Vec::new(),
        proxy: None,
        strict_affinity: false,
        preferred_conn_id_hint: None,
    };

    let forwarder = TurnForwarder::new(context_pool, state, fallback, corrector, None, config, session);
    let client = FakeClient {
        received: AsyncMutex::new(Vec::new()),
    };
    let (_tx, mut rx) = tokio::sync::mpsc::channel::<ClientSignal>(4);
    let hooks = NoopHooks;

    let TurnOutcome::Terminal {
        response_id,
        partial,
        wrote_downstream,
    } = forwarder
        .run_turn(1, json!({"model": "gpt-5", "input": []}), &client, &mut rx, &hooks)
        .await
        .unwrap();
    assert_eq!(response_id.as_deref(), Some("resp_1"));
    assert_eq!(partial.usage.input_tokens, 3);
    assert!(wrote_downstream);

    let TurnOutcome::Terminal { response_id, .. } = forwarder
        .run_turn(2, json!({"model": "gpt-5", "input": []}), &client, &mut rx, &hooks)
        .await
        .unwrap();
    assert_eq!(response_id.as_deref(), Some("resp_2"));

    assert_eq!(
        dial_count.load(Ordering::SeqCst),
        1,
        "the forwarder should reuse the held context's conn across turns"
    );
    assert_eq!(client.received.lock().await.len(), 2);
}
