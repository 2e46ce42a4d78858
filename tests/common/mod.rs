#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::NamedTempFile;
use webhook_pipeline::{
    circuit::CircuitBreaker,
    config::{CircuitConfig, PipelineConfig},
    now_millis,
    orchestrator::WebhookOrchestrator,
    processor::{EventProcessor, ProcessorError},
    store::{Command, GuardedStore, Reply, SqliteStore, Store, StoreError, StoreResult},
    types::{WebhookEvent, WebhookRequest},
    verifier::SvixVerifier,
};

pub const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

pub struct TestStore {
    pub store: Arc<SqliteStore>,
    _db_file: NamedTempFile,
}

impl TestStore {
    pub fn guarded(&self) -> GuardedStore {
        GuardedStore::new(
            self.store.clone(),
            Arc::new(CircuitBreaker::new(CircuitConfig::default())),
        )
    }
}

pub async fn setup_store() -> TestStore {
    let db_file = NamedTempFile::new().expect("create temp sqlite file");
    let options = SqliteConnectOptions::new()
        .filename(db_file.path())
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("connect sqlite file");

    let store = SqliteStore::new(pool);
    store.migrate().await.expect("run migrations");

    TestStore {
        store: Arc::new(store),
        _db_file: db_file,
    }
}

/// A store whose every call fails, as if the server were unreachable.
pub struct DownStore {
    pub calls: AtomicU32,
}

impl DownStore {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Store for DownStore {
    async fn execute(&self, _command: Command) -> StoreResult<Reply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn pipeline(&self, _commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// Delegates to a real store but fails every command named `failing`.
pub struct FailingCommandStore {
    inner: Arc<dyn Store>,
    failing: &'static str,
}

impl FailingCommandStore {
    pub fn new(inner: Arc<dyn Store>, failing: &'static str) -> Self {
        Self { inner, failing }
    }

    fn refuse(&self) -> StoreError {
        StoreError::Unavailable(format!("{} refused", self.failing))
    }
}

#[async_trait]
impl Store for FailingCommandStore {
    async fn execute(&self, command: Command) -> StoreResult<Reply> {
        if command.name() == self.failing {
            return Err(self.refuse());
        }
        self.inner.execute(command).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        if commands.iter().any(|command| command.name() == self.failing) {
            return Err(self.refuse());
        }
        self.inner.pipeline(commands).await
    }
}

pub fn sample_event(id: &str) -> WebhookEvent {
    WebhookEvent {
        id: id.to_string(),
        event_type: "user.created".to_string(),
        user_id: Some("user_123".to_string()),
        payload: serde_json::json!({ "type": "user.created", "data": { "id": "user_123" } }),
        received_at: now_millis(),
    }
}

pub fn verifier() -> Arc<SvixVerifier> {
    Arc::new(SvixVerifier::new(SECRET).expect("valid secret"))
}

pub fn identity_body(event_type: &str, user_id: &str) -> String {
    serde_json::json!({ "type": event_type, "data": { "id": user_id } }).to_string()
}

/// Headers a provider would send for `body` under delivery id `msg_id`.
pub fn signed_headers(msg_id: &str, body: &str) -> BTreeMap<String, String> {
    let timestamp = now_millis() / 1000;
    let signature = verifier().sign(msg_id, timestamp, body).expect("sign");
    BTreeMap::from([
        ("svix-id".to_string(), msg_id.to_string()),
        ("svix-timestamp".to_string(), timestamp.to_string()),
        ("svix-signature".to_string(), signature),
    ])
}

pub fn signed_request(msg_id: &str, body: &str) -> WebhookRequest {
    WebhookRequest::new(signed_headers(msg_id, body), body)
}

/// Defaults with jitter off so backoff arithmetic is exact.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.jitter = false;
    config.orchestrator.processing_timeout = Duration::from_secs(5);
    config
}

pub fn orchestrator(store: &TestStore, config: PipelineConfig) -> WebhookOrchestrator {
    WebhookOrchestrator::new(config, store.store.clone(), verifier())
}

/// Processor that counts calls and answers with `outcome`.
pub fn counting_processor(
    outcome: Result<bool, &'static str>,
) -> (Arc<dyn EventProcessor>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let processor: Arc<dyn EventProcessor> =
        Arc::new(move |_event: WebhookEvent, _correlation_id: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                outcome.map_err(ProcessorError::failed)
            }
        });
    (processor, calls)
}
