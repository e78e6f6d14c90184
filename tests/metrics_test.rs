//! Metrics emitted by the request pipeline.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use hyphae::providers::{CompletionRequest, CompletionStream};
use hyphae::{
    AdmissionConfig, Completion, CompletionProvider, FallbackConfig, GenerateRequest, Hyphae,
    HyphaeError, Message, Orchestrator, RateLimitConfig, Result, RetryConfig, RetryPolicies,
    StaticTier, Tier, Usage, telemetry,
};

// ============================================================================
// Mock providers
// ============================================================================

struct EchoProvider;

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        Ok(Completion {
            text: format!("echo: {}", request.messages.len()),
            usage: Usage::new(10, 5),
            model: None,
        })
    }

    async fn complete_stream(&self, _request: &CompletionRequest) -> Result<CompletionStream> {
        Err(HyphaeError::Stream("not streaming".into()))
    }
}

struct UnavailableProvider;

#[async_trait]
impl CompletionProvider for UnavailableProvider {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        Err(HyphaeError::Api {
            status: 503,
            message: "overloaded".into(),
        })
    }

    async fn complete_stream(&self, _request: &CompletionRequest) -> Result<CompletionStream> {
        Err(HyphaeError::Stream("not streaming".into()))
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

fn orchestrator(openai: Arc<dyn CompletionProvider>) -> Orchestrator {
    Hyphae::builder()
        .provider("openai", openai)
        .provider("anthropic", Arc::new(EchoProvider))
        .retry(RetryPolicies::uniform(RetryConfig::disabled()))
        .fallback(
            FallbackConfig::default()
                .with_chain("openai/gpt-4o", ["anthropic/claude-3-5-sonnet-20241022"]),
        )
        .tier_resolver(Arc::new(StaticTier(Tier::Pro)))
        .build()
        .unwrap()
}

fn request(prompt: &str) -> GenerateRequest {
    GenerateRequest::new("researcher-1", "openai/gpt-4o", vec![Message::user(prompt)]).dedup(false)
}

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` ensures the sync `with_local_recorder` closure stays
/// on the current thread while `block_on` drives the inner async work.
fn recorded<F, T>(recorder: &DebuggingRecorder, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    metrics::with_local_recorder(recorder, || {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn successful_request_records_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let result = recorded(&recorder, async {
        orchestrator(Arc::new(EchoProvider))
            .generate(request("What is Trichoderma?"))
            .await
    });
    assert!(result.is_ok());

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::TOKENS_TOTAL), 15);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert!(
        has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS),
        "expected a duration histogram entry"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn cache_hit_records_hit_counter() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    recorded(&recorder, async {
        let hy = orchestrator(Arc::new(EchoProvider));
        hy.generate(request("What is Trichoderma?")).await.unwrap();
        hy.generate(request("What is Trichoderma?")).await.unwrap();
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn fallback_records_fallback_counter() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let response = recorded(&recorder, async {
        orchestrator(Arc::new(UnavailableProvider))
            .generate(request("hello").cache(false))
            .await
    })
    .unwrap();
    assert!(response.metadata.fallback_used);

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::FALLBACKS_TOTAL), 1);
    // One failed primary attempt plus the successful fallback.
    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn denied_request_records_admission_metric() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let err = recorded(&recorder, async {
        let hy = Hyphae::builder()
            .provider("openai", Arc::new(EchoProvider))
            .admission(
                AdmissionConfig::default()
                    .with_tier(Tier::Free, RateLimitConfig::new(1, Duration::from_secs(60))),
            )
            .build()
            .unwrap();
        hy.generate(request("hello").cache(false)).await.unwrap();
        hy.generate(request("hello").cache(false)).await.unwrap_err()
    });
    assert!(matches!(err, HyphaeError::AdmissionDenied { .. }));

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter_total(&snapshot, telemetry::ADMISSION_DENIED_TOTAL), 1);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    orchestrator(Arc::new(EchoProvider))
        .generate(request("hello"))
        .await
        .unwrap();
}
