//! Usage accounting for streamed completions.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::time::Instant;

use crate::Result;
use crate::registry::{ModelRegistry, PricingConfig};
use crate::types::{StreamEvent, Usage};
use crate::usage::{Module, TokenUsageEvent, UsageAccountant};

/// Everything needed to price and record a finished stream.
pub(crate) struct StreamLedger {
    pub accountant: Arc<UsageAccountant>,
    pub registry: Arc<ModelRegistry>,
    pub pricing: PricingConfig,
    pub user_id: String,
    pub model_id: String,
    pub module: Module,
    /// Prompt length in characters, for estimating when no usage arrives.
    pub prompt_chars: usize,
    pub started: Instant,
}

/// Rough token estimate, four characters per token.
fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

pin_project! {
    /// Forwards a completion stream unchanged and records exactly one
    /// [`TokenUsageEvent`]: when the provider reports usage, when the stream
    /// ends, or when the stream is dropped early.
    pub struct AccountedStream<S> {
        #[pin]
        inner: S,
        ledger: Option<StreamLedger>,
        content_chars: usize,
    }

    impl<S> PinnedDrop for AccountedStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(ledger) = this.ledger.take() {
                let usage = estimated_usage(&ledger, *this.content_chars);
                settle(ledger, usage);
            }
        }
    }
}

impl<S> AccountedStream<S> {
    pub(crate) fn new(inner: S, ledger: StreamLedger) -> Self {
        Self {
            inner,
            ledger: Some(ledger),
            content_chars: 0,
        }
    }
}

impl<S> Stream for AccountedStream<S>
where
    S: Stream<Item = Result<StreamEvent>>,
{
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = std::task::ready!(this.inner.poll_next(cx));

        match &item {
            Some(Ok(StreamEvent::Content(text))) => *this.content_chars += text.chars().count(),
            Some(Ok(StreamEvent::Usage(usage))) => {
                if let Some(ledger) = this.ledger.take() {
                    settle(ledger, *usage);
                }
            }
            Some(Ok(StreamEvent::Done)) | Some(Err(_)) => {}
            None => {
                if let Some(ledger) = this.ledger.take() {
                    let usage = estimated_usage(&ledger, *this.content_chars);
                    settle(ledger, usage);
                }
            }
        }

        Poll::Ready(item)
    }
}

fn estimated_usage(ledger: &StreamLedger, content_chars: usize) -> Usage {
    Usage::new(estimate_tokens(ledger.prompt_chars), estimate_tokens(content_chars))
}

/// Price the usage and record it off the polling path.
fn settle(ledger: StreamLedger, usage: Usage) {
    let cost = ledger.registry.calculate_cost(
        usage.prompt_tokens,
        usage.completion_tokens,
        &ledger.model_id,
        &ledger.pricing,
    );
    let latency_ms = u64::try_from(ledger.started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let event = TokenUsageEvent::new(ledger.user_id, ledger.model_id)
        .tokens(usage.prompt_tokens, usage.completion_tokens)
        .cost(cost.user_charge)
        .latency_ms(latency_ms)
        .module(ledger.module);
    let accountant = ledger.accountant;

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { accountant.record(event).await });
        }
        Err(_) => tracing::warn!("stream finished outside a runtime, usage not recorded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::usage::AccountingConfig;
    use futures_util::{StreamExt, stream};

    fn ledger(accountant: Arc<UsageAccountant>) -> StreamLedger {
        StreamLedger {
            accountant,
            registry: Arc::new(ModelRegistry::with_embedded_seed()),
            pricing: PricingConfig::default(),
            user_id: "u1".into(),
            model_id: "openai/gpt-4o-mini".into(),
            module: Module::GeneralChat,
            prompt_chars: 8,
            started: Instant::now(),
        }
    }

    async fn recorded_tokens(accountant: &UsageAccountant) -> u64 {
        for _ in 0..50 {
            if let Some(usage) = accountant.get_user_usage("u1").await.unwrap() {
                return usage.totals.total_tokens;
            }
            tokio::task::yield_now().await;
        }
        0
    }

    #[tokio::test]
    async fn reported_usage_is_recorded() {
        let accountant = Arc::new(UsageAccountant::new(
            Arc::new(MemoryStore::new()),
            AccountingConfig::default(),
        ));
        let inner = stream::iter(vec![
            Ok(StreamEvent::Content("hello".into())),
            Ok(StreamEvent::Usage(Usage::new(10, 5))),
            Ok(StreamEvent::Done),
        ]);
        let events: Vec<_> = AccountedStream::new(inner, ledger(accountant.clone()))
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(recorded_tokens(&accountant).await, 15);
    }

    #[tokio::test]
    async fn missing_usage_is_estimated_at_end() {
        let accountant = Arc::new(UsageAccountant::new(
            Arc::new(MemoryStore::new()),
            AccountingConfig::default(),
        ));
        let inner = stream::iter(vec![Ok(StreamEvent::Content("abcdefgh".into()))]);
        let _: Vec<_> = AccountedStream::new(inner, ledger(accountant.clone()))
            .collect()
            .await;
        // 8 prompt chars and 8 content chars, two tokens each.
        assert_eq!(recorded_tokens(&accountant).await, 4);
    }
}
