//! Core AiGateway trait

use async_trait::async_trait;

use crate::providers::CompletionStream;
use crate::{AiResponse, GenerateRequest, Orchestrator, Result};

/// The surface consumed by UI and editor layers.
///
/// [`Orchestrator`] is the production implementation; consumers depend on
/// the trait so they can substitute a fake in their own tests.
#[async_trait]
pub trait AiGateway: Send + Sync {
    /// Complete response with cost and provenance.
    async fn generate(&self, request: GenerateRequest) -> Result<AiResponse>;

    /// Streamed response. No caching or dedup.
    async fn stream(&self, request: GenerateRequest) -> Result<CompletionStream>;

    /// Several requests, `concurrency` at a time, in input order.
    ///
    /// The default runs them one after another.
    async fn batch_generate(&self, requests: Vec<GenerateRequest>, _concurrency: usize) -> Vec<Result<AiResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.generate(request).await);
        }
        results
    }
}

#[async_trait]
impl AiGateway for Orchestrator {
    async fn generate(&self, request: GenerateRequest) -> Result<AiResponse> {
        Orchestrator::generate(self, request).await
    }

    async fn stream(&self, request: GenerateRequest) -> Result<CompletionStream> {
        Orchestrator::stream(self, request).await
    }

    async fn batch_generate(&self, requests: Vec<GenerateRequest>, concurrency: usize) -> Vec<Result<AiResponse>> {
        Orchestrator::batch_generate(self, requests, concurrency).await
    }
}
