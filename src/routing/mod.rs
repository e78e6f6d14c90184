//! Complexity-aware model selection.
//!
//! The router classifies a prompt by complexity and task type, takes the
//! task's candidate list from a static table and ranks each candidate by
//! budget, provider preference, capability, badge and current health.

pub mod analysis;
pub mod scoring;

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

pub use analysis::{Complexity, ComplexityAnalysis, TaskType, analyze_complexity, classify_task};
pub use scoring::{RoutingPreferences, recommended_models, score_model};

use crate::health::HealthTracker;
use crate::registry::ModelRegistry;
use crate::types::ModelInfo;

/// A scored candidate with its reasoning trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecommendation {
    pub model_id: String,
    pub model: ModelInfo,
    pub score: i32,
    pub reasoning: Vec<String>,
}

pub struct IntelligentRouter {
    registry: Arc<ModelRegistry>,
    health: Arc<HealthTracker>,
}

impl IntelligentRouter {
    pub fn new(registry: Arc<ModelRegistry>, health: Arc<HealthTracker>) -> Self {
        Self { registry, health }
    }

    /// Best model for `prompt`, or `None` if the catalog is empty.
    pub async fn route(&self, prompt: &str, prefs: &RoutingPreferences) -> Option<ModelRecommendation> {
        let best = self.recommendations(prompt, prefs, 1).await.into_iter().next()?;
        debug!(model = %best.model_id, score = best.score, "routed");
        Some(best)
    }

    /// Top `top_n` candidates, best first. Ties keep table order.
    pub async fn recommendations(
        &self,
        prompt: &str,
        prefs: &RoutingPreferences,
        top_n: usize,
    ) -> Vec<ModelRecommendation> {
        let complexity = analyze_complexity(prompt).complexity;
        let task = classify_task(prompt);
        debug!(?complexity, %task, "classified prompt");

        let mut candidates: Vec<&ModelInfo> = recommended_models(task)
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect();
        if candidates.is_empty() {
            candidates = self.registry.list();
        }

        let mut scored = Vec::with_capacity(candidates.len());
        for model in candidates {
            let health = self.health.status(&model.id).await;
            let (score, reasoning) = score_model(model, complexity, task, health, prefs);
            scored.push(ModelRecommendation {
                model_id: model.id.clone(),
                model: model.clone(),
                score,
                reasoning,
            });
        }
        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored.truncate(top_n);
        scored
    }

    /// Model id for `prompt` with default preferences.
    pub async fn quick_route(&self, prompt: &str) -> Option<String> {
        self.route(prompt, &RoutingPreferences::default())
            .await
            .map(|r| r.model_id)
    }
}
