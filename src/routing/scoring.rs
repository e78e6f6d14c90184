//! Candidate tables and the multi-factor model score.

use serde::{Deserialize, Serialize};

use super::analysis::{Complexity, TaskType};
use crate::health::HealthStatus;
use crate::types::{ModelBadge, ModelInfo};

/// Caller constraints on model selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPreferences {
    /// Budget ceiling on input price (USD per 1M tokens).
    pub max_cost_per_1m: Option<f64>,
    pub preferred_providers: Vec<String>,
    pub excluded_providers: Vec<String>,
    pub prioritize_speed: bool,
    pub require_capabilities: Vec<String>,
}

impl RoutingPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_cost_per_1m(mut self, usd: f64) -> Self {
        self.max_cost_per_1m = Some(usd);
        self
    }

    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.preferred_providers.push(provider.into());
        self
    }

    pub fn exclude(mut self, provider: impl Into<String>) -> Self {
        self.excluded_providers.push(provider.into());
        self
    }

    pub fn prioritize_speed(mut self, enabled: bool) -> Self {
        self.prioritize_speed = enabled;
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.require_capabilities.push(capability.into());
        self
    }
}

const GPT4O: &str = "openai/gpt-4o";
const GPT4O_MINI: &str = "openai/gpt-4o-mini";
const O1: &str = "openai/o1";
const SONNET: &str = "anthropic/claude-3-5-sonnet-20241022";
const HAIKU: &str = "anthropic/claude-3-5-haiku-20241022";
const GEMINI_PRO: &str = "google/gemini-1.5-pro-latest";
const GEMINI_FLASH: &str = "google/gemini-1.5-flash";
const CROWE_MINI: &str = "crowelogic/mini";
const DEEPSEEK_CODER: &str = "deepseek/deepseek-coder";

/// Ranked candidate models for a task type, best first.
pub fn recommended_models(task: TaskType) -> &'static [&'static str] {
    match task {
        TaskType::SimpleChat => &[CROWE_MINI, GPT4O_MINI, HAIKU, GEMINI_FLASH],
        TaskType::ComplexReasoning => &[O1, "openai/o3-mini", SONNET, GPT4O, GEMINI_PRO],
        TaskType::CodeGeneration => &[GPT4O, SONNET, DEEPSEEK_CODER, GPT4O_MINI],
        TaskType::CodeReview => &[SONNET, GPT4O, O1, DEEPSEEK_CODER],
        TaskType::ScientificResearch => &[CROWE_MINI, O1, SONNET, GEMINI_PRO, GPT4O],
        TaskType::CreativeWriting => &[SONNET, GPT4O, GEMINI_PRO, "anthropic/claude-3-opus-20240229"],
        TaskType::DataAnalysis => &[GPT4O, SONNET, GEMINI_PRO],
        TaskType::Summarization => &[HAIKU, GPT4O_MINI, GEMINI_FLASH, CROWE_MINI],
        TaskType::Translation => &[GPT4O, GEMINI_PRO, GPT4O_MINI],
        TaskType::Vision => &[
            GPT4O,
            "google/gemini-2.0-flash-exp",
            SONNET,
            "meta-llama/llama-3.2-90b-vision-instruct",
        ],
        TaskType::General => &[GPT4O_MINI, HAIKU, GEMINI_FLASH],
    }
}

/// Score one candidate. Base 100; every adjustment appends a reason.
pub fn score_model(
    model: &ModelInfo,
    complexity: Complexity,
    task: TaskType,
    health: HealthStatus,
    prefs: &RoutingPreferences,
) -> (i32, Vec<String>) {
    let mut score = 100;
    let mut reasoning = Vec::new();

    if let Some(max) = prefs.max_cost_per_1m
        && model.cost_per_1m_input > max
    {
        score -= 50;
        reasoning.push(format!("Exceeds budget ({} > {max})", model.cost_per_1m_input));
    }

    if prefs.preferred_providers.contains(&model.provider) {
        score += 20;
        reasoning.push(format!("Preferred provider: {}", model.provider));
    }
    if prefs.excluded_providers.contains(&model.provider) {
        score -= 100;
        reasoning.push(format!("Excluded provider: {}", model.provider));
    }

    if !prefs.require_capabilities.iter().all(|c| model.has_capability(c)) {
        score -= 100;
        reasoning.push("Missing required capabilities".to_owned());
    }

    if let Some(rank) = recommended_models(task).iter().position(|id| *id == model.id) {
        score += 30 - 5 * rank as i32;
        reasoning.push(format!("Recommended for {task} (rank {})", rank + 1));
    }

    match (complexity, model.badge) {
        (Complexity::High, Some(ModelBadge::Smartest)) => {
            score += 20;
            reasoning.push("High complexity + smartest model".to_owned());
        }
        (Complexity::Low, Some(ModelBadge::Fastest)) => {
            score += 20;
            reasoning.push("Low complexity + fastest model".to_owned());
        }
        _ => {}
    }

    if prefs.prioritize_speed {
        if model.badge == Some(ModelBadge::Fastest) {
            score += 30;
            reasoning.push("Prioritizing speed".to_owned());
        }
        if model.context_window < 50_000 {
            score += 10;
            reasoning.push("Smaller context = faster".to_owned());
        }
    }

    if complexity == Complexity::Low && model.cost_per_1m_input < 1.0 {
        score += 15;
        reasoning.push("Cost-efficient for simple task".to_owned());
    }

    match health {
        HealthStatus::Down => {
            score -= 200;
            reasoning.push("Model is currently down".to_owned());
        }
        HealthStatus::Degraded => {
            score -= 50;
            reasoning.push("Model performance degraded".to_owned());
        }
        HealthStatus::Healthy => {
            score += 10;
            reasoning.push("Model is healthy".to_owned());
        }
    }

    (score, reasoning)
}
