//! Prompt classifiers: complexity and task type.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplexityAnalysis {
    pub complexity: Complexity,
    pub score: u32,
    /// Human-readable signals that contributed to the score.
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    SimpleChat,
    ComplexReasoning,
    CodeGeneration,
    CodeReview,
    ScientificResearch,
    CreativeWriting,
    DataAnalysis,
    Summarization,
    Translation,
    Vision,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SimpleChat => "simple-chat",
            TaskType::ComplexReasoning => "complex-reasoning",
            TaskType::CodeGeneration => "code-generation",
            TaskType::CodeReview => "code-review",
            TaskType::ScientificResearch => "scientific-research",
            TaskType::CreativeWriting => "creative-writing",
            TaskType::DataAnalysis => "data-analysis",
            TaskType::Summarization => "summarization",
            TaskType::Translation => "translation",
            TaskType::Vision => "vision",
            TaskType::General => "general",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const REASONING: &[&str] = &[
    "analyze",
    "compare",
    "evaluate",
    "explain why",
    "reason",
    "deduce",
    "infer",
    "prove",
    "argue",
    "justify",
];
const CODE: &[&str] = &[
    "code",
    "function",
    "class",
    "debug",
    "algorithm",
    "implement",
    "refactor",
    "optimize",
];
const SCIENCE: &[&str] = &[
    "research",
    "study",
    "hypothesis",
    "experiment",
    "data",
    "analysis",
    "theory",
];
const MULTI_STEP: &[&str] = &["first", "then", "next", "finally", "step", "process", "workflow"];
const QUESTIONS: &[&str] = &["what", "why", "how", "when", "where", "who", "which"];

fn count(haystack: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| haystack.contains(*n)).count()
}

fn any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Weighted keyword and length heuristic.
///
/// Keywords match as substrings of the lowercased prompt, so "then" also
/// matches inside "authentication".
pub fn analyze_complexity(prompt: &str) -> ComplexityAnalysis {
    let lower = prompt.to_lowercase();
    let mut score = 0;
    let mut indicators = Vec::new();
    let mut add = |points: u32, why: &str| {
        score += points;
        indicators.push(why.to_owned());
    };

    let len = prompt.chars().count();
    if len > 1000 {
        add(3, "Long query (>1000 chars)");
    } else if len > 500 {
        add(2, "Medium query (500-1000 chars)");
    } else {
        add(1, "Short query (<500 chars)");
    }

    match count(&lower, REASONING) {
        0 => {}
        1 => add(2, "Single reasoning keyword"),
        _ => add(3, "Multiple reasoning keywords"),
    }
    if count(&lower, CODE) >= 2 {
        add(2, "Code-related query");
    }
    if count(&lower, SCIENCE) >= 2 {
        add(2, "Scientific/research query");
    }
    if count(&lower, MULTI_STEP) >= 2 {
        add(2, "Multi-step process");
    }
    if count(&lower, QUESTIONS) >= 3 {
        add(2, "Multiple questions");
    }

    let complexity = match score {
        0..=3 => Complexity::Low,
        4..=7 => Complexity::Medium,
        _ => Complexity::High,
    };
    ComplexityAnalysis {
        complexity,
        score,
        indicators,
    }
}

/// Keyword precedence classifier; the first matching rule wins.
pub fn classify_task(prompt: &str) -> TaskType {
    let lower = prompt.to_lowercase();

    if any(&lower, &["code", "function", "debug", "implement"]) {
        if any(&lower, &["review", "improve", "fix"]) {
            return TaskType::CodeReview;
        }
        return TaskType::CodeGeneration;
    }
    if any(&lower, &["reason", "analyze", "prove", "solve"]) {
        return TaskType::ComplexReasoning;
    }
    if any(&lower, &["research", "study", "scientific", "experiment"]) {
        return TaskType::ScientificResearch;
    }
    if any(&lower, &["data", "statistics", "chart", "graph"]) {
        return TaskType::DataAnalysis;
    }
    if any(&lower, &["summarize", "summary", "tldr", "brief"]) {
        return TaskType::Summarization;
    }
    if any(&lower, &["translate", "translation"]) {
        return TaskType::Translation;
    }
    if any(&lower, &["write a story", "poem", "creative", "fiction"]) {
        return TaskType::CreativeWriting;
    }
    if any(&lower, &["image", "photo", "picture"]) {
        return TaskType::Vision;
    }
    if lower.chars().count() < 100 && any(&lower, &["hello", "hi", "thanks", "ok"]) {
        return TaskType::SimpleChat;
    }
    TaskType::General
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_plain_prompt_is_low() {
        let analysis = analyze_complexity("Tell me about oyster mushrooms");
        assert_eq!(analysis.complexity, Complexity::Low);
        assert_eq!(analysis.score, 1);
        assert_eq!(analysis.indicators, vec!["Short query (<500 chars)"]);
    }

    #[test]
    fn reasoning_and_steps_raise_complexity() {
        let prompt = "First analyze the substrate, then compare yields and justify the choice.";
        let analysis = analyze_complexity(prompt);
        // 1 (short) + 3 (analyze, compare, justify) + 2 (first, then)
        assert_eq!(analysis.score, 6);
        assert_eq!(analysis.complexity, Complexity::Medium);
    }

    #[test]
    fn long_technical_prompt_is_high() {
        let mut prompt = String::from(
            "Analyze and evaluate this algorithm, then refactor the code. \
             First study the data, then design the experiment. ",
        );
        prompt.push_str(&"x".repeat(1000));
        let analysis = analyze_complexity(&prompt);
        assert_eq!(analysis.complexity, Complexity::High);
        assert!(analysis.score > 7);
    }

    #[test]
    fn task_precedence() {
        assert_eq!(classify_task("Implement a parser"), TaskType::CodeGeneration);
        assert_eq!(classify_task("Please review this code"), TaskType::CodeReview);
        assert_eq!(classify_task("Solve this puzzle"), TaskType::ComplexReasoning);
        assert_eq!(classify_task("Design an experiment"), TaskType::ScientificResearch);
        assert_eq!(classify_task("Plot a chart of yields"), TaskType::DataAnalysis);
        assert_eq!(classify_task("Give me a tldr"), TaskType::Summarization);
        assert_eq!(classify_task("Translate to French"), TaskType::Translation);
        assert_eq!(classify_task("Write a poem"), TaskType::CreativeWriting);
        assert_eq!(classify_task("Look at this photo"), TaskType::Vision);
        assert_eq!(classify_task("hello there"), TaskType::SimpleChat);
        assert_eq!(classify_task("Tell me about spores"), TaskType::General);
    }

    #[test]
    fn code_wins_over_reasoning() {
        assert_eq!(classify_task("Analyze this function"), TaskType::CodeGeneration);
    }

    #[test]
    fn task_type_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskType::ScientificResearch).unwrap();
        assert_eq!(json, "\"scientific-research\"");
        assert_eq!(TaskType::CodeReview.to_string(), "code-review");
    }
}
