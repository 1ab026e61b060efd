//! Prompt templates for each pipeline stage.
//!
//! Templates use `{KEY}` placeholders. The built-in defaults only lay out
//! the inputs; production wording is supplied through the `[prompts]`
//! configuration section.

use serde::{Deserialize, Serialize};

/// One template per AI-backed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Step 2-1: run-level research. Keys: `HYPOTHESIS_COUNT`,
    /// `TARGET_SPEC`, `TECHNICAL_ASSETS`, `EXISTING_HYPOTHESES`.
    pub research: String,
    /// Step 2-1.5: structuring. Keys: `HYPOTHESIS_COUNT`, `RESEARCH_OUTPUT`.
    pub structuring: String,
    /// Step 2-2: per-hypothesis research. Keys: `TITLE`, `SUMMARY`,
    /// `TARGET_SPEC`, `TECHNICAL_ASSETS`.
    pub hypothesis_research: String,
    /// Step 3: business evaluation. Keys: `TITLE`, `RESEARCH_OUTPUT`,
    /// `SCORING_FORMAT`.
    pub business_evaluation: String,
    /// Step 4: technical evaluation. Keys: `TITLE`, `RESEARCH_OUTPUT`,
    /// `BUSINESS_EVALUATION`, `SCORING_FORMAT`.
    pub technical_evaluation: String,
    /// Step 5: integration. Keys: `TITLE`, `RESEARCH_OUTPUT`,
    /// `BUSINESS_EVALUATION`, `TECHNICAL_EVALUATION`.
    pub integration: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            research: "\
Propose {HYPOTHESIS_COUNT} business hypotheses matching the target specification \
to the technical assets. Label each one 【仮説N】 followed by its title.

Target specification:
{TARGET_SPEC}

Technical assets:
{TECHNICAL_ASSETS}

Already proposed (do not repeat):
{EXISTING_HYPOTHESES}
"
            .to_string(),
            structuring: "\
Extract up to {HYPOTHESIS_COUNT} hypotheses from the research below. Reply with JSON only:
{\"hypotheses\": [{\"title\": \"...\", \"summary\": \"...\"}]}

{RESEARCH_OUTPUT}
"
            .to_string(),
            hypothesis_research: "\
Research this business hypothesis in depth.

Title: {TITLE}
Summary: {SUMMARY}

Target specification:
{TARGET_SPEC}

Technical assets:
{TECHNICAL_ASSETS}
"
            .to_string(),
            business_evaluation: "\
Evaluate the business potential of \"{TITLE}\".

{RESEARCH_OUTPUT}

{SCORING_FORMAT}"
                .to_string(),
            technical_evaluation: "\
Evaluate the technical viability of \"{TITLE}\".

{RESEARCH_OUTPUT}

Business evaluation:
{BUSINESS_EVALUATION}

{SCORING_FORMAT}"
                .to_string(),
            integration: "\
Write an integrated report for \"{TITLE}\".

Research:
{RESEARCH_OUTPUT}

Business evaluation:
{BUSINESS_EVALUATION}

Technical evaluation:
{TECHNICAL_EVALUATION}
"
            .to_string(),
        }
    }
}

/// Replace each `{KEY}` with its value. Unknown placeholders are left as-is.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_all_occurrences() {
        let out = render("{A} and {A} but {B}", &[("A", "x"), ("B", "y")]);
        assert_eq!(out, "x and x but y");
    }

    #[test]
    fn test_render_leaves_unknown_keys() {
        assert_eq!(render("{MISSING}", &[("A", "x")]), "{MISSING}");
    }

    #[test]
    fn test_defaults_reference_their_inputs() {
        let t = PromptTemplates::default();
        assert!(t.research.contains("{EXISTING_HYPOTHESES}"));
        assert!(t.structuring.contains("{RESEARCH_OUTPUT}"));
        assert!(t.business_evaluation.contains("{SCORING_FORMAT}"));
        assert!(t.integration.contains("{TECHNICAL_EVALUATION}"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let t: PromptTemplates = toml::from_str("research = \"custom {TARGET_SPEC}\"").unwrap();
        assert_eq!(t.research, "custom {TARGET_SPEC}");
        assert_eq!(t.integration, PromptTemplates::default().integration);
    }
}
