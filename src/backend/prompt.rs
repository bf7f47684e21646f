//! Prompt construction and response parsing for remote occupancy analysis.
//!
//! One request carries both sub-tasks (24h forecast, risk classification) so
//! that both judgments are made against the same window.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::types::{AnalysisResult, ResultSource, SampleWindow, Severity};

/// Builder for occupancy analysis prompts.
#[derive(Debug, Clone)]
pub struct AnalysisPromptBuilder {
    /// Instruction block placed before the data.
    instructions: String,
}

impl Default for AnalysisPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct HistoryRow {
    recorded_at: String,
    occupied_beds: u32,
    total_beds: u32,
}

impl AnalysisPromptBuilder {
    pub fn new() -> Self {
        Self {
            instructions: Self::default_instructions().to_string(),
        }
    }

    /// Build the full prompt for one window.
    pub fn build(&self, window: &SampleWindow) -> String {
        let rows: Vec<HistoryRow> = window
            .history()
            .iter()
            .map(|o| HistoryRow {
                recorded_at: o.timestamp().to_rfc3339(),
                occupied_beds: o.occupied(),
                total_beds: o.total_capacity(),
            })
            .collect();
        // Serializing plain strings and integers cannot fail.
        let history = serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string());
        let current = window.current();

        format!(
            "Analyze hospital bed occupancy history (most recent first): {}\n\
             Current state: {}/{} beds occupied.\n\n{}",
            history,
            current.occupied(),
            current.total_capacity(),
            self.instructions
        )
    }

    const fn default_instructions() -> &'static str {
        r#"PERFORM 2 TASKS IN 1 OUTPUT:
1. Forecast occupancy for the next 24h as a non-negative integer.
2. Risk assessment: severity (normal/warning/critical), reasoning, and an action plan.

Return ONLY a JSON object with this structure:
{
  "forecast": <int>,
  "forecast_reasoning": "<string>",
  "severity": "<normal|warning|critical>",
  "risk_reasoning": "<string>",
  "action_plan": "<string>"
}"#
    }
}

/// Wire shape of the remote answer.
#[derive(Debug, Deserialize)]
struct RemoteAnalysis {
    forecast: u32,
    forecast_reasoning: String,
    severity: Severity,
    risk_reasoning: String,
    action_plan: String,
}

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        s = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Parse raw model output into a remote-sourced result.
pub fn parse_response(text: &str) -> Result<AnalysisResult, BackendError> {
    let body = strip_code_fences(text);
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(BackendError::Schema("expected a JSON object".to_string()));
    }
    let parsed: RemoteAnalysis =
        serde_json::from_value(value).map_err(|e| BackendError::Schema(e.to_string()))?;

    Ok(AnalysisResult {
        forecast: parsed.forecast,
        forecast_reasoning: parsed.forecast_reasoning,
        severity: parsed.severity,
        risk_reasoning: parsed.risk_reasoning,
        action_plan: parsed.action_plan,
        source: ResultSource::Remote,
    })
}
