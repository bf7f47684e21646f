use async_trait::async_trait;

use crate::config::HeuristicParams;
use crate::error::BackendError;
use crate::types::{AnalysisResult, ResultSource, SampleWindow, Severity};

use super::ReasoningBackend;

pub const ACTION_ESCALATE: &str = "activate overflow protocols and notify on-call staffing reserve";
pub const ACTION_MONITOR: &str = "continue standard monitoring";

/// Mean-times-growth projection with fixed ratio bands.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHeuristic {
    params: HeuristicParams,
}

impl LocalHeuristic {
    pub fn new(params: HeuristicParams) -> Self {
        Self { params }
    }

    /// Synchronous form of [`ReasoningBackend::analyze`]; cannot fail.
    pub fn evaluate(&self, window: &SampleWindow) -> AnalysisResult {
        let avg = window.average_occupied();
        // avg >= 0 and growth >= 0, so the cast only saturates on overflow.
        let forecast = (avg * self.params.growth).floor().max(0.0) as u32;

        let capacity = window.current().total_capacity();
        let ratio = if capacity == 0 {
            0.0
        } else {
            f64::from(forecast) / f64::from(capacity)
        };

        let severity = self.params.classify(ratio);
        let action_plan = if severity == Severity::Normal {
            ACTION_MONITOR
        } else {
            ACTION_ESCALATE
        };

        AnalysisResult {
            forecast,
            forecast_reasoning: format!(
                "Deterministic trend analysis: mean of {} samples ({:.1} occupied) projected at x{:.2}.",
                window.len(),
                avg,
                self.params.growth
            ),
            severity,
            risk_reasoning: format!(
                "Occupancy projected to reach {}% capacity.",
                (ratio * 100.0) as u32
            ),
            action_plan: action_plan.to_string(),
            source: ResultSource::Heuristic,
        }
    }
}

#[async_trait]
impl ReasoningBackend for LocalHeuristic {
    async fn analyze(&self, window: &SampleWindow) -> Result<AnalysisResult, BackendError> {
        Ok(self.evaluate(window))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Observation;
    use chrono::{TimeZone, Utc};

    fn window(occupied: &[u32], capacity: u32) -> SampleWindow {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let history = occupied
            .iter()
            .map(|&o| Observation::new(ts, capacity, o).unwrap())
            .collect();
        let current = Observation::new(ts, capacity, occupied.first().copied().unwrap_or(0)).unwrap();
        SampleWindow::build(history, current)
    }

    #[test]
    fn scenario_normal() {
        let result = LocalHeuristic::default().evaluate(&window(&[150; 14], 200));

        assert_eq!(result.forecast, 157);
        assert_eq!(result.severity, Severity::Normal);
        assert_eq!(result.action_plan, ACTION_MONITOR);
        assert_eq!(result.source, ResultSource::Heuristic);
    }

    #[test]
    fn scenario_warning() {
        let result = LocalHeuristic::default().evaluate(&window(&[170; 14], 200));

        assert_eq!(result.forecast, 178);
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(result.action_plan, ACTION_ESCALATE);
        assert!(result.risk_reasoning.contains("89%"));
    }

    #[test]
    fn scenario_critical() {
        let result = LocalHeuristic::default().evaluate(&window(&[195; 14], 200));

        assert_eq!(result.forecast, 204);
        assert_eq!(result.severity, Severity::Critical);
        assert_eq!(result.action_plan, ACTION_ESCALATE);
    }

    #[test]
    fn zero_capacity_is_normal() {
        let result = LocalHeuristic::default().evaluate(&window(&[0, 0, 0], 0));

        assert_eq!(result.forecast, 0);
        assert_eq!(result.severity, Severity::Normal);
        assert!(result.risk_reasoning.contains("0%"));
    }

    #[test]
    fn exact_warning_boundary_is_normal() {
        // 160 / 200 == 0.80 exactly
        let params = HeuristicParams {
            growth: 1.0,
            ..HeuristicParams::default()
        };
        let result = LocalHeuristic::new(params).evaluate(&window(&[160; 4], 200));

        assert_eq!(result.forecast, 160);
        assert_eq!(result.severity, Severity::Normal);
    }

    #[test]
    fn deterministic() {
        let w = window(&[120, 131, 142, 118, 160], 200);
        let heuristic = LocalHeuristic::default();

        assert_eq!(heuristic.evaluate(&w), heuristic.evaluate(&w));
    }

    #[test]
    fn empty_history_uses_current() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let current = Observation::new(ts, 200, 100).unwrap();
        let result = LocalHeuristic::default().evaluate(&SampleWindow::build(Vec::new(), current));

        assert_eq!(result.forecast, 105);
    }

    #[tokio::test]
    async fn usable_as_backend() {
        let heuristic = LocalHeuristic::default();
        let backend: &dyn ReasoningBackend = &heuristic;
        let w = window(&[195; 14], 200);

        let result = backend.analyze(&w).await.unwrap();

        assert_eq!(backend.name(), "heuristic");
        assert_eq!(result, heuristic.evaluate(&w));
    }
}
