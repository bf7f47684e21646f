use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::agent::TrendAnalyzer;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::store::{
    ActivityRecord, ActivityStatus, AlertRecord, ForecastRecord, ResultSink, TelemetrySource,
};
use crate::types::{AnalysisResult, CycleState, Origin, ResultSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub cycles: u64,
    pub degraded_cycles: u64,
    pub source_failures: u64,
    pub sink_failures: u64,
    /// Cycles that took longer than the poll interval.
    pub overruns: u64,
    pub worst_case: Duration,
}

/// Fixed-interval poller: runs an analysis cycle when new telemetry arrives
/// or when the heartbeat elapses, then writes the outcome to the sink.
pub struct PollLoop {
    analyzer: TrendAnalyzer,
    source: Arc<dyn TelemetrySource>,
    sink: Arc<dyn ResultSink>,
    unit: Option<String>,
    poll_interval: Duration,
    heartbeat: Duration,
    horizon: Duration,
    last_marker: Option<String>,
    last_run: Option<Instant>,
    metrics: LoopMetrics,
}

impl PollLoop {
    pub fn new(
        analyzer: TrendAnalyzer,
        source: Arc<dyn TelemetrySource>,
        sink: Arc<dyn ResultSink>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            analyzer,
            source,
            sink,
            unit: None,
            poll_interval: config.poll_interval,
            heartbeat: config.heartbeat,
            horizon: config.horizon,
            last_marker: None,
            last_run: None,
            metrics: LoopMetrics::default(),
        }
    }

    /// Pin the loop to one department instead of the source's default.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn metrics(&self) -> LoopMetrics {
        self.metrics
    }

    pub fn analyzer(&self) -> &TrendAnalyzer {
        &self.analyzer
    }

    async fn resolve_unit(&mut self) -> Result<String> {
        if let Some(unit) = &self.unit {
            return Ok(unit.clone());
        }
        let unit = self.source.default_unit().await?;
        info!(unit = %unit, "using default department");
        self.unit = Some(unit.clone());
        Ok(unit)
    }

    fn heartbeat_due(&self) -> bool {
        self.last_run
            .map_or(true, |last| last.elapsed() >= self.heartbeat)
    }

    /// One poll. Returns the analysis when a cycle ran, `None` when there was
    /// nothing new to process.
    pub async fn tick(&mut self) -> Result<Option<AnalysisResult>> {
        let unit = match self.resolve_unit().await {
            Ok(unit) => unit,
            Err(e) => {
                self.metrics.source_failures += 1;
                return Err(e);
            }
        };

        let marker = match self.source.latest_marker(&unit).await {
            Ok(marker) => marker,
            Err(e) => {
                self.metrics.source_failures += 1;
                return Err(e.into());
            }
        };

        if marker != self.last_marker {
            info!(unit = %unit, marker = ?marker, "new telemetry detected");
        } else if self.heartbeat_due() {
            info!(unit = %unit, "heartbeat cycle");
        } else {
            return Ok(None);
        }

        let start = Instant::now();
        let started = ActivityRecord::started(Origin::Prediction, "Scanning telemetry")
            .with_detail("department_id", unit.as_str());
        self.report(started).await;

        let result = match self.analyzer.run_cycle(self.source.as_ref(), &unit).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.source_failures += 1;
                let failed = ActivityRecord::failed(Origin::Prediction, "Telemetry fetch")
                    .with_detail("reason", e.to_string());
                self.report(failed).await;
                return Err(e.into());
            }
        };

        self.report_outcome(&result).await;
        self.persist(&unit, &result).await;

        let elapsed = start.elapsed();
        if elapsed > self.poll_interval {
            self.metrics.overruns += 1;
        }
        if elapsed > self.metrics.worst_case {
            self.metrics.worst_case = elapsed;
        }
        self.metrics.cycles += 1;
        self.metrics.degraded_cycles = self.analyzer.degraded_cycles();

        self.last_marker = marker;
        self.last_run = Some(Instant::now());
        Ok(Some(result))
    }

    fn model_version(&self, source: ResultSource) -> String {
        match (source, self.analyzer.remote_name()) {
            (ResultSource::Remote, Some(model)) => model.to_string(),
            (ResultSource::Cached, Some(model)) => format!("{}-cached", model),
            _ => "heuristic".to_string(),
        }
    }

    async fn report(&mut self, record: ActivityRecord) {
        if let Err(e) = self.sink.record_activity(&record).await {
            self.metrics.sink_failures += 1;
            warn!(action = %record.action, error = %e, "could not record activity");
        }
    }

    /// Only a cycle that used the configured remote backend is "completed".
    async fn report_outcome(&mut self, result: &AnalysisResult) {
        let status = if self.analyzer.current_state() == CycleState::Degraded {
            ActivityStatus::Degraded
        } else {
            ActivityStatus::Completed
        };

        let mut record = ActivityRecord::new(Origin::Prediction, "Occupancy analysis", status)
            .with_detail("source", result.source.as_str())
            .with_detail("model_version", self.model_version(result.source));
        if let Some(kind) = self.analyzer.last_failure() {
            record = record.with_detail("fallback_reason", kind);
        }
        self.report(record).await;
    }

    /// Sink failures are logged and counted; they never stop the loop.
    async fn persist(&mut self, unit: &str, result: &AnalysisResult) {
        let forecast = ForecastRecord::from_result(
            unit,
            result,
            Utc::now(),
            self.horizon,
            self.model_version(result.source),
        );
        match self.sink.record_forecast(&forecast).await {
            Ok(()) => {
                let recorded = ActivityRecord::completed(forecast.origin, "Forecast recorded")
                    .with_detail("forecast", result.forecast)
                    .with_detail("model_version", forecast.model_version.as_str());
                self.report(recorded).await;
            }
            Err(e) => {
                self.metrics.sink_failures += 1;
                warn!(unit, error = %e, "could not record forecast");
            }
        }

        if let Some(alert) = AlertRecord::from_result(unit, result) {
            match self.sink.record_alert(&alert).await {
                Ok(()) => {
                    let raised = ActivityRecord::completed(alert.origin, "Alert raised")
                        .with_detail("severity", alert.severity.as_str());
                    self.report(raised).await;
                }
                Err(e) => {
                    self.metrics.sink_failures += 1;
                    warn!(unit, severity = %alert.severity, error = %e, "could not record alert");
                }
            }
        }
    }

    /// Poll until `shutdown` resolves. Shutdown is only observed between
    /// cycles, so a cycle in progress always completes.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(Some(_)) => info!("cycle finished; idle"),
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "cycle aborted"),
                    }
                }
                _ = &mut shutdown => {
                    info!(metrics = ?self.metrics, "shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReasoningBackend;
    use crate::cache::MemoryResultCache;
    use crate::error::{BackendError, SinkError, SourceError};
    use crate::store::Telemetry;
    use crate::types::{Observation, SampleWindow, Severity};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct StaticSource {
        marker: Mutex<Option<String>>,
        occupied: u32,
        fetch_down: AtomicBool,
    }

    impl StaticSource {
        fn new(marker: Option<&str>, occupied: u32) -> Arc<Self> {
            Arc::new(Self {
                marker: Mutex::new(marker.map(str::to_string)),
                occupied,
                fetch_down: AtomicBool::new(false),
            })
        }

        fn set_marker(&self, marker: &str) {
            *self.marker.lock().unwrap() = Some(marker.to_string());
        }
    }

    #[async_trait]
    impl TelemetrySource for StaticSource {
        async fn default_unit(&self) -> std::result::Result<String, SourceError> {
            Ok("er".to_string())
        }

        async fn latest_marker(&self, _: &str) -> std::result::Result<Option<String>, SourceError> {
            Ok(self.marker.lock().unwrap().clone())
        }

        async fn fetch(&self, _: &str, _: usize) -> std::result::Result<Telemetry, SourceError> {
            if self.fetch_down.load(Ordering::SeqCst) {
                return Err(SourceError::Status {
                    status: 503,
                    body: "upstream unavailable".to_string(),
                });
            }
            let obs = Observation::new(Utc::now(), 200, self.occupied).unwrap();
            Ok(Telemetry {
                history: vec![obs; 14],
                current: Some(obs),
            })
        }
    }

    /// Keeps everything written; forecast and alert writes can be made to fail.
    #[derive(Default)]
    struct RecordingSink {
        forecasts: Mutex<u32>,
        alerts: Mutex<u32>,
        activity: Mutex<Vec<ActivityRecord>>,
        results_down: bool,
    }

    impl RecordingSink {
        fn rejecting_results() -> Arc<Self> {
            Arc::new(Self {
                results_down: true,
                ..Self::default()
            })
        }

        fn forecasts(&self) -> u32 {
            *self.forecasts.lock().unwrap()
        }

        fn alerts(&self) -> u32 {
            *self.alerts.lock().unwrap()
        }

        fn activity(&self) -> Vec<ActivityRecord> {
            self.activity.lock().unwrap().clone()
        }

        fn actions(&self) -> Vec<String> {
            self.activity().into_iter().map(|a| a.action).collect()
        }

        fn outcome(&self) -> ActivityRecord {
            self.activity()
                .into_iter()
                .rfind(|a| a.action == "Occupancy analysis")
                .unwrap()
        }

        fn reject(&self) -> std::result::Result<(), SinkError> {
            if self.results_down {
                return Err(SinkError::Status {
                    status: 400,
                    body: "column does not exist".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn record_forecast(&self, _: &ForecastRecord) -> std::result::Result<(), SinkError> {
            self.reject()?;
            *self.forecasts.lock().unwrap() += 1;
            Ok(())
        }

        async fn record_alert(&self, _: &AlertRecord) -> std::result::Result<(), SinkError> {
            self.reject()?;
            *self.alerts.lock().unwrap() += 1;
            Ok(())
        }

        async fn record_activity(
            &self,
            record: &ActivityRecord,
        ) -> std::result::Result<(), SinkError> {
            self.activity.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ReasoningBackend for Unreachable {
        async fn analyze(
            &self,
            _: &SampleWindow,
        ) -> std::result::Result<AnalysisResult, BackendError> {
            Err(BackendError::RateLimited)
        }

        fn name(&self) -> &str {
            "test-model"
        }
    }

    struct Healthy;

    #[async_trait]
    impl ReasoningBackend for Healthy {
        async fn analyze(
            &self,
            _: &SampleWindow,
        ) -> std::result::Result<AnalysisResult, BackendError> {
            Ok(AnalysisResult {
                forecast: 140,
                forecast_reasoning: "steady discharges".to_string(),
                severity: Severity::Normal,
                risk_reasoning: "70% projected".to_string(),
                action_plan: "none".to_string(),
                source: ResultSource::Remote,
            })
        }

        fn name(&self) -> &str {
            "test-model"
        }
    }

    fn poll_loop_with(
        source: Arc<StaticSource>,
        sink: Arc<RecordingSink>,
        remote: Option<Box<dyn ReasoningBackend>>,
    ) -> PollLoop {
        let config = AgentConfig::default();
        let cache = Arc::new(MemoryResultCache::new());
        let analyzer = TrendAnalyzer::from_config(&config, remote, cache);
        PollLoop::new(analyzer, source, sink, &config)
    }

    fn poll_loop(source: Arc<StaticSource>, sink: Arc<RecordingSink>) -> PollLoop {
        poll_loop_with(source, sink, None)
    }

    #[tokio::test]
    async fn tick_updates_metrics() {
        let source = StaticSource::new(Some("1"), 150);
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(source.clone(), sink.clone());

        let first = poller.tick().await.unwrap();
        assert!(first.is_some());
        assert_eq!(poller.metrics().cycles, 1);
        assert_eq!(sink.forecasts(), 1);
        assert_eq!(sink.alerts(), 0);

        // unchanged marker, heartbeat not due
        assert!(poller.tick().await.unwrap().is_none());
        assert_eq!(poller.metrics().cycles, 1);

        source.set_marker("2");
        assert!(poller.tick().await.unwrap().is_some());
        assert_eq!(poller.metrics().cycles, 2);
    }

    #[tokio::test]
    async fn alerts_written_for_warning() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(StaticSource::new(Some("1"), 170), sink.clone());

        poller.tick().await.unwrap();

        assert_eq!(sink.forecasts(), 1);
        assert_eq!(sink.alerts(), 1);
    }

    // ========================================================================
    // ACTIVITY FEED
    // ========================================================================

    #[tokio::test]
    async fn activity_follows_cycle_stages() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(StaticSource::new(Some("1"), 170), sink.clone());

        poller.tick().await.unwrap();

        assert_eq!(
            sink.actions(),
            [
                "Scanning telemetry",
                "Occupancy analysis",
                "Forecast recorded",
                "Alert raised"
            ]
        );
        let activity = sink.activity();
        assert_eq!(activity[0].status, ActivityStatus::Started);
        assert_eq!(activity[0].detail["department_id"], "er");
        assert_eq!(activity[2].origin, Origin::Prediction);
        assert_eq!(activity[2].detail["forecast"], 178);
        assert_eq!(activity[3].origin, Origin::Alert);
        assert_eq!(activity[3].detail["severity"], "warning");
    }

    #[tokio::test]
    async fn fallback_is_reported_degraded() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop_with(
            StaticSource::new(Some("1"), 150),
            sink.clone(),
            Some(Box::new(Unreachable)),
        );

        let result = poller.tick().await.unwrap().unwrap();

        assert_eq!(result.source, ResultSource::Heuristic);
        let outcome = sink.outcome();
        assert_eq!(outcome.status, ActivityStatus::Degraded);
        assert_eq!(outcome.detail["source"], "heuristic");
        assert_eq!(outcome.detail["fallback_reason"], "rate_limited");
        assert_eq!(outcome.detail["model_version"], "heuristic");
        assert!(!sink
            .activity()
            .iter()
            .any(|a| a.action == "Occupancy analysis" && a.status == ActivityStatus::Completed));
        assert_eq!(poller.metrics().degraded_cycles, 1);
        assert_eq!(poller.metrics().degraded_cycles, poller.analyzer().degraded_cycles());
    }

    #[tokio::test]
    async fn remote_cycle_is_reported_completed() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop_with(
            StaticSource::new(Some("1"), 150),
            sink.clone(),
            Some(Box::new(Healthy)),
        );

        poller.tick().await.unwrap();

        let outcome = sink.outcome();
        assert_eq!(outcome.status, ActivityStatus::Completed);
        assert_eq!(outcome.detail["source"], "remote");
        assert_eq!(outcome.detail["model_version"], "test-model");
        assert!(!outcome.detail.contains_key("fallback_reason"));
        assert_eq!(poller.metrics().degraded_cycles, 0);
    }

    // ========================================================================
    // FAILURE PATHS
    // ========================================================================

    #[tokio::test]
    async fn source_failure_aborts_and_retries() {
        let source = StaticSource::new(Some("1"), 150);
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(source.clone(), sink.clone());
        poller.tick().await.unwrap();

        source.set_marker("2");
        source.fetch_down.store(true, Ordering::SeqCst);
        assert!(poller.tick().await.is_err());

        assert_eq!(poller.analyzer().current_state(), CycleState::Idle);
        assert_eq!(poller.metrics().source_failures, 1);
        assert_eq!(poller.metrics().cycles, 1);
        let failed = sink.activity().pop().unwrap();
        assert_eq!(failed.action, "Telemetry fetch");
        assert_eq!(failed.status, ActivityStatus::Failed);

        // marker "2" was never consumed, so the next poll runs the cycle
        source.fetch_down.store(false, Ordering::SeqCst);
        assert!(poller.tick().await.unwrap().is_some());
        assert_eq!(poller.metrics().cycles, 2);
        assert_eq!(poller.analyzer().current_state(), CycleState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reruns_unchanged_marker() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(StaticSource::new(Some("1"), 150), sink.clone());
        let heartbeat = AgentConfig::default().heartbeat;

        assert!(poller.tick().await.unwrap().is_some());

        tokio::time::advance(heartbeat - Duration::from_secs(1)).await;
        assert!(poller.tick().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(poller.tick().await.unwrap().is_some());
        assert_eq!(poller.metrics().cycles, 2);
        assert_eq!(sink.forecasts(), 2);
    }

    #[tokio::test]
    async fn sink_failure_is_counted_and_loop_continues() {
        let source = StaticSource::new(Some("1"), 195);
        let sink = RecordingSink::rejecting_results();
        let mut poller = poll_loop(source.clone(), sink.clone());

        let result = poller.tick().await.unwrap().unwrap();

        assert_eq!(result.severity, Severity::Critical);
        // forecast and alert
        assert_eq!(poller.metrics().sink_failures, 2);
        assert_eq!(sink.actions(), ["Scanning telemetry", "Occupancy analysis"]);

        source.set_marker("2");
        assert!(poller.tick().await.unwrap().is_some());
        assert_eq!(poller.metrics().cycles, 2);
        assert_eq!(poller.metrics().sink_failures, 4);
    }

    #[tokio::test]
    async fn shutdown_stops_run() {
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poll_loop(StaticSource::new(None, 100), sink);

        poller.run(async {}).await;

        assert!(poller.metrics().cycles <= 1);
    }
}
