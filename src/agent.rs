use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backend::{LocalHeuristic, ReasoningBackend};
use crate::cache::ResultCache;
use crate::config::AgentConfig;
use crate::error::{BackendError, SourceError};
use crate::store::TelemetrySource;
use crate::types::{
    AnalysisResult, CycleEvent, CycleState, Observation, ResultSource, SampleWindow,
    DEFAULT_WINDOW_LEN,
};

/// Appended to `forecast_reasoning` when a cached judgment is replayed.
pub const STALE_MARKER: &str = " (cached)";

/// Decides, once per cycle, which backend result to trust.
///
/// Preference order is remote, then the cached last remote result, then the
/// local heuristic. [`TrendAnalyzer::analyze`] always yields a result.
pub struct TrendAnalyzer {
    state: CycleState,
    remote: Option<Box<dyn ReasoningBackend>>,
    local: LocalHeuristic,
    cache: Arc<dyn ResultCache>,
    remote_timeout: Duration,
    window_len: usize,
    default_capacity: u32,
    degraded_cycles: u64,
    /// `BackendError::kind` of the remote failure in the latest cycle.
    last_failure: Option<&'static str>,
}

impl TrendAnalyzer {
    pub fn new(local: LocalHeuristic, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            state: CycleState::Idle,
            remote: None,
            local,
            cache,
            remote_timeout: Duration::from_secs(30),
            window_len: DEFAULT_WINDOW_LEN,
            default_capacity: 200,
            degraded_cycles: 0,
            last_failure: None,
        }
    }

    pub fn from_config(
        config: &AgentConfig,
        remote: Option<Box<dyn ReasoningBackend>>,
        cache: Arc<dyn ResultCache>,
    ) -> Self {
        let mut analyzer = Self::new(LocalHeuristic::new(config.heuristic), cache);
        analyzer.remote = remote;
        analyzer.remote_timeout = config.remote_timeout;
        analyzer.window_len = config.window_len;
        analyzer.default_capacity = config.default_capacity;
        analyzer
    }

    pub fn with_remote(mut self, remote: Box<dyn ReasoningBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn current_state(&self) -> CycleState {
        self.state
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.name())
    }

    pub fn degraded_cycles(&self) -> u64 {
        self.degraded_cycles
    }

    /// Why the remote backend was skipped in the latest cycle, if it was.
    pub fn last_failure(&self) -> Option<&'static str> {
        self.last_failure
    }

    fn step(&mut self, event: CycleEvent) {
        let next = transition(self.state, event);
        debug!(from = ?self.state, to = ?next, ?event, "cycle state");
        self.state = next;
    }

    /// Fetch input for `unit` and analyze it. A source failure aborts the
    /// cycle and is returned; nothing after fetching can fail.
    pub async fn run_cycle(
        &mut self,
        source: &dyn TelemetrySource,
        unit: &str,
    ) -> Result<AnalysisResult, SourceError> {
        self.step(CycleEvent::Start);

        let telemetry = match source.fetch(unit, self.window_len).await {
            Ok(t) => t,
            Err(e) => {
                self.step(CycleEvent::Aborted);
                return Err(e);
            }
        };

        let current = telemetry
            .current
            .unwrap_or_else(|| Observation::empty(Utc::now(), self.default_capacity));
        let window = SampleWindow::build_bounded(telemetry.history, current, self.window_len);
        Ok(self.reason_over(window).await)
    }

    /// Analyze caller-supplied history.
    pub async fn analyze(
        &mut self,
        history: Vec<Observation>,
        current: Observation,
    ) -> AnalysisResult {
        self.step(CycleEvent::Start);
        let window = SampleWindow::build_bounded(history, current, self.window_len);
        self.reason_over(window).await
    }

    async fn reason_over(&mut self, window: SampleWindow) -> AnalysisResult {
        self.step(CycleEvent::WindowReady);

        let mut failure = None;
        let result = match self.remote.as_deref() {
            None => {
                debug!(samples = window.len(), "no remote backend; using heuristic");
                self.local.evaluate(&window)
            }
            Some(remote) => match self.call_remote(remote, &window).await {
                Ok(result) => {
                    if let Err(e) = self.cache.save(&result).await {
                        warn!(error = %e, "could not persist remote analysis to cache");
                    }
                    result
                }
                Err(e) => {
                    warn!(
                        backend = remote.name(),
                        kind = e.kind(),
                        error = %e,
                        "remote analysis failed; falling back"
                    );
                    failure = Some(e.kind());
                    self.fallback(&window).await
                }
            },
        };

        self.last_failure = failure;
        let degraded = self.remote.is_some() && result.source != ResultSource::Remote;
        if degraded {
            self.degraded_cycles += 1;
        }
        self.step(CycleEvent::Analyzed { degraded });

        info!(
            source = %result.source,
            severity = %result.severity,
            forecast = result.forecast,
            degraded,
            "analysis complete"
        );
        result
    }

    async fn call_remote(
        &self,
        remote: &dyn ReasoningBackend,
        window: &SampleWindow,
    ) -> Result<AnalysisResult, BackendError> {
        let mut result = tokio::time::timeout(self.remote_timeout, remote.analyze(window))
            .await
            .map_err(|_| BackendError::Timeout(self.remote_timeout))??;
        result.source = ResultSource::Remote;
        Ok(result)
    }

    async fn fallback(&self, window: &SampleWindow) -> AnalysisResult {
        match self.cache.load().await {
            Ok(mut cached) => {
                info!(forecast = cached.forecast, "serving cached remote analysis");
                cached.source = ResultSource::Cached;
                cached.forecast_reasoning.push_str(STALE_MARKER);
                cached
            }
            Err(e) => {
                info!(reason = %e, "no usable cache; using heuristic");
                self.local.evaluate(window)
            }
        }
    }
}

fn transition(state: CycleState, event: CycleEvent) -> CycleState {
    match (state, event) {
        // A new cycle may begin from any state.
        (_, CycleEvent::Start) => CycleState::Fetching,
        (CycleState::Fetching, CycleEvent::WindowReady) => CycleState::Reasoning,
        (CycleState::Fetching, CycleEvent::Aborted) => CycleState::Idle,
        (CycleState::Reasoning, CycleEvent::Analyzed { degraded: false }) => CycleState::Done,
        (CycleState::Reasoning, CycleEvent::Analyzed { degraded: true }) => CycleState::Degraded,
        (state, _) => state,
    }
}
