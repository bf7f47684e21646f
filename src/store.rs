//! Collaborators at the edge of the analyzer: where telemetry comes from and
//! where results go.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ObservationError, SinkError, SourceError};
use crate::types::{AnalysisResult, Observation, Origin, Severity};

/// Recent samples for one unit, most recent first.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub history: Vec<Observation>,
    /// Latest snapshot; `None` when the unit has no samples yet.
    pub current: Option<Observation>,
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Unit to analyze when none is configured.
    async fn default_unit(&self) -> Result<String, SourceError>;

    /// Identifier of the newest sample, used for change detection.
    async fn latest_marker(&self, unit: &str) -> Result<Option<String>, SourceError>;

    async fn fetch(&self, unit: &str, limit: usize) -> Result<Telemetry, SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRecord {
    pub department_id: String,
    pub predicted_for: DateTime<Utc>,
    pub predicted_occupied_beds: u32,
    pub model_version: String,
    pub origin: Origin,
}

impl ForecastRecord {
    pub fn from_result(
        unit: &str,
        result: &AnalysisResult,
        now: DateTime<Utc>,
        horizon: Duration,
        model_version: impl Into<String>,
    ) -> Self {
        let horizon =
            chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            department_id: unit.to_string(),
            predicted_for: now + horizon,
            predicted_occupied_beds: result.forecast,
            model_version: model_version.into(),
            origin: Origin::Prediction,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub department_id: String,
    pub severity: Severity,
    pub message: String,
    pub origin: Origin,
}

impl AlertRecord {
    /// `None` for normal severity.
    pub fn from_result(unit: &str, result: &AnalysisResult) -> Option<Self> {
        if !result.severity.is_alerting() {
            return None;
        }
        Some(Self {
            department_id: unit.to_string(),
            severity: result.severity,
            message: format!(
                "AI LOGIC: {} ACTION: {}",
                result.risk_reasoning, result.action_plan
            ),
            origin: Origin::Alert,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Started,
    Completed,
    /// A fallback result was used instead of the configured remote backend.
    Degraded,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Started => "started",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Degraded => "degraded",
            ActivityStatus::Failed => "failed",
        }
    }
}

/// One entry in the operator-facing activity feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub origin: Origin,
    pub action: String,
    pub status: ActivityStatus,
    pub detail: Map<String, Value>,
}

impl ActivityRecord {
    pub fn new(origin: Origin, action: impl Into<String>, status: ActivityStatus) -> Self {
        Self {
            origin,
            action: action.into(),
            status,
            detail: Map::new(),
        }
    }

    pub fn started(origin: Origin, action: impl Into<String>) -> Self {
        Self::new(origin, action, ActivityStatus::Started)
    }

    pub fn completed(origin: Origin, action: impl Into<String>) -> Self {
        Self::new(origin, action, ActivityStatus::Completed)
    }

    pub fn failed(origin: Origin, action: impl Into<String>) -> Self {
        Self::new(origin, action, ActivityStatus::Failed)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    /// Detail fields plus `status` and `origin`.
    pub fn metadata(&self) -> Value {
        let mut metadata = self.detail.clone();
        metadata.insert("status".to_string(), self.status.as_str().into());
        metadata.insert("origin".to_string(), self.origin.as_str().into());
        Value::Object(metadata)
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record_forecast(&self, record: &ForecastRecord) -> Result<(), SinkError>;

    async fn record_alert(&self, record: &AlertRecord) -> Result<(), SinkError>;

    async fn record_activity(&self, record: &ActivityRecord) -> Result<(), SinkError>;
}

/// PostgREST (Supabase) client serving as both telemetry source and sink.
///
/// Each [`Origin`] is written under its own row in the `agents` table, which is
/// looked up (or created) on first use and referenced from every insert.
pub struct SupabaseStore {
    http: reqwest::Client,
    rest_url: String,
    api_key: String,
    agents: Mutex<HashMap<Origin, Value>>,
}

/// `agents.name` and `agents.agent_type` for each origin.
fn agent_profile(origin: Origin) -> (&'static str, &'static str) {
    match origin {
        Origin::Prediction => ("Occupancy Forecaster", "prediction"),
        Origin::Alert => ("Risk Sentinel", "decision"),
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Value,
}

#[derive(Serialize)]
struct AgentRow {
    name: &'static str,
    agent_type: &'static str,
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    department_id: &'a str,
    predicted_for: DateTime<Utc>,
    predicted_occupied_beds: u32,
    model_version: &'a str,
    created_by_agent: &'a Value,
}

impl<'a> PredictionRow<'a> {
    fn new(record: &'a ForecastRecord, agent: &'a Value) -> Self {
        Self {
            department_id: &record.department_id,
            predicted_for: record.predicted_for,
            predicted_occupied_beds: record.predicted_occupied_beds,
            model_version: &record.model_version,
            created_by_agent: agent,
        }
    }
}

#[derive(Serialize)]
struct AlertRow<'a> {
    department_id: &'a str,
    severity: Severity,
    message: &'a str,
    created_by_agent: &'a Value,
}

impl<'a> AlertRow<'a> {
    fn new(record: &'a AlertRecord, agent: &'a Value) -> Self {
        Self {
            department_id: &record.department_id,
            severity: record.severity,
            message: &record.message,
            created_by_agent: agent,
        }
    }
}

#[derive(Serialize)]
struct AgentLogRow<'a> {
    agent_id: &'a Value,
    action: &'a str,
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct BedStatusRow {
    id: Value,
    total_beds: i64,
    occupied_beds: i64,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<BedStatusRow> for Observation {
    type Error = ObservationError;

    fn try_from(row: BedStatusRow) -> Result<Self, Self::Error> {
        let total = u32::try_from(row.total_beds)
            .map_err(|_| ObservationError::Negative(row.total_beds))?;
        let occupied = u32::try_from(row.occupied_beds)
            .map_err(|_| ObservationError::Negative(row.occupied_beds))?;
        Observation::new(row.recorded_at, total, occupied)
    }
}

/// PostgREST returns ids as numbers or uuid strings.
fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SupabaseStore {
    pub fn new(
        url: impl AsRef<str>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", url.as_ref().trim_end_matches('/')),
            api_key: api_key.into(),
            agents: Mutex::new(HashMap::new()),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn select<T: for<'de> Deserialize<'de>>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SourceError> {
        let url = format!("{}/{}", self.rest_url, table);
        let response = self.authed(self.http.get(&url)).query(query).send().await?;
        let response = check_source(response).await?;
        Ok(response.json().await?)
    }

    async fn post<T: Serialize + Sync>(
        &self,
        table: &str,
        row: &T,
        prefer: &str,
    ) -> Result<Response, SinkError> {
        let url = format!("{}/{}", self.rest_url, table);
        let response = self
            .authed(self.http.post(&url))
            .header("Prefer", prefer)
            .json(row)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(table, "row inserted");
        Ok(response)
    }

    async fn insert<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<(), SinkError> {
        self.post(table, row, "return=minimal").await?;
        Ok(())
    }

    /// Id of the `agents` row for `origin`, created on first use.
    async fn agent_id(&self, origin: Origin) -> Result<Value, SinkError> {
        let mut agents = self.agents.lock().await;
        if let Some(id) = agents.get(&origin) {
            return Ok(id.clone());
        }

        let (name, agent_type) = agent_profile(origin);
        let rows: Vec<IdRow> = self
            .select(
                "agents",
                &[
                    ("select", "id".to_string()),
                    ("agent_type", format!("eq.{}", agent_type)),
                    ("limit", "1".to_string()),
                ],
            )
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;

        let id = match rows.into_iter().next() {
            Some(row) => row.id,
            None => {
                let created: Vec<IdRow> = self
                    .post("agents", &AgentRow { name, agent_type }, "return=representation")
                    .await?
                    .json()
                    .await?;
                created
                    .into_iter()
                    .next()
                    .map(|row| row.id)
                    .ok_or_else(|| {
                        SinkError::Request("agents insert returned no row".to_string())
                    })?
            }
        };

        info!(%origin, agent = %id_text(&id), "agent identity resolved");
        agents.insert(origin, id.clone());
        Ok(id)
    }
}

async fn check_source(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl TelemetrySource for SupabaseStore {
    async fn default_unit(&self) -> Result<String, SourceError> {
        let rows: Vec<IdRow> = self
            .select(
                "departments",
                &[("select", "id".to_string()), ("limit", "1".to_string())],
            )
            .await?;
        rows.first().map(|r| id_text(&r.id)).ok_or(SourceError::NoUnit)
    }

    async fn latest_marker(&self, unit: &str) -> Result<Option<String>, SourceError> {
        let rows: Vec<IdRow> = self
            .select(
                "bed_status",
                &[
                    ("select", "id".to_string()),
                    ("department_id", format!("eq.{}", unit)),
                    ("order", "recorded_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.first().map(|r| id_text(&r.id)))
    }

    async fn fetch(&self, unit: &str, limit: usize) -> Result<Telemetry, SourceError> {
        let rows: Vec<BedStatusRow> = self
            .select(
                "bed_status",
                &[
                    ("select", "id,total_beds,occupied_beds,recorded_at".to_string()),
                    ("department_id", format!("eq.{}", unit)),
                    ("order", "recorded_at.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let history: Vec<Observation> = rows
            .into_iter()
            .filter_map(|row| {
                let id = id_text(&row.id);
                match Observation::try_from(row) {
                    Ok(obs) => Some(obs),
                    Err(e) => {
                        warn!(unit, row = %id, error = %e, "skipping invalid bed_status row");
                        None
                    }
                }
            })
            .collect();

        Ok(Telemetry {
            current: history.first().copied(),
            history,
        })
    }
}

#[async_trait]
impl ResultSink for SupabaseStore {
    async fn record_forecast(&self, record: &ForecastRecord) -> Result<(), SinkError> {
        let agent = self.agent_id(record.origin).await?;
        self.insert("predictions", &PredictionRow::new(record, &agent)).await
    }

    async fn record_alert(&self, record: &AlertRecord) -> Result<(), SinkError> {
        let agent = self.agent_id(record.origin).await?;
        self.insert("alerts", &AlertRow::new(record, &agent)).await
    }

    async fn record_activity(&self, record: &ActivityRecord) -> Result<(), SinkError> {
        let agent = self.agent_id(record.origin).await?;
        let row = AgentLogRow {
            agent_id: &agent,
            action: &record.action,
            metadata: record.metadata(),
        };
        self.insert("agent_logs", &row).await
    }
}
