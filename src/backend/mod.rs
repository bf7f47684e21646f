//! Reasoning backends: strategies that turn a [`SampleWindow`] into an
//! [`AnalysisResult`].
//!
//! - [`LocalHeuristic`]: pure, total, never fails.
//! - [`RemoteInference`]: delegates to an [`InferenceClient`]; every failure
//!   mode is reported as a [`BackendError`].

mod heuristic;
mod prompt;
mod remote;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::types::{AnalysisResult, SampleWindow};

pub use heuristic::{LocalHeuristic, ACTION_ESCALATE, ACTION_MONITOR};
pub use prompt::{parse_response, strip_code_fences, AnalysisPromptBuilder};
pub use remote::{GeminiClient, InferenceClient, RemoteInference, DEFAULT_GEMINI_BASE_URL};

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn analyze(&self, window: &SampleWindow) -> Result<AnalysisResult, BackendError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}
