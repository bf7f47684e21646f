//! Bed occupancy forecast agent.
//!
//! Turns a sliding window of bed-occupancy samples into a 24h forecast and a
//! risk severity. A remote language model is preferred; when it fails, the
//! last good remote answer is replayed from cache, and failing that a local
//! heuristic is used. Every result carries its [`types::ResultSource`] so a
//! degraded answer is never mistaken for a live one.

pub mod agent;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod store;
pub mod types;

pub use agent::{TrendAnalyzer, STALE_MARKER};
pub use backend::{LocalHeuristic, ReasoningBackend, RemoteInference};
pub use cache::{FileResultCache, MemoryResultCache, ResultCache};
pub use config::{AgentConfig, HeuristicParams};
pub use error::{AgentError, BackendError, CacheError, ConfigError, SinkError, SourceError};
pub use scheduler::{LoopMetrics, PollLoop};
pub use types::{AnalysisResult, Observation, ResultSource, SampleWindow, Severity};
