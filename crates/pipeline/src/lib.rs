pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod stages;
pub mod state;

pub use config::{AppConfig, ConfigError, OperationMode};
pub use error::{PipelineError, StageError};
pub use executor::{Backoff, StageExecutor, StageOutcome, StageResult};
pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use queue::{IntakeQueue, StatusCallback, StatusUpdate};
pub use stages::{ProcessingContext, StageOutput, Stages};
pub use state::{Event, TransitionError, transition};
