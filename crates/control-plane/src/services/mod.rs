pub mod orchestrator;
pub mod status;

pub use orchestrator::{NoopSleeper, OrchestratorConfig, ScanOrchestrator, Sleeper, TokioSleeper};
pub use status::StatusService;
