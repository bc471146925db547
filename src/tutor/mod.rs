pub mod config;
pub mod grading;
pub mod mastery;
pub mod orchestrator;
pub mod policy;
pub mod projection;
pub mod remediation;
pub mod types;

pub use config::TutorConfig;
pub use orchestrator::{PersistStage, TutorError, TutorOrchestrator};
pub use policy::{PolicyAgent, PolicyHandle};
pub use types::*;
