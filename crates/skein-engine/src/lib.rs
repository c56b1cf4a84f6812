pub mod approval;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod phase;
pub mod registry;

pub use approval::ApprovalGate;
pub use channel::ChannelManager;
pub use coordinator::{SessionCoordinator, SweepConfig};
pub use error::EngineError;
pub use executor::PhaseExecutor;
pub use phase::{Phase, PhaseOutput, PhaseServices, PhaseStatus};
pub use registry::WorkflowRegistry;
