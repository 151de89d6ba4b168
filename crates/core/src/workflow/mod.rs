pub mod chain;
pub mod node;
pub mod orchestrator;
pub mod step_executor;

pub use chain::execution_order;
pub use node::NodeKind;
pub use orchestrator::{Orchestrator, RunFailure, RunHandle, RunOutcome, StartRun};
pub use step_executor::StepExecutor;
