//! Stack Runner: DAG construction, the node FSM, retry/budget/adaptive
//! policy, and the orchestrator that drives them against a
//! [`ktl_protocol::NodeExecutor`] (`spec.md` §4.1).

pub mod adaptive;
pub mod budget;
pub mod error;
pub mod fsm;
pub mod orchestrator;
pub mod plan;
pub mod retry;

pub use adaptive::{AdaptiveController, ConcurrencyChange, ConcurrencyChangeReason, WorkerPool};
pub use budget::{BudgetController, BudgetGuard};
pub use error::SchedulerError;
pub use fsm::{AttemptOutcome, NodeFsm};
pub use orchestrator::{ResumeInputs, StackRunner};
pub use plan::PlanGraph;
