//! Case management: lifecycle state machine, workflow operations, routes.

pub mod machine;
pub mod model;
pub mod routes;
pub mod workflow;

pub use machine::{CaseEvent, Transition, TransitionError};
pub use model::{Activity, ActivityType, Case, CaseState, DashboardSummary, Priority, Review, ReviewKind, ReviewState};
pub use workflow::{CaseWorkflow, NewCase};
