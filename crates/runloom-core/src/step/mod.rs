//! Step model: results, errors, nodes and handler registration

mod node;
mod result;

pub use node::{
    AsyncStepFn, OnLimitExceeded, RoutePredicate, StepBuilder, StepFn, StepFuture, StepKind,
    StepNode,
};
pub use result::{
    AsyncRequest, IntoStepResult, StepError, StepResult, SuspendRequest,
};
