//! Transition selection.
//!
//! After a step has run (or a reply has been recorded), the loop controller
//! asks which outgoing transition to follow. Transitions are already sorted by
//! priority (stable, so ties keep declaration order); the first whose
//! condition holds wins.

use parley_types::{Contact, Context, InboundEvent};

use crate::condition::ConditionEvaluator;
use crate::definition::{Flow, FlowTransition};

/// Select the transition to follow from `step` of `flow`.
/// Returns `None` when no condition holds (fall-through).
pub fn select_transition<'a>(
    flow: &'a Flow,
    step: &str,
    evaluator: &ConditionEvaluator,
    contact: &Contact,
    event: &InboundEvent,
    context: &Context,
) -> Option<&'a FlowTransition> {
    flow.outgoing(step).iter().find(|t| {
        evaluator.evaluate_descriptor(step, t.condition.as_ref(), flow.patterns(), contact, event, context)
    })
}
