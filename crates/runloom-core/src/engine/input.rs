//! Input preparation
//!
//! Computes the argument for the next step to execute. The decision
//! order is fixed; the first rule that matches wins:
//!
//! 1. pending resume input, if assignable (consumed)
//! 2. explicit resumed-step input, if assignable (consumed)
//! 3. the initial step gets the trigger data
//! 4. the newest non-null type-compatible step output
//! 5. context-input steps get no argument
//! 6. trigger data, if assignable; otherwise nothing

use crate::context::WorkflowContext;
use crate::graph::WorkflowGraph;
use crate::step::StepNode;
use crate::value::{InputType, TypedValue};

/// Select the argument for a step
pub fn prepare_input(
    graph: &WorkflowGraph,
    step: &StepNode,
    ctx: &WorkflowContext,
) -> Option<TypedValue> {
    let types = graph.types();

    // Pending resume input beats the initial-step rule: a suspended
    // initial step must consume its input instead of re-reading the
    // trigger and suspending again.
    if let Some(input) = ctx.user_input() {
        if types.accepts(step.input(), &input.tag) {
            return ctx.take_user_input();
        }
    }

    if let Some(input) = ctx.resumed_step_input() {
        if types.accepts(step.input(), &input.tag) {
            return ctx.take_resumed_step_input();
        }
    }

    if step.is_initial() {
        return ctx.trigger();
    }

    if matches!(step.input(), InputType::Context) {
        // The executor injects the context itself; no argument
        return None;
    }

    for (_, output) in ctx.outputs_newest_first() {
        if !output.is_null() && types.accepts(step.input(), &output.tag) {
            return Some(output);
        }
    }

    if let Some(trigger) = ctx.trigger() {
        if types.accepts(step.input(), &trigger.tag) {
            return Some(trigger);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepResult, StepNode};
    use serde_json::json;

    fn graph_with(steps: Vec<StepNode>) -> WorkflowGraph {
        let mut builder = WorkflowGraph::builder("g", 1).trigger_tag("trigger");
        for step in steps {
            builder = builder.step(step);
        }
        builder.build().expect("graph should build")
    }

    fn noop(id: &str) -> crate::step::StepBuilder {
        StepNode::builder(id).handler(|_input, _ctx| async move { Ok(StepResult::proceed()) })
    }

    fn trigger_ctx() -> WorkflowContext {
        WorkflowContext::new(
            "i-1",
            Some(TypedValue::new("trigger", json!({ "name": "Ada" }))),
        )
    }

    #[test]
    fn test_initial_step_gets_trigger() {
        let graph = graph_with(vec![
            noop("a").initial().input_tag("whatever").build().unwrap()
        ]);
        let ctx = trigger_ctx();
        // Even with outputs present, the initial step sees the trigger
        ctx.set_output("x", Some(TypedValue::new("whatever", json!(1))));

        let input = prepare_input(&graph, graph.step("a").unwrap(), &ctx);
        assert_eq!(input.unwrap().tag.as_str(), "trigger");
    }

    #[test]
    fn test_user_input_consumed_when_assignable() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").input_tag("name_input").build().unwrap(),
        ]);
        let ctx = trigger_ctx();
        ctx.set_user_input(TypedValue::new("name_input", json!({ "name": "Ada" })));

        let input = prepare_input(&graph, graph.step("b").unwrap(), &ctx);
        assert_eq!(input.unwrap().tag.as_str(), "name_input");
        // Consumed on use
        assert!(ctx.user_input().is_none());
    }

    #[test]
    fn test_unassignable_user_input_left_in_place() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").input_tag("numbers").build().unwrap(),
        ]);
        let ctx = trigger_ctx();
        ctx.set_user_input(TypedValue::new("letters", json!("abc")));

        let input = prepare_input(&graph, graph.step("b").unwrap(), &ctx);
        assert!(input.is_none());
        assert!(ctx.user_input().is_some());
    }

    #[test]
    fn test_newest_compatible_output_wins() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").input_tag("numbers").build().unwrap(),
        ]);
        let ctx = trigger_ctx();
        ctx.set_output("old", Some(TypedValue::new("numbers", json!(1))));
        ctx.set_output("skip", Some(TypedValue::new("letters", json!("x"))));
        ctx.set_output("new", Some(TypedValue::new("numbers", json!(2))));

        let input = prepare_input(&graph, graph.step("b").unwrap(), &ctx).unwrap();
        assert_eq!(input.value, json!(2));
    }

    #[test]
    fn test_any_value_marker_accepts_newest_output() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").accepts_any().build().unwrap(),
        ]);
        let ctx = trigger_ctx();
        ctx.set_output("x", Some(TypedValue::new("letters", json!("x"))));

        let input = prepare_input(&graph, graph.step("b").unwrap(), &ctx).unwrap();
        assert_eq!(input.tag.as_str(), "letters");
    }

    #[test]
    fn test_context_input_step_gets_no_argument() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").context_input().build().unwrap(),
        ]);
        let ctx = trigger_ctx();
        ctx.set_output("x", Some(TypedValue::new("letters", json!("x"))));

        assert!(prepare_input(&graph, graph.step("b").unwrap(), &ctx).is_none());
    }

    #[test]
    fn test_trigger_fallback() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").input_tag("trigger").build().unwrap(),
        ]);
        let ctx = trigger_ctx();

        let input = prepare_input(&graph, graph.step("b").unwrap(), &ctx).unwrap();
        assert_eq!(input.tag.as_str(), "trigger");
    }

    #[test]
    fn test_nothing_assignable_yields_none() {
        let graph = graph_with(vec![
            noop("a").initial().build().unwrap(),
            noop("b").input_tag("numbers").build().unwrap(),
        ]);
        let ctx = trigger_ctx();

        assert!(prepare_input(&graph, graph.step("b").unwrap(), &ctx).is_none());
    }
}
