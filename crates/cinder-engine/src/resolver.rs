use cinder_core::{
    Action, BundleItem, EvaluationContext, FailurePolicy, ItemState, Operation, RunMode,
};

/// Compute the concrete action for one item under the current operation.
///
/// Precedence: rollback mode forces Uninstall for anything present on the
/// system, regardless of authored policy; an externally-supplied action
/// state (from a detection pass) wins next; otherwise the authored
/// per-operation table applies, parameterized by presence.
pub fn resolve_action(
    item: &BundleItem,
    operation: Operation,
    ctx: &EvaluationContext,
    run_mode: RunMode,
) -> Action {
    let present = item.presence.evaluate(ctx);

    if run_mode.is_rollback() {
        // items installed earlier in this same session are present even
        // though the detection variables predate them
        return if present || item.state == ItemState::Complete {
            Action::Uninstall
        } else {
            Action::Noop
        };
    }

    if let Some(action_state) = item.action_state {
        return action_state.to_action();
    }

    let row = item.actions.row(operation);
    if present {
        row.when_present
    } else {
        row.when_absent
    }
}

/// The item-level failure policy authored for this operation. May be
/// Unspecified; the orchestrator merges it with the whole-operation policy.
pub fn resolve_failure_policy(item: &BundleItem, operation: Operation) -> FailurePolicy {
    item.actions.row(operation).on_failure
}
