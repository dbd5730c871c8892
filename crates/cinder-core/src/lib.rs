mod action;
mod item;
mod manifest;
mod predicate;
mod result;

pub use action::{
    merged_failure_policy, Action, ActionState, ActionTable, FailurePolicy, Operation,
    OperationRow, RunMode,
};
pub use item::{BundleItem, ExeKind, ItemSet, ItemState, PackageKind, PatchTrain, Payload};
pub use manifest::{
    ActionTableManifest, BundleManifest, ItemManifest, OperationPolicies, OperationRowManifest,
    PayloadManifest,
};
pub use predicate::{EvaluationContext, Predicate};
pub use result::{FirstError, ResultCode, Verdict};
