use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Top-level operation the driver asked the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Installing,
    Uninstalling,
    Repairing,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "install",
            Self::Uninstalling => "uninstall",
            Self::Repairing => "repair",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "install" => Ok(Self::Installing),
            "uninstall" => Ok(Self::Uninstalling),
            "repair" => Ok(Self::Repairing),
            _ => Err(anyhow!("invalid operation: {value}")),
        }
    }

    pub fn wire_value(self) -> u32 {
        match self {
            Self::Installing => 0,
            Self::Uninstalling => 1,
            Self::Repairing => 2,
        }
    }

    pub fn from_wire_value(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Installing),
            1 => Ok(Self::Uninstalling),
            2 => Ok(Self::Repairing),
            _ => Err(anyhow!("invalid operation wire value: {value}")),
        }
    }
}

/// Concrete per-item action, resolved fresh on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Uninstall,
    Repair,
    Noop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Repair => "repair",
            Self::Noop => "noop",
        }
    }

    pub fn wire_value(self) -> u32 {
        match self {
            Self::Install => 0,
            Self::Uninstall => 1,
            Self::Repair => 2,
            Self::Noop => 3,
        }
    }

    pub fn from_wire_value(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Install),
            1 => Ok(Self::Uninstall),
            2 => Ok(Self::Repair),
            3 => Ok(Self::Noop),
            _ => Err(anyhow!("invalid action wire value: {value}")),
        }
    }
}

/// Action state supplied by a detection/planning pass outside the engine.
/// Takes precedence over the authored per-operation tables when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    None,
    Install,
    Patch,
    Uninstall,
    Recache,
    Maintenance,
}

impl ActionState {
    pub fn to_action(self) -> Action {
        match self {
            Self::Install | Self::Patch => Action::Install,
            Self::Uninstall => Action::Uninstall,
            Self::Recache | Self::Maintenance => Action::Repair,
            Self::None => Action::Noop,
        }
    }
}

/// What to do with the rest of the run after an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Rollback,
    Stop,
    Continue,
    Unspecified,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rollback => "rollback",
            Self::Stop => "stop",
            Self::Continue => "continue",
            Self::Unspecified => "unspecified",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "rollback" => Ok(Self::Rollback),
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            "unspecified" => Ok(Self::Unspecified),
            _ => Err(anyhow!("invalid failure policy: {value}")),
        }
    }
}

/// Merge the item-level policy with the whole-operation policy.
///
/// The item-level policy wins when specified. Otherwise the operation-level
/// policy applies, and if neither is specified the run continues. Under
/// uninstall/repair an unspecified item policy still means continue; the
/// failure is recorded into the run's first error either way, so nothing is
/// lost by continuing.
pub fn merged_failure_policy(
    item_policy: FailurePolicy,
    operation_policy: FailurePolicy,
    operation: Operation,
) -> FailurePolicy {
    if item_policy != FailurePolicy::Unspecified {
        return item_policy;
    }
    if operation_policy != FailurePolicy::Unspecified {
        return operation_policy;
    }
    // Rollback never applies implicitly outside install.
    let _ = operation;
    FailurePolicy::Continue
}

/// One row of the authored action table: what to do for a given operation
/// depending on whether the package is already present on the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRow {
    pub when_present: Action,
    pub when_absent: Action,
    pub on_failure: FailurePolicy,
}

/// Authored per-operation action table for one bundle item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTable {
    pub install: OperationRow,
    pub uninstall: OperationRow,
    pub repair: OperationRow,
}

impl ActionTable {
    pub fn row(&self, operation: Operation) -> &OperationRow {
        match operation {
            Operation::Installing => &self.install,
            Operation::Uninstalling => &self.uninstall,
            Operation::Repairing => &self.repair,
        }
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self {
            install: OperationRow {
                when_present: Action::Noop,
                when_absent: Action::Install,
                on_failure: FailurePolicy::Rollback,
            },
            uninstall: OperationRow {
                when_present: Action::Uninstall,
                when_absent: Action::Noop,
                on_failure: FailurePolicy::Continue,
            },
            repair: OperationRow {
                when_present: Action::Repair,
                when_absent: Action::Install,
                on_failure: FailurePolicy::Continue,
            },
        }
    }
}

/// Whether the orchestrator is running the authored operation or replaying
/// a reversed sub-sequence to undo a failed install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    Rollback,
}

impl RunMode {
    pub fn is_rollback(self) -> bool {
        matches!(self, Self::Rollback)
    }
}
