use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use cinder_core::{Action, BundleItem, EvaluationContext, PatchTrain, ResultCode};

use crate::abort::AbortSignal;
use crate::performer::{CommandRunner, Performer};
use crate::performers::{MSIEXEC, QUIET_ARGS};
use crate::progress::{PhasedObserver, ProgressObserver, ProgressState, PROGRESS_MAX};

/// Applies or removes a patch against every product it targets.
///
/// Target products come from the patch's applicability data, filtered by
/// what is actually applied right now: install skips products that already
/// carry the patch, uninstall only touches products that do. Each target is
/// one progress phase. An LDR baseline that still has dependent LDR patches
/// installed is never removed out from under them.
pub struct MspPerformer {
    item_id: String,
    display_name: String,
    payload_path: Option<PathBuf>,
    patch_code: Option<String>,
    action: Action,
    targets: Vec<PatchTarget>,
    install_args: Vec<String>,
    baseline_still_required: bool,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub product_code: String,
    pub train: PatchTrain,
}

impl MspPerformer {
    pub fn new(
        item: &BundleItem,
        action: Action,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
        ctx: &EvaluationContext,
        baseline_still_required: bool,
    ) -> Self {
        let targets = resolve_targets(item, action, ctx);
        Self {
            item_id: item.id.clone(),
            display_name: item.display_name.clone(),
            payload_path: item.current_path.clone(),
            patch_code: item.product_code.clone(),
            action,
            targets,
            install_args: item.install_args.clone(),
            baseline_still_required,
            runner,
            abort,
        }
    }

    pub fn targets(&self) -> &[PatchTarget] {
        &self.targets
    }

    fn apply_to(&self, target: &PatchTarget) -> Result<ResultCode> {
        let path = self.payload_path.as_ref().ok_or_else(|| {
            anyhow!("no payload path to patch '{}' with", self.display_name)
        })?;

        let mut args = vec![
            "/i".to_string(),
            target.product_code.clone(),
            format!("PATCH={}", path.display()),
        ];
        args.extend(QUIET_ARGS.iter().map(ToString::to_string));
        args.extend(self.install_args.iter().cloned());
        self.runner.run(MSIEXEC, &args)
    }

    fn remove_from(&self, target: &PatchTarget) -> Result<ResultCode> {
        let patch = match &self.patch_code {
            Some(code) => code.clone(),
            None => self
                .payload_path
                .as_ref()
                .map(|path| path.display().to_string())
                .ok_or_else(|| {
                    anyhow!(
                        "'{}' has neither patch code nor payload path",
                        self.display_name
                    )
                })?,
        };

        let mut args = vec![
            "/package".to_string(),
            target.product_code.clone(),
            "/uninstall".to_string(),
            patch,
        ];
        args.extend(QUIET_ARGS.iter().map(ToString::to_string));
        Ok(self.runner.run(MSIEXEC, &args)?.normalized_for_uninstall())
    }
}

impl Performer for MspPerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        if self.abort.is_aborted() {
            return Ok(ResultCode::CANCELLED);
        }

        observer.on_state_change_detail(ProgressState::Executing, &self.display_name);

        if self.action == Action::Uninstall && self.baseline_still_required {
            // dependent LDR patches still need this baseline
            observer.on_progress(PROGRESS_MAX);
            return Ok(ResultCode::OK);
        }

        if self.targets.is_empty() {
            observer.on_progress(PROGRESS_MAX);
            return Ok(ResultCode::OK);
        }

        let targets = self.targets.clone();
        let mut phased = PhasedObserver::even(observer, targets.len());
        let mut first_failure: Option<ResultCode> = None;

        for target in &targets {
            if self.abort.is_aborted() {
                return Ok(ResultCode::CANCELLED);
            }
            if phased.on_progress(0).is_cancel() {
                self.abort.request();
                return Ok(ResultCode::CANCELLED);
            }

            let code = match self.action {
                Action::Install | Action::Repair => self.apply_to(target)?,
                Action::Uninstall => self.remove_from(target)?,
                Action::Noop => {
                    return Err(anyhow!("noop dispatched to the patch handler for '{}'", self.item_id))
                }
            };

            if !code.is_success() && first_failure.is_none() {
                first_failure = Some(code);
            }
            phased.next_phase();
        }

        Ok(first_failure.unwrap_or(ResultCode::OK))
    }

    fn abort(&mut self) {
        self.abort.request();
    }
}

/// A patch is recorded as applied to a product through the detection
/// variables `patch.applied.<item>.<product>`.
fn patch_applied(ctx: &EvaluationContext, item_id: &str, product_code: &str) -> bool {
    ctx.get(&format!("patch.applied.{item_id}.{product_code}")) == Some("1")
}

/// Servicing-train classification of the patch lineage installed on one
/// product, from the detection variables `train.<product>`.
pub fn classify_train(ctx: &EvaluationContext, product_code: &str) -> PatchTrain {
    ctx.get(&format!("train.{product_code}"))
        .and_then(|value| PatchTrain::parse(value).ok())
        .unwrap_or(PatchTrain::None)
}

fn resolve_targets(
    item: &BundleItem,
    action: Action,
    ctx: &EvaluationContext,
) -> Vec<PatchTarget> {
    item.product_codes
        .iter()
        .filter(|product_code| {
            let applied = patch_applied(ctx, &item.id, product_code);
            match action {
                Action::Install => !applied,
                Action::Uninstall => applied,
                Action::Repair => true,
                Action::Noop => false,
            }
        })
        .map(|product_code| PatchTarget {
            product_code: product_code.clone(),
            train: classify_train(ctx, product_code),
        })
        .collect()
}
