use std::sync::Arc;

use anyhow::Result;
use cinder_core::{BundleItem, EvaluationContext, ResultCode};
use semver::Version;

use crate::abort::AbortSignal;
use crate::performer::{CommandRunner, Performer};
use crate::performers::{MSIEXEC, QUIET_ARGS};
use crate::progress::{PhasedObserver, ProgressObserver, ProgressState};

/// What to do with each product in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProductDisposition {
    Remove,
    Repair,
}

/// Batch cleanup over a set of related or orphaned products: strip applied
/// patches, then remove (or repair) each product. Every step runs even
/// when an earlier one fails; the first failure is the batch's result.
/// This continue-on-error behavior is fixed, unlike the orchestrator's
/// policy-gated loop.
pub struct CleanupPerformer {
    display_name: String,
    plan: Vec<(String, ProductDisposition)>,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
}

impl CleanupPerformer {
    /// Cleanup blocks unconditionally remove everything they name.
    pub fn cleanup_block(
        item: &BundleItem,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
    ) -> Self {
        let plan = item
            .product_codes
            .iter()
            .map(|code| (code.clone(), ProductDisposition::Remove))
            .collect();
        Self {
            display_name: item.display_name.clone(),
            plan,
            runner,
            abort,
        }
    }

    /// Related products are removed when the installed version is older
    /// than this bundle's, repaired when it is the same or newer. The
    /// installed version comes from the detection variables
    /// `related.<code>.version`.
    pub fn related_products(
        item: &BundleItem,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
        ctx: &EvaluationContext,
    ) -> Self {
        let plan = item
            .product_codes
            .iter()
            .map(|code| {
                let disposition = match installed_version(ctx, code) {
                    Some(installed) if installed >= item.version => ProductDisposition::Repair,
                    _ => ProductDisposition::Remove,
                };
                (code.clone(), disposition)
            })
            .collect();
        Self {
            display_name: item.display_name.clone(),
            plan,
            runner,
            abort,
        }
    }

    fn strip_patches(&self, product_code: &str) -> Result<ResultCode> {
        let mut args = vec![
            "/i".to_string(),
            product_code.to_string(),
            "MSIPATCHREMOVE=ALL".to_string(),
        ];
        args.extend(QUIET_ARGS.iter().map(ToString::to_string));
        Ok(self.runner.run(MSIEXEC, &args)?.normalized_for_uninstall())
    }

    fn configure_product(
        &self,
        product_code: &str,
        disposition: ProductDisposition,
    ) -> Result<ResultCode> {
        let verb = match disposition {
            ProductDisposition::Remove => "/x",
            ProductDisposition::Repair => "/fomus",
        };
        let mut args = vec![verb.to_string(), product_code.to_string()];
        args.extend(QUIET_ARGS.iter().map(ToString::to_string));
        Ok(self.runner.run(MSIEXEC, &args)?.normalized_for_uninstall())
    }
}

impl Performer for CleanupPerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        if self.abort.is_aborted() {
            return Ok(ResultCode::CANCELLED);
        }

        observer.on_state_change_detail(ProgressState::Executing, &self.display_name);

        if self.plan.is_empty() {
            return Ok(ResultCode::OK);
        }

        let plan = self.plan.clone();
        let mut phased = PhasedObserver::even(observer, plan.len() * 2);
        let mut first_failure: Option<ResultCode> = None;
        let mut record = |code: ResultCode| {
            if !code.is_success() && first_failure.is_none() {
                first_failure = Some(code);
            }
        };

        for (product_code, disposition) in &plan {
            if self.abort.is_aborted() {
                return Ok(ResultCode::CANCELLED);
            }
            if phased.on_progress(0).is_cancel() {
                self.abort.request();
                return Ok(ResultCode::CANCELLED);
            }

            record(self.strip_patches(product_code)?);
            phased.next_phase();

            record(self.configure_product(product_code, *disposition)?);
            phased.next_phase();
        }

        Ok(first_failure.unwrap_or(ResultCode::OK))
    }

    fn abort(&mut self) {
        self.abort.request();
    }
}

fn installed_version(ctx: &EvaluationContext, product_code: &str) -> Option<Version> {
    ctx.get(&format!("related.{product_code}.version"))
        .and_then(|value| Version::parse(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performer::tests_support::ScriptedRunner;
    use crate::progress::NullProgress;
    use cinder_core::{
        ActionTable, ExeKind, ItemState, PackageKind, PatchTrain, Predicate,
    };

    fn batch_item(kind: PackageKind, codes: &[&str]) -> BundleItem {
        BundleItem {
            id: "cleanup".to_string(),
            display_name: "Cleanup".to_string(),
            kind,
            exe_kind: ExeKind::Generic,
            version: Version::new(2, 0, 0),
            per_machine: false,
            durable_cache: true,
            rollback_eligible: false,
            ignorable: false,
            requested_absent: false,
            weight: 1,
            payload: None,
            children: Vec::new(),
            applicability: Predicate::Always(true),
            presence: Predicate::Always(true),
            actions: ActionTable::default(),
            action_state: None,
            product_code: None,
            product_codes: codes.iter().map(ToString::to_string).collect(),
            service_name: None,
            patch_train: PatchTrain::None,
            ldr_baseline: false,
            install_args: Vec::new(),
            state: ItemState::Available,
            current_path: None,
            verified: false,
            download_pending: false,
        }
    }

    #[test]
    fn cleanup_block_strips_patches_then_removes() {
        let runner = Arc::new(ScriptedRunner::ok());
        let mut performer = CleanupPerformer::cleanup_block(
            &batch_item(PackageKind::CleanupBlock, &["{OLD-1}"]),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            AbortSignal::new(),
        );

        let code = performer
            .execute(&mut NullProgress)
            .expect("execute must succeed");
        assert_eq!(code, ResultCode::OK);
        assert_eq!(
            runner.calls(),
            vec![
                "msiexec /i {OLD-1} MSIPATCHREMOVE=ALL /qn /norestart".to_string(),
                "msiexec /x {OLD-1} /qn /norestart".to_string(),
            ]
        );
    }

    #[test]
    fn batch_continues_past_failures_and_keeps_the_first() {
        let runner = Arc::new(ScriptedRunner::with_results(vec![
            ResultCode::FAILED,
            ResultCode(1618),
            ResultCode::OK,
            ResultCode::OK,
        ]));
        let mut performer = CleanupPerformer::cleanup_block(
            &batch_item(PackageKind::CleanupBlock, &["{OLD-1}", "{OLD-2}"]),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            AbortSignal::new(),
        );

        let code = performer
            .execute(&mut NullProgress)
            .expect("execute must succeed");
        assert_eq!(code, ResultCode::FAILED);
        assert_eq!(runner.calls().len(), 4, "every step still runs");
    }

    #[test]
    fn unknown_products_count_as_already_gone() {
        let runner = Arc::new(ScriptedRunner::with_results(vec![
            ResultCode::UNKNOWN_PRODUCT,
            ResultCode::UNKNOWN_PRODUCT,
        ]));
        let mut performer = CleanupPerformer::cleanup_block(
            &batch_item(PackageKind::CleanupBlock, &["{OLD-1}"]),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            AbortSignal::new(),
        );

        let code = performer
            .execute(&mut NullProgress)
            .expect("execute must succeed");
        assert_eq!(code, ResultCode::OK);
    }

    #[test]
    fn related_products_repair_newer_and_remove_older() {
        let mut ctx = EvaluationContext::new();
        ctx.set("related.{NEW-1}.version", "3.1.0");
        ctx.set("related.{OLD-1}.version", "1.0.0");

        let runner = Arc::new(ScriptedRunner::ok());
        let mut performer = CleanupPerformer::related_products(
            &batch_item(PackageKind::RelatedProducts, &["{NEW-1}", "{OLD-1}", "{GONE-1}"]),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            AbortSignal::new(),
            &ctx,
        );

        performer
            .execute(&mut NullProgress)
            .expect("execute must succeed");
        let calls = runner.calls();
        assert!(calls.contains(&"msiexec /fomus {NEW-1} /qn /norestart".to_string()));
        assert!(calls.contains(&"msiexec /x {OLD-1} /qn /norestart".to_string()));
        assert!(calls.contains(&"msiexec /x {GONE-1} /qn /norestart".to_string()));
    }
}
