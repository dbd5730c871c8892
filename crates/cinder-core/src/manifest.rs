use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionState, ActionTable, FailurePolicy, Operation, OperationRow};
use crate::item::{BundleItem, ExeKind, ItemState, PackageKind, PatchTrain, Payload};
use crate::predicate::Predicate;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleManifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub policies: OperationPolicies,
    #[serde(default)]
    pub items: Vec<ItemManifest>,
}

/// Whole-operation sub-failure policies. Item-level policies win over these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationPolicies {
    #[serde(default = "unspecified_policy")]
    pub install: FailurePolicy,
    #[serde(default = "unspecified_policy")]
    pub uninstall: FailurePolicy,
    #[serde(default = "unspecified_policy")]
    pub repair: FailurePolicy,
}

impl OperationPolicies {
    pub fn for_operation(&self, operation: Operation) -> FailurePolicy {
        match operation {
            Operation::Installing => self.install,
            Operation::Uninstalling => self.uninstall,
            Operation::Repairing => self.repair,
        }
    }
}

impl Default for OperationPolicies {
    fn default() -> Self {
        Self {
            install: FailurePolicy::Unspecified,
            uninstall: FailurePolicy::Unspecified,
            repair: FailurePolicy::Unspecified,
        }
    }
}

fn unspecified_policy() -> FailurePolicy {
    FailurePolicy::Unspecified
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemManifest {
    pub id: String,
    pub name: Option<String>,
    pub kind: String,
    pub exe_kind: Option<String>,
    pub version: Version,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default = "default_true")]
    pub durable_cache: bool,
    #[serde(default = "default_true")]
    pub rollback_eligible: bool,
    #[serde(default)]
    pub ignorable: bool,
    /// The user's target request-state; "absent" means leave-uninstalled,
    /// and such items get their stale cache purged at session end.
    pub requested: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub payload: Option<PayloadManifest>,
    #[serde(default)]
    pub children: Vec<PayloadManifest>,
    pub applicability: Option<String>,
    pub presence: Option<String>,
    pub actions: Option<ActionTableManifest>,
    pub action_state: Option<ActionState>,
    pub product_code: Option<String>,
    #[serde(default)]
    pub product_codes: Vec<String>,
    pub service_name: Option<String>,
    pub patch_train: Option<String>,
    #[serde(default)]
    pub ldr_baseline: bool,
    #[serde(default)]
    pub install_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadManifest {
    pub url: Option<String>,
    pub path: Option<String>,
    pub sha256: String,
    pub size: u64,
    pub cache_filename: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionTableManifest {
    pub install: Option<OperationRowManifest>,
    pub uninstall: Option<OperationRowManifest>,
    pub repair: Option<OperationRowManifest>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRowManifest {
    pub when_present: Option<Action>,
    pub when_absent: Option<Action>,
    pub on_failure: Option<FailurePolicy>,
}

impl BundleManifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse bundle manifest")?;

        if manifest.id.trim().is_empty() {
            return Err(anyhow!("bundle id must not be empty"));
        }

        let mut seen_ids = HashSet::new();
        for item in &manifest.items {
            if item.id.trim().is_empty() {
                return Err(anyhow!("item id must not be empty"));
            }
            if !seen_ids.insert(item.id.clone()) {
                return Err(anyhow!("duplicate item id '{}'", item.id));
            }

            let kind = PackageKind::parse(&item.kind)
                .with_context(|| format!("item '{}'", item.id))?;
            if let Some(exe_kind) = &item.exe_kind {
                ExeKind::parse(exe_kind).with_context(|| format!("item '{}'", item.id))?;
            }
            if let Some(train) = &item.patch_train {
                PatchTrain::parse(train).with_context(|| format!("item '{}'", item.id))?;
            }

            if kind.is_payloadless() {
                if item.payload.is_some() {
                    return Err(anyhow!(
                        "item '{}' of kind '{}' must not declare a payload",
                        item.id,
                        kind.as_str()
                    ));
                }
            } else if let Some(payload) = &item.payload {
                validate_payload(payload).with_context(|| format!("item '{}'", item.id))?;
            } else {
                return Err(anyhow!(
                    "item '{}' of kind '{}' must declare a payload",
                    item.id,
                    kind.as_str()
                ));
            }
            for child in &item.children {
                validate_payload(child)
                    .with_context(|| format!("child payload of item '{}'", item.id))?;
            }

            match kind {
                PackageKind::ServiceControl if item.service_name.is_none() => {
                    return Err(anyhow!(
                        "item '{}' of kind 'service-control' must declare service_name",
                        item.id
                    ));
                }
                PackageKind::CleanupBlock | PackageKind::RelatedProducts
                    if item.product_codes.is_empty() =>
                {
                    return Err(anyhow!(
                        "item '{}' of kind '{}' must declare product_codes",
                        item.id,
                        kind.as_str()
                    ));
                }
                _ => {}
            }

            if let Some(requested) = &item.requested {
                if requested != "present" && requested != "absent" {
                    return Err(anyhow!(
                        "item '{}' has invalid requested state '{}'; expected present or absent",
                        item.id,
                        requested
                    ));
                }
            }

            if let Some(applicability) = &item.applicability {
                Predicate::parse(applicability)
                    .with_context(|| format!("applicability of item '{}'", item.id))?;
            }
            if let Some(presence) = &item.presence {
                Predicate::parse(presence)
                    .with_context(|| format!("presence of item '{}'", item.id))?;
            }
        }

        Ok(manifest)
    }

    /// Build the runtime item collection in authored order.
    pub fn into_items(&self) -> Result<Vec<BundleItem>> {
        self.items.iter().map(|item| self.build_item(item)).collect()
    }

    fn build_item(&self, manifest: &ItemManifest) -> Result<BundleItem> {
        let kind = PackageKind::parse(&manifest.kind)?;
        let exe_kind = match &manifest.exe_kind {
            Some(value) => ExeKind::parse(value)?,
            None => ExeKind::default(),
        };
        let patch_train = match &manifest.patch_train {
            Some(value) => PatchTrain::parse(value)?,
            None => PatchTrain::default(),
        };

        let payload = manifest.payload.as_ref().map(build_payload);
        let children = manifest.children.iter().map(build_payload).collect();

        let applicability = match &manifest.applicability {
            Some(raw) => Predicate::parse(raw)?,
            None => Predicate::Always(true),
        };
        let presence = match &manifest.presence {
            Some(raw) => Predicate::parse(raw)?,
            None => Predicate::Always(false),
        };

        let actions = build_action_table(manifest.actions.as_ref());

        let has_local_source = manifest
            .payload
            .as_ref()
            .is_some_and(|payload| payload.path.is_some());
        let state = if kind.is_payloadless() {
            ItemState::Available
        } else {
            BundleItem::initial_state(has_local_source, manifest.ignorable)
        };
        let current_path = manifest
            .payload
            .as_ref()
            .and_then(|payload| payload.path.as_ref())
            .map(PathBuf::from);

        Ok(BundleItem {
            id: manifest.id.clone(),
            display_name: manifest.name.clone().unwrap_or_else(|| manifest.id.clone()),
            kind,
            exe_kind,
            version: manifest.version.clone(),
            per_machine: manifest.per_machine,
            durable_cache: manifest.durable_cache,
            rollback_eligible: manifest.rollback_eligible,
            ignorable: manifest.ignorable,
            requested_absent: manifest.requested.as_deref() == Some("absent"),
            weight: manifest.weight.max(1),
            payload,
            children,
            applicability,
            presence,
            actions,
            action_state: manifest.action_state,
            product_code: manifest.product_code.clone(),
            product_codes: manifest.product_codes.clone(),
            service_name: manifest.service_name.clone(),
            patch_train,
            ldr_baseline: manifest.ldr_baseline,
            install_args: manifest.install_args.clone(),
            state,
            current_path,
            verified: false,
            download_pending: false,
        })
    }
}

fn build_payload(manifest: &PayloadManifest) -> Payload {
    Payload {
        url: manifest.url.clone(),
        source_path: manifest.path.as_ref().map(PathBuf::from),
        sha256: manifest.sha256.to_ascii_lowercase(),
        size: manifest.size,
        cache_filename: manifest.cache_filename.clone(),
    }
}

fn build_action_table(manifest: Option<&ActionTableManifest>) -> ActionTable {
    let defaults = ActionTable::default();
    let Some(manifest) = manifest else {
        return defaults;
    };

    ActionTable {
        install: build_row(manifest.install.as_ref(), defaults.install),
        uninstall: build_row(manifest.uninstall.as_ref(), defaults.uninstall),
        repair: build_row(manifest.repair.as_ref(), defaults.repair),
    }
}

fn build_row(manifest: Option<&OperationRowManifest>, defaults: OperationRow) -> OperationRow {
    let Some(manifest) = manifest else {
        return defaults;
    };

    OperationRow {
        when_present: manifest.when_present.unwrap_or(defaults.when_present),
        when_absent: manifest.when_absent.unwrap_or(defaults.when_absent),
        on_failure: manifest.on_failure.unwrap_or(defaults.on_failure),
    }
}

fn validate_payload(payload: &PayloadManifest) -> Result<()> {
    if payload.url.is_none() && payload.path.is_none() {
        return Err(anyhow!("payload must declare url or path"));
    }
    if payload.size == 0 {
        return Err(anyhow!("payload size must be non-zero"));
    }

    let sha256 = payload.sha256.trim();
    if sha256.len() != 64 || !sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("payload sha256 must be 64 hex characters"));
    }

    let filename = payload.cache_filename.trim();
    if filename.is_empty() {
        return Err(anyhow!("payload cache_filename must not be empty"));
    }
    if filename.contains('/') || filename.contains('\\') || filename == ".." {
        return Err(anyhow!(
            "payload cache_filename must be a bare file name: {filename}"
        ));
    }

    Ok(())
}
