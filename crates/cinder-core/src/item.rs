use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use semver::Version;

use crate::action::{ActionState, ActionTable};
use crate::predicate::Predicate;

/// Package type tag. Each kind maps to exactly one performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Msi,
    AgileMsi,
    Msp,
    Patches,
    Exe,
    Msu,
    ServiceControl,
    CleanupBlock,
    RelatedProducts,
    File,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msi => "msi",
            Self::AgileMsi => "agile-msi",
            Self::Msp => "msp",
            Self::Patches => "patches",
            Self::Exe => "exe",
            Self::Msu => "msu",
            Self::ServiceControl => "service-control",
            Self::CleanupBlock => "cleanup-block",
            Self::RelatedProducts => "related-products",
            Self::File => "file",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "msi" => Ok(Self::Msi),
            "agile-msi" => Ok(Self::AgileMsi),
            "msp" => Ok(Self::Msp),
            "patches" => Ok(Self::Patches),
            "exe" => Ok(Self::Exe),
            "msu" => Ok(Self::Msu),
            "service-control" => Ok(Self::ServiceControl),
            "cleanup-block" => Ok(Self::CleanupBlock),
            "related-products" => Ok(Self::RelatedProducts),
            "file" => Ok(Self::File),
            _ => Err(anyhow!("invalid package kind: {value}")),
        }
    }

    /// Kinds that carry no payload file of their own.
    pub fn is_payloadless(self) -> bool {
        matches!(
            self,
            Self::ServiceControl | Self::CleanupBlock | Self::RelatedProducts
        )
    }
}

/// How an EXE package is launched and how its progress is obtained. One
/// handler covers all sub-kinds; this value selects the strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExeKind {
    /// No true progress; a time-based curve approximates it.
    #[default]
    Generic,
    /// Child reports progress over a watcher pipe.
    Watcher,
    /// Child speaks the chained-bundle protocol (download + install streams).
    Chainer,
}

impl ExeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Watcher => "watcher",
            Self::Chainer => "chainer",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "generic" => Ok(Self::Generic),
            "watcher" => Ok(Self::Watcher),
            "chainer" => Ok(Self::Chainer),
            _ => Err(anyhow!("invalid exe kind: {value}")),
        }
    }
}

/// Servicing-train classification of a patch lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchTrain {
    #[default]
    None,
    Gdr,
    Ldr,
}

impl PatchTrain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gdr => "gdr",
            Self::Ldr => "ldr",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "gdr" => Ok(Self::Gdr),
            "ldr" => Ok(Self::Ldr),
            _ => Err(anyhow!("invalid patch train: {value}")),
        }
    }
}

/// Where an item's bytes come from and how they are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub url: Option<String>,
    pub source_path: Option<PathBuf>,
    pub sha256: String,
    pub size: u64,
    pub cache_filename: String,
}

/// Download/cache lifecycle of one item within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    NotAvailable,
    AvailableUnverified,
    Available,
    Ignorable,
    Complete,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "not-available",
            Self::AvailableUnverified => "available-unverified",
            Self::Available => "available",
            Self::Ignorable => "ignorable",
            Self::Complete => "complete",
        }
    }

    /// Complete is terminal; Available is only reached through verification.
    pub fn can_transition(self, next: ItemState) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (Self::Complete, _) => false,
            (from, Self::Available) => from == Self::AvailableUnverified,
            (Self::Available, Self::Ignorable) => false,
            (Self::NotAvailable, Self::Complete) => false,
            _ => true,
        }
    }
}

/// One unit of work in a bundle. Authored fields are fixed at load time;
/// `state`, `current_path` and `verified` are mutated as the session runs.
#[derive(Debug, Clone)]
pub struct BundleItem {
    pub id: String,
    pub display_name: String,
    pub kind: PackageKind,
    pub exe_kind: ExeKind,
    pub version: Version,
    pub per_machine: bool,
    pub durable_cache: bool,
    pub rollback_eligible: bool,
    pub ignorable: bool,
    pub requested_absent: bool,
    pub weight: u32,
    pub payload: Option<Payload>,
    pub children: Vec<Payload>,
    pub applicability: Predicate,
    pub presence: Predicate,
    pub actions: ActionTable,
    pub action_state: Option<ActionState>,
    pub product_code: Option<String>,
    pub product_codes: Vec<String>,
    pub service_name: Option<String>,
    pub patch_train: PatchTrain,
    pub ldr_baseline: bool,
    pub install_args: Vec<String>,

    pub state: ItemState,
    pub current_path: Option<PathBuf>,
    pub verified: bool,
    pub download_pending: bool,
}

impl BundleItem {
    pub fn initial_state(has_local_source: bool, ignorable: bool) -> ItemState {
        if has_local_source {
            ItemState::AvailableUnverified
        } else if ignorable {
            ItemState::Ignorable
        } else {
            ItemState::NotAvailable
        }
    }
}

/// The shared, lock-protected item collection.
///
/// The single lock doubles as the process-wide cache lock: every
/// check-then-act sequence over an item's availability runs under it, so the
/// orchestrator and a concurrent downloader never race on the same slot.
#[derive(Debug, Clone)]
pub struct ItemSet {
    inner: Arc<Mutex<Vec<BundleItem>>>,
}

impl ItemSet {
    pub fn new(items: Vec<BundleItem>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Acquire the collection lock for a compound check-then-act sequence.
    pub fn lock(&self) -> MutexGuard<'_, Vec<BundleItem>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn item(&self, index: usize) -> Option<BundleItem> {
        self.lock().get(index).cloned()
    }

    pub fn state(&self, index: usize) -> Option<ItemState> {
        self.lock().get(index).map(|item| item.state)
    }

    pub fn set_state(&self, index: usize, next: ItemState) {
        let mut items = self.lock();
        let Some(item) = items.get_mut(index) else {
            return;
        };
        debug_assert!(
            item.state.can_transition(next),
            "illegal item state transition {} -> {}",
            item.state.as_str(),
            next.as_str()
        );
        if item.state.can_transition(next) {
            item.state = next;
        }
    }

    pub fn current_path(&self, index: usize) -> Option<PathBuf> {
        self.lock().get(index).and_then(|item| item.current_path.clone())
    }

    pub fn set_current_path(&self, index: usize, path: Option<PathBuf>) {
        let mut items = self.lock();
        if let Some(item) = items.get_mut(index) {
            item.current_path = path;
        }
    }

    pub fn set_verified(&self, index: usize, verified: bool) {
        let mut items = self.lock();
        if let Some(item) = items.get_mut(index) {
            item.verified = verified;
        }
    }

    pub fn mark_complete(&self, index: usize) {
        self.set_state(index, ItemState::Complete);
    }

    pub fn set_download_pending(&self, index: usize, pending: bool) {
        let mut items = self.lock();
        if let Some(item) = items.get_mut(index) {
            item.download_pending = pending;
        }
    }

    pub fn download_pending(&self, index: usize) -> bool {
        self.lock()
            .get(index)
            .is_some_and(|item| item.download_pending)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|item| item.id.clone()).collect()
    }
}
