use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use cinder_core::{BundleItem, ItemSet, ItemState};
use cinder_security::verify_payload_file;

use crate::fs_utils::{quarantine_file, remove_dir_if_empty};
use crate::layout::CacheLayout;

/// Seam through which per-machine cache operations are forwarded to the
/// elevated process. When no delegate is supplied the operation runs in this
/// process (the elevated side itself, or a purely per-user session).
pub trait ElevationDelegate {
    fn is_cached(&mut self, index: usize) -> Result<bool>;
    fn verify_and_cache_package(&mut self, index: usize) -> Result<()>;
    fn delete_cached_package(&mut self, index: usize) -> Result<()>;
    fn delete_temporary_cache_directories(&mut self) -> Result<()>;
}

/// Content-addressed package cache over the shared item collection.
///
/// Every public operation takes the collection lock for its whole
/// check-then-act sequence; a concurrent download thread mutates the same
/// item slots and must never observe a half-applied transition.
#[derive(Debug, Clone)]
pub struct CacheManager {
    layout: CacheLayout,
    items: ItemSet,
}

impl CacheManager {
    pub fn new(layout: CacheLayout, items: ItemSet) -> Self {
        Self { layout, items }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn items(&self) -> &ItemSet {
        &self.items
    }

    /// True iff the item's canonical cache entry exists and verifies. On a
    /// successful fresh verification the item is re-pointed at the cache
    /// path; on a failed one the stale entry is deleted (or quarantined) and
    /// the item's live path is restored.
    pub fn is_cached(
        &self,
        index: usize,
        delegate: Option<&mut dyn ElevationDelegate>,
    ) -> Result<bool> {
        let mut items = self.items.lock();
        let item = item_at_mut(&mut items, index)?;

        if item.per_machine {
            if let Some(delegate) = delegate {
                return delegate.is_cached(index);
            }
        }

        Ok(self.check_cached_locked(item))
    }

    /// Promote the item's current live payload into its canonical cache
    /// slot: verify the file and any child payloads, copy the children into
    /// the cache directory, then move (from temp) or copy (otherwise) the
    /// payload itself. No-op success when already cached and valid.
    pub fn verify_and_cache_package(
        &self,
        index: usize,
        delegate: Option<&mut dyn ElevationDelegate>,
    ) -> Result<()> {
        let mut items = self.items.lock();
        let item = item_at_mut(&mut items, index)?;

        if item.per_machine {
            if let Some(delegate) = delegate {
                return delegate.verify_and_cache_package(index);
            }
        }

        if self.check_cached_locked(item) {
            return Ok(());
        }

        let Some(payload) = item.payload.clone() else {
            return Ok(());
        };

        let source = item
            .current_path
            .clone()
            .ok_or_else(|| anyhow!("no payload source for item '{}'", item.id))?;
        if !source.is_absolute() || !source.is_file() {
            return Err(anyhow!(
                "payload source for item '{}' is not an existing absolute file: {}",
                item.id,
                source.display()
            ));
        }

        verify_payload_file(&source, &payload.sha256, payload.size)
            .with_context(|| format!("payload verification failed for item '{}'", item.id))?;

        let cache_dir = self.layout.cache_dir(item.per_machine, item.durable_cache);
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create {}", cache_dir.display()))?;

        // Children go in first so a cached parent never exists without them.
        let source_dir = source
            .parent()
            .ok_or_else(|| anyhow!("payload source has no parent: {}", source.display()))?;
        for child in &item.children {
            let child_source = source_dir.join(&child.cache_filename);
            verify_payload_file(&child_source, &child.sha256, child.size).with_context(|| {
                format!(
                    "child payload verification failed for item '{}': {}",
                    item.id, child.cache_filename
                )
            })?;

            let child_destination = cache_dir.join(&child.cache_filename);
            if child_source != child_destination {
                fs::copy(&child_source, &child_destination).with_context(|| {
                    format!(
                        "failed to cache child payload {} to {}",
                        child_source.display(),
                        child_destination.display()
                    )
                })?;
            }
        }

        let cache_path = self
            .layout
            .cached_path(&payload, item.per_machine, item.durable_cache);
        if source != cache_path {
            if self.layout.is_under_temp(&source) {
                move_file(&source, &cache_path)?;
            } else {
                fs::copy(&source, &cache_path).with_context(|| {
                    format!(
                        "failed to cache payload {} to {}",
                        source.display(),
                        cache_path.display()
                    )
                })?;
            }
        }

        item.current_path = Some(cache_path);
        item.verified = true;
        if item.state != ItemState::Complete {
            item.state = ItemState::Available;
        }
        Ok(())
    }

    /// Remove the item's canonical cache entry and any cached children,
    /// quarantining entries that refuse deletion, then drop the cache
    /// directory if it ended up empty.
    pub fn delete_cached_package(
        &self,
        index: usize,
        delegate: Option<&mut dyn ElevationDelegate>,
    ) -> Result<()> {
        let mut items = self.items.lock();
        let item = item_at_mut(&mut items, index)?;

        if item.per_machine {
            if let Some(delegate) = delegate {
                return delegate.delete_cached_package(index);
            }
        }

        let Some(payload) = item.payload.clone() else {
            return Ok(());
        };

        let cache_path = self
            .layout
            .cached_path(&payload, item.per_machine, item.durable_cache);
        let quarantine_dir = self.layout.quarantine_dir(item.per_machine);
        self.delete_or_quarantine(&cache_path, &quarantine_dir)?;

        let cache_dir = self.layout.cache_dir(item.per_machine, item.durable_cache);
        for child in &item.children {
            self.delete_or_quarantine(&cache_dir.join(&child.cache_filename), &quarantine_dir)?;
        }

        if let Err(err) = remove_dir_if_empty(&cache_dir) {
            return Err(err)
                .with_context(|| format!("failed to remove cache dir: {}", cache_dir.display()));
        }

        if item.current_path.as_deref() == Some(cache_path.as_path()) {
            item.current_path = None;
            item.verified = false;
            if item.state == ItemState::Available {
                item.state = ItemState::NotAvailable;
            }
        }
        Ok(())
    }

    /// Remove the session's temp cache subtree under both roots.
    pub fn delete_temporary_cache_directories(
        &self,
        delegate: Option<&mut dyn ElevationDelegate>,
    ) -> Result<()> {
        if let Some(delegate) = delegate {
            delegate.delete_temporary_cache_directories()?;
        } else {
            remove_tree_if_exists(&self.layout.temp_root(true))?;
        }
        remove_tree_if_exists(&self.layout.temp_root(false))
    }

    fn check_cached_locked(&self, item: &mut BundleItem) -> bool {
        let Some(payload) = item.payload.clone() else {
            return true;
        };

        let cache_path = self
            .layout
            .cached_path(&payload, item.per_machine, item.durable_cache);
        if !cache_path.is_file() {
            return false;
        }

        if item.verified && item.current_path.as_deref() == Some(cache_path.as_path()) {
            return true;
        }

        let previous = item.current_path.take();
        item.current_path = Some(cache_path.clone());

        match verify_payload_file(&cache_path, &payload.sha256, payload.size) {
            Ok(()) => {
                item.verified = true;
                if item.state != ItemState::Complete {
                    item.state = ItemState::Available;
                }
                true
            }
            Err(_) => {
                if fs::remove_file(&cache_path).is_err() {
                    let _ = quarantine_file(&cache_path, &self.layout.quarantine_dir(item.per_machine));
                }
                item.current_path = previous;
                item.verified = false;
                false
            }
        }
    }

    fn delete_or_quarantine(&self, path: &Path, quarantine_dir: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(_) => {
                quarantine_file(path, quarantine_dir)?;
                Ok(())
            }
        }
    }
}

fn item_at_mut<'a>(items: &'a mut [BundleItem], index: usize) -> Result<&'a mut BundleItem> {
    let len = items.len();
    items
        .get_mut(index)
        .ok_or_else(|| anyhow!("item index out of range: {index} (of {len})"))
}

fn move_file(source: &Path, destination: &Path) -> Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(source, destination).with_context(|| {
                format!(
                    "failed to move payload {} to {}",
                    source.display(),
                    destination.display()
                )
            })?;
            fs::remove_file(source).with_context(|| {
                format!("failed to remove moved payload: {}", source.display())
            })?;
            Ok(())
        }
    }
}

fn remove_tree_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove temp cache: {}", path.display()))
        }
    }
}
