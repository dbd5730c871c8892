use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cinder_core::Payload;

/// On-disk cache layout for one bundle session.
///
/// Every payload lives at a deterministic canonical path:
/// `<root>/Apps/Cache/[temp/<bundle-id>/]<cache-filename>`, under a
/// per-machine common root or a per-user local root. Durable entries skip
/// the temp segment and survive the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    machine_root: PathBuf,
    user_root: PathBuf,
    bundle_id: String,
}

impl CacheLayout {
    pub fn new(
        machine_root: impl Into<PathBuf>,
        user_root: impl Into<PathBuf>,
        bundle_id: impl Into<String>,
    ) -> Self {
        Self {
            machine_root: machine_root.into(),
            user_root: user_root.into(),
            bundle_id: bundle_id.into(),
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn root(&self, per_machine: bool) -> &Path {
        if per_machine {
            &self.machine_root
        } else {
            &self.user_root
        }
    }

    pub fn cache_root(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join("Apps").join("Cache")
    }

    pub fn temp_root(&self, per_machine: bool) -> PathBuf {
        self.cache_root(per_machine)
            .join("temp")
            .join(&self.bundle_id)
    }

    pub fn quarantine_dir(&self, per_machine: bool) -> PathBuf {
        self.temp_root(per_machine).join("quarantine")
    }

    /// Canonical cache path for one payload.
    pub fn cached_path(&self, payload: &Payload, per_machine: bool, durable: bool) -> PathBuf {
        self.cache_dir(per_machine, durable)
            .join(&payload.cache_filename)
    }

    pub fn cache_dir(&self, per_machine: bool, durable: bool) -> PathBuf {
        if durable {
            self.cache_root(per_machine)
        } else {
            self.temp_root(per_machine)
        }
    }

    /// True when a path sits inside either root's temp subtree; such files
    /// are moved, not copied, when promoted to a canonical slot.
    pub fn is_under_temp(&self, path: &Path) -> bool {
        path.starts_with(self.temp_root(true)) || path.starts_with(self.temp_root(false))
    }

    pub fn ensure_cache_dirs(&self, per_machine: bool) -> Result<()> {
        for dir in [
            self.cache_root(per_machine),
            self.temp_root(per_machine),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_machine_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let program_data = std::env::var("PROGRAMDATA")
            .context("PROGRAMDATA is not set; cannot resolve machine cache root")?;
        return Ok(PathBuf::from(program_data).join("Cinder"));
    }

    Ok(PathBuf::from("/var/lib/cinder"))
}

pub fn default_user_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve user cache root")?;
        return Ok(PathBuf::from(app_data).join("Cinder"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user cache root")?;
    Ok(PathBuf::from(home).join(".cinder"))
}
