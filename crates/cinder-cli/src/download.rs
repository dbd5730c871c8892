use std::fs;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use cinder_cache::CacheLayout;
use cinder_core::{ItemSet, ItemState};

/// The session's single background download thread. It walks the items
/// once, fetching every remote payload into the per-user temp cache area
/// and flipping the item to AvailableUnverified as each one lands; the
/// orchestrator only ever observes it through the shared item lock.
pub fn start_background_downloads(items: ItemSet, layout: CacheLayout) -> Option<JoinHandle<()>> {
    let pending: Vec<(usize, String, String)> = {
        let mut guard = items.lock();
        guard
            .iter_mut()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::NotAvailable)
            .filter_map(|(index, item)| {
                let payload = item.payload.as_ref()?;
                let url = payload.url.clone()?;
                item.download_pending = true;
                Some((index, url, payload.cache_filename.clone()))
            })
            .collect()
    };

    if pending.is_empty() {
        return None;
    }

    Some(std::thread::spawn(move || {
        let client = reqwest::blocking::Client::new();
        for (index, url, cache_filename) in pending {
            let result = fetch_payload(&client, &layout, &url, &cache_filename);
            let mut guard = items.lock();
            let Some(item) = guard.get_mut(index) else {
                continue;
            };
            item.download_pending = false;
            if let Ok(path) = result {
                item.current_path = Some(path);
                if item.state.can_transition(ItemState::AvailableUnverified) {
                    item.state = ItemState::AvailableUnverified;
                }
            }
        }
    }))
}

fn fetch_payload(
    client: &reqwest::blocking::Client,
    layout: &CacheLayout,
    url: &str,
    cache_filename: &str,
) -> Result<std::path::PathBuf> {
    let download_dir = layout.temp_root(false).join("downloads");
    fs::create_dir_all(&download_dir)
        .with_context(|| format!("failed to create {}", download_dir.display()))?;
    let destination = download_dir.join(cache_filename);

    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("server rejected {url}"))?;

    let mut file = fs::File::create(&destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("failed to write {}", destination.display()))?;

    Ok(destination)
}
