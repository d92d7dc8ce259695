use std::collections::HashSet;
use std::thread;

use tracing::{debug, info, warn};

use crate::config::JobOptions;
use crate::driver::{CarryState, FilePage, SiteDriver, VolumePage};
use crate::error::CoreResult;
use crate::ledger::{LedgerHandle, UrlScope};
use crate::model::{VolumeId, VolumeStatus};
use crate::sanitize::{file_name_from_url, ledger_file_name, path_char_replace};

const DEFAULT_TRANSFER_TYPE: &str = "http";

/// Calls `fetch` until it succeeds or redo is exhausted. `Ok(None)` means the
/// call failed for good and resolution should stop.
pub(crate) fn with_redo<T>(
    options: &JobOptions,
    what: &str,
    mut fetch: impl FnMut() -> CoreResult<T>,
) -> CoreResult<Option<T>> {
    let mut rounds = 0u32;
    loop {
        match fetch() {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if !options.may_redo(rounds) {
                    warn!(target_url = %what, error = %err, rounds, "resolution failed");
                    return Ok(None);
                }
                rounds += 1;
                warn!(target_url = %what, error = %err, round = rounds, "resolution failed, redoing");
                thread::sleep(options.redo_interval);
            }
        }
    }
}

/// Discovers volumes page by page. Returns `false` when a page could not be
/// fetched; `vol_info_ok` is only set once every page was recorded.
pub fn resolve_volumes(
    ledger: &LedgerHandle,
    driver: &dyn SiteDriver,
    options: &JobOptions,
) -> CoreResult<bool> {
    let mut url = {
        let mut guard = ledger.lock()?;
        guard.set_flags(Some(false), None)?;
        let info = &guard.document().info;
        let restart = options.force_update || options.search_mode || info.vol_next_url.is_empty();
        if restart {
            info.url.clone()
        } else {
            debug!(job = %info.name, next = %info.vol_next_url, "resuming volume listing");
            info.vol_next_url.clone()
        }
    };
    let mut visited = HashSet::new();
    loop {
        visited.insert(url.clone());
        let Some(page) = with_redo(options, &url, || driver.get_volume_page(&url, options))? else {
            return Ok(false);
        };
        let next = record_volume_page(ledger, &page, options)?;
        if next.is_empty() {
            break;
        }
        if visited.contains(&next) {
            warn!(next = %next, "volume listing points back to a visited page, stopping");
            ledger.lock()?.set_next_url("")?;
            break;
        }
        url = next;
    }
    let mut guard = ledger.lock()?;
    guard.set_flags(Some(true), None)?;
    info!(
        job = %guard.document().info.name,
        volumes = guard.document().down_list.len(),
        "volume info ready"
    );
    Ok(true)
}

fn record_volume_page(ledger: &LedgerHandle, page: &VolumePage, options: &JobOptions) -> CoreResult<String> {
    let mut guard = ledger.lock()?;
    for (name, volume_url) in &page.volumes {
        let name = path_char_replace(name.trim());
        if name.is_empty() {
            warn!(url = %volume_url, "skipping volume without a name");
            continue;
        }
        match guard.volume_id_by_name(&name) {
            Some(id) => {
                let listing = guard
                    .document()
                    .volume(id)
                    .map(|vol| vol.status == VolumeStatus::Listing)
                    .unwrap_or(true);
                if options.search_mode && !listing {
                    guard.set_volume_status(id, VolumeStatus::Listing)?;
                    debug!(volume = %name, "reopened for search");
                }
            }
            None => {
                let id = guard.add_volume(&name, volume_url, VolumeStatus::Listing)?;
                debug!(volume = %name, id, "volume added");
            }
        }
    }
    guard.set_next_url(&page.next_url)?;
    Ok(page.next_url.clone())
}

/// Lists files of every volume still in `listing`. Duplicate URLs are
/// skipped within the volume, or within the whole job in search mode.
pub fn resolve_files(
    ledger: &LedgerHandle,
    driver: &dyn SiteDriver,
    options: &JobOptions,
) -> CoreResult<bool> {
    let listing: Vec<(VolumeId, String, String)> = {
        let mut guard = ledger.lock()?;
        guard.set_flags(None, Some(false))?;
        guard
            .document()
            .down_list
            .iter()
            .filter(|vol| vol.status == VolumeStatus::Listing)
            .map(|vol| (vol.id, vol.name.clone(), vol.url.clone()))
            .collect()
    };

    let mut carry: Option<CarryState> = None;
    for (volume_id, volume_name, volume_url) in listing {
        let mut pending_carry = carry.take();
        let fetched = with_redo(options, &volume_url, || {
            driver.get_file_page(&volume_url, pending_carry.take(), options)
        })?;
        let Some(page) = fetched else {
            return Ok(false);
        };
        carry = record_file_page(ledger, volume_id, &volume_name, page, options)?;
    }

    let mut guard = ledger.lock()?;
    guard.set_flags(None, Some(true))?;
    info!(
        job = %guard.document().info.name,
        files = guard.document().info.files,
        "file info ready"
    );
    Ok(true)
}

fn record_file_page(
    ledger: &LedgerHandle,
    volume_id: VolumeId,
    volume_name: &str,
    page: FilePage,
    options: &JobOptions,
) -> CoreResult<Option<CarryState>> {
    let scope = if options.search_mode {
        UrlScope::Job
    } else {
        UrlScope::Volume(volume_id)
    };
    let mut guard = ledger.lock()?;
    let mut added = 0usize;
    for file in page.files {
        let url = file.url.trim();
        if url.is_empty() {
            continue;
        }
        if guard.file_exists(url, scope) {
            continue;
        }
        let name = if file.name.trim().is_empty() {
            file_name_from_url(url).unwrap_or_default()
        } else {
            ledger_file_name(file.name.trim())
        };
        let transfer_type = if file.transfer_type.trim().is_empty() {
            DEFAULT_TRANSFER_TYPE
        } else {
            file.transfer_type.trim()
        };
        guard.add_file(volume_id, &name, url, transfer_type, file.extra)?;
        added += 1;
    }
    let status = guard.finish_listing(volume_id)?;
    debug!(volume = %volume_name, added, status = %status, "volume listed");
    Ok(page.carry)
}
