#![forbid(unsafe_code)]

//! Download coordination.
//!
//! Each item moves through a fixed sequence: sleep gate, path selection,
//! size gate, downloader invocation, failure classification, post-download
//! enrichment for first-time items, the rename pass, and side-channel
//! subtitle/caption fetches. Every catalog mutation is transactional; the
//! downloader subprocess always runs outside any open transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration as ChronoDuration;

use crate::catalog::{Catalog, CatalogRead, Chapter, Item, MISC_DNAME, now};
use crate::error::{Error, Result};
use crate::extractor::{DownloadRequest, Extractor, ItemInfo};
use crate::feed::Http;
use crate::hooks::{self, HookEvent};
use crate::media;
use crate::naming::{TEMP_NAME, VIDEO_SUFFIX, format_v_names, shard_char, title_to_name};
use crate::registry;
use crate::util::{NETWORK_RETRY_ATTEMPTS, retry_backoff};

/// Extra margin added on top of a parsed premiere/live lead time before the
/// item is retried.
pub const AUTO_SLEEP_BUFFER_SECS: i64 = 2 * 60 * 60;

/// Lead time assumed when a live/upcoming message carries no usable delay.
pub const AUTO_SLEEP_FALLBACK_SECS: i64 = 24 * 60 * 60;

/// An existing file at or above this fraction of the largest advertised
/// format is considered satisfactory by the size gate.
pub const SIZE_GATE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub filter: Vec<String>,
    pub ignore_old: bool,
    pub force: bool,
    /// Re-download files that are small relative to the best advertised
    /// format.
    pub if_small: bool,
    /// Turn live/upcoming classifications into sleep entries.
    pub auto_sleep: bool,
    pub rate_limit: Option<u64>,
    pub downloader: Option<String>,
    pub cookies: Option<PathBuf>,
    /// Comma-separated subtitle/caption languages; empty string means all;
    /// `None` disables side-channel fetches.
    pub sub_langs: Option<String>,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub total: usize,
    pub done: Vec<String>,
    pub satisfactory: Vec<String>,
    pub sleeping: Vec<String>,
    pub marked_skip: Vec<String>,
    pub slept: Vec<String>,
    pub errors: Vec<String>,
    pub aborted: bool,
}

/// Downloads every matching item, in lexicographic iid order.
pub fn download_items(
    catalog: &mut Catalog,
    extractor: &Extractor,
    http: &dyn Http,
    root: &Path,
    opts: &DownloadOptions,
    abort: &AtomicBool,
) -> Result<DownloadSummary> {
    registry::prune(catalog)?;

    let rows = catalog.items_for_download(&opts.filter, opts.ignore_old)?;
    let mut summary = DownloadSummary {
        total: rows.len(),
        ..Default::default()
    };

    for (i, item) in rows.iter().enumerate() {
        if abort.load(Ordering::SeqCst) {
            summary.aborted = true;
            break;
        }
        println!("\t{} of {}: {}", i + 1, rows.len(), item.iid);

        // Earlier items may have burned enough wall clock that this one's
        // wake time has passed, or not; the registry is consulted fresh.
        if let Some(wake) = registry::active_wake(catalog, &item.iid, now())? {
            println!("\t\tSleeping until {wake}");
            summary.sleeping.push(item.iid.clone());
            continue;
        }

        match download_one(catalog, extractor, http, root, opts, item) {
            Ok(outcome) => match outcome {
                ItemOutcome::Done(path) => {
                    hooks::dispatch(
                        catalog,
                        &HookEvent::ItemDownloaded {
                            iid: item.iid.clone(),
                            path: path.display().to_string(),
                        },
                    );
                    summary.done.push(item.iid.clone());
                }
                ItemOutcome::Satisfactory => {
                    println!("\t\tExisting file is satisfactory");
                    summary.satisfactory.push(item.iid.clone());
                }
            },
            Err(Error::Interrupted) => {
                summary.aborted = true;
                break;
            }
            Err(Error::Unavailable(detail)) => {
                println!("\t\tUnavailable, marking skip: {detail}");
                let tx = catalog.txn()?;
                tx.set_item_skip(&item.iid, true)?;
                tx.commit()?;
                summary.marked_skip.push(item.iid.clone());
            }
            Err(Error::LiveOrUpcoming(delay)) => {
                if opts.auto_sleep {
                    let fallback = ChronoDuration::seconds(AUTO_SLEEP_FALLBACK_SECS);
                    let lead = delay
                        .map(|d| ChronoDuration::from_std(d).unwrap_or(fallback))
                        .unwrap_or(fallback);
                    let wake = now() + lead + ChronoDuration::seconds(AUTO_SLEEP_BUFFER_SECS);
                    println!("\t\tLive or upcoming, sleeping until {wake}");
                    let tx = catalog.txn()?;
                    tx.sleep_put(&item.iid, wake)?;
                    tx.commit()?;
                    summary.slept.push(item.iid.clone());
                } else {
                    println!("\t\tLive or upcoming, not downloadable yet");
                    summary.errors.push(item.iid.clone());
                }
            }
            // The catalog is the one fatal dependency; give up immediately.
            Err(err @ Error::Storage(_)) => return Err(err),
            Err(err) => {
                eprintln!("\t\tWarning: download failed for {}: {err}", item.iid);
                summary.errors.push(item.iid.clone());
            }
        }
    }

    println!();
    println!("Total items: {}", summary.total);
    println!("Completed: {}", summary.done.len());
    println!("Marked skip: {}", summary.marked_skip.len());
    println!("Auto-slept: {}", summary.slept.len());
    println!("Errors ({}):", summary.errors.len());
    for iid in &summary.errors {
        println!("\t{iid}");
    }

    hooks::dispatch(
        catalog,
        &HookEvent::BatchFinished {
            operation: "download".into(),
            done: summary.done.len(),
            errors: summary.errors.len(),
        },
    );
    Ok(summary)
}

enum ItemOutcome {
    Done(PathBuf),
    Satisfactory,
}

fn download_one(
    catalog: &mut Catalog,
    extractor: &Extractor,
    http: &dyn Http,
    root: &Path,
    opts: &DownloadOptions,
    item: &Item,
) -> Result<ItemOutcome> {
    let dname = item
        .dname
        .clone()
        .ok_or_else(|| Error::NotFound(format!("{} has no directory", item.iid)))?;
    let alias = catalog.pref_name(&item.iid)?;

    // Never-synced items land under a placeholder and are renamed once the
    // metadata file reveals the real title.
    let temp_path = item.atime.is_none();
    let (dir, basename) = if temp_path {
        format_v_names(root, &dname, None, None, &item.iid, None)
    } else {
        let name = item
            .name
            .clone()
            .ok_or_else(|| Error::NotFound(format!("{} has no name", item.iid)))?;
        format_v_names(root, &dname, Some(&name), alias.as_deref(), &item.iid, None)
    };
    fs::create_dir_all(&dir)?;

    let media_file = dir.join(format!("{basename}.{VIDEO_SUFFIX}"));
    if opts.if_small && media_file.exists() {
        match size_gate(&dir, &basename, &media_file)? {
            SizeGate::Satisfactory => return Ok(ItemOutcome::Satisfactory),
            SizeGate::Small => {
                println!("\t\tExisting file is undersized, re-downloading");
                fs::remove_file(&media_file)?;
            }
            SizeGate::Unknown => {}
        }
    }

    let request = DownloadRequest {
        iid: item.iid.clone(),
        dir: dir.clone(),
        basename: basename.clone(),
        rate_limit: opts.rate_limit,
        format: item.video_format.clone(),
        downloader: opts.downloader.clone(),
        cookies: opts.cookies.clone(),
    };
    retry_backoff(NETWORK_RETRY_ATTEMPTS, std::thread::sleep, || {
        extractor.download(&request)
    })?;

    let downloaded_at = now();

    if temp_path {
        finish_temp_download(catalog, http, root, opts, item, &dname, alias.as_deref(), downloaded_at)
    } else {
        let info_path = dir.join(format!("{basename}.info.json"));
        if let Ok(info) = ItemInfo::load(&info_path) {
            fetch_side_channels(http, &dir, &basename, &info, opts)?;
            persist_chapters(catalog, item, &info)?;
        }
        let tx = catalog.txn()?;
        tx.mark_item_downloaded(item.rowid, downloaded_at)?;
        tx.commit()?;
        Ok(ItemOutcome::Done(media_file))
    }
}

/// TEMP-path epilogue: read the metadata file the downloader produced,
/// normalize it into the catalog, re-home MISCELLANEOUS items, and always
/// run the rename pass.
#[allow(clippy::too_many_arguments)]
fn finish_temp_download(
    catalog: &mut Catalog,
    http: &dyn Http,
    root: &Path,
    opts: &DownloadOptions,
    item: &Item,
    dname: &str,
    alias: Option<&str>,
    downloaded_at: chrono::DateTime<chrono::Utc>,
) -> Result<ItemOutcome> {
    let shard = root.join(dname).join(shard_char(&item.iid).to_string());
    let info_path = find_info_json(&shard, &item.iid)?.ok_or(Error::Tool {
        tool: "downloader",
        detail: format!("no metadata file found for {} in {}", item.iid, shard.display()),
    })?;
    let info = ItemInfo::load(&info_path)?;

    let title = info.title.clone().unwrap_or_else(|| item.iid.clone());
    let name = title_to_name(&title);

    // Items registered from a bare watch URL carry the sentinel directory
    // until the metadata reveals the owning channel.
    let mut final_dname = dname.to_owned();
    if dname == MISC_DNAME {
        if let Some(channel_id) = info.channel_id.clone().filter(|c| !c.is_empty()) {
            let new_shard = root.join(&channel_id).join(shard_char(&item.iid).to_string());
            move_item_files(&shard, &new_shard, &item.iid)?;
            final_dname = channel_id;
        }
    }

    let final_shard = root.join(&final_dname).join(shard_char(&item.iid).to_string());
    let effective = alias.unwrap_or(&name);
    rename_files(&final_shard, &item.iid, effective)?;

    let basename = format!("{effective}-{}", item.iid);
    if let Ok(info) = ItemInfo::load(&final_shard.join(format!("{basename}.info.json"))) {
        fetch_side_channels(http, &final_shard, &basename, &info, opts)?;
    }
    persist_chapters(catalog, item, &info)?;

    let ctime = item.ctime.unwrap_or(downloaded_at);
    let tx = catalog.txn()?;
    if final_dname != dname {
        tx.update_item_dname(&item.iid, &final_dname)?;
    }
    tx.update_item_synced(
        item.rowid,
        info.duration_secs(),
        &title,
        &name,
        info.uploader.as_deref(),
        &info.thumbnail_urls(),
        info.publish_time(),
        ctime,
        downloaded_at,
        Some(downloaded_at),
    )?;
    tx.commit()?;

    Ok(ItemOutcome::Done(
        final_shard.join(format!("{basename}.{VIDEO_SUFFIX}")),
    ))
}

enum SizeGate {
    Satisfactory,
    Small,
    /// No peer metadata file advertising sizes; no verdict.
    Unknown,
}

fn size_gate(dir: &Path, basename: &str, media_file: &Path) -> Result<SizeGate> {
    let info_path = dir.join(format!("{basename}.info.json"));
    let Ok(info) = ItemInfo::load(&info_path) else {
        return Ok(SizeGate::Unknown);
    };
    let Some(largest) = info.largest_format_size() else {
        return Ok(SizeGate::Unknown);
    };
    let current = fs::metadata(media_file)?.len() as f64;
    if current >= largest as f64 * SIZE_GATE_RATIO {
        Ok(SizeGate::Satisfactory)
    } else {
        Ok(SizeGate::Small)
    }
}

/// Locates the extractor's `*-<iid>.info.json` in a directory.
fn find_info_json(dir: &Path, iid: &str) -> Result<Option<PathBuf>> {
    let marker = format!("-{iid}.info.json");
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.ends_with(&marker) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Moves every file carrying `iid` from one shard directory into another.
fn move_item_files(from: &Path, to: &Path, iid: &str) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.contains(iid) {
            fs::rename(entry.path(), to.join(name))?;
        }
    }
    Ok(())
}

/// Recognized suffix classes for the rename pass, checked in order.
fn classify_suffix(after_iid: &str) -> Result<Option<String>> {
    if after_iid.is_empty() {
        // Bare file; the caller probes its content.
        return Ok(None);
    }
    if after_iid == ".json" || after_iid == ".info.json" {
        return Ok(Some(".info.json".to_owned()));
    }
    for prefix in [".subtitle.", ".caption."] {
        if let Some(rest) = after_iid.strip_prefix(prefix) {
            if rest.split('.').count() == 2 {
                return Ok(Some(after_iid.to_owned()));
            }
        }
    }
    let Some((stem, ext)) = after_iid.rsplit_once('.') else {
        // Trailing junk with no dot at all; refuse to guess.
        return Err(Error::Tool {
            tool: "rename",
            detail: format!("unrecognizable file suffix '{after_iid}'"),
        });
    };
    for n in 0..=5 {
        if stem.ends_with(&format!("_{n}")) {
            return Ok(Some(format!("_{n}.{ext}")));
        }
    }
    Ok(Some(format!(".{ext}")))
}

/// Renames every file in `dir` carrying `iid` to `<new_name>-<iid><suffix>`.
///
/// Bare files get their container probed: MP4 content is transmuxed into the
/// archive container, Matroska content just gains the extension, anything
/// else raises. Returns whether any file changed name.
pub fn rename_files(dir: &Path, iid: &str, new_name: &str) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    let mut renamed = false;

    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            // Resource-fork style droppings are never touched.
            if name.starts_with("._") {
                continue;
            }
            if name.contains(iid) {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();

    for name in names {
        let Some((_, after)) = name.rsplit_once(iid) else {
            continue;
        };

        let suffix = match classify_suffix(after)? {
            Some(suffix) => suffix,
            None => {
                // Bare file: decide by content.
                let path = dir.join(&name);
                match media::probe_container(&path)? {
                    media::Container::Matroska => format!(".{VIDEO_SUFFIX}"),
                    media::Container::Mp4 => {
                        let dest = dir.join(format!("{new_name}-{iid}.{VIDEO_SUFFIX}"));
                        println!("\t\t{} -> {} (transmux)", name, dest.display());
                        media::transmux_to_mkv(&path, &dest)?;
                        fs::remove_file(&path)?;
                        renamed = true;
                        continue;
                    }
                }
            }
        };

        let dest = format!("{new_name}-{iid}{suffix}");
        if name != dest {
            println!("\t\t{name} -> {dest}");
            fs::rename(dir.join(&name), dir.join(&dest))?;
            renamed = true;
        }
    }
    Ok(renamed)
}

/// Downloads listed subtitles and automatic captions next to the media file.
fn fetch_side_channels(
    http: &dyn Http,
    dir: &Path,
    basename: &str,
    info: &ItemInfo,
    opts: &DownloadOptions,
) -> Result<()> {
    let Some(langs_spec) = &opts.sub_langs else {
        return Ok(());
    };
    let wanted: Option<Vec<&str>> = if langs_spec.is_empty() {
        None
    } else {
        Some(langs_spec.split(',').map(str::trim).collect())
    };
    let want = |lang: &str| wanted.as_ref().is_none_or(|w| w.contains(&lang));

    let channels = [
        ("subtitle", &info.subtitles),
        ("caption", &info.automatic_captions),
    ];
    for (label, map) in channels {
        let mut langs: Vec<&String> = map.keys().collect();
        langs.sort();
        for lang in langs {
            if !want(lang) {
                continue;
            }
            let track = map[lang]
                .iter()
                .find_map(|t| Some((t.url.as_deref()?, t.ext.as_deref()?)));
            let Some((url, ext)) = track else {
                continue;
            };
            let path = dir.join(format!("{basename}.{label}.{lang}.{ext}"));
            if path.exists() && !opts.force {
                continue;
            }
            match retry_backoff(NETWORK_RETRY_ATTEMPTS, std::thread::sleep, || http.get(url)) {
                Ok(Some(body)) => fs::write(&path, body)?,
                Ok(None) => {
                    tracing::debug!(url, lang = %lang, "side channel answered non-200");
                }
                Err(err) => {
                    tracing::warn!(url, lang = %lang, error = %err, "side channel fetch failed");
                }
            }
        }
    }
    Ok(())
}

fn format_chapter_time(secs: i64) -> String {
    let (min, sec) = (secs / 60, secs % 60);
    let (hr, min) = (min / 60, min % 60);
    if hr > 0 {
        format!("{hr}:{min:02}:{sec:02}")
    } else {
        format!("{min}:{sec:02}")
    }
}

/// Chapter list from the metadata file, with a leading `0:00 Start` filled
/// in when the first chapter starts later.
pub fn chapters_from_info(info: &ItemInfo) -> Option<Vec<Chapter>> {
    let raw = info.chapters.as_ref()?;
    if raw.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    if raw[0].start_time.unwrap_or(0.0) > 0.0 {
        out.push(("0:00".to_owned(), "Start".to_owned()));
    }
    for ch in raw {
        let start = format_chapter_time(ch.start_time.unwrap_or(0.0).round() as i64);
        let label = ch.title.clone().unwrap_or_default();
        out.push((start, label));
    }
    Some(out)
}

fn persist_chapters(catalog: &mut Catalog, item: &Item, info: &ItemInfo) -> Result<()> {
    if item.chapters.is_some() {
        return Ok(());
    }
    if let Some(chapters) = chapters_from_info(info) {
        let tx = catalog.txn()?;
        tx.set_item_chapters(&item.iid, &chapters)?;
        tx.commit()?;
    }
    Ok(())
}

/// Re-applies the rename pass for every non-skipped item so on-disk names
/// track the current computed or preferred name.
pub fn update_names(
    catalog: &mut Catalog,
    root: &Path,
    filter: &[String],
) -> Result<(Vec<String>, Vec<String>)> {
    let mut clauses = vec!["skip != 1".to_owned()];
    if !filter.is_empty() {
        let csv = crate::util::list_to_quoted_csv(filter);
        clauses.push(format!("(iid IN ({csv}) OR dname IN ({csv}))"));
    }
    let rows = catalog.select_items(&clauses)?;

    let mut same = Vec::new();
    let mut changed = Vec::new();
    for (i, item) in rows.iter().enumerate() {
        println!("\t{} of {}: {}", i + 1, rows.len(), item.iid);
        let Some(dname) = &item.dname else {
            continue;
        };
        let name = match catalog.pref_name(&item.iid)? {
            Some(pref) => pref,
            None => item.name.clone().unwrap_or_else(|| TEMP_NAME.to_owned()),
        };
        let dir = root.join(dname).join(shard_char(&item.iid).to_string());
        if rename_files(&dir, &item.iid, &name)? {
            changed.push(item.iid.clone());
        } else {
            same.push(item.iid.clone());
        }
    }
    println!("Same: {}", same.len());
    println!("Changed: {}", changed.len());
    Ok((same, changed))
}
