#![forbid(unsafe_code)]

//! Sync orchestration.
//!
//! `sync_lists` walks the four source variants in their fixed order, probing
//! feeds where allowed and falling back to full enumeration. `sync_items`
//! enriches individual items with per-item metadata. Both run strictly
//! serially; every site request is rate-sensitive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::catalog::{Catalog, CatalogRead, SourceKind, now};
use crate::error::{Error, Result};
use crate::extractor::Extractor;
use crate::feed::{self, FeedVerdict, Http};
use crate::hooks::{self, HookEvent};
use crate::listing;
use crate::naming::title_to_name;
use crate::registry;
use crate::util::{NETWORK_RETRY_ATTEMPTS, retry_backoff};

#[derive(Debug, Clone, Default)]
pub struct SyncListsOptions {
    pub filter: Vec<String>,
    pub ignore_old: bool,
    pub feed_ok: bool,
    pub force: bool,
    /// Seconds to pause between sources, throttling site access.
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ListSyncSummary {
    pub done: Vec<String>,
    pub fresh: Vec<String>,
    pub errors: Vec<String>,
    pub aborted: bool,
}

/// Syncs source listings. Variant order is mandatory: users, unnamed
/// channels, named channels, then playlists, so the first writer wins
/// `dname` when an item is claimed by several sources.
pub fn sync_lists(
    catalog: &mut Catalog,
    extractor: &Extractor,
    http: &dyn Http,
    opts: &SyncListsOptions,
    abort: &AtomicBool,
) -> Result<ListSyncSummary> {
    let mut summary = ListSyncSummary::default();

    for kind in SourceKind::SYNC_ORDER {
        let sources = catalog.sources(kind, &opts.filter, opts.ignore_old)?;
        if sources.is_empty() {
            continue;
        }
        println!("Updating {}s ({})", kind.describe(), sources.len());

        for source in sources {
            if abort.load(Ordering::SeqCst) {
                summary.aborted = true;
                return Ok(summary);
            }

            let effective = source.effective_key().to_owned();
            if let Some(alias) = &source.alias {
                println!("\t{} -> {}", source.key, alias);
            } else {
                println!("\t{}", source.key);
            }

            if source.skip {
                println!("\t\tSkipping");
                continue;
            }

            // The feed is only meaningful for incremental checks: a source
            // never synced before has no baseline to compare against.
            let mut feed_ids = None;
            if opts.feed_ok && source.atime.is_some() && kind != SourceKind::Playlist {
                match feed::probe(catalog, http, kind, &source.key, &effective) {
                    Ok(FeedVerdict::Fresh) if !opts.force => {
                        println!("\t\tFeed is fresh, no updates");
                        summary.fresh.push(effective);
                        continue;
                    }
                    Ok(FeedVerdict::Fresh) => {}
                    Ok(FeedVerdict::IndicatesNew(ids)) => {
                        println!("\t\tFeed shows new items, obtaining full list");
                        feed_ids = Some(ids);
                    }
                    Ok(FeedVerdict::NoFeed) => {
                        println!("\t\tNo usable feed");
                    }
                    Err(err) => {
                        eprintln!("\t\tWarning: feed probe failed for {effective}: {err}");
                    }
                }
            }

            let result = listing::enumerate(extractor, &source).and_then(|list| {
                listing::reconcile(catalog, &source, &list, feed_ids.as_deref(), opts.force)
            });
            match result {
                Ok(outcome) => {
                    let tx = catalog.txn()?;
                    tx.touch_source(
                        kind,
                        source.rowid,
                        outcome.title.as_deref(),
                        outcome.uploader.as_deref(),
                    )?;
                    tx.commit()?;

                    if outcome.fresh {
                        println!("\t\tAll are old, no updates");
                    } else {
                        println!(
                            "\t\tNew: {}, tombstoned: {}",
                            outcome.new_members, outcome.tombstoned
                        );
                    }
                    hooks::dispatch(
                        catalog,
                        &HookEvent::ListSynced {
                            source: effective.clone(),
                            new_members: outcome.new_members,
                            tombstoned: outcome.tombstoned,
                        },
                    );
                    summary.done.push(effective);
                }
                Err(Error::Interrupted) => {
                    summary.aborted = true;
                    return Ok(summary);
                }
                Err(err @ Error::Storage(_)) => return Err(err),
                Err(err) => {
                    eprintln!("\t\tWarning: sync failed for {effective}: {err}");
                    summary.errors.push(effective);
                }
            }

            if let Some(secs) = opts.delay_secs {
                std::thread::sleep(Duration::from_secs(secs));
            }
        }
    }

    println!("\tDone: {}", summary.done.len());
    println!("\tError: {}", summary.errors.len());
    for key in &summary.errors {
        println!("\t\t{key}");
    }
    Ok(summary)
}

#[derive(Debug, Default)]
pub struct ItemSyncSummary {
    pub total: usize,
    pub done: Vec<String>,
    pub skipped: Vec<String>,
    pub sleeping: Vec<String>,
    pub payment_required: Vec<String>,
    pub errors: Vec<String>,
    pub aborted: bool,
}

/// Enriches items with per-item metadata from the extractor.
pub fn sync_items(
    catalog: &mut Catalog,
    extractor: &Extractor,
    filter: &[String],
    ignore_old: bool,
    abort: &AtomicBool,
) -> Result<ItemSyncSummary> {
    registry::prune(catalog)?;

    let rows = catalog.items_for_sync(filter, ignore_old)?;
    let mut summary = ItemSyncSummary {
        total: rows.len(),
        ..Default::default()
    };

    for (i, item) in rows.iter().enumerate() {
        if abort.load(Ordering::SeqCst) {
            summary.aborted = true;
            break;
        }
        println!("\t{} of {}: {}", i + 1, rows.len(), item.iid);

        if item.skip {
            println!("\t\tSkipping");
            // Mark as looked at so repeated --ignore-old runs move past it.
            let tx = catalog.txn()?;
            tx.touch_item_atime(item.rowid)?;
            tx.commit()?;
            summary.skipped.push(item.iid.clone());
            continue;
        }

        if let Some(wake) = registry::active_wake(catalog, &item.iid, now())? {
            println!("\t\tSleeping until {wake}");
            summary.sleeping.push(item.iid.clone());
            continue;
        }

        let info = retry_backoff(NETWORK_RETRY_ATTEMPTS, std::thread::sleep, || {
            extractor.item_info(&item.iid)
        });
        let info = match info {
            Ok(info) => info,
            Err(Error::Interrupted) => {
                summary.aborted = true;
                break;
            }
            Err(Error::PaymentRequired(detail)) => {
                eprintln!("\t\tPayment required: {detail}");
                summary.payment_required.push(item.iid.clone());
                continue;
            }
            Err(err) => {
                eprintln!("\t\tWarning: metadata fetch failed for {}: {err}", item.iid);
                summary.errors.push(item.iid.clone());
                continue;
            }
        };

        let Some(title) = info.title.clone() else {
            eprintln!("\t\tWarning: extractor returned no title for {}", item.iid);
            summary.errors.push(item.iid.clone());
            continue;
        };
        let name = title_to_name(&title);

        let atime = now();
        let ctime = item.ctime.unwrap_or(atime);
        let tx = catalog.txn()?;
        tx.update_item_synced(
            item.rowid,
            info.duration_secs(),
            &title,
            &name,
            info.uploader.as_deref(),
            &info.thumbnail_urls(),
            info.publish_time(),
            ctime,
            atime,
            None,
        )?;
        tx.commit()?;

        hooks::dispatch(
            catalog,
            &HookEvent::ItemSynced {
                iid: item.iid.clone(),
                title: title.clone(),
            },
        );
        summary.done.push(item.iid.clone());
    }

    println!();
    println!("Total items: {}", summary.total);
    println!("Completed: {}", summary.done.len());
    println!("Payment required ({}):", summary.payment_required.len());
    for iid in &summary.payment_required {
        println!("\t{iid}");
    }
    println!("Other errors ({}):", summary.errors.len());
    for iid in &summary.errors {
        println!("\t{iid}");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::open_temp;
    use crate::extractor::stub;
    use crate::feed::Http;
    use tempfile::tempdir;

    struct NoHttp;
    impl Http for NoHttp {
        fn get(&self, _url: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    const FLAT_STUB: &str = r#"
if printf '%s\n' "$@" | grep -q -- '--flat-playlist'; then
  echo '{"id":"aaaaaaaaaaa","title":"Alpha","playlist_index":1,"playlist_title":"MIT List","playlist_uploader":"MIT"}'
  exit 0
fi
cat <<'JSON'
{"id":"aaaaaaaaaaa","title":"Alpha: Raw?","duration":90,"uploader":"MIT",
 "upload_date":"20240102","thumbnails":[{"url":"https://img/1.jpg"}]}
JSON
"#;

    #[test]
    fn sync_lists_populates_membership_and_source() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(dir.path(), FLAT_STUB));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, "MIT").unwrap();
        tx.commit().unwrap();

        let opts = SyncListsOptions {
            feed_ok: false,
            ..Default::default()
        };
        let abort = AtomicBool::new(false);
        let summary = sync_lists(&mut cat, &ex, &NoHttp, &opts, &abort).unwrap();
        assert_eq!(summary.done, vec!["MIT"]);
        assert!(summary.errors.is_empty());

        let members = cat.memberships("MIT").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].iid, "aaaaaaaaaaa");
        assert_eq!(members[0].idx, 1);

        let src = cat.get_source(SourceKind::User, "MIT").unwrap().unwrap();
        assert!(src.atime.is_some());
        assert_eq!(src.title.as_deref(), Some("MIT List"));
    }

    #[test]
    fn feed_fresh_rerun_mutates_nothing() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(dir.path(), FLAT_STUB));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, "MIT").unwrap();
        tx.commit().unwrap();

        // First pass enumerates and seeds the membership.
        let abort = AtomicBool::new(false);
        let opts = SyncListsOptions {
            feed_ok: true,
            ..Default::default()
        };
        struct FeedHttp;
        impl Http for FeedHttp {
            fn get(&self, url: &str) -> Result<Option<String>> {
                if url.contains("/user/MIT") {
                    return Ok(Some(
                        r#"<html><head><link rel="alternate" type="application/rss+xml"
                           href="https://www.youtube.com/feeds/videos.xml?user=MIT"></head></html>"#
                            .to_owned(),
                    ));
                }
                Ok(Some(
                    r#"<?xml version="1.0"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <title>MIT</title>
  <entry><yt:videoId>aaaaaaaaaaa</yt:videoId></entry>
</feed>"#
                        .to_owned(),
                ))
            }
        }
        let summary = sync_lists(&mut cat, &ex, &FeedHttp, &opts, &abort).unwrap();
        assert_eq!(summary.done, vec!["MIT"]);

        let members_before = cat.memberships("MIT").unwrap();
        let src_before = cat.get_source(SourceKind::User, "MIT").unwrap().unwrap();

        // Second pass: the feed lists only known ids, so the source is
        // fresh and neither membership nor source rows move.
        let summary = sync_lists(&mut cat, &ex, &FeedHttp, &opts, &abort).unwrap();
        assert_eq!(summary.fresh, vec!["MIT"]);
        assert!(summary.done.is_empty());

        let members_after = cat.memberships("MIT").unwrap();
        assert_eq!(members_before.len(), members_after.len());
        assert_eq!(members_before[0].atime, members_after[0].atime);
        let src_after = cat.get_source(SourceKind::User, "MIT").unwrap().unwrap();
        assert_eq!(src_before.atime, src_after.atime);
    }

    #[test]
    fn sync_lists_abort_flag_stops_early() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(dir.path(), FLAT_STUB));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, "MIT").unwrap();
        tx.commit().unwrap();

        let abort = AtomicBool::new(true);
        let summary = sync_lists(
            &mut cat,
            &ex,
            &NoHttp,
            &SyncListsOptions::default(),
            &abort,
        )
        .unwrap();
        assert!(summary.aborted);
        assert!(summary.done.is_empty());
    }

    #[test]
    fn sync_items_enriches_rows() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(dir.path(), FLAT_STUB));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), None).unwrap();
        tx.commit().unwrap();

        let abort = AtomicBool::new(false);
        let summary = sync_items(&mut cat, &ex, &[], false, &abort).unwrap();
        assert_eq!(summary.done, vec!["aaaaaaaaaaa"]);

        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert_eq!(item.title.as_deref(), Some("Alpha: Raw?"));
        assert_eq!(item.name.as_deref(), Some("Alpha- Raw"));
        assert_eq!(item.duration, Some(90));
        assert_eq!(item.uploader.as_deref(), Some("MIT"));
        assert!(item.atime.is_some());
        assert!(item.utime.is_none());
        assert_eq!(item.thumbnails, vec!["https://img/1.jpg"]);
    }

    #[test]
    fn sync_items_skip_only_bumps_atime() {
        let dir = tempdir().unwrap();
        // A stub that would fail loudly if invoked.
        let ex = Extractor::with_program(stub::install(dir.path(), "exit 9"));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), None).unwrap();
        tx.set_item_skip("aaaaaaaaaaa", true).unwrap();
        tx.commit().unwrap();

        let abort = AtomicBool::new(false);
        let summary = sync_items(&mut cat, &ex, &[], false, &abort).unwrap();
        assert_eq!(summary.skipped, vec!["aaaaaaaaaaa"]);
        assert!(summary.errors.is_empty());

        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert!(item.atime.is_some());
        assert!(item.title.is_none());
    }

    #[test]
    fn sync_items_sleeping_items_are_untouched() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(dir.path(), "exit 9"));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), None).unwrap();
        tx.sleep_put("aaaaaaaaaaa", now() + chrono::Duration::hours(2)).unwrap();
        tx.commit().unwrap();

        let abort = AtomicBool::new(false);
        let summary = sync_items(&mut cat, &ex, &[], false, &abort).unwrap();
        assert_eq!(summary.sleeping, vec!["aaaaaaaaaaa"]);
        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert!(item.atime.is_none());
    }

    #[test]
    fn sync_items_payment_required_is_bucketed() {
        let dir = tempdir().unwrap();
        let ex = Extractor::with_program(stub::install(
            dir.path(),
            r#"echo 'ERROR: This video requires payment to watch' >&2; exit 1"#,
        ));
        let (_cd, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), None).unwrap();
        tx.commit().unwrap();

        let abort = AtomicBool::new(false);
        let summary = sync_items(&mut cat, &ex, &[], false, &abort).unwrap();
        assert_eq!(summary.payment_required, vec!["aaaaaaaaaaa"]);
        assert!(summary.done.is_empty());
    }
}
