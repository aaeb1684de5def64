#![forbid(unsafe_code)]

//! Full source enumeration and catalog reconciliation.
//!
//! The extractor's flat-listing mode yields the complete ordered id list for
//! a source. Reconciliation folds that list into the membership relation and
//! the item table inside a single transaction, tombstoning rows that left
//! the listing instead of deleting them.

use crate::catalog::{Catalog, CatalogRead, Source, now};
use crate::error::{Error, Result};
use crate::extractor::{Extractor, Listing};
use crate::urls::source_list_url;
use crate::util::{NETWORK_RETRY_ATTEMPTS, retry_backoff};

/// The extractor occasionally reports success with zero entries; retry this
/// many times beyond the first attempt before declaring the list empty.
pub const EMPTY_LIST_RETRIES: u32 = 3;

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub title: Option<String>,
    pub uploader: Option<String>,
    /// Rows inserted into the membership relation.
    pub new_members: usize,
    /// Live rows demoted to tombstones.
    pub tombstoned: usize,
    /// Feed-only ids recorded as placeholders (typically unreleased items).
    pub ghosts: usize,
    /// True when every enumerated id was already a member and no ordering
    /// update was applied.
    pub fresh: bool,
}

/// Runs the extractor's flat listing for a source, retrying empty results.
pub fn enumerate(extractor: &Extractor, source: &Source) -> Result<Listing> {
    let url = source_list_url(source.kind, &source.key);

    for attempt in 0..=EMPTY_LIST_RETRIES {
        let run = retry_backoff(NETWORK_RETRY_ATTEMPTS, std::thread::sleep, || {
            extractor.flat_list(&url)
        });
        match run {
            Ok(listing) => return Ok(listing),
            Err(Error::ExtractorEmpty) => {
                tracing::info!(url = %url, attempt, "flat listing came back empty");
            }
            Err(other) => return Err(other),
        }
    }
    Err(Error::EmptyList(source.effective_key().to_owned()))
}

/// Folds an enumeration into the catalog. `feed_ids` carries the probe's id
/// list when a feed prompted this run, so ids the feed exposes but the
/// listing does not ("ghosts") can be recorded as placeholders.
pub fn reconcile(
    catalog: &mut Catalog,
    source: &Source,
    listing: &Listing,
    feed_ids: Option<&[String]>,
    force: bool,
) -> Result<ReconcileOutcome> {
    let key = source.effective_key().to_owned();
    let mut outcome = ReconcileOutcome {
        title: listing.title.clone(),
        uploader: listing.uploader.clone(),
        ..Default::default()
    };

    let tx = catalog.txn()?;
    let mut old = tx.membership_map(&key)?;

    let all_old = listing.entries.iter().all(|e| old.contains_key(&e.iid));

    if all_old && !force {
        // Feed entries absent from the full listing are usually unreleased
        // items; keep a tombstone membership and a bare item row so the feed
        // stops reporting them as new.
        if let Some(feed_ids) = feed_ids {
            for iid in feed_ids {
                if listing.entries.iter().any(|e| &e.iid == iid) {
                    continue;
                }
                outcome.ghosts += 1;
                if !tx.is_member(&key, iid)? {
                    tx.insert_member(&key, iid, crate::catalog::TOMBSTONE_IDX, Some(now()))?;
                }
                if tx.get_item(iid)?.is_none() {
                    tx.insert_item_shell(iid, &key, None, None)?;
                }
            }
        }
        outcome.fresh = true;
        tx.commit()?;
        return Ok(outcome);
    }

    let listed_at = now();
    for entry in &listing.entries {
        match old.remove(&entry.iid) {
            Some(rowid) => tx.update_member(rowid, entry.idx, listed_at)?,
            None => {
                tx.insert_member(&key, &entry.iid, entry.idx, Some(listed_at))?;
                outcome.new_members += 1;
            }
        }
    }

    // Whatever the listing no longer carries keeps its provenance as a
    // tombstone.
    for (_iid, rowid) in old {
        tx.tombstone_member(rowid)?;
        outcome.tombstoned += 1;
    }

    for entry in &listing.entries {
        match tx.get_item(&entry.iid)? {
            Some(item) => tx.mark_item_listed(item.rowid, entry.title.as_deref())?,
            None => tx.insert_item_shell(&entry.iid, &key, Some(listed_at), entry.title.as_deref())?,
        }
    }

    tx.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SourceKind, TOMBSTONE_IDX, open_temp};
    use crate::extractor::{ListedItem, stub};
    use tempfile::tempdir;

    fn listing(ids: &[(&str, i64)]) -> Listing {
        Listing {
            title: Some("List".into()),
            uploader: Some("Up".into()),
            entries: ids
                .iter()
                .map(|(iid, idx)| ListedItem {
                    iid: iid.to_string(),
                    title: Some(format!("Title {iid}")),
                    idx: *idx,
                })
                .collect(),
        }
    }

    fn user_source(cat: &mut Catalog, key: &str) -> Source {
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, key).unwrap();
        tx.commit().unwrap();
        cat.get_source(SourceKind::User, key).unwrap().unwrap()
    }

    #[test]
    fn first_reconcile_creates_members_and_items() {
        let (_d, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        let out = reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1), ("bbbbbbbbbbb", 2)]), None, false)
            .unwrap();
        assert_eq!(out.new_members, 2);
        assert!(!out.fresh);

        let members = cat.memberships("MIT").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].idx, 1);

        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert_eq!(item.dname.as_deref(), Some("MIT"));
        assert_eq!(item.title.as_deref(), Some("Title aaaaaaaaaaa"));
        // Listed items await enrichment.
        assert!(item.atime.is_none());
        assert!(item.ctime.is_some());
    }

    #[test]
    fn vanished_items_become_tombstones() {
        let (_d, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1), ("bbbbbbbbbbb", 2)]), None, false)
            .unwrap();
        let out =
            reconcile(&mut cat, &src, &listing(&[("bbbbbbbbbbb", 1)]), None, true).unwrap();
        assert_eq!(out.tombstoned, 1);

        let members = cat.memberships("MIT").unwrap();
        let gone = members.iter().find(|m| m.iid == "aaaaaaaaaaa").unwrap();
        assert_eq!(gone.idx, TOMBSTONE_IDX);
        // Item row survives.
        assert!(cat.get_item("aaaaaaaaaaa").unwrap().is_some());
    }

    #[test]
    fn all_old_without_force_is_fresh_noop() {
        let (_d, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1)]), None, false).unwrap();
        let before = cat.memberships("MIT").unwrap()[0].atime;

        let out = reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1)]), None, false).unwrap();
        assert!(out.fresh);
        assert_eq!(cat.memberships("MIT").unwrap()[0].atime, before);
    }

    #[test]
    fn ghost_feed_ids_get_placeholder_rows() {
        let (_d, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1)]), None, false).unwrap();

        let feed_ids = vec!["aaaaaaaaaaa".to_string(), "ggggggggggg".to_string()];
        let out = reconcile(
            &mut cat,
            &src,
            &listing(&[("aaaaaaaaaaa", 1)]),
            Some(&feed_ids),
            false,
        )
        .unwrap();
        assert!(out.fresh);
        assert_eq!(out.ghosts, 1);

        let ghost = cat
            .memberships("MIT")
            .unwrap()
            .into_iter()
            .find(|m| m.iid == "ggggggggggg")
            .unwrap();
        assert_eq!(ghost.idx, TOMBSTONE_IDX);
        let item = cat.get_item("ggggggggggg").unwrap().unwrap();
        assert!(item.ctime.is_none() && item.atime.is_none() && item.utime.is_none());
    }

    #[test]
    fn relisting_clears_item_atime_for_resync() {
        let (_d, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1)]), None, false).unwrap();

        // Simulate a prior enrichment.
        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        let tx = cat.txn().unwrap();
        tx.touch_item_atime(item.rowid).unwrap();
        tx.commit().unwrap();

        reconcile(&mut cat, &src, &listing(&[("aaaaaaaaaaa", 1)]), None, true).unwrap();
        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert!(item.atime.is_none());
    }

    #[test]
    fn enumerate_gives_empty_list_after_retries() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("count");
        let body = format!(
            r#"
echo x >> {c}
exit 0
"#,
            c = counter.display()
        );
        let stub_path = stub::install(dir.path(), &body);
        let (_cd, mut cat) = open_temp();
        let src = user_source(&mut cat, "MIT");
        let ex = Extractor::with_program(stub_path);

        let err = enumerate(&ex, &src).unwrap_err();
        assert!(matches!(err, Error::EmptyList(ref k) if k == "MIT"));
        let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(attempts as u32, EMPTY_LIST_RETRIES + 1);
    }
}
