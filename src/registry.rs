#![forbid(unsafe_code)]

//! Sleep and skip handling.
//!
//! Skip is a persistent boolean on the item; sleep is a time-bounded
//! suppression that expires on its own. Expired entries are pruned at the
//! start of every operation that consults the registry.

use chrono::{DateTime, Duration, Utc};

use crate::catalog::{Catalog, CatalogRead, SleepEntry, parse_ts};
use crate::error::{Error, Result};

/// Parses a wake instant: absolute `YYYY-MM-DD HH:MM:SS` (UTC) or relative
/// `<unit>+N` with unit in d/h/m/s, computed against `now`.
pub fn parse_wake(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some((unit, n)) = input.split_once('+') {
        let n: i64 = n
            .parse()
            .map_err(|_| Error::InvalidSleep(input.to_owned()))?;
        let delta = match unit {
            "d" => Duration::days(n),
            "h" => Duration::hours(n),
            "m" => Duration::minutes(n),
            "s" => Duration::seconds(n),
            _ => return Err(Error::InvalidSleep(input.to_owned())),
        };
        return Ok(now + delta);
    }

    parse_ts(input).ok_or_else(|| Error::InvalidSleep(input.to_owned()))
}

/// Inserts or updates a sleep entry, pruning expired rows first.
pub fn sleep(catalog: &mut Catalog, iid: &str, when: &str) -> Result<DateTime<Utc>> {
    let now = crate::catalog::now();
    let wake = parse_wake(when, now)?;
    let tx = catalog.txn()?;
    tx.sleep_prune(now)?;
    tx.sleep_put(iid, wake)?;
    tx.commit()?;
    Ok(wake)
}

pub fn unsleep(catalog: &mut Catalog, iid: &str) -> Result<()> {
    let tx = catalog.txn()?;
    tx.sleep_delete(iid)?;
    tx.sleep_prune(crate::catalog::now())?;
    tx.commit()?;
    Ok(())
}

/// All live entries ordered by wake instant, after pruning.
pub fn list(catalog: &mut Catalog) -> Result<Vec<SleepEntry>> {
    prune(catalog)?;
    catalog.sleep_all()
}

/// Drops every entry whose wake instant has passed.
pub fn prune(catalog: &mut Catalog) -> Result<usize> {
    let tx = catalog.txn()?;
    let n = tx.sleep_prune(crate::catalog::now())?;
    tx.commit()?;
    Ok(n)
}

/// Wake instant still in the future for `iid`, if any. Expired entries are
/// reported as absent; pruning them is the caller's batch-entry job.
pub fn active_wake(
    catalog: &Catalog,
    iid: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    Ok(catalog.sleep_get(iid)?.filter(|wake| *wake > now))
}

/// Marks items skipped or unskipped. Skipping deletes any sleep entry in the
/// same transaction.
pub fn mark_skip(catalog: &mut Catalog, iids: &[String], skip: bool) -> Result<()> {
    let tx = catalog.txn()?;
    for iid in iids {
        tx.set_item_skip(iid, skip)?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::open_temp;

    fn t0() -> DateTime<Utc> {
        parse_ts("2024-06-01 12:00:00").unwrap()
    }

    #[test]
    fn parse_wake_relative_units() {
        let now = t0();
        assert_eq!(parse_wake("d+1", now).unwrap(), now + Duration::days(1));
        assert_eq!(parse_wake("h+3", now).unwrap(), now + Duration::hours(3));
        assert_eq!(parse_wake("m+45", now).unwrap(), now + Duration::minutes(45));
        assert_eq!(parse_wake("s+90", now).unwrap(), now + Duration::seconds(90));
    }

    #[test]
    fn parse_wake_absolute() {
        let wake = parse_wake("2030-01-02 03:04:05", t0()).unwrap();
        assert_eq!(wake, parse_ts("2030-01-02 03:04:05").unwrap());
    }

    #[test]
    fn parse_wake_rejects_garbage() {
        assert!(matches!(parse_wake("x+1", t0()), Err(Error::InvalidSleep(_))));
        assert!(matches!(parse_wake("d+soon", t0()), Err(Error::InvalidSleep(_))));
        assert!(matches!(parse_wake("tomorrow", t0()), Err(Error::InvalidSleep(_))));
    }

    #[test]
    fn sleep_then_list_orders_by_wake() {
        let (_d, mut cat) = open_temp();
        sleep(&mut cat, "bbbbbbbbbbb", "d+2").unwrap();
        sleep(&mut cat, "aaaaaaaaaaa", "d+1").unwrap();
        let entries = list(&mut cat).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].iid, "aaaaaaaaaaa");
    }

    #[test]
    fn expired_entries_are_pruned_on_list() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.sleep_put("aaaaaaaaaaa", t0()).unwrap(); // long past
        tx.commit().unwrap();
        assert!(list(&mut cat).unwrap().is_empty());
    }

    #[test]
    fn active_wake_ignores_past_entries() {
        let (_d, mut cat) = open_temp();
        let now = crate::catalog::now();
        let tx = cat.txn().unwrap();
        tx.sleep_put("aaaaaaaaaaa", now - Duration::hours(1)).unwrap();
        tx.sleep_put("bbbbbbbbbbb", now + Duration::hours(1)).unwrap();
        tx.commit().unwrap();

        assert!(active_wake(&cat, "aaaaaaaaaaa", now).unwrap().is_none());
        assert!(active_wake(&cat, "bbbbbbbbbbb", now).unwrap().is_some());
    }

    #[test]
    fn mark_skip_requires_known_item() {
        let (_d, mut cat) = open_temp();
        let err = mark_skip(&mut cat, &["ghost1234567".into()], true).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
