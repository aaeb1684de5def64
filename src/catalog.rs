#![forbid(unsafe_code)]

//! Catalog persistence layer.
//!
//! A single SQLite file holds every durable fact: items, the four source
//! variants, the ordered membership relation, the feed-URL cache, the sleep
//! queue, and the hook/copy-destination registries. All structs here mirror
//! the on-disk layout one to one so the rest of the crate never touches raw
//! rows.
//!
//! Mutations go through [`Txn`], an explicit transaction scope that rolls
//! back on drop unless committed. Reads are available on both [`Catalog`]
//! and an open [`Txn`] through the [`CatalogRead`] trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::naming::title_to_name;
use crate::util::list_to_quoted_csv;

/// Directory sentinel for items registered from a bare watch URL before any
/// source claims them. The first successful enrichment re-homes the files.
pub const MISC_DNAME: &str = "MISCELLANEOUS";

/// Timestamp storage format. Second precision keeps SQLite's `strftime`
/// happy and matches the sleep command's absolute input form.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current instant, truncated to whole seconds so values survive a database
/// round-trip unchanged.
pub fn now() -> DateTime<Utc> {
    let t = Utc::now();
    Utc.timestamp_opt(t.timestamp(), 0).unwrap()
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .ok()
        .map(|n| Utc.from_utc_datetime(&n))
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

/// Chapter marker as persisted in the `chapters` JSON column: a
/// `(HH:MM:SS, label)` pair.
pub type Chapter = (String, String);

/// One row of the `items` table.
#[derive(Debug, Clone)]
pub struct Item {
    pub rowid: i64,
    pub iid: String,
    pub name: Option<String>,
    pub dname: Option<String>,
    pub duration: Option<i64>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub ptime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    pub utime: Option<DateTime<Utc>>,
    pub skip: bool,
    pub thumbnails: Vec<String>,
    pub chapters: Option<Vec<Chapter>>,
    pub video_format: Option<String>,
}

/// The four source variants, in mandated sync order. The label doubles as
/// the feed-cache discriminator and the VFS top-level directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    User,
    ChannelUnnamed,
    ChannelNamed,
    Playlist,
}

impl SourceKind {
    /// Users first, playlists last; the first writer wins `dname` for items
    /// claimed by several sources.
    pub const SYNC_ORDER: [SourceKind; 4] = [
        SourceKind::User,
        SourceKind::ChannelUnnamed,
        SourceKind::ChannelNamed,
        SourceKind::Playlist,
    ];

    pub fn table(self) -> &'static str {
        match self {
            SourceKind::User => "users",
            SourceKind::ChannelUnnamed => "channels_unnamed",
            SourceKind::ChannelNamed => "channels_named",
            SourceKind::Playlist => "playlists",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            SourceKind::Playlist => "iid",
            _ => "name",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::User => "u",
            SourceKind::ChannelUnnamed => "ch",
            SourceKind::ChannelNamed => "c",
            SourceKind::Playlist => "pl",
        }
    }

    pub fn from_label(label: &str) -> Option<SourceKind> {
        match label {
            "u" => Some(SourceKind::User),
            "ch" => Some(SourceKind::ChannelUnnamed),
            "c" => Some(SourceKind::ChannelNamed),
            "pl" => Some(SourceKind::Playlist),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            SourceKind::User => "user",
            SourceKind::ChannelUnnamed => "unnamed channel",
            SourceKind::ChannelNamed => "named channel",
            SourceKind::Playlist => "playlist",
        }
    }
}

/// A subscribed source of any variant.
#[derive(Debug, Clone)]
pub struct Source {
    pub rowid: i64,
    pub kind: SourceKind,
    pub key: String,
    /// Unnamed channels only; takes precedence for directory naming.
    pub alias: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub ctime: Option<DateTime<Utc>>,
    pub atime: Option<DateTime<Utc>>,
    /// Playlists only.
    pub skip: bool,
}

impl Source {
    /// Directory-naming token: the alias when set, the keyed column
    /// otherwise.
    pub fn effective_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.key)
    }
}

/// One row of the ordered source→item membership relation. `idx == -1` is a
/// tombstone: the item left the live listing but provenance is preserved.
#[derive(Debug, Clone)]
pub struct Membership {
    pub rowid: i64,
    pub source_key: String,
    pub iid: String,
    pub idx: i64,
    pub atime: Option<DateTime<Utc>>,
}

pub const TOMBSTONE_IDX: i64 = -1;

/// Cached feed lookup for one source. `url == None` means the page was
/// fetched and no feed was advertised.
#[derive(Debug, Clone)]
pub struct FeedCacheEntry {
    pub kind: SourceKind,
    pub key: String,
    pub url: Option<String>,
    pub polled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SleepEntry {
    pub iid: String,
    pub wake: DateTime<Utc>,
}

/// Aggregate numbers for `--info` with no arguments.
#[derive(Debug, Default)]
pub struct CatalogStats {
    pub users: i64,
    pub channels_named: i64,
    pub channels_unnamed: i64,
    pub playlists: i64,
    pub items: i64,
    pub skipped: i64,
    pub downloaded: i64,
    pub preferred_names: i64,
    pub total_duration: i64,
}

/// Handle on the catalog file.
pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Opens (and on first use creates) the catalog. Schema creation is
    /// idempotent; no destructive migrations are ever performed.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let mut cat = Self {
            conn,
            path: path.to_path_buf(),
        };
        cat.ensure_tables()?;
        Ok(cat)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wrapped in a transaction so a failure leaves the file untouched.
    fn ensure_tables(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                iid TEXT NOT NULL UNIQUE,
                name TEXT,
                dname TEXT,
                duration INTEGER,
                title TEXT,
                uploader TEXT,
                ptime TEXT,
                ctime TEXT,
                atime TEXT,
                utime TEXT,
                skip INTEGER NOT NULL DEFAULT 0,
                thumbnails TEXT NOT NULL DEFAULT '[]',
                chapters TEXT,
                video_format TEXT
            );

            CREATE TABLE IF NOT EXISTS pref_names (
                iid TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                name TEXT PRIMARY KEY,
                title TEXT,
                uploader TEXT,
                ctime TEXT,
                atime TEXT
            );

            CREATE TABLE IF NOT EXISTS channels_named (
                name TEXT PRIMARY KEY,
                title TEXT,
                uploader TEXT,
                ctime TEXT,
                atime TEXT
            );

            CREATE TABLE IF NOT EXISTS channels_unnamed (
                name TEXT PRIMARY KEY,
                alias TEXT,
                title TEXT,
                uploader TEXT,
                ctime TEXT,
                atime TEXT
            );

            CREATE TABLE IF NOT EXISTS playlists (
                iid TEXT PRIMARY KEY,
                title TEXT,
                uploader TEXT,
                ctime TEXT,
                atime TEXT,
                skip INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS members (
                source_key TEXT NOT NULL,
                iid TEXT NOT NULL,
                idx INTEGER NOT NULL,
                atime TEXT,
                UNIQUE(source_key, iid)
            );

            CREATE INDEX IF NOT EXISTS idx_members_iid ON members(iid);

            CREATE TABLE IF NOT EXISTS feed_cache (
                kind TEXT NOT NULL,
                source_key TEXT NOT NULL,
                url TEXT,
                polled TEXT,
                UNIQUE(kind, source_key)
            );

            CREATE TABLE IF NOT EXISTS sleep_queue (
                iid TEXT PRIMARY KEY,
                wake TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hooks (
                pos INTEGER PRIMARY KEY AUTOINCREMENT,
                module TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS copy_dests (
                pos INTEGER PRIMARY KEY AUTOINCREMENT,
                dest TEXT NOT NULL UNIQUE
            );
            "#,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Opens an explicit transaction scope. Dropping the returned [`Txn`]
    /// without calling [`Txn::commit`] rolls everything back.
    pub fn txn(&mut self) -> Result<Txn<'_>> {
        Ok(Txn {
            tx: self.conn.transaction()?,
        })
    }
}

/// Open transaction over the catalog. All mutating operations live here.
pub struct Txn<'c> {
    tx: rusqlite::Transaction<'c>,
}

const ITEM_COLS: &str = "rowid, iid, name, dname, duration, title, uploader, \
                         ptime, ctime, atime, utime, skip, thumbnails, chapters, video_format";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let thumbs_json: String = row.get(12)?;
    let chapters_json: Option<String> = row.get(13)?;
    Ok(Item {
        rowid: row.get(0)?,
        iid: row.get(1)?,
        name: row.get(2)?,
        dname: row.get(3)?,
        duration: row.get(4)?,
        title: row.get(5)?,
        uploader: row.get(6)?,
        ptime: col_ts(row, 7)?,
        ctime: col_ts(row, 8)?,
        atime: col_ts(row, 9)?,
        utime: col_ts(row, 10)?,
        skip: row.get::<_, i64>(11)? != 0,
        thumbnails: serde_json::from_str(&thumbs_json).unwrap_or_default(),
        chapters: chapters_json.and_then(|j| serde_json::from_str(&j).ok()),
        video_format: row.get(14)?,
    })
}

fn row_to_source(kind: SourceKind, row: &Row<'_>) -> rusqlite::Result<Source> {
    // Column order is normalized by the SELECTs in `CatalogRead`:
    // rowid, key, alias, title, uploader, ctime, atime, skip
    Ok(Source {
        rowid: row.get(0)?,
        kind,
        key: row.get(1)?,
        alias: row.get(2)?,
        title: row.get(3)?,
        uploader: row.get(4)?,
        ctime: col_ts(row, 5)?,
        atime: col_ts(row, 6)?,
        skip: row.get::<_, i64>(7)? != 0,
    })
}

fn source_select(kind: SourceKind) -> String {
    let alias = if kind == SourceKind::ChannelUnnamed {
        "alias"
    } else {
        "NULL"
    };
    let skip = if kind == SourceKind::Playlist {
        "skip"
    } else {
        "0"
    };
    format!(
        "SELECT rowid, {key}, {alias}, title, uploader, ctime, atime, {skip} FROM {table}",
        key = kind.key_column(),
        table = kind.table(),
    )
}

/// Read operations, shared by [`Catalog`] and an open [`Txn`].
pub trait CatalogRead {
    fn conn(&self) -> &Connection;

    fn get_item(&self, iid: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {ITEM_COLS} FROM items WHERE iid = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![iid], row_to_item)
            .optional()?)
    }

    /// Items for the item-sync batch: filter by iid or owning source key,
    /// optionally restricted to never-downloaded rows. Ordered by iid for
    /// reproducible runs.
    fn items_for_sync(&self, filter: &[String], ignore_old: bool) -> Result<Vec<Item>> {
        let mut clauses = Vec::new();
        if !filter.is_empty() {
            let csv = list_to_quoted_csv(filter);
            clauses.push(format!("(iid IN ({csv}) OR dname IN ({csv}))"));
        }
        if ignore_old {
            clauses.push("utime IS NULL".to_owned());
        }
        self.select_items(&clauses)
    }

    /// Items for the download batch: as above but skipped items are excluded
    /// up front.
    fn items_for_download(&self, filter: &[String], ignore_old: bool) -> Result<Vec<Item>> {
        let mut clauses = vec!["skip != 1".to_owned()];
        if !filter.is_empty() {
            let csv = list_to_quoted_csv(filter);
            clauses.push(format!("(iid IN ({csv}) OR dname IN ({csv}))"));
        }
        if ignore_old {
            clauses.push("utime IS NULL".to_owned());
        }
        self.select_items(&clauses)
    }

    fn select_items(&self, clauses: &[String]) -> Result<Vec<Item>> {
        let mut sql = format!("SELECT {ITEM_COLS} FROM items");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY iid ASC");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn items_with_dname(&self, dname: &str) -> Result<Vec<Item>> {
        let sql = format!("SELECT {ITEM_COLS} FROM items WHERE dname = ?1 ORDER BY iid ASC");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![dname], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn skip_marked_items(&self, skip: bool) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT iid FROM items WHERE skip = ?1 ORDER BY iid ASC")?;
        let rows = stmt.query_map(params![skip as i64], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn pref_name(&self, iid: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT name FROM pref_names WHERE iid = ?1",
                params![iid],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn pref_names_all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT iid, name FROM pref_names ORDER BY iid ASC")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_source(&self, kind: SourceKind, key: &str) -> Result<Option<Source>> {
        let mut sql = source_select(kind);
        if kind == SourceKind::ChannelUnnamed {
            sql.push_str(" WHERE name = ?1 OR alias = ?1");
        } else {
            sql.push_str(&format!(" WHERE {} = ?1", kind.key_column()));
        }
        Ok(self
            .conn()
            .query_row(&sql, params![key], |r| row_to_source(kind, r))
            .optional()?)
    }

    /// Finds a source of any variant matching `key`, in sync order.
    fn find_source(&self, key: &str) -> Result<Option<Source>> {
        for kind in SourceKind::SYNC_ORDER {
            if let Some(src) = self.get_source(kind, key)? {
                return Ok(Some(src));
            }
        }
        Ok(None)
    }

    /// Eligible sources of one variant: optional key filter (matching alias
    /// too for unnamed channels), optionally only never-synced rows. Ordered
    /// by key.
    fn sources(&self, kind: SourceKind, filter: &[String], ignore_old: bool) -> Result<Vec<Source>> {
        let mut sql = source_select(kind);
        let mut clauses = Vec::new();
        if !filter.is_empty() {
            let csv = list_to_quoted_csv(filter);
            if kind == SourceKind::ChannelUnnamed {
                clauses.push(format!("(name IN ({csv}) OR alias IN ({csv}))"));
            } else {
                clauses.push(format!("{} IN ({csv})", kind.key_column()));
            }
        }
        if ignore_old {
            clauses.push("atime IS NULL".to_owned());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} ASC", kind.key_column()));
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |r| row_to_source(kind, r))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Membership rows for one source in listing order.
    fn memberships(&self, source_key: &str) -> Result<Vec<Membership>> {
        let mut stmt = self.conn().prepare(
            "SELECT rowid, source_key, iid, idx, atime FROM members \
             WHERE source_key = ?1 ORDER BY idx ASC",
        )?;
        let rows = stmt.query_map(params![source_key], |r| {
            Ok(Membership {
                rowid: r.get(0)?,
                source_key: r.get(1)?,
                iid: r.get(2)?,
                idx: r.get(3)?,
                atime: col_ts(r, 4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// iid → membership rowid map used by reconciliation.
    fn membership_map(&self, source_key: &str) -> Result<HashMap<String, i64>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT iid, rowid FROM members WHERE source_key = ?1")?;
        let rows = stmt.query_map(params![source_key], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }

    fn is_member(&self, source_key: &str, iid: &str) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM members WHERE source_key = ?1 AND iid = ?2",
            params![source_key, iid],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn feed_cache_get(&self, kind: SourceKind, key: &str) -> Result<Option<FeedCacheEntry>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT url, polled FROM feed_cache WHERE kind = ?1 AND source_key = ?2",
                params![kind.label(), key],
                |r| {
                    Ok(FeedCacheEntry {
                        kind,
                        key: key.to_owned(),
                        url: r.get(0)?,
                        polled: col_ts(r, 1)?,
                    })
                },
            )
            .optional()?)
    }

    fn sleep_get(&self, iid: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT wake FROM sleep_queue WHERE iid = ?1",
                params![iid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(parse_ts))
    }

    fn sleep_all(&self) -> Result<Vec<SleepEntry>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT iid, wake FROM sleep_queue ORDER BY wake ASC")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (iid, wake) = row?;
            let wake = parse_ts(&wake).ok_or_else(|| {
                Error::Tool {
                    tool: "catalog",
                    detail: format!("unparseable wake instant for {iid}"),
                }
            })?;
            out.push(SleepEntry { iid, wake });
        }
        Ok(out)
    }

    fn hooks_list(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT module FROM hooks ORDER BY pos ASC")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn copy_dests(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT dest FROM copy_dests ORDER BY pos ASC")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn stats(&self) -> Result<CatalogStats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn().query_row(sql, [], |r| r.get(0))?)
        };
        Ok(CatalogStats {
            users: count("SELECT COUNT(*) FROM users")?,
            channels_named: count("SELECT COUNT(*) FROM channels_named")?,
            channels_unnamed: count("SELECT COUNT(*) FROM channels_unnamed")?,
            playlists: count("SELECT COUNT(*) FROM playlists")?,
            items: count("SELECT COUNT(*) FROM items")?,
            skipped: count("SELECT COUNT(*) FROM items WHERE skip = 1")?,
            downloaded: count("SELECT COUNT(*) FROM items WHERE utime IS NOT NULL")?,
            preferred_names: count("SELECT COUNT(*) FROM pref_names")?,
            total_duration: count("SELECT COALESCE(SUM(duration), 0) FROM items")?,
        })
    }

    /// Distinct date buckets (`YYYY`, `MM`, or `DD`) of downloaded items for
    /// the VFS date views. `prefix` narrows to a year or year-month.
    fn date_buckets(&self, column: &str, fmt: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        assert!(column == "ptime" || column == "utime");
        let mut sql = format!(
            "SELECT DISTINCT strftime('{fmt}', {column}) AS bucket FROM items \
             WHERE utime IS NOT NULL AND {column} IS NOT NULL"
        );
        if prefix.is_some() {
            let plen = match fmt {
                "%m" => "%Y",
                _ => "%Y-%m",
            };
            sql.push_str(&format!(" AND strftime('{plen}', {column}) = ?1"));
        }
        sql.push_str(" ORDER BY bucket ASC");
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = match prefix {
            Some(p) => stmt.query(params![p])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(bucket) = row.get::<_, Option<String>>(0)? {
                out.push(bucket);
            }
        }
        Ok(out)
    }

    /// Downloaded items whose `column` date equals `date` (YYYY-MM-DD).
    fn items_on_date(&self, column: &str, date: &str) -> Result<Vec<Item>> {
        assert!(column == "ptime" || column == "utime");
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items \
             WHERE utime IS NOT NULL AND strftime('%Y-%m-%d', {column}) = ?1 \
             ORDER BY iid ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![date], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Downloaded items owned by `dname`, for the per-source VFS listings.
    fn downloaded_items_for_dname(&self, dname: &str) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {ITEM_COLS} FROM items \
             WHERE dname = ?1 AND utime IS NOT NULL ORDER BY iid ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![dname], row_to_item)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl CatalogRead for Catalog {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl CatalogRead for Txn<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl Txn<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    // -- sources ---------------------------------------------------------

    pub fn insert_source(&self, kind: SourceKind, key: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}, ctime) VALUES (?1, ?2)",
            kind.table(),
            kind.key_column()
        );
        self.tx.execute(&sql, params![key, ts(now())])?;
        Ok(())
    }

    /// Bumps a source's sync instant and records listing-level metadata.
    pub fn touch_source(
        &self,
        kind: SourceKind,
        rowid: i64,
        title: Option<&str>,
        uploader: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET atime = ?1, title = ?2, uploader = ?3 WHERE rowid = ?4",
            kind.table()
        );
        self.tx
            .execute(&sql, params![ts(now()), title, uploader, rowid])?;
        Ok(())
    }

    pub fn set_channel_alias(&self, rowid: i64, alias: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE channels_unnamed SET alias = ?1 WHERE rowid = ?2",
            params![alias, rowid],
        )?;
        Ok(())
    }

    pub fn set_playlist_skip(&self, iid: &str, skip: bool) -> Result<()> {
        self.tx.execute(
            "UPDATE playlists SET skip = ?1 WHERE iid = ?2",
            params![skip as i64, iid],
        )?;
        Ok(())
    }

    /// Re-keys every item and membership row after an alias change.
    pub fn rename_dname(&self, old: &str, new: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE items SET dname = ?1 WHERE dname = ?2",
            params![new, old],
        )?;
        self.tx.execute(
            "UPDATE members SET source_key = ?1 WHERE source_key = ?2",
            params![new, old],
        )?;
        Ok(())
    }

    // -- items -----------------------------------------------------------

    /// Creates a bare item row on first observation. `ctime` is None for
    /// ghost ids surfaced by a feed before release.
    pub fn insert_item_shell(
        &self,
        iid: &str,
        dname: &str,
        ctime: Option<DateTime<Utc>>,
        title: Option<&str>,
    ) -> Result<()> {
        let name = title.map(title_to_name);
        self.tx.execute(
            "INSERT INTO items (iid, dname, ctime, title, name, skip) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![iid, dname, ctime.map(ts), title, name],
        )?;
        Ok(())
    }

    /// Marks an existing row as re-listed: clears `atime` so the next item
    /// sync refreshes it, updating title/name when the listing carried one.
    pub fn mark_item_listed(&self, rowid: i64, title: Option<&str>) -> Result<()> {
        match title {
            Some(t) => {
                self.tx.execute(
                    "UPDATE items SET atime = NULL, title = ?1, name = ?2 WHERE rowid = ?3",
                    params![t, title_to_name(t), rowid],
                )?;
            }
            None => {
                self.tx.execute(
                    "UPDATE items SET atime = NULL WHERE rowid = ?1",
                    params![rowid],
                )?;
            }
        }
        Ok(())
    }

    /// Full enrichment write-back from per-item metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn update_item_synced(
        &self,
        rowid: i64,
        duration: Option<i64>,
        title: &str,
        name: &str,
        uploader: Option<&str>,
        thumbnails: &[String],
        ptime: Option<DateTime<Utc>>,
        ctime: DateTime<Utc>,
        atime: DateTime<Utc>,
        utime: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let thumbs = serde_json::to_string(thumbnails)?;
        self.tx.execute(
            "UPDATE items SET duration = ?1, title = ?2, name = ?3, uploader = ?4, \
             thumbnails = ?5, ptime = ?6, ctime = ?7, atime = ?8, \
             utime = COALESCE(?9, utime) WHERE rowid = ?10",
            params![
                duration,
                title,
                name,
                uploader,
                thumbs,
                ptime.map(ts),
                ts(ctime),
                ts(atime),
                utime.map(ts),
                rowid
            ],
        )?;
        Ok(())
    }

    pub fn touch_item_atime(&self, rowid: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE items SET atime = ?1 WHERE rowid = ?2",
            params![ts(now()), rowid],
        )?;
        Ok(())
    }

    pub fn mark_item_downloaded(&self, rowid: i64, at: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE items SET utime = ?1, atime = ?1 WHERE rowid = ?2",
            params![ts(at), rowid],
        )?;
        Ok(())
    }

    pub fn update_item_dname(&self, iid: &str, dname: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE items SET dname = ?1 WHERE iid = ?2",
            params![dname, iid],
        )?;
        Ok(())
    }

    pub fn set_item_video_format(&self, iid: &str, format: Option<&str>) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE items SET video_format = ?1 WHERE iid = ?2",
            params![format, iid],
        )?;
        if n == 0 {
            return Err(Error::NotFound(iid.to_owned()));
        }
        Ok(())
    }

    /// Marking an item skipped atomically removes any sleep entry.
    pub fn set_item_skip(&self, iid: &str, skip: bool) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE items SET skip = ?1 WHERE iid = ?2",
            params![skip as i64, iid],
        )?;
        if n == 0 {
            return Err(Error::NotFound(iid.to_owned()));
        }
        if skip {
            self.tx
                .execute("DELETE FROM sleep_queue WHERE iid = ?1", params![iid])?;
        }
        Ok(())
    }

    pub fn set_item_chapters(&self, iid: &str, chapters: &[Chapter]) -> Result<()> {
        let json = serde_json::to_string(chapters)?;
        self.tx.execute(
            "UPDATE items SET chapters = ?1 WHERE iid = ?2",
            params![json, iid],
        )?;
        Ok(())
    }

    // -- preferred names -------------------------------------------------

    pub fn set_pref_name(&self, iid: &str, name: &str) -> Result<()> {
        self.tx.execute(
            "INSERT INTO pref_names (iid, name) VALUES (?1, ?2) \
             ON CONFLICT(iid) DO UPDATE SET name = excluded.name",
            params![iid, name],
        )?;
        Ok(())
    }

    // -- membership ------------------------------------------------------

    pub fn insert_member(
        &self,
        source_key: &str,
        iid: &str,
        idx: i64,
        atime: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.tx.execute(
            "INSERT INTO members (source_key, iid, idx, atime) VALUES (?1, ?2, ?3, ?4)",
            params![source_key, iid, idx, atime.map(ts)],
        )?;
        Ok(())
    }

    pub fn update_member(&self, rowid: i64, idx: i64, atime: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE members SET idx = ?1, atime = ?2 WHERE rowid = ?3",
            params![idx, ts(atime), rowid],
        )?;
        Ok(())
    }

    /// Soft-deletes a membership row, preserving provenance.
    pub fn tombstone_member(&self, rowid: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE members SET idx = ?1 WHERE rowid = ?2",
            params![TOMBSTONE_IDX, rowid],
        )?;
        Ok(())
    }

    // -- feed cache ------------------------------------------------------

    pub fn feed_cache_put(&self, kind: SourceKind, key: &str, url: Option<&str>) -> Result<()> {
        self.tx.execute(
            "INSERT INTO feed_cache (kind, source_key, url, polled) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(kind, source_key) DO UPDATE SET url = excluded.url, polled = excluded.polled",
            params![kind.label(), key, url, ts(now())],
        )?;
        Ok(())
    }

    pub fn feed_cache_touch(&self, kind: SourceKind, key: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE feed_cache SET polled = ?1 WHERE kind = ?2 AND source_key = ?3",
            params![ts(now()), kind.label(), key],
        )?;
        Ok(())
    }

    // -- sleep queue -----------------------------------------------------

    pub fn sleep_put(&self, iid: &str, wake: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "INSERT INTO sleep_queue (iid, wake) VALUES (?1, ?2) \
             ON CONFLICT(iid) DO UPDATE SET wake = excluded.wake",
            params![iid, ts(wake)],
        )?;
        Ok(())
    }

    pub fn sleep_delete(&self, iid: &str) -> Result<()> {
        self.tx
            .execute("DELETE FROM sleep_queue WHERE iid = ?1", params![iid])?;
        Ok(())
    }

    /// Deletes every entry whose wake instant has passed.
    pub fn sleep_prune(&self, at: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .tx
            .execute("DELETE FROM sleep_queue WHERE wake <= ?1", params![ts(at)])?)
    }

    // -- hooks & copy destinations ---------------------------------------

    pub fn hook_add(&self, module: &str) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO hooks (module) VALUES (?1)",
            params![module],
        )?;
        Ok(())
    }

    pub fn hook_remove(&self, module: &str) -> Result<bool> {
        let n = self
            .tx
            .execute("DELETE FROM hooks WHERE module = ?1", params![module])?;
        Ok(n > 0)
    }

    pub fn copy_dest_add(&self, dest: &str) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO copy_dests (dest) VALUES (?1)",
            params![dest],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn open_temp() -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let cat = Catalog::open(&dir.path().join("catalog.db")).unwrap();
    (dir, cat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        drop(Catalog::open(&path).unwrap());
        drop(Catalog::open(&path).unwrap());
    }

    #[test]
    fn timestamps_round_trip_at_second_precision() {
        let n = now();
        assert_eq!(parse_ts(&ts(n)), Some(n));
    }

    #[test]
    fn item_shell_and_lookup() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("btZ-VFW4wpY", MISC_DNAME, None, None)
            .unwrap();
        tx.commit().unwrap();

        let item = cat.get_item("btZ-VFW4wpY").unwrap().unwrap();
        assert_eq!(item.dname.as_deref(), Some(MISC_DNAME));
        assert!(!item.skip);
        assert!(item.ctime.is_none() && item.atime.is_none() && item.utime.is_none());
    }

    #[test]
    fn insert_shell_computes_name_from_title() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), Some("Lec 1: Intro?"))
            .unwrap();
        tx.commit().unwrap();
        let item = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        assert_eq!(item.name.as_deref(), Some("Lec 1- Intro"));
    }

    #[test]
    fn txn_rolls_back_on_drop() {
        let (_d, mut cat) = open_temp();
        {
            let tx = cat.txn().unwrap();
            tx.insert_item_shell("xyz11111111", "D", None, None).unwrap();
            // dropped without commit
        }
        assert!(cat.get_item("xyz11111111").unwrap().is_none());
    }

    #[test]
    fn source_round_trip_and_effective_key() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::ChannelUnnamed, "UCabcdef").unwrap();
        tx.commit().unwrap();

        let src = cat
            .get_source(SourceKind::ChannelUnnamed, "UCabcdef")
            .unwrap()
            .unwrap();
        assert_eq!(src.effective_key(), "UCabcdef");

        let tx = cat.txn().unwrap();
        tx.set_channel_alias(src.rowid, "mitocw").unwrap();
        tx.commit().unwrap();

        // Lookup by alias works too.
        let src = cat
            .get_source(SourceKind::ChannelUnnamed, "mitocw")
            .unwrap()
            .unwrap();
        assert_eq!(src.effective_key(), "mitocw");
        assert_eq!(src.key, "UCabcdef");
    }

    #[test]
    fn sources_ignore_old_filters_synced() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, "MIT").unwrap();
        tx.insert_source(SourceKind::User, "NASA").unwrap();
        tx.commit().unwrap();

        let mit = cat.get_source(SourceKind::User, "MIT").unwrap().unwrap();
        let tx = cat.txn().unwrap();
        tx.touch_source(SourceKind::User, mit.rowid, Some("MIT"), None)
            .unwrap();
        tx.commit().unwrap();

        let fresh = cat.sources(SourceKind::User, &[], true).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].key, "NASA");
    }

    #[test]
    fn membership_tombstones_preserve_rows() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_member("MIT", "aaaaaaaaaaa", 1, Some(now())).unwrap();
        tx.commit().unwrap();

        let map = cat.membership_map("MIT").unwrap();
        let rowid = map["aaaaaaaaaaa"];
        let tx = cat.txn().unwrap();
        tx.tombstone_member(rowid).unwrap();
        tx.commit().unwrap();

        let members = cat.memberships("MIT").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].idx, TOMBSTONE_IDX);
    }

    #[test]
    fn skip_clears_sleep_entry() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("xyz11111111", "D", None, None).unwrap();
        tx.sleep_put("xyz11111111", now() + chrono::Duration::hours(1))
            .unwrap();
        tx.commit().unwrap();
        assert!(cat.sleep_get("xyz11111111").unwrap().is_some());

        let tx = cat.txn().unwrap();
        tx.set_item_skip("xyz11111111", true).unwrap();
        tx.commit().unwrap();
        assert!(cat.sleep_get("xyz11111111").unwrap().is_none());
        assert!(cat.get_item("xyz11111111").unwrap().unwrap().skip);
    }

    #[test]
    fn sleep_prune_removes_past_entries_only() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.sleep_put("aaaaaaaaaaa", now() - chrono::Duration::hours(1))
            .unwrap();
        tx.sleep_put("bbbbbbbbbbb", now() + chrono::Duration::hours(1))
            .unwrap();
        tx.commit().unwrap();

        let tx = cat.txn().unwrap();
        assert_eq!(tx.sleep_prune(now()).unwrap(), 1);
        tx.commit().unwrap();

        let left = cat.sleep_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].iid, "bbbbbbbbbbb");
    }

    #[test]
    fn feed_cache_negative_entry() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.feed_cache_put(SourceKind::User, "MIT", None).unwrap();
        tx.commit().unwrap();

        let entry = cat.feed_cache_get(SourceKind::User, "MIT").unwrap().unwrap();
        assert!(entry.url.is_none());
        assert!(entry.polled.is_some());
    }

    #[test]
    fn chapters_round_trip_as_pairs() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("ccccccccccc", "D", None, None).unwrap();
        tx.set_item_chapters(
            "ccccccccccc",
            &[("0:00".into(), "Start".into()), ("1:30".into(), "Middle".into())],
        )
        .unwrap();
        tx.commit().unwrap();

        let item = cat.get_item("ccccccccccc").unwrap().unwrap();
        let chapters = item.chapters.unwrap();
        assert_eq!(chapters[1], ("1:30".to_owned(), "Middle".to_owned()));
    }

    #[test]
    fn date_buckets_group_downloaded_items() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "D", Some(now()), Some("One")).unwrap();
        tx.insert_item_shell("bbbbbbbbbbb", "D", Some(now()), Some("Two")).unwrap();
        tx.commit().unwrap();

        let a = cat.get_item("aaaaaaaaaaa").unwrap().unwrap();
        let b = cat.get_item("bbbbbbbbbbb").unwrap().unwrap();
        let when = parse_ts("2024-06-01 12:00:00").unwrap();
        let tx = cat.txn().unwrap();
        tx.update_item_synced(
            a.rowid, Some(60), "One", "One", None, &[], Some(when), when, when, Some(when),
        )
        .unwrap();
        tx.update_item_synced(
            b.rowid, Some(60), "Two", "Two", None, &[], Some(when), when, when, None,
        )
        .unwrap();
        tx.commit().unwrap();

        // Only the downloaded item shows up in the buckets.
        assert_eq!(cat.date_buckets("ptime", "%Y", None).unwrap(), vec!["2024"]);
        assert_eq!(
            cat.date_buckets("ptime", "%m", Some("2024")).unwrap(),
            vec!["06"]
        );
        assert_eq!(
            cat.date_buckets("ptime", "%d", Some("2024-06")).unwrap(),
            vec!["01"]
        );
        let on = cat.items_on_date("ptime", "2024-06-01").unwrap();
        assert_eq!(on.len(), 1);
        assert_eq!(on[0].iid, "aaaaaaaaaaa");
    }

    #[test]
    fn stats_counts() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_source(SourceKind::User, "MIT").unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), None).unwrap();
        tx.set_item_skip("aaaaaaaaaaa", true).unwrap();
        tx.commit().unwrap();

        let stats = cat.stats().unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.items, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.downloaded, 0);
    }

    #[test]
    fn hooks_keep_registration_order() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.hook_add("notify-push").unwrap();
        tx.hook_add("mirror-sync").unwrap();
        tx.hook_add("notify-push").unwrap(); // duplicate ignored
        tx.commit().unwrap();
        assert_eq!(cat.hooks_list().unwrap(), vec!["notify-push", "mirror-sync"]);

        let tx = cat.txn().unwrap();
        assert!(tx.hook_remove("notify-push").unwrap());
        assert!(!tx.hook_remove("absent").unwrap());
        tx.commit().unwrap();
    }
}
