#![forbid(unsafe_code)]

//! Subprocess wrapper around the external metadata extractor / downloader.
//!
//! Everything the site tells us arrives through this module: flat listings
//! as line-delimited JSON, per-item metadata as a single JSON document, and
//! the media download itself. The extractor's chatter stays suppressed; its
//! stderr is kept for failure classification.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Program looked up on PATH when no override is configured.
pub const DEFAULT_PROGRAM: &str = "yt-dlp";

pub fn watch_url(iid: &str) -> String {
    format!("https://www.youtube.com/watch?v={iid}")
}

/// Handle on the external extractor binary. The program path is injectable
/// so tests can point it at a stub script.
#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of a flat listing.
#[derive(Debug, Clone)]
pub struct ListedItem {
    pub iid: String,
    pub title: Option<String>,
    pub idx: i64,
}

/// Result of a flat-listing run: ordered items plus source-level metadata
/// when the extractor reported it.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub entries: Vec<ListedItem>,
}

#[derive(Deserialize)]
struct FlatEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    playlist_index: Option<i64>,
    #[serde(default)]
    playlist_title: Option<String>,
    #[serde(default)]
    playlist_uploader: Option<String>,
    #[serde(default)]
    playlist_channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailInfo {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub filesize: Option<i64>,
    #[serde(default)]
    pub filesize_approx: Option<i64>,
}

impl FormatInfo {
    pub fn size(&self) -> Option<i64> {
        self.filesize.or(self.filesize_approx)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtitleInfo {
    pub url: Option<String>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChapterInfo {
    pub start_time: Option<f64>,
    pub title: Option<String>,
}

/// Subset of the extractor's per-item JSON that the catalog cares about.
/// Everything is optional because very old uploads lack metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailInfo>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
    #[serde(default)]
    pub subtitles: HashMap<String, Vec<SubtitleInfo>>,
    #[serde(default)]
    pub automatic_captions: HashMap<String, Vec<SubtitleInfo>>,
    #[serde(default)]
    pub chapters: Option<Vec<ChapterInfo>>,
}

impl ItemInfo {
    /// Reads a previously written `.info.json` file.
    pub fn load(path: &Path) -> Result<ItemInfo> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.duration.map(|d| d.round() as i64)
    }

    pub fn thumbnail_urls(&self) -> Vec<String> {
        self.thumbnails.iter().filter_map(|t| t.url.clone()).collect()
    }

    /// Publish instant from the extractor's `YYYYMMDD` date.
    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.upload_date.as_deref()?;
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }

    /// Largest advertised format size, for the size gate.
    pub fn largest_format_size(&self) -> Option<i64> {
        self.formats.iter().filter_map(|f| f.size()).max()
    }
}

/// Per-item download invocation parameters.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub iid: String,
    pub dir: PathBuf,
    /// Output basename without suffix; `%` is escaped before templating.
    pub basename: String,
    pub rate_limit: Option<u64>,
    pub format: Option<String>,
    pub downloader: Option<String>,
    pub cookies: Option<PathBuf>,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
        }
    }

    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }

    /// Fails loudly when the extractor is missing from PATH.
    pub fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(Error::Tool {
                tool: "extractor",
                detail: format!("{} returned a failure status", self.program.display()),
            }),
            Err(err) => Err(Error::Tool {
                tool: "extractor",
                detail: format!("{} not found on PATH: {err}", self.program.display()),
            }),
        }
    }

    /// Flat listing of a source URL: ordered `(iid, title?)` pairs plus
    /// listing-level title/uploader. Success with zero entries maps to
    /// [`Error::ExtractorEmpty`] so the caller can retry.
    pub fn flat_list(&self, url: &str) -> Result<Listing> {
        let output = Command::new(&self.program)
            .args(["--flat-playlist", "-j", "--no-warnings", "--no-progress", "--ignore-errors"])
            .arg(url)
            .output()?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        check_exit("flat listing", &output.status, &stderr)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut listing = Listing::default();
        for (pos, line) in stdout.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: FlatEntry = serde_json::from_str(line)?;
            if listing.title.is_none() {
                listing.title = entry.playlist_title.clone();
            }
            if listing.uploader.is_none() {
                listing.uploader = entry.playlist_uploader.clone().or(entry.playlist_channel.clone());
            }
            listing.entries.push(ListedItem {
                iid: entry.id,
                title: entry.title,
                idx: entry.playlist_index.unwrap_or(pos as i64 + 1),
            });
        }

        if listing.entries.is_empty() {
            return Err(Error::ExtractorEmpty);
        }
        Ok(listing)
    }

    /// Fetches per-item metadata without downloading media.
    pub fn item_info(&self, iid: &str) -> Result<ItemInfo> {
        let output = Command::new(&self.program)
            .args(["-j", "--no-warnings", "--no-progress"])
            .arg(watch_url(iid))
            .output()?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        check_exit("metadata fetch", &output.status, &stderr)?;

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Downloads an item's media plus its info.json, description, and
    /// thumbnails into the target directory.
    pub fn download(&self, req: &DownloadRequest) -> Result<()> {
        let template = format!(
            "{}/{}.%(ext)s",
            req.dir.display(),
            escape_template(&req.basename)
        );

        let mut command = Command::new(&self.program);
        command
            .args([
                "--merge-output-format",
                crate::naming::VIDEO_SUFFIX,
                "--write-info-json",
                "--write-description",
                "--write-all-thumbnails",
                "--no-progress",
                "--no-warnings",
                "-o",
            ])
            .arg(&template);

        if let Some(rate) = req.rate_limit {
            command.arg("--limit-rate").arg(rate.to_string());
        }
        if let Some(format) = &req.format {
            command.arg("--format").arg(format);
        }
        if let Some(downloader) = &req.downloader {
            command.arg("--downloader").arg(downloader);
        }
        if let Some(cookies) = &req.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command.arg(watch_url(&req.iid));

        let output = command.output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        check_exit("download", &output.status, &stderr)?;
        Ok(())
    }
}

/// `%` is the extractor's template escape, so literal percents in names
/// double up.
pub fn escape_template(name: &str) -> String {
    name.replace('%', "%%")
}

fn check_exit(what: &str, status: &std::process::ExitStatus, stderr: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGINT) {
            return Err(Error::Interrupted);
        }
    }
    if status.success() {
        return Ok(());
    }
    Err(classify_failure(what, stderr))
}

/// Maps extractor stderr onto the error taxonomy. Ordering matters: the
/// network layer is checked first so retry logic sees resets before any
/// per-item classification.
pub fn classify_failure(what: &str, stderr: &str) -> Error {
    const TRANSIENT: [&str; 3] = [
        "Connection reset",
        "Temporary failure in name resolution",
        "getaddrinfo failed",
    ];
    const UNAVAILABLE: [&str; 4] = [
        "Video unavailable",
        "members-only",
        "confirm your age",
        "Private video",
    ];
    const UPCOMING: [&str; 4] = [
        "live video",
        "Premieres in",
        "will begin in",
        "begin in a few moments",
    ];

    if TRANSIENT.iter().any(|m| stderr.contains(m)) {
        return Error::NetworkTransient(first_error_line(stderr));
    }
    if stderr.contains("requires payment") {
        return Error::PaymentRequired(first_error_line(stderr));
    }
    if UNAVAILABLE.iter().any(|m| stderr.contains(m)) {
        return Error::Unavailable(first_error_line(stderr));
    }
    if UPCOMING.iter().any(|m| stderr.contains(m)) {
        return Error::LiveOrUpcoming(parse_upcoming_delay(stderr));
    }
    Error::Tool {
        tool: "extractor",
        detail: format!("{what}: {}", first_error_line(stderr)),
    }
}

fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .find(|l| l.contains("ERROR"))
        .or_else(|| stderr.lines().find(|l| !l.trim().is_empty()))
        .unwrap_or("unknown failure")
        .trim()
        .to_owned()
}

/// Parses the lead time out of "Premieres in 10 minutes" style messages.
/// "a few moments" counts as one hour; `None` means the message matched a
/// live/upcoming pattern but stated no usable delay.
pub fn parse_upcoming_delay(msg: &str) -> Option<Duration> {
    if msg.contains("a few moments") {
        return Some(Duration::from_secs(3600));
    }

    let tokens: Vec<&str> = msg.split_whitespace().collect();
    for window in tokens.windows(3) {
        if window[0] != "in" {
            continue;
        }
        let Ok(n) = window[1].parse::<u64>() else {
            continue;
        };
        let unit = window[2].trim_matches(|c: char| !c.is_ascii_alphabetic());
        let secs = match unit {
            "day" | "days" => n * 86400,
            "hour" | "hours" => n * 3600,
            "minute" | "minutes" => n * 60,
            "second" | "seconds" => n,
            _ => continue,
        };
        return Some(Duration::from_secs(secs));
    }
    None
}

#[cfg(test)]
pub(crate) mod stub {
    //! Installs a shell script standing in for the extractor, mirroring how
    //! the real binary behaves for each invocation shape.

    use std::fs;
    use std::path::{Path, PathBuf};

    pub fn install(dir: &Path, script_body: &str) -> PathBuf {
        let path = dir.join("extractor-stub");
        let script = format!("#!/usr/bin/env bash\nset -u\n{script_body}\n");
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flat_list_parses_ndjson_and_order() {
        let dir = tempdir().unwrap();
        let stub = stub::install(
            dir.path(),
            r#"
if printf '%s\n' "$@" | grep -q -- '--flat-playlist'; then
  echo '{"id":"aaaaaaaaaaa","title":"First","playlist_index":1,"playlist_title":"MIT List","playlist_uploader":"MIT"}'
  echo '{"id":"bbbbbbbbbbb","title":"Second","playlist_index":2}'
  exit 0
fi
exit 1
"#,
        );
        let ex = Extractor::with_program(stub);
        let listing = ex.flat_list("https://www.youtube.com/user/MIT").unwrap();
        assert_eq!(listing.title.as_deref(), Some("MIT List"));
        assert_eq!(listing.uploader.as_deref(), Some("MIT"));
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].iid, "aaaaaaaaaaa");
        assert_eq!(listing.entries[1].idx, 2);
    }

    #[test]
    fn flat_list_empty_success_is_extractor_empty() {
        let dir = tempdir().unwrap();
        let stub = stub::install(dir.path(), "exit 0");
        let ex = Extractor::with_program(stub);
        assert!(matches!(
            ex.flat_list("https://www.youtube.com/user/MIT"),
            Err(Error::ExtractorEmpty)
        ));
    }

    #[test]
    fn item_info_parses_fields() {
        let dir = tempdir().unwrap();
        let stub = stub::install(
            dir.path(),
            r#"
cat <<'JSON'
{"id":"aaaaaaaaaaa","title":"Alpha","duration":120.0,"uploader":"MIT",
 "upload_date":"20240102","channel_id":"UCabc",
 "thumbnails":[{"url":"https://img/1.jpg"}],
 "formats":[{"format_id":"137","filesize":1000},{"format_id":"140","filesize_approx":2000}]}
JSON
"#,
        );
        let ex = Extractor::with_program(stub);
        let info = ex.item_info("aaaaaaaaaaa").unwrap();
        assert_eq!(info.duration_secs(), Some(120));
        assert_eq!(info.thumbnail_urls(), vec!["https://img/1.jpg"]);
        assert_eq!(info.largest_format_size(), Some(2000));
        assert_eq!(
            info.publish_time().unwrap().format("%Y-%m-%d").to_string(),
            "2024-01-02"
        );
    }

    #[test]
    fn download_failure_is_classified() {
        let dir = tempdir().unwrap();
        let stub = stub::install(
            dir.path(),
            r#"echo 'ERROR: [youtube] x: Video unavailable' >&2; exit 1"#,
        );
        let ex = Extractor::with_program(stub);
        let req = DownloadRequest {
            iid: "aaaaaaaaaaa".into(),
            dir: dir.path().to_path_buf(),
            basename: "TEMP-aaaaaaaaaaa".into(),
            ..Default::default()
        };
        assert!(matches!(ex.download(&req), Err(Error::Unavailable(_))));
    }

    #[test]
    fn classify_failure_covers_taxonomy() {
        assert!(matches!(
            classify_failure("x", "read: Connection reset by peer"),
            Error::NetworkTransient(_)
        ));
        assert!(matches!(
            classify_failure("x", "ERROR: This video requires payment to watch"),
            Error::PaymentRequired(_)
        ));
        assert!(matches!(
            classify_failure("x", "ERROR: Join this channel to get access to members-only content"),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("x", "ERROR: Private video"),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("x", "ERROR: something else entirely"),
            Error::Tool { .. }
        ));
    }

    #[test]
    fn classify_live_parses_delay() {
        match classify_failure("x", "ERROR: Premieres in 10 minutes") {
            Error::LiveOrUpcoming(Some(d)) => assert_eq!(d, Duration::from_secs(600)),
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure("x", "ERROR: This live event will begin in 2 hours") {
            Error::LiveOrUpcoming(Some(d)) => assert_eq!(d, Duration::from_secs(7200)),
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure("x", "ERROR: will begin in a few moments") {
            Error::LiveOrUpcoming(Some(d)) => assert_eq!(d, Duration::from_secs(3600)),
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure("x", "ERROR: this is a live video") {
            Error::LiveOrUpcoming(None) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_upcoming_handles_punctuation() {
        assert_eq!(
            parse_upcoming_delay("Premieres in 3 days."),
            Some(Duration::from_secs(3 * 86400))
        );
        assert_eq!(parse_upcoming_delay("starting soon"), None);
    }

    #[test]
    fn escape_template_doubles_percents() {
        assert_eq!(escape_template("100% real"), "100%% real");
        assert_eq!(escape_template("plain"), "plain");
    }
}
