#![forbid(unsafe_code)]

//! Optional `KEY=VALUE` configuration file.
//!
//! Everything here can also be given on the command line; the file only
//! supplies defaults for the flags an operator never wants to repeat.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Default config location, resolved against `$HOME`.
pub const CONFIG_FILE_NAME: &str = ".tubevaultrc";

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Root of the on-disk archive. Defaults to the catalog file's directory.
    pub archive_root: Option<PathBuf>,
    /// Download rate ceiling in bytes/sec.
    pub rate_limit: Option<u64>,
    /// Cookies file handed to the downloader.
    pub cookies: Option<PathBuf>,
    /// Comma-separated subtitle/caption languages; empty string means all.
    pub sub_langs: Option<String>,
    /// External downloader name passed through to the extractor.
    pub downloader: Option<String>,
    /// Seconds to pause between sources during a list sync.
    pub delay: Option<u64>,
}

/// Splits one config line into `(key, value)`. Blank lines, comments, and
/// anything without an `=` are dropped.
fn split_assignment(raw: &str) -> Option<(&str, &str)> {
    let line = raw.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim_end(), value.trim().trim_matches('"')))
}

impl FileConfig {
    /// Applies one assignment. Returns false for keys this tool does not
    /// know, so the caller can log them.
    fn assign(&mut self, key: &str, value: &str, lineno: usize) -> Result<bool> {
        let number = || -> Result<u64> {
            value
                .parse()
                .with_context(|| format!("{key} on line {} is not a number", lineno + 1))
        };
        match key {
            "ARCHIVE_ROOT" => self.archive_root = Some(value.into()),
            "COOKIES" => self.cookies = Some(value.into()),
            "SUB_LANGS" => self.sub_langs = Some(value.to_owned()),
            "DOWNLOADER" => {
                if !value.is_empty() {
                    self.downloader = Some(value.to_owned());
                }
            }
            "RATE_LIMIT" => self.rate_limit = Some(number()?),
            "DELAY" => self.delay = Some(number()?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Reads the config file if present. A missing file is not an error.
pub fn read_config(path: &Path) -> Result<Option<FileConfig>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };

    let mut cfg = FileConfig::default();
    for (lineno, raw) in content.lines().enumerate() {
        let Some((key, value)) = split_assignment(raw) else {
            continue;
        };
        if !cfg
            .assign(key, value, lineno)
            .with_context(|| format!("in {}", path.display()))?
        {
            tracing::debug!(key, lineno = lineno + 1, "ignoring unknown config key");
        }
    }
    Ok(Some(cfg))
}

/// Default path: `$HOME/.tubevaultrc`, or nothing when `$HOME` is unset.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_rc(dir: &TempDir, lines: &[&str]) -> PathBuf {
        let path = dir.path().join("rc");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn split_assignment_classifies_lines() {
        assert_eq!(split_assignment("KEY=value"), Some(("KEY", "value")));
        assert_eq!(split_assignment("  KEY = \"v\" "), Some(("KEY", "v")));
        assert_eq!(split_assignment("# comment"), None);
        assert_eq!(split_assignment("   "), None);
        assert_eq!(split_assignment("no equals here"), None);
    }

    #[test]
    fn read_config_fills_known_keys() {
        let dir = TempDir::new().unwrap();
        let rc = write_rc(
            &dir,
            &[
                "# archive defaults",
                "ARCHIVE_ROOT=\"/arc\"",
                "RATE_LIMIT=900000",
                "SUB_LANGS=en,de",
                "DOWNLOADER=",
                "SOMETHING_ELSE=ignored",
            ],
        );
        let cfg = read_config(&rc).unwrap().unwrap();
        assert_eq!(cfg.archive_root, Some(PathBuf::from("/arc")));
        assert_eq!(cfg.rate_limit, Some(900000));
        assert_eq!(cfg.sub_langs.as_deref(), Some("en,de"));
        // Empty downloader means "use the built-in".
        assert!(cfg.downloader.is_none());
        assert!(cfg.delay.is_none());
    }

    #[test]
    fn read_config_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let absent = dir.path().join("no-such-rc");
        assert!(read_config(&absent).unwrap().is_none());
    }

    #[test]
    fn read_config_rejects_non_numeric_rate() {
        let dir = TempDir::new().unwrap();
        let rc = write_rc(&dir, &["RATE_LIMIT=fast"]);
        let err = read_config(&rc).unwrap_err();
        assert!(format!("{err:#}").contains("RATE_LIMIT on line 1"));
    }

    #[test]
    fn read_config_rejects_non_numeric_delay() {
        let dir = TempDir::new().unwrap();
        let rc = write_rc(&dir, &["DELAY=soon"]);
        assert!(read_config(&rc).is_err());
    }
}
