#![forbid(unsafe_code)]

//! Canonical name and path formatting.
//!
//! Titles arrive from the site with arbitrary Unicode; on-disk names are
//! plain ASCII so every shell, exporter, and media player copes. All
//! functions here are pure.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Placeholder basename used while an item's real title is still unknown.
pub const TEMP_NAME: &str = "TEMP";

/// Name an empty title collapses to.
pub const EMPTY_NAME: &str = "NOTHING";

/// Media container for archived items.
pub const VIDEO_SUFFIX: &str = "mkv";

/// Maps the common Latin-1 accented letters onto ASCII. Everything else
/// non-ASCII is dropped entirely.
fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
        'Æ' => "AE",
        'æ' => "ae",
        'Ç' => "C",
        'ç' => "c",
        'Ð' => "D",
        'ð' => "d",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'Ñ' => "N",
        'ñ' => "n",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'Ý' => "Y",
        'ý' | 'ÿ' => "y",
        'ß' => "ss",
        _ => return None,
    })
}

/// Translates a title into a filesystem-safe name.
///
/// Accented Latin-1 letters become their ASCII counterparts, any other
/// non-ASCII codepoint is dropped, `: / \` turn into `-`, `! ? |` vanish,
/// space runs collapse, and surrounding whitespace plus leading dots are
/// stripped. An empty result maps to [`EMPTY_NAME`].
pub fn title_to_name(t: &str) -> String {
    let mut out = String::with_capacity(t.len());

    for c in t.chars() {
        if !c.is_ascii() {
            if let Some(tr) = transliterate(c) {
                out.push_str(tr);
            }
            continue;
        }
        match c {
            ':' | '/' | '\\' => out.push('-'),
            '!' | '?' | '|' => {}
            ' ' if out.ends_with(' ') => {}
            _ => out.push(c),
        }
    }

    // Leading dots would hide the file from glob-style listings; stripping
    // them can expose leading spaces, so both are peeled together.
    let out = out
        .trim_start_matches(|c: char| c == '.' || c == ' ')
        .trim_end();

    if out.is_empty() {
        EMPTY_NAME.to_owned()
    } else {
        out.to_owned()
    }
}

/// Validates a channel alias: ASCII alphanumeric only.
pub fn alias_coerce(a: &str) -> Result<String> {
    if !a.is_empty() && a.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(a.to_owned())
    } else {
        Err(Error::InvalidAlias(a.to_owned()))
    }
}

/// Single-character shard of an item id. The site's id alphabet has 64
/// symbols, so this bounds per-source directory fan-out at 64 entries.
pub fn shard_char(iid: &str) -> char {
    iid.chars().next().unwrap_or('_')
}

/// Assembles the `(directory, file)` pair for an item.
///
/// The directory is `<root>/<dname>/<shard>` and the file is
/// `<effective>-<iid>[.suffix]` where the effective name is the preferred
/// name when set, else the computed name, else [`TEMP_NAME`].
pub fn format_v_names(
    root: &Path,
    dname: &str,
    name: Option<&str>,
    alias: Option<&str>,
    iid: &str,
    suffix: Option<&str>,
) -> (PathBuf, String) {
    let effective = alias.or(name).unwrap_or(TEMP_NAME);

    let dir = root.join(dname).join(shard_char(iid).to_string());
    let file = match suffix {
        Some(sfx) => format!("{effective}-{iid}.{sfx}"),
        None => format!("{effective}-{iid}"),
    };

    (dir, file)
}

/// Full path variant of [`format_v_names`].
pub fn format_v_fname(
    root: &Path,
    dname: &str,
    name: Option<&str>,
    alias: Option<&str>,
    iid: &str,
    suffix: Option<&str>,
) -> PathBuf {
    let (dir, file) = format_v_names(root, dname, name, alias, iid, suffix);
    dir.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_to_name_rewrites_banned_characters() {
        assert_eq!(title_to_name("a:b/c\\d"), "a-b-c-d");
        assert_eq!(title_to_name("what?! no | really"), "what no really");
        assert_eq!(title_to_name("spaced    out"), "spaced out");
        assert_eq!(title_to_name("  trimmed  "), "trimmed");
    }

    #[test]
    fn title_to_name_strips_leading_dots() {
        assert_eq!(title_to_name("...hidden"), "hidden");
        assert_eq!(title_to_name(". . leading"), "leading");
    }

    #[test]
    fn title_to_name_transliterates_latin1() {
        assert_eq!(title_to_name("Café Révolution"), "Cafe Revolution");
        assert_eq!(title_to_name("Straße"), "Strasse");
        assert_eq!(title_to_name("Ångström"), "Angstrom");
    }

    #[test]
    fn title_to_name_drops_other_unicode() {
        assert_eq!(title_to_name("日本語"), EMPTY_NAME);
        assert_eq!(title_to_name("mixed 語 title"), "mixed title");
    }

    #[test]
    fn title_to_name_empty_maps_to_sentinel() {
        assert_eq!(title_to_name(""), EMPTY_NAME);
        assert_eq!(title_to_name("?!|"), EMPTY_NAME);
    }

    #[test]
    fn title_to_name_is_idempotent() {
        for s in [
            "ordinary title",
            "...dots and  spaces  ",
            "a:b?c!d",
            "Café ?! . weird",
            ". . leading",
            "",
        ] {
            let once = title_to_name(s);
            assert_eq!(title_to_name(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn title_to_name_output_is_ascii() {
        for s in ["émoji 🎬 reel", "Ωmega", "Ñandú!"] {
            let out = title_to_name(s);
            assert!(out.is_ascii());
            assert!(!out.contains(['!', '?', '|']));
        }
    }

    #[test]
    fn alias_coerce_accepts_alphanumeric_only() {
        assert_eq!(alias_coerce("MIT2024").unwrap(), "MIT2024");
        assert!(matches!(alias_coerce("bad name"), Err(Error::InvalidAlias(_))));
        assert!(matches!(alias_coerce("ünicode"), Err(Error::InvalidAlias(_))));
        assert!(matches!(alias_coerce(""), Err(Error::InvalidAlias(_))));
    }

    #[test]
    fn format_v_names_shards_by_first_id_char() {
        let (dir, file) = format_v_names(
            Path::new("/arc"),
            "MIT",
            Some("Lecture 1"),
            None,
            "btZ-VFW4wpY",
            Some("mkv"),
        );
        assert_eq!(dir, Path::new("/arc/MIT/b"));
        assert_eq!(file, "Lecture 1-btZ-VFW4wpY.mkv");
    }

    #[test]
    fn format_v_names_prefers_alias_then_name_then_temp() {
        let root = Path::new("/arc");
        let (_, f) = format_v_names(root, "d", Some("n"), Some("a"), "xyz11111111", None);
        assert_eq!(f, "a-xyz11111111");
        let (_, f) = format_v_names(root, "d", Some("n"), None, "xyz11111111", None);
        assert_eq!(f, "n-xyz11111111");
        let (_, f) = format_v_names(root, "d", None, None, "xyz11111111", Some("mkv"));
        assert_eq!(f, "TEMP-xyz11111111.mkv");
    }

    #[test]
    fn format_v_fname_round_trips_layout() {
        let p = format_v_fname(
            Path::new("/arc"),
            "D",
            Some("N"),
            None,
            "Iabcdefghij",
            Some("S"),
        );
        assert!(p.ends_with("D/I/N-Iabcdefghij.S"));
    }
}
