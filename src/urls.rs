#![forbid(unsafe_code)]

//! Registration URL parsing.
//!
//! Only `https` URLs on the site's own hosts are accepted; everything else
//! is rejected before any catalog state changes.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use url::Url;

use crate::catalog::SourceKind;
use crate::error::{Error, Result};

const ALLOWED_HOSTS: [&str; 3] = ["www.youtube.com", "youtube.com", "youtu.be"];

/// Characters escaped when a source key is spliced into a URL path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Public page for a source, used to discover its feed. Playlists have no
/// page with a feed link.
pub fn source_page_url(kind: SourceKind, key: &str) -> Option<String> {
    let seg = utf8_percent_encode(key, PATH_SEGMENT);
    match kind {
        SourceKind::User => Some(format!("https://www.youtube.com/user/{seg}")),
        SourceKind::ChannelNamed => Some(format!("https://www.youtube.com/c/{seg}")),
        SourceKind::ChannelUnnamed => Some(format!("https://www.youtube.com/channel/{seg}")),
        SourceKind::Playlist => None,
    }
}

/// Canonical URL handed to the extractor for full enumeration.
pub fn source_list_url(kind: SourceKind, key: &str) -> String {
    match source_page_url(kind, key) {
        Some(url) => url,
        None => format!(
            "https://www.youtube.com/playlist?list={}",
            utf8_percent_encode(key, PATH_SEGMENT)
        ),
    }
}

/// What a registration URL resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A single item from a watch URL.
    Item(String),
    /// A source of the given variant with its key.
    Source(SourceKind, String),
}

/// Parses one registration URL into an item or source reference.
pub fn parse_registration(raw: &str) -> Result<Registration> {
    let url = Url::parse(raw).map_err(|_| Error::BadUrl(raw.to_owned()))?;

    if url.scheme() != "https" {
        return Err(Error::BadUrl(format!("{raw}: only https is recognized")));
    }
    let host = url.host_str().unwrap_or_default();
    if !ALLOWED_HOSTS.contains(&host) {
        return Err(Error::BadUrl(format!("{raw}: host not recognized")));
    }

    // A trailing /videos tab segment refers to the same source.
    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/videos").unwrap_or(path);

    let query_value = |key: &str| -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    };

    match path {
        "/watch" => query_value("v")
            .map(Registration::Item)
            .ok_or_else(|| Error::BadUrl(format!("{raw}: watch URL without v= query"))),
        "/playlist" => query_value("list")
            .map(|id| Registration::Source(SourceKind::Playlist, id))
            .ok_or_else(|| Error::BadUrl(format!("{raw}: playlist URL without list= query"))),
        _ => {
            let mut segments = path.trim_start_matches('/').split('/');
            let kind = match segments.next() {
                Some("user") => SourceKind::User,
                Some("c") => SourceKind::ChannelNamed,
                Some("channel") => SourceKind::ChannelUnnamed,
                _ => return Err(Error::BadUrl(raw.to_owned())),
            };
            match (segments.next(), segments.next()) {
                (Some(name), None) if !name.is_empty() => {
                    Ok(Registration::Source(kind, name.to_owned()))
                }
                _ => Err(Error::BadUrl(format!("{raw}: expected a single name segment"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_watch_url_as_item() {
        let reg = parse_registration("https://www.youtube.com/watch?v=btZ-VFW4wpY").unwrap();
        assert_eq!(reg, Registration::Item("btZ-VFW4wpY".into()));
    }

    #[test]
    fn parses_each_source_shape() {
        assert_eq!(
            parse_registration("https://www.youtube.com/user/MIT").unwrap(),
            Registration::Source(SourceKind::User, "MIT".into())
        );
        assert_eq!(
            parse_registration("https://www.youtube.com/c/mitocw/").unwrap(),
            Registration::Source(SourceKind::ChannelNamed, "mitocw".into())
        );
        assert_eq!(
            parse_registration("https://www.youtube.com/channel/UCabcdef").unwrap(),
            Registration::Source(SourceKind::ChannelUnnamed, "UCabcdef".into())
        );
        assert_eq!(
            parse_registration("https://www.youtube.com/playlist?list=PL123").unwrap(),
            Registration::Source(SourceKind::Playlist, "PL123".into())
        );
    }

    #[test]
    fn strips_trailing_videos_segment() {
        assert_eq!(
            parse_registration("https://www.youtube.com/user/MIT/videos").unwrap(),
            Registration::Source(SourceKind::User, "MIT".into())
        );
    }

    #[test]
    fn rejects_http_and_unknown_hosts() {
        assert!(parse_registration("http://www.youtube.com/user/MIT").is_err());
        assert!(parse_registration("https://example.com/user/MIT").is_err());
    }

    #[test]
    fn page_urls_escape_keys() {
        assert_eq!(
            source_page_url(SourceKind::User, "MIT").as_deref(),
            Some("https://www.youtube.com/user/MIT")
        );
        assert_eq!(
            source_page_url(SourceKind::ChannelNamed, "a b").as_deref(),
            Some("https://www.youtube.com/c/a%20b")
        );
        assert!(source_page_url(SourceKind::Playlist, "PL1").is_none());
        assert_eq!(
            source_list_url(SourceKind::Playlist, "PL1"),
            "https://www.youtube.com/playlist?list=PL1"
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_registration("https://www.youtube.com/watch").is_err());
        assert!(parse_registration("https://www.youtube.com/user/").is_err());
        assert!(parse_registration("https://www.youtube.com/user/a/b").is_err());
        assert!(parse_registration("https://www.youtube.com/about").is_err());
    }
}
