#![forbid(unsafe_code)]

//! Lightweight feed probe.
//!
//! Before paying for a full enumeration, each non-playlist source is checked
//! against its public feed: if every feed entry is already a member, the
//! source is fresh and the expensive listing run is skipped. Feed URLs are
//! discovered once from the source's public page and cached in the catalog.

use quick_xml::NsReader;
use quick_xml::Reader;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};

use crate::catalog::{Catalog, CatalogRead, SourceKind};
use crate::error::{Error, Result};
use crate::urls::source_page_url;
use crate::util::{NETWORK_RETRY_ATTEMPTS, retry_backoff};

/// MIME type a page's link element advertises for its feed.
const FEED_MIME: &str = "application/rss+xml";

/// Namespace the site's feeds use for item identifiers.
const ITEM_NS: &[u8] = b"http://www.youtube.com/xml/schemas/2015";

/// Outcome of probing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedVerdict {
    /// Every feed entry is already a member; nothing to do.
    Fresh,
    /// The feed exposes ids the catalog has not seen; carries the feed's
    /// full id list for the reconciliation ghost check.
    IndicatesNew(Vec<String>),
    /// No feed available (playlist variant, missing link, HTTP failure).
    NoFeed,
}

/// Parsed feed contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feed {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub iids: Vec<String>,
}

/// Minimal HTTP surface so tests can swap the network out.
/// `Ok(None)` means a definitive non-200 answer.
pub trait Http {
    fn get(&self, url: &str) -> Result<Option<String>>;
}

/// Production fetcher over ureq.
pub struct UreqHttp {
    agent: ureq::Agent,
}

impl Default for UreqHttp {
    fn default() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(30))
                .build(),
        }
    }
}

impl Http for UreqHttp {
    fn get(&self, url: &str) -> Result<Option<String>> {
        match self.agent.get(url).call() {
            Ok(resp) => Ok(Some(resp.into_string().map_err(Error::Io)?)),
            Err(ureq::Error::Status(_, _)) => Ok(None),
            Err(ureq::Error::Transport(t)) => {
                Err(Error::NetworkTransient(t.to_string()))
            }
        }
    }
}

/// Scans an HTML page for the link element advertising the feed. Parsing
/// stops at the first match; a malformed tail is irrelevant by then.
pub fn find_feed_url(html: &str) -> Option<String> {
    let mut reader = Reader::from_str(html);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() != b"link" {
                    continue;
                }
                let is_feed = e
                    .try_get_attribute("type")
                    .ok()
                    .flatten()
                    .is_some_and(|a| a.value.as_ref() == FEED_MIME.as_bytes());
                if !is_feed {
                    continue;
                }
                if let Ok(Some(href)) = e.try_get_attribute("href") {
                    return Some(String::from_utf8_lossy(&href.value).into_owned());
                }
            }
            Ok(Event::Eof) => return None,
            // Real pages are not well-formed XML; give up quietly when the
            // scanner chokes before finding the link.
            Err(_) => return None,
            _ => {}
        }
    }
}

/// Parses the site's Atom feed: channel title, uploader, and the ordered
/// item identifiers.
pub fn parse_feed(xml: &str) -> Result<Feed> {
    let mut reader = NsReader::from_str(xml);
    let mut feed = Feed::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    // Whether each open element resolved into the item-id namespace; the
    // namespace is only visible on the Start event, not on its text.
    let mut item_ns: Vec<bool> = Vec::new();

    loop {
        let (ns, event) = reader.read_resolved_event().map_err(|e| Error::Tool {
            tool: "feed",
            detail: format!("feed XML parse failure: {e}"),
        })?;
        match event {
            Event::Start(e) => {
                let bound = matches!(&ns, ResolveResult::Bound(Namespace(n)) if *n == ITEM_NS);
                path.push(e.local_name().as_ref().to_vec());
                item_ns.push(bound);
            }
            Event::End(_) => {
                path.pop();
                item_ns.pop();
            }
            Event::Text(t) => {
                let names: Vec<&[u8]> = path.iter().map(|p| p.as_slice()).collect();
                let text = || {
                    t.unescape()
                        .map(|s| s.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned())
                };
                match names.as_slice() {
                    [b"feed", b"title"] => feed.title = Some(text()),
                    [b"feed", b"author", b"name"] => feed.uploader = Some(text()),
                    [b"feed", b"entry", b"videoId"]
                        if item_ns.last().copied().unwrap_or(false) =>
                    {
                        feed.iids.push(text());
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(feed)
}

/// Probes one source. `effective_key` is the membership key (alias for
/// unnamed channels when set).
pub fn probe(
    catalog: &mut Catalog,
    http: &dyn Http,
    kind: SourceKind,
    key: &str,
    effective_key: &str,
) -> Result<FeedVerdict> {
    if kind == SourceKind::Playlist {
        return Ok(FeedVerdict::NoFeed);
    }

    let cached = catalog.feed_cache_get(kind, key)?;
    let url = match cached {
        Some(entry) => {
            let tx = catalog.txn()?;
            tx.feed_cache_touch(kind, key)?;
            tx.commit()?;
            match entry.url {
                Some(url) => url,
                // Negative cache: the page advertised no feed.
                None => return Ok(FeedVerdict::NoFeed),
            }
        }
        None => match discover_feed_url(catalog, http, kind, key, effective_key)? {
            Some(url) => url,
            None => return Ok(FeedVerdict::NoFeed),
        },
    };

    let body = match fetch_with_backoff(http, &url) {
        Ok(Some(body)) => body,
        Ok(None) | Err(_) => return Ok(FeedVerdict::NoFeed),
    };
    let feed = match parse_feed(&body) {
        Ok(feed) => feed,
        Err(err) => {
            tracing::debug!(url = %url, error = %err, "feed parse failed");
            return Ok(FeedVerdict::NoFeed);
        }
    };

    for iid in &feed.iids {
        if !catalog.is_member(effective_key, iid)? {
            return Ok(FeedVerdict::IndicatesNew(feed.iids.clone()));
        }
    }
    Ok(FeedVerdict::Fresh)
}

fn discover_feed_url(
    catalog: &mut Catalog,
    http: &dyn Http,
    kind: SourceKind,
    key: &str,
    effective_key: &str,
) -> Result<Option<String>> {
    let Some(page) = source_page_url(kind, effective_key) else {
        return Ok(None);
    };
    let url = match fetch_with_backoff(http, &page) {
        Ok(Some(html)) => find_feed_url(&html),
        Ok(None) => None,
        // Transient trouble: do not poison the cache, just skip the feed
        // path this round.
        Err(err) => {
            tracing::warn!(page = %page, error = %err, "feed discovery failed");
            return Ok(None);
        }
    };

    let tx = catalog.txn()?;
    tx.feed_cache_put(kind, key, url.as_deref())?;
    tx.commit()?;
    Ok(url)
}

fn fetch_with_backoff(http: &dyn Http, url: &str) -> Result<Option<String>> {
    retry_backoff(NETWORK_RETRY_ATTEMPTS, std::thread::sleep, || http.get(url))
}
