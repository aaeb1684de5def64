#![forbid(unsafe_code)]

//! Small formatting and retry helpers shared by the binaries and the core.

use std::time::Duration;

use crate::error::{Error, Result};

/// Maximum attempts for network-layer faults (connection reset, temporary
/// DNS failure). Each retry sleeps `2^n` seconds.
pub const NETWORK_RETRY_ATTEMPTS: u32 = 10;

/// Renders seconds as `H:MM:SS`, `M:SS`, or `0:SS` with zero padding on all
/// but the most significant position.
pub fn sec_str(sec: i64) -> String {
    let (min, sec) = (sec / 60, sec % 60);
    let (hr, min) = (min / 60, min % 60);

    if hr > 0 {
        format!("{}:{:02}:{:02}", hr, min, sec)
    } else if min > 0 {
        format!("{}:{:02}", min, sec)
    } else {
        format!("0:{}", sec)
    }
}

/// Human-readable byte count with binary prefixes.
pub fn bytes_to_str(v: u64) -> String {
    const KIB: f64 = 1024.0;
    let v = v as f64;

    let t = v / KIB.powi(4);
    let g = v / KIB.powi(3);
    let m = v / KIB.powi(2);
    let k = v / KIB;

    if t > 1.0 {
        format!("{:.3} TiB", t)
    } else if g > 1.0 {
        format!("{:.3} GiB", g)
    } else if m > 1.0 {
        format!("{:.3} MiB", m)
    } else if k > 1.0 {
        format!("{:.3} KiB", k)
    } else {
        format!("{} B", v as u64)
    }
}

/// Runs `op`, retrying transient failures with exponential back-off.
///
/// The sleeper is injected so tests never wait; production callers pass
/// `std::thread::sleep`.
pub fn retry_backoff<T, F, S>(attempts: u32, mut sleep: S, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
    S: FnMut(Duration),
{
    let mut n = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && n + 1 < attempts => {
                tracing::warn!(attempt = n + 1, error = %e, "transient failure, backing off");
                sleep(Duration::from_secs(1u64 << n.min(16)));
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// CLI filters cannot start with `-` (the parser eats them), so iids that do
/// are written with a leading `=` and unescaped here.
pub fn unescape_filter(filt: &[String]) -> Vec<String> {
    filt.iter()
        .map(|f| match f.strip_prefix('=') {
            Some(rest) => format!("-{rest}"),
            None => f.clone(),
        })
        .collect()
}

/// Quotes a list for an SQL `IN (...)` clause. The catalog only ever feeds
/// this iids and source keys, which never contain quotes.
pub fn list_to_quoted_csv(l: &[String]) -> String {
    l.iter()
        .map(|s| format!("'{}'", s.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",")
}
