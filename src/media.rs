#![forbid(unsafe_code)]

//! Post-archive media helpers.
//!
//! Transcoding is delegated to an external `ffmpeg` on PATH; this module
//! only assembles invocations and destination paths. The copy helper sweeps
//! a source's shard directories and records every destination it has ever
//! been pointed at.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogRead, Item};
use crate::error::{Error, Result};
use crate::naming::{VIDEO_SUFFIX, format_v_fname, title_to_name};

const FFMPEG: &str = "ffmpeg";

/// Container kinds the rename pass can recognize by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Matroska,
}

/// Sniffs a file's container from its magic bytes. Unknown content is an
/// error; silently rewriting unidentified files is how archives rot.
pub fn probe_container(path: &Path) -> Result<Container> {
    let mut head = [0u8; 12];
    let mut file = fs::File::open(path)?;
    let n = file.read(&mut head)?;

    if n >= 4 && head[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Ok(Container::Matroska);
    }
    if n >= 8 && &head[4..8] == b"ftyp" {
        return Ok(Container::Mp4);
    }
    Err(Error::Tool {
        tool: "rename",
        detail: format!("unrecognized container in {}", path.display()),
    })
}

pub fn ensure_ffmpeg() -> Result<()> {
    let status = Command::new(FFMPEG)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(Error::Tool {
            tool: FFMPEG,
            detail: "ffmpeg not found on PATH".into(),
        }),
    }
}

fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new(FFMPEG)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(Error::Tool {
            tool: FFMPEG,
            detail: String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or("ffmpeg failed")
                .to_owned(),
        });
    }
    Ok(())
}

/// Rewraps a stream into the archive container without re-encoding.
pub fn transmux_to_mkv(src: &Path, dest: &Path) -> Result<()> {
    let src_s = src.display().to_string();
    let dest_s = dest.display().to_string();
    run_ffmpeg(&["-i", src_s.as_str(), "-codec", "copy", dest_s.as_str()])
}

/// Resolves an item's on-disk media path through the catalog.
fn media_path(catalog: &Catalog, item: &Item) -> Result<PathBuf> {
    let dname = item
        .dname
        .as_deref()
        .ok_or_else(|| Error::NotFound(format!("{} has no directory", item.iid)))?;
    let alias = catalog.pref_name(&item.iid)?;
    Ok(format_v_fname(
        Path::new(""),
        dname,
        item.name.as_deref(),
        alias.as_deref(),
        &item.iid,
        Some(VIDEO_SUFFIX),
    ))
}

fn item_for(catalog: &Catalog, iid: &str) -> Result<Item> {
    catalog
        .get_item(iid)?
        .ok_or_else(|| Error::NotFound(iid.to_owned()))
}

/// Cuts an item's media at its stored chapter marks. Pieces land in a
/// `<base>.chapters/` sibling directory so the rename pass never sees them.
pub fn chapterize(catalog: &Catalog, root: &Path, iid: &str) -> Result<Vec<PathBuf>> {
    let item = item_for(catalog, iid)?;
    let chapters = item.chapters.clone().ok_or_else(|| Error::Tool {
        tool: FFMPEG,
        detail: format!("{iid} has no stored chapters"),
    })?;

    let media = root.join(media_path(catalog, &item)?);
    if !media.exists() {
        return Err(Error::NotFound(format!("{} not on disk", media.display())));
    }

    let out_dir = media.with_extension("chapters");
    fs::create_dir_all(&out_dir)?;

    let mut written = Vec::new();
    for (i, (start, label)) in chapters.iter().enumerate() {
        let next = chapters.get(i + 1).map(|(s, _)| s.as_str());
        let out = out_dir.join(format!(
            "{:02} - {}.{}",
            i + 1,
            title_to_name(label),
            VIDEO_SUFFIX
        ));
        if out.exists() {
            continue;
        }
        let media_s = media.display().to_string();
        let out_s = out.display().to_string();
        let mut args = vec!["-i", media_s.as_str(), "-ss", start.as_str()];
        if let Some(next) = next {
            args.extend_from_slice(&["-to", next]);
        }
        args.extend_from_slice(&["-codec", "copy", out_s.as_str()]);
        run_ffmpeg(&args)?;
        written.push(out);
    }
    Ok(written)
}

/// Splits an item's media at the given cut points (`H:MM:SS` or `M:SS`).
pub fn split(catalog: &Catalog, root: &Path, iid: &str, points: &[String]) -> Result<Vec<PathBuf>> {
    let item = item_for(catalog, iid)?;
    let media = root.join(media_path(catalog, &item)?);
    if !media.exists() {
        return Err(Error::NotFound(format!("{} not on disk", media.display())));
    }

    let out_dir = media.with_extension("split");
    fs::create_dir_all(&out_dir)?;

    let mut bounds: Vec<Option<&str>> = vec![None];
    bounds.extend(points.iter().map(|p| Some(p.as_str())));
    bounds.push(None);

    let mut written = Vec::new();
    for (i, pair) in bounds.windows(2).enumerate() {
        let out = out_dir.join(format!("part-{:02}.{}", i + 1, VIDEO_SUFFIX));
        let media_s = media.display().to_string();
        let out_s = out.display().to_string();
        let mut args = vec!["-i", media_s.as_str()];
        if let Some(start) = pair[0] {
            args.extend_from_slice(&["-ss", start]);
        }
        if let Some(end) = pair[1] {
            args.extend_from_slice(&["-to", end]);
        }
        args.extend_from_slice(&["-codec", "copy", out_s.as_str()]);
        run_ffmpeg(&args)?;
        written.push(out);
    }
    Ok(written)
}

/// Converts an item's media into another format. Audio targets get the
/// encoder settings the archive has always used for them.
pub fn convert(catalog: &Catalog, root: &Path, iid: &str, format: &str) -> Result<PathBuf> {
    let item = item_for(catalog, iid)?;
    let media = root.join(media_path(catalog, &item)?);
    if !media.exists() {
        return Err(Error::NotFound(format!("{} not on disk", media.display())));
    }

    let out = media.with_extension(format);
    let media_s = media.display().to_string();
    let out_s = out.display().to_string();
    match format {
        "mp3" => run_ffmpeg(&[
            "-i",
            media_s.as_str(),
            "-codec:a",
            "libmp3lame",
            "-q:a",
            "2",
            out_s.as_str(),
        ])?,
        _ => run_ffmpeg(&["-i", media_s.as_str(), out_s.as_str()])?,
    }
    Ok(out)
}

/// Copies every on-disk file of the matching items into `dest`, sweeping
/// each owning directory's shards. The destination is remembered in the
/// copy-path history.
pub fn copy_items(
    catalog: &mut Catalog,
    root: &Path,
    dest: &Path,
    filter: &[String],
) -> Result<usize> {
    let items = catalog.items_for_download(filter, false)?;
    fs::create_dir_all(dest)?;

    let mut copied = 0usize;
    for item in &items {
        let Some(dname) = &item.dname else {
            continue;
        };
        let source_dir = root.join(dname);
        if !source_dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&source_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if !name.contains(&item.iid) || name.starts_with("._") {
                continue;
            }
            let target = dest.join(name.as_ref());
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    let tx = catalog.txn()?;
    tx.copy_dest_add(&dest.display().to_string())?;
    tx.commit()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{now, open_temp};
    use tempfile::tempdir;

    #[test]
    fn probe_container_by_magic() {
        let dir = tempdir().unwrap();
        let mkv = dir.path().join("a");
        fs::write(&mkv, [0x1A, 0x45, 0xDF, 0xA3, 1, 2, 3, 4]).unwrap();
        assert_eq!(probe_container(&mkv).unwrap(), Container::Matroska);

        let mp4 = dir.path().join("b");
        fs::write(&mp4, b"\x00\x00\x00\x20ftypisom").unwrap();
        assert_eq!(probe_container(&mp4).unwrap(), Container::Mp4);

        let other = dir.path().join("c");
        fs::write(&other, b"hello world!").unwrap();
        assert!(probe_container(&other).is_err());
    }

    #[test]
    fn copy_items_sweeps_shards_and_records_dest() {
        let (dir, mut cat) = open_temp();
        let root = dir.path().join("archive");
        let dest = dir.path().join("export");

        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), Some("One")).unwrap();
        tx.commit().unwrap();

        let shard = root.join("MIT").join("a");
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("One-aaaaaaaaaaa.mkv"), b"v").unwrap();
        fs::write(shard.join("One-aaaaaaaaaaa.info.json"), b"{}").unwrap();
        fs::write(shard.join("._One-aaaaaaaaaaa.mkv"), b"fork").unwrap();
        fs::write(shard.join("Other-bbbbbbbbbbb.mkv"), b"n").unwrap();

        let copied = copy_items(&mut cat, &root, &dest, &["aaaaaaaaaaa".into()]).unwrap();
        assert_eq!(copied, 2);
        assert!(dest.join("One-aaaaaaaaaaa.mkv").exists());
        assert!(dest.join("One-aaaaaaaaaaa.info.json").exists());
        assert!(!dest.join("Other-bbbbbbbbbbb.mkv").exists());

        assert_eq!(
            cat.copy_dests().unwrap(),
            vec![dest.display().to_string()]
        );
    }

    #[test]
    fn chapterize_requires_stored_chapters() {
        let (dir, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), Some("One")).unwrap();
        tx.commit().unwrap();
        assert!(chapterize(&cat, dir.path(), "aaaaaaaaaaa").is_err());
    }

    #[test]
    fn convert_requires_media_on_disk() {
        let (dir, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.insert_item_shell("aaaaaaaaaaa", "MIT", Some(now()), Some("One")).unwrap();
        tx.commit().unwrap();
        assert!(matches!(
            convert(&cat, dir.path(), "aaaaaaaaaaa", "mp3"),
            Err(Error::NotFound(_))
        ));
    }
}
