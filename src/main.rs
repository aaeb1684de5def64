#![forbid(unsafe_code)]

//! Command-line front end for the tubevault archiving engine.
//!
//! Actions are mutually compositional: a single invocation may register
//! sources, sync, download, and finally mount the virtual filesystem. They
//! execute in a fixed, documented order; the mount always runs last because
//! it blocks until the filesystem is unmounted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use tubevault::catalog::{Catalog, CatalogRead, Item, MISC_DNAME, SourceKind};
use tubevault::config::{self, FileConfig};
use tubevault::download::{self, DownloadOptions};
use tubevault::extractor::Extractor;
use tubevault::feed::UreqHttp;
use tubevault::hooks::{self, HookEvent};
use tubevault::media;
use tubevault::naming::{VIDEO_SUFFIX, alias_coerce, format_v_fname, title_to_name};
use tubevault::registry;
use tubevault::sync::{self, SyncListsOptions};
use tubevault::urls::{Registration, parse_registration};
use tubevault::util::{bytes_to_str, sec_str, unescape_filter};
use tubevault::vfs;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DebugLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl DebugLevel {
    fn as_tracing(self) -> tracing::Level {
        match self {
            DebugLevel::Error => tracing::Level::ERROR,
            DebugLevel::Warn => tracing::Level::WARN,
            DebugLevel::Info => tracing::Level::INFO,
            DebugLevel::Debug => tracing::Level::DEBUG,
            DebugLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Personal media archiver: catalog, sync, download, and mount.
#[derive(Debug, Parser)]
#[command(name = "tubevault", version)]
struct Cli {
    /// Catalog database file.
    #[arg(short = 'f', long = "file", default_value = "tubevault.db")]
    file: PathBuf,

    /// Diagnostic verbosity on stderr.
    #[arg(long, value_enum, default_value = "error")]
    debug: DebugLevel,

    /// Force the action, whatever it may pertain to.
    #[arg(long)]
    force: bool,

    /// Never consult feeds when deciding list freshness.
    #[arg(long = "no-feed")]
    no_feed: bool,

    /// Only touch sources/items that were never processed before.
    #[arg(long = "ignore-old")]
    ignore_old: bool,

    /// Re-download files that are undersized next to the best advertised format.
    #[arg(long = "if-small")]
    if_small: bool,

    /// Turn live/premiere answers into timed sleep entries.
    #[arg(long = "auto-sleep")]
    auto_sleep: bool,

    /// Download rate ceiling in bytes/sec.
    #[arg(long)]
    rate: Option<u64>,

    /// Comma-separated subtitle/caption languages ("" means all).
    #[arg(long = "sub-langs")]
    sub_langs: Option<String>,

    /// Cookies file handed to the downloader.
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// External downloader passed through to the extractor.
    #[arg(long)]
    downloader: Option<String>,

    /// Seconds to pause between sources during list syncs.
    #[arg(long)]
    delay: Option<u64>,

    /// Repeat list syncs forever, sleeping this many seconds between passes.
    #[arg(long = "loop-interval")]
    loop_interval: Option<u64>,

    /// Archive root; defaults to the catalog file's directory.
    #[arg(long = "archive-root")]
    archive_root: Option<PathBuf>,

    /// Register item/source URLs.
    #[arg(long, num_args = 1.., value_name = "URL")]
    add: Option<Vec<String>>,

    /// List sources (optionally filtered).
    #[arg(long, num_args = 0..)]
    list: Option<Vec<String>>,

    /// Like --list but with every item of each source.
    #[arg(long, num_args = 0..)]
    listall: Option<Vec<String>>,

    /// Catalog summary, or detail for items/sources.
    #[arg(long, num_args = 0..)]
    info: Option<Vec<String>>,

    /// Preferred names: list, show one, or set (IID NAME).
    #[arg(long, num_args = 0..=2)]
    name: Option<Vec<String>>,

    /// Channel aliases: list, show one, or set (CHANNEL ALIAS).
    #[arg(long, num_args = 0..=2)]
    alias: Option<Vec<String>>,

    /// Mark items skipped, or list skipped items when empty.
    #[arg(long, num_args = 0..)]
    skip: Option<Vec<String>>,

    /// Un-mark items, or list non-skipped items when empty.
    #[arg(long, num_args = 0..)]
    unskip: Option<Vec<String>>,

    /// Suppress an item until a wake instant: IID ('YYYY-MM-DD HH:MM:SS' | <d|h|m|s>+N).
    #[arg(long, num_args = 2, value_names = ["IID", "WHEN"])]
    sleep: Option<Vec<String>>,

    /// Remove sleep entries, or list them when empty.
    #[arg(long, num_args = 0..)]
    unsleep: Option<Vec<String>>,

    /// Sync source listings (optionally filtered).
    #[arg(long = "sync-lists", num_args = 0..)]
    sync_lists: Option<Vec<String>>,

    /// Sync per-item metadata (optionally filtered).
    #[arg(long = "sync-items", num_args = 0..)]
    sync_items: Option<Vec<String>>,

    /// Download media (optionally filtered).
    #[arg(long, num_args = 0..)]
    download: Option<Vec<String>>,

    /// Re-apply on-disk names from the catalog.
    #[arg(long = "update-names", num_args = 0..)]
    update_names: Option<Vec<String>>,

    /// Mount the read-only virtual filesystem here (runs last, blocks).
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Make VFS symlink targets absolute instead of relative.
    #[arg(long = "mount-absolute")]
    mount_absolute: bool,

    /// Show computed media paths for items or sources.
    #[arg(long, num_args = 1..)]
    showpath: Option<Vec<String>>,

    /// Register a hook module (an executable name).
    #[arg(long = "hook-add", value_name = "MODULE")]
    hook_add: Option<String>,

    /// Unregister a hook module.
    #[arg(long = "hook-remove", value_name = "MODULE")]
    hook_remove: Option<String>,

    /// Set a per-item download format override: IID FORMAT.
    #[arg(long = "set-format", num_args = 2, value_names = ["IID", "FORMAT"])]
    set_format: Option<Vec<String>>,

    /// Cut items at their stored chapter marks.
    #[arg(long, num_args = 1.., value_name = "IID")]
    chapterize: Option<Vec<String>>,

    /// Split one item at explicit cut points: IID TIME...
    #[arg(long, num_args = 2..)]
    split: Option<Vec<String>>,

    /// Convert one item into another format: IID FORMAT.
    #[arg(long, num_args = 2, value_names = ["IID", "FORMAT"])]
    convert: Option<Vec<String>>,

    /// Copy item files somewhere: DEST [FILTER...].
    #[arg(long, num_args = 1..)]
    copy: Option<Vec<String>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.debug.as_tracing())
        .with_writer(std::io::stderr)
        .init();

    let file_cfg = match config::default_config_path() {
        Some(path) => config::read_config(&path)?.unwrap_or_default(),
        None => FileConfig::default(),
    };

    let mut catalog = Catalog::open(&cli.file)
        .with_context(|| format!("opening catalog {}", cli.file.display()))?;

    let catalog_abs = fs::canonicalize(&cli.file)?;
    let archive_root = cli
        .archive_root
        .clone()
        .or(file_cfg.archive_root.clone())
        .unwrap_or_else(|| {
            catalog_abs
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = Arc::clone(&abort);
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupt received, finishing current item...");
            abort.store(true, Ordering::SeqCst);
        })
        .context("installing interrupt handler")?;
    }

    let extractor = Extractor::new();
    let http = UreqHttp::default();

    if let Some(urls) = &cli.add {
        cmd_add(&mut catalog, &archive_root, urls)?;
    }
    if cli.list.is_some() || cli.listall.is_some() {
        cmd_list(&catalog, &archive_root, &cli)?;
    }
    if let Some(args) = &cli.info {
        cmd_info(&catalog, &archive_root, &unescape_filter(args))?;
    }
    if let Some(args) = &cli.name {
        cmd_name(&mut catalog, &archive_root, args)?;
    }
    if let Some(args) = &cli.alias {
        cmd_alias(&mut catalog, &archive_root, args)?;
    }
    if let Some(iids) = &cli.skip {
        cmd_skip(&mut catalog, &unescape_filter(iids), true)?;
    }
    if let Some(iids) = &cli.unskip {
        cmd_skip(&mut catalog, &unescape_filter(iids), false)?;
    }
    if let Some(args) = &cli.sleep {
        let wake = registry::sleep(&mut catalog, &args[0], &args[1])?;
        println!("{} sleeping until {}", args[0], wake);
    }
    if let Some(iids) = &cli.unsleep {
        cmd_unsleep(&mut catalog, &unescape_filter(iids))?;
    }
    if let Some(filter) = &cli.sync_lists {
        extractor.ensure_available()?;
        let opts = SyncListsOptions {
            filter: unescape_filter(filter),
            ignore_old: cli.ignore_old,
            feed_ok: !cli.no_feed,
            force: cli.force,
            delay_secs: cli.delay.or(file_cfg.delay),
        };
        println!("Sync lists");
        loop {
            sync::sync_lists(&mut catalog, &extractor, &http, &opts, &abort)?;
            let Some(interval) = cli.loop_interval else {
                break;
            };
            if abort.load(Ordering::SeqCst) {
                break;
            }
            println!("Sleeping {interval}s before the next pass");
            std::thread::sleep(Duration::from_secs(interval));
        }
    }
    if let Some(filter) = &cli.sync_items {
        extractor.ensure_available()?;
        println!("Sync items");
        sync::sync_items(
            &mut catalog,
            &extractor,
            &unescape_filter(filter),
            cli.ignore_old,
            &abort,
        )?;
    }
    if let Some(filter) = &cli.download {
        extractor.ensure_available()?;
        let opts = DownloadOptions {
            filter: unescape_filter(filter),
            ignore_old: cli.ignore_old,
            force: cli.force,
            if_small: cli.if_small,
            auto_sleep: cli.auto_sleep,
            rate_limit: cli.rate.or(file_cfg.rate_limit),
            downloader: cli.downloader.clone().or(file_cfg.downloader.clone()),
            cookies: cli.cookies.clone().or(file_cfg.cookies.clone()),
            sub_langs: cli.sub_langs.clone().or(file_cfg.sub_langs.clone()),
        };
        println!("Download items");
        download::download_items(&mut catalog, &extractor, &http, &archive_root, &opts, &abort)?;
    }
    if let Some(filter) = &cli.update_names {
        println!("Updating file names to computed or preferred names");
        download::update_names(&mut catalog, &archive_root, &unescape_filter(filter))?;
    }
    if let Some(args) = &cli.showpath {
        cmd_showpath(&catalog, &archive_root, &unescape_filter(args))?;
    }
    if let Some(module) = &cli.hook_add {
        let tx = catalog.txn()?;
        tx.hook_add(module)?;
        tx.commit()?;
        println!("Registered hook {module}");
    }
    if let Some(module) = &cli.hook_remove {
        let tx = catalog.txn()?;
        let removed = tx.hook_remove(module)?;
        tx.commit()?;
        if removed {
            println!("Unregistered hook {module}");
        } else {
            println!("Hook {module} was not registered");
        }
    }
    if let Some(args) = &cli.set_format {
        let tx = catalog.txn()?;
        tx.set_item_video_format(&args[0], Some(&args[1]))?;
        tx.commit()?;
        println!("{}: format override set to {}", args[0], args[1]);
    }
    if let Some(iids) = &cli.chapterize {
        media::ensure_ffmpeg()?;
        for iid in unescape_filter(iids) {
            let written = media::chapterize(&catalog, &archive_root, &iid)?;
            println!("{iid}: wrote {} chapter file(s)", written.len());
        }
    }
    if let Some(args) = &cli.split {
        media::ensure_ffmpeg()?;
        let written = media::split(&catalog, &archive_root, &args[0], &args[1..])?;
        println!("{}: wrote {} part(s)", args[0], written.len());
    }
    if let Some(args) = &cli.convert {
        media::ensure_ffmpeg()?;
        let out = media::convert(&catalog, &archive_root, &args[0], &args[1])?;
        println!("{}: wrote {}", args[0], out.display());
    }
    if let Some(args) = &cli.copy {
        let dest = PathBuf::from(&args[0]);
        let filter = unescape_filter(&args[1..]);
        let copied = media::copy_items(&mut catalog, &archive_root, &dest, &filter)?;
        println!("Copied {copied} file(s) to {}", dest.display());
    }

    // The mount blocks until the kernel releases it, so it always goes last.
    if let Some(mountpoint) = &cli.mount {
        if !mountpoint.is_dir() {
            bail!("mount point {} is not a directory", mountpoint.display());
        }
        let mountpoint = fs::canonicalize(mountpoint)?;
        let archive_root = fs::canonicalize(&archive_root)?;
        println!("Mounting on {}", mountpoint.display());
        vfs::mount(catalog, archive_root, &mountpoint, cli.mount_absolute)?;
    }

    Ok(())
}

/// Effective path of an item's media file.
fn item_path(catalog: &Catalog, root: &Path, item: &Item) -> Result<Option<PathBuf>> {
    let Some(dname) = &item.dname else {
        return Ok(None);
    };
    let alias = catalog.pref_name(&item.iid)?;
    Ok(Some(format_v_fname(
        root,
        dname,
        item.name.as_deref(),
        alias.as_deref(),
        &item.iid,
        Some(VIDEO_SUFFIX),
    )))
}

fn cmd_add(catalog: &mut Catalog, root: &Path, urls: &[String]) -> Result<()> {
    let mut registered = Vec::new();
    let tx = catalog.txn()?;
    for (i, url) in urls.iter().enumerate() {
        println!("{} of {}: {}", i + 1, urls.len(), url);
        match parse_registration(url)? {
            Registration::Item(iid) => {
                if tx.get_item(&iid)?.is_some() {
                    println!("\tFound");
                } else {
                    tx.insert_item_shell(&iid, MISC_DNAME, None, None)?;
                    println!("\tAdded");
                }
            }
            Registration::Source(kind, key) => {
                if tx.get_source(kind, &key)?.is_some() {
                    println!("\tFound");
                } else {
                    tx.insert_source(kind, &key)?;
                    let dir = root.join(&key);
                    if !dir.exists() {
                        fs::create_dir_all(&dir)?;
                    }
                    println!("\tAdded");
                    registered.push((kind, key));
                }
            }
        }
    }
    tx.commit()?;

    for (kind, key) in registered {
        hooks::dispatch(
            catalog,
            &HookEvent::SourceRegistered {
                kind: kind.label().to_owned(),
                key,
            },
        );
    }
    Ok(())
}

fn cmd_list(catalog: &Catalog, root: &Path, cli: &Cli) -> Result<()> {
    let filter = unescape_filter(
        cli.listall
            .as_deref()
            .or(cli.list.as_deref())
            .unwrap_or_default(),
    );
    let all = cli.listall.is_some();

    for kind in SourceKind::SYNC_ORDER {
        let sources = catalog.sources(kind, &filter, false)?;
        println!("{}s ({}):", capitalize(kind.describe()), sources.len());
        for source in sources {
            let members = catalog.memberships(source.effective_key())?;
            if let Some(alias) = &source.alias {
                println!("\t{} -> {} ({})", source.key, alias, members.len());
            } else {
                println!("\t{} ({})", source.key, members.len());
            }
            if all {
                list_items(catalog, root, &members.iter().map(|m| m.iid.clone()).collect::<Vec<_>>())?;
            }
        }
    }
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn list_items(catalog: &Catalog, root: &Path, iids: &[String]) -> Result<()> {
    let mut exists_count = 0usize;
    let mut skipped = 0usize;

    for iid in iids {
        let Some(item) = catalog.get_item(iid)? else {
            println!("\t\t{iid}:   ?");
            continue;
        };
        if item.skip {
            println!("\t\t{iid}: S");
            skipped += 1;
            continue;
        }
        let exists = match item_path(catalog, root, &item)? {
            Some(path) => path.exists(),
            None => false,
        };
        if exists {
            exists_count += 1;
        }
        match &item.title {
            Some(title) => {
                let title = title.replace('\n', "\\n");
                let dur = sec_str(item.duration.unwrap_or(0));
                let marker = if exists { "E" } else { " " };
                println!("\t\t{iid}: {marker} {title} ({dur})");
            }
            None => println!("\t\t{iid}: ?"),
        }
    }
    println!();
    println!("\t\tSkipped: {} of {}", skipped, iids.len());
    println!(
        "\t\tExists: {} of {} non-skipped",
        exists_count,
        iids.len() - skipped
    );
    Ok(())
}

fn cmd_info(catalog: &Catalog, root: &Path, args: &[String]) -> Result<()> {
    if args.is_empty() {
        let stats = catalog.stats()?;
        println!("Catalog information");
        println!("\tFile: {}", catalog.path().display());
        println!();
        println!("\tUsers: {}", stats.users);
        println!("\tUnnamed channels: {}", stats.channels_unnamed);
        println!("\tNamed channels: {}", stats.channels_named);
        println!("\tPlaylists: {}", stats.playlists);
        println!("\tItems: {}", stats.items);
        println!("\t\tSkipped: {}", stats.skipped);
        println!("\t\tDownloaded: {}", stats.downloaded);
        println!("\t\tWith preferred names: {}", stats.preferred_names);
        let days = stats.total_duration as f64 / 86400.0;
        println!(
            "\t\tTotal duration: {} ({days:.2} days)",
            sec_str(stats.total_duration)
        );
        return Ok(());
    }

    for key in args {
        if let Some(item) = catalog.get_item(key)? {
            print_item_info(catalog, root, &item)?;
            continue;
        }
        if let Some(source) = catalog.find_source(key)? {
            println!("\t{} {}:", capitalize(source.kind.describe()), key);
            let items = catalog.items_with_dname(source.effective_key())?;
            let total: i64 = items.iter().filter_map(|i| i.duration).sum();
            println!(
                "\t\tTotal duration: {} ({:.2} days)",
                sec_str(total),
                total as f64 / 86400.0
            );
            println!();
            for item in items {
                print_item_info(catalog, root, &item)?;
            }
            continue;
        }
        println!("\t{key} -- NOT FOUND");
    }
    Ok(())
}

fn print_item_info(catalog: &Catalog, root: &Path, item: &Item) -> Result<()> {
    let path = item_path(catalog, root, item)?;
    let (exists, size) = match &path {
        Some(path) => match fs::metadata(path) {
            Ok(meta) => (true, format!("{} ({} bytes)", bytes_to_str(meta.len()), meta.len())),
            Err(_) => (false, String::new()),
        },
        None => (false, String::new()),
    };

    let fmt_time = |t: &Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    };

    let rows = [
        ("Item", item.iid.clone()),
        ("Title", item.title.clone().unwrap_or_default()),
        (
            "Duration (HH:MM:SS)",
            item.duration.map(sec_str).unwrap_or_default(),
        ),
        ("Name", item.name.clone().unwrap_or_default()),
        ("Directory Name", item.dname.clone().unwrap_or_default()),
        ("Uploader", item.uploader.clone().unwrap_or_default()),
        ("Publish Time", fmt_time(&item.ptime)),
        ("Creation Time", fmt_time(&item.ctime)),
        ("Access Time", fmt_time(&item.atime)),
        ("Update Time", fmt_time(&item.utime)),
        ("Skip?", item.skip.to_string()),
        (
            "Format Override",
            item.video_format.clone().unwrap_or_default(),
        ),
        (
            "Path",
            path.map(|p| p.display().to_string()).unwrap_or_default(),
        ),
        ("Exists?", exists.to_string()),
        ("Size", size),
    ];

    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (k, v) in rows {
        println!("\t\t{k:>width$}: {v}");
    }
    println!();
    Ok(())
}

fn cmd_name(catalog: &mut Catalog, root: &Path, args: &[String]) -> Result<()> {
    match args {
        [] => {
            let names = catalog.pref_names_all()?;
            println!("Preferred names ({}):", names.len());
            for (iid, name) in names {
                let dname = catalog
                    .get_item(&iid)?
                    .and_then(|i| i.dname)
                    .unwrap_or_default();
                println!("\t{iid} -> {dname} / {name}");
            }
        }
        [iid] => {
            let Some(item) = catalog.get_item(iid)? else {
                println!("No item with id '{iid}' found");
                return Ok(());
            };
            println!("Item: {iid}");
            println!("Title: {}", item.title.unwrap_or_default());
            println!("Directory: {}", item.dname.unwrap_or_default());
            println!("Computed name: {}", item.name.unwrap_or_default());
            match catalog.pref_name(iid)? {
                Some(name) => println!("Preferred name: {name}"),
                None => println!("-- NO PREFERRED NAME SET --"),
            }
        }
        [iid, name] => {
            // The preferred name must already be in canonical form so the
            // on-disk name round-trips.
            if title_to_name(name) != *name {
                return Err(tubevault::error::Error::InvalidName(name.clone()).into());
            }
            let item = catalog
                .get_item(iid)?
                .ok_or_else(|| tubevault::error::Error::NotFound(iid.clone()))?;
            let dname = item
                .dname
                .clone()
                .ok_or_else(|| tubevault::error::Error::NotFound(format!("{iid} has no directory")))?;

            let dir = root
                .join(&dname)
                .join(tubevault::naming::shard_char(iid).to_string());
            download::rename_files(&dir, iid, name)?;

            let tx = catalog.txn()?;
            tx.set_pref_name(iid, name)?;
            tx.commit()?;
            println!("{iid}: preferred name set to {name}");
        }
        _ => bail!("--name takes at most two values"),
    }
    Ok(())
}

fn cmd_alias(catalog: &mut Catalog, root: &Path, args: &[String]) -> Result<()> {
    match args {
        [] => {
            let channels = catalog.sources(SourceKind::ChannelUnnamed, &[], false)?;
            println!("Unnamed channels ({}):", channels.len());
            for ch in channels {
                match &ch.alias {
                    Some(alias) => println!("\t{} -> {}", ch.key, alias),
                    None => println!("\t{}", ch.key),
                }
            }
        }
        [key] => {
            let Some(ch) = catalog.get_source(SourceKind::ChannelUnnamed, key)? else {
                println!("No unnamed channel '{key}' found");
                return Ok(());
            };
            println!("Channel: {}", ch.key);
            println!("Alias: {}", ch.alias.unwrap_or_default());
        }
        [key, alias] => {
            let alias = alias_coerce(alias)?;

            // The alias namespace is shared with every source key.
            if let Some(existing) = catalog.get_source(SourceKind::ChannelUnnamed, &alias)? {
                if existing.key == *key {
                    // Re-setting the same alias is a no-op.
                    return Ok(());
                }
                bail!("alias '{alias}' already used by channel {}", existing.key);
            }
            if catalog.get_source(SourceKind::ChannelNamed, &alias)?.is_some() {
                bail!("alias '{alias}' collides with a named channel");
            }
            if catalog.get_source(SourceKind::User, &alias)?.is_some() {
                bail!("alias '{alias}' collides with a user");
            }

            let ch = catalog
                .get_source(SourceKind::ChannelUnnamed, key)?
                .ok_or_else(|| tubevault::error::Error::NotFound(key.clone()))?;
            let old_effective = ch.effective_key().to_owned();

            // Move the on-disk directory to the new alias.
            let old_dir = root.join(&old_effective);
            let new_dir = root.join(&alias);
            if old_dir.exists() {
                fs::rename(&old_dir, &new_dir)?;
            } else if !new_dir.exists() {
                println!("No channel directory at {}, creating new", old_dir.display());
                fs::create_dir_all(&new_dir)?;
            }

            let tx = catalog.txn()?;
            tx.set_channel_alias(ch.rowid, &alias)?;
            tx.rename_dname(&old_effective, &alias)?;
            tx.commit()?;
            println!("{} -> {}", ch.key, alias);
        }
        _ => bail!("--alias takes at most two values"),
    }
    Ok(())
}

fn cmd_skip(catalog: &mut Catalog, iids: &[String], skip: bool) -> Result<()> {
    if iids.is_empty() {
        let marked = catalog.skip_marked_items(skip)?;
        if skip {
            println!("Items marked skip ({}):", marked.len());
        } else {
            println!("Items NOT marked skip ({}):", marked.len());
        }
        for iid in marked {
            println!("\t{iid}");
        }
        return Ok(());
    }

    println!(
        "Marking items to {} ({}):",
        if skip { "skip" } else { "not skip" },
        iids.len()
    );
    for iid in iids {
        println!("\t{iid}");
    }
    registry::mark_skip(catalog, iids, skip)?;
    Ok(())
}

fn cmd_unsleep(catalog: &mut Catalog, iids: &[String]) -> Result<()> {
    if iids.is_empty() {
        let entries = registry::list(catalog)?;
        println!("Sleeping items ({}):", entries.len());
        for entry in entries {
            println!("\t{} until {}", entry.iid, entry.wake);
        }
        return Ok(());
    }
    for iid in iids {
        registry::unsleep(catalog, iid)?;
        println!("{iid}: sleep entry removed");
    }
    Ok(())
}

fn cmd_showpath(catalog: &Catalog, root: &Path, args: &[String]) -> Result<()> {
    let items = catalog.items_for_sync(args, false)?;
    for item in &items {
        let path = item_path(catalog, root, item)?;
        let exists = path.as_ref().is_some_and(|p| p.exists());
        let marker = if exists { "E" } else { " " };
        println!(
            "{}: {} {} ({})",
            item.iid,
            marker,
            item.title.as_deref().unwrap_or("?"),
            sec_str(item.duration.unwrap_or(0))
        );
        if let Some(path) = path {
            println!("\t{}", path.display());
        }
        println!();
    }
    if items.is_empty() {
        println!("No matching items");
    }
    Ok(())
}
