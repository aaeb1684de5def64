#![forbid(unsafe_code)]

//! Read-only virtual filesystem over the catalog.
//!
//! The mount exposes one directory per source variant (`c`, `ch`, `u`,
//! `pl`) with a symlink per downloaded item, plus date-bucketed views under
//! `v/`. Links resolve to the real media files; nothing here ever mutates
//! the archive, and every write-shaped operation answers permission denied.
//!
//! The tree itself is virtual: inodes are handed out lazily as the kernel
//! looks paths up, and every listing is answered straight from the catalog
//! so a re-mount is never needed after a sync.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    Request,
};

use crate::catalog::{Catalog, CatalogRead, SourceKind};
use crate::error::{Error, Result};
use crate::naming::{VIDEO_SUFFIX, shard_char};

const TTL: Duration = Duration::from_secs(1);

/// Length of the site's opaque item identifiers.
const IID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateField {
    Publish,
    Download,
}

impl DateField {
    fn column(self) -> &'static str {
        match self {
            DateField::Publish => "ptime",
            DateField::Download => "utime",
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            DateField::Publish => "date_publish",
            DateField::Download => "date_download",
        }
    }
}

/// Every node the tree can hand an inode to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Root,
    KindDir(SourceKind),
    SourceDir(SourceKind, String),
    ViewsRoot,
    DateView(DateField),
    Year(DateField, String),
    Month(DateField, String, String),
    Day(DateField, String, String, String),
    /// A symlink to an item's media file. `depth` is how many directories
    /// sit between the mount root and the link's parent.
    ItemLink { iid: String, depth: usize },
}

/// Where symlink targets point: an absolute archive root, or a path
/// relative to the mount point.
enum LinkBase {
    Absolute(PathBuf),
    Relative(String),
}

pub struct ArchiveFs {
    catalog: Catalog,
    archive_root: PathBuf,
    link_base: LinkBase,
    nodes: HashMap<u64, Node>,
    inos: HashMap<Node, u64>,
    next_ino: u64,
    base_attr: BaseAttr,
}

/// Stat template copied from the catalog file at mount time.
#[derive(Clone, Copy)]
struct BaseAttr {
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
}

/// Walks `from` and `to` component-wise and returns the `../`-prefixed path
/// leading from one to the other. Both paths must be absolute.
fn relative_path(from: &Path, to: &Path) -> String {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = vec!["..".to_owned(); from.len() - common];
    parts.extend(to[common..].iter().map(|c| c.as_os_str().to_string_lossy().into_owned()));
    if parts.is_empty() {
        ".".to_owned()
    } else {
        parts.join("/")
    }
}

/// Extracts the trailing item id from a listed file name such as
/// `Name-btZ-VFW4wpY.mkv`.
fn iid_from_file_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(&format!(".{VIDEO_SUFFIX}"))?;
    if stem.len() <= IID_LEN {
        return None;
    }
    let cut = stem.len() - IID_LEN;
    // Lookup names come straight from the kernel and may be arbitrary bytes.
    if !stem.is_char_boundary(cut) {
        return None;
    }
    Some(&stem[cut..])
}

impl ArchiveFs {
    pub fn new(
        catalog: Catalog,
        archive_root: PathBuf,
        mountpoint: &Path,
        absolute_links: bool,
    ) -> Result<Self> {
        let meta = std::fs::metadata(catalog.path())?;
        let base_attr = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                BaseAttr {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    atime: meta.accessed().unwrap_or(UNIX_EPOCH),
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                    ctime: meta.modified().unwrap_or(UNIX_EPOCH),
                }
            }
            #[cfg(not(unix))]
            {
                BaseAttr {
                    uid: 0,
                    gid: 0,
                    atime: UNIX_EPOCH,
                    mtime: UNIX_EPOCH,
                    ctime: UNIX_EPOCH,
                }
            }
        };

        let link_base = if absolute_links {
            LinkBase::Absolute(archive_root.clone())
        } else {
            LinkBase::Relative(relative_path(mountpoint, &archive_root))
        };

        let mut fs = Self {
            catalog,
            archive_root,
            link_base,
            nodes: HashMap::new(),
            inos: HashMap::new(),
            next_ino: fuser::FUSE_ROOT_ID,
            base_attr,
        };
        fs.ino_for(Node::Root);
        Ok(fs)
    }

    fn ino_for(&mut self, node: Node) -> u64 {
        if let Some(&ino) = self.inos.get(&node) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inos.insert(node.clone(), ino);
        self.nodes.insert(ino, node);
        ino
    }

    /// The file name an item is listed under inside a per-source directory.
    fn listed_name(&self, iid: &str, name: Option<&str>) -> Result<String> {
        let effective = match self.catalog.pref_name(iid)? {
            Some(pref) => pref,
            None => name.unwrap_or(crate::naming::TEMP_NAME).to_owned(),
        };
        Ok(format!("{effective}-{iid}.{VIDEO_SUFFIX}"))
    }

    /// Children of a directory node: `(node, type, name)` triples.
    fn children(&mut self, node: &Node) -> Result<Vec<(Node, FileType, String)>> {
        let mut out = Vec::new();
        match node {
            Node::Root => {
                for kind in SourceKind::SYNC_ORDER {
                    out.push((
                        Node::KindDir(kind),
                        FileType::Directory,
                        kind.label().to_owned(),
                    ));
                }
                out.push((Node::ViewsRoot, FileType::Directory, "v".to_owned()));
            }
            Node::KindDir(kind) => {
                for source in self.catalog.sources(*kind, &[], false)? {
                    let key = source.effective_key().to_owned();
                    out.push((
                        Node::SourceDir(*kind, key.clone()),
                        FileType::Directory,
                        key,
                    ));
                }
            }
            Node::SourceDir(_, key) => {
                for item in self.catalog.downloaded_items_for_dname(key)? {
                    let name = self.listed_name(&item.iid, item.name.as_deref())?;
                    out.push((
                        Node::ItemLink {
                            iid: item.iid,
                            depth: 2,
                        },
                        FileType::Symlink,
                        name,
                    ));
                }
            }
            Node::ViewsRoot => {
                for field in [DateField::Publish, DateField::Download] {
                    out.push((
                        Node::DateView(field),
                        FileType::Directory,
                        field.dir_name().to_owned(),
                    ));
                }
            }
            Node::DateView(field) => {
                for year in self.catalog.date_buckets(field.column(), "%Y", None)? {
                    out.push((
                        Node::Year(*field, year.clone()),
                        FileType::Directory,
                        year,
                    ));
                }
            }
            Node::Year(field, year) => {
                for month in self
                    .catalog
                    .date_buckets(field.column(), "%m", Some(year.as_str()))?
                {
                    out.push((
                        Node::Month(*field, year.clone(), month.clone()),
                        FileType::Directory,
                        month,
                    ));
                }
            }
            Node::Month(field, year, month) => {
                let prefix = format!("{year}-{month}");
                for day in self
                    .catalog
                    .date_buckets(field.column(), "%d", Some(prefix.as_str()))?
                {
                    out.push((
                        Node::Day(*field, year.clone(), month.clone(), day.clone()),
                        FileType::Directory,
                        day,
                    ));
                }
            }
            Node::Day(field, year, month, day) => {
                let date = format!("{year}-{month}-{day}");
                for item in self.catalog.items_on_date(field.column(), &date)? {
                    let dname = item.dname.clone().unwrap_or_default();
                    let listed = self.listed_name(&item.iid, item.name.as_deref())?;
                    out.push((
                        Node::ItemLink {
                            iid: item.iid,
                            depth: 5,
                        },
                        FileType::Symlink,
                        format!("{dname}-{listed}"),
                    ));
                }
            }
            Node::ItemLink { .. } => {
                return Err(Error::NotFound("not a directory".into()));
            }
        }
        Ok(out)
    }

    /// Renders the symlink target for an item from its current catalog row.
    fn link_target(&self, iid: &str, depth: usize) -> Result<String> {
        let item = self
            .catalog
            .get_item(iid)?
            .ok_or_else(|| Error::NotFound(iid.to_owned()))?;
        let dname = item
            .dname
            .clone()
            .ok_or_else(|| Error::NotFound(iid.to_owned()))?;
        let file = self.listed_name(iid, item.name.as_deref())?;
        let shard = shard_char(iid);

        let base = match &self.link_base {
            LinkBase::Absolute(root) => root.display().to_string(),
            LinkBase::Relative(rel) => format!("{}{rel}", "../".repeat(depth)),
        };
        Ok(format!("{base}/{dname}/{shard}/{file}"))
    }

    /// Real on-disk path of an item's media file, for stat times.
    fn data_path(&self, iid: &str) -> Option<PathBuf> {
        let item = self.catalog.get_item(iid).ok()??;
        let dname = item.dname.clone()?;
        let file = self.listed_name(iid, item.name.as_deref()).ok()?;
        Some(
            self.archive_root
                .join(dname)
                .join(shard_char(iid).to_string())
                .join(file),
        )
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: self.base_attr.atime,
            mtime: self.base_attr.mtime,
            ctime: self.base_attr.ctime,
            crtime: self.base_attr.ctime,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 1,
            uid: self.base_attr.uid,
            gid: self.base_attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn link_attr(&self, ino: u64, iid: &str, depth: usize) -> Result<FileAttr> {
        let target = self.link_target(iid, depth)?;
        let mut attr = self.dir_attr(ino);
        attr.kind = FileType::Symlink;
        attr.perm = 0o777;
        attr.size = target.len() as u64;
        attr.nlink = 1;
        // Prefer the backing data file's own times when it is reachable.
        if let Some(path) = self.data_path(iid) {
            if let Ok(meta) = std::fs::metadata(&path) {
                attr.atime = meta.accessed().unwrap_or(attr.atime);
                attr.mtime = meta.modified().unwrap_or(attr.mtime);
                attr.ctime = meta.modified().unwrap_or(attr.ctime);
            }
        }
        Ok(attr)
    }

    fn attr_for(&mut self, ino: u64) -> Result<FileAttr> {
        let node = self
            .nodes
            .get(&ino)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inode {ino}")))?;
        match node {
            Node::ItemLink { iid, depth } => self.link_attr(ino, &iid, depth),
            _ => Ok(self.dir_attr(ino)),
        }
    }

    /// Resolves one name inside a directory node without listing everything
    /// when the shape of the name already pins the child.
    fn lookup_child(&mut self, parent: &Node, name: &str) -> Result<Option<Node>> {
        let child = match parent {
            Node::Root => match name {
                "v" => Some(Node::ViewsRoot),
                label => SourceKind::from_label(label).map(Node::KindDir),
            },
            Node::KindDir(kind) => self
                .catalog
                .get_source(*kind, name)?
                .map(|s| Node::SourceDir(*kind, s.effective_key().to_owned())),
            Node::SourceDir(_, key) => match iid_from_file_name(name) {
                Some(iid) => {
                    let member = self
                        .catalog
                        .get_item(iid)?
                        .is_some_and(|i| i.utime.is_some() && i.dname.as_deref() == Some(key.as_str()));
                    member.then(|| Node::ItemLink {
                        iid: iid.to_owned(),
                        depth: 2,
                    })
                }
                None => None,
            },
            Node::ViewsRoot => match name {
                "date_publish" => Some(Node::DateView(DateField::Publish)),
                "date_download" => Some(Node::DateView(DateField::Download)),
                _ => None,
            },
            Node::DateView(field) => self
                .catalog
                .date_buckets(field.column(), "%Y", None)?
                .into_iter()
                .find(|y| y == name)
                .map(|y| Node::Year(*field, y)),
            Node::Year(field, year) => self
                .catalog
                .date_buckets(field.column(), "%m", Some(year.as_str()))?
                .into_iter()
                .find(|m| m == name)
                .map(|m| Node::Month(*field, year.clone(), m)),
            Node::Month(field, year, month) => self
                .catalog
                .date_buckets(field.column(), "%d", Some(format!("{year}-{month}").as_str()))?
                .into_iter()
                .find(|d| d == name)
                .map(|d| Node::Day(*field, year.clone(), month.clone(), d)),
            Node::Day(..) => iid_from_file_name(name).and_then(|iid| {
                self.catalog
                    .get_item(iid)
                    .ok()
                    .flatten()
                    .filter(|i| i.utime.is_some())
                    .map(|_| Node::ItemLink {
                        iid: iid.to_owned(),
                        depth: 5,
                    })
            }),
            Node::ItemLink { .. } => None,
        };
        Ok(child)
    }
}

/// Mounts the projection and blocks until the filesystem is unmounted.
pub fn mount(
    catalog: Catalog,
    archive_root: PathBuf,
    mountpoint: &Path,
    absolute_links: bool,
) -> Result<()> {
    let fs = ArchiveFs::new(catalog, archive_root, mountpoint, absolute_links)?;
    let options = [
        MountOption::RO,
        MountOption::FSName("tubevault".to_owned()),
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}

impl Filesystem for ArchiveFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.nodes.get(&parent).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lookup_child(&parent_node, name) {
            Ok(Some(child)) => {
                let ino = self.ino_for(child);
                match self.attr_for(ino) {
                    Ok(attr) => reply.entry(&TTL, &attr, 0),
                    Err(_) => reply.error(libc::ENOENT),
                }
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr_for(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.nodes.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let children = match self.children(&node) {
            Ok(children) => children,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (ino, FileType::Directory, "..".to_owned()),
        ];
        for (child, kind, name) in children {
            let child_ino = self.ino_for(child);
            entries.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(Node::ItemLink { iid, depth }) = self.nodes.get(&ino).cloned() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.link_target(&iid, depth) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        // Purely nominal geometry; the tree is virtual and read-only.
        reply.statfs(1024, 0, 0, 1024, 0, 4096, 256, 1024);
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            reply.error(libc::EACCES);
        } else {
            reply.opened(0, 0);
        }
    }

    // Everything write-shaped is denied outright.

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EACCES);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EACCES);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EACCES);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::EACCES);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::EACCES);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EACCES);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EACCES);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EACCES);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EACCES);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EACCES);
    }
}
