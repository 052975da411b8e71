//! In-memory filesystem behind the memory engine's SFTP and SCP sides.
//!
//! Paths are stored normalized and absolute; a node is a file, a directory
//! or a symlink. Failures are reported as SFTP status codes, delivered to
//! the session layer through the engine's last-status channel.

use std::collections::HashMap;

use crate::error::SftpStatus;
use crate::sftp::attrs::{AttrFlags, FileAttributes, SetStat, S_IFDIR, S_IFLNK, S_IFREG};
use crate::sftp::OpenFlags;

const SYMLINK_HOPS: usize = 32;

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) atime: u64,
    pub(crate) mtime: u64,
}

/// Lexically normalize a path: absolute, no empty or dot segments.
pub(crate) fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub(crate) fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path.get(..idx).unwrap_or("/").to_string(),
    }
}

fn leaf_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn make_node(now: u64, kind: NodeKind, mode: u32) -> Node {
    Node {
        kind,
        mode: mode & 0o7777,
        uid: 1000,
        gid: 1000,
        atime: now,
        mtime: now,
    }
}

pub(crate) struct MemFs {
    nodes: HashMap<String, Node>,
    clock: u64,
}

impl MemFs {
    pub(crate) fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                kind: NodeKind::Dir,
                mode: 0o755,
                uid: 0,
                gid: 0,
                atime: 1_700_000_000,
                mtime: 1_700_000_000,
            },
        );
        MemFs {
            nodes,
            clock: 1_700_000_000,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn dir_exists(&self, path: &str) -> bool {
        matches!(
            self.nodes.get(path).map(|n| &n.kind),
            Some(NodeKind::Dir)
        )
    }

    /// Chase the symlink chain of the final component.
    pub(crate) fn resolve(&self, path: &str) -> Result<String, u32> {
        let mut key = normalize(path);
        for _ in 0..SYMLINK_HOPS {
            match self.nodes.get(&key) {
                Some(Node {
                    kind: NodeKind::Symlink(target),
                    ..
                }) => {
                    key = if target.starts_with('/') {
                        normalize(target)
                    } else {
                        normalize(&format!("{}/{}", parent_of(&key), target))
                    };
                }
                _ => return Ok(key),
            }
        }
        Err(SftpStatus::LinkLoop.code())
    }

    fn attrs_for(node: &Node) -> FileAttributes {
        let (type_bits, size) = match &node.kind {
            NodeKind::File(data) => (S_IFREG, data.len() as u64),
            NodeKind::Dir => (S_IFDIR, 0),
            NodeKind::Symlink(target) => (S_IFLNK, target.len() as u64),
        };
        FileAttributes {
            flags: AttrFlags::SIZE
                | AttrFlags::UIDGID
                | AttrFlags::PERMISSIONS
                | AttrFlags::ACMODTIME,
            size,
            uid: node.uid,
            gid: node.gid,
            permissions: type_bits | node.mode,
            atime: node.atime,
            mtime: node.mtime,
        }
    }

    pub(crate) fn stat(&self, path: &str, follow: bool) -> Result<FileAttributes, u32> {
        let key = if follow {
            self.resolve(path)?
        } else {
            normalize(path)
        };
        self.nodes
            .get(&key)
            .map(Self::attrs_for)
            .ok_or(SftpStatus::NoSuchFile.code())
    }

    /// Open a file, creating or truncating per the flags. Returns the
    /// resolved key the handle will operate on.
    pub(crate) fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<String, u32> {
        let key = match self.resolve(path) {
            Ok(key) => key,
            Err(code) => return Err(code),
        };
        match self.nodes.get(&key).map(|n| &n.kind) {
            Some(NodeKind::Dir) => Err(SftpStatus::Failure.code()),
            Some(_) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(SftpStatus::FileAlreadyExists.code());
                }
                if flags.contains(OpenFlags::TRUNCATE) {
                    let now = self.tick();
                    if let Some(node) = self.nodes.get_mut(&key) {
                        if let NodeKind::File(data) = &mut node.kind {
                            data.clear();
                        }
                        node.mtime = now;
                    }
                }
                Ok(key)
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(SftpStatus::NoSuchFile.code());
                }
                if !self.dir_exists(&parent_of(&key)) {
                    return Err(SftpStatus::NoSuchFile.code());
                }
                let now = self.tick();
                let node = make_node(now, NodeKind::File(Vec::new()), mode);
                self.nodes.insert(key.clone(), node);
                Ok(key)
            }
        }
    }

    pub(crate) fn len(&self, key: &str) -> u64 {
        match self.nodes.get(key).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => data.len() as u64,
            _ => 0,
        }
    }

    pub(crate) fn read(&self, key: &str, offset: u64, max: usize) -> Vec<u8> {
        let Some(Node {
            kind: NodeKind::File(data),
            ..
        }) = self.nodes.get(key)
        else {
            return Vec::new();
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(max).min(data.len());
        data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Write at an absolute offset, zero-filling any gap before it.
    pub(crate) fn write(&mut self, key: &str, offset: u64, bytes: &[u8]) {
        let now = self.tick();
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        let NodeKind::File(data) = &mut node.kind else {
            return;
        };
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        if data.len() < offset {
            data.resize(offset, 0);
        }
        let end = offset.saturating_add(bytes.len());
        if end <= data.len() {
            if let Some(slice) = data.get_mut(offset..end) {
                slice.copy_from_slice(bytes);
            }
        } else {
            data.truncate(offset);
            data.extend_from_slice(bytes);
        }
        node.mtime = now;
    }

    pub(crate) fn unlink(&mut self, path: &str) -> Result<(), u32> {
        let key = normalize(path);
        match self.nodes.get(&key).map(|n| &n.kind) {
            None => Err(SftpStatus::NoSuchFile.code()),
            Some(NodeKind::Dir) => Err(SftpStatus::Failure.code()),
            Some(_) => {
                self.nodes.remove(&key);
                Ok(())
            }
        }
    }

    pub(crate) fn rmdir(&mut self, path: &str) -> Result<(), u32> {
        let key = normalize(path);
        match self.nodes.get(&key).map(|n| &n.kind) {
            None => Err(SftpStatus::NoSuchFile.code()),
            Some(NodeKind::Dir) => {
                let prefix = format!("{key}/");
                if self.nodes.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(SftpStatus::DirNotEmpty.code());
                }
                self.nodes.remove(&key);
                Ok(())
            }
            Some(_) => Err(SftpStatus::NotADirectory.code()),
        }
    }

    pub(crate) fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), u32> {
        let key = normalize(path);
        if self.nodes.contains_key(&key) {
            return Err(SftpStatus::FileAlreadyExists.code());
        }
        if !self.dir_exists(&parent_of(&key)) {
            return Err(SftpStatus::NoSuchFile.code());
        }
        let now = self.tick();
        let node = make_node(now, NodeKind::Dir, mode);
        self.nodes.insert(key, node);
        Ok(())
    }

    pub(crate) fn rename(&mut self, src: &str, dst: &str) -> Result<(), u32> {
        let src = normalize(src);
        let dst = normalize(dst);
        if !self.nodes.contains_key(&src) {
            return Err(SftpStatus::NoSuchFile.code());
        }
        if self.nodes.contains_key(&dst) {
            return Err(SftpStatus::FileAlreadyExists.code());
        }
        if !self.dir_exists(&parent_of(&dst)) {
            return Err(SftpStatus::NoSuchFile.code());
        }
        let prefix = format!("{src}/");
        let children: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in children {
            if let Some(node) = self.nodes.remove(&key) {
                let suffix = key.get(src.len()..).unwrap_or("");
                self.nodes.insert(format!("{dst}{suffix}"), node);
            }
        }
        if let Some(node) = self.nodes.remove(&src) {
            self.nodes.insert(dst, node);
        }
        Ok(())
    }

    pub(crate) fn symlink(&mut self, target: &str, link: &str) -> Result<(), u32> {
        let key = normalize(link);
        if self.nodes.contains_key(&key) {
            return Err(SftpStatus::FileAlreadyExists.code());
        }
        if !self.dir_exists(&parent_of(&key)) {
            return Err(SftpStatus::NoSuchFile.code());
        }
        let now = self.tick();
        let node = make_node(now, NodeKind::Symlink(target.to_string()), 0o777);
        self.nodes.insert(key, node);
        Ok(())
    }

    pub(crate) fn readlink(&self, path: &str) -> Result<String, u32> {
        let key = normalize(path);
        match self.nodes.get(&key).map(|n| &n.kind) {
            None => Err(SftpStatus::NoSuchFile.code()),
            Some(NodeKind::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(SftpStatus::Failure.code()),
        }
    }

    /// Canonicalize a path. Symlinks are chased when the nodes exist;
    /// otherwise the result is the lexical normalization, so the call
    /// works for paths that do not exist yet.
    pub(crate) fn realpath(&self, path: &str) -> Result<String, u32> {
        self.resolve(path)
    }

    pub(crate) fn setstat(&mut self, path: &str, stat: &SetStat) -> Result<(), u32> {
        let key = self.resolve(path)?;
        let Some(node) = self.nodes.get_mut(&key) else {
            return Err(SftpStatus::NoSuchFile.code());
        };
        if let Some(permissions) = stat.permissions {
            node.mode = permissions & 0o7777;
        }
        if let Some((uid, gid)) = stat.owner {
            node.uid = uid;
            node.gid = gid;
        }
        if let Some((atime, mtime)) = stat.times {
            node.atime = atime;
            node.mtime = mtime;
        }
        Ok(())
    }

    /// Snapshot a directory listing: `.` and `..` first, then the
    /// children sorted by name.
    pub(crate) fn readdir_snapshot(
        &self,
        path: &str,
    ) -> Result<Vec<(String, FileAttributes)>, u32> {
        let key = self.resolve(path)?;
        let dir = match self.nodes.get(&key) {
            None => return Err(SftpStatus::NoSuchFile.code()),
            Some(node @ Node { kind: NodeKind::Dir, .. }) => node,
            Some(_) => return Err(SftpStatus::NotADirectory.code()),
        };
        let dir_attrs = Self::attrs_for(dir);
        let mut entries = vec![(".".to_string(), dir_attrs), ("..".to_string(), dir_attrs)];
        let prefix = if key == "/" { String::new() } else { key.clone() };
        let mut children: Vec<(String, FileAttributes)> = self
            .nodes
            .iter()
            .filter(|(k, _)| {
                k.starts_with(&format!("{prefix}/"))
                    && !k
                        .get(prefix.len() + 1..)
                        .unwrap_or("")
                        .contains('/')
            })
            .map(|(k, node)| (leaf_of(k).to_string(), Self::attrs_for(node)))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        entries.extend(children);
        Ok(entries)
    }

    /// Create a file, making intermediate directories as needed. Test
    /// setup only; failures cannot happen.
    pub(crate) fn add_file(&mut self, path: &str, data: &[u8], mode: u32) {
        let key = normalize(path);
        self.ensure_dirs(&parent_of(&key));
        let now = self.tick();
        let node = make_node(now, NodeKind::File(data.to_vec()), mode);
        self.nodes.insert(key, node);
    }

    pub(crate) fn add_dir(&mut self, path: &str) {
        let key = normalize(path);
        self.ensure_dirs(&key);
    }

    pub(crate) fn add_symlink(&mut self, target: &str, link: &str) {
        let key = normalize(link);
        self.ensure_dirs(&parent_of(&key));
        let now = self.tick();
        let node = make_node(now, NodeKind::Symlink(target.to_string()), 0o777);
        self.nodes.insert(key, node);
    }

    fn ensure_dirs(&mut self, path: &str) {
        let key = normalize(path);
        if key != "/" {
            self.ensure_dirs(&parent_of(&key));
        }
        if !self.nodes.contains_key(&key) {
            let now = self.tick();
            let node = make_node(now, NodeKind::Dir, 0o755);
            self.nodes.insert(key, node);
        }
    }

    pub(crate) fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let key = self.resolve(path).ok()?;
        match self.nodes.get(&key).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => Some(data.clone()),
            _ => None,
        }
    }
}
