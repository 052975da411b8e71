//! File attributes as carried by the SFTP protocol.

use bitflags::bitflags;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

bitflags! {
    /// Which attribute fields are valid, per the wire encoding.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AttrFlags: u32 {
        const SIZE = 0x0000_0001;
        const UIDGID = 0x0000_0002;
        const PERMISSIONS = 0x0000_0004;
        const ACMODTIME = 0x0000_0008;
    }
}

/// Attributes of a remote file, as reported by stat or a directory listing.
///
/// Fields are only meaningful when the corresponding [`AttrFlags`] bit is
/// set; absent fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub flags: AttrFlags,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u32,
    pub atime: u64,
    pub mtime: u64,
}

impl FileAttributes {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(AttrFlags::PERMISSIONS) && self.permissions & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.flags.contains(AttrFlags::PERMISSIONS) && self.permissions & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.flags.contains(AttrFlags::PERMISSIONS) && self.permissions & S_IFMT == S_IFLNK
    }
}

/// Attribute changes to apply with setstat. Each field is applied only
/// when present, so callers state exactly what they want touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetStat {
    pub permissions: Option<u32>,
    pub owner: Option<(u32, u32)>,
    pub times: Option<(u64, u64)>,
}

impl SetStat {
    pub fn new() -> Self {
        SetStat::default()
    }

    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    pub fn times(mut self, atime: u64, mtime: u64) -> Self {
        self.times = Some((atime, mtime));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_none() && self.owner.is_none() && self.times.is_none()
    }
}

impl From<FileAttributes> for SetStat {
    /// Carry over whichever fields the attributes declare valid.
    fn from(attrs: FileAttributes) -> Self {
        let mut stat = SetStat::new();
        if attrs.flags.contains(AttrFlags::PERMISSIONS) {
            stat.permissions = Some(attrs.permissions);
        }
        if attrs.flags.contains(AttrFlags::UIDGID) {
            stat.owner = Some((attrs.uid, attrs.gid));
        }
        if attrs.flags.contains(AttrFlags::ACMODTIME) {
            stat.times = Some((attrs.atime, attrs.mtime));
        }
        stat
    }
}
