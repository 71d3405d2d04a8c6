//! Items exchanged with the host during backup and restore.

use bytes::Bytes;

/// File type carried by a `STAT:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    /// `F`
    #[default]
    Regular,
    /// `E`, regular file without data.
    RegularEmpty,
    /// `D`
    Directory,
    /// `S`, needs an `LSTAT:` target.
    Symlink,
    /// `L`, hard link to an already saved file.
    HardLinkSaved,
}

impl FileType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'F' => Some(FileType::Regular),
            'E' => Some(FileType::RegularEmpty),
            'D' => Some(FileType::Directory),
            'S' => Some(FileType::Symlink),
            'L' => Some(FileType::HardLinkSaved),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            FileType::Regular => 'F',
            FileType::RegularEmpty => 'E',
            FileType::Directory => 'D',
            FileType::Symlink => 'S',
            FileType::HardLinkSaved => 'L',
        }
    }
}

/// Stat fields of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatInfo {
    pub file_type: FileType,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    /// File index of the saved original, for hard links.
    pub link_fi: i32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Metadata of one file-like item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemMetadata {
    pub path: String,
    /// Symlink target; for directories the directory path itself.
    pub link_target: Option<String>,
    pub stat: StatInfo,
    /// Delta sequence number; backends always report 0.
    pub delta_seq: u32,
    /// An ACL blob came with this item, see `take_acl`.
    pub has_acl: bool,
    /// An XATTR blob came with this item, see `take_xattr`.
    pub has_xattr: bool,
    /// `METADATA_STREAM` payloads, in arrival order.
    pub metadata: Vec<Bytes>,
}

impl ItemMetadata {
    pub fn new(path: impl Into<String>, stat: StatInfo) -> Self {
        Self {
            path: path.into(),
            stat,
            ..Default::default()
        }
    }
}

/// Backend-defined object saved alongside files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginObject {
    pub path: String,
    pub category: Option<String>,
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub source: Option<String>,
    pub uuid: Option<String>,
    pub size: u64,
}

/// Plugin configuration snapshot saved during backup and handed back
/// before a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreObject {
    /// Plugin command the object belongs to.
    pub command: String,
    pub name: String,
    pub data: String,
}

/// One item produced by the backup loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupItem {
    RestoreObject(RestoreObject),
    File(ItemMetadata),
    PluginObject(PluginObject),
}

impl BackupItem {
    pub fn path(&self) -> &str {
        match self {
            BackupItem::RestoreObject(o) => &o.name,
            BackupItem::File(m) => &m.path,
            BackupItem::PluginObject(o) => &o.path,
        }
    }
}
