//! `STAT:` and `TSTAMP:` attribute lines.

use super::item::StatInfo;

/// Fields of a `STAT:` line as sent by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub type_char: char,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub link_fi: Option<i32>,
}

/// Parse `STAT:<t> <size> <uid> <gid> <octal-mode> <nlink> [<linkfi>]`.
///
/// Returns `None` unless at least the first six fields are present and
/// well formed. Fields after the first bad one are ignored.
pub fn parse_stat(cmd: &str) -> Option<StatRecord> {
    let rest = cmd.strip_prefix("STAT:")?;
    let mut fields = rest.split_whitespace();

    let mut type_field = fields.next()?.chars();
    let type_char = type_field.next()?;
    if type_field.next().is_some() {
        return None;
    }
    let size = fields.next()?.parse().ok()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let mode = u32::from_str_radix(fields.next()?, 8).ok()?;
    let nlink = fields.next()?.parse().ok()?;
    let link_fi = fields.next().and_then(|f| f.parse().ok());

    Some(StatRecord {
        type_char,
        size,
        uid,
        gid,
        mode,
        nlink,
        link_fi,
    })
}

/// Parse `TSTAMP:<atime> <mtime> <ctime>`.
pub fn parse_tstamp(cmd: &str) -> Option<(i64, i64, i64)> {
    let mut fields = cmd.strip_prefix("TSTAMP:")?.split_whitespace();
    let atime = fields.next()?.parse().ok()?;
    let mtime = fields.next()?.parse().ok()?;
    let ctime = fields.next()?.parse().ok()?;
    Some((atime, mtime, ctime))
}

/// `STAT:` line sent to a backend when creating a file during restore.
pub fn render_stat(stat: &StatInfo) -> String {
    format!(
        "STAT:{} {} {} {} {:06o} {} {}\n",
        stat.file_type.as_char(),
        stat.size,
        stat.uid,
        stat.gid,
        stat.mode,
        stat.nlink,
        stat.link_fi
    )
}

/// `TSTAMP:` line, omitted when every stamp is zero.
pub fn render_tstamp(stat: &StatInfo) -> Option<String> {
    if stat.atime == 0 && stat.mtime == 0 && stat.ctime == 0 {
        return None;
    }
    Some(format!(
        "TSTAMP:{} {} {}\n",
        stat.atime, stat.mtime, stat.ctime
    ))
}
