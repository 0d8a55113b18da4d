//! Flat mount table (`/proc/self/mounts`).

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One record of the flat mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Filesystem source: a device path or a pseudo-filesystem name.
    pub source: String,
    /// Directory the filesystem is mounted on.
    pub dir: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Comma-separated mount options.
    pub options: String,
    /// Dump frequency.
    pub freq: u32,
    /// fsck pass number.
    pub passno: u32,
}

impl MountEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let entry = MountEntry {
            source: fields.next()?.to_string(),
            dir: PathBuf::from(fields.next()?),
            fstype: fields.next()?.to_string(),
            options: fields.next()?.to_string(),
            freq: fields.next()?.parse().ok()?,
            passno: fields.next()?.parse().ok()?,
        };
        Some(entry)
    }
}

/// Read `/proc/self/mounts`.
pub fn read() -> io::Result<Vec<MountEntry>> {
    read_from("/proc/self/mounts")
}

/// Read a flat mount table from `path`.
pub fn read_from(path: impl AsRef<Path>) -> io::Result<Vec<MountEntry>> {
    let file = File::open(path)?;
    Ok(parse(BufReader::new(file)))
}

/// Parse flat records until end of stream.
///
/// A malformed record terminates parsing silently; everything parsed up to
/// that point is returned.
pub fn parse(reader: impl BufRead) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        match MountEntry::parse(&line) {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }
    entries
}

/// Index entries by a key projection. Later entries win on duplicate keys,
/// matching the table's own top-to-bottom mount order.
pub fn index_by<K, F>(entries: &[MountEntry], mut key: F) -> HashMap<K, &MountEntry>
where
    K: Eq + Hash,
    F: FnMut(&MountEntry) -> K,
{
    let mut index = HashMap::new();
    for entry in entries {
        index.insert(key(entry), entry);
    }
    index
}

/// Whether any entry satisfies the predicate.
pub fn any<F>(entries: &[MountEntry], mut pred: F) -> bool
where
    F: FnMut(&MountEntry) -> bool,
{
    entries.iter().any(|entry| pred(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 1
overlay /srv/build overlay rw,lowerdir=/img/a:/img/b,upperdir=/srv/build.upper,workdir=/srv/build.work 0 0
";

    #[test]
    fn parses_whitespace_separated_records() {
        let entries = parse(SAMPLE.as_bytes());
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].source, "proc");
        assert_eq!(entries[0].dir, PathBuf::from("/proc"));
        assert_eq!(entries[2].fstype, "ext4");
        assert_eq!(entries[2].passno, 1);
    }

    #[test]
    fn malformed_tail_stops_silently() {
        let text = format!("{SAMPLE}garbage line without enough fields\n");
        let entries = parse(text.as_bytes());
        assert_eq!(entries.len(), 4);

        let entries = parse("proc /proc proc rw zero zero\n".as_bytes());
        assert!(entries.is_empty());
    }

    #[test]
    fn index_last_wins() {
        let text = "\
tmpfs /mnt tmpfs rw 0 0
/dev/sdb1 /mnt ext4 ro 0 0
";
        let entries = parse(text.as_bytes());
        let by_dir = index_by(&entries, |m| m.dir.clone());
        assert_eq!(by_dir.len(), 1);
        assert_eq!(by_dir[Path::new("/mnt")].fstype, "ext4");
    }

    #[test]
    fn any_matches_predicate() {
        let entries = parse(SAMPLE.as_bytes());
        assert!(any(&entries, |m| m.dir == Path::new("/srv/build")));
        assert!(any(&entries, |m| m.options.contains("upperdir=/srv/build.upper")));
        assert!(!any(&entries, |m| m.dir == Path::new("/srv/other")));
    }
}
