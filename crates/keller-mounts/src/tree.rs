//! Mount tree (`/proc/self/mountinfo`).
//!
//! mountinfo records carry a parent id, which lets the table be linked
//! into a tree. Each node owns its children; there are no back references.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::hash::Hash;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One node of the mount tree, owning its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountNode {
    /// Unique id of this mount.
    pub id: u64,
    /// Id of the parent mount.
    pub parent_id: u64,
    /// `major:minor` of the backing device.
    pub major_minor: String,
    /// Root of the mount within its source filesystem.
    pub root: PathBuf,
    /// Mount point relative to the process root.
    pub mount_point: PathBuf,
    /// Per-mount options.
    pub options: String,
    /// Optional fields before the separator; a tag without a colon maps to
    /// an empty value.
    pub optional_fields: BTreeMap<String, String>,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem source.
    pub source: String,
    /// Per-superblock options.
    pub super_options: String,
    /// Child mounts, in table order.
    pub children: Vec<MountNode>,
}

impl MountNode {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let id = fields.next()?.parse().ok()?;
        let parent_id = fields.next()?.parse().ok()?;
        let major_minor = fields.next()?.to_string();
        let root = PathBuf::from(fields.next()?);
        let mount_point = PathBuf::from(fields.next()?);
        let options = fields.next()?.to_string();

        let mut optional_fields = BTreeMap::new();
        loop {
            let field = fields.next()?;
            if field == "-" {
                break;
            }
            match field.split_once(':') {
                Some((tag, value)) => optional_fields.insert(tag.to_string(), value.to_string()),
                None => optional_fields.insert(field.to_string(), String::new()),
            };
        }

        Some(MountNode {
            id,
            parent_id,
            major_minor,
            root,
            mount_point,
            options,
            optional_fields,
            fstype: fields.next()?.to_string(),
            source: fields.next()?.to_string(),
            super_options: fields.next()?.to_string(),
            children: Vec::new(),
        })
    }

    /// Descendants of this node in pre-order, excluding the node itself.
    pub fn descendants(&self) -> Vec<&MountNode> {
        let mut nodes = Vec::new();
        for child in &self.children {
            nodes.push(child);
            nodes.extend(child.descendants());
        }
        nodes
    }

    /// First node in this subtree (pre-order, including the node itself)
    /// mounted at `point`.
    pub fn find_mount_point(&self, point: &Path) -> Option<&MountNode> {
        if self.mount_point == point {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find_mount_point(point))
    }

    /// Index all descendants by a key projection. Later nodes win on
    /// duplicate keys.
    pub fn index_by<K, F>(&self, mut key: F) -> HashMap<K, &MountNode>
    where
        K: Eq + Hash,
        F: FnMut(&MountNode) -> K,
    {
        let mut index = HashMap::new();
        for node in self.descendants() {
            index.insert(key(node), node);
        }
        index
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(
            f,
            "{:indent$}id: {} parent: {} major_minor: {} root: {} mount_point: {} \
             options: {} fstype: {} source: {} super_options: {}",
            "",
            self.id,
            self.parent_id,
            self.major_minor,
            self.root.display(),
            self.mount_point.display(),
            self.options,
            self.fstype,
            self.source,
            self.super_options,
            indent = depth * 2,
        )?;
        for child in &self.children {
            writeln!(f)?;
            child.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for MountNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// A parsed mount tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTree {
    /// Root node; absent when the table held no records.
    pub root: Option<MountNode>,
}

impl MountTree {
    /// Read `/proc/self/mountinfo`.
    pub fn read() -> io::Result<Self> {
        Self::read_from("/proc/self/mountinfo")
    }

    /// Read the mount tree of another process.
    pub fn read_pid(pid: i32) -> io::Result<Self> {
        Self::read_from(format!("/proc/{pid}/mountinfo"))
    }

    /// Read a mount tree from `path`.
    pub fn read_from(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::parse(BufReader::new(file)))
    }

    /// Parse mountinfo records and link them into a tree.
    ///
    /// A malformed record terminates parsing silently. The root is the
    /// record whose parent id does not appear in the table; when several
    /// such records exist the first is kept and a diagnostic is logged.
    pub fn parse(reader: impl BufRead) -> Self {
        let mut records = Vec::new();
        for line in reader.lines() {
            let Ok(line) = line else { break };
            match MountNode::parse(&line) {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Self::link(records)
    }

    /// First node mounted at `point`, if the tree has a root.
    pub fn find_mount_point(&self, point: &Path) -> Option<&MountNode> {
        self.root.as_ref()?.find_mount_point(point)
    }

    fn link(records: Vec<MountNode>) -> Self {
        let ids: HashSet<u64> = records.iter().map(|r| r.id).collect();

        let mut root_index: Option<usize> = None;
        let mut children_of: HashMap<u64, Vec<usize>> = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            if record.parent_id != record.id && ids.contains(&record.parent_id) {
                children_of.entry(record.parent_id).or_default().push(index);
            } else if let Some(kept) = root_index {
                let kept_id: u64 = records[kept].id;
                tracing::warn!(
                    kept = kept_id,
                    dropped = record.id,
                    "Multiple mount-tree roots; keeping the first"
                );
            } else {
                root_index = Some(index);
            }
        }

        let mut slots: Vec<Option<MountNode>> = records.into_iter().map(Some).collect();
        let root = root_index.map(|index| Self::take(index, &mut slots, &children_of));
        if root.is_none() && !slots.is_empty() {
            tracing::warn!("Mount table has records but no root");
        }
        MountTree { root }
    }

    fn take(
        index: usize,
        slots: &mut Vec<Option<MountNode>>,
        children_of: &HashMap<u64, Vec<usize>>,
    ) -> MountNode {
        let mut node = slots[index].take().expect("each record is taken once");
        if let Some(child_indices) = children_of.get(&node.id) {
            for &child in child_indices {
                node.children.push(Self::take(child, slots, children_of));
            }
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec shared:12 - proc proc rw
24 22 0:22 / /sys rw,nosuid shared:7 - sysfs sysfs rw
25 24 0:23 / /sys/fs/cgroup rw shared:8 master:1 unbindable - cgroup2 cgroup2 nsdelegate
26 22 0:24 / /srv/build rw - overlay /srv/build rw,lowerdir=/img/a
27 26 0:25 / /srv/build/proc rw - proc proc rw
";

    fn sample_tree() -> MountTree {
        MountTree::parse(SAMPLE.as_bytes())
    }

    #[test]
    fn links_records_into_a_tree() {
        let tree = sample_tree();
        let root = tree.root.expect("sample has a root");
        assert_eq!(root.id, 22);
        assert_eq!(root.children.len(), 3);
        assert_eq!(root.children[1].mount_point, PathBuf::from("/sys"));
        assert_eq!(root.children[1].children[0].id, 25);
    }

    #[test]
    fn optional_fields_until_separator() {
        let tree = sample_tree();
        let cgroup = tree
            .find_mount_point(Path::new("/sys/fs/cgroup"))
            .expect("cgroup mount present");
        assert_eq!(cgroup.optional_fields["shared"], "8");
        assert_eq!(cgroup.optional_fields["master"], "1");
        assert_eq!(cgroup.optional_fields["unbindable"], "");
        assert_eq!(cgroup.fstype, "cgroup2");
        assert_eq!(cgroup.super_options, "nsdelegate");
    }

    #[test]
    fn descendants_are_pre_order() {
        let tree = sample_tree();
        let root = tree.root.expect("sample has a root");
        let order: Vec<u64> = root.descendants().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![23, 24, 25, 26, 27]);
    }

    #[test]
    fn find_first_by_mount_point() {
        let tree = sample_tree();
        let build = tree
            .find_mount_point(Path::new("/srv/build"))
            .expect("build mount present");
        assert_eq!(build.id, 26);
        assert_eq!(build.children.len(), 1);
        assert!(tree.find_mount_point(Path::new("/srv/other")).is_none());
    }

    #[test]
    fn index_descendants_by_projection() {
        let tree = sample_tree();
        let root = tree.root.expect("sample has a root");
        let by_point = root.index_by(|n| n.mount_point.clone());
        assert_eq!(by_point.len(), 5);
        assert_eq!(by_point[Path::new("/proc")].id, 23);
    }

    #[test]
    fn first_of_multiple_roots_is_kept() {
        let text = "\
22 1 8:1 / / rw - ext4 /dev/sda1 rw
30 9 8:2 / /mnt rw - ext4 /dev/sdb1 rw
";
        let tree = MountTree::parse(text.as_bytes());
        assert_eq!(tree.root.expect("first root kept").id, 22);
    }

    #[test]
    fn malformed_tail_stops_silently() {
        let text = format!("{SAMPLE}not a mountinfo line\n");
        let tree = MountTree::parse(text.as_bytes());
        assert_eq!(tree.root.expect("root kept").descendants().len(), 5);

        let tree = MountTree::parse("".as_bytes());
        assert!(tree.root.is_none());
    }

    #[test]
    fn display_indents_children() {
        let tree = sample_tree();
        let build = tree
            .find_mount_point(Path::new("/srv/build"))
            .expect("build mount present");
        let rendered = build.to_string();
        assert!(rendered.starts_with("id: 26"));
        assert!(rendered.contains("\n  id: 27"));
    }
}
