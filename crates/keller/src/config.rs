//! Build-root configuration.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KellerError, KellerResult};

/// Name of the configuration file inside a build-root directory.
pub const BUILD_FILE: &str = ".buildroot.yaml";

/// `PATH` handed to the child; nothing is inherited from the caller.
pub const CHILD_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin:/usr/local/sbin:/usr/local/bin";

/// Declarative description of one chroot environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRoot {
    /// Base image id; selects `<dir>.<base>` variant directories and the
    /// outermost overlay layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    /// Extra lower directories, outer-to-inner.
    pub lower: Vec<PathBuf>,

    /// Bind mounts: chroot-relative destination to host source.
    pub binds: BTreeMap<PathBuf, PathBuf>,

    /// tmpfs mount points inside the chroot.
    pub tmpfs: Vec<PathBuf>,

    /// Mount the overlay on a fresh temporary directory instead of the
    /// build-root itself.
    pub mktemp: bool,

    /// Skip the writable upper/work pair; the overlay stays read-only.
    pub noupper: bool,

    /// Append `index=off` to the overlay options.
    pub indexoff: bool,

    /// Do not replicate `/proc`, `/sys`, `/dev`, `/dev/pts` into the
    /// environment.
    pub nosystem: bool,

    /// Run the command without chrooting; the overlay is still mounted.
    pub nochroot: bool,

    /// Enter fresh kernel namespaces; implies skipping the system
    /// filesystems, which the new namespace is expected to re-bring.
    pub newnamespace: bool,

    /// Working directory of the command inside the chroot.
    pub cwd: PathBuf,

    /// Shell candidates tried in order when no command is given. A YAML
    /// scalar is accepted as a one-element list.
    #[serde(with = "string_or_seq")]
    pub shell: Vec<String>,

    /// Executable forced ahead of the caller's arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,

    /// Arguments for `exec`, placed between it and the caller's arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Environment overlay; `+key` appends the current value, `key+`
    /// prepends it, a plain key replaces unconditionally.
    pub env: BTreeMap<String, String>,
}

impl Default for BuildRoot {
    fn default() -> Self {
        Self {
            base: None,
            lower: Vec::new(),
            binds: BTreeMap::new(),
            tmpfs: Vec::new(),
            mktemp: false,
            noupper: false,
            indexoff: false,
            nosystem: false,
            nochroot: false,
            newnamespace: false,
            cwd: PathBuf::from("/"),
            shell: vec!["/bin/sh".to_string()],
            exec: None,
            args: None,
            env: BTreeMap::new(),
        }
    }
}

impl BuildRoot {
    /// Load the configuration from one file.
    pub fn load(path: impl AsRef<Path>) -> KellerResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| KellerError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Scan `dir` for first-level subdirectories carrying a build file and
    /// index the configurations that load by subdirectory path. Entries
    /// that fail to load are skipped.
    pub fn load_all(dir: impl AsRef<Path>) -> BTreeMap<PathBuf, BuildRoot> {
        let mut found = BTreeMap::new();
        let Ok(entries) = fs::read_dir(dir) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let file = path.join(BUILD_FILE);
            if !file.is_file() {
                continue;
            }
            match Self::load(&file) {
                Ok(config) => {
                    found.insert(path, config);
                }
                Err(e) => {
                    tracing::debug!(file = %file.display(), error = %e, "Skipping build-root")
                }
            }
        }
        found
    }

    /// Build the child environment from scratch.
    ///
    /// Only `PATH`, `debian_chroot` and the keys the overlay defines reach
    /// the child; overlay lookups see the keys set by earlier entries.
    pub fn child_env(&self, original_root: &Path) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), CHILD_PATH.to_string());
        env.insert(
            "debian_chroot".to_string(),
            original_root.display().to_string(),
        );
        for (key, val) in &self.env {
            overlay_env(&mut env, key, val);
        }
        env
    }
}

/// Apply one overlay entry to an environment map.
pub fn overlay_env(env: &mut BTreeMap<String, String>, key: &str, val: &str) {
    if let Some(key) = key.strip_prefix('+') {
        let current = env.get(key).cloned().unwrap_or_default();
        let mut val = val.to_string();
        if !current.is_empty() {
            val.push(':');
            val.push_str(&current);
        }
        env.insert(key.to_string(), val);
    } else if let Some(key) = key.strip_suffix('+') {
        let mut current = env.get(key).cloned().unwrap_or_default();
        if !current.is_empty() {
            current.push(':');
        }
        current.push_str(val);
        env.insert(key.to_string(), current);
    } else {
        env.insert(key.to_string(), val.to_string());
    }
}

/// Refuse configuration files another user could have tampered with.
///
/// The file must be a regular file owned by root, not group-writable
/// unless the group is root, and never world-writable.
pub fn verify_ownership(path: &Path) -> KellerResult<()> {
    let refuse = |reason: &str| {
        Err(KellerError::Insecure {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        })
    };

    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return refuse("not a regular file");
    }
    if meta.uid() != 0 {
        return refuse("not owned by root");
    }
    let mode = meta.mode();
    if meta.gid() != 0 && mode & 0o020 != 0 {
        return refuse("group-writable by a non-root group");
    }
    if mode & 0o002 != 0 {
        return refuse("world-writable");
    }
    Ok(())
}

mod string_or_seq {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        if value.len() == 1 {
            serializer.serialize_str(&value[0])
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(shell) => vec![shell],
            OneOrMany::Many(shells) => shells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: BuildRoot = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.cwd, PathBuf::from("/"));
        assert_eq!(config.shell, vec!["/bin/sh"]);
        assert!(!config.mktemp);
        assert!(config.base.is_none());
        assert!(config.binds.is_empty());
    }

    #[test]
    fn full_schema() {
        let text = "\
base: stable
lower:
  - /img/rootfs
  - /img/tools
binds:
  /build: /srv/cache
tmpfs:
  - /tmp
mktemp: true
noupper: true
newnamespace: true
cwd: /build
shell:
  - /bin/bash
  - /bin/sh
exec: /usr/bin/make
args: [all]
env:
  +PATH: /opt/bin
  TERM: dumb
";
        let config: BuildRoot = serde_yaml::from_str(text).unwrap();
        assert_eq!(config.base.as_deref(), Some("stable"));
        assert_eq!(config.lower.len(), 2);
        assert_eq!(
            config.binds[Path::new("/build")],
            PathBuf::from("/srv/cache")
        );
        assert!(config.mktemp && config.noupper && config.newnamespace);
        assert_eq!(config.shell, vec!["/bin/bash", "/bin/sh"]);
        assert_eq!(config.exec.as_deref(), Some("/usr/bin/make"));
        assert_eq!(config.args.as_deref(), Some(&["all".to_string()][..]));
    }

    #[test]
    fn shell_scalar_becomes_list() {
        let config: BuildRoot = serde_yaml::from_str("shell: /bin/dash").unwrap();
        assert_eq!(config.shell, vec!["/bin/dash"]);
    }

    #[test]
    fn single_shell_serializes_as_scalar() {
        let config = BuildRoot::default();
        let text = serde_yaml::to_string(&config).unwrap();
        assert!(text.contains("shell: /bin/sh"));
    }

    #[test]
    fn overlay_prefix_appends_existing() {
        let mut env = BTreeMap::from([("K".to_string(), "old".to_string())]);
        overlay_env(&mut env, "+K", "new");
        assert_eq!(env["K"], "new:old");
    }

    #[test]
    fn overlay_suffix_prepends_existing() {
        let mut env = BTreeMap::from([("K".to_string(), "old".to_string())]);
        overlay_env(&mut env, "K+", "new");
        assert_eq!(env["K"], "old:new");
    }

    #[test]
    fn overlay_plain_replaces() {
        let mut env = BTreeMap::from([("K".to_string(), "old".to_string())]);
        overlay_env(&mut env, "K", "new");
        assert_eq!(env["K"], "new");
    }

    #[test]
    fn overlay_with_empty_existing_sets_bare_value() {
        let mut env = BTreeMap::new();
        overlay_env(&mut env, "+K", "new");
        assert_eq!(env["K"], "new");
        overlay_env(&mut env, "L+", "new");
        assert_eq!(env["L"], "new");
    }

    #[test]
    fn child_env_is_reconstructed() {
        let mut config = BuildRoot::default();
        config
            .env
            .insert("+PATH".to_string(), "/opt/bin".to_string());
        let env = config.child_env(Path::new("/srv/build"));
        assert_eq!(env["PATH"], format!("/opt/bin:{CHILD_PATH}"));
        assert_eq!(env["debian_chroot"], "/srv/build");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn ownership_refuses_non_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_ownership(dir.path()).unwrap_err();
        assert!(matches!(err, KellerError::Insecure { .. }));
    }

    #[test]
    fn ownership_refuses_loose_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(BUILD_FILE);
        fs::write(&file, "{}\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();
        // Refused as world-writable when running as root, as non-root-owned
        // otherwise.
        assert!(verify_ownership(&file).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(verify_ownership(Path::new("/nonexistent/.buildroot.yaml")).is_err());
    }
}
