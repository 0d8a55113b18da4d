//! Overlay assembly: lower-dir composition and mount options.

use std::ffi::{CString, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildRoot;
use crate::error::{KellerError, KellerResult};

/// Append a literal suffix to a path, `"/srv/build"` + `".upper"` giving
/// `"/srv/build.upper"`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut joined = OsString::from(path.as_os_str());
    joined.push(suffix);
    PathBuf::from(joined)
}

/// Compose the `lowerdir=` payload for a build-root.
///
/// The base image, when it names a directory, becomes the outermost layer.
/// The list is walked inner-to-outer so overlay priority grows outward;
/// each entry is replaced by its `<dir>.<base>` variant when that
/// directory exists, and entries that resolve to no existing directory are
/// silently dropped.
pub fn lower_dirs(config: &BuildRoot) -> String {
    let mut layers = config.lower.clone();
    if let Some(base) = &config.base {
        if Path::new(base).is_dir() {
            layers.insert(0, PathBuf::from(base));
        }
    }

    let mut resolved = Vec::new();
    for layer in layers.iter().rev() {
        let mut layer = layer.clone();
        if let Some(base) = &config.base {
            let variant = with_suffix(&layer, &format!(".{base}"));
            if variant.is_dir() {
                layer = variant;
            }
        }
        if layer.is_dir() {
            resolved.push(layer.display().to_string());
        }
    }
    resolved.join(":")
}

/// The writable layer of an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperPair {
    /// The `upperdir`.
    pub upper: PathBuf,
    /// The `workdir`.
    pub work: PathBuf,
}

impl UpperPair {
    /// Derive the upper/work pair for a build-root, variant-suffixed when
    /// a base is set: `<root>.upper[.<base>]` and `<root>.work[.<base>]`.
    pub fn for_build_root(original_root: &Path, base: Option<&str>) -> Self {
        let derive = |tag: &str| {
            let mut path = with_suffix(original_root, tag);
            if let Some(base) = base {
                path = with_suffix(&path, &format!(".{base}"));
            }
            path
        };
        Self {
            upper: derive(".upper"),
            work: derive(".work"),
        }
    }

    /// Create the pair's directories when missing.
    pub fn create_dirs(&self) -> KellerResult<()> {
        for dir in [&self.upper, &self.work] {
            if !dir.is_dir() {
                fs::create_dir(dir)?;
            }
        }
        Ok(())
    }

    /// The option fragment whose presence in an existing mount's options
    /// marks the pair as already taken.
    pub fn options_fragment(&self) -> String {
        format!(
            ",upperdir={},workdir={}",
            self.upper.display(),
            self.work.display()
        )
    }
}

/// A composed overlay mount for one build-root.
#[derive(Debug, Clone)]
pub struct Overlay {
    /// Mount source: the original build-root path.
    pub source: PathBuf,
    /// Mount target: the effective root.
    pub target: PathBuf,
    /// `lowerdir=` payload.
    pub lower: String,
    /// Writable upper/work pair; absent under `noupper`.
    pub upper: Option<UpperPair>,
    /// Whether `index=off` is appended.
    pub index_off: bool,
}

impl Overlay {
    /// Render the full overlay option string.
    pub fn options(&self) -> String {
        let mut options = format!("lowerdir={}", self.lower);
        if let Some(upper) = &self.upper {
            options.push_str(&upper.options_fragment());
        }
        if self.index_off {
            options.push_str(",index=off");
        }
        options
    }

    /// Mount the overlay on its target.
    pub fn mount(&self) -> KellerResult<()> {
        use rustix::mount::{mount, MountFlags};

        let options = self.options();
        tracing::debug!(
            source = %self.source.display(),
            target = %self.target.display(),
            options = %options,
            "Mounting overlay"
        );

        let fstype = CString::new("overlay").unwrap();
        let data = CString::new(options).map_err(|_| KellerError::Config {
            message: "overlay options contain a NUL byte".to_string(),
        })?;
        mount(
            &self.source,
            &self.target,
            fstype.as_c_str(),
            MountFlags::empty(),
            data.as_c_str(),
        )
        .map_err(|e| KellerError::Mount {
            target: self.target.clone(),
            source: e.into(),
        })
    }
}
