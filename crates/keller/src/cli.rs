//! CLI definition and the manager entry.

use std::env;
use std::path::{Component, Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result};
use tracing::info;

use crate::config::{self, BuildRoot};
use crate::runtime::{self, Stage, State};
use crate::supervisor;

/// Exit code of `--print`.
const PRINT_EXIT: i32 = 99;

/// chroot virtual-environment manager.
///
/// Mounts an overlay over the named build-root, attaches system
/// filesystems, binds and tmpfs per its `.buildroot.yaml`, runs the given
/// command (or a shell) inside, and tears everything down afterwards.
#[derive(Debug, Parser)]
#[command(name = "keller", version, about)]
pub struct Cli {
    /// Keep a file descriptor open across exec (repeatable)
    #[arg(short = 'f', long = "keepfd", value_name = "FD")]
    pub keepfd: Vec<i32>,

    /// Set or override the base image
    #[arg(short, long, value_name = "BASE")]
    pub base: Option<String>,

    /// Print the resolved build-root configuration and exit
    #[arg(short, long)]
    pub print: bool,

    /// Print verbose messages
    #[arg(short, long)]
    pub verbose: bool,

    /// Build-root name, a subdirectory of the manager's own directory
    pub chroot_name: PathBuf,

    /// Command and arguments to run inside the environment
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Resolve the build-root, run the lifecycle, and compute the exit
    /// code: the child's status, OR'd with 1 when any acquire or release
    /// step failed.
    pub fn execute(self) -> Result<i32> {
        supervisor::install()?;

        // Build-roots are resolved against the manager's own directory,
        // which also hosts the mtab ledger.
        let exe = env::current_exe()?;
        let home = exe
            .parent()
            .ok_or_else(|| eyre!("cannot locate the manager's directory"))?;
        env::set_current_dir(home)?;

        let build_root = resolve_build_root(&self.chroot_name)?;
        info!(root = %build_root.display(), "Resolved build-root");

        let build_file = build_root.join(config::BUILD_FILE);
        config::verify_ownership(&build_file)?;

        let mut config = BuildRoot::load(&build_file)?;
        if let Some(base) = self.base {
            config.base = Some(base);
        }

        if self.print {
            print!("{}", serde_yaml::to_string(&config)?);
            return Ok(PRINT_EXIT);
        }

        let mut state = State::new(build_root);
        state.keep_fds = self.keepfd.iter().copied().collect();

        let acquired = runtime::start(&mut state, &config, self.command);
        let from = match acquired {
            Ok(()) => Stage::Mtab,
            Err(stage) => stage,
        };
        let released = supervisor::release(&mut state, &config, from);

        let failed = acquired.is_err() || !released;
        Ok(state.exit_status | i32::from(failed))
    }
}

/// Reject absolute names and `..` components, then require an existing
/// directory under the current (the manager's own) directory.
fn resolve_build_root(name: &Path) -> Result<PathBuf> {
    if name.is_absolute() {
        bail!(
            "only relative subdirectories of {} are allowed",
            env::current_dir()?.display()
        );
    }
    if name
        .components()
        .any(|part| matches!(part, Component::ParentDir))
    {
        bail!("no `..` components are allowed in the build-root name");
    }

    let root = env::current_dir()?.join(name);
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_names_are_rejected() {
        assert!(resolve_build_root(Path::new("/srv/build")).is_err());
    }

    #[test]
    fn parent_components_are_rejected() {
        assert!(resolve_build_root(Path::new("roots/../escape")).is_err());
        assert!(resolve_build_root(Path::new("..")).is_err());
    }

    #[test]
    fn missing_directories_are_rejected() {
        assert!(resolve_build_root(Path::new("no-such-build-root")).is_err());
    }

    #[test]
    fn command_line_parses() {
        let cli = Cli::parse_from([
            "keller", "-f", "3", "--keepfd", "4", "-b", "stable", "wheezy", "make", "-j4",
        ]);
        assert_eq!(cli.keepfd, vec![3, 4]);
        assert_eq!(cli.base.as_deref(), Some("stable"));
        assert_eq!(cli.chroot_name, PathBuf::from("wheezy"));
        assert_eq!(cli.command, vec!["make", "-j4"]);
    }
}
