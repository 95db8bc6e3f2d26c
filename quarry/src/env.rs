// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Run-wide configuration shared by every stage.

use std::path::PathBuf;

use crate::make::MakeVar;
use crate::port::InstallStatus;

/// Logical CPUs of the build host
pub fn cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// When to re-run a port's interactive configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConfigPolicy {
    /// Never configure
    None,
    /// Always configure
    All,
    /// Configure if the recipe is newer than the recorded options
    Newer,
    /// Configure if the option set differs from the recorded one
    #[default]
    Changed,
}

/// A method the resolver may use to satisfy a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DependMethod {
    /// Build the port from source
    Build,
    /// Install from a locally built package file
    Package,
    /// Install from the remote package repository
    Repo,
}

/// Overall mode of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Build and install the requested ports
    Install,
    /// Rebuild the whole dependency closure
    Recursive,
    /// Shutting down, only cleanup work remains
    Clean,
}

/// Primary targets applied to each requested port, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    Clean,
    Install,
    Package,
}

#[derive(Debug, Clone)]
pub struct Flags {
    /// Root prefix passed through to every subprocess invocation
    pub chroot: String,
    pub config: ConfigPolicy,
    /// Resolution methods, in the order they are attempted
    pub depend: Vec<DependMethod>,
    pub fetch_only: bool,
    pub log_dir: PathBuf,
    pub mode: Mode,
    /// Do nothing, posting synthetic successes
    pub no_op: bool,
    /// Print the commands that would run
    pub no_op_print: bool,
    pub target: Vec<BuildTarget>,
    /// Install status above which a port already satisfies its dependants
    pub stage_floor: InstallStatus,
    /// User supplied make environment (-D VAR / VAR=VALUE)
    pub make_env: Vec<(String, MakeVar)>,
    pub portsdir: PathBuf,
    pub pkg_cachedir: PathBuf,
    pub cpus: u32,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            chroot: String::new(),
            config: ConfigPolicy::default(),
            depend: vec![DependMethod::Build],
            fetch_only: false,
            log_dir: PathBuf::from("/tmp/quarry"),
            mode: Mode::Install,
            no_op: false,
            no_op_print: false,
            target: vec![BuildTarget::Install, BuildTarget::Clean],
            stage_floor: InstallStatus::Absent,
            make_env: vec![],
            portsdir: PathBuf::from("/usr/ports"),
            pkg_cachedir: PathBuf::from("/var/cache/pkg"),
            cpus: cpus(),
        }
    }
}

impl Flags {
    /// Resolve a path against the root prefix
    pub fn rooted(&self, path: impl AsRef<std::path::Path>) -> PathBuf {
        let path = path.as_ref();
        if self.chroot.is_empty() {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{}{}", self.chroot, path.display()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rooted_paths() {
        let mut flags = Flags::default();
        assert_eq!(flags.rooted("/usr/ports"), PathBuf::from("/usr/ports"));

        flags.chroot = "/jail".into();
        assert_eq!(flags.rooted("/usr/ports"), PathBuf::from("/jail/usr/ports"));
    }
}
