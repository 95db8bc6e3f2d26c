// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Modelling of ports.

use std::ops::{Index, IndexMut};
use std::path::PathBuf;

use crate::env::Flags;
use crate::pkg::PkgDb;
use crate::signal::Signal;
use crate::stack::{Stage, StageSet, StackKind, StackState};

pub use self::attr::Attributes;
pub use self::cache::{PortCache, PortId};
pub use self::depend::{DependKind, DependStatus, Dependency, Dependent};

pub mod attr;
pub mod cache;
pub mod depend;

/// Filesystem-relative identifier of a port, e.g. `devel/git`
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
)]
pub struct Origin(String);

impl Origin {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> &str {
        self.0.split_once('/').map(|(c, _)| c).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl From<&str> for Origin {
    fn from(origin: &str) -> Self {
        Self(origin.to_owned())
    }
}

/// How a port's installed package relates to its recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallStatus {
    Absent,
    Older,
    Current,
    Newer,
}

/// Per-stack substate carried by each port
#[derive(Debug, Default)]
pub struct Stacks {
    pub common: StackState,
    pub build: StackState,
    pub package: StackState,
    pub repo: StackState,
}

impl Stacks {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StackState> {
        [
            &mut self.common,
            &mut self.build,
            &mut self.package,
            &mut self.repo,
        ]
        .into_iter()
    }
}

impl Index<StackKind> for Stacks {
    type Output = StackState;

    fn index(&self, kind: StackKind) -> &StackState {
        match kind {
            StackKind::Common => &self.common,
            StackKind::Build => &self.build,
            StackKind::Package => &self.package,
            StackKind::Repo => &self.repo,
        }
    }
}

impl IndexMut<StackKind> for Stacks {
    fn index_mut(&mut self, kind: StackKind) -> &mut StackState {
        match kind {
            StackKind::Common => &mut self.common,
            StackKind::Build => &mut self.build,
            StackKind::Package => &mut self.package,
            StackKind::Repo => &mut self.repo,
        }
    }
}

/// A buildable unit with attributes, dependencies and a log
pub struct Port {
    pub origin: Origin,
    pub attr: Attributes,
    pub log_file: PathBuf,
    pub install_status: InstallStatus,
    /// Stages this port has finalised, successfully or not
    pub stages: StageSet,
    pub stacks: Stacks,
    /// Latched on any stage failure; only the resolver clears it while
    /// switching to another resolution method
    pub failed: bool,
    /// Requested on the command line rather than pulled in as a dependency
    pub explicit: bool,
    /// A dependant asked for this port's package file
    pub want_package: bool,
    /// Weight of this port's distfiles, seeded from the recipe's distinfo
    pub priority: i64,
    pub stage_completed: Signal<PortId>,
    pub dependent: Dependent,
    pub dependency: Option<Dependency>,
}

impl Port {
    pub fn new(origin: Origin, attr: Attributes, flags: &Flags, pkgdb: &PkgDb) -> Self {
        let log_file = flags.log_dir.join(&attr.pkgname);
        let install_status = pkgdb.status(&origin, &attr.pkgname);
        let resolved = install_status > flags.stage_floor;

        Self {
            origin,
            attr,
            log_file,
            install_status,
            stages: StageSet::default(),
            stacks: Stacks::default(),
            failed: false,
            explicit: false,
            want_package: false,
            priority: 0,
            stage_completed: Signal::new("Port.stage_completed"),
            dependent: Dependent::new(resolved),
            dependency: None,
        }
    }

    /// Whether this port currently satisfies its dependants
    pub fn resolved(&self) -> bool {
        self.dependent.status == DependStatus::Resolved
    }

    /// Whether `stage` may run, judged against the stage wiring
    pub fn stage_ready(&self, stage: Stage) -> bool {
        stage.prev().map_or(true, |prev| self.stages.contains(prev))
            && self.stacks[stage.stack()].failed.is_none()
            && self.stacks[stage.stack()].working.is_none()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("origin", &self.origin)
            .field("install_status", &self.install_status)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn origin_components() {
        let origin = Origin::from("devel/git");
        assert_eq!(origin.category(), "devel");
        assert_eq!(origin.name(), "git");
        assert_eq!(origin.to_string(), "devel/git");
    }

    #[test]
    fn install_status_orders() {
        assert!(InstallStatus::Absent < InstallStatus::Older);
        assert!(InstallStatus::Older < InstallStatus::Current);
        assert!(InstallStatus::Current < InstallStatus::Newer);
    }
}
