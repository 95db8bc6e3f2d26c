// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Stacks and stages.
//!
//! A stack is a named pipeline of stages; `common` always runs first and
//! exactly one of `build`, `package` or `repo` carries a port to
//! resolution. Stage wiring:
//!
//! ```text
//! common:   Config → Depend
//! build:    Depend → Checksum → Fetch → Build → Install → Package
//! package:  Depend → PkgInstall
//! repo:     Depend → RepoConfig → RepoFetch → RepoInstall
//! ```

use std::time::Instant;

use crate::port::DependKind;
use crate::queue::QueueId;

pub mod build;
pub mod common;
pub mod package;
pub mod repo;
pub mod run;

/// A named sequence of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StackKind {
    Common,
    Build,
    Package,
    Repo,
}

/// Mutable per-port state of one stack
#[derive(Debug, Default)]
pub struct StackState {
    /// The stage that failed this stack, latched
    pub failed: Option<Stage>,
    /// Set while a stage of this stack executes on the port
    pub working: Option<Instant>,
}

/// One step in a port's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Stage {
    Config,
    Depend,
    Checksum,
    Fetch,
    Build,
    Install,
    Package,
    PkgInstall,
    RepoConfig,
    RepoFetch,
    RepoInstall,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Config,
        Stage::Depend,
        Stage::Checksum,
        Stage::Fetch,
        Stage::Build,
        Stage::Install,
        Stage::Package,
        Stage::PkgInstall,
        Stage::RepoConfig,
        Stage::RepoFetch,
        Stage::RepoInstall,
    ];

    /// The stack this stage belongs to
    pub fn stack(self) -> StackKind {
        match self {
            Stage::Config | Stage::Depend => StackKind::Common,
            Stage::Checksum | Stage::Fetch | Stage::Build | Stage::Install | Stage::Package => StackKind::Build,
            Stage::PkgInstall => StackKind::Package,
            Stage::RepoConfig | Stage::RepoFetch | Stage::RepoInstall => StackKind::Repo,
        }
    }

    /// The stage that must have finalised before this one may run
    pub fn prev(self) -> Option<Stage> {
        match self {
            Stage::Config => None,
            Stage::Depend => Some(Stage::Config),
            Stage::Checksum => Some(Stage::Depend),
            Stage::Fetch => Some(Stage::Checksum),
            Stage::Build => Some(Stage::Fetch),
            Stage::Install => Some(Stage::Build),
            Stage::Package => Some(Stage::Install),
            Stage::PkgInstall => Some(Stage::Depend),
            Stage::RepoConfig => Some(Stage::Depend),
            Stage::RepoFetch => Some(Stage::RepoConfig),
            Stage::RepoInstall => Some(Stage::RepoFetch),
        }
    }

    /// The dependency kinds that must be resolved before this stage
    pub fn depend_kinds(self) -> &'static [DependKind] {
        match self {
            Stage::Config | Stage::Depend | Stage::Checksum | Stage::RepoConfig | Stage::RepoFetch => &[],
            Stage::Fetch => &[DependKind::Fetch],
            Stage::Build => &[
                DependKind::Extract,
                DependKind::Patch,
                DependKind::Lib,
                DependKind::Build,
                DependKind::Package,
            ],
            Stage::Install | Stage::Package | Stage::PkgInstall | Stage::RepoInstall => {
                &[DependKind::Lib, DependKind::Run, DependKind::Package]
            }
        }
    }

    /// The queue a job for this stage is scheduled on
    pub fn queue(self) -> QueueId {
        match self {
            Stage::Config | Stage::RepoConfig => QueueId::Config,
            Stage::Depend => QueueId::Attr,
            Stage::Checksum => QueueId::Checksum,
            Stage::Fetch | Stage::RepoFetch => QueueId::Fetch,
            Stage::Build => QueueId::Build,
            Stage::Install | Stage::PkgInstall | Stage::RepoInstall => QueueId::Install,
            Stage::Package => QueueId::Package,
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// The set of stages a port has finalised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSet(u16);

impl StageSet {
    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn remove(&mut self, stage: Stage) {
        self.0 &= !stage.bit();
    }

    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wiring_is_consistent() {
        // Every stage outside common is rooted in Depend
        for stage in Stage::ALL {
            let mut cursor = stage;
            while let Some(prev) = cursor.prev() {
                cursor = prev;
            }
            assert_eq!(cursor, Stage::Config);
        }

        // A stage's prev lives on the same stack or on common
        for stage in Stage::ALL {
            if let Some(prev) = stage.prev() {
                assert!(prev.stack() == stage.stack() || prev.stack() == StackKind::Common);
            }
        }
    }

    #[test]
    fn stage_sets() {
        let mut set = StageSet::default();
        assert!(set.is_empty());

        set.insert(Stage::Config);
        set.insert(Stage::Depend);
        assert!(set.contains(Stage::Config));
        assert!(!set.contains(Stage::Checksum));

        set.remove(Stage::Config);
        assert!(!set.contains(Stage::Config));
        assert!(set.contains(Stage::Depend));
    }
}
