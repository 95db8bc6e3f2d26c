// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The per-stage execution protocol.
//!
//! Guard, then `complete`, then `pre_make`: a stage whose observable
//! effect is already in place finalises through an event loop post
//! (finalisation never runs inside the scheduling call); otherwise the
//! stage acquires its locks and launches its subprocess, finalising
//! from the exit callback. Failure latches on the stage's stack, and a
//! common stack failure latches every stack.

use std::time::Instant;

use log::{debug, error};

use crate::engine::Engine;
use crate::job::{JobId, Stalled};
use crate::port::cache::PortId;
use crate::port::{depend, InstallStatus};
use crate::stack::{build, common, package, repo, Stage, StackKind};

/// Begin a stage on a port. `Err(Stalled)` parks the owning job.
pub fn start(engine: &mut Engine, port: PortId, stage: Stage, job: Option<JobId>) -> Result<(), Stalled> {
    debug_assert!(engine.ports[port].stage_ready(stage));
    debug_assert!(!engine.ports[port].failed);

    debug!("port '{}': starting stage {stage}", engine.ports[port].origin);

    if !check(engine, port, stage) {
        debug!("port '{}': stage {stage} cannot run", engine.ports[port].origin);
        engine.events.post(move |e| finalise(e, port, stage, false));
        return Ok(());
    }

    if complete(engine, port, stage) {
        engine.events.post(move |e| finalise(e, port, stage, true));
        return Ok(());
    }

    let pid = pre_make(engine, port, stage, job)?;
    if let Some(job) = job {
        engine.jobs.get_mut(job).pid = pid;
    }

    let stack = stage.stack();
    engine.ports.get_mut(port).stacks[stack].working = Some(Instant::now());

    Ok(())
}

/// Static pre-test: can this stage run at all?
fn check(engine: &Engine, port: PortId, stage: Stage) -> bool {
    match stage {
        Stage::Fetch => build::fetch_check(engine, port),
        Stage::Package => !engine.ports[port].attr.no_package,
        Stage::PkgInstall => package::pkgfile_present(engine, port),
        _ => true,
    }
}

/// Is the stage's observable effect already in place?
fn complete(engine: &mut Engine, port: PortId, stage: Stage) -> bool {
    match stage {
        Stage::Config => common::config_complete(engine, port),
        Stage::Checksum => build::checksum_complete(engine, port),
        Stage::Fetch => build::fetch_complete(engine, port),
        Stage::RepoConfig => repo::repoconfig_complete(engine, port),
        Stage::RepoFetch => repo::repofetch_complete(engine, port),
        _ => false,
    }
}

/// Stage specific preparation: lock acquisition and subprocess launch
fn pre_make(engine: &mut Engine, port: PortId, stage: Stage, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    match stage {
        Stage::Config => common::config_pre_make(engine, port, job),
        Stage::Depend => {
            depend::materialise(engine, port);
            Ok(None)
        }
        Stage::Checksum => build::checksum_pre_make(engine, port, job),
        Stage::Fetch => build::fetch_pre_make(engine, port, job),
        Stage::Build => build::build_pre_make(engine, port, job),
        Stage::Install => build::install_pre_make(engine, port, job),
        Stage::Package => build::package_pre_make(engine, port, job),
        Stage::PkgInstall => package::pre_make(engine, port, job),
        Stage::RepoConfig => repo::repoconfig_pre_make(engine, port, job),
        Stage::RepoFetch => repo::repofetch_pre_make(engine, port, job),
        Stage::RepoInstall => repo::repoinstall_pre_make(engine, port, job),
    }
}

/// Finalise a stage: release the stack, latch failures, record the
/// stage and let the port's listeners know.
pub fn finalise(engine: &mut Engine, port: PortId, stage: Stage, status: bool) {
    let stack = stage.stack();
    engine.ports.get_mut(port).stacks[stack].working = None;

    if status {
        debug!("port '{}': finished stage {stage}", engine.ports[port].origin);
    } else {
        error!("port '{}': failed stage {stage}", engine.ports[port].origin);

        let p = engine.ports.get_mut(port);
        if stack == StackKind::Common {
            for state in p.stacks.iter_mut() {
                state.failed = Some(stage);
            }
        } else {
            p.stacks[stack].failed = Some(stage);
        }
        p.failed = true;
    }

    engine.ports.get_mut(port).stages.insert(stage);

    if status {
        match stage {
            // A resolving stage leaves the port installed
            Stage::Install | Stage::PkgInstall | Stage::RepoInstall => {
                let (origin, pkgname) = {
                    let p = &engine.ports[port];
                    (p.origin.clone(), p.attr.pkgname.clone())
                };
                engine.pkgdb.add(&origin, &pkgname);
                engine.ports.get_mut(port).install_status = InstallStatus::Current;
                depend::status_changed(engine, port);
            }
            // Fetch-only runs satisfy dependants at this point
            Stage::Fetch if engine.flags.fetch_only => depend::status_changed(engine, port),
            _ => {}
        }
    }

    engine.ports[port].stage_completed.emit(&mut engine.events, port);
}
