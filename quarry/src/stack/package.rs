// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The package stack: install a port from a locally built package.

use log::debug;

use crate::engine::Engine;
use crate::job::{JobId, Stalled};
use crate::pkg;
use crate::port::cache::PortId;
use crate::port::InstallStatus;
use crate::process::{self, Pipe};
use crate::stack::{run, Stage};

/// Check if the package file exists locally
pub fn pkgfile_present(engine: &Engine, port: PortId) -> bool {
    let pkgfile = &engine.ports[port].attr.pkgfile;
    !pkgfile.is_empty() && engine.flags.rooted(pkgfile).is_file()
}

/// Install the local package, deinstalling any previous version first
pub fn pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    debug!("port '{}': installing from package", engine.ports[port].origin);
    Ok(deinstall_then(engine, port, job, add_package))
}

/// Issue the packager's add command for the port's package file
fn add_package(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Option<i32> {
    let pkgfile = engine.ports[port].attr.pkgfile.clone();
    let log = Pipe::Log(engine.ports[port].log_file.clone());
    let request = pkg::add_request(&engine.flags, &pkgfile, log);

    process::spawn(engine, request, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::PkgInstall, exit.success());
    })
}

/// Run the packager's delete command before `then` when the port is
/// already installed, finalising the stage failed if deinstall fails.
/// Shared with the repo stack's install stage.
pub(crate) fn deinstall_then(
    engine: &mut Engine,
    port: PortId,
    job: Option<JobId>,
    then: fn(&mut Engine, PortId, Option<JobId>) -> Option<i32>,
) -> Option<i32> {
    if engine.ports[port].install_status == InstallStatus::Absent {
        return then(engine, port, job);
    }

    let (origin, pkgname) = {
        let p = &engine.ports[port];
        (p.origin.clone(), p.attr.pkgname.clone())
    };
    engine.pkgdb.remove(&origin, &pkgname);
    engine.ports.get_mut(port).install_status = InstallStatus::Absent;

    let stage = stage_of(engine, port, job);
    let log = Pipe::Log(engine.ports[port].log_file.clone());
    let request = pkg::delete_request(&engine.flags, &pkgname, log);

    process::spawn(engine, request, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        if exit.success() {
            let pid = then(e, port, job);
            if let Some(job) = job {
                e.jobs.get_mut(job).pid = pid;
            }
        } else {
            log::error!("port '{}': failed to deinstall", e.ports[port].origin);
            run::finalise(e, port, stage, false);
        }
    })
}

/// The stage the owning job is running, for failure finalisation
fn stage_of(engine: &Engine, _port: PortId, job: Option<JobId>) -> Stage {
    job.and_then(|job| engine.jobs[job].stage())
        .unwrap_or(Stage::PkgInstall)
}
