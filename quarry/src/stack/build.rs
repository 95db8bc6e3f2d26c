// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build stack: Checksum, Fetch, Build, Install and Package.
//!
//! Checksum and Fetch share three process-wide distfile sets and a
//! single file-lock domain, so two ports that share a distfile can
//! never run either stage against it at the same time. Releasing the
//! lock re-pumps both queues; a parked job whose distfiles were just
//! verified completes on its retry through the `complete` fast path.

use std::path::Path;

use log::debug;

use crate::engine::Engine;
use crate::job::{JobId, Stalled};
use crate::lock::FileLock;
use crate::make::{self, MakeVar};
use crate::port::cache::PortId;
use crate::port::InstallStatus;
use crate::queue::{self, QueueId};
use crate::stack::{run, Stage};

/// Process-wide distfile bookkeeping, consulted by Checksum and Fetch
#[derive(Debug, Default)]
pub struct DistState {
    /// Distfiles known present with a good checksum
    pub fetched: std::collections::HashSet<String>,
    /// Distfiles absent or failing the recipe's checksum step
    pub bad_checksum: std::collections::HashSet<String>,
    /// Distfiles that could not be fetched
    pub fetch_failed: std::collections::HashSet<String>,
    /// One lock domain across both distfile stages
    pub lock: FileLock,
}

/// Check if any of the distfiles still need checking
pub fn checksum_complete(engine: &mut Engine, port: PortId) -> bool {
    if engine.flags.no_op {
        return true;
    }

    let distfiles = engine.ports[port].attr.distfiles.clone();
    if distfiles.iter().all(|f| engine.dist.fetched.contains(f)) {
        // Trivially holds for ports without distfiles
        return true;
    }
    if distfiles.iter().any(|f| engine.dist.bad_checksum.contains(f)) {
        // Some files already failed; Fetch will sort the rest out
        return true;
    }

    let distdir = engine.ports[port].attr.distdir.clone();
    for file in &distfiles {
        let path = engine.flags.rooted(Path::new(&distdir).join(file));
        if !path.is_file() {
            engine.dist.bad_checksum.insert(file.clone());
            return true;
        }
    }

    false
}

/// Verify the distfiles against the recipe's checksums
pub fn checksum_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let files = engine.ports[port].attr.distfiles.clone();
    if !engine.dist.lock.acquire(&files) {
        return Err(Stalled);
    }

    let overrides = [
        ("BATCH", MakeVar::On),
        ("NO_DEPENDS", MakeVar::On),
        ("DISABLE_CONFLICTS", MakeVar::On),
        ("FETCH_REGET", MakeVar::Set("0".into())),
    ];
    let pid = make::make_target(engine, port, &["checksum"], &overrides, None, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        checksum_post_make(e, port, files, exit.success());
    });

    Ok(pid)
}

fn checksum_post_make(engine: &mut Engine, port: PortId, files: Vec<String>, status: bool) {
    engine.dist.lock.release(&files);
    if status {
        engine.dist.fetched.extend(files);
    } else {
        engine.dist.bad_checksum.extend(files);
    }

    rescan(engine);
    // A checksum mismatch is recorded, not fatal; Fetch re-fetches
    run::finalise(engine, port, Stage::Checksum, true);
}

/// The stage cannot run once every distfile has failed to fetch
pub fn fetch_check(engine: &Engine, port: PortId) -> bool {
    let distfiles = &engine.ports[port].attr.distfiles;
    !(!distfiles.is_empty() && distfiles.iter().all(|f| engine.dist.fetch_failed.contains(f)))
}

/// Check if all distfiles have already been fetched
pub fn fetch_complete(engine: &mut Engine, port: PortId) -> bool {
    engine.ports[port]
        .attr
        .distfiles
        .iter()
        .all(|f| engine.dist.fetched.contains(f))
}

/// Fetch the outstanding distfiles
pub fn fetch_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let files = engine.ports[port].attr.distfiles.clone();
    if !engine.dist.lock.acquire(&files) {
        return Err(Stalled);
    }

    let overrides = [
        ("BATCH", MakeVar::On),
        ("DISABLE_CONFLICTS", MakeVar::On),
        ("NO_DEPENDS", MakeVar::On),
    ];
    let pid = make::make_target(engine, port, &["checksum"], &overrides, None, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        fetch_post_make(e, port, files, exit.success());
    });

    Ok(pid)
}

fn fetch_post_make(engine: &mut Engine, port: PortId, files: Vec<String>, status: bool) {
    engine.dist.lock.release(&files);
    if status {
        for file in &files {
            engine.dist.bad_checksum.remove(file);
            engine.dist.fetched.insert(file.clone());
        }
    } else {
        debug!(
            "port '{}': failed to fetch distfiles: {}",
            engine.ports[port].origin,
            files.join(", ")
        );
        for file in &files {
            engine.dist.bad_checksum.insert(file.clone());
            engine.dist.fetch_failed.insert(file.clone());
        }
    }

    rescan(engine);
    run::finalise(engine, port, Stage::Fetch, status);
}

/// Build the port
pub fn build_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let overrides = [("BATCH", MakeVar::On), ("NO_DEPENDS", MakeVar::On)];
    let pid = make::make_target(engine, port, &["all"], &overrides, None, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::Build, exit.success());
    });

    Ok(pid)
}

/// Install the port from its build, deinstalling any previous version
pub fn install_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let absent = engine.ports[port].install_status == InstallStatus::Absent;
    let targets: &[&str] = if absent { &["install"] } else { &["deinstall", "reinstall"] };

    if !absent {
        let (origin, pkgname) = {
            let p = &engine.ports[port];
            (p.origin.clone(), p.attr.pkgname.clone())
        };
        engine.pkgdb.remove(&origin, &pkgname);
        engine.ports.get_mut(port).install_status = InstallStatus::Absent;
    }

    let mut overrides = vec![("BATCH", MakeVar::On), ("NO_DEPENDS", MakeVar::On)];
    if !engine.ports[port].explicit {
        overrides.push(("INSTALLS_DEPENDS", MakeVar::On));
    }

    let pid = make::make_target(engine, port, targets, &overrides, None, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::Install, exit.success());
    });

    Ok(pid)
}

/// Package the port
pub fn package_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let overrides = [("BATCH", MakeVar::On), ("NO_DEPENDS", MakeVar::On)];
    let pid = make::make_target(engine, port, &["package"], &overrides, None, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::Package, exit.success());
    });

    Ok(pid)
}

/// A distfile lock was released; other parked distfile work may now be
/// satisfiable
fn rescan(engine: &mut Engine) {
    queue::pump(engine, QueueId::Checksum);
    queue::pump(engine, QueueId::Fetch);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::seed_port_with;

    fn dist_port(engine: &mut Engine, origin: &str, files: &[&str]) -> PortId {
        let files: Vec<String> = files.iter().map(|f| (*f).to_owned()).collect();
        seed_port_with(engine, origin, move |attrs| {
            attrs.distfiles = files.clone();
            attrs.distdir = "/nonexistent/distdir".into();
        })
    }

    #[test]
    fn checksum_completes_on_known_good_files() {
        let mut engine = Engine::for_tests();
        let port = dist_port(&mut engine, "lang/foo", &["foo.tgz"]);

        engine.dist.fetched.insert("foo.tgz".into());
        assert!(checksum_complete(&mut engine, port));
    }

    #[test]
    fn checksum_flags_missing_files() {
        let mut engine = Engine::for_tests();
        let port = dist_port(&mut engine, "lang/foo", &["foo.tgz"]);

        // The distdir does not hold the file: complete, with the file
        // recorded as bad so Fetch will retrieve it
        assert!(checksum_complete(&mut engine, port));
        assert!(engine.dist.bad_checksum.contains("foo.tgz"));
    }

    #[test]
    fn fetch_check_fails_once_all_files_unfetchable() {
        let mut engine = Engine::for_tests();
        let port = dist_port(&mut engine, "lang/foo", &["a.tgz", "b.tgz"]);

        assert!(fetch_check(&engine, port));
        engine.dist.fetch_failed.insert("a.tgz".into());
        assert!(fetch_check(&engine, port));
        engine.dist.fetch_failed.insert("b.tgz".into());
        assert!(!fetch_check(&engine, port));
    }

    #[test]
    fn fetch_success_clears_bad_checksums() {
        let mut engine = Engine::for_tests();
        let port = dist_port(&mut engine, "lang/foo", &["foo.tgz"]);

        engine.dist.bad_checksum.insert("foo.tgz".into());
        engine.dist.lock.acquire(&["foo.tgz".to_owned()]);
        fetch_post_make(&mut engine, port, vec!["foo.tgz".into()], true);

        assert!(engine.dist.fetched.contains("foo.tgz"));
        assert!(!engine.dist.bad_checksum.contains("foo.tgz"));
        assert!(!engine.dist.lock.holds("foo.tgz"));
    }
}
