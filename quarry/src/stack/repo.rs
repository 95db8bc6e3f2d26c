// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The repo stack: install a port from the remote package repository.
//!
//! RepoConfig guards against a repository package built with the wrong
//! option set; a mismatch finalises as failure so the resolver can fall
//! back to another method.

use std::collections::BTreeSet;
use std::path::Path;

use crate::engine::Engine;
use crate::job::{JobId, Stalled};
use crate::pkg;
use crate::port::cache::PortId;
use crate::process::{self, Pipe};
use crate::stack::{package, run, Stage};

/// Option validation is only needed when the port has options
pub fn repoconfig_complete(engine: &mut Engine, port: PortId) -> bool {
    engine.ports[port].attr.options.is_empty()
}

/// Query the repository package's recorded option set
pub fn repoconfig_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let pkgname = engine.ports[port].attr.pkgname.clone();
    let request = pkg::query_options_request(&engine.flags, &pkgname);

    let pid = process::spawn(engine, request, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        if !exit.success() {
            run::finalise(e, port, Stage::RepoConfig, false);
            return;
        }

        let packaged: BTreeSet<(String, String)> = String::from_utf8_lossy(&exit.stdout)
            .lines()
            .filter_map(|line| {
                line.split_once(char::is_whitespace)
                    .map(|(name, value)| (name.to_owned(), value.trim().to_lowercase()))
            })
            .collect();
        let configured: BTreeSet<(String, String)> = e.ports[port]
            .attr
            .options
            .iter()
            .map(|o| (o.name.clone(), o.default.to_lowercase()))
            .collect();

        run::finalise(e, port, Stage::RepoConfig, packaged == configured);
    });

    Ok(pid)
}

/// Skip the fetch when the package is already cached
pub fn repofetch_complete(engine: &mut Engine, port: PortId) -> bool {
    let pkgfile = &engine.ports[port].attr.pkgfile;
    let Some(file_name) = Path::new(pkgfile).file_name() else {
        return false;
    };

    engine
        .flags
        .rooted(engine.flags.pkg_cachedir.join(file_name))
        .is_file()
}

/// Fetch the package into the host packager's cache
pub fn repofetch_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    let pkgname = engine.ports[port].attr.pkgname.clone();
    let log = Pipe::Log(engine.ports[port].log_file.clone());
    let request = pkg::repo_fetch_request(&engine.flags, &pkgname, log);

    let pid = process::spawn(engine, request, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::RepoFetch, exit.success());
    });

    Ok(pid)
}

/// Install from the repository, deinstalling any previous version
pub fn repoinstall_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    Ok(package::deinstall_then(engine, port, job, repo_add))
}

fn repo_add(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Option<i32> {
    let pkgname = engine.ports[port].attr.pkgname.clone();
    let log = Pipe::Log(engine.ports[port].log_file.clone());
    let request = pkg::repo_install_request(&engine.flags, &pkgname, log);

    process::spawn(engine, request, move |e, exit| {
        if let Some(job) = job {
            e.jobs.get_mut(job).pid = None;
        }
        run::finalise(e, port, Stage::RepoInstall, exit.success());
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::seed_port_with;
    use crate::port::attr::PortOption;

    #[test]
    fn repoconfig_skipped_without_options() {
        let mut engine = Engine::for_tests();
        let port = seed_port_with(&mut engine, "lang/foo", |_| {});
        assert!(repoconfig_complete(&mut engine, port));

        let port = seed_port_with(&mut engine, "lang/bar", |attrs| {
            attrs.options = vec![PortOption {
                name: "X11".into(),
                descr: String::new(),
                default: "on".into(),
            }];
        });
        assert!(!repoconfig_complete(&mut engine, port));
    }

    #[test]
    fn repofetch_completes_on_cached_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::for_tests();
        engine.flags.pkg_cachedir = dir.path().to_path_buf();

        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs.pkgfile = "/packages/All/foo-1.0.pkg".into();
        });

        assert!(!repofetch_complete(&mut engine, port));
        std::fs::write(dir.path().join("foo-1.0.pkg"), b"pkg").unwrap();
        assert!(repofetch_complete(&mut engine, port));
    }
}
