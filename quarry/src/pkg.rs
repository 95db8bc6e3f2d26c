// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Interface to the host's packaging tool.
//!
//! The package database is read-mostly: it is primed from the host
//! packager's listing at startup and kept in sync as stages install and
//! deinstall packages. The core never writes the host database itself.

use std::collections::{BTreeSet, HashMap};
use std::process::Command;

use log::warn;
use thiserror::Error;

use crate::env::Flags;
use crate::port::{InstallStatus, Origin};
use crate::process::{Pipe, Request};

/// Mapping from origin to the package names installed for it
#[derive(Debug, Default)]
pub struct PkgDb {
    db: HashMap<Origin, BTreeSet<String>>,
}

impl PkgDb {
    /// Prime the database from the host packager's listing
    pub fn load(flags: &Flags) -> Result<Self, Error> {
        let request = info_request().chrooted(&flags.chroot);

        let output = Command::new(&request.program)
            .args(&request.args)
            .output()
            .map_err(Error::Listing)?;
        if !output.status.success() {
            warn!("package listing failed, assuming empty database");
            return Ok(Self::default());
        }

        let mut db = Self::default();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((pkgname, origin)) = line.split_once(char::is_whitespace) {
                db.add(&Origin::from(origin.trim().to_owned()), pkgname);
            }
        }

        Ok(db)
    }

    /// Indicate that a package has been installed for `origin`
    pub fn add(&mut self, origin: &Origin, pkgname: &str) {
        self.db.entry(origin.clone()).or_default().insert(pkgname.to_owned());
    }

    /// Indicate that packages matching `pkgname`'s name have been removed
    pub fn remove(&mut self, origin: &Origin, pkgname: &str) {
        let name = base_name(pkgname);
        if let Some(pkgs) = self.db.get_mut(origin) {
            pkgs.retain(|recorded| base_name(recorded) != name);
        }
    }

    /// Query the install status of a port relative to `pkgname`
    pub fn status(&self, origin: &Origin, pkgname: &str) -> InstallStatus {
        let name = base_name(pkgname);
        let mut status = InstallStatus::Absent;

        if let Some(pkgs) = self.db.get(origin) {
            for recorded in pkgs {
                if base_name(recorded) == name {
                    status = status.max(version(recorded, pkgname));
                }
            }
        }

        status
    }
}

/// The name component of a package name (`git-2.44.0` gives `git`)
fn base_name(pkgname: &str) -> &str {
    pkgname.rsplit_once('-').map(|(name, _)| name).unwrap_or(pkgname)
}

/// Compare two package names, indicating how `old` relates to `new`
pub fn version(old: &str, new: &str) -> InstallStatus {
    use std::cmp::Ordering;

    let status = |ord: Ordering| match ord {
        Ordering::Less => InstallStatus::Older,
        Ordering::Equal => InstallStatus::Current,
        Ordering::Greater => InstallStatus::Newer,
    };

    let old = old.rsplit_once('-').map(|(_, v)| v).unwrap_or(old);
    let new = new.rsplit_once('-').map(|(_, v)| v).unwrap_or(new);
    if old == new {
        return InstallStatus::Current;
    }

    // Compare the epochs
    let (old, new, epoch) = cmp_attr(old, new, ',');
    if epoch != Ordering::Equal {
        return status(epoch);
    }

    // Compare the revisions, relevant only if the versions match
    let (old, new, revision) = cmp_attr(&old, &new, '_');
    if old == new && revision != Ordering::Equal {
        return status(revision);
    }

    // Compare the version from left to right
    let old: Vec<&str> = old.split('.').collect();
    let new: Vec<&str> = new.split('.').collect();
    for (o, n) in old.iter().zip(new.iter()) {
        let ord = match (o.parse::<i64>(), n.parse::<i64>()) {
            (Ok(o), Ok(n)) => o.cmp(&n),
            _ => o.cmp(n),
        };
        if ord != Ordering::Equal {
            return status(ord);
        }
    }

    status(old.len().cmp(&new.len()))
}

/// Split a versioned attribute off both names and compare it
fn cmp_attr(old: &str, new: &str, sym: char) -> (String, String, std::cmp::Ordering) {
    use std::cmp::Ordering;

    match (old.rsplit_once(sym), new.rsplit_once(sym)) {
        (Some((ob, ov)), Some((nb, nv))) => {
            let ord = match (ov.parse::<i64>(), nv.parse::<i64>()) {
                (Ok(o), Ok(n)) => o.cmp(&n),
                _ => ov.cmp(nv),
            };
            (ob.to_owned(), nb.to_owned(), ord)
        }
        (Some((ob, _)), None) => (ob.to_owned(), new.to_owned(), Ordering::Greater),
        (None, Some((nb, _))) => (old.to_owned(), nb.to_owned(), Ordering::Less),
        (None, None) => (old.to_owned(), new.to_owned(), Ordering::Equal),
    }
}

/// List every installed package with its origin
pub fn info_request() -> Request {
    Request::new(
        "pkg",
        vec!["query".into(), "-a".into(), "%n-%v %o".into()],
        Pipe::Capture,
    )
}

/// Install a locally built package file
pub fn add_request(flags: &Flags, pkgfile: &str, pipe: Pipe) -> Request {
    Request::new("pkg", vec!["add".into(), pkgfile.into()], pipe).chrooted(&flags.chroot)
}

/// Install a package from the configured repository
pub fn repo_install_request(flags: &Flags, pkgname: &str, pipe: Pipe) -> Request {
    Request::new(
        "pkg",
        vec!["install".into(), "-Uy".into(), pkgname.into()],
        pipe,
    )
    .chrooted(&flags.chroot)
}

/// Fetch a package from the configured repository into the cache
pub fn repo_fetch_request(flags: &Flags, pkgname: &str, pipe: Pipe) -> Request {
    Request::new("pkg", vec!["fetch".into(), "-Uy".into(), pkgname.into()], pipe).chrooted(&flags.chroot)
}

/// Deinstall the named package
pub fn delete_request(flags: &Flags, pkgname: &str, pipe: Pipe) -> Request {
    Request::new("pkg", vec!["delete".into(), "-y".into(), pkgname.into()], pipe).chrooted(&flags.chroot)
}

/// Query the option set a repository package was built with
pub fn query_options_request(flags: &Flags, pkgname: &str) -> Request {
    Request::new(
        "pkg",
        vec!["rquery".into(), "-U".into(), "%Ok %Ov".into(), pkgname.into()],
        Pipe::Capture,
    )
    .chrooted(&flags.chroot)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("list installed packages")]
    Listing(#[source] std::io::Error),
}
