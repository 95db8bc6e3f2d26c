// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Retrieval of port attributes.
//!
//! Each origin's attributes are read by one `make` invocation carrying a
//! `-V` flag per schema field; stdout yields one line per field, in
//! schema order. Post-processing turns the raw lines into typed values.

use std::path::Path;

use log::error;
use thiserror::Error;

use crate::engine::Engine;
use crate::env::cpus;
use crate::make;
use crate::port::{DependKind, Origin};
use crate::process::{Exit, Pipe};

/// Schema value shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Tuple,
    Bool,
}

/// The recipe variables enumerated on every attribute query, in the
/// order their values are read back
pub const MAKE_VARS: &[(&str, FieldKind)] = &[
    ("PORTNAME", FieldKind::Str),
    ("PKGNAME", FieldKind::Str),
    ("PKGFILE", FieldKind::Str),
    ("OPTIONS", FieldKind::Str),
    ("OPTIONSFILE", FieldKind::Str),
    ("DISTFILES", FieldKind::Tuple),
    ("_DISTDIR", FieldKind::Str),
    ("DISTINFO_FILE", FieldKind::Str),
    ("NO_PACKAGE", FieldKind::Bool),
    ("_MAKE_JOBS", FieldKind::Str),
    ("CATEGORIES", FieldKind::Tuple),
    ("PREFIX", FieldKind::Str),
    ("WRKDIR", FieldKind::Str),
    (".MAKEFILE_LIST", FieldKind::Tuple),
    ("BUILD_DEPENDS", FieldKind::Tuple),
    ("EXTRACT_DEPENDS", FieldKind::Tuple),
    ("FETCH_DEPENDS", FieldKind::Tuple),
    ("LIB_DEPENDS", FieldKind::Tuple),
    ("RUN_DEPENDS", FieldKind::Tuple),
    ("PATCH_DEPENDS", FieldKind::Tuple),
];

/// One recipe option: `name "description" default`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOption {
    pub name: String,
    pub descr: String,
    pub default: String,
}

/// Dependency declarations by kind, as `(field, origin)` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependVec(pub [Vec<(String, Origin)>; DependKind::COUNT]);

impl DependVec {
    pub fn get(&self, kind: DependKind) -> &[(String, Origin)] {
        &self.0[kind as usize]
    }

    pub fn get_mut(&mut self, kind: DependKind) -> &mut Vec<(String, Origin)> {
        &mut self.0[kind as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }
}

/// The fixed attribute map parsed from a recipe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub name: String,
    pub pkgname: String,
    pub pkgfile: String,
    pub options: Vec<PortOption>,
    pub optionsfile: String,
    pub distfiles: Vec<String>,
    pub distdir: String,
    pub distinfo: String,
    pub no_package: bool,
    pub jobs_number: u32,
    pub categories: Vec<String>,
    pub prefix: String,
    pub wrkdir: String,
    pub makefiles: Vec<String>,
    pub depends: DependVec,
}

/// The `-V` arguments enumerating every schema field
pub fn make_args() -> Vec<String> {
    MAKE_VARS
        .iter()
        .flat_map(|(var, _)| ["-V".to_owned(), (*var).to_owned()])
        .collect()
}

/// Launch an attribute query for `origin`, delivering the parsed
/// attributes (or `None` on failure) through the event loop
pub fn query(
    engine: &mut Engine,
    origin: Origin,
    done: impl FnOnce(&mut Engine, Origin, Option<Attributes>) + 'static,
) -> Option<i32> {
    let args = make_args();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let request = make::target_request(&engine.flags, &origin, &args, &[], Pipe::Capture);

    crate::process::spawn(engine, request, move |e, exit: Exit| {
        let attrs = if exit.success() {
            let stdout = String::from_utf8_lossy(&exit.stdout).into_owned();
            match parse(&stdout, &e.flags.portsdir) {
                Ok(attrs) => Some(attrs),
                Err(err) => {
                    error!("port '{origin}': bad attributes: {err}");
                    None
                }
            }
        } else {
            error!(
                "port '{origin}': attribute query failed (err={}): {}",
                exit.code,
                String::from_utf8_lossy(&exit.stderr).trim()
            );
            None
        };
        done(e, origin, attrs);
    })
}

/// Parse an attribute query's stdout against the schema
pub fn parse(stdout: &str, portsdir: &Path) -> Result<Attributes, Error> {
    let mut lines = stdout.lines();
    let mut next_str = || lines.next().map(str::trim).ok_or(Error::Truncated);

    let mut attrs = Attributes::default();
    let mut raw_depends: [Vec<String>; DependKind::COUNT] = Default::default();

    for (var, _kind) in MAKE_VARS {
        let line = next_str()?;
        let tuple = || {
            line.split_whitespace()
                .map(str::to_owned)
                .collect::<Vec<String>>()
        };

        match *var {
            "PORTNAME" => attrs.name = line.to_owned(),
            "PKGNAME" => attrs.pkgname = line.to_owned(),
            "PKGFILE" => attrs.pkgfile = line.to_owned(),
            "OPTIONS" => attrs.options = parse_options(line)?,
            "OPTIONSFILE" => attrs.optionsfile = line.to_owned(),
            "DISTFILES" => {
                // Distfile entries may carry a fetch group suffix
                attrs.distfiles = tuple()
                    .into_iter()
                    .map(|f| f.split(':').next().unwrap_or_default().to_owned())
                    .collect();
            }
            "_DISTDIR" => attrs.distdir = line.to_owned(),
            "DISTINFO_FILE" => attrs.distinfo = line.to_owned(),
            "NO_PACKAGE" => attrs.no_package = !line.is_empty(),
            "_MAKE_JOBS" => attrs.jobs_number = parse_jobs_number(line),
            "CATEGORIES" => attrs.categories = tuple(),
            "PREFIX" => attrs.prefix = line.to_owned(),
            "WRKDIR" => attrs.wrkdir = line.to_owned(),
            ".MAKEFILE_LIST" => {
                attrs.makefiles = tuple().into_iter().filter(|m| m != "..").collect();
            }
            "BUILD_DEPENDS" => raw_depends[DependKind::Build as usize] = tuple(),
            "EXTRACT_DEPENDS" => raw_depends[DependKind::Extract as usize] = tuple(),
            "FETCH_DEPENDS" => raw_depends[DependKind::Fetch as usize] = tuple(),
            "LIB_DEPENDS" => raw_depends[DependKind::Lib as usize] = tuple(),
            "RUN_DEPENDS" => raw_depends[DependKind::Run as usize] = tuple(),
            "PATCH_DEPENDS" => raw_depends[DependKind::Patch as usize] = tuple(),
            _ => unreachable!("schema field without parser: {var}"),
        }
    }

    for kind in DependKind::ALL {
        let stripped = strip_depends(&raw_depends[kind as usize], portsdir)?;
        *attrs.depends.get_mut(kind) = stripped;
    }

    Ok(attrs)
}

/// Convert the options string into an ordered option list
fn parse_options(optionstr: &str) -> Result<Vec<PortOption>, Error> {
    let bad = || Error::BadOptions(optionstr.to_owned());

    let mut options = vec![];
    let mut rest = optionstr.trim();

    while !rest.is_empty() {
        // The name component
        let (name, remainder) = rest.split_once(char::is_whitespace).ok_or_else(bad)?;
        rest = remainder.trim_start();

        // The quoted description component, honouring escaped quotes
        let start = rest.find('"').ok_or_else(bad)?;
        let mut end = start;
        loop {
            let offset = rest[end + 1..].find('"').ok_or_else(bad)?;
            end += offset + 1;
            if rest.as_bytes()[end - 1] != b'\\' {
                break;
            }
        }
        let descr = rest[start + 1..end].to_owned();
        rest = rest[end + 1..].trim_start();

        // The default component
        let (default, remainder) = rest
            .split_once(char::is_whitespace)
            .unwrap_or((rest, ""));

        options.push(PortOption {
            name: name.to_owned(),
            descr,
            default: default.to_owned(),
        });
        rest = remainder.trim_start();
    }

    Ok(options)
}

/// Remove the ports directory prefix from dependency paths
fn strip_depends(depends: &[String], portsdir: &Path) -> Result<Vec<(String, Origin)>, Error> {
    let prefix = portsdir.display().to_string();

    depends
        .iter()
        .map(|depend| {
            let (field, port) = depend
                .split_once(':')
                .ok_or_else(|| Error::BadDependency(depend.clone()))?;
            let origin = port
                .strip_prefix(&prefix)
                .and_then(|p| p.strip_prefix('/'))
                .ok_or_else(|| Error::BadDependency(depend.clone()))?;
            Ok((field.to_owned(), Origin::from(origin)))
        })
        .collect()
}

/// Coerce the requested make jobs into a number
fn parse_jobs_number(jobs: &str) -> u32 {
    if jobs.is_empty() {
        return 1;
    }
    jobs.strip_prefix("-j")
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(cpus)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("attribute output ended early")]
    Truncated,
    #[error("bad dependency line: '{0}'")]
    BadDependency(String),
    #[error("bad options string: '{0}'")]
    BadOptions(String),
}
