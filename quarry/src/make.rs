// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe invocations.
//!
//! Every stage drives the external recipe through `make -C <portdir>`
//! with a target name and a set of environment overrides expressed as
//! command line arguments.

use crate::engine::Engine;
use crate::env::Flags;
use crate::port::cache::PortId;
use crate::port::Origin;
use crate::process::{self, Exit, Pipe, Request};

/// Exit status indicating a successful recipe step
pub const SUCCESS: i32 = 0;

/// A make environment override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MakeVar {
    /// Defined without a value (`-DVAR`)
    On,
    /// Assigned a value (`VAR=VALUE`)
    Set(String),
}

/// Convert environment overrides into make arguments
pub fn var_args<'a>(vars: impl IntoIterator<Item = (&'a str, &'a MakeVar)>) -> Vec<String> {
    vars.into_iter()
        .map(|(key, value)| match value {
            MakeVar::On => format!("-D{key}"),
            MakeVar::Set(value) => format!("{key}={value}"),
        })
        .collect()
}

/// Compose a recipe invocation for the given origin
pub fn target_request(
    flags: &Flags,
    origin: &Origin,
    targets: &[&str],
    overrides: &[(&str, MakeVar)],
    pipe: Pipe,
) -> Request {
    let portdir = flags.portsdir.join(origin.as_str());
    let mut args = vec!["-C".to_owned(), portdir.display().to_string()];

    args.extend(targets.iter().map(|t| (*t).to_owned()));
    args.extend(var_args(overrides.iter().map(|(k, v)| (*k, v))));
    args.extend(var_args(flags.make_env.iter().map(|(k, v)| (k.as_str(), v))));

    Request::new("make", args, pipe).chrooted(&flags.chroot)
}

/// Issue a recipe target for a port, logging output to the port's log
/// file unless the caller chose another pipe. The callback receives the
/// raw exit.
pub fn make_target(
    engine: &mut Engine,
    port: PortId,
    targets: &[&str],
    overrides: &[(&str, MakeVar)],
    pipe: Option<Pipe>,
    on_exit: impl FnOnce(&mut Engine, Exit) + 'static,
) -> Option<i32> {
    let pipe = pipe.unwrap_or_else(|| Pipe::Log(engine.ports[port].log_file.clone()));
    let request = target_request(&engine.flags, &engine.ports[port].origin, targets, overrides, pipe);

    process::spawn(engine, request, on_exit)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overrides_become_arguments() {
        let args = var_args([
            ("BATCH", &MakeVar::On),
            ("FETCH_REGET", &MakeVar::Set("0".into())),
        ]);

        assert_eq!(args, vec!["-DBATCH", "FETCH_REGET=0"]);
    }

    #[test]
    fn request_targets_the_port_directory() {
        let mut flags = Flags::default();
        flags.make_env.push(("WITH_DEBUG".to_string(), MakeVar::On));

        let origin = Origin::from("lang/foo".to_owned());
        let request = target_request(&flags, &origin, &["checksum"], &[("BATCH", MakeVar::On)], Pipe::Capture);

        assert_eq!(request.program, "make");
        assert_eq!(
            request.args,
            vec!["-C", "/usr/ports/lang/foo", "checksum", "-DBATCH", "-DWITH_DEBUG"]
        );
    }

    #[test]
    fn chroot_prefixes_the_invocation() {
        let flags = Flags {
            chroot: "/jail".into(),
            ..Flags::default()
        };

        let origin = Origin::from("lang/foo".to_owned());
        let request = target_request(&flags, &origin, &["all"], &[], Pipe::Capture);

        assert_eq!(request.program, "chroot");
        assert_eq!(request.args[..3], ["/jail", "make", "-C"]);
    }
}
