// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fs_err as fs;
use log::{error, info, warn};
use thiserror::Error;

use quarry::env::{BuildTarget, ConfigPolicy, DependMethod, Mode};
use quarry::make::MakeVar;
use quarry::port::cache::{self, PortId};
use quarry::port::{InstallStatus, Origin};
use quarry::{resolver, Engine, Flags};

#[derive(Debug, Parser)]
#[command(
    name = "quarry",
    about = "Concurrent port builder",
    version,
    arg_required_else_help = true
)]
pub struct Command {
    #[arg(short, long, help = "Batch mode, skips the config stage")]
    batch: bool,

    #[arg(
        short,
        long,
        value_enum,
        default_value_t = ConfigPolicy::Changed,
        help = "Which ports to configure"
    )]
    config: ConfigPolicy,

    #[arg(
        short = 'D',
        value_name = "VARIABLE",
        help = "Define the variable for every make invocation"
    )]
    define: Vec<String>,

    #[arg(short = 'f', long, value_name = "FILE", help = "Read ports from a file")]
    file: Option<PathBuf>,

    #[arg(short = 'F', long, help = "Only fetch the ports' distfiles")]
    fetch_only: bool,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "build",
        help = "Dependency resolution methods, in order"
    )]
    method: Vec<DependMethod>,

    #[arg(short = 'n', help = "Print the commands that would run, without executing")]
    dry_run_print: bool,

    #[arg(short = 'N', help = "Do nothing, quietly")]
    dry_run: bool,

    #[arg(short = 'p', long, help = "Package each port after installing it")]
    package: bool,

    #[arg(short = 'u', long, help = "Upgrade ports with an older version installed")]
    upgrade: bool,

    #[arg(short = 'r', long, help = "Rebuild the requested ports and their whole closure")]
    recursive_upgrade: bool,

    #[arg(long, value_name = "DIR", help = "Root prefix passed to every invocation")]
    chroot: Option<String>,

    #[arg(long, value_name = "DIR", help = "Directory for per-port build logs")]
    log_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "The ports tree")]
    portsdir: Option<PathBuf>,

    #[arg(value_name = "PORT|VAR=VALUE", help = "Port origins and make overrides")]
    args: Vec<String>,
}

/// Process all CLI arguments
pub fn process() -> ExitCode {
    env_logger::init();

    let command = Command::parse();
    match run(command) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::from(255)
        }
    }
}

fn run(command: Command) -> Result<ExitCode, Error> {
    let (origins, flags) = configure(&command)?;

    if origins.is_empty() {
        warn!("no ports requested");
        return Ok(ExitCode::SUCCESS);
    }

    fs::create_dir_all(&flags.log_dir)?;

    let no_op = flags.no_op;
    let mut engine = Engine::new(flags);

    if !no_op {
        engine.pkgdb = quarry::pkg::PkgDb::load(&engine.flags)?;
        if let Err(err) = engine.forward_signals() {
            warn!("signal forwarding unavailable: {err}");
        }
    }

    let upgrade = command.upgrade;
    for origin in origins {
        cache::get_port(&mut engine, origin, move |e, result| match result {
            Ok(port) => schedule(e, port, upgrade),
            Err(origin) => error!("{origin}: no such port"),
        });
    }

    engine.run();
    report(&engine);

    match engine.exit_code {
        Some(code) => Ok(ExitCode::from(code as u8)),
        None if no_op => Ok(ExitCode::from(254)),
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Queue one requested port with the resolver
fn schedule(engine: &mut Engine, port: PortId, upgrade: bool) {
    let status = engine.ports[port].install_status;

    if upgrade {
        if status >= InstallStatus::Current {
            info!("{}: already up to date", engine.ports[port].origin);
            return;
        }
        // Rebuilding, so stop telling dependants we satisfy them
        engine.ports.get_mut(port).dependent.status = quarry::port::DependStatus::Unresolved;
    } else if engine.flags.mode != Mode::Recursive
        && !engine.flags.fetch_only
        && status != InstallStatus::Absent
    {
        info!("{}: already installed", engine.ports[port].origin);
        return;
    }

    engine.ports.get_mut(port).explicit = true;
    if engine.flags.target.contains(&BuildTarget::Package) {
        engine.ports.get_mut(port).want_package = true;
    }

    resolver::resolve(engine, port, |e, p| {
        let port = &e.ports[p];
        if port.failed {
            error!("{}: failed", port.origin);
        } else {
            info!("{}: done", port.origin);
        }
    });
}

/// Print a closing summary of what happened
fn report(engine: &Engine) {
    let mut failed: Vec<&Origin> = vec![];
    for id in engine.ports.iter_ids() {
        if engine.ports[id].failed {
            failed.push(&engine.ports[id].origin);
        }
    }

    if failed.is_empty() {
        info!("{} ports processed", engine.ports.len());
    } else {
        for origin in &failed {
            error!("failed: {origin}");
        }
        error!("{} of {} ports failed", failed.len(), engine.ports.len());
    }
}

/// Turn the parsed command into origins plus engine flags
fn configure(command: &Command) -> Result<(Vec<Origin>, Flags), Error> {
    let mut flags = Flags::default();

    flags.config = if command.batch { ConfigPolicy::None } else { command.config };
    flags.depend = command.method.clone();
    flags.fetch_only = command.fetch_only;
    flags.no_op = command.dry_run || command.dry_run_print;
    flags.no_op_print = command.dry_run_print;

    if command.upgrade || command.recursive_upgrade {
        flags.stage_floor = InstallStatus::Older;
    }
    if command.recursive_upgrade {
        flags.mode = Mode::Recursive;
    }

    let mut target = vec![BuildTarget::Install];
    if command.package {
        target.push(BuildTarget::Package);
    }
    target.push(BuildTarget::Clean);
    flags.target = target;

    if let Some(chroot) = &command.chroot {
        flags.chroot = chroot.trim_end_matches('/').to_owned();
    }
    if let Some(log_dir) = &command.log_dir {
        flags.log_dir = log_dir.clone();
    }
    if let Some(portsdir) = &command.portsdir {
        flags.portsdir = portsdir.clone();
    }

    for define in &command.define {
        flags.make_env.push((define.clone(), MakeVar::On));
    }

    // Positional arguments mix origins with VAR=VALUE overrides
    let mut origins = vec![];
    for arg in &command.args {
        match arg.split_once('=') {
            Some((var, value)) if is_make_variable(var) => {
                flags.make_env.push((var.to_owned(), MakeVar::Set(value.to_owned())));
            }
            _ => origins.push(Origin::from(arg.as_str())),
        }
    }

    if let Some(file) = &command.file {
        for line in fs::read_to_string(file)?.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                origins.push(Origin::from(line));
            }
        }
    }

    Ok((origins, flags))
}

fn is_make_variable(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("package database")]
    PkgDb(#[from] quarry::pkg::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn positional_overrides_split_from_origins() {
        let command = Command::parse_from(["quarry", "lang/foo", "WITH_DEBUG=yes", "devel/bar"]);
        let (origins, flags) = configure(&command).unwrap();

        assert_eq!(origins, vec![Origin::from("lang/foo"), Origin::from("devel/bar")]);
        assert!(flags
            .make_env
            .contains(&("WITH_DEBUG".to_owned(), MakeVar::Set("yes".to_owned()))));
    }

    #[test]
    fn batch_implies_no_config() {
        let command = Command::parse_from(["quarry", "-b", "lang/foo"]);
        let (_, flags) = configure(&command).unwrap();
        assert_eq!(flags.config, ConfigPolicy::None);
    }

    #[test]
    fn package_flag_extends_targets() {
        let command = Command::parse_from(["quarry", "-p", "lang/foo"]);
        let (_, flags) = configure(&command).unwrap();
        assert_eq!(
            flags.target,
            vec![BuildTarget::Install, BuildTarget::Package, BuildTarget::Clean]
        );
    }

    #[test]
    fn method_order_parses() {
        let command = Command::parse_from(["quarry", "--method", "package,repo,build", "lang/foo"]);
        let (_, flags) = configure(&command).unwrap();
        assert_eq!(
            flags.depend,
            vec![DependMethod::Package, DependMethod::Repo, DependMethod::Build]
        );
    }
}
