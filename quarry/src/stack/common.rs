// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The common stack: Config and Depend.
//!
//! Config is the only interactive stage. It holds a process-global
//! gate while the configurator owns the terminal, and a successful run
//! re-queries the port's attributes to pick up whatever the new option
//! set changed.

use std::collections::BTreeSet;

use log::debug;

use crate::engine::Engine;
use crate::env::ConfigPolicy;
use crate::job::{JobId, Stalled};
use crate::pkg;
use crate::port::attr::{self, Attributes};
use crate::port::cache::PortId;
use crate::port::InstallStatus;
use crate::process::Pipe;
use crate::stack::{run, Stage};

/// Check the options file to see if it is up to date under the
/// configured policy
pub fn config_complete(engine: &mut Engine, port: PortId) -> bool {
    let p = &engine.ports[port];
    if p.attr.options.is_empty() || engine.flags.config == ConfigPolicy::None {
        return true;
    }
    if engine.flags.config == ConfigPolicy::All {
        return false;
    }

    let optionsfile = engine.flags.rooted(&p.attr.optionsfile);
    let mut recorded: BTreeSet<String> = BTreeSet::new();
    let mut recorded_pkgname = String::new();

    if let Ok(contents) = std::fs::read_to_string(optionsfile) {
        for line in contents.lines() {
            if let Some(pkgname) = line.strip_prefix("_OPTIONS_READ=") {
                // The pkgname this options file was last written for
                recorded_pkgname = pkgname.to_owned();
            } else if line.starts_with("WITH") {
                if let Some((_, option)) = line.split_once('_') {
                    recorded.insert(option.split('=').next().unwrap_or_default().to_owned());
                }
            }
        }
    }

    match engine.flags.config {
        ConfigPolicy::Changed => {
            let declared: BTreeSet<String> = p.attr.options.iter().map(|o| o.name.clone()).collect();
            recorded == declared
        }
        ConfigPolicy::Newer => {
            !recorded_pkgname.is_empty()
                && pkg::version(&p.attr.pkgname, &recorded_pkgname) != InstallStatus::Newer
        }
        ConfigPolicy::None | ConfigPolicy::All => unreachable!("handled above"),
    }
}

/// Take the configurator gate and hand the terminal to the recipe
pub fn config_pre_make(engine: &mut Engine, port: PortId, job: Option<JobId>) -> Result<Option<i32>, Stalled> {
    if !engine.config_lock.acquire() {
        return Err(Stalled);
    }
    engine.suspend();

    let pid = crate::make::make_target(engine, port, &["config"], &[], Some(Pipe::Inherit), move |e, exit| {
        config_post_make(e, port, job, exit.success());
    });

    Ok(pid)
}

/// Refetch attribute data if the port was configured successfully
fn config_post_make(engine: &mut Engine, port: PortId, job: Option<JobId>, status: bool) {
    if let Some(job) = job {
        engine.jobs.get_mut(job).pid = None;
    }
    engine.config_lock.release();
    engine.resume();

    if !status {
        run::finalise(engine, port, Stage::Config, false);
        return;
    }

    let origin = engine.ports[port].origin.clone();
    let pid = attr::query(engine, origin, move |e, _origin, attrs| {
        config_load_attr(e, port, job, attrs);
    });
    if let Some(job) = job {
        engine.jobs.get_mut(job).pid = pid;
    }
}

/// Load the re-queried attributes for this port
fn config_load_attr(engine: &mut Engine, port: PortId, job: Option<JobId>, attrs: Option<Attributes>) {
    if let Some(job) = job {
        engine.jobs.get_mut(job).pid = None;
    }

    let Some(attrs) = attrs else {
        run::finalise(engine, port, Stage::Config, false);
        return;
    };

    let depends_changed = engine.ports[port].attr.depends != attrs.depends;
    let old_log = engine.ports[port].log_file.clone();

    engine.ports.get_mut(port).attr = attrs;

    let new_log = engine.flags.log_dir.join(&engine.ports[port].attr.pkgname);
    if new_log != old_log {
        engine.ports.get_mut(port).log_file = new_log.clone();
        if old_log.is_file() {
            let _ = std::fs::rename(&old_log, &new_log);
        }
    }

    // Configuration may have revealed different dependencies; a
    // completed Depend stage is only kept when the vectors held still
    if depends_changed && engine.ports[port].stages.contains(Stage::Depend) {
        debug!(
            "port '{}': options changed the dependency set, reloading",
            engine.ports[port].origin
        );
        engine.ports.get_mut(port).stages.remove(Stage::Depend);
        engine.ports.get_mut(port).dependency = None;
    }

    run::finalise(engine, port, Stage::Config, true);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::seed_port_with;
    use crate::port::attr::PortOption;

    fn option(name: &str) -> PortOption {
        PortOption {
            name: name.into(),
            descr: String::new(),
            default: "on".into(),
        }
    }

    fn optioned_port(engine: &mut Engine, optionsfile: &std::path::Path) -> PortId {
        let optionsfile = optionsfile.display().to_string();
        seed_port_with(engine, "lang/foo", move |attrs| {
            attrs.options = vec![option("X11"), option("DOCS")];
            attrs.optionsfile = optionsfile.clone();
        })
    }

    #[test]
    fn optionless_ports_never_configure() {
        let mut engine = Engine::for_tests();
        let port = seed_port_with(&mut engine, "lang/foo", |_| {});
        assert!(config_complete(&mut engine, port));
    }

    #[test]
    fn policy_none_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::for_tests();
        let port = optioned_port(&mut engine, &dir.path().join("options"));

        engine.flags.config = ConfigPolicy::None;
        assert!(config_complete(&mut engine, port));

        engine.flags.config = ConfigPolicy::All;
        assert!(!config_complete(&mut engine, port));
    }

    #[test]
    fn policy_changed_compares_option_sets() {
        let dir = tempfile::tempdir().unwrap();
        let optionsfile = dir.path().join("options");
        let mut engine = Engine::for_tests();
        engine.flags.config = ConfigPolicy::Changed;
        let port = optioned_port(&mut engine, &optionsfile);

        // No recorded options yet: reconfigure
        assert!(!config_complete(&mut engine, port));

        std::fs::write(
            &optionsfile,
            "_OPTIONS_READ=foo-1.0\nWITH_X11=true\nWITH_DOCS=true\n",
        )
        .unwrap();
        assert!(config_complete(&mut engine, port));

        // A missing option forces reconfiguration
        std::fs::write(&optionsfile, "_OPTIONS_READ=foo-1.0\nWITH_X11=true\n").unwrap();
        assert!(!config_complete(&mut engine, port));
    }

    #[test]
    fn policy_newer_compares_pkgnames() {
        let dir = tempfile::tempdir().unwrap();
        let optionsfile = dir.path().join("options");
        let mut engine = Engine::for_tests();
        engine.flags.config = ConfigPolicy::Newer;
        let port = optioned_port(&mut engine, &optionsfile);

        std::fs::write(&optionsfile, "_OPTIONS_READ=foo-1.0\n").unwrap();
        // Recorded for the same version: up to date
        assert!(config_complete(&mut engine, port));

        std::fs::write(&optionsfile, "_OPTIONS_READ=foo-0.9\n").unwrap();
        // Recipe moved past the recorded pkgname: reconfigure
        assert!(!config_complete(&mut engine, port));
    }
}
