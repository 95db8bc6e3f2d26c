// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build engine.
//!
//! [`Engine`] owns every piece of run state and is threaded through
//! every callback, so nothing needs interior mutability or locking:
//! all application code runs to completion on the loop's thread and
//! only the readiness wait inside [`Engine::run`] blocks.

use std::collections::BTreeSet;

use log::debug;
use nix::sys::signal::{killpg, Signal as NixSignal};
use nix::unistd::Pid;

use crate::builder::Builders;
use crate::env::{Flags, Mode};
use crate::event::{EventLoop, Wakeup, DISPATCH_BATCH};
use crate::job::Jobs;
use crate::lock::Lock;
use crate::pkg::PkgDb;
use crate::port::cache::{PortCache, PortId};
use crate::process::{self, Spawner, Supervisor};
use crate::queue::{self, QueueId, Queues};
use crate::resolver::Resolver;
use crate::stack::build::DistState;

pub struct Engine {
    pub events: EventLoop,
    pub ports: PortCache,
    pub jobs: Jobs,
    pub queues: Queues,
    pub builders: Builders,
    pub resolver: Resolver,
    pub dist: DistState,
    pub pkgdb: PkgDb,
    pub procs: Supervisor,
    pub flags: Flags,
    pub spawner: Spawner,
    pub config_lock: Lock,
    /// Port dependency edges, for cycle detection at Depend time
    pub depgraph: dag::Dag<u32>,
    interrupts: u32,
    pub exit_code: Option<i32>,
    #[cfg(test)]
    pub test_log: Vec<String>,
}

impl Engine {
    pub fn new(flags: Flags) -> Self {
        let spawner = if flags.no_op {
            Spawner::DryRun {
                print: flags.no_op_print,
            }
        } else {
            Spawner::Host
        };

        Self {
            events: EventLoop::new(),
            ports: PortCache::default(),
            jobs: Jobs::default(),
            queues: Queues::new(flags.cpus),
            builders: Builders::default(),
            resolver: Resolver::default(),
            dist: DistState::default(),
            pkgdb: PkgDb::default(),
            procs: Supervisor::default(),
            flags,
            spawner,
            config_lock: Lock::default(),
            depgraph: dag::Dag::new(),
            interrupts: 0,
            exit_code: None,
            #[cfg(test)]
            test_log: vec![],
        }
    }

    /// Deliver SIGINT/SIGTERM to the event loop instead of the default
    /// handlers. Repeat signals escalate the shutdown.
    pub fn forward_signals(&self) -> Result<(), nix::Error> {
        use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

        let mut set = SigSet::empty();
        set.add(NixSignal::SIGINT);
        set.add(NixSignal::SIGTERM);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;

        let waker = self.events.waker();
        std::thread::spawn(move || {
            while set.wait().is_ok() {
                if waker.send(Wakeup::Interrupt).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Run the queued events until no callbacks remain and no queue has
    /// active jobs
    pub fn run(&mut self) {
        for slot in self.events.start.snapshot() {
            slot(self);
        }

        'main: loop {
            let mut dispatched = 0;
            while let Some(thunk) = self.events.pop() {
                self.events.event_count += 1;
                thunk(self);
                if self.events.halted() {
                    break 'main;
                }
                dispatched += 1;
                if dispatched == DISPATCH_BATCH {
                    self.dispatch_wakeups(false);
                    dispatched = 0;
                }
            }

            if self.events.halted() || !self.queues.any_active() {
                // Die once no events or outstanding processes remain
                break;
            }

            self.dispatch_wakeups(true);
        }

        for slot in self.events.stop.snapshot() {
            slot(self);
        }
    }

    fn dispatch_wakeups(&mut self, block: bool) {
        for wakeup in self.events.wait(block) {
            match wakeup {
                Wakeup::ChildExit {
                    pid,
                    code,
                    stdout,
                    stderr,
                } => process::dispatch(self, pid, code, stdout, stderr),
                Wakeup::Interrupt => self.interrupt(),
            }
        }
    }

    /// Pause listeners during an interactive stage
    pub fn suspend(&mut self) {
        for slot in self.events.stop.snapshot() {
            slot(self);
        }
    }

    pub fn resume(&mut self) {
        for slot in self.events.start.snapshot() {
            slot(self);
        }
    }

    /// One shutdown escalation step per delivered signal
    pub fn interrupt(&mut self) {
        self.interrupts += 1;
        match self.interrupts {
            1 => self.stop(false, false),
            2 => self.stop(true, false),
            _ => {
                self.exit_code = Some(254);
                self.stop(true, true);
            }
        }
    }

    /// Stop building ports and clean up.
    ///
    /// Zeroes every queue's admission, signals active process groups
    /// (SIGTERM, or SIGKILL with `kill`), and hands outstanding ports
    /// to the clean queue, which is boosted unless `kill_clean` also
    /// shuts cleanup down.
    pub fn stop(&mut self, kill: bool, kill_clean: bool) {
        if self.flags.no_op {
            self.exit_code = Some(254);
            self.events.halt();
            return;
        }

        debug!("stopping (kill={kill}, kill_clean={kill_clean})");
        self.flags.mode = Mode::Clean;

        // Signal all active process groups
        let mut kill_queues: Vec<QueueId> = vec![QueueId::Attr];
        kill_queues.extend(QueueId::STAGES);
        if kill_clean {
            kill_queues.push(QueueId::Clean);
        }
        let signal = if kill { NixSignal::SIGKILL } else { NixSignal::SIGTERM };
        for id in &kill_queues {
            for job in self.queues[*id].active.clone() {
                if let Some(pid) = self.jobs[job].pid {
                    let _ = killpg(Pid::from_raw(pid), signal);
                }
            }
        }

        // Block admission everywhere
        queue::set_load(self, QueueId::Attr, 0);
        for id in QueueId::STAGES {
            queue::set_load(self, id, 0);
        }

        if kill_clean {
            queue::set_load(self, QueueId::Clean, 0);
            return;
        }

        // Make cleaning go a bit faster
        let cpus = self.flags.cpus;
        queue::set_load(self, QueueId::Clean, cpus);

        // Ports whose stage is still running clean once it finalises
        let mut active_ports: BTreeSet<PortId> = BTreeSet::new();
        for id in QueueId::STAGES {
            for job in self.queues[id].active.clone() {
                if let Some(port) = self.jobs[job].port() {
                    active_ports.insert(port);
                    self.ports
                        .get_mut(port)
                        .stage_completed
                        .connect(move |e, p| {
                            crate::job::queue_clean(e, p, false);
                        });
                }
            }
        }

        // Clean all other outstanding ports
        for port in self.builders.outstanding_ports() {
            if !active_ports.contains(&port) {
                crate::job::queue_clean(self, port, false);
            }
        }
    }
}

#[cfg(test)]
impl Engine {
    pub fn for_tests() -> Self {
        let mut flags = Flags::default();
        flags.log_dir = std::env::temp_dir().join("quarry-tests");
        flags.cpus = 2;
        let _ = std::fs::create_dir_all(&flags.log_dir);
        Self::new(flags)
    }

    /// Run every pending callback to quiescence without blocking on
    /// the readiness channel
    pub fn drain_for_tests(&mut self) {
        while let Some(thunk) = self.events.pop() {
            self.events.event_count += 1;
            thunk(self);
        }
    }
}

#[cfg(test)]
pub mod test_util {
    use std::rc::Rc;

    use super::Engine;
    use crate::port::attr::Attributes;
    use crate::port::cache::{self, PortId};
    use crate::port::Origin;
    use crate::process::{Request, Spawner, StubExit};

    /// Insert a ready port with minimal attributes
    pub fn seed_port(engine: &mut Engine, origin: &str) -> PortId {
        seed_port_with(engine, origin, |_| {})
    }

    /// Insert a ready port, letting the caller shape its attributes
    pub fn seed_port_with(
        engine: &mut Engine,
        origin: &str,
        shape: impl FnOnce(&mut Attributes),
    ) -> PortId {
        let origin = Origin::from(origin);
        let mut attrs = Attributes {
            name: origin.name().to_owned(),
            pkgname: format!("{}-1.0", origin.name()),
            jobs_number: 1,
            ..Attributes::default()
        };
        shape(&mut attrs);
        cache::insert_ready(engine, origin, attrs)
    }

    /// Script every subprocess outcome
    pub fn stub_spawner(engine: &mut Engine, script: impl Fn(&Request) -> StubExit + 'static) {
        engine.spawner = Spawner::Stub(Rc::new(script));
    }

    /// Count recorded spawns whose arguments contain `needle`
    pub fn spawns_with(engine: &Engine, needle: &str) -> usize {
        engine
            .procs
            .spawned
            .iter()
            .filter(|r| r.args.iter().any(|a| a == needle))
            .count()
    }
}

#[cfg(test)]
mod scenario {
    use super::test_util::{seed_port_with, spawns_with, stub_spawner};
    use super::*;
    use crate::env::BuildTarget;
    use crate::port::{DependKind, DependStatus, InstallStatus, Origin};
    use crate::process::StubExit;
    use crate::resolver;
    use crate::stack::Stage;

    fn build_engine() -> Engine {
        let mut engine = Engine::for_tests();
        engine.flags.target = vec![BuildTarget::Install];
        stub_spawner(&mut engine, |_| StubExit::default());
        engine
    }

    fn resolve(engine: &mut Engine, port: crate::port::cache::PortId) {
        engine.ports.get_mut(port).explicit = true;
        resolver::resolve(engine, port, |_, _| {});
        engine.drain_for_tests();
    }

    #[test]
    fn leaf_port_builds_cleanly() {
        let distdir = tempfile::tempdir().unwrap();
        std::fs::write(distdir.path().join("foo-1.0.tgz"), b"dist").unwrap();
        let distdir = distdir.path().display().to_string();

        let mut engine = build_engine();
        let port = seed_port_with(&mut engine, "lang/foo", move |attrs| {
            attrs.distfiles = vec!["foo-1.0.tgz".into()];
            attrs.distdir = distdir.clone();
        });

        resolve(&mut engine, port);

        for stage in [
            Stage::Config,
            Stage::Depend,
            Stage::Checksum,
            Stage::Fetch,
            Stage::Build,
            Stage::Install,
        ] {
            assert!(engine.ports[port].stages.contains(stage), "missing {stage}");
        }
        assert_eq!(engine.ports[port].install_status, InstallStatus::Current);
        assert!(engine.ports[port].resolved());
        assert!(engine.resolver.is_finished(port));

        // Config skipped (no options), Fetch skipped (checksum passed);
        // one subprocess each for checksum, build and install
        assert_eq!(spawns_with(&engine, "checksum"), 1);
        assert_eq!(spawns_with(&engine, "all"), 1);
        assert_eq!(spawns_with(&engine, "install"), 1);
        assert_eq!(engine.procs.spawned.len(), 3);

        assert!(!engine.queues.any_active());
    }

    #[test]
    fn shared_distfile_is_checked_once() {
        let distdir = tempfile::tempdir().unwrap();
        std::fs::write(distdir.path().join("dist.tgz"), b"dist").unwrap();
        let distdir = distdir.path().display().to_string();

        let mut engine = build_engine();
        queue::set_load(&mut engine, QueueId::Checksum, 2);

        let shared = |attrs: &mut crate::port::Attributes, distdir: &str| {
            attrs.distfiles = vec!["dist.tgz".into()];
            attrs.distdir = distdir.to_owned();
        };
        let dir = distdir.clone();
        let a = seed_port_with(&mut engine, "lang/a", move |attrs| shared(attrs, &dir));
        let dir = distdir.clone();
        let b = seed_port_with(&mut engine, "lang/b", move |attrs| shared(attrs, &dir));

        engine.ports.get_mut(a).explicit = true;
        engine.ports.get_mut(b).explicit = true;
        resolver::resolve(&mut engine, a, |_, _| {});
        resolver::resolve(&mut engine, b, |_, _| {});
        engine.drain_for_tests();

        // Exactly one checksum subprocess across both ports; the
        // loser stalled on the file lock and completed via the shared
        // distfile set after release
        assert_eq!(spawns_with(&engine, "checksum"), 1);
        for port in [a, b] {
            assert!(engine.ports[port].stages.contains(Stage::Checksum));
            assert!(engine.ports[port].stages.contains(Stage::Fetch));
            assert_eq!(engine.ports[port].install_status, InstallStatus::Current);
        }
        assert!(!engine.queues.any_active());
    }

    #[test]
    fn resolver_falls_back_across_stacks() {
        let mut engine = build_engine();
        engine.flags.depend = vec![
            crate::env::DependMethod::Package,
            crate::env::DependMethod::Repo,
            crate::env::DependMethod::Build,
        ];

        // Repo fetches fail; everything else succeeds
        stub_spawner(&mut engine, |request| StubExit {
            code: i32::from(request.program == "pkg" && request.args.first().map(String::as_str) == Some("fetch")),
            stdout: String::new(),
        });

        let port = seed_port_with(&mut engine, "lang/leaf", |_| {});
        resolve(&mut engine, port);

        // No package file: PkgInstall skipped softly. Repo fetch
        // failed: repo stack latched. Build path carried the port.
        assert!(engine.ports[port].stacks.package.failed.is_none());
        assert_eq!(engine.ports[port].stacks.repo.failed, Some(Stage::RepoFetch));
        assert!(engine.ports[port].stacks.build.failed.is_none());
        assert!(!engine.ports[port].failed);
        assert_eq!(engine.ports[port].install_status, InstallStatus::Current);
        assert!(engine.ports[port].resolved());
        assert_eq!(spawns_with(&engine, "install"), 1);
    }

    #[test]
    fn shielded_failure_leaves_dependants_unresolved() {
        let mut engine = build_engine();

        // y's build fails
        stub_spawner(&mut engine, |request| StubExit {
            code: i32::from(request.args.iter().any(|a| a == "all") && request.args.iter().any(|a| a.ends_with("lang/y"))),
            stdout: String::new(),
        });

        let y = seed_port_with(&mut engine, "lang/y", |_| {});
        let x = seed_port_with(&mut engine, "lang/x", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Lib)
                .push(("y".into(), Origin::from("lang/y")));
        });

        // Shield y as soon as the resolver takes it on
        engine.builders.install.update.connect(move |e, (update, port)| {
            if update == crate::builder::BuilderUpdate::Added && port == y {
                e.ports.get_mut(y).dependent.propagate = false;
            }
        });

        resolve(&mut engine, x);

        assert!(engine.ports[y].failed);
        // The shield kept the failure out of the graph
        assert_eq!(engine.ports[y].dependent.status, DependStatus::Unresolved);
        assert!(!engine.ports[x].failed);
        assert_eq!(engine.ports[x].dependent.status, DependStatus::Unresolved);
        assert!(!engine.ports[x].stages.contains(Stage::Install));
        // x's install job is still collated, never queued
        assert!(engine.builders.install.ports.contains_key(&x));
        assert!(!engine.queues.any_active());
    }

    #[test]
    fn dependency_failure_cascades() {
        let mut engine = build_engine();

        stub_spawner(&mut engine, |request| StubExit {
            code: i32::from(request.args.iter().any(|a| a == "all") && request.args.iter().any(|a| a.ends_with("lang/y"))),
            stdout: String::new(),
        });

        let y = seed_port_with(&mut engine, "lang/y", |_| {});
        let x = seed_port_with(&mut engine, "lang/x", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Lib)
                .push(("y".into(), Origin::from("lang/y")));
        });

        resolve(&mut engine, x);

        assert!(engine.ports[y].failed);
        assert_eq!(engine.ports[y].dependent.status, DependStatus::Failure);
        assert_eq!(engine.ports[x].dependent.status, DependStatus::Failure);
        assert!(engine.ports[x].dependency.as_ref().unwrap().failed);
        // x never reached the install path, but keeps its early stages
        assert!(!engine.ports[x].stages.contains(Stage::Install));
        assert!(engine.ports[x].stages.contains(Stage::Depend));
        assert!(!engine.queues.any_active());
    }

    #[test]
    fn completed_ports_spawn_nothing() {
        let mut engine = build_engine();
        let port = seed_port_with(&mut engine, "lang/foo", |_| {});

        engine.ports.get_mut(port).install_status = InstallStatus::Current;
        engine.ports.get_mut(port).dependent.status = DependStatus::Resolved;

        resolve(&mut engine, port);

        assert!(engine.procs.spawned.is_empty());
        assert!(engine.resolver.is_finished(port));
        assert!(!engine.queues.any_active());
    }

    #[test]
    fn fetch_only_stops_after_fetch() {
        let mut engine = build_engine();
        engine.flags.fetch_only = true;

        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs.distfiles = vec!["foo.tgz".into()];
            attrs.distdir = "/nonexistent".into();
        });

        resolve(&mut engine, port);

        assert!(engine.ports[port].stages.contains(Stage::Fetch));
        assert!(engine.ports[port].resolved());
        // The install path never ran
        assert!(!engine.ports[port].stages.contains(Stage::Build));
        assert!(!engine.ports[port].stages.contains(Stage::Install));
        assert_eq!(spawns_with(&engine, "install"), 0);
        assert_eq!(spawns_with(&engine, "all"), 0);
        assert_eq!(engine.ports[port].install_status, InstallStatus::Absent);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_exits_immediately_with_no_work() {
        let mut engine = Engine::for_tests();
        engine.run();
        assert_eq!(engine.exit_code, None);
        assert!(!engine.queues.any_active());
    }

    #[test]
    fn interrupt_escalates() {
        let mut engine = Engine::for_tests();
        engine.flags.no_op = false;

        engine.interrupt();
        assert_eq!(engine.flags.mode, Mode::Clean);
        assert_eq!(engine.queues[QueueId::Build].load(), 0);
        assert_eq!(engine.queues[QueueId::Clean].load(), engine.flags.cpus);
        assert_eq!(engine.exit_code, None);

        engine.interrupt();
        assert_eq!(engine.exit_code, None);

        engine.interrupt();
        assert_eq!(engine.exit_code, Some(254));
        assert_eq!(engine.queues[QueueId::Clean].load(), 0);
    }

    #[test]
    fn dry_run_stop_aborts_with_254() {
        let mut engine = Engine::for_tests();
        engine.flags.no_op = true;

        engine.stop(false, false);
        assert_eq!(engine.exit_code, Some(254));
        assert!(engine.events.halted());
    }
}
