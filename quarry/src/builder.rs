// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Stage building infrastructure.
//!
//! A builder collates the work needed before a port may run one stage:
//! resolution of the stage's dependencies and completion of the
//! previous stage. Each port entering a builder gets a job immediately;
//! the job is only queued once the pending count reaches zero, and is
//! completed without running when the stage turns out unnecessary.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::engine::Engine;
use crate::env::{BuildTarget, Mode};
use crate::job::{self, JobId};
use crate::port::cache::PortId;
use crate::queue;
use crate::resolver;
use crate::signal::{Signal, SlotId};
use crate::stack::{run, Stage};

/// Progress reports emitted on each builder's `update` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderUpdate {
    Added,
    Queued,
    Active,
    Failed,
    Succeeded,
    Done,
}

/// Configure ports
pub struct ConfigBuilder {
    pub ports: HashMap<PortId, JobId>,
    pub failed: Vec<PortId>,
    pub succeeded: Vec<PortId>,
    pub update: Signal<(BuilderUpdate, PortId)>,
}

/// Load port dependencies
pub struct DependBuilder {
    pub ports: HashMap<PortId, Signal<PortId>>,
    loaded_slots: HashMap<PortId, SlotId>,
    pub failed: Vec<PortId>,
    pub update: Signal<(BuilderUpdate, PortId)>,
}

/// General port stage builder
pub struct StageBuilder {
    pub stage: Stage,
    prev: Option<Stage>,
    pub ports: HashMap<PortId, JobId>,
    pending: HashMap<PortId, usize>,
    /// dependency → ports of this builder waiting on it
    depends: HashMap<PortId, BTreeSet<PortId>>,
    /// Ports this builder holds primary ownership of
    pub cleanup: BTreeSet<PortId>,
    activated: BTreeSet<PortId>,
    pub done: Vec<PortId>,
    pub failed: Vec<PortId>,
    pub succeeded: Vec<PortId>,
    pub update: Signal<(BuilderUpdate, PortId)>,
}

impl StageBuilder {
    fn new(stage: Stage, prev: Option<Stage>) -> Self {
        if let Some(prev) = prev {
            debug_assert_eq!(stage.prev(), Some(prev));
        }

        Self {
            stage,
            prev,
            ports: HashMap::new(),
            pending: HashMap::new(),
            depends: HashMap::new(),
            cleanup: BTreeSet::new(),
            activated: BTreeSet::new(),
            done: vec![],
            failed: vec![],
            succeeded: vec![],
            update: Signal::new("Builder.update"),
        }
    }
}

/// The builder set of a run
pub struct Builders {
    pub config: ConfigBuilder,
    pub depend: DependBuilder,
    pub checksum: StageBuilder,
    pub fetch: StageBuilder,
    pub build: StageBuilder,
    pub install: StageBuilder,
    pub package: StageBuilder,
    pub pkginstall: StageBuilder,
    pub repoconfig: StageBuilder,
    pub repofetch: StageBuilder,
    pub repoinstall: StageBuilder,
}

impl Default for Builders {
    fn default() -> Self {
        Self {
            config: ConfigBuilder {
                ports: HashMap::new(),
                failed: vec![],
                succeeded: vec![],
                update: Signal::new("ConfigBuilder.update"),
            },
            depend: DependBuilder {
                ports: HashMap::new(),
                loaded_slots: HashMap::new(),
                failed: vec![],
                update: Signal::new("DependBuilder.update"),
            },
            checksum: StageBuilder::new(Stage::Checksum, None),
            fetch: StageBuilder::new(Stage::Fetch, Some(Stage::Checksum)),
            build: StageBuilder::new(Stage::Build, Some(Stage::Fetch)),
            install: StageBuilder::new(Stage::Install, Some(Stage::Build)),
            package: StageBuilder::new(Stage::Package, Some(Stage::Install)),
            pkginstall: StageBuilder::new(Stage::PkgInstall, None),
            repoconfig: StageBuilder::new(Stage::RepoConfig, None),
            repofetch: StageBuilder::new(Stage::RepoFetch, Some(Stage::RepoConfig)),
            repoinstall: StageBuilder::new(Stage::RepoInstall, Some(Stage::RepoFetch)),
        }
    }
}

impl Builders {
    pub fn stage(&self, stage: Stage) -> &StageBuilder {
        match stage {
            Stage::Checksum => &self.checksum,
            Stage::Fetch => &self.fetch,
            Stage::Build => &self.build,
            Stage::Install => &self.install,
            Stage::Package => &self.package,
            Stage::PkgInstall => &self.pkginstall,
            Stage::RepoConfig => &self.repoconfig,
            Stage::RepoFetch => &self.repofetch,
            Stage::RepoInstall => &self.repoinstall,
            Stage::Config | Stage::Depend => unreachable!("dedicated builders"),
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageBuilder {
        match stage {
            Stage::Checksum => &mut self.checksum,
            Stage::Fetch => &mut self.fetch,
            Stage::Build => &mut self.build,
            Stage::Install => &mut self.install,
            Stage::Package => &mut self.package,
            Stage::PkgInstall => &mut self.pkginstall,
            Stage::RepoConfig => &mut self.repoconfig,
            Stage::RepoFetch => &mut self.repofetch,
            Stage::RepoInstall => &mut self.repoinstall,
            Stage::Config | Stage::Depend => unreachable!("dedicated builders"),
        }
    }

    /// Every port currently known to any builder
    pub fn outstanding_ports(&self) -> BTreeSet<PortId> {
        let mut ports: BTreeSet<PortId> = self.config.ports.keys().copied().collect();
        ports.extend(self.depend.ports.keys());
        for stage in [
            &self.checksum,
            &self.fetch,
            &self.build,
            &self.install,
            &self.package,
            &self.pkginstall,
            &self.repoconfig,
            &self.repofetch,
            &self.repoinstall,
        ] {
            ports.extend(stage.ports.keys());
        }
        ports
    }
}

/// Add a port to be configured
pub fn config_add(engine: &mut Engine, port: PortId) -> JobId {
    if let Some(job) = engine.builders.config.ports.get(&port) {
        return *job;
    }

    debug_assert!(!engine.ports[port].stages.contains(Stage::Config));

    let job = job::new_stage(engine, port, Stage::Config);
    engine
        .jobs
        .get_mut(job)
        .completed
        .connect(move |e, j| config_cleanup(e, j));
    engine.builders.config.ports.insert(port, job);
    engine.builders.config.update.emit(&mut engine.events, (BuilderUpdate::Added, port));

    queue::add(engine, Stage::Config.queue(), job);
    engine.builders.config.update.emit(&mut engine.events, (BuilderUpdate::Queued, port));

    job
}

fn config_cleanup(engine: &mut Engine, job: JobId) {
    let Some(port) = engine.jobs[job].port() else {
        return;
    };

    engine.builders.config.ports.remove(&port);
    if engine.ports[port].failed {
        engine.builders.config.failed.push(port);
        engine.builders.config.update.emit(&mut engine.events, (BuilderUpdate::Failed, port));
    } else {
        engine.builders.config.succeeded.push(port);
        engine.builders.config.update.emit(&mut engine.events, (BuilderUpdate::Succeeded, port));
    }
}

/// Add a port to have its dependencies loaded; `slot` fires once the
/// Depend stage has finalised (successfully or not)
pub fn depend_add(engine: &mut Engine, port: PortId, slot: impl Fn(&mut Engine, PortId) + 'static) {
    if let Some(sig) = engine.builders.depend.ports.get_mut(&port) {
        sig.connect(slot);
        return;
    }

    let mut sig = Signal::new("DependBuilder.port");
    sig.connect(slot);
    engine.builders.depend.ports.insert(port, sig);
    engine.builders.depend.update.emit(&mut engine.events, (BuilderUpdate::Added, port));

    if !engine.ports[port].stages.contains(Stage::Config) {
        let config_job = config_add(engine, port);
        engine
            .jobs
            .get_mut(config_job)
            .completed
            .connect(move |e, _| depend_start(e, port));
    } else {
        depend_start(engine, port);
    }
}

fn depend_start(engine: &mut Engine, port: PortId) {
    if engine.ports[port].failed {
        depend_finished(engine, port);
        return;
    }
    if engine.ports[port].stages.contains(Stage::Depend) {
        depend_finished(engine, port);
        return;
    }

    engine.builders.depend.update.emit(&mut engine.events, (BuilderUpdate::Queued, port));
    engine.builders.depend.update.emit(&mut engine.events, (BuilderUpdate::Active, port));

    let slot = engine
        .ports
        .get_mut(port)
        .stage_completed
        .connect(move |e, _| depend_loaded(e, port));
    engine.builders.depend.loaded_slots.insert(port, slot);

    // Depend runs unqueued; it spawns nothing itself
    let _ = run::start(engine, port, Stage::Depend, None);
}

fn depend_loaded(engine: &mut Engine, port: PortId) {
    if !engine.ports[port].stages.contains(Stage::Depend) {
        return;
    }

    if let Some(slot) = engine.builders.depend.loaded_slots.remove(&port) {
        engine.ports.get_mut(port).stage_completed.disconnect(slot);
    }

    // Loading dependencies reshapes priorities across the graph
    if engine.ports[port].dependency.is_some() {
        queue::reorder_all(engine);
    }

    depend_finished(engine, port);
}

fn depend_finished(engine: &mut Engine, port: PortId) {
    if engine.ports[port].failed {
        engine.builders.depend.failed.push(port);
        engine.builders.depend.update.emit(&mut engine.events, (BuilderUpdate::Failed, port));
    } else {
        engine.builders.depend.update.emit(&mut engine.events, (BuilderUpdate::Succeeded, port));
    }

    if let Some(sig) = engine.builders.depend.ports.remove(&port) {
        sig.emit(&mut engine.events, port);
    }
}

/// Add a port as the primary target of this builder, taking cleanup
/// ownership from the previous stage
pub fn stage_add_primary(engine: &mut Engine, stage: Stage, port: PortId) -> JobId {
    engine.builders.stage_mut(stage).cleanup.insert(port);
    if let Some(prev) = engine.builders.stage(stage).prev {
        engine.builders.stage_mut(prev).cleanup.remove(&port);
    }
    stage_add(engine, stage, port)
}

/// Add a port to be built for this stage
pub fn stage_add(engine: &mut Engine, stage: Stage, port: PortId) -> JobId {
    if let Some(job) = engine.builders.stage(stage).ports.get(&port) {
        return *job;
    }

    debug_assert!(!engine.ports[port].failed);

    let job = job::new_stage(engine, port, stage);
    engine
        .jobs
        .get_mut(job)
        .completed
        .connect(move |e, j| stage_cleanup(e, stage, j));
    engine.jobs.get_mut(job).started.connect(move |e, _| {
        if e.builders.stage_mut(stage).activated.insert(port) {
            e.builders.stage(stage).update.emit(&mut e.events, (BuilderUpdate::Active, port));
        }
    });
    engine.builders.stage_mut(stage).ports.insert(port, job);
    engine.builders.stage(stage).update.emit(&mut engine.events, (BuilderUpdate::Added, port));

    if !engine.ports[port].stages.contains(Stage::Depend) {
        depend_add(engine, port, move |e, p| stage_add_deps(e, stage, p, 0));
    } else {
        debug_assert!(!engine.builders.depend.ports.contains_key(&port));
        stage_add_deps(engine, stage, port, 0);
    }

    job
}

/// Collate a port's dependencies and prior stage for this builder
fn stage_add_deps(engine: &mut Engine, stage: Stage, port: PortId, extra: usize) {
    // Don't try to build a port that has already failed or cannot build
    let dependency_failed = engine.ports[port].dependency.as_ref().map_or(false, |d| d.failed);
    if engine.ports[port].failed || dependency_failed {
        if let Some(&job) = engine.builders.stage(stage).ports.get(&port) {
            job::finish(engine, job);
        }
        return;
    }

    let depends: BTreeSet<PortId> = if engine.flags.mode == Mode::Recursive {
        engine.ports[port]
            .dependency
            .as_ref()
            .map(|d| d.get(Some(stage)))
            .unwrap_or_default()
    } else {
        crate::port::depend::unresolved(engine, port, stage)
    };

    let mut pending = depends.len() + extra;

    for dep in depends {
        let fresh = !engine.builders.stage(stage).depends.contains_key(&dep);
        engine
            .builders
            .stage_mut(stage)
            .depends
            .entry(dep)
            .or_default()
            .insert(port);
        if fresh {
            resolver::resolve(engine, dep, move |e, d| stage_depend_resolv(e, stage, d));
        }
    }

    // Build the previous stage if needed
    if let Some(prev) = engine.builders.stage(stage).prev {
        if port_check(engine, stage, port) {
            pending += 1;
            let prev_job = stage_add(engine, prev, port);
            engine
                .jobs
                .get_mut(prev_job)
                .completed
                .connect(move |e, _| stage_prev_resolv(e, stage, port));
        }
    }

    // A clean-first run scrubs the workdir before building
    if stage == Stage::Build
        && engine.flags.target.first() == Some(&BuildTarget::Clean)
        && port_check(engine, stage, port)
    {
        pending += 1;
        let clean_job = job::queue_clean(engine, port, true);
        engine
            .jobs
            .get_mut(clean_job)
            .completed
            .connect(move |e, _| stage_prev_resolv(e, stage, port));
    }

    debug!(
        "port '{}': added job for stage {stage}, waiting on {pending}",
        engine.ports[port].origin
    );

    engine.builders.stage_mut(stage).pending.insert(port, pending);
    if pending == 0 {
        port_ready(engine, stage, port);
    }
}

/// A dependency of some waiting ports resolved
fn stage_depend_resolv(engine: &mut Engine, stage: Stage, dep: PortId) {
    if port_failed(engine, stage, dep) {
        return;
    }

    let waiting = engine
        .builders
        .stage_mut(stage)
        .depends
        .remove(&dep)
        .unwrap_or_default();

    debug!(
        "port '{}': resolved for stage {stage} of {} ports",
        engine.ports[dep].origin,
        waiting.len()
    );

    for port in waiting {
        if !port_failed(engine, stage, port) {
            decrement_pending(engine, stage, port);
        }
    }
}

/// The previous stage (or pre-clean) of a waiting port completed
fn stage_prev_resolv(engine: &mut Engine, stage: Stage, port: PortId) {
    if !port_failed(engine, stage, port) {
        decrement_pending(engine, stage, port);
    }
}

fn decrement_pending(engine: &mut Engine, stage: Stage, port: PortId) {
    let Some(pending) = engine.builders.stage_mut(stage).pending.get_mut(&port) else {
        return;
    };
    *pending -= 1;
    if *pending == 0 {
        port_ready(engine, stage, port);
    }
}

/// Handle a failing port, propagating to the ports waiting on it
pub(crate) fn port_failed(engine: &mut Engine, stage: Stage, port: PortId) -> bool {
    if engine.builders.stage(stage).failed.contains(&port) || engine.flags.mode == Mode::Clean {
        return true;
    }

    let dependency_failed = engine.ports[port].dependency.as_ref().map_or(false, |d| d.failed);
    if !engine.ports[port].failed && !dependency_failed {
        return false;
    }

    if !engine.ports[port].dependent.propagate {
        // Shielded: drop the port quietly without failing its dependants
        if let Some(&job) = engine.builders.stage(stage).ports.get(&port) {
            engine.builders.stage_mut(stage).pending.remove(&port);
            for waiting in engine.builders.stage_mut(stage).depends.values_mut() {
                waiting.remove(&port);
            }
            job::finish(engine, job);
        }
        return true;
    }

    if let Some(waiting) = engine.builders.stage_mut(stage).depends.remove(&port) {
        // Inform the dependants that they fail because of this port
        for dependant in waiting {
            let in_prev = engine.builders.stage(stage).prev.map_or(false, |prev| {
                engine.builders.stage(prev).ports.contains_key(&dependant)
            });
            if !in_prev && !engine.builders.stage(stage).failed.contains(&dependant) {
                engine.events.post(move |e| {
                    port_failed(e, stage, dependant);
                });
            }
        }
    }

    // Only fail at this stage once the previous stage knows about it
    let in_prev = engine.builders.stage(stage).prev.map_or(false, |prev| {
        engine.builders.stage(prev).ports.contains_key(&port)
    });
    if !in_prev {
        engine.builders.stage_mut(stage).failed.push(port);
        if let Some(&job) = engine.builders.stage(stage).ports.get(&port) {
            engine.builders.stage_mut(stage).pending.remove(&port);
            job::finish(engine, job);
        }
    }

    true
}

/// All prerequisites collated; queue the stage or skip it
fn port_ready(engine: &mut Engine, stage: Stage, port: PortId) {
    if engine.builders.stage_mut(stage).pending.remove(&port).is_none() {
        return;
    }

    let Some(&job) = engine.builders.stage(stage).ports.get(&port) else {
        return;
    };

    if port_check(engine, stage, port) {
        debug!("port '{}': queuing job for stage {stage}", engine.ports[port].origin);
        engine.builders.stage(stage).update.emit(&mut engine.events, (BuilderUpdate::Queued, port));
        queue::add(engine, stage.queue(), job);
    } else {
        debug!("port '{}': skipping stage {stage}", engine.ports[port].origin);
        job::finish(engine, job);
    }
}

/// Check if the port should build this stage: it must not already
/// satisfy its dependants, and must not have run the stage before.
/// Package additionally runs for freshly installed ports.
fn port_check(engine: &Engine, stage: Stage, port: PortId) -> bool {
    let p = &engine.ports[port];
    let base = !p.resolved() && !p.stages.contains(stage);

    if stage == Stage::Package {
        base || p.stages.contains(Stage::Install)
    } else {
        base
    }
}

/// Cleanup after a port has completed its stage
fn stage_cleanup(engine: &mut Engine, stage: Stage, job: JobId) {
    let Some(port) = engine.jobs[job].port() else {
        return;
    };

    debug!("port '{}': completed job for stage {stage}", engine.ports[port].origin);

    engine.builders.stage_mut(stage).ports.remove(&port);
    engine.builders.stage_mut(stage).activated.remove(&port);

    let failed = port_failed(engine, stage, port);
    let primary = engine.builders.stage(stage).cleanup.contains(&port);

    if primary && engine.flags.mode != Mode::Clean {
        engine.builders.stage_mut(stage).cleanup.remove(&port);
        if !failed {
            engine.builders.stage_mut(stage).done.push(port);
            engine.builders.stage(stage).update.emit(&mut engine.events, (BuilderUpdate::Done, port));
        }
        if engine.flags.target.last() == Some(&BuildTarget::Clean) {
            job::queue_clean(engine, port, false);
        }
    } else if !failed {
        engine.builders.stage_mut(stage).succeeded.push(port);
        engine.builders.stage(stage).update.emit(&mut engine.events, (BuilderUpdate::Succeeded, port));
    }

    if failed {
        engine.builders.stage(stage).update.emit(&mut engine.events, (BuilderUpdate::Failed, port));
    }
}
