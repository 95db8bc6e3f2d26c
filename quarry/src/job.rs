// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Job handling for queue managers.
//!
//! A job is the unit of scheduled work: it carries a load against its
//! queue's cap, a priority read live from its owning port, and fires
//! `started` before any work and `completed` exactly once when done.

use log::debug;

use crate::engine::Engine;
use crate::make::{self, MakeVar};
use crate::port::cache::PortId;
use crate::port::Origin;
use crate::queue::{self, QueueId};
use crate::signal::Signal;
use crate::stack::{self, Stage};

/// The job cannot run right now; the queue parks it until the
/// contested resource may have been released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stalled;

/// Index of a job within the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

#[derive(Debug, Clone)]
pub enum JobKind {
    /// Run one stage of a port's pipeline
    Stage { port: PortId, stage: Stage },
    /// Retrieve a port's attributes
    Attr { origin: Origin },
    /// Clean a port's work directory
    Clean { port: PortId, force: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Stalled,
    Done,
}

pub struct Job {
    pub kind: JobKind,
    pub load: u32,
    pub pid: Option<i32>,
    pub state: JobState,
    /// Insertion order, breaking priority ties
    pub seq: u64,
    pub queue: QueueId,
    pub started: Signal<JobId>,
    pub completed: Signal<JobId>,
    /// Connection to the port's stage_completed signal while running
    port_slot: Option<crate::signal::SlotId>,
}

impl Job {
    /// The port this job works on, if any
    pub fn port(&self) -> Option<PortId> {
        match &self.kind {
            JobKind::Stage { port, .. } | JobKind::Clean { port, .. } => Some(*port),
            JobKind::Attr { .. } => None,
        }
    }

    /// The stage this job runs, if it is a stage job
    pub fn stage(&self) -> Option<Stage> {
        match &self.kind {
            JobKind::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// The job arena; jobs are never reused within a run
#[derive(Default)]
pub struct Jobs {
    arena: Vec<Job>,
    seq: u64,
}

impl Jobs {
    fn insert(&mut self, kind: JobKind, load: u32, queue: QueueId) -> JobId {
        let id = JobId(self.arena.len() as u32);
        self.seq += 1;
        self.arena.push(Job {
            kind,
            load,
            pid: None,
            state: JobState::Queued,
            seq: self.seq,
            queue,
            started: Signal::new("Job.started"),
            completed: Signal::new("Job.completed"),
            port_slot: None,
        });
        id
    }

    pub fn get_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.arena[id.0 as usize]
    }
}

impl std::ops::Index<JobId> for Jobs {
    type Output = Job;

    fn index(&self, id: JobId) -> &Job {
        &self.arena[id.0 as usize]
    }
}

impl std::ops::IndexMut<JobId> for Jobs {
    fn index_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.arena[id.0 as usize]
    }
}

/// Create a stage job for a port. Build jobs weigh the port's
/// requested make jobs; every other stage weighs one.
pub fn new_stage(engine: &mut Engine, port: PortId, stage: Stage) -> JobId {
    let load = match stage {
        Stage::Build => engine.ports[port].attr.jobs_number.max(1),
        _ => 1,
    };

    engine.jobs.insert(JobKind::Stage { port, stage }, load, stage.queue())
}

/// Queue an attribute retrieval job for an origin
pub fn queue_attr(engine: &mut Engine, origin: Origin) {
    let job = engine.jobs.insert(JobKind::Attr { origin }, 1, QueueId::Attr);
    queue::add(engine, QueueId::Attr, job);
}

/// Queue a clean job for a port
pub fn queue_clean(engine: &mut Engine, port: PortId, force: bool) -> JobId {
    let job = engine.jobs.insert(JobKind::Clean { port, force }, 1, QueueId::Clean);
    queue::add(engine, QueueId::Clean, job);
    job
}

/// The job's live priority, read from its owning port
pub fn priority(engine: &Engine, job: JobId) -> i64 {
    match &engine.jobs[job].kind {
        JobKind::Stage { port, .. } => engine.ports[*port].dependent.priority,
        JobKind::Attr { .. } | JobKind::Clean { .. } => 0,
    }
}

/// Run the job. An `Err(Stalled)` asks the queue to park it and run
/// another in its place.
pub fn run(engine: &mut Engine, job: JobId) -> Result<(), Stalled> {
    engine.jobs[job].started.emit(&mut engine.events, job);

    match engine.jobs[job].kind.clone() {
        JobKind::Stage { port, stage } => {
            let slot = engine
                .ports
                .get_mut(port)
                .stage_completed
                .connect(move |e, _| stage_done(e, job));
            engine.jobs.get_mut(job).port_slot = Some(slot);

            match stack::run::start(engine, port, stage, Some(job)) {
                Ok(()) => Ok(()),
                Err(Stalled) => {
                    if let Some(slot) = engine.jobs.get_mut(job).port_slot.take() {
                        engine.ports.get_mut(port).stage_completed.disconnect(slot);
                    }
                    Err(Stalled)
                }
            }
        }
        JobKind::Attr { origin } => {
            run_attr(engine, job, origin);
            Ok(())
        }
        JobKind::Clean { port, force } => {
            run_clean(engine, job, port, force);
            Ok(())
        }
    }
}

/// Handle the completion of a port stage
fn stage_done(engine: &mut Engine, job: JobId) {
    if engine.jobs[job].state == JobState::Done {
        return;
    }

    let (Some(port), Some(stage)) = (engine.jobs[job].port(), engine.jobs[job].stage()) else {
        return;
    };

    if engine.ports[port].stages.contains(stage) {
        if let Some(slot) = engine.jobs.get_mut(job).port_slot.take() {
            engine.ports.get_mut(port).stage_completed.disconnect(slot);
        }
        done(engine, job);
    }
}

/// Indicate the job's work has completed
pub fn done(engine: &mut Engine, job: JobId) {
    if engine.jobs[job].state == JobState::Done {
        return;
    }

    let was_active = engine.jobs[job].state == JobState::Active;
    engine.jobs.get_mut(job).pid = None;
    engine.jobs.get_mut(job).state = JobState::Done;

    if was_active {
        let queue = engine.jobs[job].queue;
        queue::done(engine, queue, job);
    }

    engine.jobs[job].completed.emit(&mut engine.events, job);
}

/// Complete a job that never needed to run (its stage was skipped)
pub fn finish(engine: &mut Engine, job: JobId) {
    engine.events.post(move |e| done(e, job));
}

fn run_attr(engine: &mut Engine, job: JobId, origin: Origin) {
    let pid = crate::port::attr::query(engine, origin, move |e, origin, attrs| {
        e.jobs.get_mut(job).pid = None;
        crate::port::cache::attr_loaded(e, origin, attrs);
        done(e, job);
    });
    engine.jobs.get_mut(job).pid = pid;
}

fn run_clean(engine: &mut Engine, job: JobId, port: PortId, force: bool) {
    let built = engine.ports[port].stages.contains(Stage::Build);

    if built || force {
        debug!("port '{}': full clean", engine.ports[port].origin);
        let pid = make::make_target(
            engine,
            port,
            &["clean"],
            &[("NOCLEANDEPENDS", MakeVar::On)],
            None,
            move |e, _exit| {
                e.jobs.get_mut(job).pid = None;
                post_clean(e, port);
                done(e, job);
            },
        );
        engine.jobs.get_mut(job).pid = pid;
    } else {
        debug!("port '{}': quick clean", engine.ports[port].origin);
        post_clean(engine, port);
        finish(engine, job);
    }
}

/// Drop build-side stages and remove the log file of untroubled ports
fn post_clean(engine: &mut Engine, port: PortId) {
    let built = engine.ports[port].stages.contains(Stage::Build);
    if built {
        let stages = &mut engine.ports.get_mut(port).stages;
        stages.remove(Stage::Build);
        stages.remove(Stage::Install);
        stages.remove(Stage::Package);
    }

    let p = &engine.ports[port];
    let dependency_failed = p.dependency.as_ref().map_or(false, |d| d.failed);
    let cleaning = engine.flags.mode == crate::env::Mode::Clean;

    if !p.dependent.failed() && p.log_file.is_file() && (cleaning || built || dependency_failed) {
        let _ = std::fs::remove_file(&engine.ports[port].log_file);
    }
}
