// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Job queues with load-weighted admission.
//!
//! One [`QueueManager`] exists per resource class. Admission scans the
//! stalled list before the queue proper, always preferring the highest
//! priority job whose load fits the remaining capacity; when nothing
//! fits and the queue is idle, the lightest job is admitted so the
//! queue cannot wedge. Stalled jobs are retried whenever capacity or a
//! contested resource may have been released.

use std::cmp::Reverse;

use crate::engine::Engine;
use crate::job::{self, JobId, JobState};

/// The queue instances of a standard configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QueueId {
    Attr,
    Config,
    Checksum,
    Fetch,
    Build,
    Install,
    Package,
    Clean,
}

impl QueueId {
    pub const ALL: [QueueId; 8] = [
        QueueId::Attr,
        QueueId::Config,
        QueueId::Checksum,
        QueueId::Fetch,
        QueueId::Build,
        QueueId::Install,
        QueueId::Package,
        QueueId::Clean,
    ];

    /// The stage queues, excluding the attr and clean helpers
    pub const STAGES: [QueueId; 6] = [
        QueueId::Config,
        QueueId::Checksum,
        QueueId::Fetch,
        QueueId::Build,
        QueueId::Install,
        QueueId::Package,
    ];

    /// Default load cap for this queue
    pub fn default_load(self, cpus: u32) -> u32 {
        match self {
            QueueId::Attr => cpus * 2,
            QueueId::Config => 1,
            QueueId::Checksum => (cpus / 2).max(1),
            QueueId::Fetch => 1,
            QueueId::Build => cpus * 2,
            QueueId::Install => 1,
            QueueId::Package => 1,
            QueueId::Clean => 1,
        }
    }
}

/// Manages jobs and runs them as resources come available
#[derive(Debug)]
pub struct QueueManager {
    pub queue: Vec<JobId>,
    pub active: Vec<JobId>,
    pub stalled: Vec<JobId>,
    load: u32,
    pub active_load: u32,
    dirty: bool,
}

impl QueueManager {
    fn new(load: u32) -> Self {
        Self {
            queue: vec![],
            active: vec![],
            stalled: vec![],
            load,
            active_load: 0,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.active.len() + self.stalled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load(&self) -> u32 {
        self.load
    }

    /// Mark the queued jobs for re-sorting, their priorities may have
    /// changed
    pub fn reorder(&mut self) {
        self.dirty = true;
    }

    /// Remove a job that has not started
    pub fn remove(&mut self, job: JobId) -> bool {
        let len = self.queue.len();
        self.queue.retain(|j| *j != job);
        self.queue.len() != len
    }
}

/// The per-resource-class queue managers
pub struct Queues {
    managers: [QueueManager; QueueId::ALL.len()],
}

impl Queues {
    pub fn new(cpus: u32) -> Self {
        Self {
            managers: QueueId::ALL.map(|id| QueueManager::new(id.default_load(cpus))),
        }
    }

    /// Whether any queue still has active work
    pub fn any_active(&self) -> bool {
        self.managers.iter().any(|q| !q.active.is_empty())
    }
}

impl std::ops::Index<QueueId> for Queues {
    type Output = QueueManager;

    fn index(&self, id: QueueId) -> &QueueManager {
        &self.managers[id as usize]
    }
}

impl std::ops::IndexMut<QueueId> for Queues {
    fn index_mut(&mut self, id: QueueId) -> &mut QueueManager {
        &mut self.managers[id as usize]
    }
}

/// Add a job to be run
pub fn add(engine: &mut Engine, id: QueueId, job: JobId) {
    debug_assert!(!engine.queues[id].queue.contains(&job));

    engine.jobs.get_mut(job).state = JobState::Queued;
    engine.queues[id].queue.push(job);
    engine.queues[id].dirty = true;

    if engine.queues[id].active_load < engine.queues[id].load {
        pump(engine, id);
    }
}

/// A job has completed; release its load and refill
pub fn done(engine: &mut Engine, id: QueueId, job: JobId) {
    let load = engine.jobs[job].load;
    let queue = &mut engine.queues[id];
    queue.active.retain(|j| *j != job);
    queue.active_load = queue.active_load.saturating_sub(load);

    if engine.queues[id].active_load < engine.queues[id].load {
        pump(engine, id);
    }
}

/// Change a queue's load cap, starting jobs if it was raised
pub fn set_load(engine: &mut Engine, id: QueueId, load: u32) {
    let raised = load > engine.queues[id].load;
    engine.queues[id].load = load;
    if raised {
        pump(engine, id);
    }
}

/// Ask every queue to re-sort before its next admission
pub fn reorder_all(engine: &mut Engine) {
    for id in QueueId::ALL {
        engine.queues[id].reorder();
    }
}

/// Fill the remaining load with jobs, scanning stalled before queued
pub fn pump(engine: &mut Engine, id: QueueId) {
    if engine.queues[id].dirty {
        engine.queues[id].dirty = false;
        sort(engine, id);
    }

    let mut newly_stalled: Vec<JobId> = vec![];

    for stalled_list in [true, false] {
        loop {
            let (cap, active_load) = {
                let queue = &engine.queues[id];
                (queue.load, queue.active_load)
            };
            if active_load >= cap {
                break;
            }

            let empty_active = engine.queues[id].active.is_empty() && newly_stalled.is_empty();
            let Some(index) = find_job(engine, id, stalled_list, cap - active_load, empty_active) else {
                break;
            };

            let job = if stalled_list {
                engine.queues[id].stalled.remove(index)
            } else {
                engine.queues[id].queue.remove(index)
            };

            let load = engine.jobs[job].load;
            engine.queues[id].active.push(job);
            engine.queues[id].active_load += load;
            engine.jobs.get_mut(job).state = JobState::Active;

            if job::run(engine, job).is_err() {
                let queue = &mut engine.queues[id];
                queue.active.retain(|j| *j != job);
                queue.active_load -= load;
                engine.jobs.get_mut(job).state = JobState::Stalled;
                newly_stalled.push(job);
            }
        }
    }

    if !newly_stalled.is_empty() {
        engine.queues[id].stalled.extend(newly_stalled);
        sort_stalled(engine, id);
    }
}

/// Find the next admissible job: the highest priority job whose load
/// fits, otherwise (only on an idle queue) the lightest job
fn find_job(engine: &Engine, id: QueueId, stalled_list: bool, remaining: u32, admit_oversize: bool) -> Option<usize> {
    let list = if stalled_list {
        &engine.queues[id].stalled
    } else {
        &engine.queues[id].queue
    };

    if list.is_empty() {
        return None;
    }

    let mut lightest = 0;
    for (index, job) in list.iter().enumerate() {
        let load = engine.jobs[*job].load;
        if load <= remaining {
            return Some(index);
        }
        if load < engine.jobs[list[lightest]].load {
            lightest = index;
        }
    }

    // Nothing fits; over-commit only when nothing else is running
    admit_oversize.then_some(lightest)
}

fn sort(engine: &mut Engine, id: QueueId) {
    sort_stalled(engine, id);
    let mut queue = std::mem::take(&mut engine.queues[id].queue);
    queue.sort_by_key(|j| (Reverse(job::priority(engine, *j)), engine.jobs[*j].seq));
    engine.queues[id].queue = queue;
}

fn sort_stalled(engine: &mut Engine, id: QueueId) {
    let mut stalled = std::mem::take(&mut engine.queues[id].stalled);
    stalled.sort_by_key(|j| (Reverse(job::priority(engine, *j)), engine.jobs[*j].seq));
    engine.queues[id].stalled = stalled;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::{seed_port, stub_spawner};
    use crate::stack::Stage;

    fn checksum_job(engine: &mut Engine, origin: &str) -> JobId {
        let port = seed_port(engine, origin);
        engine.ports.get_mut(port).stages.insert(Stage::Config);
        engine.ports.get_mut(port).stages.insert(Stage::Depend);
        job::new_stage(engine, port, Stage::Checksum)
    }

    #[test]
    fn admission_respects_load_cap() {
        let mut engine = Engine::for_tests();
        stub_spawner(&mut engine, |_| Default::default());
        set_load(&mut engine, QueueId::Checksum, 1);

        let a = checksum_job(&mut engine, "lang/a");
        let b = checksum_job(&mut engine, "lang/b");
        add(&mut engine, QueueId::Checksum, a);
        add(&mut engine, QueueId::Checksum, b);

        // Cap of one admits one, the other remains queued
        assert_eq!(engine.queues[QueueId::Checksum].active.len(), 1);
        assert_eq!(engine.queues[QueueId::Checksum].queue.len(), 1);
        assert!(engine.queues[QueueId::Checksum].active_load <= 1);
    }

    #[test]
    fn priority_orders_admission() {
        let mut engine = Engine::for_tests();
        stub_spawner(&mut engine, |_| Default::default());
        set_load(&mut engine, QueueId::Checksum, 0);

        let low = checksum_job(&mut engine, "lang/low");
        let high = checksum_job(&mut engine, "lang/high");
        add(&mut engine, QueueId::Checksum, low);
        add(&mut engine, QueueId::Checksum, high);

        if let Some(port) = engine.jobs[high].port() {
            engine.ports.get_mut(port).dependent.priority = 50;
        }
        engine.queues[QueueId::Checksum].reorder();

        set_load(&mut engine, QueueId::Checksum, 1);
        assert_eq!(engine.queues[QueueId::Checksum].active, vec![high]);
    }

    #[test]
    fn zero_cap_blocks_admission() {
        let mut engine = Engine::for_tests();
        stub_spawner(&mut engine, |_| Default::default());
        set_load(&mut engine, QueueId::Checksum, 0);

        let a = checksum_job(&mut engine, "lang/a");
        add(&mut engine, QueueId::Checksum, a);

        assert!(engine.queues[QueueId::Checksum].active.is_empty());
        assert_eq!(engine.queues[QueueId::Checksum].queue.len(), 1);
    }

    #[test]
    fn oversize_job_admitted_only_when_idle() {
        let mut engine = Engine::for_tests();
        stub_spawner(&mut engine, |_| Default::default());
        set_load(&mut engine, QueueId::Build, 2);

        let port = seed_port(&mut engine, "lang/huge");
        engine.ports.get_mut(port).stages.insert(Stage::Config);
        engine.ports.get_mut(port).stages.insert(Stage::Depend);
        engine.ports.get_mut(port).stages.insert(Stage::Checksum);
        engine.ports.get_mut(port).stages.insert(Stage::Fetch);
        engine.ports.get_mut(port).attr.jobs_number = 8;

        let huge = job::new_stage(&mut engine, port, Stage::Build);
        add(&mut engine, QueueId::Build, huge);

        // Admitted despite exceeding the cap, because the queue was idle
        assert_eq!(engine.queues[QueueId::Build].active, vec![huge]);
        assert_eq!(engine.queues[QueueId::Build].active_load, 8);
    }
}
