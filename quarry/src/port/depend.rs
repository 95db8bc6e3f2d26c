// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dependency handling for ports.
//!
//! Each port carries a [`Dependent`] record (who relies on it) and,
//! once its Depend stage has run, a [`Dependency`] record (what it
//! relies on). The two are kept symmetric: adding `b` to `a`'s
//! dependencies also registers `a` as a dependant of `b`. Status
//! changes fan out through these records, maintaining each dependant's
//! outstanding count incrementally.

use std::collections::{BTreeSet, VecDeque};

use log::{debug, error};

use crate::engine::Engine;
use crate::port::cache::{self, PortId};
use crate::port::Origin;
use crate::stack::Stage;

/// The kinds of dependency a recipe may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependKind {
    Build,
    Extract,
    Fetch,
    Lib,
    Run,
    Patch,
    Package,
}

impl DependKind {
    pub const COUNT: usize = 7;

    pub const ALL: [DependKind; DependKind::COUNT] = [
        DependKind::Build,
        DependKind::Extract,
        DependKind::Fetch,
        DependKind::Lib,
        DependKind::Run,
        DependKind::Patch,
        DependKind::Package,
    ];
}

/// Whether a port satisfies the ports that depend on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependStatus {
    /// The port failed and cannot satisfy its dependants
    Failure,
    /// The port does not (yet) satisfy its dependants
    Unresolved,
    /// Every dependant's requirement is met
    Resolved,
}

/// Tracks the dependants of a port
#[derive(Debug)]
pub struct Dependent {
    dependants: [Vec<(String, PortId)>; DependKind::COUNT],
    /// Scheduling priority, grown by distfile weight and by dependants
    pub priority: i64,
    /// Whether a failure of this port cascades to its dependants
    pub propagate: bool,
    pub status: DependStatus,
}

impl Dependent {
    pub fn new(resolved: bool) -> Self {
        Self {
            dependants: Default::default(),
            priority: 0,
            propagate: true,
            status: if resolved {
                DependStatus::Resolved
            } else {
                DependStatus::Unresolved
            },
        }
    }

    /// The dependants interested in the given stage, or all of them
    pub fn get(&self, stage: Option<Stage>) -> BTreeSet<PortId> {
        let kinds = match stage {
            Some(stage) => stage.depend_kinds(),
            None => &DependKind::ALL,
        };

        kinds
            .iter()
            .flat_map(|kind| self.dependants[*kind as usize].iter().map(|(_, port)| *port))
            .collect()
    }

    pub fn failed(&self) -> bool {
        self.status == DependStatus::Failure
    }

    fn push(&mut self, field: String, port: PortId, kind: DependKind) {
        self.dependants[kind as usize].push((field, port));
    }
}

/// Tracks the dependencies of a port
#[derive(Debug, Default)]
pub struct Dependency {
    dependencies: [Vec<PortId>; DependKind::COUNT],
    /// Dependencies not yet resolved, counted per kind entry
    pub outstanding: i64,
    /// Origins still being looked up in the port cache
    loading: usize,
    /// Declared origins that could not be loaded
    bad: usize,
    /// Latched once any dependency fails
    pub failed: bool,
}

impl Dependency {
    /// The dependencies required by the given stage, or all of them
    pub fn get(&self, stage: Option<Stage>) -> BTreeSet<PortId> {
        let kinds = match stage {
            Some(stage) => stage.depend_kinds(),
            None => &DependKind::ALL,
        };

        kinds
            .iter()
            .flat_map(|kind| self.dependencies[*kind as usize].iter().copied())
            .collect()
    }

    fn contains(&self, kind: DependKind, port: PortId) -> bool {
        self.dependencies[kind as usize].contains(&port)
    }
}

/// The dependencies of `port` that do not yet satisfy `stage`
pub fn unresolved(engine: &Engine, port: PortId, stage: Stage) -> BTreeSet<PortId> {
    let Some(dependency) = engine.ports[port].dependency.as_ref() else {
        return BTreeSet::new();
    };

    dependency
        .get(Some(stage))
        .into_iter()
        .filter(|dep| !engine.ports[*dep].resolved())
        .collect()
}

/// Materialise the dependency record for `port` from its parsed
/// attribute vectors. Finalisation of the Depend stage is posted once
/// every declared origin has been looked up.
pub fn materialise(engine: &mut Engine, port: PortId) {
    debug_assert!(engine.ports[port].dependency.is_none());

    // Seed the port's priority from its distfile weight
    let weight = distfile_weight(engine, port);
    engine.ports.get_mut(port).priority = weight;
    engine.ports.get_mut(port).dependent.priority += weight;

    let declared: Vec<(DependKind, String, Origin)> = DependKind::ALL
        .iter()
        .flat_map(|kind| {
            engine.ports[port]
                .attr
                .depends
                .get(*kind)
                .iter()
                .map(|(field, origin)| (*kind, field.clone(), origin.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    debug!(
        "port '{}': loading {} dependencies",
        engine.ports[port].origin,
        declared.len()
    );

    engine.ports.get_mut(port).dependency = Some(Dependency {
        loading: declared.len(),
        ..Dependency::default()
    });

    if declared.is_empty() {
        update_priority(engine, port);
        engine.events.post(move |e| loaded(e, port, true));
        return;
    }

    for (kind, field, origin) in declared {
        cache::get_port(engine, origin, move |e, result| {
            dependency_loaded(e, port, kind, field.clone(), result);
        });
    }
}

/// One declared dependency origin finished loading
fn dependency_loaded(
    engine: &mut Engine,
    port: PortId,
    kind: DependKind,
    field: String,
    result: Result<PortId, Origin>,
) {
    {
        let dependency = engine.ports.get_mut(port).dependency.as_mut().expect("dependency materialised");
        dependency.loading -= 1;
    }

    match result {
        Ok(dep) => {
            let status = engine.ports[dep].dependent.status;
            let known = engine.ports[port]
                .dependency
                .as_ref()
                .expect("dependency materialised")
                .contains(kind, dep);

            if !known {
                {
                    let dependency = engine.ports.get_mut(port).dependency.as_mut().expect("dependency materialised");
                    dependency.dependencies[kind as usize].push(dep);
                    if status != DependStatus::Resolved {
                        dependency.outstanding += 1;
                    }
                }
                dependent_add(engine, dep, field, port, kind);
                engine.depgraph.add_edge(port.index(), dep.index());
            }

            if status == DependStatus::Failure {
                mark_failed(engine, port);
            }
        }
        Err(origin) => {
            error!(
                "port '{}': failed to load dependency '{origin}'",
                engine.ports[port].origin
            );
            {
                let dependency = engine.ports.get_mut(port).dependency.as_mut().expect("dependency materialised");
                dependency.bad += 1;
            }
            mark_failed(engine, port);
        }
    }

    let (loading, bad) = {
        let dependency = engine.ports[port].dependency.as_ref().expect("dependency materialised");
        (dependency.loading, dependency.bad)
    };

    if loading == 0 {
        update_priority(engine, port);

        let acyclic = check_cycles(engine, port);
        loaded(engine, port, bad == 0 && acyclic);
    }
}

/// Dependency loading completed; finalise the Depend stage
fn loaded(engine: &mut Engine, port: PortId, status: bool) {
    crate::stack::run::finalise(engine, port, Stage::Depend, status);
}

/// Latch a dependency failure on `port` and let its own dependants know
fn mark_failed(engine: &mut Engine, port: PortId) {
    let already = {
        let dependency = engine.ports.get_mut(port).dependency.as_mut().expect("dependency materialised");
        let already = dependency.failed;
        dependency.failed = true;
        already
    };

    if !already && !engine.ports[port].dependent.failed() {
        status_changed(engine, port);
    }
}

/// Register `dependant` as relying on `port`
fn dependent_add(engine: &mut Engine, port: PortId, field: String, dependant: PortId, kind: DependKind) {
    // A port believed resolved may stop satisfying a newly arrived
    // dependant, e.g. when only an older version is installed
    if engine.ports[port].dependent.status == DependStatus::Resolved
        && engine.ports[port].install_status == crate::port::InstallStatus::Absent
    {
        engine.ports.get_mut(port).dependent.status = DependStatus::Unresolved;
        notify_all(engine, port, DependStatus::Unresolved);
    }

    engine.ports.get_mut(port).dependent.push(field, dependant, kind);
}

/// Re-derive the port's dependant-facing status and fan out on change
pub fn status_changed(engine: &mut Engine, port: PortId) {
    let status = {
        let p = &engine.ports[port];
        let dependency_failed = p.dependency.as_ref().map_or(false, |d| d.failed);

        if (p.dependent.propagate && p.failed) || dependency_failed {
            DependStatus::Failure
        } else if engine.flags.fetch_only && p.stages.contains(Stage::Fetch) {
            DependStatus::Resolved
        } else if p.install_status > engine.flags.stage_floor {
            DependStatus::Resolved
        } else {
            DependStatus::Unresolved
        }
    };

    if status != engine.ports[port].dependent.status {
        engine.ports.get_mut(port).dependent.status = status;
        notify_all(engine, port, status);
    }
}

/// Notify every dependant of `port` that its status changed
fn notify_all(engine: &mut Engine, port: PortId, status: DependStatus) {
    for dependant in engine.ports[port].dependent.get(None) {
        dependency_update(engine, dependant, port, status);
    }
}

/// A dependency of `port` transitioned to `status`
fn dependency_update(engine: &mut Engine, port: PortId, _dep: PortId, status: DependStatus) {
    if engine.ports[port].dependency.is_none() {
        return;
    }

    if status == DependStatus::Failure {
        mark_failed(engine, port);
    }

    // Re-derive the outstanding count across every kind entry
    let outstanding = {
        let dependency = engine.ports[port].dependency.as_ref().expect("dependency materialised");
        dependency
            .dependencies
            .iter()
            .flat_map(|kind| kind.iter())
            .filter(|dep| engine.ports[**dep].dependent.status != DependStatus::Resolved)
            .count() as i64
    };
    engine.ports.get_mut(port).dependency.as_mut().expect("dependency materialised").outstanding = outstanding;
}

/// Propagate this port's priority over its transitive dependencies,
/// adding it at most once per ancestor
pub fn update_priority(engine: &mut Engine, port: PortId) {
    let add = engine.ports[port].dependent.priority;
    if add == 0 {
        return;
    }

    let mut pending: VecDeque<PortId> = engine.ports[port]
        .dependency
        .as_ref()
        .map(|d| d.get(None).into_iter().collect())
        .unwrap_or_default();
    let mut visited: BTreeSet<PortId> = BTreeSet::new();

    while let Some(next) = pending.pop_front() {
        if !visited.insert(next) {
            continue;
        }
        engine.ports.get_mut(next).dependent.priority += add;
        if let Some(dependency) = engine.ports[next].dependency.as_ref() {
            pending.extend(dependency.get(None));
        }
    }
}

/// Top level check for dependency cycles once a port's edges are known
fn check_cycles(engine: &mut Engine, port: PortId) -> bool {
    match engine.depgraph.topo() {
        Ok(_) => true,
        Err(cycle) if cycle.members.contains(&port.index()) => {
            let members = cycle
                .members
                .iter()
                .map(|m| engine.ports[PortId::from_index(*m)].origin.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            error!(
                "port '{}': dependency cycle involving {members}",
                engine.ports[port].origin
            );
            mark_failed(engine, port);
            false
        }
        // The cycle closed elsewhere; the closing port reports it
        Err(_) => true,
    }
}

/// Sum the recorded sizes of the port's distfiles
fn distfile_weight(engine: &Engine, port: PortId) -> i64 {
    let p = &engine.ports[port];
    if p.attr.distfiles.is_empty() || p.attr.distinfo.is_empty() {
        return 0;
    }

    let distinfo = engine.flags.rooted(&p.attr.distinfo);
    let Ok(contents) = std::fs::read_to_string(distinfo) else {
        return 0;
    };

    let mut weight = 0;
    for line in contents.lines().filter(|l| l.starts_with("SIZE")) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let name = fields[1]
            .trim_start_matches('(')
            .trim_end_matches(')')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        if p.attr.distfiles.iter().any(|f| f == name) {
            weight += fields[fields.len() - 1].parse::<i64>().unwrap_or(0);
        }
    }

    weight
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::{seed_port, seed_port_with};

    #[test]
    fn materialise_counts_outstanding() {
        let mut engine = Engine::for_tests();
        let dep = seed_port(&mut engine, "devel/gmake");
        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("gmake".into(), Origin::from("devel/gmake")));
        });

        materialise(&mut engine, port);
        engine.drain_for_tests();

        let dependency = engine.ports[port].dependency.as_ref().unwrap();
        assert_eq!(dependency.outstanding, 1);
        assert_eq!(dependency.get(None), BTreeSet::from([dep]));
        assert!(engine.ports[port].stages.contains(Stage::Depend));
        assert!(!engine.ports[port].failed);

        // The reverse record is symmetric
        assert_eq!(engine.ports[dep].dependent.get(None), BTreeSet::from([port]));
    }

    #[test]
    fn resolution_decrements_outstanding() {
        let mut engine = Engine::for_tests();
        let dep = seed_port(&mut engine, "devel/gmake");
        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("gmake".into(), Origin::from("devel/gmake")));
            attrs
                .depends
                .get_mut(DependKind::Run)
                .push(("gmake".into(), Origin::from("devel/gmake")));
        });

        materialise(&mut engine, port);
        engine.drain_for_tests();
        assert_eq!(engine.ports[port].dependency.as_ref().unwrap().outstanding, 2);

        // Resolving the dependency decrements by its multiplicity
        engine.ports.get_mut(dep).install_status = crate::port::InstallStatus::Current;
        status_changed(&mut engine, dep);
        engine.drain_for_tests();
        assert_eq!(engine.ports[port].dependency.as_ref().unwrap().outstanding, 0);

        // And an unresolve restores it
        engine.ports.get_mut(dep).install_status = crate::port::InstallStatus::Absent;
        status_changed(&mut engine, dep);
        engine.drain_for_tests();
        assert_eq!(engine.ports[port].dependency.as_ref().unwrap().outstanding, 2);
    }

    #[test]
    fn missing_origin_fails_the_port() {
        let mut engine = Engine::for_tests();
        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("gone".into(), Origin::from("devel/gone")));
        });
        engine.ports.cache_miss_for_tests(&Origin::from("devel/gone"));

        materialise(&mut engine, port);
        engine.drain_for_tests();

        let dependency = engine.ports[port].dependency.as_ref().unwrap();
        assert!(dependency.failed);
        assert!(engine.ports[port].stages.contains(Stage::Depend));
        assert!(engine.ports[port].failed);
    }

    #[test]
    fn failure_cascades_to_dependants() {
        let mut engine = Engine::for_tests();
        let dep = seed_port(&mut engine, "devel/gmake");
        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("gmake".into(), Origin::from("devel/gmake")));
        });

        materialise(&mut engine, port);
        engine.drain_for_tests();

        engine.ports.get_mut(dep).failed = true;
        status_changed(&mut engine, dep);
        engine.drain_for_tests();

        assert!(engine.ports[port].dependency.as_ref().unwrap().failed);
        assert_eq!(engine.ports[port].dependent.status, DependStatus::Failure);
    }

    #[test]
    fn propagate_false_shields_dependants() {
        let mut engine = Engine::for_tests();
        let dep = seed_port(&mut engine, "devel/gmake");
        let port = seed_port_with(&mut engine, "lang/foo", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("gmake".into(), Origin::from("devel/gmake")));
        });

        materialise(&mut engine, port);
        engine.drain_for_tests();

        engine.ports.get_mut(dep).dependent.propagate = false;
        engine.ports.get_mut(dep).failed = true;
        status_changed(&mut engine, dep);
        engine.drain_for_tests();

        assert!(!engine.ports[port].dependency.as_ref().unwrap().failed);
        assert!(!engine.ports[port].failed);
        assert_eq!(engine.ports[dep].dependent.status, DependStatus::Unresolved);
    }

    #[test]
    fn priority_propagates_once_per_ancestor() {
        let mut engine = Engine::for_tests();
        let leaf = seed_port(&mut engine, "devel/leaf");
        let mid_a = seed_port_with(&mut engine, "devel/mid-a", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("leaf".into(), Origin::from("devel/leaf")));
        });
        let mid_b = seed_port_with(&mut engine, "devel/mid-b", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("leaf".into(), Origin::from("devel/leaf")));
        });
        let root = seed_port_with(&mut engine, "devel/root", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("mid-a".into(), Origin::from("devel/mid-a")));
            attrs
                .depends
                .get_mut(DependKind::Lib)
                .push(("mid-b".into(), Origin::from("devel/mid-b")));
        });

        for port in [leaf, mid_a, mid_b, root] {
            materialise(&mut engine, port);
            engine.drain_for_tests();
        }

        engine.ports.get_mut(root).dependent.priority += 100;
        update_priority(&mut engine, root);

        assert_eq!(engine.ports[mid_a].dependent.priority, 100);
        assert_eq!(engine.ports[mid_b].dependent.priority, 100);
        // The shared leaf gains the bump exactly once
        assert_eq!(engine.ports[leaf].dependent.priority, 100);
    }

    #[test]
    fn cycles_hard_fail_the_closing_port() {
        let mut engine = Engine::for_tests();
        let a = seed_port_with(&mut engine, "devel/a", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("b".into(), Origin::from("devel/b")));
        });
        let b = seed_port_with(&mut engine, "devel/b", |attrs| {
            attrs
                .depends
                .get_mut(DependKind::Build)
                .push(("a".into(), Origin::from("devel/a")));
        });

        materialise(&mut engine, a);
        engine.drain_for_tests();
        assert!(!engine.ports[a].failed);

        materialise(&mut engine, b);
        engine.drain_for_tests();
        assert!(engine.ports[b].failed);
        assert!(engine.ports[b].stages.contains(Stage::Depend));
    }
}
