// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Resolve a port as a dependency.
//!
//! The resolver owns the cross-stack retry semantics: it walks the
//! configured method order (build from source, local package, remote
//! repository), consuming soft failures by moving to the next method
//! and latching a hard failure only once every method is exhausted.
//! While a later method remains, the port's failure is shielded from
//! its dependants.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::builder::{self, BuilderUpdate};
use crate::engine::Engine;
use crate::env::{BuildTarget, DependMethod};
use crate::job::JobId;
use crate::port::cache::PortId;
use crate::port::DependStatus;
use crate::signal::Signal;
use crate::stack::Stage;

#[derive(Default)]
pub struct Resolver {
    /// Ports being resolved, with the signal their dependants await
    pending: HashMap<PortId, Signal<PortId>>,
    /// The next method to try for each pending port
    method: HashMap<PortId, Option<DependMethod>>,
    finished: BTreeSet<PortId>,
}

impl Resolver {
    pub fn is_pending(&self, port: PortId) -> bool {
        self.pending.contains_key(&port)
    }

    pub fn is_finished(&self, port: PortId) -> bool {
        self.finished.contains(&port)
    }
}

/// The primary builder stage used by each resolution method
fn method_stage(method: DependMethod) -> Stage {
    match method {
        DependMethod::Build => Stage::Install,
        DependMethod::Package => Stage::PkgInstall,
        DependMethod::Repo => Stage::RepoInstall,
    }
}

/// Try to resolve a port as a dependency; `slot` fires once the port
/// has either resolved or exhausted every method.
pub fn resolve(engine: &mut Engine, port: PortId, slot: impl Fn(&mut Engine, PortId) + 'static) {
    if let Some(sig) = engine.resolver.pending.get_mut(&port) {
        sig.connect(slot);
        return;
    }

    if engine.resolver.finished.contains(&port) || engine.ports[port].failed {
        engine.events.post(move |e| slot(e, port));
        return;
    }

    let mut sig = Signal::new("Resolver.port");
    sig.connect(slot);

    // A port already being driven as a primary target resolves through
    // the job that is already under way
    for method in [DependMethod::Build, DependMethod::Package, DependMethod::Repo] {
        let stage = method_stage(method);
        if engine.builders.stage(stage).ports.contains_key(&port) {
            let job = builder::stage_add(engine, stage, port);
            engine.jobs.get_mut(job).completed.connect(move |e, j| cleaned(e, j));
            engine.resolver.pending.insert(port, sig);
            engine.resolver.method.insert(port, next_method(engine, method));
            return;
        }
    }

    engine
        .resolver
        .method
        .insert(port, engine.flags.depend.first().copied());

    if find_method(engine, port) {
        engine.resolver.pending.insert(port, sig);
    } else {
        engine.resolver.finished.insert(port);
        sig.emit(&mut engine.events, port);
    }
}

/// Walk the method order until one accepts the port. Exhaustion marks
/// the port hard-failed and cascades through its dependants.
fn find_method(engine: &mut Engine, port: PortId) -> bool {
    loop {
        let Some(method) = engine.resolver.method.get(&port).copied().flatten() else {
            engine.resolver.method.remove(&port);
            engine.ports.get_mut(port).failed = true;
            crate::port::depend::status_changed(engine, port);
            debug!(
                "port '{}': no viable resolve method found",
                engine.ports[port].origin
            );
            return false;
        };

        let next = next_method(engine, method);
        engine.resolver.method.insert(port, next);
        // Failures only cascade once no fallback remains
        engine.ports.get_mut(port).dependent.propagate = next.is_none();

        if try_method(engine, port, method) {
            debug!(
                "port '{}': resolving using method '{method}'",
                engine.ports[port].origin
            );
            return true;
        }
        debug!(
            "port '{}': skipping resolve method '{method}'",
            engine.ports[port].origin
        );
    }
}

/// Attempt one resolution method; false is a soft skip
fn try_method(engine: &mut Engine, port: PortId, method: DependMethod) -> bool {
    // A failed common stack can never resolve
    if engine.ports[port].stacks.common.failed.is_some() || engine.ports[port].failed {
        return false;
    }

    let job = match method {
        DependMethod::Build => {
            if engine.ports[port].stacks.build.failed.is_some() {
                return false;
            }

            let want_package = engine.flags.target.contains(&BuildTarget::Package)
                || engine.ports[port].want_package;
            if want_package {
                // Use the install job if it exists, otherwise package
                if let Some(&job) = engine.builders.install.ports.get(&port) {
                    job
                } else {
                    builder::stage_add_primary(engine, Stage::Package, port)
                }
            } else if engine.flags.target.contains(&BuildTarget::Install) {
                builder::stage_add_primary(engine, Stage::Install, port)
            } else {
                return false;
            }
        }
        DependMethod::Package => {
            let usable = crate::stack::package::pkgfile_present(engine, port)
                && !engine.ports[port].attr.no_package
                && engine.ports[port].stacks.package.failed.is_none();
            if !usable {
                soft_skip(engine, Stage::PkgInstall, port);
                return false;
            }
            builder::stage_add_primary(engine, Stage::PkgInstall, port)
        }
        DependMethod::Repo => {
            let usable = !engine.ports[port].attr.no_package
                && engine.ports[port].stacks.repo.failed.is_none();
            if !usable {
                soft_skip(engine, Stage::RepoInstall, port);
                return false;
            }
            builder::stage_add_primary(engine, Stage::RepoInstall, port)
        }
    };

    engine.jobs.get_mut(job).completed.connect(move |e, j| cleaned(e, j));
    true
}

/// Report a method skipped without ever queueing work
fn soft_skip(engine: &mut Engine, stage: Stage, port: PortId) {
    let update = &engine.builders.stage(stage).update;
    update.emit(&mut engine.events, (BuilderUpdate::Added, port));
    update.emit(&mut engine.events, (BuilderUpdate::Failed, port));
}

/// Cleanup after a resolution attempt has finished
fn cleaned(engine: &mut Engine, job: JobId) {
    let Some(port) = engine.jobs[job].port() else {
        return;
    };

    let has_fallback = engine
        .resolver
        .method
        .get(&port)
        .map_or(false, |next| next.is_some());

    if engine.ports[port].failed && has_fallback {
        // Reset the transient failure so the alternative stack can
        // proceed; the per-stack latch keeps the failed stack closed
        engine.ports.get_mut(port).failed = false;
        if engine.ports[port].dependent.status == DependStatus::Failure {
            engine.ports.get_mut(port).dependent.status = DependStatus::Unresolved;
        }

        if find_method(engine, port) {
            return;
        }
    }

    // Exhausted: let the dependency graph broadcast the failure (a
    // `propagate = false` shield keeps the port merely unresolved)
    if engine.ports[port].failed {
        crate::port::depend::status_changed(engine, port);
    }

    engine.resolver.method.remove(&port);
    engine.resolver.finished.insert(port);
    if let Some(sig) = engine.resolver.pending.remove(&port) {
        sig.emit(&mut engine.events, port);
    }
}

/// The method configured after `method`, if any
fn next_method(engine: &Engine, method: DependMethod) -> Option<DependMethod> {
    let order = &engine.flags.depend;
    order
        .iter()
        .position(|m| *m == method)
        .and_then(|i| order.get(i + 1))
        .copied()
}
