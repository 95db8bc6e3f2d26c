// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The port cache.
//!
//! Ports are created lazily on first reference and never destroyed
//! during a run. The cache owns the arena; every other structure holds
//! plain [`PortId`] indices into it. A lookup whose attribute query
//! fails latches a `Missing` entry so repeat references fail fast.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use crate::engine::Engine;
use crate::job;
use crate::port::{Attributes, Origin, Port};
use crate::signal::Signal;

/// Stable index of a port within the cache arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(u32);

impl PortId {
    pub fn index(self) -> u32 {
        self.0
    }

    pub fn from_index(index: u32) -> Self {
        Self(index)
    }
}

/// Outcome of an origin lookup
pub type CacheResult = Result<PortId, Origin>;

enum Entry {
    Loaded(PortId),
    /// The origin's attribute query failed; the port cannot exist
    Missing,
}

/// Caches created ports
#[derive(Default)]
pub struct PortCache {
    arena: Vec<Port>,
    by_origin: HashMap<Origin, Entry>,
    waiters: HashMap<Origin, Signal<CacheResult>>,
}

impl PortCache {
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get_mut(&mut self, id: PortId) -> &mut Port {
        &mut self.arena[id.0 as usize]
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = PortId> {
        (0..self.arena.len() as u32).map(PortId)
    }

    /// The id of an already loaded origin
    pub fn lookup(&self, origin: &Origin) -> Option<PortId> {
        match self.by_origin.get(origin) {
            Some(Entry::Loaded(id)) => Some(*id),
            _ => None,
        }
    }

    fn insert(&mut self, port: Port) -> PortId {
        let id = PortId(self.arena.len() as u32);
        self.by_origin.insert(port.origin.clone(), Entry::Loaded(id));
        self.arena.push(port);
        id
    }

    #[cfg(test)]
    pub fn cache_miss_for_tests(&mut self, origin: &Origin) {
        self.by_origin.insert(origin.clone(), Entry::Missing);
    }
}

impl Index<PortId> for PortCache {
    type Output = Port;

    fn index(&self, id: PortId) -> &Port {
        &self.arena[id.0 as usize]
    }
}

impl IndexMut<PortId> for PortCache {
    fn index_mut(&mut self, id: PortId) -> &mut Port {
        &mut self.arena[id.0 as usize]
    }
}

/// Get a port and call back with it.
///
/// Already cached origins answer through a posted event; unknown
/// origins queue an attribute job and share one waiter signal between
/// every interested caller.
pub fn get_port(engine: &mut Engine, origin: Origin, slot: impl Fn(&mut Engine, CacheResult) + 'static) {
    match engine.ports.by_origin.get(&origin) {
        Some(Entry::Loaded(id)) => {
            let id = *id;
            engine.events.post(move |e| slot(e, Ok(id)));
        }
        Some(Entry::Missing) => {
            engine.events.post(move |e| slot(e, Err(origin)));
        }
        None => {
            if let Some(waiter) = engine.ports.waiters.get_mut(&origin) {
                waiter.connect(slot);
                return;
            }

            let mut waiter = Signal::new("PortCache.waiter");
            waiter.connect(slot);
            engine.ports.waiters.insert(origin.clone(), waiter);
            job::queue_attr(engine, origin);
        }
    }
}

/// Use a finished attribute query to create the port (or latch a miss)
pub fn attr_loaded(engine: &mut Engine, origin: Origin, attrs: Option<Attributes>) {
    let result = match attrs {
        Some(attrs) => {
            let port = Port::new(origin.clone(), attrs, &engine.flags, &engine.pkgdb);
            Ok(engine.ports.insert(port))
        }
        None => {
            engine.ports.by_origin.insert(origin.clone(), Entry::Missing);
            Err(origin.clone())
        }
    };

    if let Some(waiter) = engine.ports.waiters.remove(&origin) {
        waiter.emit(&mut engine.events, result);
    }
}

/// Insert a pre-built port directly, bypassing attribute retrieval
pub fn insert_ready(engine: &mut Engine, origin: Origin, attrs: Attributes) -> PortId {
    let port = Port::new(origin, attrs, &engine.flags, &engine.pkgdb);
    engine.ports.insert(port)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::test_util::seed_port;

    #[test]
    fn cached_lookup_answers_async() {
        let mut engine = Engine::for_tests();
        let id = seed_port(&mut engine, "lang/foo");

        get_port(&mut engine, Origin::from("lang/foo"), move |e, result| {
            assert_eq!(result, Ok(id));
            e.test_log.push("hit".into());
        });

        assert!(engine.test_log.is_empty());
        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["hit"]);
    }

    #[test]
    fn latched_miss_fails_fast() {
        let mut engine = Engine::for_tests();
        engine.ports.cache_miss_for_tests(&Origin::from("no/where"));

        get_port(&mut engine, Origin::from("no/where"), |e, result| {
            assert!(result.is_err());
            e.test_log.push("miss".into());
        });

        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["miss"]);
    }

    #[test]
    fn concurrent_lookups_share_one_attr_job() {
        let mut engine = Engine::for_tests();

        // Answer every attribute query with a minimal valid schema:
        // a name, a pkgname, and one empty line per remaining field
        crate::engine::test_util::stub_spawner(&mut engine, |_| crate::process::StubExit {
            code: 0,
            stdout: {
                let mut lines = vec!["foo", "foo-1.0"];
                lines.resize(crate::port::attr::MAKE_VARS.len(), "");
                lines.join("\n")
            },
        });

        get_port(&mut engine, Origin::from("lang/foo"), |e, result| {
            assert!(result.is_ok());
            e.test_log.push("first".into());
        });
        get_port(&mut engine, Origin::from("lang/foo"), |e, result| {
            assert!(result.is_ok());
            e.test_log.push("second".into());
        });

        // One waiter, one attribute job between the two lookups
        assert_eq!(engine.ports.waiters.len(), 1);
        assert_eq!(engine.queues[crate::queue::QueueId::Attr].len(), 1);

        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["first", "second"]);

        let id = engine.ports.lookup(&Origin::from("lang/foo")).unwrap();
        assert_eq!(engine.ports[id].attr.pkgname, "foo-1.0");
    }

    #[test]
    fn failed_attr_query_latches_a_miss() {
        let mut engine = Engine::for_tests();
        crate::engine::test_util::stub_spawner(&mut engine, |_| crate::process::StubExit {
            code: 1,
            stdout: String::new(),
        });

        get_port(&mut engine, Origin::from("no/where"), |e, result| {
            assert!(result.is_err());
            e.test_log.push("miss".into());
        });
        engine.drain_for_tests();

        assert_eq!(engine.test_log, vec!["miss"]);
        // The miss is latched; repeat lookups answer without a job
        get_port(&mut engine, Origin::from("no/where"), |e, result| {
            assert!(result.is_err());
            e.test_log.push("again".into());
        });
        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["miss", "again"]);
        assert_eq!(engine.procs.spawned.len(), 1);
    }
}
