// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Callback infrastructure.
//!
//! A [`Signal`] dispatches to its connected slots through the event loop,
//! one posted entry per slot. Slots therefore never run inside the
//! emitter's own call frame, and disconnecting after an emit does not
//! unschedule already posted calls — slots must tolerate a late delivery.

use std::rc::Rc;

use crate::engine::Engine;
use crate::event::EventLoop;

/// A callback taking the engine context and the signal payload
pub type Slot<A> = Rc<dyn Fn(&mut Engine, A)>;

/// Token identifying a connected slot, unique within its signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

/// Allows signals to be sent to connected slots
pub struct Signal<A> {
    name: &'static str,
    next: u64,
    slots: Vec<(SlotId, Slot<A>)>,
}

impl<A> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<A: Clone + 'static> Signal<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next: 0,
            slots: vec![],
        }
    }

    /// Connect a callback function to the signal
    pub fn connect(&mut self, slot: impl Fn(&mut Engine, A) + 'static) -> SlotId {
        self.connect_rc(Rc::new(slot))
    }

    pub fn connect_rc(&mut self, slot: Slot<A>) -> SlotId {
        let id = SlotId(self.next);
        self.next += 1;
        self.slots.push((id, slot));
        id
    }

    /// Disconnect a callback function from the signal
    pub fn disconnect(&mut self, id: SlotId) -> bool {
        let len = self.slots.len();
        self.slots.retain(|(i, _)| *i != id);
        self.slots.len() != len
    }

    /// Replace a slot with a different one, maintaining calling order
    pub fn replace(&mut self, id: SlotId, slot: impl Fn(&mut Engine, A) + 'static) -> bool {
        match self.slots.iter_mut().find(|(i, _)| *i == id) {
            Some((_, old)) => {
                *old = Rc::new(slot);
                true
            }
            None => false,
        }
    }

    pub fn has_slot(&self, id: SlotId) -> bool {
        self.slots.iter().any(|(i, _)| *i == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Emit the signal, posting one event loop entry per slot
    pub fn emit(&self, events: &mut EventLoop, arg: A) {
        for (_, slot) in &self.slots {
            let slot = Rc::clone(slot);
            let arg = arg.clone();
            events.post(move |engine| slot(engine, arg));
        }
    }
}

/// A signal whose slots run inside the emitter, reserved for the
/// event loop's own start/stop lifecycle
#[derive(Default)]
pub struct InlineSignal {
    slots: Vec<Rc<dyn Fn(&mut Engine)>>,
}

impl InlineSignal {
    pub fn connect(&mut self, slot: impl Fn(&mut Engine) + 'static) {
        self.slots.push(Rc::new(slot));
    }

    /// Snapshot the slot list so the caller can invoke them while
    /// holding the engine mutably
    pub fn snapshot(&self) -> Vec<Rc<dyn Fn(&mut Engine)>> {
        self.slots.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn emit_preserves_connect_order() {
        let mut engine = Engine::for_tests();
        let mut signal: Signal<u32> = Signal::new("test");

        signal.connect(|e, n| e.test_log.push(format!("first:{n}")));
        signal.connect(|e, n| e.test_log.push(format!("second:{n}")));

        signal.emit(&mut engine.events, 7);
        engine.drain_for_tests();

        assert_eq!(engine.test_log, vec!["first:7", "second:7"]);
    }

    #[test]
    fn disconnect_after_emit_still_delivers() {
        let mut engine = Engine::for_tests();
        let mut signal: Signal<u32> = Signal::new("test");

        let id = signal.connect(|e, n| e.test_log.push(format!("slot:{n}")));
        signal.emit(&mut engine.events, 1);
        assert!(signal.disconnect(id));

        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["slot:1"]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut engine = Engine::for_tests();
        let mut signal: Signal<u32> = Signal::new("test");

        let id = signal.connect(|e, _| e.test_log.push("a".into()));
        signal.connect(|e, _| e.test_log.push("b".into()));
        assert!(signal.replace(id, |e, _| e.test_log.push("a2".into())));

        signal.emit(&mut engine.events, 0);
        engine.drain_for_tests();
        assert_eq!(engine.test_log, vec!["a2", "b"]);
    }
}
