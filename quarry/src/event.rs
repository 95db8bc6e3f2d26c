// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Event management utilities.
//!
//! A single-threaded cooperative dispatcher: deferred callbacks are
//! drained from a FIFO, and between batches the loop blocks on a
//! readiness channel fed by subprocess watcher threads and the OS
//! signal forwarder. All application state is owned by the loop's
//! thread; no callback may block.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use crate::engine::Engine;
use crate::signal::InlineSignal;

/// A deferred callback invocation
pub type Thunk = Box<dyn FnOnce(&mut Engine) + 'static>;

/// FIFO entries dispatched before the reactor is polled again
pub const DISPATCH_BATCH: usize = 50;

/// A readiness event delivered from outside the loop's thread
#[derive(Debug)]
pub enum Wakeup {
    /// A supervised subprocess exited
    ChildExit {
        pid: i32,
        code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// SIGINT or SIGTERM reached the supervisor
    Interrupt,
}

pub struct EventLoop {
    fifo: VecDeque<Thunk>,
    tx: Sender<Wakeup>,
    rx: Receiver<Wakeup>,
    halted: bool,
    /// Total callbacks dispatched over the life of the loop
    pub event_count: u64,
    pub start: InlineSignal,
    pub stop: InlineSignal,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();

        Self {
            fifo: VecDeque::new(),
            tx,
            rx,
            halted: false,
            event_count: 0,
            start: InlineSignal::default(),
            stop: InlineSignal::default(),
        }
    }

    /// Add a callback to be invoked asynchronously
    pub fn post(&mut self, func: impl FnOnce(&mut Engine) + 'static) {
        self.fifo.push_back(Box::new(func));
    }

    /// The number of outstanding callbacks
    pub fn pending(&self) -> usize {
        self.fifo.len()
    }

    pub(crate) fn pop(&mut self) -> Option<Thunk> {
        self.fifo.pop_front()
    }

    /// A handle watcher threads use to wake the loop
    pub fn waker(&self) -> Sender<Wakeup> {
        self.tx.clone()
    }

    /// Halt the loop after the current dispatch
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Collect readiness events, blocking for the first one if
    /// `block` is set and none are immediately available
    pub(crate) fn wait(&mut self, block: bool) -> Vec<Wakeup> {
        let mut wakeups = vec![];

        loop {
            match self.rx.try_recv() {
                Ok(wakeup) => wakeups.push(wakeup),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if wakeups.is_empty() && block {
            // Cannot disconnect, the loop holds its own sender
            if let Ok(wakeup) = self.rx.recv() {
                wakeups.push(wakeup);
            }
        }

        wakeups
    }
}
