// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Uniprocessor exclusion primitives.
//!
//! Everything runs on the event loop's thread, so these are plain state
//! machines: acquisition either succeeds immediately or the caller
//! stalls its job and retries when the holder releases.

use std::collections::HashSet;

/// A single-holder gate, used for the interactive configurator
#[derive(Debug, Default)]
pub struct Lock {
    locked: bool,
}

impl Lock {
    pub fn acquire(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    pub fn release(&mut self) {
        debug_assert!(self.locked);
        self.locked = false;
    }

    pub fn held(&self) -> bool {
        self.locked
    }
}

/// A file lock, excluding access to the same files from different ports.
/// Acquisition is all-or-nothing over the requested set.
#[derive(Debug, Default)]
pub struct FileLock {
    files: HashSet<String>,
}

impl FileLock {
    pub fn acquire(&mut self, files: &[String]) -> bool {
        if files.iter().any(|f| self.files.contains(f)) {
            return false;
        }
        self.files.extend(files.iter().cloned());
        true
    }

    pub fn release(&mut self, files: &[String]) {
        debug_assert!(files.iter().all(|f| self.files.contains(f)));
        for file in files {
            self.files.remove(file);
        }
    }

    pub fn holds(&self, file: &str) -> bool {
        self.files.contains(file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gate_excludes_second_holder() {
        let mut lock = Lock::default();
        assert!(lock.acquire());
        assert!(!lock.acquire());
        lock.release();
        assert!(lock.acquire());
    }

    #[test]
    fn file_sets_acquire_atomically() {
        let mut lock = FileLock::default();
        let a = vec!["one.tgz".to_owned(), "two.tgz".to_owned()];
        let b = vec!["two.tgz".to_owned(), "three.tgz".to_owned()];

        assert!(lock.acquire(&a));
        // Overlap on two.tgz refuses the whole set
        assert!(!lock.acquire(&b));
        assert!(!lock.holds("three.tgz"));

        lock.release(&a);
        assert!(lock.acquire(&b));
    }
}
