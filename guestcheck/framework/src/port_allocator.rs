// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hands out the host ports VMs use for serial consoles and forwarded guest
//! services.

use std::{
    ops::Range,
    sync::atomic::{AtomicU16, Ordering},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("no more ports available in {0:?}")]
    NoMorePorts(Range<u16>),
}

pub struct PortAllocator {
    range: Range<u16>,

    /// VMs are created from several tasks, so the cursor is atomic rather
    /// than behind a lock.
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        let start = range.start;
        Self { range, next: AtomicU16::new(start) }
    }

    pub fn next(&self) -> Result<u16, PortAllocatorError> {
        let port = self.next.fetch_add(1, Ordering::Relaxed);
        if port < self.range.start || port >= self.range.end {
            // Keep the cursor pinned at the end so it can't wrap around.
            self.next.store(self.range.end, Ordering::Relaxed);
            Err(PortAllocatorError::NoMorePorts(self.range.clone()))
        } else {
            Ok(port)
        }
    }

    /// Allocates `n` ports at once.
    pub fn take(&self, n: usize) -> Result<Vec<u16>, PortAllocatorError> {
        (0..n).map(|_| self.next()).collect()
    }

    /// Makes every port available again. Called between tests, once all of
    /// the previous test's VMs are gone.
    pub fn reset(&self) {
        self.next.store(self.range.start, Ordering::Relaxed);
    }
}
