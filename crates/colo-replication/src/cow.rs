//! Copy-on-write interlock (component B).
//!
//! Grounded on `vmm/src/macos/barrier.rs::BreakableBarrier`: a plain
//! `std::sync::{Mutex, Condvar}` pair guarding a small piece of shared
//! state, with waiters parked via `Condvar::wait_while` and woken by
//! `notify_all` once the state changes. Here the shared state is the list
//! of cluster ranges currently undergoing COW capture.

use std::sync::{Condvar, Mutex};

use crate::sector::ClusterRange;

struct CowState {
    inflight: Vec<ClusterRange>,
}

/// Tracks which cluster ranges currently have a COW pre-image capture in
/// flight, and lets callers serialize against overlapping ranges.
pub struct CowEngine {
    state: Mutex<CowState>,
    condvar: Condvar,
}

impl Default for CowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CowEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CowState { inflight: Vec::new() }),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until no in-flight capture overlaps `range`. Exposed for
    /// callers that want to observe quiescence without registering a
    /// capture of their own; [`Self::begin`] performs its own wait under the
    /// same lock it registers under, so the two never race against each
    /// other.
    pub fn wait_for_overlap(&self, range: ClusterRange) {
        let guard = self.state.lock().unwrap();
        let _guard = self
            .condvar
            .wait_while(guard, |s| s.inflight.iter().any(|r| r.overlaps(&range)))
            .unwrap();
    }

    /// Blocks until no in-flight capture overlaps `range`, then registers
    /// `range` as in flight, all under one held lock so no other thread can
    /// observe the gap between the wait and the registration.
    pub fn begin(&self, range: ClusterRange) -> CowRequest {
        let guard = self.state.lock().unwrap();
        let mut state = self
            .condvar
            .wait_while(guard, |s| s.inflight.iter().any(|r| r.overlaps(&range)))
            .unwrap();
        state.inflight.push(range);
        CowRequest { range }
    }

    /// Retires a capture started with [`Self::begin`] and wakes anyone
    /// waiting on an overlapping range.
    pub fn end(&self, req: CowRequest) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.inflight.iter().position(|r| *r == req.range) {
            state.inflight.remove(pos);
        }
        drop(state);
        self.condvar.notify_all();
    }

    /// Convenience RAII wrapper: waits, registers, and retires on drop.
    pub fn guard(&self, range: ClusterRange) -> CowGuard<'_> {
        let req = self.begin(range);
        CowGuard { engine: self, req: Some(req) }
    }
}

/// A handle to an in-flight COW capture. Lives on the stack of the task
/// that called [`CowEngine::begin`]; the engine only tracks the range it
/// carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowRequest {
    range: ClusterRange,
}

/// RAII wrapper around a [`CowRequest`] that calls [`CowEngine::end`] on
/// drop, used by the driver's COW interception flow.
pub struct CowGuard<'a> {
    engine: &'a CowEngine,
    req: Option<CowRequest>,
}

impl Drop for CowGuard<'_> {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            self.engine.end(req);
        }
    }
}
