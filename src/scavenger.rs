//! Background thread that returns idle committed pages to the OS.
//!
//! The thread sleeps until the page heap holds more committed free pages
//! than the configured minimum. It is woken by the free that crosses the
//! threshold, waits `scavenge_delay`, and runs scavenge passes until the heap
//! is back under the threshold.

use crate::allocator::InsideHeap;
use crate::page_heap::SharedPageHeap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct WakeState {
    pending: bool,
    shutdown: bool,
}

/// Shared between the scavenger thread and the threads that free pages.
#[derive(Debug, Default)]
pub struct ScavengerWake {
    state: Mutex<WakeState>,
    cond: Condvar,
    /// Set while the thread is parked waiting for work.
    idle: AtomicBool,
}

impl ScavengerWake {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake the thread if it is parked. Never called with allocator locks held.
    pub fn signal(&self) {
        if self.idle.swap(false, Ordering::AcqRel) {
            self.state().pending = true;
            self.cond.notify_one();
        }
    }

    fn shutdown(&self) {
        self.state().shutdown = true;
        self.cond.notify_all();
    }
}

/// Handle to the running scavenger thread. Dropping it stops and joins it.
#[derive(Debug)]
pub struct Scavenger {
    wake: Arc<ScavengerWake>,
    handle: Option<JoinHandle<()>>,
}

impl Scavenger {
    pub fn spawn(
        pages: Arc<SharedPageHeap>,
        wake: Arc<ScavengerWake>,
        delay: Duration,
    ) -> io::Result<Self> {
        let thread_wake = Arc::clone(&wake);
        let handle = std::thread::Builder::new()
            .name("tcalloc-scavenger".into())
            .spawn(move || {
                // Everything this thread allocates is heap metadata.
                let _inside = InsideHeap::enter();
                run(&pages, &thread_wake, delay)
            })?;
        log::info!("tcalloc: scavenger started (delay {delay:?})");
        Ok(Self {
            wake,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.wake.shutdown();
        if handle.join().is_err() {
            log::warn!("tcalloc: scavenger thread panicked");
        }
        log::info!("tcalloc: scavenger stopped");
    }
}

impl Drop for Scavenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(pages: &SharedPageHeap, wake: &ScavengerWake, delay: Duration) {
    loop {
        {
            wake.idle.store(true, Ordering::SeqCst);
            let mut state = wake.state();
            while !state.shutdown && !state.pending && !pages.should_scavenge() {
                state = wake
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.shutdown {
                return;
            }
            state.pending = false;
            wake.idle.store(false, Ordering::SeqCst);
        }

        let state = wake.state();
        let (state, _) = wake
            .cond
            .wait_timeout_while(state, delay, |s| !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            return;
        }
        drop(state);

        pages.scavenge();
    }
}
