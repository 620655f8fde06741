use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Started,
    ShuttingDown,
    ShutDown,
}

#[derive(Debug)]
struct ShutdownState {
    state: LifecycleState,
    threads_being_born: usize,
    shutting_down_started: bool,
}

/// Tracks the runtime's lifecycle state and the number of threads in the
/// middle of attaching, so shutdown can wait for them to settle.
#[derive(Debug)]
pub struct LifecycleController {
    shutdown_lock: Mutex<ShutdownState>,
    shutdown_cond: Condvar,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> LifecycleController {
        LifecycleController {
            shutdown_lock: Mutex::new(ShutdownState {
                state: LifecycleState::Uninitialized,
                threads_being_born: 0,
                shutting_down_started: false,
            }),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shutdown_lock.lock().state
    }

    pub(in crate::runtime) fn transition(&self, from: LifecycleState, to: LifecycleState) {
        let mut shutdown = self.shutdown_lock.lock();
        assert_eq!(
            shutdown.state, from,
            "runtime must be {from:?} to become {to:?}"
        );
        shutdown.state = to;
        debug!(?from, ?to, "runtime lifecycle transition");
    }

    /// True from the moment shutdown begins, including while it waits for
    /// threads being born.
    pub fn is_shutting_down(&self) -> bool {
        let shutdown = self.shutdown_lock.lock();
        shutdown.shutting_down_started || shutdown.state >= LifecycleState::ShuttingDown
    }

    pub fn number_of_threads_being_born(&self) -> usize {
        self.shutdown_lock.lock().threads_being_born
    }

    /// Registers a thread as being born. Returns false, leaving the count
    /// unchanged, once shutdown has begun.
    #[must_use]
    pub fn start_thread_birth(&self) -> bool {
        let mut shutdown = self.shutdown_lock.lock();
        if shutdown.shutting_down_started {
            return false;
        }
        shutdown.threads_being_born += 1;
        true
    }

    pub fn end_thread_birth(&self) {
        let mut shutdown = self.shutdown_lock.lock();
        assert!(
            shutdown.threads_being_born > 0,
            "thread birth ended without a matching start"
        );
        shutdown.threads_being_born -= 1;
        if shutdown.shutting_down_started && shutdown.threads_being_born == 0 {
            self.shutdown_cond.notify_all();
        }
    }

    /// Scoped form of [`start_thread_birth`](Self::start_thread_birth).
    pub fn thread_birth(&self) -> Option<ThreadBirth<'_>> {
        self.start_thread_birth()
            .then(|| ThreadBirth { lifecycle: self })
    }

    /// Enters `ShuttingDown` and blocks new births, then waits for in-flight
    /// ones. Returns false if shutdown had already begun.
    pub(in crate::runtime) fn begin_shutdown(&self) -> bool {
        let mut shutdown = self.shutdown_lock.lock();
        if shutdown.shutting_down_started {
            return false;
        }
        shutdown.shutting_down_started = true;
        shutdown.state = LifecycleState::ShuttingDown;
        while shutdown.threads_being_born > 0 {
            debug!(
                threads_being_born = shutdown.threads_being_born,
                "shutdown waiting for threads being born"
            );
            self.shutdown_cond.wait(&mut shutdown);
        }
        true
    }

    pub(in crate::runtime) fn finish_shutdown(&self) {
        self.transition(LifecycleState::ShuttingDown, LifecycleState::ShutDown);
    }
}

/// Ends the thread birth when dropped.
#[must_use]
#[derive(Debug)]
pub struct ThreadBirth<'a> {
    lifecycle: &'a LifecycleController,
}

impl Drop for ThreadBirth<'_> {
    fn drop(&mut self) {
        self.lifecycle.end_thread_birth();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    };

    #[test]
    fn test_births_pair_up() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.start_thread_birth());
        assert!(lifecycle.start_thread_birth());
        assert_eq!(lifecycle.number_of_threads_being_born(), 2);
        lifecycle.end_thread_birth();
        {
            let _birth = lifecycle.thread_birth().unwrap();
            assert_eq!(lifecycle.number_of_threads_being_born(), 2);
        }
        lifecycle.end_thread_birth();
        assert_eq!(lifecycle.number_of_threads_being_born(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching start")]
    fn test_unmatched_end_panics() {
        LifecycleController::new().end_thread_birth();
    }

    #[test]
    #[should_panic(expected = "runtime must be Initialized to become Started")]
    fn test_out_of_order_transition_panics() {
        LifecycleController::new().transition(LifecycleState::Initialized, LifecycleState::Started);
    }

    #[test]
    fn test_shutdown_waits_for_births() {
        let lifecycle = Arc::new(LifecycleController::new());
        assert!(lifecycle.start_thread_birth());

        let finished = Arc::new(AtomicBool::new(false));
        let shutdown = {
            let lifecycle = Arc::clone(&lifecycle);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                assert!(lifecycle.begin_shutdown());
                finished.store(true, Ordering::SeqCst);
            })
        };

        while !lifecycle.is_shutting_down() {
            thread::yield_now();
        }
        // the flag is set but the birth is still in flight
        assert!(!lifecycle.start_thread_birth());
        assert_eq!(lifecycle.number_of_threads_being_born(), 1);
        thread::sleep(Duration::from_millis(20));
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);

        lifecycle.end_thread_birth();
        shutdown.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
        assert!(!lifecycle.begin_shutdown());
    }
}
