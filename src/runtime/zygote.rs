use crate::runtime::{Runtime, RuntimeResult, signal_catcher::SignalCatcher};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub(in crate::runtime) struct ZygoteState {
    is_zygote: AtomicBool,
    did_fork: AtomicBool,
    signal_catcher: Mutex<Option<SignalCatcher>>,
}

impl ZygoteState {
    pub(in crate::runtime) fn new(is_zygote: bool) -> ZygoteState {
        ZygoteState {
            is_zygote: AtomicBool::new(is_zygote),
            ..ZygoteState::default()
        }
    }
}

impl Runtime {
    pub fn is_zygote(&self) -> bool {
        self.zygote.is_zygote.load(Ordering::Acquire)
    }

    /// Prepares the runtime to be forked. Returns false, leaving the runtime
    /// usable, if a collection, a method synthesis, or a thread birth is in
    /// progress.
    pub fn pre_zygote_fork(&self) -> bool {
        let threads_being_born = self.lifecycle.number_of_threads_being_born();
        if threads_being_born > 0 {
            warn!(threads_being_born, "refusing to fork while threads are being born");
            return false;
        }
        if self.method_registry.is_synthesizing() {
            warn!("refusing to fork while a runtime method is being synthesized");
            return false;
        }
        if !self.heap.pre_zygote_fork() {
            warn!("refusing to fork while a collection is in progress");
            return false;
        }
        self.stop_daemon_threads();
        info!("ready to fork");
        true
    }

    /// Marks this process as the zygote. Per-process daemons are not started
    /// here; each forked child starts its own.
    pub fn init_zygote(&self) -> bool {
        self.zygote.is_zygote.store(true, Ordering::Release);
        self.stop_daemon_threads();
        debug!("initialized zygote");
        true
    }

    /// Called once in a freshly forked child. Afterwards the forking thread
    /// is the only attached thread.
    pub fn did_fork_from_zygote(&self) -> RuntimeResult<()> {
        let already_forked = self.zygote.did_fork.swap(true, Ordering::AcqRel);
        debug_assert!(!already_forked, "did_fork_from_zygote called twice");
        self.zygote.is_zygote.store(false, Ordering::Release);

        let removed = self.thread_list.retain_current();
        debug!(removed, "dropped threads that did not survive the fork");
        if self.thread_list.current().is_none() {
            let name = thread::current().name().unwrap_or("main").to_string();
            self.attach_current_thread(&name, false, false)?;
        }
        self.start_daemon_threads()
    }

    pub(in crate::runtime) fn start_daemon_threads(&self) -> RuntimeResult<()> {
        let mut signal_catcher = self.zygote.signal_catcher.lock();
        if signal_catcher.is_none() {
            *signal_catcher = Some(SignalCatcher::start(self.self_ref.clone())?);
        }
        Ok(())
    }

    pub(in crate::runtime) fn stop_daemon_threads(&self) {
        let signal_catcher = self.zygote.signal_catcher.lock().take();
        if let Some(signal_catcher) = signal_catcher {
            signal_catcher.stop();
        }
    }

    pub fn has_daemon_threads(&self) -> bool {
        self.zygote.signal_catcher.lock().is_some()
    }

    /// Asks the signal catcher to write a dump. Returns false if it is not
    /// running.
    pub fn request_dump(&self) -> bool {
        match &*self.zygote.signal_catcher.lock() {
            Some(signal_catcher) => {
                signal_catcher.request_dump();
                true
            }
            None => false,
        }
    }
}
