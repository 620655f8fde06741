use crate::runtime::Runtime;
use parking_lot::{Condvar, Mutex};
use std::{
    io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct CatcherState {
    stop: bool,
    pending_dumps: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<CatcherState>,
    wakeup: Condvar,
}

/// Daemon thread that writes a runtime dump each time one is requested.
#[derive(Debug)]
pub(in crate::runtime) struct SignalCatcher {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl SignalCatcher {
    pub(in crate::runtime) fn start(runtime: Weak<Runtime>) -> io::Result<SignalCatcher> {
        let shared = Arc::new(Shared::default());
        let handle = thread::Builder::new().name("Signal Catcher".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || run(&shared, &runtime)
        })?;
        debug!("started signal catcher");
        Ok(SignalCatcher {
            shared,
            handle: Some(handle),
        })
    }

    pub(in crate::runtime) fn request_dump(&self) {
        self.shared.state.lock().pending_dumps += 1;
        self.shared.wakeup.notify_one();
    }

    pub(in crate::runtime) fn stop(mut self) {
        self.shared.state.lock().stop = true;
        self.shared.wakeup.notify_one();
        if let Some(handle) = self.handle.take() {
            // the catcher may drop the last runtime reference itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("stopped signal catcher");
    }
}

fn run(shared: &Shared, runtime: &Weak<Runtime>) {
    loop {
        let mut state = shared.state.lock();
        while !state.stop && state.pending_dumps == 0 {
            shared.wakeup.wait(&mut state);
        }
        if state.stop {
            return;
        }
        state.pending_dumps -= 1;
        drop(state);

        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        info!("reacting to dump request");
        runtime.handle_sig_quit();
    }
}
