use crate::runtime::{
    ObjectRef, RuntimeError, RuntimeResult,
    roots::{RootSource, RootVisitor, VisitFlags},
    stats::RuntimeStats,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread::{self, ThreadId},
};
use tracing::{debug, warn};

/// A native thread attached to the runtime.
#[derive(Debug)]
pub struct Thread {
    os_id: ThreadId,
    thin_lock_id: u32,
    name: String,
    daemon: bool,
    peer: Option<ObjectRef>,
    stack_roots: Mutex<Vec<ObjectRef>>,
    stats: RuntimeStats,
}

impl Thread {
    pub fn os_id(&self) -> ThreadId {
        self.os_id
    }

    pub fn thin_lock_id(&self) -> u32 {
        self.thin_lock_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// The managed `java.lang.Thread` object, if one was created on attach.
    pub fn peer(&self) -> Option<ObjectRef> {
        self.peer
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Pushes a reference held by a frame of this thread's stack.
    pub fn push_root(&self, root: ObjectRef) {
        self.stack_roots.lock().push(root);
    }

    pub fn pop_root(&self) -> Option<ObjectRef> {
        self.stack_roots.lock().pop()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_roots.lock().len()
    }

    fn visit_roots(&self, visitor: &mut RootVisitor<'_>) {
        if let Some(peer) = self.peer {
            visitor(peer);
        }
        for &root in self.stack_roots.lock().iter() {
            visitor(root);
        }
    }
}

/// Registry of attached threads.
#[derive(Debug)]
pub struct ThreadList {
    threads: Mutex<Vec<Arc<Thread>>>,
    next_thin_lock_id: AtomicU32,
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadList {
    pub fn new() -> ThreadList {
        ThreadList {
            threads: Mutex::new(vec![]),
            next_thin_lock_id: AtomicU32::new(1),
        }
    }

    /// Registers the calling thread.
    pub fn register(&self, name: &str, daemon: bool, peer: Option<ObjectRef>) -> RuntimeResult<Arc<Thread>> {
        let os_id = thread::current().id();
        let mut threads = self.threads.lock();
        if let Some(existing) = threads.iter().find(|t| t.os_id == os_id) {
            return Err(RuntimeError::AlreadyAttached(existing.name.clone()));
        }
        let thread = Arc::new(Thread {
            os_id,
            thin_lock_id: self.next_thin_lock_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            daemon,
            peer,
            stack_roots: Mutex::new(vec![]),
            stats: RuntimeStats::default(),
        });
        threads.push(Arc::clone(&thread));
        debug!(name, daemon, thin_lock_id = thread.thin_lock_id, "thread attached");
        Ok(thread)
    }

    /// Removes the calling thread.
    pub fn unregister(&self) -> Option<Arc<Thread>> {
        let os_id = thread::current().id();
        let mut threads = self.threads.lock();
        let index = threads.iter().position(|t| t.os_id == os_id)?;
        let thread = threads.remove(index);
        debug!(name = thread.name(), "thread detached");
        Some(thread)
    }

    /// The record of the calling thread, if attached.
    pub fn current(&self) -> Option<Arc<Thread>> {
        let os_id = thread::current().id();
        self.threads.lock().iter().find(|t| t.os_id == os_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn thread_names(&self) -> Vec<String> {
        self.threads.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Drops every record except the calling thread's. Used in a freshly
    /// forked child, where the other threads no longer exist.
    pub(in crate::runtime) fn retain_current(&self) -> usize {
        let os_id = thread::current().id();
        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|t| t.os_id == os_id);
        before - threads.len()
    }

    pub(in crate::runtime) fn teardown(&self) {
        let mut threads = self.threads.lock();
        let non_daemon = threads.iter().filter(|t| !t.daemon).count();
        if non_daemon > 0 {
            warn!(non_daemon, "tearing down thread list with attached non-daemon threads");
        }
        threads.clear();
    }

    pub(in crate::runtime) fn dump_for_sig_quit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let threads = self.threads.lock();
        writeln!(out, "Threads ({}):", threads.len())?;
        for thread in threads.iter() {
            writeln!(
                out,
                "  \"{}\"{} tid={} stack={}",
                thread.name,
                if thread.daemon { " daemon" } else { "" },
                thread.thin_lock_id,
                thread.stack_depth()
            )?;
        }
        Ok(())
    }
}

impl RootSource for ThreadList {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, _flags: VisitFlags) {
        for thread in self.threads.lock().iter() {
            thread.visit_roots(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_current_thread_once() {
        let list = ThreadList::new();
        let main = list.register("main", false, None).unwrap();
        assert_eq!(main.name(), "main");
        assert!(matches!(
            list.register("again", false, None),
            Err(RuntimeError::AlreadyAttached(name)) if name == "main"
        ));
        assert!(Arc::ptr_eq(&list.current().unwrap(), &main));

        let list = Arc::new(list);
        let worker_list = Arc::clone(&list);
        let worker = thread::spawn(move || worker_list.register("worker", true, None).unwrap())
            .join()
            .unwrap();
        assert_ne!(worker.thin_lock_id(), main.thin_lock_id());
        assert_eq!(list.thread_names(), vec!["main", "worker"]);

        assert_eq!(list.retain_current(), 1);
        assert_eq!(list.thread_names(), vec!["main"]);
        assert!(list.unregister().is_some());
        assert!(list.unregister().is_none());
    }

    #[test]
    fn test_roots_are_peers_then_stack() {
        let list = ThreadList::new();
        let thread = list.register("main", false, Some(ObjectRef::from_id(5))).unwrap();
        thread.push_root(ObjectRef::from_id(9));
        thread.push_root(ObjectRef::from_id(7));

        let mut roots = vec![];
        list.visit_roots(&mut |root| roots.push(root.id()), VisitFlags::default());
        assert_eq!(roots, vec![5, 9, 7]);

        assert_eq!(thread.pop_root(), Some(ObjectRef::from_id(7)));
        assert_eq!(thread.stack_depth(), 1);
    }
}
