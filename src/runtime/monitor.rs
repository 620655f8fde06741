use crate::runtime::{
    ObjectRef,
    roots::{RootSource, RootVisitor, VisitFlags},
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};
use tracing::debug;

/// An inflated lock. The object it guards stays reachable while the
/// monitor is listed.
#[derive(Debug)]
pub struct Monitor {
    object: ObjectRef,
    owner_thin_lock_id: AtomicU32,
}

impl Monitor {
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    /// 0 when unowned.
    pub fn owner(&self) -> u32 {
        self.owner_thin_lock_id.load(Ordering::Acquire)
    }

    pub fn try_enter(&self, thin_lock_id: u32) -> bool {
        self.owner_thin_lock_id
            .compare_exchange(0, thin_lock_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || self.owner() == thin_lock_id
    }

    pub fn exit(&self, thin_lock_id: u32) -> bool {
        self.owner_thin_lock_id
            .compare_exchange(thin_lock_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Default)]
pub struct MonitorList {
    monitors: Mutex<Vec<Arc<Monitor>>>,
}

impl MonitorList {
    pub fn new() -> MonitorList {
        MonitorList::default()
    }

    /// Returns the monitor for `object`, inflating one if needed.
    pub fn inflate(&self, object: ObjectRef) -> Arc<Monitor> {
        let mut monitors = self.monitors.lock();
        if let Some(monitor) = monitors.iter().find(|m| m.object == object) {
            return Arc::clone(monitor);
        }
        let monitor = Arc::new(Monitor {
            object,
            owner_thin_lock_id: AtomicU32::new(0),
        });
        monitors.push(Arc::clone(&monitor));
        debug!(%object, "inflated monitor");
        monitor
    }

    pub fn remove(&self, object: ObjectRef) -> bool {
        let mut monitors = self.monitors.lock();
        let before = monitors.len();
        monitors.retain(|m| m.object != object);
        monitors.len() != before
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(in crate::runtime) fn teardown(&self) {
        debug!(monitors = self.len(), "tearing down monitor list");
        self.monitors.lock().clear();
    }

    pub(in crate::runtime) fn dump_for_sig_quit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Monitors: {}", self.len())
    }
}

impl RootSource for MonitorList {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, _flags: VisitFlags) {
        for monitor in self.monitors.lock().iter() {
            visitor(monitor.object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflate_is_idempotent() {
        let list = MonitorList::new();
        let object = ObjectRef::from_id(4);
        let monitor = list.inflate(object);
        assert!(Arc::ptr_eq(&monitor, &list.inflate(object)));
        assert_eq!(list.len(), 1);

        let mut roots = vec![];
        list.visit_roots(&mut |root| roots.push(root), VisitFlags::default());
        assert_eq!(roots, vec![object]);

        assert!(list.remove(object));
        assert!(list.is_empty());
    }

    #[test]
    fn test_enter_and_exit() {
        let monitor = MonitorList::new().inflate(ObjectRef::from_id(1));
        assert!(monitor.try_enter(1));
        assert!(monitor.try_enter(1));
        assert!(!monitor.try_enter(2));
        assert!(!monitor.exit(2));
        assert!(monitor.exit(1));
        assert_eq!(monitor.owner(), 0);
    }
}
