use bitflags::bitflags;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

bitflags! {
    /// Counters readable through [`crate::Runtime::stat`]. Per-thread kinds
    /// are the global kinds shifted into the upper half.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct StatKinds: u32 {
        const ALLOCATED_OBJECTS = 1 << 0;
        const ALLOCATED_BYTES = 1 << 1;
        const FREED_OBJECTS = 1 << 2;
        const FREED_BYTES = 1 << 3;
        const GC_INVOCATIONS = 1 << 4;
        const CLASS_INIT_COUNT = 1 << 5;
        const CLASS_INIT_TIME = 1 << 6;

        const THREAD_ALLOCATED_OBJECTS = Self::ALLOCATED_OBJECTS.bits() << 16;
        const THREAD_ALLOCATED_BYTES = Self::ALLOCATED_BYTES.bits() << 16;
        const THREAD_FREED_OBJECTS = Self::FREED_OBJECTS.bits() << 16;
        const THREAD_FREED_BYTES = Self::FREED_BYTES.bits() << 16;
        const THREAD_GC_INVOCATIONS = Self::GC_INVOCATIONS.bits() << 16;
        const THREAD_CLASS_INIT_COUNT = Self::CLASS_INIT_COUNT.bits() << 16;
        const THREAD_CLASS_INIT_TIME = Self::CLASS_INIT_TIME.bits() << 16;
    }
}

impl StatKinds {
    const GLOBAL_MASK: u32 = 0xffff;

    pub fn global_part(self) -> StatKinds {
        StatKinds::from_bits_truncate(self.bits() & Self::GLOBAL_MASK)
    }

    /// The thread kinds, shifted down onto their global counterparts.
    pub fn thread_part(self) -> StatKinds {
        StatKinds::from_bits_truncate(self.bits() >> 16)
    }
}

#[derive(Debug, Default)]
pub struct RuntimeStats {
    allocated_objects: AtomicU64,
    allocated_bytes: AtomicU64,
    freed_objects: AtomicU64,
    freed_bytes: AtomicU64,
    gc_invocations: AtomicU64,
    class_init_count: AtomicU64,
    class_init_time_ns: AtomicU64,
}

impl RuntimeStats {
    pub fn record_allocation(&self, bytes: usize) {
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_free(&self, objects: usize, bytes: usize) {
        self.freed_objects.fetch_add(objects as u64, Ordering::Relaxed);
        self.freed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_gc(&self) {
        self.gc_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_class_init(&self, elapsed: Duration) {
        self.class_init_count.fetch_add(1, Ordering::Relaxed);
        self.class_init_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn counter(&self, kind: StatKinds) -> Option<&AtomicU64> {
        [
            (StatKinds::ALLOCATED_OBJECTS, &self.allocated_objects),
            (StatKinds::ALLOCATED_BYTES, &self.allocated_bytes),
            (StatKinds::FREED_OBJECTS, &self.freed_objects),
            (StatKinds::FREED_BYTES, &self.freed_bytes),
            (StatKinds::GC_INVOCATIONS, &self.gc_invocations),
            (StatKinds::CLASS_INIT_COUNT, &self.class_init_count),
            (StatKinds::CLASS_INIT_TIME, &self.class_init_time_ns),
        ]
        .into_iter()
        .find_map(|(k, counter)| (k == kind).then_some(counter))
    }

    /// Reads a single global counter.
    pub fn get(&self, kind: StatKinds) -> u64 {
        self.counter(kind)
            .unwrap_or_else(|| panic!("not a single global stat kind: {kind:?}"))
            .load(Ordering::Relaxed)
    }

    pub fn clear(&self, kinds: StatKinds) {
        for kind in kinds.global_part().iter() {
            if let Some(counter) = self.counter(kind) {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}
