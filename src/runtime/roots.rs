use crate::runtime::ObjectRef;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Receives each root reference. Collector state travels in the closure's
/// captures.
pub type RootVisitor<'a> = dyn FnMut(ObjectRef) + 'a;

/// Controls how root tables that track dirtiness are walked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VisitFlags {
    /// Only report roots added or marked dirty since the last clean.
    pub only_dirty: bool,
    /// Clear the dirty bit of every reported root after the visitor returns.
    pub clean_dirty: bool,
}

impl VisitFlags {
    pub const fn new(only_dirty: bool, clean_dirty: bool) -> VisitFlags {
        VisitFlags {
            only_dirty,
            clean_dirty,
        }
    }
}

bitflags! {
    /// Root categories, in full-pass visiting order.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct RootCategory: u8 {
        const METHODS = 1 << 0;
        const OUT_OF_MEMORY_ERROR = 1 << 1;
        const INTERN_TABLE = 1 << 2;
        const CLASS_LINKER = 1 << 3;
        const MONITORS = 1 << 4;
        const COMPILE_TIME_CLASS_PATH = 1 << 5;
        const THREADS = 1 << 6;
    }
}

impl RootCategory {
    /// Roots safe to visit while mutators run.
    pub const CONCURRENT: RootCategory = RootCategory::INTERN_TABLE.union(RootCategory::CLASS_LINKER);
    /// Runtime-owned roots outside any thread and outside the concurrent set.
    pub const NON_THREAD: RootCategory = RootCategory::METHODS
        .union(RootCategory::OUT_OF_MEMORY_ERROR)
        .union(RootCategory::MONITORS)
        .union(RootCategory::COMPILE_TIME_CLASS_PATH);
    /// Roots that require mutators to be paused.
    pub const NON_CONCURRENT: RootCategory = RootCategory::THREADS;
}

const _: () = {
    let concurrent = RootCategory::CONCURRENT.bits();
    let non_thread = RootCategory::NON_THREAD.bits();
    let non_concurrent = RootCategory::NON_CONCURRENT.bits();
    assert!(concurrent & non_thread == 0);
    assert!(concurrent & non_concurrent == 0);
    assert!(non_thread & non_concurrent == 0);
    assert!(concurrent | non_thread | non_concurrent == RootCategory::all().bits());
};

/// A subsystem that owns root references.
pub trait RootSource: Send + Sync {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags);
}

#[derive(Copy, Clone, Debug)]
struct RootSlot {
    root: ObjectRef,
    dirty: bool,
}

/// Root storage with a dirty bit per entry. New entries start dirty.
#[derive(Debug, Default)]
pub struct RootTable {
    slots: Mutex<Vec<RootSlot>>,
}

impl RootTable {
    pub fn new() -> RootTable {
        RootTable::default()
    }

    pub fn add(&self, root: ObjectRef) {
        self.slots.lock().push(RootSlot { root, dirty: true });
    }

    pub fn remove(&self, root: ObjectRef) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.root != root);
        slots.len() != before
    }

    /// Returns false if `root` is not in the table.
    pub fn mark_dirty(&self, root: ObjectRef) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|slot| slot.root == root) {
            Some(slot) => {
                slot.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.dirty).count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    // the table stays locked while the visitor runs; visitors must not call
    // back into it
    pub fn visit(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if flags.only_dirty && !slot.dirty {
                continue;
            }
            visitor(slot.root);
            if flags.clean_dirty {
                slot.dirty = false;
            }
        }
    }
}

impl RootSource for RootTable {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.visit(visitor, flags);
    }
}

/// A single optional root, such as the pre-allocated OutOfMemoryError.
#[derive(Debug, Default)]
pub struct RootCell {
    root: Mutex<Option<ObjectRef>>,
}

impl RootCell {
    pub fn get(&self) -> Option<ObjectRef> {
        *self.root.lock()
    }

    pub fn set(&self, root: ObjectRef) {
        let mut slot = self.root.lock();
        assert!(slot.is_none(), "root cell already holds {:?}", *slot);
        *slot = Some(root);
    }

    pub fn clear(&self) {
        self.root.lock().take();
    }
}

impl RootSource for RootCell {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, _flags: VisitFlags) {
        if let Some(root) = self.get() {
            visitor(root);
        }
    }
}

/// Fans root visitation out to every registered source, one source per
/// category.
pub struct RootDispatcher {
    sources: Vec<(RootCategory, Arc<dyn RootSource>)>,
}

impl RootDispatcher {
    pub fn new(mut sources: Vec<(RootCategory, Arc<dyn RootSource>)>) -> RootDispatcher {
        let mut seen = RootCategory::empty();
        for (category, _) in &sources {
            assert_eq!(
                category.bits().count_ones(),
                1,
                "root source must belong to exactly one category: {category:?}"
            );
            assert!(
                !seen.intersects(*category),
                "duplicate root source for {category:?}"
            );
            seen |= *category;
        }
        assert_eq!(
            seen,
            RootCategory::all(),
            "missing root sources: {:?}",
            RootCategory::all().difference(seen)
        );
        sources.sort_by_key(|(category, _)| category.bits());
        RootDispatcher { sources }
    }

    fn visit(&self, partition: RootCategory, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        for (category, source) in &self.sources {
            if partition.contains(*category) {
                source.visit_roots(visitor, flags);
            }
        }
    }

    pub fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.visit(RootCategory::all(), visitor, flags);
    }

    pub fn visit_concurrent_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.visit(RootCategory::CONCURRENT, visitor, flags);
    }

    pub fn visit_non_thread_roots(&self, visitor: &mut RootVisitor<'_>) {
        self.visit(RootCategory::NON_THREAD, visitor, VisitFlags::default());
    }

    pub fn visit_non_concurrent_roots(&self, visitor: &mut RootVisitor<'_>) {
        self.visit(RootCategory::NON_CONCURRENT, visitor, VisitFlags::default());
    }
}

impl fmt::Debug for RootDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|(category, _)| category))
            .finish()
    }
}
