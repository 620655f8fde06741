use crate::runtime::{
    RuntimeError, RuntimeResult,
    famous_classes::FamousClass,
    options::ParsedOptions,
    stats::{RuntimeStats, StatKinds},
};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
    collections::HashSet,
    fmt,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, info};

pub mod string_table;

/// Handle to an object on the managed heap. Ids start at 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroU32);

impl ObjectRef {
    pub(crate) fn from_id(id: u32) -> ObjectRef {
        ObjectRef(NonZeroU32::new(id).expect("object id must be non-zero"))
    }

    pub fn id(self) -> u32 {
        self.0.get()
    }

    fn slot(self) -> usize {
        (self.id() - 1) as usize
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    Plain,
    /// modified UTF-8 bytes
    String(Arc<[u8]>),
    Throwable {
        message: String,
    },
}

#[derive(Debug)]
pub struct HeapObject {
    class_name: &'static str,
    size: usize,
    payload: ObjectPayload,
}

impl HeapObject {
    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn payload(&self) -> &ObjectPayload {
        &self.payload
    }
}

struct Objects {
    heap: Vec<Option<Arc<HeapObject>>>,
    next_id: u32,
    bytes_allocated: usize,
    // slots below this index belong to the zygote space and are never swept
    zygote_boundary: u32,
}

#[derive(Debug, Default)]
struct GcState {
    in_progress: bool,
    disabled: bool,
    zygote_space_created: bool,
}

pub struct Heap {
    objects: RwLock<Objects>,
    gc: Mutex<GcState>,
    gc_complete: Condvar,
    // read: an allocated object is on its way into a root table
    // write: a collection is visiting roots and sweeping
    root_publication: RwLock<()>,
    initial_size: usize,
    growth_limit: usize,
    capacity: usize,
    stats: RuntimeStats,
    stats_enabled: AtomicBool,
}

impl Heap {
    const MAX_OBJECT_ID: u32 = 0b10000000_00000000_00000000_00000000;

    pub fn new(options: &ParsedOptions) -> Heap {
        // a zero growth limit means "no limit below the maximum"
        let growth_limit = match options.heap_growth_limit {
            0 => options.heap_maximum_size,
            limit => limit.min(options.heap_maximum_size),
        };
        debug!(
            initial = options.heap_initial_size,
            growth_limit,
            capacity = options.heap_maximum_size,
            "creating heap"
        );
        Heap {
            objects: RwLock::new(Objects {
                heap: vec![],
                next_id: 0,
                bytes_allocated: 0,
                zygote_boundary: 0,
            }),
            gc: Mutex::new(GcState::default()),
            gc_complete: Condvar::new(),
            root_publication: RwLock::new(()),
            initial_size: options.heap_initial_size,
            growth_limit,
            capacity: options.heap_maximum_size,
            stats: RuntimeStats::default(),
            stats_enabled: AtomicBool::new(false),
        }
    }

    pub fn allocate(
        &self,
        class: FamousClass,
        extra_bytes: usize,
        payload: ObjectPayload,
    ) -> RuntimeResult<ObjectRef> {
        let size = class.instance_size + extra_bytes;
        let mut objects = self.objects.write();
        let out_of_memory = || RuntimeError::OutOfMemory {
            class_name: class.name.to_string(),
            size,
        };
        if objects.next_id >= Self::MAX_OBJECT_ID - 1 {
            return Err(out_of_memory());
        }
        match objects.bytes_allocated.checked_add(size) {
            Some(total) if total <= self.growth_limit => objects.bytes_allocated = total,
            _ => return Err(out_of_memory()),
        }
        let Objects { heap, next_id, .. } = &mut *objects;
        let id = allocate_id_for_obj(
            heap,
            next_id,
            Arc::new(HeapObject {
                class_name: class.name,
                size,
                payload,
            }),
        );
        drop(objects);

        if self.has_stats_enabled() {
            self.stats.record_allocation(size);
        }
        Ok(ObjectRef::from_id(id))
    }

    pub fn get(&self, obj: ObjectRef) -> Option<Arc<HeapObject>> {
        self.objects.read().heap.get(obj.slot())?.clone()
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.get(obj).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().heap.iter().flatten().count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.objects.read().bytes_allocated
    }

    pub fn total_memory(&self) -> usize {
        self.initial_size.max(self.bytes_allocated())
    }

    pub fn free_memory(&self) -> usize {
        self.total_memory() - self.bytes_allocated()
    }

    pub fn max_memory(&self) -> usize {
        self.growth_limit
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn has_stats_enabled(&self) -> bool {
        self.stats_enabled.load(Ordering::Acquire)
    }

    pub(in crate::runtime) fn set_stats_enabled(&self, enabled: bool) {
        if enabled && !self.has_stats_enabled() {
            self.stats.clear(StatKinds::all());
        }
        self.stats_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_gc_in_progress(&self) -> bool {
        self.gc.lock().in_progress
    }

    /// Marks a collection as running until the returned guard is dropped.
    /// Returns `None` if another collection is already running or
    /// collections have been disabled. Waits for in-flight root
    /// publications to finish.
    pub fn begin_collection(&self) -> Option<Collection<'_>> {
        {
            let mut gc = self.gc.lock();
            if gc.in_progress || gc.disabled {
                return None;
            }
            gc.in_progress = true;
        }
        if self.has_stats_enabled() {
            self.stats.record_gc();
        }
        Some(Collection {
            heap: self,
            _publication: self.root_publication.write(),
        })
    }

    /// Hold across allocating an object and recording it as a root, so no
    /// collection can sweep it in between. Nested holds are allowed.
    pub fn publishing_root(&self) -> RwLockReadGuard<'_, ()> {
        self.root_publication.read_recursive()
    }

    /// Refuses every later collection, then waits for a running one.
    pub(in crate::runtime) fn disable_collections(&self) {
        let mut gc = self.gc.lock();
        gc.disabled = true;
        while gc.in_progress {
            self.gc_complete.wait(&mut gc);
        }
    }

    /// Frees every object outside the zygote space that is not in `marked`.
    /// Returns the number of objects and bytes freed.
    pub(in crate::runtime) fn sweep(&self, marked: &HashSet<ObjectRef>) -> (usize, usize) {
        let mut objects = self.objects.write();
        let Objects {
            heap,
            next_id,
            bytes_allocated,
            zygote_boundary,
        } = &mut *objects;
        let (mut freed_objects, mut freed_bytes) = (0, 0);
        for index in *zygote_boundary as usize..heap.len() {
            let Some(object) = &heap[index] else {
                continue;
            };
            if marked.contains(&ObjectRef::from_id(index as u32 + 1)) {
                continue;
            }
            freed_objects += 1;
            freed_bytes += object.size;
            heap[index] = None;
            *next_id = (*next_id).min(index as u32);
        }
        *bytes_allocated -= freed_bytes;
        drop(objects);

        if freed_objects > 0 && self.has_stats_enabled() {
            self.stats.record_free(freed_objects, freed_bytes);
        }
        (freed_objects, freed_bytes)
    }

    /// Moves every live object into the zygote space. Fails while a
    /// collection is running.
    pub(in crate::runtime) fn pre_zygote_fork(&self) -> bool {
        let mut gc = self.gc.lock();
        if gc.in_progress {
            return false;
        }
        if gc.zygote_space_created {
            return true;
        }
        let mut objects = self.objects.write();
        let boundary = objects.heap.len() as u32;
        objects.zygote_boundary = boundary;
        objects.next_id = objects.next_id.max(boundary);
        gc.zygote_space_created = true;
        info!(objects = boundary, "created zygote space");
        true
    }

    pub fn has_zygote_space(&self) -> bool {
        self.gc.lock().zygote_space_created
    }

    pub fn is_in_zygote_space(&self, obj: ObjectRef) -> bool {
        (obj.slot() as u32) < self.objects.read().zygote_boundary
    }

    pub(in crate::runtime) fn teardown(&self) {
        let mut objects = self.objects.write();
        debug!(objects = objects.heap.len(), "tearing down heap");
        objects.heap.clear();
        objects.next_id = 0;
        objects.bytes_allocated = 0;
        objects.zygote_boundary = 0;
    }

    pub(in crate::runtime) fn dump_for_sig_quit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Heap: {} objects, {} bytes allocated, total {} bytes, limit {} bytes",
            self.object_count(),
            self.bytes_allocated(),
            self.total_memory(),
            self.max_memory()
        )?;
        writeln!(
            out,
            "Zygote space: {}",
            if self.has_zygote_space() { "yes" } else { "no" }
        )
    }
}

/// A running collection. Holds off root publication until dropped, and
/// finishing it wakes a thread blocked in `disable_collections`.
pub struct Collection<'h> {
    heap: &'h Heap,
    _publication: RwLockWriteGuard<'h, ()>,
}

impl Drop for Collection<'_> {
    fn drop(&mut self) {
        self.heap.gc.lock().in_progress = false;
        self.heap.gc_complete.notify_all();
    }
}

fn allocate_id_for_obj<T: ?Sized>(
    heap: &mut Vec<Option<Arc<T>>>,
    next_id: &mut u32,
    object: Arc<T>,
) -> u32 {
    let id = *next_id;
    if heap.len() <= id as usize {
        heap.resize_with(id as usize + 1, || None);
    }
    heap[id as usize] = Some(object);
    while (*next_id as usize) < heap.len() && heap[*next_id as usize].is_some() {
        *next_id += 1;
    }
    id + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::famous_classes::{OBJECT_CLASS, STRING_CLASS};
    use std::{thread, time::Duration};

    fn small_heap(limit: usize) -> Heap {
        Heap::new(&ParsedOptions {
            heap_initial_size: limit,
            heap_maximum_size: limit,
            ..ParsedOptions::default()
        })
    }

    #[test]
    fn test_allocate_reuses_swept_slots() {
        let heap = Heap::new(&ParsedOptions::default());
        let a = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        let b = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));

        let (objects, bytes) = heap.sweep(&HashSet::from([b]));
        assert_eq!((objects, bytes), (1, OBJECT_CLASS.instance_size));
        assert!(!heap.contains(a));
        assert!(heap.contains(b));

        let c = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_allocation_beyond_limit_fails() {
        let heap = small_heap(STRING_CLASS.instance_size + 8);
        heap.allocate(STRING_CLASS, 8, ObjectPayload::Plain).unwrap();
        let err = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { size: 8, .. }));
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_zygote_space_survives_sweep() {
        let heap = Heap::new(&ParsedOptions::default());
        let old = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        assert!(heap.pre_zygote_fork());
        let young = heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();

        assert!(heap.is_in_zygote_space(old));
        assert!(!heap.is_in_zygote_space(young));
        heap.sweep(&HashSet::new());
        assert!(heap.contains(old));
        assert!(!heap.contains(young));
    }

    #[test]
    fn test_pre_zygote_fork_refused_during_collection() {
        let heap = Heap::new(&ParsedOptions::default());
        let collection = heap.begin_collection().unwrap();
        assert!(heap.begin_collection().is_none());
        assert!(!heap.pre_zygote_fork());
        drop(collection);
        assert!(heap.pre_zygote_fork());
    }

    #[test]
    fn test_disable_collections_waits_then_refuses() {
        let heap = Arc::new(Heap::new(&ParsedOptions::default()));
        let collection_heap = Arc::clone(&heap);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let collector = thread::spawn(move || {
            let _collection = collection_heap.begin_collection().unwrap();
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
        });
        started_rx.recv().unwrap();
        heap.disable_collections();
        assert!(!heap.is_gc_in_progress());
        collector.join().unwrap();
        assert!(heap.begin_collection().is_none());
    }

    #[test]
    fn test_collection_waits_for_publication() {
        let heap = Arc::new(Heap::new(&ParsedOptions::default()));
        let publication = heap.publishing_root();
        let collector_heap = Arc::clone(&heap);
        let collector = thread::spawn(move || {
            let _collection = collector_heap.begin_collection().unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!collector.is_finished());
        // nested holds still succeed while the collector is queued
        drop(heap.publishing_root());
        drop(publication);
        collector.join().unwrap();
        assert!(!heap.is_gc_in_progress());
    }

    #[test]
    fn test_stats_recorded_only_when_enabled() {
        let heap = Heap::new(&ParsedOptions::default());
        heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        assert_eq!(heap.stats().get(StatKinds::ALLOCATED_OBJECTS), 0);

        heap.set_stats_enabled(true);
        heap.allocate(OBJECT_CLASS, 0, ObjectPayload::Plain).unwrap();
        assert_eq!(heap.stats().get(StatKinds::ALLOCATED_OBJECTS), 1);
        assert_eq!(
            heap.stats().get(StatKinds::ALLOCATED_BYTES),
            OBJECT_CLASS.instance_size as u64
        );
    }
}
