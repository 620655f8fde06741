use crate::runtime::{
    ObjectRef, RuntimeResult,
    famous_classes::CLASS_CLASS,
    heap::{Heap, ObjectPayload},
    options::ParsedOptions,
    roots::{RootSource, RootTable, RootVisitor, VisitFlags},
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc, time::Instant};
use tracing::{debug, warn};

pub mod archive;

pub use archive::ClassPathArchive;

const CLASS_FILE_MAGIC: [u8; 4] = [0xca, 0xfe, 0xba, 0xbe];

/// Defines classes from the boot class path and keeps their class objects
/// alive as roots.
pub struct ClassLinker {
    boot_class_path: Vec<Arc<ClassPathArchive>>,
    class_registry: DashMap<String, Arc<OnceCell<ObjectRef>>>,
    class_roots: RootTable,
}

impl ClassLinker {
    pub fn new(boot_class_path: Vec<Arc<ClassPathArchive>>) -> ClassLinker {
        ClassLinker {
            boot_class_path,
            class_registry: DashMap::new(),
            class_roots: RootTable::new(),
        }
    }

    /// Uses the pre-opened archives if given, otherwise opens each entry of
    /// the colon separated boot class path under the host prefix. Entries
    /// that fail to open are skipped.
    pub fn from_options(options: &ParsedOptions) -> ClassLinker {
        if let Some(archives) = &options.boot_class_path {
            return ClassLinker::new(archives.clone());
        }
        let boot_class_path = options
            .boot_class_path_string
            .split(':')
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let path = format!("{}{entry}", options.host_prefix);
                match ClassPathArchive::open(&path) {
                    Ok(archive) => Some(Arc::new(archive)),
                    Err(err) => {
                        warn!(%path, %err, "failed to open boot class path entry");
                        None
                    }
                }
            })
            .collect();
        ClassLinker::new(boot_class_path)
    }

    pub fn boot_class_path(&self) -> &[Arc<ClassPathArchive>] {
        &self.boot_class_path
    }

    pub fn find_archive(&self, class_name: &str) -> Option<&Arc<ClassPathArchive>> {
        self.boot_class_path
            .iter()
            .find(|archive| archive.contains_class(class_name))
    }

    pub fn lookup_class(&self, class_name: &str) -> Option<ObjectRef> {
        self.class_registry
            .get(class_name)
            .and_then(|cell| cell.get().copied())
    }

    /// Returns the class object for `class_name`, defining it from the boot
    /// class path on first use. `Ok(None)` if no archive provides it.
    pub fn find_class(&self, heap: &Heap, class_name: &str) -> RuntimeResult<Option<ObjectRef>> {
        if let Some(class) = self.lookup_class(class_name) {
            return Ok(Some(class));
        }
        let Some(archive) = self.find_archive(class_name) else {
            return Ok(None);
        };
        match archive.read_class(class_name)? {
            Some(bytes) if bytes.starts_with(&CLASS_FILE_MAGIC) => {
                self.define_class(heap, class_name).map(Some)
            }
            Some(_) => {
                warn!(class_name, location = ?archive.location(), "bad class file magic");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Allocates the class object for `class_name` unless one exists.
    pub fn define_class(&self, heap: &Heap, class_name: &str) -> RuntimeResult<ObjectRef> {
        let class_cell = Arc::clone(
            self.class_registry
                .entry(class_name.to_string())
                .or_default()
                .value(),
        );
        let _publication = heap.publishing_root();
        let class = class_cell.get_or_try_init(|| {
            let start = Instant::now();
            let class = heap.allocate(CLASS_CLASS, 0, ObjectPayload::Plain)?;
            self.class_roots.add(class);
            if heap.has_stats_enabled() {
                heap.stats().record_class_init(start.elapsed());
            }
            debug!(class_name, %class, "defined class");
            RuntimeResult::Ok(class)
        })?;
        Ok(*class)
    }

    pub fn class_count(&self) -> usize {
        self.class_roots.len()
    }

    /// Flags a class root as modified for the next dirty-only visit.
    pub fn mark_dirty(&self, class: ObjectRef) -> bool {
        self.class_roots.mark_dirty(class)
    }

    pub(in crate::runtime) fn teardown(&self) {
        debug!(classes = self.class_count(), "tearing down class linker");
        self.class_registry.clear();
        self.class_roots.clear();
    }

    pub(in crate::runtime) fn dump_for_sig_quit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Loaded classes: {} from {} boot class path archives",
            self.class_count(),
            self.boot_class_path.len()
        )
    }
}

impl RootSource for ClassLinker {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.class_roots.visit(visitor, flags);
    }
}

impl fmt::Debug for ClassLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassLinker")
            .field("boot_class_path", &self.boot_class_path)
            .field("classes", &self.class_count())
            .finish()
    }
}

/// Class paths registered per class loader for ahead-of-time compilation.
#[derive(Debug, Default)]
pub struct CompileTimeClassPaths {
    paths: RwLock<HashMap<ObjectRef, Vec<Arc<ClassPathArchive>>>>,
}

impl CompileTimeClassPaths {
    pub fn insert(&self, class_loader: ObjectRef, class_path: Vec<Arc<ClassPathArchive>>) {
        let mut paths = self.paths.write();
        assert!(
            !paths.contains_key(&class_loader),
            "compile-time class path already set for class loader {class_loader}"
        );
        paths.insert(class_loader, class_path);
    }

    pub fn get(&self, class_loader: ObjectRef) -> Option<Vec<Arc<ClassPathArchive>>> {
        self.paths.read().get(&class_loader).cloned()
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootSource for CompileTimeClassPaths {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, _flags: VisitFlags) {
        let mut class_loaders: Vec<ObjectRef> = self.paths.read().keys().copied().collect();
        class_loaders.sort();
        for class_loader in class_loaders {
            visitor(class_loader);
        }
    }
}
