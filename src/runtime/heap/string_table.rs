use crate::runtime::{
    ObjectRef, RuntimeResult,
    famous_classes::STRING_CLASS,
    heap::{Heap, ObjectPayload},
    roots::{RootSource, RootTable, RootVisitor, VisitFlags},
};
use cesu8_str::java as cesu8_java;
use parking_lot::Mutex;
use std::{borrow::Cow, collections::HashMap, fmt, sync::Arc};
use tracing::debug;

/// Interned strings keyed by their modified UTF-8 encoding. Every interned
/// string is a root.
#[derive(Debug, Default)]
pub struct InternTable {
    map: Mutex<HashMap<Arc<[u8]>, ObjectRef>>,
    roots: RootTable,
}

impl InternTable {
    pub fn new() -> InternTable {
        InternTable::default()
    }

    pub fn intern(&self, heap: &Heap, string: &str) -> RuntimeResult<ObjectRef> {
        let bytes = to_modified_utf8(string);
        let _publication = heap.publishing_root();
        let mut map = self.map.lock();
        if let Some(&string_ref) = map.get(bytes.as_ref()) {
            return Ok(string_ref);
        }
        let bytes: Arc<[u8]> = Arc::from(bytes.as_ref());
        let string_ref = heap.allocate(STRING_CLASS, bytes.len(), ObjectPayload::String(Arc::clone(&bytes)))?;
        map.insert(bytes, string_ref);
        self.roots.add(string_ref);
        Ok(string_ref)
    }

    pub fn lookup(&self, string: &str) -> Option<ObjectRef> {
        self.map.lock().get(to_modified_utf8(string).as_ref()).copied()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_dirty(&self, string_ref: ObjectRef) -> bool {
        self.roots.mark_dirty(string_ref)
    }

    pub(in crate::runtime) fn teardown(&self) {
        debug!(strings = self.len(), "tearing down intern table");
        self.map.lock().clear();
        self.roots.clear();
    }

    pub(in crate::runtime) fn dump_for_sig_quit(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Intern table: {} strings", self.len())
    }
}

impl RootSource for InternTable {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.roots.visit(visitor, flags);
    }
}

fn to_modified_utf8(string: &str) -> Cow<'_, [u8]> {
    match cesu8_java::from_utf8(string) {
        Cow::Borrowed(b) => Cow::Borrowed(b.as_bytes()),
        Cow::Owned(o) => Cow::Owned(o.into_bytes()),
    }
}
