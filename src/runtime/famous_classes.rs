/// Class of an object the runtime allocates on its own behalf, with the
/// fixed instance size charged against the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FamousClass {
    pub(crate) name: &'static str,
    pub(crate) instance_size: usize,
}

pub(crate) const STRING_CLASS: FamousClass = FamousClass {
    name: "java/lang/String",
    instance_size: 24,
};

pub(crate) const CLASS_CLASS: FamousClass = FamousClass {
    name: "java/lang/Class",
    instance_size: 128,
};

pub(crate) const ABSTRACT_METHOD_CLASS: FamousClass = FamousClass {
    name: "java/lang/reflect/AbstractMethod",
    instance_size: 72,
};

pub(crate) const OUT_OF_MEMORY_ERROR_CLASS: FamousClass = FamousClass {
    name: "java/lang/OutOfMemoryError",
    instance_size: 32,
};

pub(crate) const THREAD_CLASS: FamousClass = FamousClass {
    name: "java/lang/Thread",
    instance_size: 64,
};

pub(crate) const OBJECT_CLASS: FamousClass = FamousClass {
    name: "java/lang/Object",
    instance_size: 8,
};
