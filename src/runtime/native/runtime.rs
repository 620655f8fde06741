use crate::runtime::native::{NativeEnv, NativeRegistry, NativeResult, NativeValue};
use std::thread;

// private static native void nativeExit(int code);
fn native_exit(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    env.runtime.call_exit_hook(env.arg(0)?.get_int()?);
    Ok(None)
}

// public native void gc();
fn gc(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    env.runtime.collect_garbage();
    Ok(None)
}

// public native long freeMemory();
fn free_memory(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    Ok(Some(NativeValue::Long(env.runtime.heap().free_memory() as i64)))
}

// public native long totalMemory();
fn total_memory(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    Ok(Some(NativeValue::Long(env.runtime.heap().total_memory() as i64)))
}

// public native long maxMemory();
fn max_memory(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    Ok(Some(NativeValue::Long(env.runtime.heap().max_memory() as i64)))
}

// public native int availableProcessors();
fn available_processors(_env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    let processors = thread::available_parallelism().map_or(1, |n| n.get());
    Ok(Some(NativeValue::Int(processors as i32)))
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register("java/lang/Runtime", "nativeExit", "(I)V", native_exit);
    registry.register("java/lang/Runtime", "gc", "()V", gc);
    registry.register("java/lang/Runtime", "freeMemory", "()J", free_memory);
    registry.register("java/lang/Runtime", "totalMemory", "()J", total_memory);
    registry.register("java/lang/Runtime", "maxMemory", "()J", max_memory);
    registry.register("java/lang/Runtime", "availableProcessors", "()I", available_processors);
}
