use crate::runtime::native::{NativeEnv, NativeRegistry, NativeResult, NativeValue};
use std::{
    sync::LazyLock,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

// public static native int identityHashCode(Object x);
fn identity_hash_code(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    let hash = env.arg(0)?.get_ref()?.map_or(0, |obj| obj.id() as i32);
    Ok(Some(NativeValue::Int(hash)))
}

// public static native long currentTimeMillis();
fn current_time_millis(_env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok(Some(NativeValue::Long(millis)))
}

// public static native long nanoTime();
fn nano_time(_env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    static INSTANT_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);
    let nanos = INSTANT_BASE.elapsed().as_nanos() as i64;
    Ok(Some(NativeValue::Long(nanos)))
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        "java/lang/System",
        "identityHashCode",
        "(Ljava/lang/Object;)I",
        identity_hash_code,
    );
    registry.register("java/lang/System", "currentTimeMillis", "()J", current_time_millis);
    registry.register("java/lang/System", "nanoTime", "()J", nano_time);
}
