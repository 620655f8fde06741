use crate::runtime::native::{NativeEnv, NativeRegistry, NativeResult, NativeValue};

fn interned(env: &NativeEnv<'_>, string: &str) -> NativeResult<Option<NativeValue>> {
    let string_ref = env.runtime.intern_string(string)?;
    Ok(Some(NativeValue::Reference(Some(string_ref))))
}

// public native String vmVersion();
fn vm_version(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    interned(&env, env.runtime.version())
}

// public native String bootClassPath();
fn boot_class_path(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    interned(&env, env.runtime.boot_class_path_string())
}

// public native String classPath();
fn class_path(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    interned(&env, env.runtime.class_path_string())
}

// number of -D properties handed to the runtime
fn properties(env: NativeEnv<'_>) -> NativeResult<Option<NativeValue>> {
    Ok(Some(NativeValue::Int(env.runtime.properties().len() as i32)))
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register("dalvik/system/VMRuntime", "vmVersion", "()Ljava/lang/String;", vm_version);
    registry.register(
        "dalvik/system/VMRuntime",
        "bootClassPath",
        "()Ljava/lang/String;",
        boot_class_path,
    );
    registry.register("dalvik/system/VMRuntime", "classPath", "()Ljava/lang/String;", class_path);
    registry.register("dalvik/system/VMRuntime", "properties", "()I", properties);
}
