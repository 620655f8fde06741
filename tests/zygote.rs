use jrt::{CalleeSaveType, InstructionSet, Runtime, RuntimeOption};
use std::{sync::Arc, thread};

fn zygote() -> Arc<Runtime> {
    let runtime = Runtime::new(&[RuntimeOption::from("-Xzygote")], false).unwrap();
    runtime.start().unwrap();
    runtime
}

#[test]
fn test_fork_keeps_registry_and_only_forking_thread() {
    let runtime = zygote();
    assert!(runtime.is_zygote());
    assert!(!runtime.has_daemon_threads());

    thread::spawn({
        let runtime = Arc::clone(&runtime);
        // exits without detaching, as threads do not survive a fork
        move || {
            runtime.attach_current_thread("HeapTrimmerDaemon", true, true).unwrap();
        }
    })
    .join()
    .unwrap();
    assert_eq!(runtime.thread_list().len(), 2);

    let parent: Vec<_> = CalleeSaveType::ALL
        .into_iter()
        .map(|ty| runtime.callee_save_method(ty))
        .collect();
    let parent_resolution = runtime.resolution_method();
    let preloaded = runtime.alloc_object(0).unwrap();

    assert!(runtime.pre_zygote_fork());
    assert!(runtime.heap().has_zygote_space());
    runtime.did_fork_from_zygote().unwrap();

    assert!(!runtime.is_zygote());
    assert!(runtime.has_daemon_threads());
    assert_eq!(runtime.thread_list().thread_names(), vec!["main"]);
    for (ty, before) in CalleeSaveType::ALL.into_iter().zip(&parent) {
        let after = runtime.callee_save_method(ty);
        assert!(Arc::ptr_eq(before, &after));
        assert_eq!(after.frame_info(), before.frame_info());
    }
    assert!(Arc::ptr_eq(&parent_resolution, &runtime.resolution_method()));

    // objects allocated before the fork live in the zygote space
    assert!(runtime.heap().is_in_zygote_space(preloaded));
    let child_garbage = runtime.alloc_object(0).unwrap();
    assert!(!runtime.heap().is_in_zygote_space(child_garbage));
    assert!(runtime.collect_garbage());
    assert!(runtime.heap().contains(preloaded));
    assert!(!runtime.heap().contains(child_garbage));

    runtime.shutdown();
}

#[test]
fn test_pre_fork_refused_during_collection_or_birth() {
    let runtime = zygote();

    let collection = runtime.heap().begin_collection().unwrap();
    assert!(!runtime.pre_zygote_fork());
    drop(collection);

    runtime.start_thread_birth().unwrap();
    assert!(!runtime.pre_zygote_fork());
    runtime.end_thread_birth();

    assert!(!runtime.heap().has_zygote_space());
    assert!(runtime.pre_zygote_fork());
}

#[test]
fn test_callee_save_synthesis_is_idempotent_per_instruction_set() {
    let runtime = Runtime::new(&[], false).unwrap();
    let arm = runtime.create_ref_only_callee_save_method(InstructionSet::Arm).unwrap();
    assert!(Arc::ptr_eq(
        &arm,
        &runtime.create_ref_only_callee_save_method(InstructionSet::Arm).unwrap()
    ));
    let mips = runtime.create_ref_only_callee_save_method(InstructionSet::Mips).unwrap();
    assert!(!Arc::ptr_eq(&arm, &mips));
    assert_ne!(arm.object(), mips.object());
    assert_eq!(arm.frame_info().unwrap().frame_size, 32);
    assert_eq!(mips.frame_info().unwrap().frame_size, 64);

    let args = runtime
        .create_ref_and_args_callee_save_method(InstructionSet::Arm)
        .unwrap();
    assert_eq!(args.frame_info().unwrap().frame_size, 48);
    assert!(runtime
        .method_registry()
        .has_callee_save_method(CalleeSaveType::RefsAndArgs, InstructionSet::Arm));
    assert!(!runtime
        .method_registry()
        .has_callee_save_method(CalleeSaveType::SaveAll, InstructionSet::Mips));
}

#[test]
fn test_fork_from_unattached_thread_attaches_it() {
    let runtime = zygote();
    thread::Builder::new()
        .name("forker".to_string())
        .spawn({
            let runtime = Arc::clone(&runtime);
            move || {
                assert!(runtime.current_thread().is_none());
                assert!(runtime.pre_zygote_fork());
                runtime.did_fork_from_zygote().unwrap();
                let current = runtime.current_thread().unwrap();
                assert_eq!(current.name(), "forker");
                assert!(!current.is_daemon());
                assert_eq!(runtime.thread_list().thread_names(), vec!["forker"]);
                runtime.detach_current_thread().unwrap();
            }
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(runtime.number_of_threads_being_born(), 0);
    runtime.shutdown();
}
