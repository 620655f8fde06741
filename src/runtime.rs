mod class_linker;
mod error;
mod famous_classes;
mod heap;
mod hooks;
mod lifecycle;
mod method_registry;
mod monitor;
mod native;
mod options;
mod roots;
mod signal_catcher;
mod stats;
mod thread_list;
mod zygote;

use crate::runtime::{
    famous_classes::{OBJECT_CLASS, OUT_OF_MEMORY_ERROR_CLASS, THREAD_CLASS},
    zygote::ZygoteState,
};
use parking_lot::RwLock;
use std::{
    collections::HashSet,
    fmt,
    fs::OpenOptions,
    io::{self, Write},
    ptr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};
use tracing::{debug, error, info, warn};

pub use class_linker::{ClassLinker, ClassPathArchive, CompileTimeClassPaths};
pub use error::{ConfigError, RuntimeError, RuntimeResult};
pub use heap::{Collection, Heap, HeapObject, ObjectPayload, ObjectRef, string_table::InternTable};
pub use hooks::{DefaultHooks, RuntimeHooks};
pub use lifecycle::{LifecycleController, LifecycleState, ThreadBirth};
pub use method_registry::{
    CalleeSaveType, FrameInfo, InstructionSet, MethodRegistry, RuntimeMethod, RuntimeMethodKind,
};
pub use monitor::{Monitor, MonitorList};
pub use native::{NativeEnv, NativeError, NativeFunction, NativeRegistry, NativeResult, NativeValue};
pub use options::{LogVerbosity, ParsedOptions, RuntimeOption, parse_memory_option};
pub use roots::{
    RootCategory, RootCell, RootDispatcher, RootSource, RootTable, RootVisitor, VisitFlags,
};
pub use stats::{RuntimeStats, StatKinds};
pub use thread_list::{Thread, ThreadList};

static INSTANCE: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);

const VERSION: &str = "2.0.0";

const OUT_OF_MEMORY_ERROR_MESSAGE: &str =
    "OutOfMemoryError thrown while trying to throw OutOfMemoryError; no stack available";

/// Owns every runtime subsystem and sequences startup, thread attachment,
/// root visitation, zygote forking and shutdown.
pub struct Runtime {
    options: ParsedOptions,
    hooks: Arc<dyn RuntimeHooks>,
    lifecycle: LifecycleController,
    published: AtomicBool,
    started: AtomicBool,
    finished_starting: AtomicBool,
    small_mode: AtomicBool,
    sea_ir_mode: AtomicBool,
    intern_table: Arc<InternTable>,
    heap: Arc<Heap>,
    class_linker: Arc<ClassLinker>,
    monitor_list: Arc<MonitorList>,
    thread_list: Arc<ThreadList>,
    method_registry: Arc<MethodRegistry>,
    pre_allocated_out_of_memory_error: Arc<RootCell>,
    compile_time_class_paths: Arc<CompileTimeClassPaths>,
    use_compile_time_class_path: AtomicBool,
    roots: RootDispatcher,
    natives: NativeRegistry,
    zygote: ZygoteState,
    self_ref: Weak<Runtime>,
}

impl Runtime {
    /// Creates the process-wide runtime and publishes it as
    /// [`Runtime::current`].
    pub fn create(options: &[RuntimeOption], ignore_unrecognized: bool) -> RuntimeResult<Arc<Runtime>> {
        let mut instance = INSTANCE.write();
        if instance.is_some() {
            return Err(RuntimeError::AlreadyCreated);
        }
        let runtime = Runtime::new(options, ignore_unrecognized)?;
        runtime.published.store(true, Ordering::Release);
        *instance = Some(Arc::clone(&runtime));
        info!("runtime created");
        Ok(runtime)
    }

    /// Builds and initializes a runtime without publishing it.
    pub fn new(options: &[RuntimeOption], ignore_unrecognized: bool) -> RuntimeResult<Arc<Runtime>> {
        let options = ParsedOptions::parse(options, ignore_unrecognized)?;
        Runtime::init(options)
    }

    pub fn current() -> Option<Arc<Runtime>> {
        INSTANCE.read().clone()
    }

    fn init(options: ParsedOptions) -> RuntimeResult<Arc<Runtime>> {
        debug!("Runtime::init entering");
        let intern_table = Arc::new(InternTable::new());
        let heap = Arc::new(Heap::new(&options));
        let class_linker = Arc::new(ClassLinker::from_options(&options));
        let monitor_list = Arc::new(MonitorList::new());
        let thread_list = Arc::new(ThreadList::new());
        let method_registry = Arc::new(MethodRegistry::new());
        let pre_allocated_out_of_memory_error = Arc::new(RootCell::default());
        let compile_time_class_paths = Arc::new(CompileTimeClassPaths::default());

        let roots = RootDispatcher::new(vec![
            (RootCategory::METHODS, Arc::clone(&method_registry) as Arc<dyn RootSource>),
            (
                RootCategory::OUT_OF_MEMORY_ERROR,
                Arc::clone(&pre_allocated_out_of_memory_error) as Arc<dyn RootSource>,
            ),
            (RootCategory::INTERN_TABLE, Arc::clone(&intern_table) as Arc<dyn RootSource>),
            (RootCategory::CLASS_LINKER, Arc::clone(&class_linker) as Arc<dyn RootSource>),
            (RootCategory::MONITORS, Arc::clone(&monitor_list) as Arc<dyn RootSource>),
            (
                RootCategory::COMPILE_TIME_CLASS_PATH,
                Arc::clone(&compile_time_class_paths) as Arc<dyn RootSource>,
            ),
            (RootCategory::THREADS, Arc::clone(&thread_list) as Arc<dyn RootSource>),
        ]);

        let hooks = options
            .hooks
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultHooks));
        let runtime = Arc::new_cyclic(|self_ref| Runtime {
            hooks,
            lifecycle: LifecycleController::new(),
            published: AtomicBool::new(false),
            started: AtomicBool::new(false),
            finished_starting: AtomicBool::new(false),
            small_mode: AtomicBool::new(options.small_mode),
            sea_ir_mode: AtomicBool::new(options.sea_ir_mode),
            intern_table,
            heap,
            class_linker,
            monitor_list,
            thread_list,
            method_registry,
            pre_allocated_out_of_memory_error,
            compile_time_class_paths,
            use_compile_time_class_path: AtomicBool::new(false),
            roots,
            natives: NativeRegistry::default(),
            zygote: ZygoteState::new(options.is_zygote),
            self_ref: self_ref.clone(),
            options,
        });

        runtime.create_runtime_methods()?;
        {
            let _publication = runtime.heap.publishing_root();
            let oome = runtime.heap.allocate(
                OUT_OF_MEMORY_ERROR_CLASS,
                0,
                ObjectPayload::Throwable {
                    message: OUT_OF_MEMORY_ERROR_MESSAGE.to_string(),
                },
            )?;
            runtime.pre_allocated_out_of_memory_error.set(oome);
        }
        native::register_natives(&runtime.natives);
        runtime.attach_current_thread("main", false, false)?;

        runtime
            .lifecycle
            .transition(LifecycleState::Uninitialized, LifecycleState::Initialized);
        debug!("Runtime::init exiting");
        Ok(runtime)
    }

    fn create_runtime_methods(&self) -> RuntimeResult<()> {
        let _publication = self.heap.publishing_root();
        let resolution_method = self.method_registry.create_resolution_method(&self.heap)?;
        self.method_registry.set_resolution_method(resolution_method);
        for ty in CalleeSaveType::ALL {
            self.method_registry
                .create_callee_save_method(&self.heap, InstructionSet::RUNTIME, ty)?;
        }
        Ok(())
    }

    pub fn start(&self) -> RuntimeResult<()> {
        debug!("Runtime::start entering");
        self.lifecycle
            .transition(LifecycleState::Initialized, LifecycleState::Started);
        self.started.store(true, Ordering::Release);

        if self.is_zygote() {
            if !self.init_zygote() {
                return Err(RuntimeError::ZygoteInit);
            }
        } else {
            self.start_daemon_threads()?;
        }

        self.finished_starting.store(true, Ordering::Release);
        if self.options.method_trace {
            info!(
                file = %self.options.method_trace_file,
                size = self.options.method_trace_file_size,
                "method tracing requested"
            );
        }
        info!("runtime started");
        Ok(())
    }

    /// Waits for threads being born, then tears every subsystem down in
    /// reverse construction order. Later calls return immediately.
    pub fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        info!("runtime shutting down");
        self.heap.disable_collections();
        self.stop_daemon_threads();

        self.thread_list.teardown();
        self.monitor_list.teardown();
        self.class_linker.teardown();
        self.heap.teardown();
        self.intern_table.teardown();
        self.pre_allocated_out_of_memory_error.clear();
        self.lifecycle.finish_shutdown();

        if self.published.swap(false, Ordering::AcqRel) {
            let previous = {
                let mut instance = INSTANCE.write();
                match &*instance {
                    Some(current) if ptr::eq(Arc::as_ptr(current), self) => instance.take(),
                    _ => None,
                }
            };
            drop(previous);
        }
        info!("runtime shut down");
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_finished_starting(&self) -> bool {
        self.finished_starting.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    pub fn number_of_threads_being_born(&self) -> usize {
        self.lifecycle.number_of_threads_being_born()
    }

    /// Fails without touching the count once shutdown has begun.
    pub fn start_thread_birth(&self) -> RuntimeResult<()> {
        if self.lifecycle.start_thread_birth() {
            Ok(())
        } else {
            let name = thread::current().name().unwrap_or("<unnamed>").to_string();
            Err(RuntimeError::ShuttingDown(name))
        }
    }

    pub fn end_thread_birth(&self) {
        self.lifecycle.end_thread_birth();
    }

    pub fn attach_current_thread(
        &self,
        name: &str,
        as_daemon: bool,
        create_peer: bool,
    ) -> RuntimeResult<Arc<Thread>> {
        let Some(_birth) = self.lifecycle.thread_birth() else {
            warn!(name, "thread attaching while runtime is shutting down");
            return Err(RuntimeError::ShuttingDown(name.to_string()));
        };
        let _publication = self.heap.publishing_root();
        let peer = if create_peer {
            Some(self.heap.allocate(THREAD_CLASS, 0, ObjectPayload::Plain)?)
        } else {
            None
        };
        self.thread_list.register(name, as_daemon, peer)
    }

    pub fn detach_current_thread(&self) -> RuntimeResult<()> {
        let thread = self.thread_list.unregister().ok_or(RuntimeError::NotAttached)?;
        if thread.stack_depth() > 0 {
            warn!(
                name = thread.name(),
                depth = thread.stack_depth(),
                "detaching thread with live stack roots"
            );
        }
        Ok(())
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.thread_list.current()
    }

    pub fn visit_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.roots.visit_roots(visitor, flags);
    }

    pub fn visit_concurrent_roots(&self, visitor: &mut RootVisitor<'_>, flags: VisitFlags) {
        self.roots.visit_concurrent_roots(visitor, flags);
    }

    pub fn visit_non_thread_roots(&self, visitor: &mut RootVisitor<'_>) {
        self.roots.visit_non_thread_roots(visitor);
    }

    /// Callers must have paused every mutator thread.
    pub fn visit_non_concurrent_roots(&self, visitor: &mut RootVisitor<'_>) {
        self.roots.visit_non_concurrent_roots(visitor);
    }

    /// Runs a root-visitation pass and frees every unreachable object.
    /// Returns false if another collection is already running.
    pub fn collect_garbage(&self) -> bool {
        let Some(_collection) = self.heap.begin_collection() else {
            return false;
        };
        if self.has_stats_enabled() {
            if let Some(thread) = self.current_thread() {
                thread.stats().record_gc();
            }
        }
        let mut marked = HashSet::new();
        self.visit_roots(
            &mut |root| {
                marked.insert(root);
            },
            VisitFlags::default(),
        );
        let (objects, bytes) = self.heap.sweep(&marked);
        debug!(roots = marked.len(), objects, bytes, "collection freed");
        true
    }

    /// Allocates a plain object on behalf of the calling thread.
    pub fn alloc_object(&self, extra_bytes: usize) -> RuntimeResult<ObjectRef> {
        let object = self.heap.allocate(OBJECT_CLASS, extra_bytes, ObjectPayload::Plain)?;
        if self.has_stats_enabled() {
            if let Some(thread) = self.current_thread() {
                thread
                    .stats()
                    .record_allocation(OBJECT_CLASS.instance_size + extra_bytes);
            }
        }
        Ok(object)
    }

    pub fn intern_string(&self, string: &str) -> RuntimeResult<ObjectRef> {
        self.intern_table.intern(&self.heap, string)
    }

    pub fn find_class(&self, class_name: &str) -> RuntimeResult<Option<ObjectRef>> {
        self.class_linker.find_class(&self.heap, class_name)
    }

    pub fn resolution_method(&self) -> Arc<RuntimeMethod> {
        self.method_registry.resolution_method()
    }

    pub fn has_resolution_method(&self) -> bool {
        self.method_registry.has_resolution_method()
    }

    pub fn set_resolution_method(&self, method: Arc<RuntimeMethod>) {
        self.method_registry.set_resolution_method(method);
    }

    pub fn create_resolution_method(&self) -> RuntimeResult<Arc<RuntimeMethod>> {
        self.method_registry.create_resolution_method(&self.heap)
    }

    /// Reads the slot for this runtime's instruction set.
    pub fn callee_save_method(&self, ty: CalleeSaveType) -> Arc<RuntimeMethod> {
        self.method_registry
            .callee_save_method(ty, InstructionSet::RUNTIME)
    }

    pub fn has_callee_save_method(&self, ty: CalleeSaveType) -> bool {
        self.method_registry
            .has_callee_save_method(ty, InstructionSet::RUNTIME)
    }

    pub fn create_callee_save_method(
        &self,
        instruction_set: InstructionSet,
        ty: CalleeSaveType,
    ) -> RuntimeResult<Arc<RuntimeMethod>> {
        self.method_registry
            .create_callee_save_method(&self.heap, instruction_set, ty)
    }

    pub fn create_ref_only_callee_save_method(
        &self,
        instruction_set: InstructionSet,
    ) -> RuntimeResult<Arc<RuntimeMethod>> {
        self.create_callee_save_method(instruction_set, CalleeSaveType::RefsOnly)
    }

    pub fn create_ref_and_args_callee_save_method(
        &self,
        instruction_set: InstructionSet,
    ) -> RuntimeResult<Arc<RuntimeMethod>> {
        self.create_callee_save_method(instruction_set, CalleeSaveType::RefsAndArgs)
    }

    pub fn use_compile_time_class_path(&self) -> bool {
        self.use_compile_time_class_path.load(Ordering::Acquire)
    }

    /// The class path compiled code for `class_loader` was built against.
    /// `None` means the boot class loader.
    pub fn compile_time_class_path(&self, class_loader: Option<ObjectRef>) -> Vec<Arc<ClassPathArchive>> {
        let Some(class_loader) = class_loader else {
            return self.class_linker.boot_class_path().to_vec();
        };
        assert!(
            self.use_compile_time_class_path(),
            "no compile-time class path has been set"
        );
        self.compile_time_class_paths
            .get(class_loader)
            .unwrap_or_else(|| panic!("no compile-time class path for class loader {class_loader}"))
    }

    pub fn set_compile_time_class_path(&self, class_loader: ObjectRef, class_path: Vec<Arc<ClassPathArchive>>) {
        assert!(!self.is_started(), "compile-time class path set after start");
        self.use_compile_time_class_path.store(true, Ordering::Release);
        self.compile_time_class_paths.insert(class_loader, class_path);
    }

    pub fn stat(&self, kind: StatKinds) -> u64 {
        let global = kind.global_part();
        if !global.is_empty() {
            return self.heap.stats().get(global);
        }
        self.current_thread()
            .map_or(0, |thread| thread.stats().get(kind.thread_part()))
    }

    pub fn reset_stats(&self, kinds: StatKinds) {
        self.heap.stats().clear(kinds.global_part());
        if let Some(thread) = self.current_thread() {
            thread.stats().clear(kinds.thread_part());
        }
    }

    /// Enabling clears every counter first.
    pub fn set_stats_enabled(&self, enabled: bool) {
        if enabled && !self.has_stats_enabled() {
            self.reset_stats(StatKinds::all());
        }
        self.heap.set_stats_enabled(enabled);
    }

    pub fn has_stats_enabled(&self) -> bool {
        self.heap.has_stats_enabled()
    }

    pub fn is_sensitive_thread(&self) -> bool {
        self.hooks.is_sensitive_thread()
    }

    pub fn vfprintf(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.hooks.vfprintf(args)
    }

    pub fn call_exit_hook(&self, status: i32) {
        info!(status, "calling exit hook");
        self.hooks.exit(status);
        warn!(status, "exit hook returned without exiting");
    }

    /// Logs `message`, runs the current runtime's abort hook, then aborts.
    pub fn abort(message: &str) -> ! {
        error!(message, "runtime aborting");
        let current = INSTANCE.try_read().and_then(|instance| instance.clone());
        if let Some(runtime) = current {
            runtime.hooks.abort();
        }
        std::process::abort()
    }

    pub fn host_prefix(&self) -> &str {
        &self.options.host_prefix
    }

    pub fn to_host_path(&self, target_path: &str) -> String {
        format!("{}{target_path}", self.options.host_prefix)
    }

    pub fn to_target_path(&self, host_path: &str) -> String {
        host_path
            .strip_prefix(self.options.host_prefix.as_str())
            .unwrap_or(host_path)
            .to_string()
    }

    pub fn invoke_native(
        &self,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        args: Vec<NativeValue>,
    ) -> NativeResult<Option<NativeValue>> {
        let function = self
            .natives
            .lookup(class_name, method_name, descriptor)
            .ok_or_else(|| NativeError::Unregistered {
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
                descriptor: descriptor.to_string(),
            })?;
        native::check_arguments(descriptor, &args)?;
        function(NativeEnv { args, runtime: self })
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn dump_for_sig_quit(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let out: &mut dyn fmt::Write = out;
        writeln!(
            out,
            "Runtime {VERSION} ({:?}, {:?})",
            self.state(),
            InstructionSet::RUNTIME
        )?;
        self.class_linker.dump_for_sig_quit(out)?;
        self.intern_table.dump_for_sig_quit(out)?;
        self.heap.dump_for_sig_quit(out)?;
        self.monitor_list.dump_for_sig_quit(out)?;
        self.thread_list.dump_for_sig_quit(out)
    }

    pub(in crate::runtime) fn handle_sig_quit(&self) {
        let mut dump = String::new();
        if self.dump_for_sig_quit(&mut dump).is_err() {
            return;
        }
        let stack_trace_file = &self.options.stack_trace_file;
        if stack_trace_file.is_empty() {
            if let Err(err) = self.vfprintf(format_args!("{dump}")) {
                warn!(%err, "failed to write dump");
            }
            return;
        }
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(stack_trace_file)
            .and_then(|mut file| file.write_all(dump.as_bytes()));
        match written {
            Ok(()) => info!(file = %stack_trace_file, "wrote stack traces"),
            Err(err) => warn!(file = %stack_trace_file, %err, "failed to write stack traces"),
        }
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn options(&self) -> &ParsedOptions {
        &self.options
    }

    pub fn is_compiler(&self) -> bool {
        self.options.is_compiler
    }

    pub fn is_concurrent_gc_enabled(&self) -> bool {
        self.options.is_concurrent_gc_enabled
    }

    pub fn is_small_mode(&self) -> bool {
        self.small_mode.load(Ordering::Relaxed)
    }

    pub fn set_small_mode(&self, small_mode: bool) {
        self.small_mode.store(small_mode, Ordering::Relaxed);
    }

    pub fn small_mode_method_threshold(&self) -> usize {
        self.options.small_mode_method_threshold
    }

    pub fn small_mode_method_dex_size_limit(&self) -> usize {
        self.options.small_mode_method_dex_size_limit
    }

    pub fn is_sea_ir_mode(&self) -> bool {
        self.sea_ir_mode.load(Ordering::Relaxed)
    }

    pub fn set_sea_ir_mode(&self, sea_ir_mode: bool) {
        self.sea_ir_mode.store(sea_ir_mode, Ordering::Relaxed);
    }

    pub fn boot_class_path_string(&self) -> &str {
        &self.options.boot_class_path_string
    }

    pub fn class_path_string(&self) -> &str {
        &self.options.class_path_string
    }

    pub fn properties(&self) -> &[String] {
        &self.options.properties
    }

    pub fn default_stack_size(&self) -> usize {
        self.options.stack_size
    }

    pub fn lock_profiling_threshold(&self) -> u32 {
        self.options.lock_profiling_threshold
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn intern_table(&self) -> &Arc<InternTable> {
        &self.intern_table
    }

    pub fn class_linker(&self) -> &Arc<ClassLinker> {
        &self.class_linker
    }

    pub fn monitor_list(&self) -> &Arc<MonitorList> {
        &self.monitor_list
    }

    pub fn thread_list(&self) -> &Arc<ThreadList> {
        &self.thread_list
    }

    pub fn method_registry(&self) -> &Arc<MethodRegistry> {
        &self.method_registry
    }

    pub fn pre_allocated_out_of_memory_error(&self) -> Option<ObjectRef> {
        self.pre_allocated_out_of_memory_error.get()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("is_zygote", &self.is_zygote())
            .field("threads", &self.thread_list.len())
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}
