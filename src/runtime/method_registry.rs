use crate::runtime::{
    ObjectRef, RuntimeResult,
    famous_classes::ABSTRACT_METHOD_CLASS,
    heap::{Heap, ObjectPayload},
    roots::{RootSource, RootVisitor, VisitFlags},
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstructionSet {
    None,
    Arm,
    Thumb2,
    X86,
    Mips,
}

impl InstructionSet {
    /// The instruction set this runtime was built for.
    pub const RUNTIME: InstructionSet = if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
        InstructionSet::Thumb2
    } else if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
        InstructionSet::Mips
    } else {
        InstructionSet::X86
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CalleeSaveType {
    SaveAll,
    RefsOnly,
    RefsAndArgs,
}

impl CalleeSaveType {
    pub const ALL: [CalleeSaveType; 3] = [
        CalleeSaveType::SaveAll,
        CalleeSaveType::RefsOnly,
        CalleeSaveType::RefsAndArgs,
    ];
}

const POINTER_SIZE: usize = 4;
const STACK_ALIGNMENT: usize = 16;

mod arm {
    pub const R1: u32 = 1;
    pub const R2: u32 = 2;
    pub const R3: u32 = 3;
    pub const R4: u32 = 4;
    pub const R5: u32 = 5;
    pub const R6: u32 = 6;
    pub const R7: u32 = 7;
    pub const R8: u32 = 8;
    pub const R9: u32 = 9;
    pub const R10: u32 = 10;
    pub const R11: u32 = 11;
    pub const LR: u32 = 14;
}

mod mips {
    pub const A1: u32 = 5;
    pub const A2: u32 = 6;
    pub const A3: u32 = 7;
    pub const S0: u32 = 16;
    pub const S1: u32 = 17;
    pub const S2: u32 = 18;
    pub const S3: u32 = 19;
    pub const S4: u32 = 20;
    pub const S5: u32 = 21;
    pub const S6: u32 = 22;
    pub const S7: u32 = 23;
    pub const GP: u32 = 28;
    pub const FP: u32 = 30;
    pub const RA: u32 = 31;
}

mod x86 {
    pub const ECX: u32 = 1;
    pub const EDX: u32 = 2;
    pub const EBX: u32 = 3;
    pub const EBP: u32 = 5;
    pub const ESI: u32 = 6;
    pub const EDI: u32 = 7;
    pub const NUMBER_OF_CPU_REGISTERS: u32 = 8;
}

fn spills(registers: &[u32]) -> u32 {
    registers.iter().fold(0, |mask, register| mask | 1 << register)
}

fn round_up(x: usize, n: usize) -> usize {
    x.div_ceil(n) * n
}

/// Stack frame layout of a callee-save method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_size: usize,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

impl FrameInfo {
    pub fn for_callee_save(instruction_set: InstructionSet, ty: CalleeSaveType) -> FrameInfo {
        use CalleeSaveType::*;
        match instruction_set {
            InstructionSet::Arm | InstructionSet::Thumb2 => {
                use arm::*;
                let ref_spills = spills(&[R5, R6, R7, R8, R10, R11]);
                let arg_spills = spills(&[R1, R2, R3]);
                let all_spills = spills(&[R4, R9]);
                let mut core_spill_mask = ref_spills | spills(&[LR]);
                match ty {
                    RefsAndArgs => core_spill_mask |= arg_spills,
                    SaveAll => core_spill_mask |= all_spills,
                    RefsOnly => {}
                }
                // S0..S31
                let fp_spill_mask = if ty == SaveAll { u32::MAX } else { 0 };
                let spill_count = core_spill_mask.count_ones() + fp_spill_mask.count_ones();
                FrameInfo {
                    frame_size: round_up((spill_count as usize + 1) * POINTER_SIZE, STACK_ALIGNMENT),
                    core_spill_mask,
                    fp_spill_mask,
                }
            }
            InstructionSet::Mips => {
                use mips::*;
                let ref_spills = spills(&[S2, S3, S4, S5, S6, S7, GP, FP]);
                let arg_spills = spills(&[A1, A2, A3]);
                let all_spills = spills(&[S0, S1]);
                let mut core_spill_mask = ref_spills | spills(&[RA]);
                match ty {
                    RefsAndArgs => core_spill_mask |= arg_spills,
                    SaveAll => core_spill_mask |= all_spills,
                    RefsOnly => {}
                }
                // outgoing argument area is only absent for RefsAndArgs
                let padding = if ty == RefsAndArgs { 0 } else { 3 };
                let slots = core_spill_mask.count_ones() as usize + padding + 1;
                FrameInfo {
                    frame_size: round_up(slots * POINTER_SIZE, STACK_ALIGNMENT),
                    core_spill_mask,
                    fp_spill_mask: 0,
                }
            }
            InstructionSet::X86 => {
                use x86::*;
                let ref_spills = spills(&[EBP, ESI, EDI]);
                let arg_spills = spills(&[ECX, EDX, EBX]);
                // fake return address callee save
                let mut core_spill_mask = ref_spills | spills(&[NUMBER_OF_CPU_REGISTERS]);
                if ty == RefsAndArgs {
                    core_spill_mask |= arg_spills;
                }
                let slots = core_spill_mask.count_ones() as usize + 1;
                FrameInfo {
                    frame_size: round_up(slots * POINTER_SIZE, STACK_ALIGNMENT),
                    core_spill_mask,
                    fp_spill_mask: 0,
                }
            }
            InstructionSet::None => {
                panic!("no callee-save frame layout for instruction set {instruction_set:?}")
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuntimeMethodKind {
    Resolution,
    CalleeSave(CalleeSaveType),
}

/// A runtime-synthesized method descriptor backed by a heap object.
#[derive(Debug)]
pub struct RuntimeMethod {
    object: ObjectRef,
    kind: RuntimeMethodKind,
    instruction_set: InstructionSet,
    frame_info: Option<FrameInfo>,
}

impl RuntimeMethod {
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn kind(&self) -> RuntimeMethodKind {
        self.kind
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.instruction_set
    }

    /// `None` for the resolution method.
    pub fn frame_info(&self) -> Option<FrameInfo> {
        self.frame_info
    }
}

type MethodSlot = Arc<OnceCell<Arc<RuntimeMethod>>>;

/// Write-once slots for the resolution trampoline and the callee-save
/// methods of each instruction set.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    resolution: OnceCell<Arc<RuntimeMethod>>,
    callee_saves: DashMap<(CalleeSaveType, InstructionSet), MethodSlot>,
    // held while a method object is being synthesized
    synthesis: Mutex<()>,
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry::default()
    }

    fn slot(&self, ty: CalleeSaveType, instruction_set: InstructionSet) -> MethodSlot {
        Arc::clone(
            self.callee_saves
                .entry((ty, instruction_set))
                .or_default()
                .value(),
        )
    }

    /// Returns the callee-save method for the pair, synthesizing it on first use.
    pub fn create_callee_save_method(
        &self,
        heap: &Heap,
        instruction_set: InstructionSet,
        ty: CalleeSaveType,
    ) -> RuntimeResult<Arc<RuntimeMethod>> {
        let slot = self.slot(ty, instruction_set);
        if let Some(method) = slot.get() {
            return Ok(Arc::clone(method));
        }
        let _publication = heap.publishing_root();
        let method = slot.get_or_try_init(|| {
            let frame_info = FrameInfo::for_callee_save(instruction_set, ty);
            let _synthesis = self.synthesis.lock();
            let object = heap.allocate(ABSTRACT_METHOD_CLASS, 0, ObjectPayload::Plain)?;
            debug!(?ty, ?instruction_set, frame_size = frame_info.frame_size, "created callee-save method");
            RuntimeResult::Ok(Arc::new(RuntimeMethod {
                object,
                kind: RuntimeMethodKind::CalleeSave(ty),
                instruction_set,
                frame_info: Some(frame_info),
            }))
        })?;
        Ok(Arc::clone(method))
    }

    pub fn has_callee_save_method(&self, ty: CalleeSaveType, instruction_set: InstructionSet) -> bool {
        self.try_callee_save_method(ty, instruction_set).is_some()
    }

    pub fn try_callee_save_method(
        &self,
        ty: CalleeSaveType,
        instruction_set: InstructionSet,
    ) -> Option<Arc<RuntimeMethod>> {
        self.callee_saves
            .get(&(ty, instruction_set))
            .and_then(|slot| slot.get().cloned())
    }

    pub fn callee_save_method(&self, ty: CalleeSaveType, instruction_set: InstructionSet) -> Arc<RuntimeMethod> {
        self.try_callee_save_method(ty, instruction_set)
            .unwrap_or_else(|| panic!("callee-save method {ty:?} for {instruction_set:?} requested before creation"))
    }

    /// Synthesizes a fresh resolution method. It is not installed.
    pub fn create_resolution_method(&self, heap: &Heap) -> RuntimeResult<Arc<RuntimeMethod>> {
        let _synthesis = self.synthesis.lock();
        let object = heap.allocate(ABSTRACT_METHOD_CLASS, 0, ObjectPayload::Plain)?;
        debug!(%object, "created resolution method");
        Ok(Arc::new(RuntimeMethod {
            object,
            kind: RuntimeMethodKind::Resolution,
            instruction_set: InstructionSet::None,
            frame_info: None,
        }))
    }

    pub fn set_resolution_method(&self, method: Arc<RuntimeMethod>) {
        assert_eq!(method.kind, RuntimeMethodKind::Resolution, "not a resolution method");
        if self.resolution.set(method).is_err() {
            panic!("resolution method installed twice");
        }
    }

    pub fn has_resolution_method(&self) -> bool {
        self.resolution.get().is_some()
    }

    pub fn resolution_method(&self) -> Arc<RuntimeMethod> {
        Arc::clone(
            self.resolution
                .get()
                .expect("resolution method requested before installation"),
        )
    }

    /// True while some thread is synthesizing a method object.
    pub fn is_synthesizing(&self) -> bool {
        self.synthesis.try_lock().is_none()
    }

    fn populated(&self) -> Vec<Arc<RuntimeMethod>> {
        let mut callee_saves: Vec<_> = self
            .callee_saves
            .iter()
            .filter_map(|entry| entry.value().get().map(|m| (*entry.key(), Arc::clone(m))))
            .collect();
        callee_saves.sort_by_key(|(key, _)| *key);
        self.resolution
            .get()
            .cloned()
            .into_iter()
            .chain(callee_saves.into_iter().map(|(_, method)| method))
            .collect()
    }
}

impl RootSource for MethodRegistry {
    fn visit_roots(&self, visitor: &mut RootVisitor<'_>, _flags: VisitFlags) {
        for method in self.populated() {
            visitor(method.object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeError, options::ParsedOptions};

    fn heap() -> Heap {
        Heap::new(&ParsedOptions::default())
    }

    #[test]
    fn test_arm_frame_layouts() {
        let save_all = FrameInfo::for_callee_save(InstructionSet::Thumb2, CalleeSaveType::SaveAll);
        assert_eq!(save_all.frame_size, 176);
        assert_eq!(save_all.core_spill_mask, 0b0100_1111_1111_0000);
        assert_eq!(save_all.fp_spill_mask, u32::MAX);

        let refs_only = FrameInfo::for_callee_save(InstructionSet::Arm, CalleeSaveType::RefsOnly);
        assert_eq!(refs_only.frame_size, 32);
        assert_eq!(refs_only.fp_spill_mask, 0);

        let refs_and_args = FrameInfo::for_callee_save(InstructionSet::Arm, CalleeSaveType::RefsAndArgs);
        assert_eq!(refs_and_args.frame_size, 48);
        assert_eq!(refs_and_args.core_spill_mask, 0b0100_1101_1110_1110);
    }

    #[test]
    fn test_x86_and_mips_frame_sizes() {
        for ty in CalleeSaveType::ALL {
            assert_eq!(FrameInfo::for_callee_save(InstructionSet::X86, ty).frame_size, 32);
            assert_eq!(FrameInfo::for_callee_save(InstructionSet::Mips, ty).frame_size, 64);
        }
        let x86 = FrameInfo::for_callee_save(InstructionSet::X86, CalleeSaveType::RefsAndArgs);
        assert_eq!(x86.core_spill_mask, 0b1_1110_1110);
    }

    #[test]
    fn test_callee_save_methods_are_created_once() {
        let heap = heap();
        let registry = MethodRegistry::new();
        assert!(!registry.has_callee_save_method(CalleeSaveType::RefsOnly, InstructionSet::X86));

        let first = registry
            .create_callee_save_method(&heap, InstructionSet::X86, CalleeSaveType::RefsOnly)
            .unwrap();
        let again = registry
            .create_callee_save_method(&heap, InstructionSet::X86, CalleeSaveType::RefsOnly)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(registry.has_callee_save_method(CalleeSaveType::RefsOnly, InstructionSet::X86));
        assert!(!registry.has_callee_save_method(CalleeSaveType::RefsOnly, InstructionSet::Mips));
        assert!(Arc::ptr_eq(
            &registry.callee_save_method(CalleeSaveType::RefsOnly, InstructionSet::X86),
            &first
        ));
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    #[should_panic(expected = "requested before creation")]
    fn test_callee_save_method_before_creation_panics() {
        MethodRegistry::new().callee_save_method(CalleeSaveType::SaveAll, InstructionSet::Arm);
    }

    #[test]
    fn test_resolution_method_installed_once() {
        let heap = heap();
        let registry = MethodRegistry::new();
        assert!(!registry.has_resolution_method());
        let method = registry.create_resolution_method(&heap).unwrap();
        assert_eq!(method.frame_info(), None);
        registry.set_resolution_method(Arc::clone(&method));
        assert!(Arc::ptr_eq(&registry.resolution_method(), &method));
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn test_resolution_method_installed_twice_panics() {
        let heap = heap();
        let registry = MethodRegistry::new();
        registry.set_resolution_method(registry.create_resolution_method(&heap).unwrap());
        registry.set_resolution_method(registry.create_resolution_method(&heap).unwrap());
    }

    #[test]
    fn test_failed_synthesis_leaves_slot_empty() {
        let heap = Heap::new(&ParsedOptions {
            heap_initial_size: 16,
            heap_maximum_size: 16,
            ..ParsedOptions::default()
        });
        let registry = MethodRegistry::new();
        let err = registry
            .create_callee_save_method(&heap, InstructionSet::Arm, CalleeSaveType::SaveAll)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMemory { .. }));
        assert!(!registry.has_callee_save_method(CalleeSaveType::SaveAll, InstructionSet::Arm));
        assert!(!registry.is_synthesizing());
    }

    #[test]
    fn test_roots_visit_resolution_then_callee_saves() {
        let heap = heap();
        let registry = MethodRegistry::new();
        let refs_and_args = registry
            .create_callee_save_method(&heap, InstructionSet::X86, CalleeSaveType::RefsAndArgs)
            .unwrap();
        let save_all = registry
            .create_callee_save_method(&heap, InstructionSet::X86, CalleeSaveType::SaveAll)
            .unwrap();
        let resolution = registry.create_resolution_method(&heap).unwrap();
        registry.set_resolution_method(Arc::clone(&resolution));

        let mut seen = vec![];
        registry.visit_roots(&mut |root| seen.push(root), VisitFlags::default());
        assert_eq!(
            seen,
            vec![resolution.object(), save_all.object(), refs_and_args.object()]
        );
    }
}
