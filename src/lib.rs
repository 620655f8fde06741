pub mod runtime;

pub use runtime::{
    CalleeSaveType, ConfigError, InstructionSet, ObjectRef, Runtime, RuntimeError, RuntimeHooks,
    RuntimeOption, VisitFlags,
};
