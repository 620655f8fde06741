mod runtime;
mod system;
mod vm_runtime;

use crate::runtime::{ObjectRef, Runtime, RuntimeError};
use dashmap::DashMap;
use thiserror::Error;

pub type NativeFunction = fn(NativeEnv<'_>) -> NativeResult<Option<NativeValue>>;

pub struct NativeEnv<'r> {
    pub args: Vec<NativeValue>,
    pub runtime: &'r Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeValue {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Reference(Option<ObjectRef>),
}

impl NativeValue {
    fn type_name(&self) -> &'static str {
        match self {
            NativeValue::Boolean(_) => "boolean",
            NativeValue::Int(_) => "int",
            NativeValue::Long(_) => "long",
            NativeValue::Reference(_) => "reference",
        }
    }

    fn mismatch(&self, expected: &'static str) -> NativeError {
        NativeError::ArgumentType {
            expected,
            found: self.type_name(),
        }
    }

    pub fn get_int(&self) -> NativeResult<i32> {
        match self {
            NativeValue::Int(i) => Ok(*i),
            _ => Err(self.mismatch("int")),
        }
    }

    pub fn get_long(&self) -> NativeResult<i64> {
        match self {
            NativeValue::Long(l) => Ok(*l),
            _ => Err(self.mismatch("long")),
        }
    }

    pub fn get_ref(&self) -> NativeResult<Option<ObjectRef>> {
        match self {
            NativeValue::Reference(r) => Ok(*r),
            _ => Err(self.mismatch("reference")),
        }
    }
}

impl NativeEnv<'_> {
    pub fn arg(&self, index: usize) -> NativeResult<NativeValue> {
        self.args.get(index).copied().ok_or(NativeError::ArgumentCount {
            expected: index + 1,
            found: self.args.len(),
        })
    }
}

/// Type names of the parameters in a method descriptor such as
/// `(ILjava/lang/Object;)V`. Sub-int primitives are passed as ints.
pub(in crate::runtime) fn parameter_types(descriptor: &str) -> NativeResult<Vec<&'static str>> {
    let malformed = || NativeError::Descriptor(descriptor.to_string());
    let params = descriptor
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(params, _)| params)
        .ok_or_else(malformed)?;
    let mut types = Vec::new();
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        let ty = match c {
            'Z' => "boolean",
            'B' | 'C' | 'S' | 'I' => "int",
            'J' => "long",
            'L' => {
                chars.by_ref().find(|&c| c == ';').ok_or_else(malformed)?;
                "reference"
            }
            '[' => {
                let mut element = chars.next();
                while element == Some('[') {
                    element = chars.next();
                }
                match element {
                    Some('L') => {
                        chars.by_ref().find(|&c| c == ';').ok_or_else(malformed)?;
                    }
                    Some('Z' | 'B' | 'C' | 'S' | 'I' | 'J' | 'F' | 'D') => {}
                    _ => return Err(malformed()),
                }
                "reference"
            }
            // no float or double values cross the native boundary
            _ => return Err(malformed()),
        };
        types.push(ty);
    }
    Ok(types)
}

/// Rejects `args` unless they match the parameters of `descriptor`.
pub(in crate::runtime) fn check_arguments(descriptor: &str, args: &[NativeValue]) -> NativeResult<()> {
    let expected = parameter_types(descriptor)?;
    if expected.len() != args.len() {
        return Err(NativeError::ArgumentCount {
            expected: expected.len(),
            found: args.len(),
        });
    }
    match expected.iter().zip(args).find(|(ty, arg)| **ty != arg.type_name()) {
        Some((ty, arg)) => Err(arg.mismatch(ty)),
        None => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("no native method {class_name}.{method_name}{descriptor}")]
    Unregistered {
        class_name: String,
        method_name: String,
        descriptor: String,
    },

    #[error("expected {expected} arguments, got {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("expected {expected} argument, got {found}")]
    ArgumentType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed method descriptor {0}")]
    Descriptor(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type NativeResult<T> = Result<T, NativeError>;

// key: class_name, method_name, method_descriptor
type Key = (String, String, String);

#[derive(Debug, Default)]
pub struct NativeRegistry {
    functions: DashMap<Key, NativeFunction>,
}

impl NativeRegistry {
    pub fn register(&self, class_name: &str, method_name: &str, descriptor: &str, function: NativeFunction) {
        self.functions.insert(
            (
                class_name.to_string(),
                method_name.to_string(),
                descriptor.to_string(),
            ),
            function,
        );
    }

    pub fn lookup(&self, class_name: &str, method_name: &str, descriptor: &str) -> Option<NativeFunction> {
        self.functions
            .get(&(
                class_name.to_string(),
                method_name.to_string(),
                descriptor.to_string(),
            ))
            .map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

pub(in crate::runtime) fn register_natives(registry: &NativeRegistry) {
    runtime::register_natives(registry);
    system::register_natives(registry);
    vm_runtime::register_natives(registry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_types() {
        assert_eq!(parameter_types("()V").unwrap(), Vec::<&str>::new());
        assert_eq!(
            parameter_types("(ZBJLjava/lang/String;[[I[Ljava/lang/Object;)V").unwrap(),
            vec!["boolean", "int", "long", "reference", "reference", "reference"]
        );
        assert!(matches!(parameter_types("I)V"), Err(NativeError::Descriptor(_))));
        assert!(matches!(parameter_types("(Ljava/lang/Object)V"), Err(NativeError::Descriptor(_))));
        assert!(matches!(parameter_types("(F)V"), Err(NativeError::Descriptor(_))));
    }

    #[test]
    fn test_getters_report_mismatch() {
        assert_eq!(NativeValue::Long(3).get_long().unwrap(), 3);
        assert!(matches!(
            NativeValue::Boolean(true).get_int(),
            Err(NativeError::ArgumentType {
                expected: "int",
                found: "boolean"
            })
        ));
        assert!(check_arguments("(ZI)V", &[NativeValue::Boolean(false), NativeValue::Int(2)]).is_ok());
    }
}
