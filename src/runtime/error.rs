use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized option {0}")]
    UnrecognizedOption(String),

    #[error("missing required value for {0}")]
    MissingValue(String),

    #[error("failed to parse {option}: {value:?}")]
    InvalidValue { option: String, value: String },

    #[error("boot class path option does not name any archive")]
    EmptyBootClassPath,

    #[error("initial heap size {initial} exceeds maximum heap size {maximum}")]
    InconsistentHeapSizes { initial: usize, maximum: usize },
}

impl ConfigError {
    pub(crate) fn invalid(option: &str, value: &str) -> Self {
        ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("a runtime has already been created in this process")]
    AlreadyCreated,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("out of memory allocating {class_name} ({size} bytes)")]
    OutOfMemory { class_name: String, size: usize },

    #[error("thread attaching while runtime is shutting down: {0}")]
    ShuttingDown(String),

    #[error("thread {0:?} is already attached")]
    AlreadyAttached(String),

    #[error("current thread is not attached")]
    NotAttached,

    #[error("failed to initialize zygote")]
    ZygoteInit,

    #[error("failed to open archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
