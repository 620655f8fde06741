use std::{
    fmt,
    io::{self, Write},
};

/// Embedder callbacks. Every method has the built-in behaviour as its
/// default, so embedders override only what they need.
pub trait RuntimeHooks: Send + Sync + fmt::Debug {
    /// Whether the calling thread is latency sensitive. Used to decide
    /// whether lock contention should be logged.
    fn is_sensitive_thread(&self) -> bool {
        false
    }

    /// Receives diagnostic output such as SIGQUIT dumps.
    fn vfprintf(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        io::stderr().lock().write_fmt(args)
    }

    /// Expected not to return.
    fn exit(&self, status: i32) {
        std::process::exit(status)
    }

    /// Expected not to return.
    fn abort(&self) {
        std::process::abort()
    }
}

#[derive(Debug, Default)]
pub struct DefaultHooks;

impl RuntimeHooks for DefaultHooks {}
