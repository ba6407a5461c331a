//! Bytecode compiler and stack-based virtual machine for a small
//! dynamically typed scripting language in the Lox family.
//!
//! The three subsystems are tightly coupled and live in their own
//! modules:
//! - [`compiler`] — single-pass Pratt parser that lowers source text
//!   directly to bytecode, no AST.
//! - [`values`] — the NaN-boxed [`values::Value`] and the heap object
//!   model the compiler and VM share.
//! - [`vm`] — call frames, dispatch loop, and the tri-colour
//!   mark–sweep collector.

pub mod compiler;
pub mod diagnostics;
pub mod values;
pub mod vm;

pub use diagnostics::{Diagnostic, Error, Severity};
pub use vm::{InterpretResult, Vm, VmOptions};

/// Test utilities shared across unit and integration tests.
#[cfg(test)]
pub mod test_utils {
    /// Initialize a `tracing` subscriber writing to the test harness.
    ///
    /// Safe to call from multiple tests; only the first call takes effect.
    pub fn init_test_logging() {
        use tracing_subscriber::{EnvFilter, fmt};

        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }
}
