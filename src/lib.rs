//! corvid - a bytecode compiler and virtual machine for a small
//! dynamically typed scripting language in the Lox family.
//!
//! # Quick start
//!
//! ```
//! use corvid::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("print 1 + 2;").unwrap();
//! ```
//!
//! Compile or runtime failures carry only a source line, not a byte
//! span, so rendering a [`miette`] report from one means first
//! recovering a span by re-scanning the source for that line. See
//! [`render_error_to_string`].

pub use corvid_core::{Diagnostic, Error, InterpretResult, Severity, Vm, VmOptions};

use miette::{Diagnostic as MietteDiagnostic, NamedSource, SourceSpan};
use thiserror::Error as ThisError;

/// One [`Diagnostic`] re-anchored to a byte span in `source`, so
/// `miette`'s "fancy" renderer can print the usual source snippet and
/// caret. Built fresh per diagnostic; the span is only as good as the
/// line number the compiler or VM recorded.
#[derive(Debug, ThisError, MietteDiagnostic)]
#[error("{message}")]
struct RenderedDiagnostic {
    message: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("here")]
    span: SourceSpan,
    #[diagnostic(severity)]
    severity: miette::Severity,
}

fn line_span(source: &str, line: u32) -> SourceSpan {
    let mut offset = 0usize;
    for (i, chunk) in source.split_inclusive('\n').enumerate() {
        if i as u32 + 1 == line {
            let len = chunk.trim_end_matches('\n').len().max(1);
            return SourceSpan::new(offset.into(), len);
        }
        offset += chunk.len();
    }
    SourceSpan::new(offset.into(), 1)
}

fn to_miette_severity(severity: Severity) -> miette::Severity {
    match severity {
        Severity::Error => miette::Severity::Error,
        Severity::Warning => miette::Severity::Warning,
        Severity::Info => miette::Severity::Advice,
    }
}

/// Render every diagnostic carried by `error` against `source`, one
/// `miette` report after another, and return the combined text.
///
/// # Example
/// ```
/// use corvid::{Vm, render_error_to_string};
///
/// let mut vm = Vm::new();
/// let source = "1 +;";
/// if let Err(e) = vm.interpret(source) {
///     let rendered = render_error_to_string(source, &e);
///     assert!(rendered.contains("Expect"));
/// }
/// ```
pub fn render_error_to_string(source: &str, error: &Error) -> String {
    let mut out = String::new();
    for diag in error.diagnostics() {
        let report = miette::Report::new(RenderedDiagnostic {
            message: diag.message.clone(),
            src: NamedSource::new("<script>", source.to_string()),
            span: line_span(source, diag.line),
            severity: to_miette_severity(diag.severity),
        });
        out.push_str(&format!("{report:?}"));
    }
    out
}

/// Render `error` to stderr using `source` for snippet context.
pub fn render_error(source: &str, error: &Error) {
    eprint!("{}", render_error_to_string(source, error));
}

/// The process exit code a host should use for `error`, matching the
/// conventions of `sysexits.h`: 65 (`EX_DATAERR`) for a rejected
/// program, 70 (`EX_SOFTWARE`) for a failure while running one.
pub fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Compile(_) => 65,
        Error::Runtime(_) => 70,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_compile_error_includes_source_snippet() {
        let mut vm = Vm::new();
        let source = "1 +;";
        let err = vm.interpret(source).unwrap_err();
        let rendered = render_error_to_string(source, &err);
        assert!(rendered.contains("1 +;"));
        assert_eq!(exit_code_for(&err), 65);
    }

    #[test]
    fn render_runtime_error_reports_the_failing_line() {
        let mut vm = Vm::new();
        let source = "var x = nil;\nprint x + 1;\n";
        let err = vm.interpret(source).unwrap_err();
        let rendered = render_error_to_string(source, &err);
        assert!(rendered.contains("print x + 1"));
        assert_eq!(exit_code_for(&err), 70);
    }
}
