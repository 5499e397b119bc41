//! Compilation error taxonomy.
//!
//! Every pass returns `CodegenResult`; a failed pass abandons the unit.
//! Internal errors are invariant violations — they abort compilation of the
//! unit with a diagnostic but are never allowed to cross a thread boundary
//! as a panic.

use thiserror::Error;

use quaver_runtime::RuntimeError;

/// Errors produced while lowering one compilation unit.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// A name could not be resolved during CFG construction. Fatal for the
    /// unit; reported with the symbol text and source offset.
    #[error("unresolved name '{name}' at byte offset {offset}")]
    NameResolution { name: String, offset: usize },

    /// A pass invariant failed. Always a compiler bug, never user error.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// The heap was exhausted even after collection.
    #[error("allocation failed: {0}")]
    Allocation(#[from] RuntimeError),

    /// The emitter ran out of room in its target page. Recoverable by
    /// retrying with a larger page.
    #[error("machine code overflowed a page of {capacity} bytes")]
    MachineCodeOverflow { capacity: usize },
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// Log and construct an internal-invariant failure.
macro_rules! internal_error {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("{}", message);
        $crate::error::CodegenError::Internal(message)
    }};
}
pub(crate) use internal_error;
