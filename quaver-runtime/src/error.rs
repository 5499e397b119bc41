//! Runtime error type.

use thiserror::Error;

/// Errors raised by the runtime's memory machinery.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("mmap of {size} bytes failed: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("page reprotection failed: {source}")]
    Protect {
        #[source]
        source: region::Error,
    },

    /// The heap could not satisfy an allocation even after collecting.
    #[error("heap exhausted allocating {size} bytes")]
    HeapExhausted { size: usize },
}
