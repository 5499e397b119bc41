//! The compilation context.
//!
//! One explicit value bundles every process-wide resource a compilation
//! touches: the heap, the symbol table, and the class library. It is
//! threaded through the passes by reference; nothing in the compiler
//! reaches for a global.

use std::sync::Arc;

use quaver_runtime::{ClassLibrary, Heap, SymbolTable};

/// Shared state for one compilation pipeline.
pub struct CompileCtx {
    pub heap: Heap,
    pub symbols: Arc<SymbolTable>,
    pub class_library: Box<dyn ClassLibrary>,
}

impl CompileCtx {
    pub fn new(symbols: Arc<SymbolTable>, class_library: Box<dyn ClassLibrary>) -> Self {
        Self { heap: Heap::new(), symbols, class_library }
    }
}
