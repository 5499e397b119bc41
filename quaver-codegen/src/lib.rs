//! The Quaver code generator.
//!
//! Takes a frame of SSA HIR (built by `quaver-frontend`) through the
//! backend pipeline: linearization, lifetime analysis, linear-scan
//! register allocation, SSA deconstruction, and emission through an
//! abstract instruction sink. The validator re-checks each pass's
//! invariants in between.

pub mod abi;
pub mod context;
pub mod emit;
pub mod entity;
pub mod error;
pub mod frame;
pub mod hir;
pub mod lifetime;
pub mod linearize;
pub mod lir;
pub mod moves;
pub mod regalloc;
pub mod reporter;
pub mod resolve;
pub mod validate;

pub use context::CompileCtx;
pub use emit::{emit, emit_function, CodeSink, CompiledCode, RecordingSink, WordSink};
pub use error::{CodegenError, CodegenResult};
pub use frame::Frame;
pub use lifetime::build_lifetimes;
pub use linearize::{linearize, LinearFrame};
pub use regalloc::{allocate, MachineDesc};
pub use reporter::ErrorReporter;
pub use resolve::resolve;

/// Run the backend pipeline over a built frame, validating between
/// passes, and return the allocated linear form ready for emission.
pub fn lower_frame(frame: &Frame, machine: &MachineDesc) -> CodegenResult<LinearFrame> {
    validate::validate_frame(frame)?;

    let mut linear = linearize(frame)?;
    validate::validate_linear(frame, &linear)?;

    build_lifetimes(&mut linear);
    validate::validate_lifetimes(&linear)?;

    allocate(&mut linear, machine)?;
    validate::validate_allocation(&linear)?;

    resolve(&mut linear)?;
    Ok(linear)
}
