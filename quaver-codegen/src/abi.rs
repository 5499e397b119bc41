//! Managed frame and call-area layout shared by the compiler and the
//! runtime's dispatch trampoline.
//!
//! All offsets are in slots. Frame offsets are relative to the frame
//! pointer; call-area and return offsets are relative to the stack pointer
//! at the point of the call.

/// Saved frame pointer of the caller.
pub const CALLER_FRAME_SLOT: i32 = 0;
/// Frame pointer of the lexically enclosing frame, for closures.
pub const OUTER_FRAME_SLOT: i32 = 1;
/// The executing method object, read by `thisMethod`.
pub const METHOD_SLOT: i32 = 2;
/// Number of header slots before the prototype-frame slots begin.
pub const FRAME_HEADER_SLOTS: i32 = 3;

/// The caller's return-value slot sits just below its stack pointer.
pub const RETURN_VALUE_STACK_SLOT: i32 = -1;

/// Outgoing call area, built up past the stack pointer before a dispatch.
pub const CALL_TARGET_STACK_SLOT: i32 = 0;
pub const CALL_SELECTOR_STACK_SLOT: i32 = 1;
pub const CALL_ARG_COUNT_STACK_SLOT: i32 = 2;
pub const CALL_KWARG_COUNT_STACK_SLOT: i32 = 3;
pub const CALL_ARGS_BASE_STACK_SLOT: i32 = 4;
