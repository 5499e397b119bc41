//! The per-thread execution context shared between compiler and emitted
//! code.
//!
//! Generated code addresses this structure through the reserved context
//! register, so the field offsets are ABI: they must agree between the
//! compiler that bakes them into loads and stores and the runtime that
//! lays the structure out. `repr(C)` keeps the declaration order below
//! authoritative.

use memoffset::offset_of;

use crate::slot::Slot;

/// Status codes emitted code leaves in the context before branching to the
/// exit address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum StatusCode {
    /// Normal method return; the result is in the return-value slot.
    Return = 0,
    /// The callee requests a message dispatch from the host.
    Dispatch = 1,
    /// The callee requests construction of a closure object.
    MakeClosure = 2,
    /// An exceptional return is unwinding to the host.
    Exception = 3,
    /// The heap could not satisfy an allocation.
    AllocationFailed = 4,
}

/// Fixed-layout thread state read and written by emitted machine code.
#[repr(C)]
pub struct ThreadContext {
    /// Base of the active frame on the managed stack.
    pub frame_pointer: *mut Slot,
    /// Top of the managed stack.
    pub stack_pointer: *mut Slot,
    /// Host address emitted code branches to on any exit.
    pub exit_return_address: *const u8,
    /// Why emitted code exited; a `StatusCode` value.
    pub status_code: i32,
    /// Host C stack pointer, saved on entry to emitted code and restored on
    /// exit.
    pub saved_c_stack_pointer: *mut u8,
    /// Backing array for class variables, indexed by the offsets the
    /// compiler assigned during class-variable resolution.
    pub class_variables_array: *mut Slot,
    pub this_process: Slot,
    pub this_thread: Slot,
}

/// Default managed stack size in slots (1 MiB).
pub const DEFAULT_STACK_SLOTS: usize = 128 * 1024;

impl ThreadContext {
    /// Create a context with a fresh managed stack. The stack is owned by
    /// the returned box; register it with the heap so collections scan it.
    pub fn new(stack_slots: usize) -> (Box<Self>, Box<[Slot]>) {
        let mut stack = vec![Slot::nil(); stack_slots].into_boxed_slice();
        let base = stack.as_mut_ptr();
        let context = Box::new(Self {
            frame_pointer: base,
            stack_pointer: base,
            exit_return_address: core::ptr::null(),
            status_code: StatusCode::Return as i32,
            saved_c_stack_pointer: core::ptr::null_mut(),
            class_variables_array: core::ptr::null_mut(),
            this_process: Slot::nil(),
            this_thread: Slot::nil(),
        });
        (context, stack)
    }

    pub fn status(&self) -> StatusCode {
        match self.status_code {
            0 => StatusCode::Return,
            1 => StatusCode::Dispatch,
            2 => StatusCode::MakeClosure,
            3 => StatusCode::Exception,
            _ => StatusCode::AllocationFailed,
        }
    }

    pub fn offset_of_frame_pointer() -> usize {
        offset_of!(ThreadContext, frame_pointer)
    }

    pub fn offset_of_stack_pointer() -> usize {
        offset_of!(ThreadContext, stack_pointer)
    }

    pub fn offset_of_exit_return_address() -> usize {
        offset_of!(ThreadContext, exit_return_address)
    }

    pub fn offset_of_status_code() -> usize {
        offset_of!(ThreadContext, status_code)
    }

    pub fn offset_of_saved_c_stack_pointer() -> usize {
        offset_of!(ThreadContext, saved_c_stack_pointer)
    }

    pub fn offset_of_class_variables_array() -> usize {
        offset_of!(ThreadContext, class_variables_array)
    }

    pub fn offset_of_this_process() -> usize {
        offset_of!(ThreadContext, this_process)
    }

    pub fn offset_of_this_thread() -> usize {
        offset_of!(ThreadContext, this_thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_follow_declaration_order() {
        assert_eq!(ThreadContext::offset_of_frame_pointer(), 0);
        assert_eq!(ThreadContext::offset_of_stack_pointer(), 8);
        assert_eq!(ThreadContext::offset_of_exit_return_address(), 16);
        assert_eq!(ThreadContext::offset_of_status_code(), 24);
        assert_eq!(ThreadContext::offset_of_saved_c_stack_pointer(), 32);
        assert_eq!(ThreadContext::offset_of_class_variables_array(), 40);
        assert_eq!(ThreadContext::offset_of_this_process(), 48);
        assert_eq!(ThreadContext::offset_of_this_thread(), 56);
    }

    #[test]
    fn new_context_points_at_its_stack() {
        let (context, stack) = ThreadContext::new(64);
        assert_eq!(context.frame_pointer as *const Slot, stack.as_ptr());
        assert_eq!(context.stack_pointer, context.frame_pointer);
        assert_eq!(context.status(), StatusCode::Return);
    }
}
