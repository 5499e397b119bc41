//! Heap object layout.
//!
//! Every collected object is a contiguous run of slots beginning with this
//! header. Instance variables follow the header in declaration order, so
//! the collector can scan an object body as a slot array without consulting
//! the class library.

use core::mem;

use crate::slot::{Slot, SLOT_SIZE};

/// Header at the start of every heap object.
#[repr(C)]
pub struct ObjectHeader {
    /// Symbol hash of the object's class name.
    pub class_name_hash: u64,
    /// Absolute object size in bytes, including this header.
    pub size_in_bytes: i32,
    /// Reserved; keeps the header a whole number of slots.
    pub flags: i32,
}

/// Header size in bytes. The body of an object begins here.
pub const HEADER_SIZE: usize = mem::size_of::<ObjectHeader>();

const _: () = assert!(HEADER_SIZE == 2 * SLOT_SIZE);

impl ObjectHeader {
    /// View the object at `address` as a header. The caller must ensure
    /// `address` points at a live object allocation.
    ///
    /// # Safety
    ///
    /// `address` must be a valid, aligned pointer to an initialized object
    /// header.
    pub unsafe fn from_address<'a>(address: *mut u8) -> &'a mut ObjectHeader {
        &mut *(address as *mut ObjectHeader)
    }

    /// Number of slots in the object body following the header.
    pub fn body_slot_count(&self) -> usize {
        let size = self.size_in_bytes as usize;
        debug_assert!(size >= HEADER_SIZE);
        (size - HEADER_SIZE) / SLOT_SIZE
    }

    /// The object body as a slot slice.
    ///
    /// # Safety
    ///
    /// The object's `size_in_bytes` must describe memory owned by this
    /// allocation.
    pub unsafe fn body<'a>(&self) -> &'a [Slot] {
        let base = (self as *const ObjectHeader as *const u8).add(HEADER_SIZE);
        core::slice::from_raw_parts(base as *const Slot, self.body_slot_count())
    }

    /// Mutable view of the object body.
    ///
    /// # Safety
    ///
    /// As [`ObjectHeader::body`].
    pub unsafe fn body_mut<'a>(&mut self) -> &'a mut [Slot] {
        let base = (self as *mut ObjectHeader as *mut u8).add(HEADER_SIZE);
        core::slice::from_raw_parts_mut(base as *mut Slot, self.body_slot_count())
    }
}
