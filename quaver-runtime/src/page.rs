//! Memory-mapped pages of fixed-size objects.
//!
//! A `Page` is one contiguous `mmap` region carved into equal-sized object
//! slots. It is the unit the heap requests from the operating system; it is
//! not necessarily an operating-system page. Each slot has one mark byte
//! combining a tri-color mark in the two high bits with a six-bit count of
//! collections survived; a mark byte of zero means the slot is free.

use crate::error::RuntimeError;

/// Tri-color mark stored in the high two bits of a slot's mark byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Color {
    White = 0,
    Gray = 0x40,
    Black = 0x80,
}

const COLOR_MASK: u8 = 0xc0;
const COUNT_MASK: u8 = 0x3f;

/// A contiguous mapped region holding fixed-size objects.
pub struct Page {
    start: *mut u8,
    object_size: usize,
    total_size: usize,
    executable: bool,
    next_free: usize,
    allocated: usize,
    /// One byte per object slot: color bits plus survival count, zero when
    /// the slot is free.
    marks: Vec<u8>,
}

// The raw start pointer is owned exclusively by this Page; pages move
// between collector generations but are only touched under the heap lock.
unsafe impl Send for Page {}

impl Page {
    /// Map a new page of `total_size` bytes holding objects of
    /// `object_size` bytes each. Executable pages are mapped with both
    /// write and execute permission (plus `MAP_JIT` where the platform
    /// requires it).
    pub fn map(object_size: usize, total_size: usize, executable: bool) -> Result<Self, RuntimeError> {
        debug_assert!(object_size > 0 && object_size <= total_size);

        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        #[allow(unused_mut)]
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if executable {
            prot |= libc::PROT_EXEC;
            #[cfg(target_os = "macos")]
            {
                flags |= libc::MAP_JIT;
            }
        }

        let address = unsafe {
            libc::mmap(core::ptr::null_mut(), total_size, prot, flags, -1, 0)
        };
        if address == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error();
            log::error!("page mmap of {} bytes failed: {}", total_size, errno);
            return Err(RuntimeError::Mmap { size: total_size, source: errno });
        }

        Ok(Self {
            start: address as *mut u8,
            object_size,
            total_size,
            executable,
            next_free: 0,
            allocated: 0,
            marks: vec![0; total_size / object_size],
        })
    }

    /// Carve out the next free object slot, or `None` when the page is
    /// full. New objects start white with a survival count of one.
    pub fn allocate(&mut self) -> Option<*mut u8> {
        if self.allocated == self.marks.len() {
            return None;
        }
        debug_assert_eq!(self.marks[self.next_free], 0);
        let address = unsafe { self.start.add(self.next_free * self.object_size) };
        self.marks[self.next_free] = 1;
        self.allocated += 1;

        if self.allocated < self.marks.len() {
            for step in 1..self.marks.len() {
                let candidate = (self.next_free + step) % self.marks.len();
                if self.marks[candidate] == 0 {
                    self.next_free = candidate;
                    break;
                }
            }
        } else {
            self.next_free = self.marks.len();
        }
        Some(address)
    }

    /// Number of additional objects this page can hold.
    pub fn remaining_capacity(&self) -> usize {
        debug_assert!(self.allocated <= self.marks.len());
        self.marks.len() - self.allocated
    }

    pub fn allocated_objects(&self) -> usize {
        self.allocated
    }

    pub fn object_count(&self) -> usize {
        self.marks.len()
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn start_address(&self) -> *mut u8 {
        self.start
    }

    pub fn end_address(&self) -> usize {
        self.start as usize + self.total_size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Does `address` fall inside this page's mapping?
    pub fn contains(&self, address: usize) -> bool {
        let start = self.start as usize;
        address >= start && address < start + self.total_size
    }

    /// Index of the object slot enclosing `address`.
    pub fn slot_of(&self, address: usize) -> usize {
        debug_assert!(self.contains(address));
        (address - self.start as usize) / self.object_size
    }

    /// Address of object slot `index`.
    pub fn slot_address(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.marks.len());
        unsafe { self.start.add(index * self.object_size) }
    }

    /// True when slot `index` holds a live object.
    pub fn is_allocated(&self, index: usize) -> bool {
        self.marks[index] != 0
    }

    /// Recolor the object enclosing `address`, preserving its survival
    /// count.
    pub fn set_color(&mut self, address: usize, color: Color) {
        let index = self.slot_of(address);
        debug_assert_ne!(self.marks[index], 0, "coloring a free slot");
        self.marks[index] = (self.marks[index] & COUNT_MASK) | color as u8;
    }

    pub fn color(&self, index: usize) -> Color {
        match self.marks[index] & COLOR_MASK {
            0x40 => Color::Gray,
            0x80 => Color::Black,
            _ => Color::White,
        }
    }

    /// Collections this object has survived, counting its allocation.
    pub fn survival_count(&self, index: usize) -> u8 {
        self.marks[index] & COUNT_MASK
    }

    /// Bump the survival count of a live slot, saturating at the six-bit
    /// limit, and reset its color to white for the next cycle.
    pub fn age(&mut self, index: usize) {
        let count = (self.marks[index] & COUNT_MASK).saturating_add(1).min(COUNT_MASK);
        self.marks[index] = count;
    }

    /// Release slot `index` back to the page.
    pub fn free_slot(&mut self, index: usize) {
        debug_assert_ne!(self.marks[index], 0, "double free of page slot");
        self.marks[index] = 0;
        self.allocated -= 1;
        if index < self.next_free {
            self.next_free = index;
        }
    }

    /// Flip an executable page between write-allowed and execute-allowed
    /// states. Must bracket emission: no instruction executes out of a page
    /// that is currently writable.
    pub fn protect_for_execution(&self, execute: bool) -> Result<(), RuntimeError> {
        debug_assert!(self.executable);
        jit_write_protect(execute);
        let protection = if execute {
            region::Protection::READ_EXECUTE
        } else {
            region::Protection::READ_WRITE
        };
        // On MAP_JIT platforms the thread-local toggle above is the real
        // mechanism and region-level reprotection is redundant.
        #[cfg(not(target_os = "macos"))]
        unsafe {
            region::protect(self.start, self.total_size, protection)
                .map_err(|source| RuntimeError::Protect { source })?;
        }
        #[cfg(target_os = "macos")]
        let _ = protection;
        Ok(())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.start as *mut libc::c_void, self.total_size) };
        if result != 0 {
            log::error!("page munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Thread-local write-protection toggle for JIT pages. A no-op on platforms
/// without a writable-JIT/executable-JIT distinction.
pub fn jit_write_protect(execute: bool) {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::pthread_jit_write_protect_np(execute as libc::c_int);
    }
    #[cfg(not(target_os = "macos"))]
    let _ = execute;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_until_full() {
        let mut page = Page::map(64, 256, false).unwrap();
        assert_eq!(page.object_count(), 4);
        let mut addresses = Vec::new();
        for _ in 0..4 {
            addresses.push(page.allocate().unwrap() as usize);
        }
        assert!(page.allocate().is_none());
        assert_eq!(page.remaining_capacity(), 0);

        // Objects are distinct, aligned slots inside the mapping.
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 4);
        for address in &addresses {
            assert!(page.contains(*address));
            assert_eq!((address - page.start_address() as usize) % 64, 0);
        }
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut page = Page::map(32, 128, false).unwrap();
        let first = page.allocate().unwrap() as usize;
        for _ in 0..3 {
            page.allocate().unwrap();
        }
        page.free_slot(page.slot_of(first));
        assert_eq!(page.remaining_capacity(), 1);
        assert_eq!(page.allocate().unwrap() as usize, first);
    }

    #[test]
    fn mark_byte_holds_color_and_count() {
        let mut page = Page::map(32, 128, false).unwrap();
        let address = page.allocate().unwrap() as usize;
        let index = page.slot_of(address);
        assert_eq!(page.color(index), Color::White);
        assert_eq!(page.survival_count(index), 1);

        page.set_color(address, Color::Gray);
        assert_eq!(page.color(index), Color::Gray);
        page.set_color(address, Color::Black);
        assert_eq!(page.color(index), Color::Black);
        assert_eq!(page.survival_count(index), 1);

        page.age(index);
        assert_eq!(page.survival_count(index), 2);
        assert_eq!(page.color(index), Color::White);
    }

    #[test]
    fn slot_lookup_floors_inner_addresses() {
        let mut page = Page::map(64, 256, false).unwrap();
        let address = page.allocate().unwrap() as usize;
        assert_eq!(page.slot_of(address + 63), page.slot_of(address));
        assert_eq!(page.slot_address(page.slot_of(address)) as usize, address);
    }
}
