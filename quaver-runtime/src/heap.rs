//! Size-classed paged allocator with mark-and-sweep collection.
//!
//! The heap keeps two generations, each partitioned into four size classes.
//! Allocation always lands in the young generation (code pages aside);
//! survivors of enough collections are copied into the mature generation.
//! Collection is stop-the-world: marking starts from the permanent root set
//! plus every pointer-tagged slot of the registered managed stacks.

use std::collections::BTreeMap;
use std::ops::Bound;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::RuntimeError;
use crate::object::{ObjectHeader, HEADER_SIZE};
use crate::page::{Color, Page};
use crate::slot::{Slot, SlotType};

pub const SMALL_OBJECT_SIZE: usize = 256;
pub const MEDIUM_OBJECT_SIZE: usize = 2048;
pub const LARGE_OBJECT_SIZE: usize = 32 * 1024;
pub const PAGE_SIZE: usize = 256 * 1024;

/// Collections an object must survive before promotion to the mature
/// generation.
const MATURE_AGE: u8 = 2;

const NUM_CLASSES: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SizeClass {
    Small = 0,
    Medium = 1,
    Large = 2,
    Oversize = 3,
}

impl SizeClass {
    fn of_size(bytes: usize) -> Self {
        if bytes <= SMALL_OBJECT_SIZE {
            Self::Small
        } else if bytes <= MEDIUM_OBJECT_SIZE {
            Self::Medium
        } else if bytes <= LARGE_OBJECT_SIZE {
            Self::Large
        } else {
            Self::Oversize
        }
    }

    /// Fixed per-object allocation size for the class; oversize objects get
    /// dedicated pages instead.
    fn object_size(self) -> usize {
        match self {
            Self::Small => SMALL_OBJECT_SIZE,
            Self::Medium => MEDIUM_OBJECT_SIZE,
            Self::Large => LARGE_OBJECT_SIZE,
            Self::Oversize => unreachable!("oversize objects have no fixed class size"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Generation {
    Young,
    Mature,
}

/// Handle to an executable code page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CodePage(usize);

/// The process heap.
pub struct Heap {
    /// Backing store for every page; indices are stable for the lifetime of
    /// the heap so `page_ends` can refer to them.
    pages: Vec<Page>,
    young: [Vec<usize>; NUM_CLASSES],
    mature: [Vec<usize>; NUM_CLASSES],
    code_pages: Vec<usize>,
    /// First byte past the end of each page, mapping an arbitrary address
    /// back to the page containing it.
    page_ends: BTreeMap<usize, usize>,
    /// Permanently live object addresses; scanning starts here.
    root_set: FxHashSet<usize>,
    /// Registered managed stacks, scanned as GC roots.
    stacks: Vec<(*mut Slot, usize)>,
    young_bytes: usize,
    collection_threshold: usize,
    collection_count: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            young: Default::default(),
            mature: Default::default(),
            code_pages: Vec::new(),
            page_ends: BTreeMap::new(),
            root_set: FxHashSet::default(),
            stacks: Vec::new(),
            young_bytes: 0,
            collection_threshold: 16 * PAGE_SIZE,
            collection_count: 0,
        }
    }

    /// Allocate `bytes` of object storage from the young generation. The
    /// memory is not initialized. Triggers a collection first when the
    /// young footprint has crossed the threshold.
    pub fn allocate_new(&mut self, bytes: usize) -> Result<*mut u8, RuntimeError> {
        debug_assert!(bytes >= HEADER_SIZE);
        let class = SizeClass::of_size(bytes);
        if self.young_bytes + PAGE_SIZE > self.collection_threshold {
            self.collect();
        }
        self.allocate_in(bytes, class, Generation::Young)
    }

    /// Add `object` to the permanent roots.
    pub fn add_to_root_set(&mut self, object: Slot) {
        debug_assert_eq!(object.slot_type(), SlotType::Object);
        self.root_set.insert(object.as_object() as usize);
    }

    pub fn remove_from_root_set(&mut self, object: Slot) {
        debug_assert_eq!(object.slot_type(), SlotType::Object);
        self.root_set.remove(&(object.as_object() as usize));
    }

    /// Register a managed stack so collection can scan it for roots.
    pub fn register_stack(&mut self, base: *mut Slot, len: usize) {
        self.stacks.push((base, len));
    }

    pub fn unregister_stack(&mut self, base: *mut Slot) {
        self.stacks.retain(|(b, _)| *b != base);
    }

    /// Find the live object containing `address`, or `None` when the
    /// address falls outside every page or inside free space.
    pub fn containing_object(&self, address: usize) -> Option<*mut u8> {
        let index = self.page_index_of(address)?;
        let page = &self.pages[index];
        if page.is_executable() {
            return None;
        }
        let slot = page.slot_of(address);
        if page.is_allocated(slot) {
            Some(page.slot_address(slot))
        } else {
            None
        }
    }

    /// Number of collections run so far.
    pub fn collection_count(&self) -> u64 {
        self.collection_count
    }

    /// Mark from the root set and registered stacks, sweep both
    /// generations, and promote old-enough young survivors.
    pub fn collect(&mut self) {
        self.collection_count += 1;
        log::debug!(
            "collection {}: {} young bytes before",
            self.collection_count,
            self.young_bytes
        );

        self.mark();
        self.sweep_mature();
        let forwarding = self.sweep_young_and_promote();
        if !forwarding.is_empty() {
            self.rewrite_promoted(&forwarding);
        }

        self.young_bytes = self
            .young
            .iter()
            .flatten()
            .map(|&i| self.pages[i].allocated_objects() * self.pages[i].object_size())
            .sum();
        log::debug!("collection done: {} young bytes after", self.young_bytes);
    }

    /// Map an executable page of at least `min_bytes`.
    pub fn allocate_code_page(&mut self, min_bytes: usize) -> Result<CodePage, RuntimeError> {
        let total = min_bytes.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let page = Page::map(total, total, true)?;
        let index = self.push_page(page);
        self.code_pages.push(index);
        Ok(CodePage(index))
    }

    pub fn code_page_ptr(&self, handle: CodePage) -> *mut u8 {
        self.pages[handle.0].start_address()
    }

    pub fn code_page_capacity(&self, handle: CodePage) -> usize {
        self.pages[handle.0].end_address() - self.pages[handle.0].start_address() as usize
    }

    /// Flip a code page between write-allowed and execute-allowed.
    pub fn protect_code_page(&self, handle: CodePage, execute: bool) -> Result<(), RuntimeError> {
        self.pages[handle.0].protect_for_execution(execute)
    }

    fn push_page(&mut self, page: Page) -> usize {
        let index = self.pages.len();
        self.page_ends.insert(page.end_address(), index);
        self.pages.push(page);
        index
    }

    fn page_index_of(&self, address: usize) -> Option<usize> {
        let (_, &index) = self
            .page_ends
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()?;
        if self.pages[index].contains(address) {
            Some(index)
        } else {
            None
        }
    }

    fn allocate_in(
        &mut self,
        bytes: usize,
        class: SizeClass,
        generation: Generation,
    ) -> Result<*mut u8, RuntimeError> {
        if class == SizeClass::Oversize {
            let total = bytes.next_multiple_of(PAGE_SIZE);
            let mut page = Page::map(total, total, false)?;
            let address = page.allocate().expect("fresh oversize page is full");
            let index = self.push_page(page);
            self.generation_list_mut(generation, class).push(index);
            if generation == Generation::Young {
                self.young_bytes += total;
            }
            return Ok(address);
        }

        let available = self
            .generation_list(generation, class)
            .iter()
            .rev()
            .copied()
            .find(|&index| self.pages[index].remaining_capacity() > 0);
        if let Some(index) = available {
            let address = self.pages[index].allocate().expect("capacity was nonzero");
            if generation == Generation::Young {
                self.young_bytes += class.object_size();
            }
            return Ok(address);
        }

        let page = Page::map(class.object_size(), PAGE_SIZE, false)?;
        let index = self.push_page(page);
        self.generation_list_mut(generation, class).push(index);
        let address = self.pages[index].allocate().expect("fresh page is full");
        if generation == Generation::Young {
            self.young_bytes += class.object_size();
        }
        Ok(address)
    }

    fn generation_list(&self, generation: Generation, class: SizeClass) -> &Vec<usize> {
        match generation {
            Generation::Young => &self.young[class as usize],
            Generation::Mature => &self.mature[class as usize],
        }
    }

    fn generation_list_mut(&mut self, generation: Generation, class: SizeClass) -> &mut Vec<usize> {
        match generation {
            Generation::Young => &mut self.young[class as usize],
            Generation::Mature => &mut self.mature[class as usize],
        }
    }

    /// Tri-color mark. Gray objects sit on the worklist; an object is
    /// blackened once its body has been scanned.
    fn mark(&mut self) {
        let mut worklist: Vec<usize> = Vec::new();

        let roots: Vec<usize> = self.root_set.iter().copied().collect();
        for root in roots {
            self.mark_address(root, &mut worklist);
        }
        let stacks = self.stacks.clone();
        for (base, len) in stacks {
            let slots = unsafe { core::slice::from_raw_parts(base, len) };
            for slot in slots {
                if slot.is_object() {
                    self.mark_address(slot.as_object() as usize, &mut worklist);
                }
            }
        }

        while let Some(address) = worklist.pop() {
            let index = self
                .page_index_of(address)
                .expect("gray object lost its page");
            self.pages[index].set_color(address, Color::Black);

            let header = unsafe { ObjectHeader::from_address(address as *mut u8) };
            let body = unsafe { header.body() };
            for slot in body {
                if slot.is_object() {
                    self.mark_address(slot.as_object() as usize, &mut worklist);
                }
            }
        }
    }

    fn mark_address(&mut self, address: usize, worklist: &mut Vec<usize>) {
        let Some(object) = self.containing_object(address) else {
            return;
        };
        let start = object as usize;
        let index = self.page_index_of(start).expect("object lost its page");
        let slot = self.pages[index].slot_of(start);
        if self.pages[index].color(slot) == Color::White {
            self.pages[index].set_color(start, Color::Gray);
            worklist.push(start);
        }
    }

    fn sweep_mature(&mut self) {
        for list in &self.mature {
            for &index in list {
                let page = &mut self.pages[index];
                for slot in 0..page.object_count() {
                    if !page.is_allocated(slot) {
                        continue;
                    }
                    if page.color(slot) == Color::White {
                        page.free_slot(slot);
                    } else {
                        page.age(slot);
                    }
                }
            }
        }
    }

    /// Sweep young pages, copying survivors that have reached `MATURE_AGE`
    /// into the mature generation. Returns the forwarding map of moved
    /// object starts.
    fn sweep_young_and_promote(&mut self) -> FxHashMap<usize, usize> {
        let mut forwarding = FxHashMap::default();

        for class_index in 0..NUM_CLASSES {
            let page_list = self.young[class_index].clone();
            for index in page_list {
                for slot in 0..self.pages[index].object_count() {
                    if !self.pages[index].is_allocated(slot) {
                        continue;
                    }
                    if self.pages[index].color(slot) == Color::White {
                        self.pages[index].free_slot(slot);
                        continue;
                    }
                    self.pages[index].age(slot);
                    if self.pages[index].survival_count(slot) <= MATURE_AGE {
                        continue;
                    }

                    let old = self.pages[index].slot_address(slot) as usize;
                    let size = unsafe { ObjectHeader::from_address(old as *mut u8) }
                        .size_in_bytes as usize;
                    let class = SizeClass::of_size(size);
                    let new = self
                        .allocate_in(size, class, Generation::Mature)
                        .expect("mature promotion allocation failed");
                    unsafe {
                        core::ptr::copy_nonoverlapping(old as *const u8, new, size);
                    }
                    self.pages[index].free_slot(slot);
                    forwarding.insert(old, new as usize);
                }
            }
        }

        forwarding
    }

    /// Rewrite every reference to a promoted object: permanent roots,
    /// registered stacks, and the bodies of all live objects.
    fn rewrite_promoted(&mut self, forwarding: &FxHashMap<usize, usize>) {
        let rewrite = |slot: &mut Slot| {
            if !slot.is_object() {
                return;
            }
            let address = slot.as_object() as usize;
            if let Some(&new) = forwarding.get(&address) {
                *slot = Slot::from_object(new as *const u8);
            }
        };

        self.root_set = self
            .root_set
            .iter()
            .map(|address| *forwarding.get(address).unwrap_or(address))
            .collect();

        for &(base, len) in &self.stacks {
            let slots = unsafe { core::slice::from_raw_parts_mut(base, len) };
            for slot in slots {
                rewrite(slot);
            }
        }

        for list in self.young.iter().chain(self.mature.iter()) {
            for &index in list {
                let page = &self.pages[index];
                for slot_index in 0..page.object_count() {
                    if !page.is_allocated(slot_index) {
                        continue;
                    }
                    let header =
                        unsafe { ObjectHeader::from_address(page.slot_address(slot_index)) };
                    for slot in unsafe { header.body_mut() } {
                        rewrite(slot);
                    }
                }
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;

    fn make_object(heap: &mut Heap, body_slots: usize) -> *mut u8 {
        let size = HEADER_SIZE + body_slots * crate::slot::SLOT_SIZE;
        let address = heap.allocate_new(size).unwrap();
        let header = unsafe { ObjectHeader::from_address(address) };
        header.class_name_hash = 0;
        header.size_in_bytes = size as i32;
        header.flags = 0;
        for slot in unsafe { header.body_mut() } {
            *slot = Slot::nil();
        }
        address
    }

    #[test]
    fn size_classes() {
        assert_eq!(SizeClass::of_size(16), SizeClass::Small);
        assert_eq!(SizeClass::of_size(256), SizeClass::Small);
        assert_eq!(SizeClass::of_size(257), SizeClass::Medium);
        assert_eq!(SizeClass::of_size(2048), SizeClass::Medium);
        assert_eq!(SizeClass::of_size(2049), SizeClass::Large);
        assert_eq!(SizeClass::of_size(32 * 1024), SizeClass::Large);
        assert_eq!(SizeClass::of_size(32 * 1024 + 1), SizeClass::Oversize);
    }

    #[test]
    fn containing_object_finds_inner_addresses() {
        let mut heap = Heap::new();
        let object = make_object(&mut heap, 4) as usize;
        assert_eq!(heap.containing_object(object), Some(object as *mut u8));
        assert_eq!(heap.containing_object(object + 17), Some(object as *mut u8));
        assert_eq!(heap.containing_object(0x10), None);
    }

    #[test]
    fn containing_object_is_none_for_free_space() {
        let mut heap = Heap::new();
        let object = make_object(&mut heap, 2) as usize;
        // An address in the same page but in a slot never allocated.
        let next_slot = object + SMALL_OBJECT_SIZE;
        assert_eq!(heap.containing_object(next_slot), None);
    }

    #[test]
    fn collection_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let live = make_object(&mut heap, 2) as usize;
        let dead = make_object(&mut heap, 2) as usize;
        heap.add_to_root_set(Slot::from_object(live as *const u8));

        heap.collect();

        assert_eq!(heap.containing_object(live), Some(live as *mut u8));
        assert_eq!(heap.containing_object(dead), None);
    }

    #[test]
    fn marking_traces_object_bodies() {
        let mut heap = Heap::new();
        let root = make_object(&mut heap, 2);
        let child = make_object(&mut heap, 1) as usize;
        let header = unsafe { ObjectHeader::from_address(root) };
        (unsafe { header.body_mut() })[0] = Slot::from_object(child as *const u8);
        heap.add_to_root_set(Slot::from_object(root as *const u8));

        heap.collect();

        assert_eq!(heap.containing_object(child), Some(child as *mut u8));
    }

    #[test]
    fn stack_slots_keep_objects_alive() {
        let mut heap = Heap::new();
        let object = make_object(&mut heap, 1) as usize;
        let mut stack = vec![Slot::nil(); 8];
        stack[3] = Slot::from_object(object as *const u8);
        heap.register_stack(stack.as_mut_ptr(), stack.len());

        heap.collect();
        assert_eq!(heap.containing_object(object), Some(object as *mut u8));

        heap.unregister_stack(stack.as_mut_ptr());
        heap.collect();
        assert_eq!(heap.containing_object(object), None);
    }

    #[test]
    fn survivors_promote_and_references_follow() {
        let mut heap = Heap::new();
        let root = make_object(&mut heap, 1);
        let child = make_object(&mut heap, 0) as usize;
        (unsafe { ObjectHeader::from_address(root).body_mut() })[0] =
            Slot::from_object(child as *const u8);
        heap.add_to_root_set(Slot::from_object(root as *const u8));

        // Survive MATURE_AGE collections, then one more to promote.
        for _ in 0..=MATURE_AGE {
            heap.collect();
        }

        // Both objects moved; the root set and the root's body were
        // rewritten to the new addresses.
        let new_root = *heap.root_set.iter().next().unwrap();
        assert_ne!(new_root, root as usize);
        let body = unsafe { ObjectHeader::from_address(new_root as *mut u8).body() };
        let new_child = body[0].as_object() as usize;
        assert_ne!(new_child, child);
        assert_eq!(heap.containing_object(new_child), Some(new_child as *mut u8));
        assert_eq!(heap.containing_object(child), None);
    }

    #[test]
    fn oversize_objects_get_dedicated_pages() {
        let mut heap = Heap::new();
        let big = make_object(&mut heap, (LARGE_OBJECT_SIZE / 8) + 8) as usize;
        assert_eq!(heap.containing_object(big), Some(big as *mut u8));
    }

    #[test]
    fn code_pages_are_not_collected() {
        let mut heap = Heap::new();
        let code = heap.allocate_code_page(64).unwrap();
        let ptr = heap.code_page_ptr(code);
        assert!(heap.code_page_capacity(code) >= PAGE_SIZE);
        heap.collect();
        assert_eq!(heap.code_page_ptr(code), ptr);
        // Code addresses never resolve to collected objects.
        assert_eq!(heap.containing_object(ptr as usize), None);
    }
}
