//! Separate-address-space heap allocator.
//!
//! Produces guest pointers inside a fixed `[base, end)` region so guest
//! malloc/realloc/free can be serviced by the host without the guest
//! walking its own free lists. Chunks form a doubly linked list over a
//! slab; links are slab indices, the base chunk is index 0.

use crate::page::PAGE_MASK;

/// Guest pointer type handed out by the arena.
pub type ArenaPointer = u32;

/// Allocation alignment and minimum size.
pub const ARENA_ALIGNMENT: u32 = 8;

const NONE: u32 = u32::MAX;

/// Result of a realloc: the (possibly new) pointer and, when data moved,
/// the number of bytes the caller has to copy from the old allocation.
pub type ReallocResult = (ArenaPointer, u32);

type UnknownFreeFn = Box<dyn FnMut(ArenaPointer) -> i32>;
type UnknownReallocFn = Box<dyn FnMut(ArenaPointer, u32) -> ReallocResult>;

#[derive(Clone, Copy, Debug)]
struct Chunk {
    next: u32,
    prev: u32,
    size: u32,
    free: bool,
    data: ArenaPointer,
}

/// First-fit allocator over a guest address range.
///
/// Neighboring chunks are contiguous (`data + size == next.data`) and no
/// two adjacent free chunks exist; frees coalesce both directions. The
/// sum of all chunk sizes always equals `end - base`.
pub struct Arena {
    chunks: Vec<Chunk>,
    free_slots: Vec<u32>,
    base: ArenaPointer,
    end: ArenaPointer,
    unknown_free: Option<UnknownFreeFn>,
    unknown_realloc: Option<UnknownReallocFn>,
}

impl Arena {
    /// Create an arena over `[base, end)`.
    #[must_use]
    pub fn new(base: ArenaPointer, end: ArenaPointer) -> Self {
        let base_chunk = Chunk {
            next: NONE,
            prev: NONE,
            size: end - base,
            free: true,
            data: base,
        };
        Self {
            chunks: vec![base_chunk],
            free_slots: Vec::new(),
            base,
            end,
            unknown_free: None,
            unknown_realloc: None,
        }
    }

    #[must_use]
    pub fn base(&self) -> ArenaPointer {
        self.base
    }

    #[must_use]
    pub fn end(&self) -> ArenaPointer {
        self.end
    }

    /// Install a handler for frees of pointers the arena does not know.
    pub fn on_unknown_free(&mut self, func: UnknownFreeFn) {
        self.unknown_free = Some(func);
    }

    /// Install a handler for reallocs of pointers the arena does not know.
    pub fn on_unknown_realloc(&mut self, func: UnknownReallocFn) {
        self.unknown_realloc = Some(func);
    }

    /// Round up to the allocation alignment.
    #[must_use]
    pub const fn word_align(size: u32) -> u32 {
        (size + (ARENA_ALIGNMENT - 1)) & !(ARENA_ALIGNMENT - 1)
    }

    /// Align and clamp to the minimum allocation size.
    #[must_use]
    pub const fn fixup_size(size: u32) -> u32 {
        let aligned = Self::word_align(size);
        if aligned < ARENA_ALIGNMENT {
            ARENA_ALIGNMENT
        } else {
            aligned
        }
    }

    fn new_chunk(&mut self, chunk: Chunk) -> u32 {
        if let Some(slot) = self.free_slots.pop() {
            self.chunks[slot as usize] = chunk;
            slot
        } else {
            self.chunks.push(chunk);
            (self.chunks.len() - 1) as u32
        }
    }

    fn release_chunk(&mut self, idx: u32) {
        self.free_slots.push(idx);
    }

    /// Find the used chunk whose data pointer equals `ptr`.
    fn find(&self, ptr: ArenaPointer) -> Option<u32> {
        let mut idx = 0;
        loop {
            let ch = &self.chunks[idx as usize];
            if !ch.free && ch.data == ptr {
                return Some(idx);
            }
            if ch.next == NONE {
                return None;
            }
            idx = ch.next;
        }
    }

    /// Find the first free chunk of at least `size` bytes.
    fn find_free(&self, size: u32) -> Option<u32> {
        let mut idx = 0;
        loop {
            let ch = &self.chunks[idx as usize];
            if ch.free && ch.size >= size {
                return Some(idx);
            }
            if ch.next == NONE {
                return None;
            }
            idx = ch.next;
        }
    }

    /// Split `idx`, leaving it `size` bytes and a free remainder after it.
    fn split_next(&mut self, idx: u32, size: u32) {
        let (old_next, old_size, data) = {
            let ch = &self.chunks[idx as usize];
            (ch.next, ch.size, ch.data)
        };
        let remainder = Chunk {
            next: old_next,
            prev: idx,
            size: old_size - size,
            free: true,
            data: data + size,
        };
        let new_idx = self.new_chunk(remainder);
        if old_next != NONE {
            self.chunks[old_next as usize].prev = new_idx;
        }
        let ch = &mut self.chunks[idx as usize];
        ch.next = new_idx;
        ch.size = size;
    }

    /// Merge the chunk after `idx` into `idx`.
    fn merge_next(&mut self, idx: u32) {
        let next_idx = self.chunks[idx as usize].next;
        let (next_next, next_size) = {
            let n = &self.chunks[next_idx as usize];
            (n.next, n.size)
        };
        let ch = &mut self.chunks[idx as usize];
        ch.size += next_size;
        ch.next = next_next;
        if next_next != NONE {
            self.chunks[next_next as usize].prev = idx;
        }
        self.release_chunk(next_idx);
    }

    /// Grow `idx` to `newlen` by eating from the free chunk after it,
    /// if that chunk is large enough.
    fn subsume_next(&mut self, idx: u32, newlen: u32) {
        let next_idx = self.chunks[idx as usize].next;
        if next_idx == NONE {
            return;
        }
        let cur_size = self.chunks[idx as usize].size;
        let next_size = self.chunks[next_idx as usize].size;
        if cur_size + next_size < newlen {
            return;
        }

        let subsume = newlen - cur_size;
        {
            let n = &mut self.chunks[next_idx as usize];
            n.size -= subsume;
            n.data += subsume;
        }
        self.chunks[idx as usize].size = newlen;

        // Drop the next chunk entirely if we ate all of it
        if self.chunks[next_idx as usize].size == 0 {
            let next_next = self.chunks[next_idx as usize].next;
            self.chunks[idx as usize].next = next_next;
            if next_next != NONE {
                self.chunks[next_next as usize].prev = idx;
            }
            self.release_chunk(next_idx);
        }
    }

    fn internal_free(&mut self, mut idx: u32) {
        self.chunks[idx as usize].free = true;
        // merge chunks ahead and behind us
        let next = self.chunks[idx as usize].next;
        if next != NONE && self.chunks[next as usize].free {
            self.merge_next(idx);
        }
        let prev = self.chunks[idx as usize].prev;
        if prev != NONE && self.chunks[prev as usize].free {
            idx = prev;
            self.merge_next(idx);
        }
    }

    /// Allocate `size` bytes, 8-byte aligned. Returns 0 when out of space.
    pub fn malloc(&mut self, size: u32) -> ArenaPointer {
        let length = Self::fixup_size(size);
        match self.find_free(length) {
            Some(idx) => {
                self.split_next(idx, length);
                self.chunks[idx as usize].free = false;
                self.chunks[idx as usize].data
            }
            None => 0,
        }
    }

    /// Allocate memory guaranteed not to straddle a page boundary.
    ///
    /// A single page is fully sequential in host memory, so allocations
    /// confined to one page can be memory-mapped outside of emulation.
    pub fn seq_alloc_aligned(&mut self, size: u32, alignment: u32) -> ArenaPointer {
        debug_assert!(alignment != 0);
        // Only the natural 8-byte alignment is honored for now.
        let _ = alignment;

        let objectsize = Self::fixup_size(size);
        let oversized = Self::fixup_size(size * 2);

        // Find memory that can always cover the object sequentially
        let Some(idx) = self.find_free(oversized) else {
            return 0;
        };

        let data = self.chunks[idx as usize].data;
        let first_page = data as u64 & !PAGE_MASK;
        let last_page = (data + size) as u64 & !PAGE_MASK;
        if first_page != last_page {
            // Split at the second page boundary; the part after it holds
            // the object and the part before it goes back to the free list
            let boundary = ((data + size) as u64 & !PAGE_MASK) as u32;
            self.split_next(idx, boundary - data);

            let final_idx = self.chunks[idx as usize].next;
            self.chunks[final_idx as usize].free = false;
            self.internal_free(idx);

            self.split_next(final_idx, objectsize);
            self.chunks[final_idx as usize].data
        } else {
            self.split_next(idx, objectsize);
            self.chunks[idx as usize].free = false;
            data
        }
    }

    /// Reallocate. Returns the new pointer and, when the allocation
    /// grew, the old length so the caller can copy bytes over; the old
    /// length is 0 when the existing chunk already satisfied the request.
    pub fn realloc(&mut self, ptr: ArenaPointer, newsize: u32) -> ReallocResult {
        if ptr == 0 {
            return (self.malloc(newsize), 0);
        }

        let Some(idx) = self.find(ptr) else {
            if let Some(mut handler) = self.unknown_realloc.take() {
                let result = handler(ptr, newsize);
                self.unknown_realloc = Some(handler);
                return result;
            }
            return (0, 0);
        };

        let newsize = Self::fixup_size(newsize);
        if self.chunks[idx as usize].size >= newsize {
            return (ptr, 0);
        }

        // We return the old length to aid the copy
        let old_len = self.chunks[idx as usize].size;
        // Try to eat from the next chunk
        let next = self.chunks[idx as usize].next;
        if next != NONE && self.chunks[next as usize].free {
            self.subsume_next(idx, newsize);
            if self.chunks[idx as usize].size >= newsize {
                return (ptr, old_len);
            }
        }

        // Fall back to malloc, then free the old chunk
        let new_ptr = self.malloc(newsize);
        if new_ptr != 0 {
            self.internal_free(idx);
            return (new_ptr, old_len);
        }

        (0, 0)
    }

    /// Size of the allocation at `ptr`, or 0 if unknown.
    #[must_use]
    pub fn size(&self, ptr: ArenaPointer, allow_free: bool) -> u32 {
        let mut idx = 0;
        loop {
            let ch = &self.chunks[idx as usize];
            if ch.data == ptr && (!ch.free || allow_free) {
                return ch.size;
            }
            if ch.next == NONE {
                return 0;
            }
            idx = ch.next;
        }
    }

    /// Free the allocation at `ptr`. Returns 0 on success, or the
    /// unknown-free handler's result (default -1) otherwise.
    pub fn free(&mut self, ptr: ArenaPointer) -> i32 {
        match self.find(ptr) {
            Some(idx) => {
                self.internal_free(idx);
                0
            }
            None => {
                if let Some(mut handler) = self.unknown_free.take() {
                    let result = handler(ptr);
                    self.unknown_free = Some(handler);
                    result
                } else {
                    -1
                }
            }
        }
    }

    fn fold_chunks<F: FnMut(&Chunk)>(&self, mut f: F) {
        let mut idx = 0;
        loop {
            let ch = &self.chunks[idx as usize];
            f(ch);
            if ch.next == NONE {
                break;
            }
            idx = ch.next;
        }
    }

    /// Total bytes in free chunks.
    #[must_use]
    pub fn bytes_free(&self) -> u32 {
        let mut total = 0;
        self.fold_chunks(|ch| {
            if ch.free {
                total += ch.size;
            }
        });
        total
    }

    /// Total bytes in used chunks.
    #[must_use]
    pub fn bytes_used(&self) -> u32 {
        let mut total = 0;
        self.fold_chunks(|ch| {
            if !ch.free {
                total += ch.size;
            }
        });
        total
    }

    /// Number of live chunks in the list.
    #[must_use]
    pub fn chunks_used(&self) -> usize {
        let mut count = 0;
        self.fold_chunks(|_| count += 1);
        count
    }

    /// Copy the chunk list into a fresh arena (used by fork).
    #[must_use]
    pub fn transfer(&self) -> Self {
        let mut dest = Self::new(self.base, self.end);
        dest.chunks.clear();
        let mut idx = 0;
        let mut prev = NONE;
        loop {
            let ch = self.chunks[idx as usize];
            let new_idx = dest.chunks.len() as u32;
            dest.chunks.push(Chunk {
                next: NONE,
                prev,
                ..ch
            });
            if prev != NONE {
                dest.chunks[prev as usize].next = new_idx;
            }
            prev = new_idx;
            if ch.next == NONE {
                break;
            }
            idx = ch.next;
        }
        dest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x4000_0000;
    const END: u32 = 0x4010_0000;

    fn arena() -> Arena {
        Arena::new(BASE, END)
    }

    #[test]
    fn test_malloc_alignment() {
        let mut a = arena();
        for size in [1, 7, 8, 9, 100, 4095] {
            let p = a.malloc(size);
            assert_ne!(p, 0);
            assert_eq!(p % ARENA_ALIGNMENT, 0, "pointer {p:#x} unaligned");
        }
    }

    #[test]
    fn test_accounting_invariant() {
        let mut a = arena();
        let total = END - BASE;
        assert_eq!(a.bytes_free(), total);

        let mut ptrs = Vec::new();
        for size in [16, 64, 24, 8, 4096, 17] {
            ptrs.push(a.malloc(size));
            assert_eq!(a.bytes_used() + a.bytes_free(), total);
        }
        for p in ptrs {
            assert_eq!(a.free(p), 0);
            assert_eq!(a.bytes_used() + a.bytes_free(), total);
        }
        assert_eq!(a.bytes_used(), 0);
        // Everything coalesced back into the base chunk
        assert_eq!(a.chunks_used(), 1);
    }

    #[test]
    fn test_free_reuses_memory() {
        let mut a = arena();
        let p1 = a.malloc(64);
        assert_eq!(a.free(p1), 0);
        let p2 = a.malloc(64);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_double_free_reports_unknown() {
        let mut a = arena();
        let p = a.malloc(32);
        assert_eq!(a.free(p), 0);
        assert_eq!(a.free(p), -1);
        assert_eq!(a.free(0x1234), -1);
    }

    #[test]
    fn test_unknown_free_callback() {
        let mut a = arena();
        a.on_unknown_free(Box::new(|_| -22));
        assert_eq!(a.free(0x9999), -22);
    }

    #[test]
    fn test_realloc_grow_in_place() {
        let mut a = arena();
        let p = a.malloc(16);
        // No intervening allocation: the next chunk is free, so growth
        // happens in place and the pointer is stable.
        let (q, old_len) = a.realloc(p, 24);
        assert_eq!(q, p);
        assert_eq!(old_len, 16);
        assert_eq!(a.size(q, false), 24);
    }

    #[test]
    fn test_realloc_move_reports_old_len() {
        let mut a = arena();
        let p = a.malloc(16);
        let _wall = a.malloc(16);
        let (q, old_len) = a.realloc(p, 256);
        assert_ne!(q, p);
        assert_eq!(old_len, 16);
    }

    #[test]
    fn test_realloc_null_is_malloc() {
        let mut a = arena();
        let (p, old_len) = a.realloc(0, 40);
        assert_ne!(p, 0);
        assert_eq!(old_len, 0);
        assert_eq!(a.size(p, false), 40);
    }

    #[test]
    fn test_size_queries() {
        let mut a = arena();
        let p = a.malloc(100);
        assert_eq!(a.size(p, false), Arena::fixup_size(100));
        a.free(p);
        assert_eq!(a.size(p, false), 0);
    }

    #[test]
    fn test_seq_alloc_does_not_straddle_page() {
        let mut a = arena();
        // Push the free cursor close to a page boundary
        let _pad = a.malloc(4096 - 24);
        let p = a.seq_alloc_aligned(64, 8);
        assert_ne!(p, 0);
        let first_page = p as u64 & !PAGE_MASK;
        let last_page = (p + 64) as u64 & !PAGE_MASK;
        assert_eq!(first_page, last_page);
    }

    #[test]
    fn test_transfer_copies_layout() {
        let mut a = arena();
        let p1 = a.malloc(32);
        let _p2 = a.malloc(64);
        a.free(p1);

        let b = a.transfer();
        assert_eq!(b.bytes_used(), a.bytes_used());
        assert_eq!(b.bytes_free(), a.bytes_free());
        assert_eq!(b.chunks_used(), a.chunks_used());
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut a = Arena::new(0x1000, 0x1100);
        assert_eq!(a.malloc(0x200), 0);
        let p = a.malloc(0x100);
        assert_ne!(p, 0);
        assert_eq!(a.malloc(8), 0);
    }
}
