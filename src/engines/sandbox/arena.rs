// Bump allocator over the sandbox's linear memory. Freeing the topmost live
// block rolls the pointer back past every freed block beneath it. A block freed
// below a live one stays as a hole; adjacent holes merge and later allocations
// reuse the first hole that fits before bumping the pointer.

use thiserror::Error;

const ARENA_ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("arena exhausted: need {needed} bytes, capacity {capacity}")]
    Exhausted { needed: usize, capacity: usize },
    #[error("free of unknown pointer {0:#x}")]
    UnknownPointer(u32),
}

#[derive(Debug, Clone, Copy)]
struct Block {
    ptr: usize,
    end: usize,
    freed: bool,
}

#[derive(Debug)]
pub struct MemoryArena {
    base: usize,
    top: usize,
    capacity: usize,
    blocks: Vec<Block>,
}

impl MemoryArena {
    // `base` keeps address 0 out of circulation so a null pointer is never handed out.
    pub fn new(base: usize, capacity: usize) -> Self {
        let base = align_up(base.max(ARENA_ALIGN), ARENA_ALIGN);
        Self { base, top: base, capacity, blocks: Vec::new() }
    }

    pub fn used(&self) -> usize {
        self.top - self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_allocations(&self) -> usize {
        self.blocks.iter().filter(|b| !b.freed).count()
    }

    // Freed bytes below the top that are waiting for reuse.
    pub fn hole_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.freed).map(|b| b.end - b.ptr).sum()
    }

    fn find_hole(&self, size: usize) -> Option<usize> {
        let need = size.max(ARENA_ALIGN);
        self.blocks.iter().position(|b| b.freed && b.end - b.ptr >= need)
    }

    // Bytes the backing memory must grow by before `size` fits, if any.
    pub fn shortfall(&self, size: usize) -> Option<usize> {
        if self.find_hole(size).is_some() {
            return None;
        }
        let end = align_up(self.top, ARENA_ALIGN) + size.max(ARENA_ALIGN);
        end.checked_sub(self.capacity).filter(|n| *n > 0)
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(self.top);
    }

    pub fn allocate(&mut self, size: usize) -> Result<u32, ArenaError> {
        if let Some(index) = self.find_hole(size) {
            let hole = self.blocks[index];
            let end = hole.ptr + size.max(ARENA_ALIGN);
            let rest = align_up(end, ARENA_ALIGN);
            if rest + ARENA_ALIGN <= hole.end {
                self.blocks[index] = Block { ptr: hole.ptr, end, freed: false };
                self.blocks.insert(index + 1, Block { ptr: rest, end: hole.end, freed: true });
            } else {
                self.blocks[index].freed = false;
            }
            return Ok(hole.ptr as u32);
        }

        let ptr = align_up(self.top, ARENA_ALIGN);
        let end = ptr + size.max(ARENA_ALIGN);
        if end > self.capacity || end > u32::MAX as usize {
            return Err(ArenaError::Exhausted { needed: end, capacity: self.capacity });
        }
        self.blocks.push(Block { ptr, end, freed: false });
        self.top = end;
        Ok(ptr as u32)
    }

    pub fn free(&mut self, ptr: u32) -> Result<(), ArenaError> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.ptr == ptr as usize && !b.freed)
            .ok_or(ArenaError::UnknownPointer(ptr))?;
        self.blocks[index].freed = true;

        // Blocks are kept in address order, so neighbours in the list are neighbours in memory.
        if index + 1 < self.blocks.len() && self.blocks[index + 1].freed {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].end = next.end;
        }
        if index > 0 && self.blocks[index - 1].freed {
            let current = self.blocks.remove(index);
            self.blocks[index - 1].end = current.end;
        }

        while self.blocks.last().is_some_and(|b| b.freed) {
            self.blocks.pop();
        }
        self.top = self.blocks.last().map(|b| b.end).unwrap_or(self.base);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
        self.top = self.base;
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_pairs_return_to_baseline() {
        let mut arena = MemoryArena::new(16, 4096);
        let weights = arena.allocate(100).unwrap();
        let baseline = arena.used();

        for _ in 0..5 {
            let input = arena.allocate(16).unwrap();
            let output = arena.allocate(4096 - 512).unwrap();
            arena.free(input).unwrap();
            assert!(arena.used() > baseline);
            arena.free(output).unwrap();
            assert_eq!(arena.used(), baseline);
        }
        assert_eq!(arena.live_allocations(), 1);
        arena.free(weights).unwrap();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_alignment_and_null() {
        let mut arena = MemoryArena::new(0, 1024);
        let a = arena.allocate(3).unwrap();
        let b = arena.allocate(5).unwrap();
        assert_ne!(a, 0);
        assert_eq!(a as usize % ARENA_ALIGN, 0);
        assert_eq!(b as usize % ARENA_ALIGN, 0);
        assert!(b > a);
    }

    #[test]
    fn test_exhaustion_and_shortfall() {
        let mut arena = MemoryArena::new(8, 64);
        assert_eq!(arena.shortfall(32), None);
        assert_eq!(arena.shortfall(100), Some(44));
        assert!(matches!(arena.allocate(100), Err(ArenaError::Exhausted { .. })));
        arena.set_capacity(256);
        assert!(arena.allocate(100).is_ok());
    }

    #[test]
    fn test_hole_below_live_block_is_reused() {
        let mut arena = MemoryArena::new(8, 1 << 16);
        let mut a = arena.allocate(4096).unwrap();
        let mut b = arena.allocate(4096).unwrap();
        let baseline = arena.used();

        for _ in 0..32 {
            arena.free(a).unwrap();
            a = arena.allocate(4096).unwrap();
            arena.free(b).unwrap();
            b = arena.allocate(4096).unwrap();
            assert_eq!(arena.used(), baseline);
        }
        assert_eq!(arena.live_allocations(), 2);
        assert_eq!(arena.hole_bytes(), 0);
    }

    #[test]
    fn test_hole_split_and_merge() {
        let mut arena = MemoryArena::new(8, 1 << 16);
        let big = arena.allocate(1024).unwrap();
        let top = arena.allocate(64).unwrap();
        let baseline = arena.used();
        arena.free(big).unwrap();
        assert_eq!(arena.shortfall(512), None);

        let small = arena.allocate(100).unwrap();
        assert_eq!(small, big);
        assert_eq!(arena.used(), baseline);
        assert!(arena.hole_bytes() > 0);

        let other = arena.allocate(200).unwrap();
        assert!(other > small && other < top);
        arena.free(small).unwrap();
        arena.free(other).unwrap();
        assert_eq!(arena.live_allocations(), 1);
        assert_eq!(arena.allocate(1000).unwrap(), big);

        arena.free(top).unwrap();
        arena.free(big).unwrap();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_unknown_and_double_free() {
        let mut arena = MemoryArena::new(8, 64);
        let p = arena.allocate(8).unwrap();
        assert_eq!(arena.free(999), Err(ArenaError::UnknownPointer(999)));
        arena.free(p).unwrap();
        assert_eq!(arena.free(p), Err(ArenaError::UnknownPointer(p)));
    }
}
