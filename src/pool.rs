//! Descriptor pools
//!
//! A pool hands out fixed-size, hardware-aligned descriptor slots from
//! a growable set of 32-slot blocks. Each block tracks occupancy with
//! one bitmap word. The first block is pinned for the life of the pool
//! so steady-state traffic never churns the platform allocator; later
//! blocks are returned as soon as they drain.
//!
//! Descriptors come back as [`Handle`]s, never as raw pointers. The
//! hardware sees bus addresses; [`Pool::from_bus`] maps a bus address
//! discovered in a done queue back to the owning handle by block range,
//! which doubles as the general-vs-isochronous discriminator (each
//! descriptor kind lives in its own pool).

use crate::{Error, UsbPlatform, MAX_TD_BLOCKS, TDS_PER_BLOCK};
use core::mem::size_of;
use core::ptr::NonNull;

/// A stable reference to one pooled descriptor
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle {
    block: u8,
    slot: u8,
}

struct Block<T, M> {
    mem: NonNull<T>,
    /// Set bits are allocated slots
    bitmap: u32,
    free: u8,
    meta: [M; TDS_PER_BLOCK],
}

pub struct Pool<T, M> {
    blocks: [Option<Block<T, M>>; MAX_TD_BLOCKS],
}

// Safety: descriptor memory is only reachable through handles, and the
// pool is owned by exactly one controller core.
unsafe impl<T, M: Send> Send for Pool<T, M> {}

impl<T, M: Default> Pool<T, M> {
    const EMPTY: Option<Block<T, M>> = None;

    pub const fn new() -> Self {
        Pool {
            blocks: [Self::EMPTY; MAX_TD_BLOCKS],
        }
    }

    fn block_bytes() -> usize {
        TDS_PER_BLOCK * size_of::<T>()
    }

    /// Take one descriptor, growing the pool if every block is full
    ///
    /// Fails with [`Error::NoResources`] only when the block limit is
    /// reached and every slot is taken; it never blocks.
    pub fn alloc<P: UsbPlatform>(&mut self, platform: &mut P) -> Result<Handle, Error> {
        // Existing blocks first; grow only when every one is full.
        let bi = match self
            .blocks
            .iter()
            .position(|b| b.as_ref().map(|b| b.free > 0).unwrap_or(false))
        {
            Some(bi) => bi,
            None => {
                let bi = self
                    .blocks
                    .iter()
                    .position(|b| b.is_none())
                    .ok_or(Error::NoResources)?;
                let mem = platform
                    .alloc_dma(Self::block_bytes(), core::mem::align_of::<T>())
                    .ok_or(Error::NoResources)?;
                unsafe {
                    core::ptr::write_bytes(mem.as_ptr(), 0, Self::block_bytes());
                }
                self.blocks[bi] = Some(Block {
                    mem: mem.cast(),
                    bitmap: 0,
                    free: TDS_PER_BLOCK as u8,
                    meta: core::array::from_fn(|_| M::default()),
                });
                bi
            }
        };

        let block = self.blocks[bi].as_mut().unwrap();
        let slot = block.bitmap.trailing_ones() as usize;
        debug_assert!(slot < TDS_PER_BLOCK);
        block.bitmap |= 1 << slot;
        block.free -= 1;
        unsafe {
            core::ptr::write_bytes(block.mem.as_ptr().add(slot).cast::<u8>(), 0, size_of::<T>());
        }
        block.meta[slot] = M::default();
        Ok(Handle {
            block: bi as u8,
            slot: slot as u8,
        })
    }

    /// Return a descriptor, releasing its block if it was the last
    /// occupant of a non-pinned block
    pub fn dealloc<P: UsbPlatform>(&mut self, platform: &mut P, handle: Handle) {
        let bi = handle.block as usize;
        let release = {
            let block = self.blocks[bi].as_mut().expect("dealloc into a dead block");
            let bit = 1u32 << handle.slot;
            debug_assert!(block.bitmap & bit != 0, "double free");
            block.bitmap &= !bit;
            block.free += 1;
            bi != 0 && block.free as usize == TDS_PER_BLOCK
        };
        if release {
            let block = self.blocks[bi].take().unwrap();
            unsafe {
                platform.release_dma(
                    block.mem.cast(),
                    Self::block_bytes(),
                    core::mem::align_of::<T>(),
                );
            }
        }
    }

    pub fn get(&self, handle: Handle) -> &T {
        let block = self.blocks[handle.block as usize]
            .as_ref()
            .expect("handle into a dead block");
        debug_assert!(block.bitmap & (1 << handle.slot) != 0);
        unsafe { &*block.mem.as_ptr().add(handle.slot as usize) }
    }

    pub fn meta(&self, handle: Handle) -> &M {
        let block = self.blocks[handle.block as usize].as_ref().unwrap();
        &block.meta[handle.slot as usize]
    }

    pub fn meta_mut(&mut self, handle: Handle) -> &mut M {
        let block = self.blocks[handle.block as usize].as_mut().unwrap();
        &mut block.meta[handle.slot as usize]
    }

    /// The bus address the hardware uses for this descriptor
    pub fn bus_addr<P: UsbPlatform>(&self, platform: &P, handle: Handle) -> u32 {
        let block = self.blocks[handle.block as usize].as_ref().unwrap();
        let ptr = unsafe { block.mem.as_ptr().add(handle.slot as usize) };
        platform.bus_address(ptr.cast())
    }

    /// Map a bus address back to the allocated descriptor it names
    pub fn from_bus<P: UsbPlatform>(&self, platform: &P, bus: u32) -> Option<Handle> {
        if bus == 0 {
            return None;
        }
        for (bi, entry) in self.blocks.iter().enumerate() {
            let block = match entry {
                Some(block) => block,
                None => continue,
            };
            let base = platform.bus_address(block.mem.as_ptr().cast());
            let span = Self::block_bytes() as u32;
            if bus < base || bus >= base + span {
                continue;
            }
            let slot = (bus - base) as usize / size_of::<T>();
            if block.bitmap & (1 << slot) != 0 {
                return Some(Handle {
                    block: bi as u8,
                    slot: slot as u8,
                });
            }
            return None;
        }
        None
    }

    /// Number of descriptors currently allocated
    pub fn live(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .map(|b| TDS_PER_BLOCK - b.free as usize)
            .sum()
    }

    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    /// Return every block to the platform; only valid at teardown
    pub fn release_all<P: UsbPlatform>(&mut self, platform: &mut P) {
        for entry in self.blocks.iter_mut() {
            if let Some(block) = entry.take() {
                unsafe {
                    platform.release_dma(
                        block.mem.cast(),
                        Self::block_bytes(),
                        core::mem::align_of::<T>(),
                    );
                }
            }
        }
    }
}
