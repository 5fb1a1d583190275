//! Test doubles: an arena-backed platform and a tiny hardware model
//!
//! The platform keeps all "DMA" memory inside one arena so CPU
//! pointers translate to stable 32-bit bus addresses, and `normalize`
//! really bounces caller buffers, exercising the mirror bookkeeping.
//! The register file is plain RAM; write-one-to-clear semantics are
//! approximated by the helpers clearing the status word after an
//! [`Core::isr`] pass.

use crate::directory::pipe_key;
use crate::host::Core;
use crate::ral::Interrupts;
use crate::td::cc;
use crate::{ed, UsbPlatform};
use core::ptr::NonNull;
use std::boxed::Box;
use std::vec;
use std::vec::Vec;

const ARENA_BYTES: usize = 256 * 1024;
/// Bus address of the arena's first (page-aligned) byte
const BUS_BASE: u32 = 0x4000;

pub(crate) struct MockPlatform {
    arena: Box<[u8]>,
    /// Offset of the aligned arena base
    base: usize,
    next: usize,
    regs: Box<[u32; 0x90 / 4]>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let arena = vec![0u8; ARENA_BYTES + 4096].into_boxed_slice();
        let base = arena.as_ptr().align_offset(4096);
        MockPlatform {
            arena,
            base,
            next: 0,
            regs: Box::new([0; 0x90 / 4]),
        }
    }

    /// Pre-load HcRhDescriptorA with a port count before bring-up
    pub fn with_ports(nports: u8) -> Self {
        let mut platform = Self::new();
        platform.regs[0x48 / 4] = nports as u32;
        platform
    }

    fn base_ptr(&self) -> *const u8 {
        unsafe { self.arena.as_ptr().add(self.base) }
    }
}

unsafe impl UsbPlatform for MockPlatform {
    fn regs(&self) -> *const () {
        self.regs.as_ptr() as *const ()
    }

    fn alloc_dma(&mut self, len: usize, align: usize) -> Option<NonNull<u8>> {
        let offset = (self.next + align - 1) & !(align - 1);
        if offset + len > ARENA_BYTES {
            return None;
        }
        self.next = offset + len;
        NonNull::new(unsafe { self.arena.as_mut_ptr().add(self.base + offset) })
    }

    unsafe fn release_dma(&mut self, _ptr: NonNull<u8>, _len: usize, _align: usize) {
        // Bump allocator; freed ranges are simply abandoned.
    }

    fn bus_address(&self, ptr: *const u8) -> u32 {
        let offset = (ptr as usize)
            .checked_sub(self.base_ptr() as usize)
            .expect("bus_address outside the DMA arena");
        assert!(offset < ARENA_BYTES);
        BUS_BASE + offset as u32
    }

    fn cpu_address(&self, bus: u32) -> *mut u8 {
        let offset = bus.checked_sub(BUS_BASE).expect("bus address underflow") as usize;
        assert!(offset < ARENA_BYTES);
        unsafe { self.base_ptr().add(offset) as *mut u8 }
    }

    fn normalize(&mut self, ptr: *mut u8, len: usize) -> *mut u8 {
        if len == 0 {
            return self.base_ptr() as *mut u8;
        }
        let mirror = self
            .alloc_dma(len, 16)
            .expect("mock arena exhausted by normalize");
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, mirror.as_ptr(), len);
        }
        mirror.as_ptr()
    }

    unsafe fn denormalize(&mut self, mirror: *mut u8, orig: *mut u8, len: usize) {
        if len > 0 {
            core::ptr::copy_nonoverlapping(mirror, orig, len);
        }
    }

    fn delay_ms(&self, _ms: u32) {}
}

/// A brought-up controller core over the mock platform
pub(crate) fn test_core() -> Core<MockPlatform> {
    test_core_with_ports(0)
}

pub(crate) fn test_core_with_ports(nports: u8) -> Core<MockPlatform> {
    let platform = if nports > 0 {
        MockPlatform::with_ports(nports)
    } else {
        MockPlatform::new()
    };
    let mut core = Core::new(platform).unwrap();
    core.initialize().unwrap();
    // RAM registers don't implement write-one-to-clear; scrub the
    // bring-up writes so the first isr() sees a clean slate.
    core.regs.HCINTERRUPTSTATUS.write(0);
    core
}

/// Retire up to `n` TDs from the head of a pipe's queue
///
/// `code` is stamped into each TD; any error code halts the ED after
/// the first TD, like the hardware would. `short_by` leaves that many
/// bytes untransferred in each retired TD (0 means a full transfer).
/// The retired TDs are chained into the done queue newest-first and
/// the WDH interrupt is raised; call [`Core::isr`] to drain it.
pub(crate) fn hw_retire(
    core: &mut Core<MockPlatform>,
    function: u8,
    endpoint: u8,
    n: usize,
    code: u32,
    short_by: u32,
) {
    let idx = core.dir.find(pipe_key(function, endpoint)).unwrap();
    let ed_h = core.pipes[idx as usize].as_ref().unwrap().ed;
    let (tail, mut head, carry) = {
        let ed = core.ed_pool.get(ed_h);
        (ed.tail_ptr(), ed.head_ptr(), ed.toggle_carry())
    };

    let mut done: Vec<u32> = Vec::new();
    let mut halted = false;
    while head != 0 && head != tail && done.len() < n {
        let handle = core.td_pool.from_bus(&core.platform, head).unwrap();
        let td = core.td_pool.get(handle);
        let word = td.CONTROL.read();
        td.CONTROL.write((word & !(0xF << 28)) | (code << 28));
        if short_by > 0 {
            let be = td.BE.read();
            td.CBP.write(be - short_by + 1);
        } else if code == cc::NO_ERROR || code == cc::DATA_UNDERRUN {
            td.CBP.write(0);
        }
        let next = td.next_ptr();
        done.push(head);
        head = next;
        if code != cc::NO_ERROR {
            halted = true;
            break;
        }
    }

    // Newest-first chaining, exactly as the controller writes it back.
    for (i, &bus) in done.iter().enumerate() {
        let handle = core.td_pool.from_bus(&core.platform, bus).unwrap();
        let prev = if i == 0 { 0 } else { done[i - 1] };
        core.td_pool.get(handle).set_next(prev);
    }
    if let Some(&newest) = done.last() {
        let hcca = unsafe { &*core.hcca.as_ptr() };
        hcca.DONE_HEAD.write(newest);
        let status = core.regs.HCINTERRUPTSTATUS.read();
        core.regs
            .HCINTERRUPTSTATUS
            .write(status | Interrupts::WDH.bits());
    }

    let flags = if halted {
        ed::HEAD_HALTED | carry
    } else {
        carry
    };
    core.ed_pool.get(ed_h).set_head(head, flags);
}

/// Retire the isochronous TD at the head of a pipe's queue
///
/// Stamps `code` into the TD and every packet status word, advances
/// the ED head, and raises WDH.
pub(crate) fn hw_retire_iso(
    core: &mut Core<MockPlatform>,
    function: u8,
    endpoint: u8,
    code: u32,
) {
    let idx = core.dir.find(pipe_key(function, endpoint)).unwrap();
    let (ed_h, head, tail) = {
        let pipe = core.pipes[idx as usize].as_ref().unwrap();
        let ed = core.ed_pool.get(pipe.ed);
        (pipe.ed, ed.head_ptr(), ed.tail_ptr())
    };
    if head == tail {
        return;
    }

    let (next, halt) = {
        let pipe = core.pipes[idx as usize].as_ref().unwrap();
        let iso = pipe.iso.as_ref().unwrap();
        let slot = iso.slot_of_bus(head).unwrap();
        let td = iso.td(slot);
        let word = td.CONTROL.read();
        td.CONTROL.write((word & !(0xF << 28)) | (code << 28));
        let meta = iso.meta[slot];
        let irp = unsafe { &*iso.ring[meta.ring as usize].as_ref().unwrap().irp.as_ptr() };
        for j in 0..meta.tx_count as usize {
            let size = if code == cc::NO_ERROR {
                // IN sizes come from the device; OUT reports zero.
                if core.pipes[idx as usize].as_ref().unwrap().direction_in() {
                    irp.packet(meta.first_tx as usize + j).length
                } else {
                    0
                }
            } else {
                0
            };
            td.PSW[j].write(((code as u16) << 12) | size);
        }
        let next = td.next_ptr();
        // Retirement repurposes NextTD as the done-queue link.
        td.set_next(0);
        (next, code == cc::STALL || code == cc::DATA_OVERRUN)
    };

    let hcca = unsafe { &*core.hcca.as_ptr() };
    hcca.DONE_HEAD.write(head);
    let status = core.regs.HCINTERRUPTSTATUS.read();
    core.regs
        .HCINTERRUPTSTATUS
        .write(status | Interrupts::WDH.bits());
    core.ed_pool
        .get(ed_h)
        .set_head(next, if halt { ed::HEAD_HALTED } else { 0 });
}
