//! A USB 1.1 OHCI host controller driver
//!
//! `ohci-usbh` turns I/O request packets (IRPs) addressed to a
//! `(device, endpoint)` pair into the endpoint- and transfer-descriptor
//! lists that OHCI silicon walks by DMA, and it reassembles the
//! controller's write-back done queue into IRP completions. The crate
//! owns descriptor pooling, the endpoint directory, periodic bandwidth
//! scheduling, and the interrupt-context retirement path; everything
//! else (device enumeration, class drivers, per-IRP timeouts) belongs
//! to the stack above it.
//!
//! To interface the library, you must define a safe implementation of
//! [`UsbPlatform`]. See the trait documentation for more information.
//!
//! The driver entry point is [`Ohci`](crate::Ohci). A typical embedding
//! binds the controller's interrupt to [`Ohci::isr`] and hands the
//! remaining methods to the generic USB stack.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod directory;
mod ed;
mod hcca;
mod irp;
mod pipe;
mod pool;
mod ral;
mod retire;
mod roothub;
mod schedule;
mod td;
mod transfer;
mod vcell;

mod host;

#[cfg(test)]
mod mock;

pub use host::{IsrStatus, Ohci};
pub use irp::{Completion, Irp, IrpFlags, IsoPacket, PipeId, TransferStatus};
pub use pipe::{Speed, TransferType};

use core::ptr::NonNull;

/// Slots per descriptor-pool block
const TDS_PER_BLOCK: usize = 32;
/// Upper bound on descriptor-pool blocks per pool
const MAX_TD_BLOCKS: usize = 8;
/// Branches in the periodic schedule table
const PERIODIC_BRANCHES: usize = 32;
/// Periodic load budget per frame, in microseconds (90% of the 1 ms frame)
const FRAME_BANDWIDTH: u16 = 900;
/// Largest buffer carved into one general TD; also the control data-phase cap
const MAX_TD_BYTES: usize = 4096;
/// General TDs scheduled per translation pass, bounding ISR-context work
const TDS_PER_BURST: u16 = 8;
/// Frames of lead time before the first isochronous transaction
const ISO_SCHEDULE_DELAY: u16 = 2;

/// Open pipes per controller instance
pub const MAX_PIPES: usize = 32;
/// Isochronous IRP ring slots per pipe; at most `MAX_PEND_IRPS - 1` outstanding
pub const MAX_PEND_IRPS: usize = 8;
/// Isochronous TDs pre-allocated per pipe
pub const MAX_ISO_TDS: usize = 4;
/// Transactions packed into one isochronous TD
pub const ISO_TX_PER_TD: usize = 8;

/// Errors returned synchronously from the pipe-lifecycle calls
///
/// Per-transfer failures never appear here; those are delivered as a
/// [`TransferStatus`] through the IRP's completion callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Error {
    /// Malformed argument (bad endpoint address, missing buffer, ...)
    InvalidArgument,
    /// The requested bus speed is not a USB 1.1 speed
    UnsupportedSpeed,
    /// No pipe is open for this (function, endpoint) pair
    UnknownPipe,
    /// The periodic schedule cannot absorb the requested load
    NoBandwidth,
    /// Control transfer data phase exceeds one page
    TransferTooLarge,
    /// The isochronous IRP ring for this pipe is full
    IsoRingFull,
    /// Descriptor pools and the pipe table are exhausted
    NoResources,
}

/// The platform services this driver consumes from the surrounding kernel
///
/// An implementation hands over the controller's operational register
/// block and a small DMA-memory facade. `normalize` may return its
/// argument unchanged on cache-coherent systems; on others it returns a
/// coherent mirror that [`UsbPlatform::denormalize`] later folds back.
///
/// If the platform gates the controller clock, `regs()` should point at
/// an access shim that turns register traffic into no-ops while gated;
/// the driver never caches register reads across its own calls.
///
/// # Safety
///
/// `UsbPlatform` should only be implemented on a type that owns the
/// register block for exactly one OHCI controller instance. The pointer
/// returned by `regs` is cast to the OHCI operational register layout
/// and must stay valid for the life of the driver. `alloc_dma` must
/// return memory that the controller can reach at the bus address
/// reported by `bus_address`, and `cpu_address` must invert
/// `bus_address` for every live allocation.
pub unsafe trait UsbPlatform {
    /// Returns the base address of the controller's operational registers
    fn regs(&self) -> *const ();
    /// Allocate `len` bytes of DMA-reachable memory at the given alignment
    fn alloc_dma(&mut self, len: usize, align: usize) -> Option<NonNull<u8>>;
    /// Release memory obtained from [`UsbPlatform::alloc_dma`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_dma(len, align)` and must no longer be
    /// referenced by the hardware schedule.
    unsafe fn release_dma(&mut self, ptr: NonNull<u8>, len: usize, align: usize);
    /// Translate a CPU pointer into the 32-bit address the controller sees
    fn bus_address(&self, ptr: *const u8) -> u32;
    /// Translate a controller-visible address back into a CPU pointer
    fn cpu_address(&self, bus: u32) -> *mut u8;
    /// Produce a cache-coherent view of `[ptr, ptr + len)` for DMA
    fn normalize(&mut self, ptr: *mut u8, len: usize) -> *mut u8;
    /// Fold a mirror produced by [`UsbPlatform::normalize`] back into `orig`
    ///
    /// # Safety
    ///
    /// `mirror` must be a live value returned by `normalize(orig, len)`.
    unsafe fn denormalize(&mut self, mirror: *mut u8, orig: *mut u8, len: usize);
    /// Busy-wait for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32);
}
