//! I/O request packets
//!
//! An [`Irp`] is the unit of work the generic USB stack submits against
//! an open pipe. The stack allocates it; this driver owns it from
//! `submit_irp` until the completion callback returns, chaining queued
//! IRPs through the embedded `next` link.

use crate::td::cc;
use bitflags::bitflags;
use core::ptr::NonNull;

/// Names the pipe an IRP completed on
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct PipeId {
    pub function: u8,
    pub endpoint: u8,
}

/// Completion callback, invoked once per IRP
///
/// Runs in whatever context retired the last TD - usually the ISR - so
/// implementations must not block.
pub type Completion = fn(PipeId, &mut Irp);

bitflags! {
    /// Per-IRP behavior switches
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct IrpFlags: u8 {
        /// A device-side short packet completes the IRP successfully
        const SHORT_TRANSFER_OK = 1 << 0;
        /// Terminate an exact-multiple OUT transfer with a zero-length packet
        const ZERO_PACKET = 1 << 1;
    }
}

/// Final disposition of an IRP, delivered through the callback
///
/// Hardware condition codes translate one-to-one; `Canceled` is
/// synthesized by the flush/close paths.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferStatus {
    /// Still owned by the driver
    Pending,
    Success,
    CrcError,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    NotAccessed,
    Canceled,
}

impl TransferStatus {
    /// Translate an OHCI condition code
    pub(crate) fn from_cc(code: u32) -> Self {
        match code {
            cc::NO_ERROR => TransferStatus::Success,
            cc::CRC => TransferStatus::CrcError,
            cc::BIT_STUFFING => TransferStatus::BitStuffing,
            cc::DATA_TOGGLE_MISMATCH => TransferStatus::DataToggleMismatch,
            cc::STALL => TransferStatus::Stall,
            cc::DEVICE_NOT_RESPONDING => TransferStatus::DeviceNotResponding,
            cc::PID_CHECK_FAILURE => TransferStatus::PidCheckFailure,
            cc::UNEXPECTED_PID => TransferStatus::UnexpectedPid,
            cc::DATA_OVERRUN => TransferStatus::DataOverrun,
            cc::DATA_UNDERRUN => TransferStatus::DataUnderrun,
            cc::BUFFER_OVERRUN => TransferStatus::BufferOverrun,
            cc::BUFFER_UNDERRUN => TransferStatus::BufferUnderrun,
            _ => TransferStatus::NotAccessed,
        }
    }
}

/// One isochronous transaction within an ISO IRP
///
/// `buffer`/`length` are filled by the submitter; `actual` and
/// `status` are written back as the transaction retires.
#[derive(Clone, Copy, Debug)]
pub struct IsoPacket {
    pub buffer: *mut u8,
    pub length: u16,
    pub actual: u16,
    pub status: TransferStatus,
}

impl IsoPacket {
    pub const fn new(buffer: *mut u8, length: u16) -> Self {
        IsoPacket {
            buffer,
            length,
            actual: 0,
            status: TransferStatus::Pending,
        }
    }
}

/// An I/O request packet
///
/// Constructed by the stack with one of [`Irp::control`],
/// [`Irp::transfer`], or [`Irp::isochronous`], then handed to
/// [`Ohci::submit_irp`](crate::Ohci::submit_irp).
pub struct Irp {
    /// Submitter's cookie; opaque to the driver, handy in callbacks
    pub context: usize,
    pub(crate) setup: [u8; 8],
    pub(crate) data: *mut u8,
    pub(crate) len: usize,
    pub(crate) flags: IrpFlags,
    pub(crate) status: TransferStatus,
    pub(crate) actual: usize,
    pub(crate) callback: Option<Completion>,
    pub(crate) iso_packets: Option<NonNull<IsoPacket>>,
    pub(crate) iso_count: usize,
    /// Queue link; owned by the driver while the IRP is submitted
    pub(crate) next: Option<NonNull<Irp>>,
}

impl Irp {
    /// A control transfer: 8-byte setup packet plus an optional data phase
    ///
    /// The data-phase direction is taken from bit 7 of `setup[0]`.
    pub fn control(setup: [u8; 8], data: *mut u8, len: usize, callback: Completion) -> Self {
        Irp {
            context: 0,
            setup,
            data,
            len,
            flags: IrpFlags::empty(),
            status: TransferStatus::Pending,
            actual: 0,
            callback: Some(callback),
            iso_packets: None,
            iso_count: 0,
            next: None,
        }
    }

    /// A bulk or interrupt transfer over the pipe's own direction
    pub fn transfer(data: *mut u8, len: usize, flags: IrpFlags, callback: Completion) -> Self {
        Irp {
            context: 0,
            setup: [0; 8],
            data,
            len,
            flags,
            status: TransferStatus::Pending,
            actual: 0,
            callback: Some(callback),
            iso_packets: None,
            iso_count: 0,
            next: None,
        }
    }

    /// An isochronous transfer described by `count` packets
    ///
    /// # Safety
    ///
    /// `packets` must reference `count` initialized [`IsoPacket`]s that
    /// stay valid until the completion callback runs.
    pub unsafe fn isochronous(
        packets: NonNull<IsoPacket>,
        count: usize,
        callback: Completion,
    ) -> Self {
        Irp {
            context: 0,
            setup: [0; 8],
            data: core::ptr::null_mut(),
            len: 0,
            flags: IrpFlags::empty(),
            status: TransferStatus::Pending,
            actual: 0,
            callback: Some(callback),
            iso_packets: Some(packets),
            iso_count: count,
            next: None,
        }
    }

    /// The completion status; `Pending` until the callback has run
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes actually moved, accumulated across the IRP's TDs
    pub fn actual_length(&self) -> usize {
        self.actual
    }

    /// The data-phase direction encoded in the setup packet
    pub(crate) fn setup_direction_in(&self) -> bool {
        self.setup[0] & 0x80 != 0
    }

    pub(crate) fn packet(&self, i: usize) -> &mut IsoPacket {
        debug_assert!(i < self.iso_count);
        unsafe { &mut *self.iso_packets.unwrap().as_ptr().add(i) }
    }
}
