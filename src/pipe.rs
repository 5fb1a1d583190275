//! Software pipe records
//!
//! Each open pipe pairs a hardware ED (owned by the descriptor pool)
//! with the bookkeeping the controller never sees: queued IRPs, the
//! in-flight translation cursor, periodic placement, and - for
//! isochronous pipes - the transaction ring and its pre-allocated TD
//! array.

use crate::irp::{Irp, PipeId};
use crate::pool::Handle;
use crate::td::IsoTd;
use crate::{MAX_ISO_TDS, MAX_PEND_IRPS};
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// USB transfer types, in `bmAttributes` encoding order
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decode the low two bits of an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x3 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub(crate) fn is_periodic(self) -> bool {
        matches!(self, TransferType::Interrupt | TransferType::Isochronous)
    }
}

/// Bus speeds the stack may request; only USB 1.1 speeds are accepted
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Speed {
    Full,
    Low,
    High,
}

/// Control transfer phase, advanced one `make_td` at a time
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    Setup,
    Data,
    Status,
}

/// Translation cursor for the pipe's active IRP
pub(crate) struct XferState {
    pub irp: NonNull<Irp>,
    /// TDs this IRP needs in total
    pub required: u16,
    /// TDs handed to the hardware so far
    pub scheduled: u16,
    /// TDs the hardware has given back
    pub retired: u16,
    /// Byte cursor into the IRP's data buffer
    pub offset: usize,
    pub phase: Phase,
    /// Control data-phase direction, latched from the setup packet
    pub data_in: bool,
}

impl XferState {
    pub fn new(irp: NonNull<Irp>, required: u16, data_in: bool) -> Self {
        XferState {
            irp,
            required,
            scheduled: 0,
            retired: 0,
            offset: 0,
            phase: Phase::Setup,
            data_in,
        }
    }
}

/// Software shadow of one pooled general TD
#[derive(Clone, Copy)]
pub(crate) struct TdMeta {
    /// Pipe-table slot of the owning ED, if the pipe is still open
    pub owner: Option<u8>,
    /// Caller's buffer segment for this TD
    pub orig: *mut u8,
    /// Cache-coherent mirror actually handed to the hardware
    pub mirror: *mut u8,
    pub len: u32,
}

impl Default for TdMeta {
    fn default() -> Self {
        TdMeta {
            owner: None,
            orig: core::ptr::null_mut(),
            mirror: core::ptr::null_mut(),
            len: 0,
        }
    }
}

/// FIFO of IRPs waiting behind the active one, linked intrusively
pub(crate) struct IrpQueue {
    head: Option<NonNull<Irp>>,
    tail: Option<NonNull<Irp>>,
}

impl IrpQueue {
    pub const fn new() -> Self {
        IrpQueue {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// # Safety
    ///
    /// `irp` must stay valid until popped, and must not already be on a
    /// queue.
    pub unsafe fn push(&mut self, mut irp: NonNull<Irp>) {
        irp.as_mut().next = None;
        match self.tail {
            Some(mut tail) => tail.as_mut().next = Some(irp),
            None => self.head = Some(irp),
        }
        self.tail = Some(irp);
    }

    pub fn pop(&mut self) -> Option<NonNull<Irp>> {
        let mut irp = self.head?;
        let next = unsafe { irp.as_mut().next.take() };
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        Some(irp)
    }
}

/// One outstanding isochronous IRP in the pipe's ring
pub(crate) struct IsoSlot {
    pub irp: NonNull<Irp>,
    pub required_tx: u16,
    pub scheduled_tx: u16,
    pub done_tx: u16,
}

/// Software shadow of one slot in the pipe's static iso TD array
#[derive(Clone, Copy)]
pub(crate) struct IsoTdMeta {
    pub in_use: bool,
    /// Ring slot of the IRP this TD serves
    pub ring: u8,
    /// First transaction index covered by this TD
    pub first_tx: u16,
    pub tx_count: u8,
    /// Caller's buffer for the whole packed span
    pub orig: *mut u8,
    /// Cache-coherent mirror handed to the hardware
    pub mirror: *mut u8,
    pub span: usize,
}

impl IsoTdMeta {
    const FREE: IsoTdMeta = IsoTdMeta {
        in_use: false,
        ring: 0,
        first_tx: 0,
        tx_count: 0,
        orig: core::ptr::null_mut(),
        mirror: core::ptr::null_mut(),
        span: 0,
    };
}

/// Isochronous extension of a pipe
///
/// The TD array is allocated once at `open_pipe` and never returned to
/// a pool; retired slots are simply marked free for reuse.
pub(crate) struct IsoState {
    pub tds: NonNull<IsoTd>,
    pub tds_bus: u32,
    pub meta: [IsoTdMeta; MAX_ISO_TDS],
    pub ring: [Option<IsoSlot>; MAX_PEND_IRPS],
    /// Ring slot the next submission lands in
    pub submit: u8,
    /// Oldest ring slot still outstanding
    pub done: u8,
    /// TD-array slot currently serving as the queue dummy
    pub fill: u8,
    /// Frame number the next packed transaction departs in
    pub next_frame: u16,
    /// Cleared until the first TD establishes the frame cadence
    pub primed: bool,
}

impl IsoState {
    const NO_SLOT: Option<IsoSlot> = None;

    pub fn new(tds: NonNull<IsoTd>, tds_bus: u32) -> Self {
        IsoState {
            tds,
            tds_bus,
            meta: [IsoTdMeta::FREE; MAX_ISO_TDS],
            ring: [Self::NO_SLOT; MAX_PEND_IRPS],
            submit: 0,
            done: 0,
            fill: 0,
            next_frame: 0,
            primed: false,
        }
    }

    pub fn td(&self, slot: usize) -> &IsoTd {
        debug_assert!(slot < MAX_ISO_TDS);
        unsafe { &*self.tds.as_ptr().add(slot) }
    }

    pub fn slot_bus(&self, slot: usize) -> u32 {
        self.tds_bus + (slot * core::mem::size_of::<IsoTd>()) as u32
    }

    /// Which array slot a done-queue bus address names, if any
    pub fn slot_of_bus(&self, bus: u32) -> Option<usize> {
        let span = (MAX_ISO_TDS * core::mem::size_of::<IsoTd>()) as u32;
        if bus >= self.tds_bus && bus < self.tds_bus + span {
            Some((bus - self.tds_bus) as usize / core::mem::size_of::<IsoTd>())
        } else {
            None
        }
    }

    pub fn ring_full(&self) -> bool {
        (self.submit as usize + 1) % MAX_PEND_IRPS == self.done as usize
    }

    pub fn ring_empty(&self) -> bool {
        self.submit == self.done
    }
}

/// Everything the driver tracks for one open pipe
pub(crate) struct Pipe {
    pub id: PipeId,
    pub key: u16,
    pub xfer: TransferType,
    pub speed: Speed,
    pub max_packet: u16,
    /// Normalized polling interval in frames (power of two, 1..=32)
    pub interval: u8,
    pub load: u16,
    /// Periodic-table branch this pipe is anchored at
    pub branch: Option<u8>,
    pub ed: Handle,
    pub ed_bus: u32,
    /// Permanent dummy tail TD (general transfer types)
    pub dummy: Option<Handle>,
    /// Most recently scheduled TD; receives a forced interrupt on OOM
    pub last_td: Option<Handle>,
    pub state: Option<XferState>,
    pub pend: IrpQueue,
    pub on_pending_list: bool,
    pub pending_next: Option<u8>,
    /// Next pipe in the control/bulk software chain
    pub list_next: Option<u8>,
    pub iso: Option<IsoState>,
}

impl Pipe {
    pub fn new(
        id: PipeId,
        key: u16,
        xfer: TransferType,
        speed: Speed,
        max_packet: u16,
        ed: Handle,
        ed_bus: u32,
    ) -> Self {
        Pipe {
            id,
            key,
            xfer,
            speed,
            max_packet,
            interval: 1,
            load: 0,
            branch: None,
            ed,
            ed_bus,
            dummy: None,
            last_td: None,
            state: None,
            pend: IrpQueue::new(),
            on_pending_list: false,
            pending_next: None,
            list_next: None,
            iso: None,
        }
    }

    /// Data direction for bulk/interrupt pipes, from the endpoint address
    pub fn direction(&self) -> UsbDirection {
        EndpointAddress::from(self.id.endpoint).direction()
    }

    pub fn direction_in(&self) -> bool {
        self.direction() == UsbDirection::In
    }
}
