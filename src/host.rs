//! Controller core and public driver facade
//!
//! [`Core`] owns everything one OHCI instance needs: the register
//! block, the HCCA, the descriptor pools, the endpoint directory, the
//! pipe table, and the schedule state. [`Ohci`] wraps a core in a spin
//! mutex so the pipe-lifecycle calls serialize against each other; the
//! controller's own master-interrupt gate (nesting-counted through
//! HcInterruptEnable/Disable) excludes the ISR from task-context
//! critical sections, since an ISR can never block on the mutex.

use crate::directory::{pipe_key, Directory};
use crate::ed::{self, Ed};
use crate::hcca::Hcca;
use crate::irp::{Irp, PipeId, TransferStatus};
use crate::pipe::{IsoState, Pipe, Speed, TdMeta, TransferType};
use crate::pool::{Handle, Pool};
use crate::ral::{self, Interrupts, PortStatus};
use crate::roothub::RootHub;
use crate::schedule::{normalize_interval, ListAnchor};
use crate::td::{GeneralTd, IsoTd};
use crate::transfer::td_budget;
use crate::{Error, UsbPlatform, MAX_ISO_TDS, MAX_PIPES, PERIODIC_BRANCHES};
use core::mem::size_of;
use core::ptr::NonNull;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// What an [`Ohci::isr`] pass observed
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum IsrStatus {
    /// No enabled interrupt was pending
    None,
    /// Interrupts were serviced
    Handled,
    /// Unrecoverable-error or scheduling-overrun; reset the controller
    Unrecoverable,
}

pub(crate) struct Core<P: UsbPlatform> {
    pub platform: P,
    pub regs: ral::ohci::Instance,
    pub hcca: NonNull<Hcca>,
    pub hcca_bus: u32,
    pub ed_pool: Pool<Ed, ()>,
    pub td_pool: Pool<GeneralTd, TdMeta>,
    pub dir: Directory,
    pub pipes: [Option<Pipe>; MAX_PIPES],
    /// Per-branch periodic load accumulators
    pub loads: [u16; PERIODIC_BRANCHES],
    pub control_list: ListAnchor,
    pub bulk_list: ListAnchor,
    /// Pipes that failed a TD allocation, serviced FIFO at retirement
    pub pending_head: Option<u8>,
    pub pending_tail: Option<u8>,
    /// Master-interrupt gate nesting depth
    pub int_depth: u32,
    /// Software extension of the 16-bit hardware frame number
    pub frame_hi: u32,
    pub roothub: RootHub,
    pub nports: u8,
}

impl<P: UsbPlatform> Core<P> {
    pub(crate) fn new(mut platform: P) -> Result<Self, Error> {
        let regs = unsafe { ral::ohci::Instance::new(platform.regs()) };
        let hcca_mem = platform
            .alloc_dma(size_of::<Hcca>(), 256)
            .ok_or(Error::NoResources)?;
        unsafe {
            core::ptr::write_bytes(hcca_mem.as_ptr(), 0, size_of::<Hcca>());
        }
        let hcca_bus = platform.bus_address(hcca_mem.as_ptr());

        const NO_PIPE: Option<Pipe> = None;
        Ok(Core {
            platform,
            regs,
            hcca: hcca_mem.cast(),
            hcca_bus,
            ed_pool: Pool::new(),
            td_pool: Pool::new(),
            dir: Directory::new(),
            pipes: [NO_PIPE; MAX_PIPES],
            loads: [0; PERIODIC_BRANCHES],
            control_list: ListAnchor::new(),
            bulk_list: ListAnchor::new(),
            pending_head: None,
            pending_tail: None,
            int_depth: 0,
            frame_hi: 0,
            roothub: RootHub::new(),
            nports: 0,
        })
    }

    /// Reset the controller and bring it to UsbOperational
    pub(crate) fn initialize(&mut self) -> Result<(), Error> {
        // The frame interval survives the software reset.
        let fi = ral::read_reg!(ral::ohci, self.regs, HCFMINTERVAL, FI);
        let fi = if fi == 0 { 0x2EDF } else { fi };

        ral::write_reg!(ral::ohci, self.regs, HCCOMMANDSTATUS, HCR: 1);
        for _ in 0..10 {
            if ral::read_reg!(ral::ohci, self.regs, HCCOMMANDSTATUS, HCR == 0) {
                break;
            }
            self.platform.delay_ms(1);
        }

        let fit = ral::read_reg!(ral::ohci, self.regs, HCFMINTERVAL, FIT);
        let fsmps = fi.saturating_sub(210) * 6 / 7;
        ral::write_reg!(
            ral::ohci,
            self.regs,
            HCFMINTERVAL,
            FI: fi,
            FSMPS: fsmps,
            FIT: fit ^ 1
        );
        ral::write_reg!(ral::ohci, self.regs, HCPERIODICSTART, PS: fi * 9 / 10);
        ral::write_reg!(ral::ohci, self.regs, HCLSTHRESHOLD, LST: 0x628);

        ral::write_reg!(ral::ohci, self.regs, HCHCCA, self.hcca_bus);
        ral::write_reg!(ral::ohci, self.regs, HCCONTROLHEADED, 0);
        ral::write_reg!(ral::ohci, self.regs, HCBULKHEADED, 0);

        ral::modify_reg!(
            ral::ohci,
            self.regs,
            HCCONTROL,
            HCFS: ral::ohci::HCCONTROL::HCFS::OPERATIONAL,
            CBSR: 3
        );

        self.nports =
            ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORA, NDP)
                .min(ral::ohci::NDP_MAX as u32) as u8;
        let always_powered = ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORA, NPS) != 0;
        if !always_powered {
            let per_port = ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORA, PSM) != 0;
            if per_port {
                for port in 0..self.nports as usize {
                    self.regs.HCRHPORTSTATUS[port].write(PortStatus::PPS.bits());
                }
            } else {
                // SetGlobalPower strobe
                ral::write_reg!(ral::ohci, self.regs, HCRHSTATUS, 1 << 16);
            }
            let potpgt = ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORA, POTPGT);
            self.platform.delay_ms(potpgt * 2);
        }

        // Clear anything stale, then open the gate.
        ral::write_reg!(ral::ohci, self.regs, HCINTERRUPTSTATUS, u32::MAX);
        let ints = Interrupts::SO
            | Interrupts::WDH
            | Interrupts::UE
            | Interrupts::FNO
            | Interrupts::RHSC;
        ral::write_reg!(
            ral::ohci,
            self.regs,
            HCINTERRUPTENABLE,
            (ints | Interrupts::MIE).bits()
        );

        debug!("controller operational, {} ports", self.nports);
        Ok(())
    }

    /// Mask this controller's interrupts, nesting-counted
    pub(crate) fn disable_int(&mut self) {
        if self.int_depth == 0 {
            ral::write_reg!(
                ral::ohci,
                self.regs,
                HCINTERRUPTDISABLE,
                Interrupts::MIE.bits()
            );
        }
        self.int_depth += 1;
    }

    /// Undo one [`Core::disable_int`]
    pub(crate) fn enable_int(&mut self) {
        debug_assert!(self.int_depth > 0);
        self.int_depth = self.int_depth.saturating_sub(1);
        if self.int_depth == 0 {
            ral::write_reg!(
                ral::ohci,
                self.regs,
                HCINTERRUPTENABLE,
                Interrupts::MIE.bits()
            );
        }
    }

    /// Run `f` with the controller's interrupts masked
    pub(crate) fn masked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.disable_int();
        let result = f(self);
        self.enable_int();
        result
    }

    /// The 32-bit software view of the frame counter
    pub(crate) fn frame_number(&self) -> u32 {
        let hcca = unsafe { &*self.hcca.as_ptr() };
        self.frame_hi | hcca.FRAME_NUMBER.read() as u32
    }

    pub(crate) fn open_pipe(
        &mut self,
        function: u8,
        endpoint: u8,
        attributes: u8,
        speed: Speed,
        max_packet: u16,
        interval_us: u32,
        load: u16,
    ) -> Result<(), Error> {
        // Root-hub endpoints never get descriptors.
        if function == self.roothub.addr {
            return Ok(());
        }
        if speed == Speed::High {
            return Err(Error::UnsupportedSpeed);
        }
        let key = pipe_key(function, endpoint);
        if self.dir.find(key).is_some() {
            // Already open; idempotent.
            return Ok(());
        }
        let xfer = TransferType::from_attributes(attributes);
        let idx = self
            .pipes
            .iter()
            .position(|p| p.is_none())
            .ok_or(Error::NoResources)? as u8;

        let ed = {
            let Core {
                ref mut ed_pool,
                ref mut platform,
                ..
            } = *self;
            ed_pool.alloc(platform)?
        };
        let ed_bus = self.ed_pool.bus_addr(&self.platform, ed);
        {
            let direction = match xfer {
                TransferType::Control => ed::DIR_FROM_TD,
                _ => match EndpointAddress::from(endpoint).direction() {
                    UsbDirection::In => ed::DIR_IN,
                    UsbDirection::Out => ed::DIR_OUT,
                },
            };
            let ed_ref = self.ed_pool.get(ed);
            ral::write_reg!(
                crate::ed,
                ed_ref,
                CONTROL,
                FA: function as u32 & 0x7F,
                EN: endpoint as u32 & 0xF,
                D: direction,
                S: (speed == Speed::Low) as u32,
                K: 1,
                F: (xfer == TransferType::Isochronous) as u32,
                MPS: max_packet as u32
            );
        }

        let mut pipe = Pipe::new(
            PipeId { function, endpoint },
            key,
            xfer,
            speed,
            max_packet,
            ed,
            ed_bus,
        );

        match xfer {
            TransferType::Isochronous => {
                if self.find_best_schedule(1, load).is_none() {
                    self.release_ed(ed);
                    return Err(Error::NoBandwidth);
                }
                let bytes = MAX_ISO_TDS * size_of::<IsoTd>();
                let mem = match self.platform.alloc_dma(bytes, 32) {
                    Some(mem) => mem,
                    None => {
                        self.release_ed(ed);
                        return Err(Error::NoResources);
                    }
                };
                unsafe {
                    core::ptr::write_bytes(mem.as_ptr(), 0, bytes);
                }
                let tds_bus = self.platform.bus_address(mem.as_ptr());
                {
                    let ed_ref = self.ed_pool.get(ed);
                    ed_ref.set_head(tds_bus, 0);
                    ed_ref.set_tail(tds_bus);
                }
                pipe.interval = 1;
                pipe.load = load;
                pipe.iso = Some(IsoState::new(mem.cast(), tds_bus));
                self.dir.insert(key, ed_bus, idx);
                self.pipes[idx as usize] = Some(pipe);
                self.link_periodic(idx, 0);
            }
            _ => {
                let dummy = {
                    let Core {
                        ref mut td_pool,
                        ref mut platform,
                        ..
                    } = *self;
                    td_pool.alloc(platform)
                };
                let dummy = match dummy {
                    Ok(dummy) => dummy,
                    Err(e) => {
                        self.release_ed(ed);
                        return Err(e);
                    }
                };
                let dummy_bus = self.td_pool.bus_addr(&self.platform, dummy);
                {
                    let ed_ref = self.ed_pool.get(ed);
                    ed_ref.set_head(dummy_bus, 0);
                    ed_ref.set_tail(dummy_bus);
                }
                pipe.dummy = Some(dummy);

                if xfer == TransferType::Interrupt {
                    pipe.interval = normalize_interval(interval_us);
                    pipe.load = load;
                    let branch = match self.find_best_schedule(pipe.interval, load) {
                        Some(branch) => branch,
                        None => {
                            self.release_td(dummy);
                            self.release_ed(ed);
                            return Err(Error::NoBandwidth);
                        }
                    };
                    self.dir.insert(key, ed_bus, idx);
                    self.pipes[idx as usize] = Some(pipe);
                    self.link_periodic(idx, branch);
                } else {
                    self.dir.insert(key, ed_bus, idx);
                    self.pipes[idx as usize] = Some(pipe);
                    self.link_nonperiodic(idx);
                }
            }
        }
        debug!("open fa={} ep={}", function, endpoint);
        Ok(())
    }

    pub(crate) fn close_pipe(&mut self, function: u8, endpoint: u8) -> Result<(), Error> {
        if function == self.roothub.addr {
            return Ok(());
        }
        let key = pipe_key(function, endpoint);
        let idx = self.dir.find(key).ok_or(Error::UnknownPipe)?;
        let (xfer, ed) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            debug_assert_eq!(pipe.key, key);
            (pipe.xfer, pipe.ed)
        };

        match xfer {
            TransferType::Control => {
                // Quiesce the list so the unlink cannot race in-flight DMA.
                ral::modify_reg!(ral::ohci, self.regs, HCCONTROL, CLE: 0);
                self.platform.delay_ms(1);
                self.unlink_nonperiodic(idx);
            }
            TransferType::Bulk => {
                ral::modify_reg!(ral::ohci, self.regs, HCCONTROL, BLE: 0);
                self.platform.delay_ms(1);
                self.unlink_nonperiodic(idx);
            }
            TransferType::Interrupt | TransferType::Isochronous => {
                self.ed_pool.get(ed).set_skip(true);
                ral::modify_reg!(ral::ohci, self.regs, HCCONTROL, PLE: 0, IE: 0);
                self.platform.delay_ms(1);
                self.unlink_periodic(idx);
            }
        }
        // unlink_* re-derived the enables for the surviving lists.

        self.cancel_pipe_transfers(idx);
        self.remove_pending(idx);

        let (dummy, iso) = {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            (pipe.dummy.take(), pipe.iso.take())
        };
        if let Some(dummy) = dummy {
            self.release_td(dummy);
        }
        if let Some(iso) = iso {
            let bytes = MAX_ISO_TDS * size_of::<IsoTd>();
            unsafe {
                self.platform.release_dma(iso.tds.cast(), bytes, 32);
            }
        }
        self.release_ed(ed);
        self.dir.remove(key);
        self.pipes[idx as usize] = None;
        debug!("close fa={} ep={}", function, endpoint);
        Ok(())
    }

    /// Close-then-open with new attributes, preserving the bus speed
    pub(crate) fn modify_pipe(
        &mut self,
        function: u8,
        endpoint: u8,
        attributes: u8,
        max_packet: u16,
        interval_us: u32,
        load: u16,
    ) -> Result<(), Error> {
        if function == self.roothub.addr {
            return Ok(());
        }
        let key = pipe_key(function, endpoint);
        let idx = self.dir.find(key).ok_or(Error::UnknownPipe)?;
        let speed = self.pipes[idx as usize].as_ref().unwrap().speed;
        self.close_pipe(function, endpoint)?;
        self.open_pipe(
            function, endpoint, attributes, speed, max_packet, interval_us, load,
        )
    }

    pub(crate) fn submit_irp(
        &mut self,
        irp_ptr: NonNull<Irp>,
        function: u8,
        endpoint: u8,
    ) -> Result<(), Error> {
        if function == self.roothub.addr {
            return self.roothub_submit(irp_ptr, endpoint);
        }
        let key = pipe_key(function, endpoint);
        let idx = self.dir.find(key).ok_or(Error::UnknownPipe)?;
        let xfer = self.pipes[idx as usize].as_ref().unwrap().xfer;

        let irp = unsafe { &mut *irp_ptr.as_ptr() };
        irp.status = TransferStatus::Pending;
        irp.actual = 0;
        irp.next = None;

        match xfer {
            TransferType::Isochronous => {
                if irp.iso_packets.is_none() || irp.iso_count == 0 {
                    return Err(Error::InvalidArgument);
                }
                let transactions = irp.iso_count as u16;
                self.enqueue_iso(idx, irp_ptr, transactions)
            }
            _ => {
                if irp.len > 0 && irp.data.is_null() {
                    return Err(Error::InvalidArgument);
                }
                // Argument errors surface now, before any state changes.
                let (max_packet, busy) = {
                    let pipe = self.pipes[idx as usize].as_ref().unwrap();
                    (pipe.max_packet, pipe.state.is_some())
                };
                td_budget(xfer, max_packet, irp)?;
                if busy {
                    let pipe = self.pipes[idx as usize].as_mut().unwrap();
                    unsafe {
                        pipe.pend.push(irp_ptr);
                    }
                } else {
                    self.start_irp(idx, irp_ptr);
                }
                Ok(())
            }
        }
    }

    /// Synchronously cancel everything outstanding on a pipe
    pub(crate) fn flush_pipe(&mut self, function: u8, endpoint: u8) -> Result<(), Error> {
        if function == self.roothub.addr {
            return Ok(());
        }
        let key = pipe_key(function, endpoint);
        let idx = self.dir.find(key).ok_or(Error::UnknownPipe)?;
        self.cancel_pipe_transfers(idx);
        self.remove_pending(idx);
        Ok(())
    }

    /// Service the interrupt causes the upward LISR latched
    pub(crate) fn isr(&mut self) -> IsrStatus {
        self.disable_int();
        let enabled = ral::read_reg!(ral::ohci, self.regs, HCINTERRUPTENABLE);
        let raw = ral::read_reg!(ral::ohci, self.regs, HCINTERRUPTSTATUS);
        let pending =
            Interrupts::from_bits_truncate(raw & enabled).difference(Interrupts::MIE);
        if pending.is_empty() {
            self.enable_int();
            return IsrStatus::None;
        }

        if pending.intersects(Interrupts::UE | Interrupts::SO) {
            // Fatal; the embedder must reset the controller.
            ral::write_reg!(ral::ohci, self.regs, HCINTERRUPTSTATUS, pending.bits());
            self.enable_int();
            warn!("unrecoverable controller error");
            return IsrStatus::Unrecoverable;
        }

        if pending.contains(Interrupts::FNO) {
            self.frame_hi = self.frame_hi.wrapping_add(0x1_0000);
        }
        if pending.contains(Interrupts::WDH) {
            self.drain_done_queue();
        }
        if pending.contains(Interrupts::RHSC) {
            self.roothub_status_change();
        }

        ral::write_reg!(ral::ohci, self.regs, HCINTERRUPTSTATUS, pending.bits());
        self.enable_int();
        IsrStatus::Handled
    }

    fn release_ed(&mut self, ed: Handle) {
        let Core {
            ref mut ed_pool,
            ref mut platform,
            ..
        } = *self;
        ed_pool.dealloc(platform, ed);
    }

    fn release_td(&mut self, td: Handle) {
        let Core {
            ref mut td_pool,
            ref mut platform,
            ..
        } = *self;
        td_pool.dealloc(platform, td);
    }
}

impl<P: UsbPlatform> Drop for Core<P> {
    fn drop(&mut self) {
        for i in 0..MAX_PIPES {
            let iso = self.pipes[i].as_mut().and_then(|p| p.iso.take());
            if let Some(iso) = iso {
                let bytes = MAX_ISO_TDS * size_of::<IsoTd>();
                unsafe {
                    self.platform.release_dma(iso.tds.cast(), bytes, 32);
                }
            }
        }
        self.td_pool.release_all(&mut self.platform);
        self.ed_pool.release_all(&mut self.platform);
        unsafe {
            self.platform
                .release_dma(self.hcca.cast(), size_of::<Hcca>(), 256);
        }
    }
}

/// One OHCI host controller
///
/// Construction does nothing but allocate the HCCA; call
/// [`initialize()`](Ohci::initialize) once before anything else, and
/// invoke [`isr()`](Ohci::isr) from the controller's interrupt handler
/// after the platform LISR has latched and masked the cause.
///
/// All methods take `&self`; an internal mutex serializes task-context
/// callers, and the controller's master-interrupt gate keeps the ISR
/// out of task-context critical sections.
pub struct Ohci<P: UsbPlatform> {
    core: spin::Mutex<Core<P>>,
}

impl<P: UsbPlatform> Ohci<P> {
    /// Create a driver over `platform`
    pub fn new(platform: P) -> Result<Self, Error> {
        Ok(Ohci {
            core: spin::Mutex::new(Core::new(platform)?),
        })
    }

    /// Reset and start the controller
    pub fn initialize(&self) -> Result<(), Error> {
        self.core.lock().initialize()
    }

    /// Open a pipe to `(function, endpoint)`
    ///
    /// `attributes` is the endpoint's `bmAttributes`; `interval_us` and
    /// `load` only matter for periodic transfer types. Opening an
    /// already-open pipe succeeds without side effects. Interrupt
    /// endpoints that cannot fit the periodic schedule fail with
    /// [`Error::NoBandwidth`] and leave no state behind.
    pub fn open_pipe(
        &self,
        function: u8,
        endpoint: u8,
        attributes: u8,
        speed: Speed,
        max_packet: u16,
        interval_us: u32,
        load: u16,
    ) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.masked(|core| {
            core.open_pipe(
                function, endpoint, attributes, speed, max_packet, interval_us, load,
            )
        })
    }

    /// Tear down a pipe, canceling all outstanding IRPs
    pub fn close_pipe(&self, function: u8, endpoint: u8) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.masked(|core| core.close_pipe(function, endpoint))
    }

    /// Re-open a pipe with new attributes, keeping its bus speed
    pub fn modify_pipe(
        &self,
        function: u8,
        endpoint: u8,
        attributes: u8,
        max_packet: u16,
        interval_us: u32,
        load: u16,
    ) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.masked(|core| {
            core.modify_pipe(function, endpoint, attributes, max_packet, interval_us, load)
        })
    }

    /// Submit an IRP against an open pipe
    ///
    /// Descriptor-pool exhaustion is not a failure: the transfer is
    /// parked and scheduled automatically as descriptors retire.
    ///
    /// # Safety
    ///
    /// The IRP (and the buffers it references) must stay valid and
    /// unmoved from this call until its completion callback runs. The
    /// driver owns the IRP in that window; the caller must not touch
    /// it.
    pub unsafe fn submit_irp(
        &self,
        irp: NonNull<Irp>,
        function: u8,
        endpoint: u8,
    ) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.masked(|core| core.submit_irp(irp, function, endpoint))
    }

    /// Cancel every outstanding IRP on a pipe, leaving it open
    ///
    /// Cancellation is synchronous: every callback has run, with
    /// [`TransferStatus::Canceled`], by the time this returns.
    pub fn flush_pipe(&self, function: u8, endpoint: u8) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.masked(|core| core.flush_pipe(function, endpoint))
    }

    /// Service a controller interrupt
    pub fn isr(&self) -> IsrStatus {
        self.core.lock().isr()
    }

    /// Mask this controller's interrupts; calls nest
    pub fn disable_int(&self) {
        self.core.lock().disable_int();
    }

    /// Unmask this controller's interrupts once the nesting unwinds
    pub fn enable_int(&self) {
        self.core.lock().enable_int();
    }

    /// The frame counter, extended to 32 bits in software
    pub fn frame_number(&self) -> u32 {
        self.core.lock().frame_number()
    }
}

#[cfg(test)]
mod test {
    use super::Core;
    use crate::directory::pipe_key;
    use crate::ed::HEAD_TOGGLE_CARRY;
    use crate::irp::{Irp, IrpFlags, IsoPacket, PipeId, TransferStatus};
    use crate::mock::{self, MockPlatform};
    use crate::ral::{Interrupts, PortStatus};
    use crate::td::cc;
    use crate::{Error, Speed, MAX_PEND_IRPS};
    use core::ptr::NonNull;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    fn count(_: PipeId, irp: &mut Irp) {
        irp.context += 1;
    }

    fn open_bulk(core: &mut Core<MockPlatform>, function: u8, endpoint: u8) {
        core.open_pipe(function, endpoint, 0x02, Speed::Full, 64, 0, 0)
            .unwrap();
    }

    fn ed_of<'a>(
        core: &'a Core<MockPlatform>,
        function: u8,
        endpoint: u8,
    ) -> &'a crate::ed::Ed {
        let idx = core.dir.find(pipe_key(function, endpoint)).unwrap();
        let handle = core.pipes[idx as usize].as_ref().unwrap().ed;
        core.ed_pool.get(handle)
    }

    #[test]
    fn control_happy_path() {
        let mut core = mock::test_core();
        core.open_pipe(5, 0, 0x00, Speed::Full, 8, 0, 0).unwrap();
        // Only the dummy tail is live after open.
        assert_eq!(core.td_pool.live(), 1);
        {
            let ed = ed_of(&core, 5, 0);
            assert_ne!(ed.head_ptr(), 0);
            assert_eq!(ed.head_ptr(), ed.tail_ptr());
        }

        let mut buf = [0u8; 8];
        let setup = [0x80, 6, 0, 1, 0, 0, 8, 0];
        let mut irp = Irp::control(setup, buf.as_mut_ptr(), 8, count);
        core.submit_irp(NonNull::from(&mut irp), 5, 0).unwrap();
        // SETUP + DATA + STATUS, plus the dummy.
        assert_eq!(core.td_pool.live(), 4);

        mock::hw_retire(&mut core, 5, 0, 3, cc::NO_ERROR, 0);
        core.isr();

        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(irp.actual_length(), 8);
        assert_eq!(core.td_pool.live(), 1);
    }

    #[test]
    fn control_transfer_size_cap() {
        let mut core = mock::test_core();
        core.open_pipe(5, 0, 0x00, Speed::Full, 8, 0, 0).unwrap();
        let mut buf = vec![0u8; 8192];
        let setup = [0x80, 6, 0, 1, 0, 0, 0, 0x20];
        let mut irp = Irp::control(setup, buf.as_mut_ptr(), 8192, count);
        assert_eq!(
            core.submit_irp(NonNull::from(&mut irp), 5, 0),
            Err(Error::TransferTooLarge)
        );
        assert_eq!(core.td_pool.live(), 1);
        assert_eq!(irp.context, 0);
    }

    #[test]
    fn bulk_retirement_completeness() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x81);
        let mut buf = vec![0u8; 10_000];
        let mut irp = Irp::transfer(buf.as_mut_ptr(), 10_000, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut irp), 4, 0x81).unwrap();
        // ceil(10000 / 4096) TDs plus the dummy.
        assert_eq!(core.td_pool.live(), 4);

        mock::hw_retire(&mut core, 4, 0x81, 3, cc::NO_ERROR, 0);
        core.isr();

        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(irp.actual_length(), 10_000);
        assert_eq!(core.td_pool.live(), 1);
    }

    #[test]
    fn trailing_zero_packet() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x01);
        let mut buf = [0u8; 128];
        let mut irp = Irp::transfer(buf.as_mut_ptr(), 128, IrpFlags::ZERO_PACKET, count);
        core.submit_irp(NonNull::from(&mut irp), 4, 0x01).unwrap();
        // 128 is an exact multiple of the 64-byte max packet: one data
        // TD and one explicit zero-length terminator.
        assert_eq!(core.td_pool.live(), 3);

        mock::hw_retire(&mut core, 4, 0x01, 2, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(irp.context, 1);
        assert_eq!(irp.actual_length(), 128);
        assert_eq!(core.td_pool.live(), 1);
    }

    #[test]
    fn error_halts_queue() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x81);
        let mut buf = vec![0u8; 10_000];
        let mut irp = Irp::transfer(buf.as_mut_ptr(), 10_000, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut irp), 4, 0x81).unwrap();
        assert_eq!(core.td_pool.live(), 4);

        mock::hw_retire(&mut core, 4, 0x81, 1, cc::STALL, 0);
        core.isr();

        // One retirement call freed every queued TD for the pipe.
        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Stall);
        assert_eq!(core.td_pool.live(), 1);
        let ed = ed_of(&core, 4, 0x81);
        assert_eq!(ed.head_ptr(), ed.tail_ptr());
        assert_eq!(ed.toggle_carry(), 0);
    }

    #[test]
    fn accepted_short_packet_preserves_toggle() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x81);
        let mut buf = vec![0u8; 4096];
        let mut irp = Irp::transfer(
            buf.as_mut_ptr(),
            4096,
            IrpFlags::SHORT_TRANSFER_OK,
            count,
        );
        core.submit_irp(NonNull::from(&mut irp), 4, 0x81).unwrap();
        {
            let ed = ed_of(&core, 4, 0x81);
            ed.set_head(ed.head_ptr(), HEAD_TOGGLE_CARRY);
        }

        mock::hw_retire(&mut core, 4, 0x81, 1, cc::DATA_UNDERRUN, 96);
        core.isr();

        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(irp.actual_length(), 4000);
        let ed = ed_of(&core, 4, 0x81);
        assert!(!ed.is_halted());
        assert_eq!(ed.toggle_carry(), HEAD_TOGGLE_CARRY);
    }

    #[test]
    fn fifo_irp_queue() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x01);
        let mut buf = [0u8; 64];
        let mut first = Irp::transfer(buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        let mut second = Irp::transfer(buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut first), 4, 0x01).unwrap();
        core.submit_irp(NonNull::from(&mut second), 4, 0x01).unwrap();
        // The second IRP waits; only the first is translated.
        assert_eq!(core.td_pool.live(), 2);

        mock::hw_retire(&mut core, 4, 0x01, 1, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(first.context, 1);
        // Completion started the queued IRP without another submit.
        assert_eq!(second.context, 0);
        assert_eq!(core.td_pool.live(), 2);

        mock::hw_retire(&mut core, 4, 0x01, 1, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(second.context, 1);
        assert_eq!(second.status(), TransferStatus::Success);
    }

    #[test]
    fn oom_backoff() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 1, 0x01);
        open_bulk(&mut core, 2, 0x01);

        let mut b_buf = [0u8; 64];
        let mut b_irp = Irp::transfer(b_buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut b_irp), 2, 0x01).unwrap();

        // Hoard the rest of the pool.
        let mut hoard = Vec::new();
        loop {
            let handle = {
                let Core {
                    ref mut td_pool,
                    ref mut platform,
                    ..
                } = core;
                td_pool.alloc(platform)
            };
            match handle {
                Ok(handle) => hoard.push(handle),
                Err(_) => break,
            }
        }

        let mut a_buf = [0u8; 64];
        let mut a_irp = Irp::transfer(a_buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        // Exhaustion is not a submission failure.
        core.submit_irp(NonNull::from(&mut a_irp), 1, 0x01).unwrap();
        assert_eq!(a_irp.context, 0);
        assert!(core.pending_head.is_some());

        // An unrelated retirement frees a descriptor; the parked pipe
        // is serviced without a new submit call.
        mock::hw_retire(&mut core, 2, 0x01, 1, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(b_irp.context, 1);
        assert!(core.pending_head.is_none());

        mock::hw_retire(&mut core, 1, 0x01, 1, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(a_irp.context, 1);
        assert_eq!(a_irp.status(), TransferStatus::Success);
    }

    #[test]
    fn idempotent_open_and_close() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 7, 0x81);
        assert_eq!(core.ed_pool.live(), 1);
        assert!(core.dir.find(pipe_key(7, 0x81)).is_some());

        // A second open is a no-op, not a second ED.
        open_bulk(&mut core, 7, 0x81);
        assert_eq!(core.ed_pool.live(), 1);
        assert_eq!(core.td_pool.live(), 1);

        core.close_pipe(7, 0x81).unwrap();
        assert!(core.dir.find(pipe_key(7, 0x81)).is_none());
        assert_eq!(core.ed_pool.live(), 0);
        assert_eq!(core.td_pool.live(), 0);
        assert_eq!(core.close_pipe(7, 0x81), Err(Error::UnknownPipe));
    }

    #[test]
    fn unknown_pipe_errors() {
        let mut core = mock::test_core();
        let mut irp = Irp::transfer(core::ptr::null_mut(), 0, IrpFlags::empty(), count);
        assert_eq!(
            core.submit_irp(NonNull::from(&mut irp), 20, 0x01),
            Err(Error::UnknownPipe)
        );
        assert_eq!(core.flush_pipe(20, 0x01), Err(Error::UnknownPipe));
        assert_eq!(
            core.open_pipe(20, 0x01, 0x02, Speed::High, 64, 0, 0),
            Err(Error::UnsupportedSpeed)
        );
    }

    #[test]
    fn interrupt_admission() {
        let mut core = mock::test_core();
        // An every-frame endpoint claiming most of the budget.
        core.open_pipe(9, 0x81, 0x03, Speed::Full, 8, 1000, 800)
            .unwrap();
        assert!(core.loads.iter().all(|&l| l == 800));

        // No starting branch can absorb another 200 units.
        assert_eq!(
            core.open_pipe(9, 0x82, 0x03, Speed::Full, 8, 4000, 200),
            Err(Error::NoBandwidth)
        );
        assert!(core.dir.find(pipe_key(9, 0x82)).is_none());
        assert_eq!(core.ed_pool.live(), 1);
        assert_eq!(core.td_pool.live(), 1);
        assert!(core.loads.iter().all(|&l| l == 800));
    }

    #[test]
    fn periodic_chains_sorted() {
        let mut core = mock::test_core();
        core.open_pipe(10, 0x81, 0x03, Speed::Full, 8, 8_000, 50)
            .unwrap();
        core.open_pipe(11, 0x81, 0x03, Speed::Full, 8, 32_000, 30)
            .unwrap();
        core.open_pipe(12, 0x81, 0x03, Speed::Full, 8, 2_000, 20)
            .unwrap();

        let total: u32 = core.loads.iter().map(|&l| l as u32).sum();
        assert_eq!(total, 50 * 4 + 30 + 20 * 16);

        // Every branch chain lists intervals in descending order.
        let hcca = unsafe { &*core.hcca.as_ptr() };
        for b in 0..crate::PERIODIC_BRANCHES {
            let mut bus = hcca.INTERRUPT_TABLE[b].read();
            let mut prev_interval = u8::MAX;
            while bus != 0 {
                let idx = core.dir.find_by_ed(bus).unwrap();
                let pipe = core.pipes[idx as usize].as_ref().unwrap();
                assert!(pipe.interval <= prev_interval);
                prev_interval = pipe.interval;
                bus = core.ed_pool.get(pipe.ed).next_ptr();
            }
        }

        core.close_pipe(10, 0x81).unwrap();
        core.close_pipe(11, 0x81).unwrap();
        core.close_pipe(12, 0x81).unwrap();
        assert!(core.loads.iter().all(|&l| l == 0));
        for b in 0..crate::PERIODIC_BRANCHES {
            assert_eq!(hcca.INTERRUPT_TABLE[b].read(), 0);
        }
    }

    #[test]
    fn iso_submit_and_retire() {
        let mut core = mock::test_core();
        core.open_pipe(6, 0x04, 0x01, Speed::Full, 64, 1000, 50)
            .unwrap();

        let mut buf = vec![0u8; 192];
        let mut pkts = [
            IsoPacket::new(buf.as_mut_ptr(), 64),
            IsoPacket::new(unsafe { buf.as_mut_ptr().add(64) }, 64),
            IsoPacket::new(unsafe { buf.as_mut_ptr().add(128) }, 64),
        ];
        let mut irp =
            unsafe { Irp::isochronous(NonNull::from(&mut pkts[0]), 3, count) };
        core.submit_irp(NonNull::from(&mut irp), 6, 0x04).unwrap();

        mock::hw_retire_iso(&mut core, 6, 0x04, cc::NO_ERROR);
        core.isr();

        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(irp.actual_length(), 192);
        assert_eq!(pkts[0].actual, 64);
        assert_eq!(pkts[2].status, TransferStatus::Success);
    }

    #[test]
    fn iso_ring_overflow() {
        let mut core = mock::test_core();
        core.open_pipe(3, 0x83, 0x01, Speed::Full, 64, 1000, 50)
            .unwrap();

        let mut bufs = vec![0u8; 64];
        let mut storage = Vec::new();
        for _ in 0..MAX_PEND_IRPS - 1 {
            let pkt = Box::leak(Box::new([IsoPacket::new(bufs.as_mut_ptr(), 64)]));
            let irp = Box::leak(Box::new(unsafe {
                Irp::isochronous(NonNull::from(&mut pkt[0]), 1, count)
            }));
            core.submit_irp(NonNull::from(&mut *irp), 3, 0x83).unwrap();
            storage.push(irp);
        }

        // The ring is full at MAX_PEND_IRPS - 1 outstanding; the next
        // submission is rejected without touching the ring.
        let pkt = Box::leak(Box::new([IsoPacket::new(bufs.as_mut_ptr(), 64)]));
        let mut extra =
            unsafe { Irp::isochronous(NonNull::from(&mut pkt[0]), 1, count) };
        assert_eq!(
            core.submit_irp(NonNull::from(&mut extra), 3, 0x83),
            Err(Error::IsoRingFull)
        );
        for irp in &storage {
            assert_eq!(irp.context, 0);
        }
    }

    #[test]
    fn flush_cancels_everything() {
        let mut core = mock::test_core();
        open_bulk(&mut core, 4, 0x01);
        let mut buf = [0u8; 64];
        let mut first = Irp::transfer(buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        let mut second = Irp::transfer(buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut first), 4, 0x01).unwrap();
        core.submit_irp(NonNull::from(&mut second), 4, 0x01).unwrap();

        core.flush_pipe(4, 0x01).unwrap();
        assert_eq!(first.context, 1);
        assert_eq!(first.status(), TransferStatus::Canceled);
        assert_eq!(second.context, 1);
        assert_eq!(second.status(), TransferStatus::Canceled);
        assert_eq!(core.td_pool.live(), 1);

        // The pipe stays open and usable.
        let mut third = Irp::transfer(buf.as_mut_ptr(), 64, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut third), 4, 0x01).unwrap();
        mock::hw_retire(&mut core, 4, 0x01, 1, cc::NO_ERROR, 0);
        core.isr();
        assert_eq!(third.status(), TransferStatus::Success);
    }

    #[test]
    fn modify_preserves_speed() {
        let mut core = mock::test_core();
        core.open_pipe(8, 0x01, 0x02, Speed::Low, 8, 0, 0).unwrap();
        core.modify_pipe(8, 0x01, 0x02, 32, 0, 0).unwrap();
        let idx = core.dir.find(pipe_key(8, 0x01)).unwrap();
        let pipe = core.pipes[idx as usize].as_ref().unwrap();
        assert_eq!(pipe.speed, Speed::Low);
        assert_eq!(pipe.max_packet, 32);
        assert_eq!(core.ed_pool.live(), 1);
    }

    #[test]
    fn roothub_dispatch() {
        let mut core = mock::test_core_with_ports(2);

        let mut buf = [0u8; 18];
        let setup = [0x80, 6, 0, 1, 0, 0, 18, 0];
        let mut irp = Irp::control(setup, buf.as_mut_ptr(), 18, count);
        core.submit_irp(NonNull::from(&mut irp), 0, 0).unwrap();
        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(buf[0], 18);
        // Hub device class.
        assert_eq!(buf[4], 9);

        // SetPortFeature(PORT_RESET) on port 1 strobes PRS.
        let setup = [0x23, 3, 4, 0, 1, 0, 0, 0];
        let mut reset = Irp::control(setup, core::ptr::null_mut(), 0, count);
        core.submit_irp(NonNull::from(&mut reset), 0, 0).unwrap();
        assert_eq!(reset.status(), TransferStatus::Success);
        assert_ne!(
            core.regs.HCRHPORTSTATUS[0].read() & PortStatus::PRS.bits(),
            0
        );

        // SetAddress relocates the bypass address.
        let setup = [0x00, 5, 1, 0, 0, 0, 0, 0];
        let mut addr = Irp::control(setup, core::ptr::null_mut(), 0, count);
        core.submit_irp(NonNull::from(&mut addr), 0, 0).unwrap();
        assert_eq!(core.roothub.addr, 1);
    }

    #[test]
    fn roothub_status_change() {
        let mut core = mock::test_core_with_ports(2);

        // Park a status-change IRP on the interrupt endpoint.
        let mut buf = [0u8; 2];
        let mut irp = Irp::transfer(buf.as_mut_ptr(), 2, IrpFlags::empty(), count);
        core.submit_irp(NonNull::from(&mut irp), 0, 0x81).unwrap();
        assert_eq!(irp.context, 0);

        // A connect change on port 1 completes it through the ISR.
        core.regs.HCRHPORTSTATUS[0]
            .write((PortStatus::CCS | PortStatus::CSC).bits());
        let status = core.regs.HCINTERRUPTSTATUS.read();
        core.regs
            .HCINTERRUPTSTATUS
            .write(status | Interrupts::RHSC.bits());
        core.isr();

        assert_eq!(irp.context, 1);
        assert_eq!(irp.status(), TransferStatus::Success);
        assert_eq!(buf[0], 0x02);
    }
}
