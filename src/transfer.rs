//! IRP translation
//!
//! Turns the active IRP on a pipe into TDs on the pipe's ED. New work
//! is always written into the current dummy tail TD, and a freshly
//! allocated TD becomes the new dummy, so the hardware's tail pointer
//! is never invalid. Pool exhaustion parks the pipe on the global
//! pending list and forces an interrupt onto the last TD that did make
//! it out, so the retirement path can retry.

use crate::host::Core;
use crate::irp::IrpFlags;
use crate::pipe::{IsoSlot, IsoTdMeta, Phase, TdMeta, TransferType, XferState};
use crate::td::{DI_NONE, DI_NOW, DP_IN, DP_OUT, DP_SETUP, TOGGLE_CARRY, TOGGLE_DATA0, TOGGLE_DATA1};
use crate::{
    Error, Irp, UsbPlatform, ISO_SCHEDULE_DELAY, ISO_TX_PER_TD, MAX_ISO_TDS, MAX_PEND_IRPS,
    MAX_TD_BYTES, TDS_PER_BURST,
};

/// What a single TD should carry
enum TdBuffer {
    Empty,
    Setup,
    Data { offset: usize, len: usize },
}

/// TDs an IRP will consume on this pipe
///
/// Control transfers budget a setup TD, at most one one-page data TD,
/// and a status TD. Bulk and interrupt transfers chunk the buffer,
/// plus a trailing zero-length TD when the caller asked for an
/// explicit short-packet terminator on an exact-multiple transfer.
pub(crate) fn td_budget(
    xfer: TransferType,
    max_packet: u16,
    irp: &Irp,
) -> Result<u16, Error> {
    match xfer {
        TransferType::Control => {
            if irp.len > MAX_TD_BYTES {
                return Err(Error::TransferTooLarge);
            }
            Ok(1 + (irp.len > 0) as u16 + 1)
        }
        TransferType::Bulk | TransferType::Interrupt => {
            let mut count = if irp.len == 0 {
                1
            } else {
                irp.len.div_ceil(MAX_TD_BYTES) as u16
            };
            if irp.len > 0
                && irp.flags.contains(IrpFlags::ZERO_PACKET)
                && max_packet != 0
                && irp.len % max_packet as usize == 0
            {
                count += 1;
            }
            Ok(count)
        }
        // Isochronous work is measured in transactions, not TDs.
        TransferType::Isochronous => Ok(0),
    }
}

impl<P: UsbPlatform> Core<P> {
    /// Push as much of the pipe's active IRP into TDs as allowed
    pub(crate) fn translate_irp(&mut self, idx: u8) {
        let xfer = match self.pipes[idx as usize].as_ref() {
            Some(pipe) => pipe.xfer,
            None => return,
        };
        match xfer {
            TransferType::Control => self.translate_control(idx),
            TransferType::Bulk | TransferType::Interrupt => self.translate_general(idx),
            TransferType::Isochronous => self.translate_iso(idx, usize::MAX),
        }
    }

    fn translate_general(&mut self, idx: u8) {
        let mut burst: u16 = 0;
        let mut scheduled_any = false;
        loop {
            let (scheduled, required, offset, dir_in, len) = {
                let pipe = self.pipes[idx as usize].as_ref().unwrap();
                let state = match pipe.state.as_ref() {
                    Some(state) => state,
                    None => return,
                };
                let irp = unsafe { &*state.irp.as_ptr() };
                (
                    state.scheduled,
                    state.required,
                    state.offset,
                    pipe.direction_in(),
                    irp.len,
                )
            };
            if scheduled >= required || burst >= TDS_PER_BURST {
                break;
            }

            let chunk = (len - offset).min(MAX_TD_BYTES);
            let last = scheduled + 1 == required;
            // Long IRPs get a progress interrupt every burst's worth of
            // TDs so the ISR can keep feeding the queue.
            let stride = required > TDS_PER_BURST && (scheduled + 1) % TDS_PER_BURST == 0;
            let dp = if dir_in { DP_IN } else { DP_OUT };
            let buffer = if chunk == 0 {
                TdBuffer::Empty
            } else {
                TdBuffer::Data { offset, len: chunk }
            };

            match self.make_td(idx, dp, TOGGLE_CARRY, buffer, last || stride) {
                Ok(()) => {
                    let state = self.pipes[idx as usize]
                        .as_mut()
                        .unwrap()
                        .state
                        .as_mut()
                        .unwrap();
                    state.scheduled += 1;
                    state.offset += chunk;
                    burst += 1;
                    scheduled_any = true;
                }
                Err(_) => {
                    if scheduled_any {
                        self.activate(idx);
                    }
                    self.park(idx);
                    return;
                }
            }
        }
        if scheduled_any {
            self.activate(idx);
        }
    }

    fn translate_control(&mut self, idx: u8) {
        let mut scheduled_any = false;
        loop {
            let (phase, scheduled, required, data_in, len) = {
                let pipe = self.pipes[idx as usize].as_ref().unwrap();
                let state = match pipe.state.as_ref() {
                    Some(state) => state,
                    None => return,
                };
                let irp = unsafe { &*state.irp.as_ptr() };
                (
                    state.phase,
                    state.scheduled,
                    state.required,
                    state.data_in,
                    irp.len,
                )
            };
            if scheduled >= required {
                break;
            }

            let result = match phase {
                Phase::Setup => {
                    self.make_td(idx, DP_SETUP, TOGGLE_DATA0, TdBuffer::Setup, false)
                }
                Phase::Data => {
                    let dp = if data_in { DP_IN } else { DP_OUT };
                    self.make_td(idx, dp, TOGGLE_DATA1, TdBuffer::Data { offset: 0, len }, false)
                }
                Phase::Status => {
                    // Opposite PID from the data phase; OUT when the
                    // transfer had no data phase. Always DATA1, always
                    // interrupting.
                    let dp = if len == 0 || data_in { DP_OUT } else { DP_IN };
                    self.make_td(idx, dp, TOGGLE_DATA1, TdBuffer::Empty, true)
                }
            };

            match result {
                Ok(()) => {
                    let state = self.pipes[idx as usize]
                        .as_mut()
                        .unwrap()
                        .state
                        .as_mut()
                        .unwrap();
                    state.scheduled += 1;
                    state.phase = match state.phase {
                        Phase::Setup if len > 0 => Phase::Data,
                        Phase::Setup => Phase::Status,
                        Phase::Data => Phase::Status,
                        // Rewound for the next IRP on this pipe.
                        Phase::Status => Phase::Setup,
                    };
                    scheduled_any = true;
                }
                Err(_) => {
                    if scheduled_any {
                        self.activate(idx);
                    }
                    self.park(idx);
                    return;
                }
            }
        }
        if scheduled_any {
            self.activate(idx);
        }
    }

    /// Fill the current dummy TD and grow a new dummy behind it
    fn make_td(
        &mut self,
        idx: u8,
        dp: u32,
        toggle: u32,
        buffer: TdBuffer,
        interrupt: bool,
    ) -> Result<(), Error> {
        let new_dummy = {
            let Core {
                ref mut td_pool,
                ref mut platform,
                ..
            } = *self;
            td_pool.alloc(platform)?
        };

        let (cur, irp_ptr) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.dummy.unwrap(), pipe.state.as_ref().unwrap().irp)
        };
        let irp = unsafe { &mut *irp_ptr.as_ptr() };

        let (orig, len) = match buffer {
            TdBuffer::Empty => (core::ptr::null_mut(), 0),
            TdBuffer::Setup => (irp.setup.as_mut_ptr(), irp.setup.len()),
            TdBuffer::Data { offset, len } => (unsafe { irp.data.add(offset) }, len),
        };
        let (mirror, bus) = if len > 0 {
            let mirror = self.platform.normalize(orig, len);
            (mirror, self.platform.bus_address(mirror))
        } else {
            (core::ptr::null_mut(), 0)
        };

        let new_bus = self.td_pool.bus_addr(&self.platform, new_dummy);
        {
            let td = self.td_pool.get(cur);
            td.arm(dp, toggle, if interrupt { DI_NOW } else { DI_NONE }, false);
            td.set_buffer(bus, len as u32);
            td.set_next(new_bus);
        }
        *self.td_pool.meta_mut(cur) = TdMeta {
            owner: Some(idx),
            orig,
            mirror,
            len: len as u32,
        };

        let ed = self.pipes[idx as usize].as_ref().unwrap().ed;
        self.ed_pool.get(ed).set_tail(new_bus);

        let pipe = self.pipes[idx as usize].as_mut().unwrap();
        pipe.dummy = Some(new_dummy);
        pipe.last_td = Some(cur);
        Ok(())
    }

    /// New work is visible: stop skipping the ED and nudge the controller
    fn activate(&mut self, idx: u8) {
        let (ed, xfer) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.ed, pipe.xfer)
        };
        self.ed_pool.get(ed).set_skip(false);
        self.commit_filled(xfer);
    }

    /// Park a pipe on the global pending list after pool exhaustion
    fn park(&mut self, idx: u8) {
        let (already, last) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.on_pending_list, pipe.last_td)
        };
        if !already {
            {
                let pipe = self.pipes[idx as usize].as_mut().unwrap();
                pipe.on_pending_list = true;
                pipe.pending_next = None;
            }
            match self.pending_tail {
                None => self.pending_head = Some(idx),
                Some(tail) => {
                    self.pipes[tail as usize].as_mut().unwrap().pending_next = Some(idx)
                }
            }
            self.pending_tail = Some(idx);
        }
        // Wake the ISR at the next retirement even if no TD in this IRP
        // asked for an interrupt yet.
        if let Some(last) = last {
            self.td_pool.get(last).interrupt_now();
        }
        warn!("TD pool exhausted; pipe parked for retry");
    }

    /// Take the oldest parked pipe off the pending list
    pub(crate) fn pop_pending(&mut self) -> Option<u8> {
        let idx = self.pending_head?;
        let next = match self.pipes[idx as usize].as_mut() {
            Some(pipe) => {
                pipe.on_pending_list = false;
                pipe.pending_next.take()
            }
            None => None,
        };
        self.pending_head = next;
        if next.is_none() {
            self.pending_tail = None;
        }
        Some(idx)
    }

    /// Drop a closing pipe from the pending list, wherever it sits
    pub(crate) fn remove_pending(&mut self, idx: u8) {
        let mut prev: Option<u8> = None;
        let mut cursor = self.pending_head;
        while let Some(c) = cursor {
            let next = self.pipes[c as usize]
                .as_ref()
                .and_then(|p| p.pending_next);
            if c == idx {
                match prev {
                    None => self.pending_head = next,
                    Some(p) => {
                        self.pipes[p as usize].as_mut().unwrap().pending_next = next
                    }
                }
                if self.pending_tail == Some(idx) {
                    self.pending_tail = prev;
                }
                if let Some(pipe) = self.pipes[idx as usize].as_mut() {
                    pipe.on_pending_list = false;
                    pipe.pending_next = None;
                }
                return;
            }
            prev = Some(c);
            cursor = next;
        }
    }

    /// Pack queued isochronous transactions into at most `budget` TDs
    ///
    /// Transactions pack eight to a TD while their buffers stay
    /// contiguous and within one page pair. The starting-frame field
    /// continues the pipe's frame cadence; the first TD after an idle
    /// period re-seeds it a couple of frames ahead of the hardware.
    pub(crate) fn translate_iso(&mut self, idx: u8, mut budget: usize) {
        loop {
            if budget == 0 {
                return;
            }
            // Oldest ring slot that still has unscheduled transactions.
            let (ring_idx, irp_ptr, sched_tx, req_tx) = {
                let pipe = match self.pipes[idx as usize].as_ref() {
                    Some(pipe) => pipe,
                    None => return,
                };
                let iso = match pipe.iso.as_ref() {
                    Some(iso) => iso,
                    None => return,
                };
                let mut found = None;
                let mut r = iso.done;
                while r != iso.submit {
                    if let Some(slot) = iso.ring[r as usize].as_ref() {
                        if slot.scheduled_tx < slot.required_tx {
                            found = Some((r, slot.irp, slot.scheduled_tx, slot.required_tx));
                            break;
                        }
                    }
                    r = ((r as usize + 1) % MAX_PEND_IRPS) as u8;
                }
                match found {
                    Some(found) => found,
                    None => return,
                }
            };

            // The slot after the current dummy bounds outstanding TDs.
            let (fill, next_free) = {
                let iso = self.pipes[idx as usize]
                    .as_ref()
                    .unwrap()
                    .iso
                    .as_ref()
                    .unwrap();
                let next = (iso.fill as usize + 1) % MAX_ISO_TDS;
                (iso.fill as usize, !iso.meta[next].in_use)
            };
            if !next_free {
                return;
            }

            let irp = unsafe { &*irp_ptr.as_ptr() };
            let first = sched_tx as usize;
            let base = irp.packet(first).buffer;
            let mut count = 1usize;
            let mut span = irp.packet(first).length as usize;
            while first + count < req_tx as usize && count < ISO_TX_PER_TD {
                let pkt = irp.packet(first + count);
                if pkt.buffer != unsafe { base.add(span) } {
                    break;
                }
                if (base as usize & 0xFFF) + span + pkt.length as usize > 0x2000 {
                    break;
                }
                span += pkt.length as usize;
                count += 1;
            }

            let mirror = self.platform.normalize(base, span);
            let bus = self.platform.bus_address(mirror);

            let frame = {
                let iso = self.pipes[idx as usize]
                    .as_ref()
                    .unwrap()
                    .iso
                    .as_ref()
                    .unwrap();
                if iso.primed {
                    iso.next_frame
                } else {
                    let hcca = unsafe { &*self.hcca.as_ptr() };
                    hcca.FRAME_NUMBER.read().wrapping_add(ISO_SCHEDULE_DELAY)
                }
            };

            let tail_bus = {
                let pipe = self.pipes[idx as usize].as_mut().unwrap();
                let iso = pipe.iso.as_mut().unwrap();
                let next = (fill + 1) % MAX_ISO_TDS;
                let td = iso.td(fill);
                td.arm(frame, count as u32, DI_NOW);
                if span == 0 {
                    td.BP0.write(bus & !0xFFF);
                    td.BE.write(bus);
                } else {
                    td.BP0.write(bus & !0xFFF);
                    td.BE.write(bus + span as u32 - 1);
                }
                // Offsets are relative to the BP0 page; bit 12 flips to
                // the BE page as the cursor crosses the boundary.
                let mut off = bus & 0xFFF;
                for j in 0..count {
                    td.set_psw_offset(j, off as u16);
                    off += irp.packet(first + j).length as u32;
                }
                td.set_next(iso.slot_bus(next));
                iso.meta[fill] = IsoTdMeta {
                    in_use: true,
                    ring: ring_idx,
                    first_tx: sched_tx,
                    tx_count: count as u8,
                    orig: base,
                    mirror,
                    span,
                };
                iso.fill = next as u8;
                iso.next_frame = frame.wrapping_add(count as u16);
                iso.primed = true;
                if let Some(slot) = iso.ring[ring_idx as usize].as_mut() {
                    slot.scheduled_tx += count as u16;
                }
                iso.slot_bus(next)
            };

            let ed = self.pipes[idx as usize].as_ref().unwrap().ed;
            self.ed_pool.get(ed).set_tail(tail_bus);
            self.ed_pool.get(ed).set_skip(false);
            budget -= 1;
        }
    }

    /// Put a freshly dequeued IRP in flight on an idle pipe
    pub(crate) fn start_irp(&mut self, idx: u8, irp_ptr: core::ptr::NonNull<Irp>) {
        {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            let irp = unsafe { &*irp_ptr.as_ptr() };
            let required = td_budget(pipe.xfer, pipe.max_packet, irp).unwrap_or(0);
            let data_in = if pipe.xfer == TransferType::Control {
                irp.setup_direction_in()
            } else {
                pipe.direction_in()
            };
            pipe.state = Some(XferState::new(irp_ptr, required, data_in));
        }
        self.translate_irp(idx);
    }

    /// Queue an isochronous IRP into the pipe's ring
    pub(crate) fn enqueue_iso(
        &mut self,
        idx: u8,
        irp_ptr: core::ptr::NonNull<Irp>,
        transactions: u16,
    ) -> Result<(), Error> {
        {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            let iso = pipe.iso.as_mut().unwrap();
            if iso.ring_full() {
                return Err(Error::IsoRingFull);
            }
            let r = iso.submit as usize;
            iso.ring[r] = Some(IsoSlot {
                irp: irp_ptr,
                required_tx: transactions,
                scheduled_tx: 0,
                done_tx: 0,
            });
            iso.submit = ((r + 1) % MAX_PEND_IRPS) as u8;
        }
        self.translate_iso(idx, usize::MAX);
        Ok(())
    }
}
