//! TD retirement
//!
//! The controller delivers retired TDs as a single done queue, newest
//! first. The engine reverses the queue in place so completions are
//! observed oldest first, retires each TD, accumulates IRP progress,
//! and - when a pool slot just opened up - gives one parked pipe
//! another chance to schedule.

use crate::host::Core;
use crate::irp::{IrpFlags, TransferStatus};
use crate::pipe::TransferType;
use crate::pool::Handle;
use crate::ral;
use crate::td::{self, cc};
use crate::{UsbPlatform, MAX_PEND_IRPS};

/// A done-queue entry, discriminated by which arena owns its address
enum DoneItem {
    General(Handle),
    Iso { pipe: u8, slot: usize },
}

impl<P: UsbPlatform> Core<P> {
    /// Drain and retire everything the hardware wrote back
    pub(crate) fn drain_done_queue(&mut self) {
        let hcca = unsafe { &*self.hcca.as_ptr() };
        // Bit 0 flags another pending interrupt; the rest of the low
        // nibble is alignment slack.
        let head = hcca.DONE_HEAD.read() & !0xF;
        hcca.DONE_HEAD.write(0);
        if head == 0 {
            return;
        }

        // Reverse the queue in place: the hardware links newest first.
        let mut prev: u32 = 0;
        let mut cur = head;
        while cur != 0 {
            let item = match self.classify_done(cur) {
                Some(item) => item,
                None => break,
            };
            let next = self.done_next(&item);
            self.set_done_next(&item, prev);
            prev = cur;
            cur = next;
        }

        // Process oldest first.
        let mut cur = prev;
        while cur != 0 {
            let item = match self.classify_done(cur) {
                Some(item) => item,
                None => break,
            };
            let next = self.done_next(&item);
            match item {
                DoneItem::General(handle) => self.retire_general(handle),
                DoneItem::Iso { pipe, slot } => self.retire_iso(pipe, slot),
            }
            cur = next;
        }
    }

    fn classify_done(&self, bus: u32) -> Option<DoneItem> {
        if let Some(handle) = self.td_pool.from_bus(&self.platform, bus) {
            return Some(DoneItem::General(handle));
        }
        for (i, pipe) in self.pipes.iter().enumerate() {
            if let Some(iso) = pipe.as_ref().and_then(|p| p.iso.as_ref()) {
                if let Some(slot) = iso.slot_of_bus(bus) {
                    return Some(DoneItem::Iso {
                        pipe: i as u8,
                        slot,
                    });
                }
            }
        }
        None
    }

    fn done_next(&self, item: &DoneItem) -> u32 {
        match *item {
            DoneItem::General(handle) => self.td_pool.get(handle).next_ptr(),
            DoneItem::Iso { pipe, slot } => self.pipes[pipe as usize]
                .as_ref()
                .unwrap()
                .iso
                .as_ref()
                .unwrap()
                .td(slot)
                .next_ptr(),
        }
    }

    fn set_done_next(&self, item: &DoneItem, bus: u32) {
        match *item {
            DoneItem::General(handle) => self.td_pool.get(handle).set_next(bus),
            DoneItem::Iso { pipe, slot } => self.pipes[pipe as usize]
                .as_ref()
                .unwrap()
                .iso
                .as_ref()
                .unwrap()
                .td(slot)
                .set_next(bus),
        }
    }

    fn retire_general(&mut self, handle: Handle) {
        let meta = *self.td_pool.meta(handle);
        let (code, wants_interrupt, remaining, dp) = {
            let td = self.td_pool.get(handle);
            (
                td.condition_code(),
                td.interrupts(),
                td.bytes_remaining(),
                ral::read_reg!(crate::td, td, CONTROL, DP),
            )
        };

        // Fold the coherent mirror back for device-to-host data.
        if meta.len > 0 && dp == td::DP_IN {
            unsafe {
                self.platform
                    .denormalize(meta.mirror, meta.orig, meta.len as usize);
            }
        }

        {
            let Core {
                ref mut td_pool,
                ref mut platform,
                ..
            } = *self;
            td_pool.dealloc(platform, handle);
        }

        // The pipe may have been closed or flushed underneath the
        // hardware; the TD is freed either way.
        let idx = match meta.owner {
            Some(idx) => idx,
            None => return,
        };
        let live = self.pipes[idx as usize]
            .as_ref()
            .map(|p| p.state.is_some())
            .unwrap_or(false);
        if !live {
            return;
        }

        let (irp_ptr, flags, ed) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            let state = pipe.state.as_ref().unwrap();
            let irp = unsafe { &*state.irp.as_ptr() };
            (state.irp, irp.flags, pipe.ed)
        };

        // Setup bytes never count toward the IRP's data length.
        if (code == cc::NO_ERROR || code == cc::DATA_UNDERRUN) && dp != td::DP_SETUP {
            let transferred = (meta.len - remaining) as usize;
            unsafe {
                (*irp_ptr.as_ptr()).actual += transferred;
            }
        }
        {
            let state = self.pipes[idx as usize]
                .as_mut()
                .unwrap()
                .state
                .as_mut()
                .unwrap();
            state.retired += 1;
        }

        let halted = self.ed_pool.get(ed).is_halted();
        let mut completion: Option<TransferStatus> = None;
        let mut pull_pending = true;

        if code != cc::NO_ERROR && halted {
            // The queue is dead behind this TD. Drop everything still
            // linked and re-arm an empty queue. The toggle survives
            // only when a short packet was explicitly acceptable.
            let accepted_short =
                code == cc::DATA_UNDERRUN && flags.contains(IrpFlags::SHORT_TRANSFER_OK);
            self.ed_pool.get(ed).set_skip(true);
            let carry = if accepted_short {
                self.ed_pool.get(ed).toggle_carry()
            } else {
                0
            };
            self.drop_queued_tds(idx);
            {
                let ed = self.ed_pool.get(ed);
                ed.set_head(ed.tail_ptr(), carry);
            }
            completion = Some(if accepted_short {
                TransferStatus::Success
            } else {
                TransferStatus::from_cc(code)
            });
        } else {
            let (scheduled, required) = {
                let state = self.pipes[idx as usize]
                    .as_ref()
                    .unwrap()
                    .state
                    .as_ref()
                    .unwrap();
                (state.scheduled, state.required)
            };
            if scheduled < required && wants_interrupt {
                // More of this IRP to push; this retirement freed the
                // pool slot it needs.
                self.translate_irp(idx);
                pull_pending = false;
            }
            let finished = self.pipes[idx as usize]
                .as_ref()
                .unwrap()
                .state
                .as_ref()
                .map(|s| s.retired >= s.required)
                .unwrap_or(false);
            if finished {
                completion = Some(TransferStatus::Success);
            }
        }

        if let Some(status) = completion {
            self.complete_active(idx, status);
        }
        if pull_pending {
            self.service_pending();
        }
    }

    /// Free every TD still linked between the ED's head and tail
    pub(crate) fn drop_queued_tds(&mut self, idx: u8) {
        let ed = self.pipes[idx as usize].as_ref().unwrap().ed;
        let tail = self.ed_pool.get(ed).tail_ptr();
        let mut cur = self.ed_pool.get(ed).head_ptr();
        while cur != 0 && cur != tail {
            let handle = match self.td_pool.from_bus(&self.platform, cur) {
                Some(handle) => handle,
                None => break,
            };
            cur = self.td_pool.get(handle).next_ptr();
            let Core {
                ref mut td_pool,
                ref mut platform,
                ..
            } = *self;
            td_pool.dealloc(platform, handle);
        }
    }

    /// Finish the pipe's active IRP and decide what runs next
    pub(crate) fn complete_active(&mut self, idx: u8, status: TransferStatus) {
        let (id, irp_ptr) = {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            let state = match pipe.state.take() {
                Some(state) => state,
                None => return,
            };
            pipe.last_td = None;
            (pipe.id, state.irp)
        };

        let irp = unsafe { &mut *irp_ptr.as_ptr() };
        irp.status = status;
        if let Some(callback) = irp.callback {
            callback(id, irp);
        }

        if status != TransferStatus::Success {
            // An error on the active IRP poisons the whole queue.
            loop {
                let queued = self.pipes[idx as usize].as_mut().unwrap().pend.pop();
                match queued {
                    Some(q) => {
                        let q = unsafe { &mut *q.as_ptr() };
                        q.status = status;
                        if let Some(callback) = q.callback {
                            callback(id, q);
                        }
                    }
                    None => break,
                }
            }
        } else {
            let next = self.pipes[idx as usize].as_mut().unwrap().pend.pop();
            if let Some(next) = next {
                self.start_irp(idx, next);
            }
        }
    }

    /// Give one parked pipe another shot at the pool
    pub(crate) fn service_pending(&mut self) {
        if let Some(idx) = self.pop_pending() {
            if self.pipes[idx as usize].is_some() {
                // A renewed failure re-parks it.
                self.translate_irp(idx);
            }
        }
    }

    fn retire_iso(&mut self, idx: u8, slot: usize) {
        let (meta, code) = {
            let pipe = match self.pipes[idx as usize].as_ref() {
                Some(pipe) => pipe,
                None => return,
            };
            let iso = pipe.iso.as_ref().unwrap();
            (iso.meta[slot], iso.td(slot).condition_code())
        };
        if !meta.in_use {
            return;
        }

        let dir_in = self.pipes[idx as usize].as_ref().unwrap().direction_in();
        let ring_idx = meta.ring;
        let occupant = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            let iso = pipe.iso.as_ref().unwrap();
            iso.ring[ring_idx as usize].as_ref().map(|s| s.irp)
        };
        let irp_ptr = match occupant {
            Some(irp_ptr) => irp_ptr,
            None => {
                // Flushed underneath; just reclaim the array slot.
                let pipe = self.pipes[idx as usize].as_mut().unwrap();
                pipe.iso.as_mut().unwrap().meta[slot].in_use = false;
                return;
            }
        };

        // Harvest per-transaction results from the packet status words.
        {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            let iso = pipe.iso.as_ref().unwrap();
            let td = iso.td(slot);
            let irp = unsafe { &*irp_ptr.as_ptr() };
            for j in 0..meta.tx_count as usize {
                let pkt = irp.packet(meta.first_tx as usize + j);
                if td.psw_accessed(j) {
                    let tx_cc = td.psw_condition(j);
                    pkt.status = TransferStatus::from_cc(tx_cc);
                    // An OUT transaction reports size 0 on success.
                    pkt.actual = if !dir_in && tx_cc == cc::NO_ERROR {
                        pkt.length
                    } else {
                        td.psw_size(j)
                    };
                } else {
                    pkt.status = TransferStatus::NotAccessed;
                    pkt.actual = 0;
                }
            }
        }
        if meta.span > 0 && dir_in {
            unsafe {
                self.platform.denormalize(meta.mirror, meta.orig, meta.span);
            }
        }

        {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            let iso = pipe.iso.as_mut().unwrap();
            iso.meta[slot].in_use = false;
            if let Some(ring) = iso.ring[ring_idx as usize].as_mut() {
                ring.done_tx += meta.tx_count as u16;
            }
        }

        let ed = self.pipes[idx as usize].as_ref().unwrap().ed;
        let fatal = self.ed_pool.get(ed).is_halted()
            || code == cc::STALL
            || code == cc::DATA_OVERRUN;

        if fatal {
            // Flush the array, force the current IRP to completion, and
            // re-arm an empty queue at the array base.
            let base = {
                let pipe = self.pipes[idx as usize].as_mut().unwrap();
                let iso = pipe.iso.as_mut().unwrap();
                for m in iso.meta.iter_mut() {
                    m.in_use = false;
                }
                if let Some(ring) = iso.ring[ring_idx as usize].as_mut() {
                    ring.scheduled_tx = ring.required_tx;
                    ring.done_tx = ring.required_tx;
                }
                iso.fill = 0;
                iso.primed = false;
                iso.slot_bus(0)
            };
            let ed = self.ed_pool.get(ed);
            ed.set_skip(true);
            ed.set_head(base, 0);
            ed.set_tail(base);
        } else {
            // Top the queue back up, one TD per retirement to bound
            // ISR-context work.
            self.translate_iso(idx, 1);
        }

        let finished = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            let iso = pipe.iso.as_ref().unwrap();
            iso.ring[ring_idx as usize]
                .as_ref()
                .map(|r| r.done_tx >= r.required_tx)
                .unwrap_or(false)
        };
        if finished {
            let status = if code == cc::NO_ERROR || code == cc::DATA_UNDERRUN {
                TransferStatus::Success
            } else {
                TransferStatus::from_cc(code)
            };
            self.complete_iso(idx, ring_idx, status);
        }
    }

    fn complete_iso(&mut self, idx: u8, ring_idx: u8, status: TransferStatus) {
        let (id, irp_ptr) = {
            let pipe = self.pipes[idx as usize].as_mut().unwrap();
            let iso = pipe.iso.as_mut().unwrap();
            let slot = match iso.ring[ring_idx as usize].take() {
                Some(slot) => slot,
                None => return,
            };
            iso.done = ((ring_idx as usize + 1) % MAX_PEND_IRPS) as u8;
            (pipe.id, slot.irp)
        };

        let irp = unsafe { &mut *irp_ptr.as_ptr() };
        irp.status = status;
        irp.actual = (0..irp.iso_count)
            .map(|i| irp.packet(i).actual as usize)
            .sum();
        if let Some(callback) = irp.callback {
            callback(id, irp);
        }

        if status != TransferStatus::Success {
            self.cancel_iso_ring(idx, status);
        }
    }

    /// Retire every IRP still in the isochronous ring with `status`
    pub(crate) fn cancel_iso_ring(&mut self, idx: u8, status: TransferStatus) {
        loop {
            let next = {
                let pipe = match self.pipes[idx as usize].as_mut() {
                    Some(pipe) => pipe,
                    None => return,
                };
                let id = pipe.id;
                let iso = pipe.iso.as_mut().unwrap();
                if iso.ring_empty() {
                    None
                } else {
                    let r = iso.done as usize;
                    let slot = iso.ring[r].take();
                    iso.done = ((r + 1) % MAX_PEND_IRPS) as u8;
                    Some(slot.map(|s| (id, s.irp)))
                }
            };
            match next {
                Some(Some((id, irp_ptr))) => {
                    let irp = unsafe { &mut *irp_ptr.as_ptr() };
                    irp.status = status;
                    if let Some(callback) = irp.callback {
                        callback(id, irp);
                    }
                }
                Some(None) => continue,
                None => return,
            }
        }
    }

    /// Synchronous cancellation used by Flush_Pipe and Close_Pipe
    ///
    /// Skips the ED, waits out the current frame, frees every queued
    /// descriptor, and retires the active and queued IRPs as canceled.
    /// The caller's thread performs all of it; nothing is deferred.
    pub(crate) fn cancel_pipe_transfers(&mut self, idx: u8) {
        let (ed, xfer) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.ed, pipe.xfer)
        };
        self.ed_pool.get(ed).set_skip(true);
        self.platform.delay_ms(1);

        if xfer == TransferType::Isochronous {
            let base = {
                let pipe = self.pipes[idx as usize].as_mut().unwrap();
                let iso = pipe.iso.as_mut().unwrap();
                for m in iso.meta.iter_mut() {
                    m.in_use = false;
                }
                iso.fill = 0;
                iso.primed = false;
                iso.slot_bus(0)
            };
            {
                let ed = self.ed_pool.get(ed);
                ed.set_head(base, 0);
                ed.set_tail(base);
            }
            self.cancel_iso_ring(idx, TransferStatus::Canceled);
        } else {
            self.drop_queued_tds(idx);
            {
                let ed = self.ed_pool.get(ed);
                ed.set_head(ed.tail_ptr(), 0);
            }
            // Also drains the pending FIFO with the same status.
            self.complete_active(idx, TransferStatus::Canceled);
        }
    }
}
