//! Hardware schedule maintenance
//!
//! Control and bulk EDs live on tail-tracked chains rooted in the
//! HcControlHeadED / HcBulkHeadED registers. Periodic EDs hang off the
//! HCCA's 32 interrupt-table branches; an ED with normalized interval
//! `n` is linked into every `n`-th branch starting at its assigned
//! branch, and each branch chain stays sorted by descending interval so
//! the per-interval chains merge cleanly (intervals are powers of two).
//! A per-branch load table enforces the USB 1.1 frame budget.

use crate::host::Core;
use crate::pipe::TransferType;
use crate::ral;
use crate::{UsbPlatform, FRAME_BANDWIDTH, PERIODIC_BRANCHES};

/// Head and tail of one software ED chain
#[derive(Clone, Copy)]
pub(crate) struct ListAnchor {
    pub head: Option<u8>,
    pub tail: Option<u8>,
}

impl ListAnchor {
    pub const fn new() -> Self {
        ListAnchor {
            head: None,
            tail: None,
        }
    }
}

/// Clamp a microsecond polling interval to a frame count the periodic
/// table can express: a power of two between 1 and 32.
pub(crate) fn normalize_interval(interval_us: u32) -> u8 {
    let frames = (interval_us / 1000).max(1);
    let mut pow = 1u32;
    while pow * 2 <= frames && pow * 2 <= PERIODIC_BRANCHES as u32 {
        pow *= 2;
    }
    pow as u8
}

impl<P: UsbPlatform> Core<P> {
    /// Pick the periodic starting branch with the most headroom
    ///
    /// A branch qualifies only if every one of its strided slots can
    /// absorb `load` without breaking the frame budget; among
    /// qualifying branches the one with the lightest current load
    /// wins. `None` means the request is unschedulable.
    pub(crate) fn find_best_schedule(&self, interval: u8, load: u16) -> Option<u8> {
        let interval = interval.max(1) as usize;
        let mut best: Option<u8> = None;
        for start in 0..interval.min(PERIODIC_BRANCHES) {
            let fits = (start..PERIODIC_BRANCHES)
                .step_by(interval)
                .all(|b| self.loads[b] + load <= FRAME_BANDWIDTH);
            if !fits {
                continue;
            }
            match best {
                Some(cur) if self.loads[start] >= self.loads[cur as usize] => {}
                _ => best = Some(start as u8),
            }
        }
        best
    }

    /// Append a control or bulk ED to its chain
    pub(crate) fn link_nonperiodic(&mut self, idx: u8) {
        let (ed_bus, is_control) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.ed_bus, pipe.xfer == TransferType::Control)
        };
        let anchor = if is_control {
            self.control_list
        } else {
            self.bulk_list
        };

        match anchor.tail {
            None => {
                // First entry also seeds the hardware head-of-list register.
                if is_control {
                    ral::write_reg!(ral::ohci, self.regs, HCCONTROLHEADED, ed_bus);
                } else {
                    ral::write_reg!(ral::ohci, self.regs, HCBULKHEADED, ed_bus);
                }
            }
            Some(tail) => {
                let tail_ed = self.pipes[tail as usize].as_ref().unwrap().ed;
                self.ed_pool.get(tail_ed).set_next(ed_bus);
                self.pipes[tail as usize].as_mut().unwrap().list_next = Some(idx);
            }
        }

        let anchor = ListAnchor {
            head: anchor.head.or(Some(idx)),
            tail: Some(idx),
        };
        if is_control {
            self.control_list = anchor;
        } else {
            self.bulk_list = anchor;
        }
        self.update_list_enables();
    }

    /// Unlink a control or bulk ED
    ///
    /// The caller has already disabled list processing and waited out
    /// in-flight DMA.
    pub(crate) fn unlink_nonperiodic(&mut self, idx: u8) {
        let (ed_bus, ed, next, is_control) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (
                pipe.ed_bus,
                pipe.ed,
                pipe.list_next,
                pipe.xfer == TransferType::Control,
            )
        };
        let mut anchor = if is_control {
            self.control_list
        } else {
            self.bulk_list
        };

        // Locate the predecessor in the software chain.
        let mut prev: Option<u8> = None;
        let mut cursor = anchor.head;
        while let Some(c) = cursor {
            if c == idx {
                break;
            }
            prev = Some(c);
            cursor = self.pipes[c as usize].as_ref().unwrap().list_next;
        }
        debug_assert_eq!(cursor, Some(idx), "unlinking an ED that is not chained");

        let next_bus = next
            .map(|n| self.pipes[n as usize].as_ref().unwrap().ed_bus)
            .unwrap_or(0);
        match prev {
            None => {
                anchor.head = next;
                if is_control {
                    ral::write_reg!(ral::ohci, self.regs, HCCONTROLHEADED, next_bus);
                } else {
                    ral::write_reg!(ral::ohci, self.regs, HCBULKHEADED, next_bus);
                }
            }
            Some(p) => {
                let p_ed = self.pipes[p as usize].as_ref().unwrap().ed;
                self.ed_pool.get(p_ed).set_next(next_bus);
                self.pipes[p as usize].as_mut().unwrap().list_next = next;
            }
        }
        if anchor.tail == Some(idx) {
            anchor.tail = prev;
        }

        // The hardware may be parked on the removed ED.
        if is_control {
            if ral::read_reg!(ral::ohci, self.regs, HCCONTROLCURRENTED) == ed_bus {
                ral::write_reg!(ral::ohci, self.regs, HCCONTROLCURRENTED, 0);
            }
        } else if ral::read_reg!(ral::ohci, self.regs, HCBULKCURRENTED) == ed_bus {
            ral::write_reg!(ral::ohci, self.regs, HCBULKCURRENTED, 0);
        }

        self.ed_pool.get(ed).set_next(0);
        self.pipes[idx as usize].as_mut().unwrap().list_next = None;
        if is_control {
            self.control_list = anchor;
        } else {
            self.bulk_list = anchor;
        }
        self.update_list_enables();
    }

    /// Link a periodic ED into every strided branch from `branch`
    pub(crate) fn link_periodic(&mut self, idx: u8, branch: u8) {
        let (ed, ed_bus, interval, load) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            (pipe.ed, pipe.ed_bus, pipe.interval.max(1), pipe.load)
        };
        let hcca = unsafe { &*self.hcca.as_ptr() };

        for b in (branch as usize..PERIODIC_BRANCHES).step_by(interval as usize) {
            let mut prev: Option<u8> = None;
            let mut cur_bus = hcca.INTERRUPT_TABLE[b].read();
            let mut already_linked = false;
            while cur_bus != 0 {
                if cur_bus == ed_bus {
                    // Reached through a chain suffix shared with an
                    // earlier stride; nothing to relink.
                    already_linked = true;
                    break;
                }
                let ci = match self.dir.find_by_ed(cur_bus) {
                    Some(ci) => ci,
                    None => break,
                };
                let (c_interval, c_ed) = {
                    let cpipe = self.pipes[ci as usize].as_ref().unwrap();
                    (cpipe.interval, cpipe.ed)
                };
                if c_interval <= interval {
                    break;
                }
                prev = Some(ci);
                cur_bus = self.ed_pool.get(c_ed).next_ptr();
            }

            if !already_linked {
                self.ed_pool.get(ed).set_next(cur_bus);
                match prev {
                    None => hcca.INTERRUPT_TABLE[b].write(ed_bus),
                    Some(pi) => {
                        let p_ed = self.pipes[pi as usize].as_ref().unwrap().ed;
                        self.ed_pool.get(p_ed).set_next(ed_bus);
                    }
                }
            }
            self.loads[b] += load;
        }

        self.pipes[idx as usize].as_mut().unwrap().branch = Some(branch);
        self.update_list_enables();
    }

    /// Remove a periodic ED from every strided branch, mirroring
    /// [`Core::link_periodic`]
    pub(crate) fn unlink_periodic(&mut self, idx: u8) {
        let (ed, ed_bus, interval, load, branch) = {
            let pipe = self.pipes[idx as usize].as_ref().unwrap();
            let branch = match pipe.branch {
                Some(b) => b,
                None => return,
            };
            (pipe.ed, pipe.ed_bus, pipe.interval.max(1), pipe.load, branch)
        };
        let hcca = unsafe { &*self.hcca.as_ptr() };
        let next_bus = self.ed_pool.get(ed).next_ptr();

        for b in (branch as usize..PERIODIC_BRANCHES).step_by(interval as usize) {
            let mut prev: Option<u8> = None;
            let mut cur_bus = hcca.INTERRUPT_TABLE[b].read();
            while cur_bus != 0 && cur_bus != ed_bus {
                let ci = match self.dir.find_by_ed(cur_bus) {
                    Some(ci) => ci,
                    None => break,
                };
                let c_ed = self.pipes[ci as usize].as_ref().unwrap().ed;
                prev = Some(ci);
                cur_bus = self.ed_pool.get(c_ed).next_ptr();
            }
            if cur_bus == ed_bus {
                match prev {
                    None => hcca.INTERRUPT_TABLE[b].write(next_bus),
                    Some(pi) => {
                        let p_ed = self.pipes[pi as usize].as_ref().unwrap().ed;
                        self.ed_pool.get(p_ed).set_next(next_bus);
                    }
                }
            }
            self.loads[b] -= load;
        }

        self.ed_pool.get(ed).set_next(0);
        self.pipes[idx as usize].as_mut().unwrap().branch = None;
        self.update_list_enables();
    }

    /// Recompute the four list-processing enables from current state
    pub(crate) fn update_list_enables(&mut self) {
        let cle = self.control_list.head.is_some();
        let ble = self.bulk_list.head.is_some();
        let mut ple = false;
        let mut ie = false;
        for pipe in self.pipes.iter().flatten() {
            if pipe.branch.is_some() {
                ple = true;
                if pipe.xfer == TransferType::Isochronous {
                    ie = true;
                }
            }
        }
        ral::modify_reg!(
            ral::ohci,
            self.regs,
            HCCONTROL,
            CLE: cle as u32,
            BLE: ble as u32,
            PLE: ple as u32,
            IE: ie as u32
        );
    }

    /// Tell the controller new work landed on the control or bulk list
    pub(crate) fn commit_filled(&mut self, xfer: TransferType) {
        match xfer {
            TransferType::Control => {
                ral::write_reg!(ral::ohci, self.regs, HCCOMMANDSTATUS, CLF: 1);
            }
            TransferType::Bulk => {
                ral::write_reg!(ral::ohci, self.regs, HCCOMMANDSTATUS, BLF: 1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::normalize_interval;

    #[test]
    fn interval_normalization() {
        assert_eq!(normalize_interval(0), 1);
        assert_eq!(normalize_interval(500), 1);
        assert_eq!(normalize_interval(1000), 1);
        assert_eq!(normalize_interval(2000), 2);
        assert_eq!(normalize_interval(3000), 2);
        assert_eq!(normalize_interval(8000), 8);
        assert_eq!(normalize_interval(10_000), 8);
        assert_eq!(normalize_interval(32_000), 32);
        assert_eq!(normalize_interval(1_000_000), 32);
    }
}
