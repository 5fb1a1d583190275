//! Root hub request dispatch
//!
//! The root hub is not a real device: control requests addressed to it
//! read and write the controller's own HcRh* registers, and its
//! status-change interrupt endpoint is completed from the ISR's
//! RHSC path. Nothing here touches descriptor pools or the schedule;
//! the submit/callback contract is the same as for real pipes.

use crate::host::Core;
use crate::irp::{Irp, PipeId, TransferStatus};
use crate::ral::{self, PortStatus};
use crate::{Error, UsbPlatform};
use core::ptr::NonNull;

/// Standard hub-class port feature selectors
mod feature {
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
}

/// A parsed root-hub control request
///
/// One variant per request the hub services; everything else is
/// answered with a stall status.
enum Request {
    GetDeviceDescriptor { len: u16 },
    GetConfigDescriptor { len: u16 },
    GetHubDescriptor { len: u16 },
    GetHubStatus,
    GetPortStatus { port: u8 },
    GetConfiguration,
    SetConfiguration(u8),
    SetAddress(u8),
    SetPortFeature { port: u8, feature: u16 },
    ClearPortFeature { port: u8, feature: u16 },
    ClearHubFeature,
    SetHubFeature,
    Unsupported,
}

impl Request {
    fn parse(setup: &[u8; 8]) -> Self {
        let request_type = setup[0];
        let request = setup[1];
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        let index = u16::from_le_bytes([setup[4], setup[5]]);
        let length = u16::from_le_bytes([setup[6], setup[7]]);
        let class = request_type & 0x60 == 0x20;
        let to_port = request_type & 0x1F == 0x03;

        match (class, request) {
            // Standard device requests
            (false, 6) => match value >> 8 {
                1 => Request::GetDeviceDescriptor { len: length },
                2 => Request::GetConfigDescriptor { len: length },
                _ => Request::Unsupported,
            },
            (false, 5) => Request::SetAddress(value as u8),
            (false, 8) => Request::GetConfiguration,
            (false, 9) => Request::SetConfiguration(value as u8),
            // Hub class requests
            (true, 6) => Request::GetHubDescriptor { len: length },
            (true, 0) if to_port => Request::GetPortStatus {
                port: index as u8,
            },
            (true, 0) => Request::GetHubStatus,
            (true, 3) if to_port => Request::SetPortFeature {
                port: index as u8,
                feature: value,
            },
            (true, 1) if to_port => Request::ClearPortFeature {
                port: index as u8,
                feature: value,
            },
            (true, 3) => Request::SetHubFeature,
            (true, 1) => Request::ClearHubFeature,
            _ => Request::Unsupported,
        }
    }
}

/// USB device descriptor for the root hub
const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x10, 0x01, 9, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
];

/// Configuration + interface + interrupt-endpoint descriptors
const CONFIG_DESCRIPTOR: [u8; 25] = [
    9, 2, 25, 0, 1, 1, 0, 0xC0, 0, // configuration
    9, 4, 0, 0, 1, 9, 0, 0, 0, // interface, hub class
    7, 5, 0x81, 3, 1, 0, 0xFF, // status-change endpoint
];

/// Driver-side root-hub state
pub(crate) struct RootHub {
    /// Function address, maintained by SetAddress; 0 until enumerated
    pub addr: u8,
    config: u8,
    /// Parked status-change IRP waiting for a port event
    change_irp: Option<NonNull<Irp>>,
    /// Bit `n + 1` set when port `n` has unreported changes
    changes: u16,
}

impl RootHub {
    pub const fn new() -> Self {
        RootHub {
            addr: 0,
            config: 0,
            change_irp: None,
            changes: 0,
        }
    }
}

impl<P: UsbPlatform> Core<P> {
    /// Service an IRP addressed to the root hub
    pub(crate) fn roothub_submit(
        &mut self,
        irp_ptr: NonNull<Irp>,
        endpoint: u8,
    ) -> Result<(), Error> {
        if endpoint & 0xF != 0 {
            // The status-change interrupt endpoint completes from the
            // change bitmap, now or at the next RHSC interrupt.
            if self.roothub.changes != 0 {
                self.deliver_change(irp_ptr);
            } else {
                self.roothub.change_irp = Some(irp_ptr);
            }
            return Ok(());
        }

        let irp = unsafe { &mut *irp_ptr.as_ptr() };
        let request = Request::parse(&irp.setup);
        let mut status = TransferStatus::Success;
        let mut scratch = [0u8; 32];
        let mut reply: usize = 0;

        match request {
            Request::GetDeviceDescriptor { len } => {
                reply = (len as usize).min(DEVICE_DESCRIPTOR.len());
                scratch[..reply].copy_from_slice(&DEVICE_DESCRIPTOR[..reply]);
            }
            Request::GetConfigDescriptor { len } => {
                reply = (len as usize).min(CONFIG_DESCRIPTOR.len());
                scratch[..reply].copy_from_slice(&CONFIG_DESCRIPTOR[..reply]);
            }
            Request::GetHubDescriptor { len } => {
                let desc = self.hub_descriptor();
                reply = (len as usize).min(desc.1);
                scratch[..reply].copy_from_slice(&desc.0[..reply]);
            }
            Request::GetHubStatus => {
                reply = 4;
            }
            Request::GetPortStatus { port } => {
                if port == 0 || port > self.nports {
                    status = TransferStatus::Stall;
                } else {
                    let word = self.regs.HCRHPORTSTATUS[port as usize - 1].read();
                    scratch[..4].copy_from_slice(&word.to_le_bytes());
                    reply = 4;
                }
            }
            Request::GetConfiguration => {
                scratch[0] = self.roothub.config;
                reply = 1;
            }
            Request::SetConfiguration(config) => {
                self.roothub.config = config;
            }
            Request::SetAddress(addr) => {
                self.roothub.addr = addr;
                debug!("root hub address {}", addr);
            }
            Request::SetPortFeature { port, feature } => {
                status = self.port_feature(port, feature, true);
            }
            Request::ClearPortFeature { port, feature } => {
                status = self.port_feature(port, feature, false);
            }
            Request::SetHubFeature | Request::ClearHubFeature => {}
            Request::Unsupported => {
                status = TransferStatus::Stall;
            }
        }

        if status == TransferStatus::Success && reply > 0 {
            let copy = reply.min(irp.len);
            if copy > 0 && irp.data.is_null() {
                return Err(Error::InvalidArgument);
            }
            unsafe {
                core::ptr::copy_nonoverlapping(scratch.as_ptr(), irp.data, copy);
            }
            irp.actual = copy;
        }

        irp.status = status;
        let id = PipeId {
            function: self.roothub.addr,
            endpoint,
        };
        if let Some(callback) = irp.callback {
            callback(id, irp);
        }
        Ok(())
    }

    /// Build the hub-class descriptor from RhDescriptorA/B
    fn hub_descriptor(&self) -> ([u8; 32], usize) {
        let nports = self.nports;
        let a = ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORA);
        let b = ral::read_reg!(ral::ohci, self.regs, HCRHDESCRIPTORB);

        let mut desc = [0u8; 32];
        // One DeviceRemovable byte covers up to seven ports.
        let bitmap_bytes = (nports as usize + 1).div_ceil(8);
        let len = 7 + 2 * bitmap_bytes;
        desc[0] = len as u8;
        desc[1] = 0x29;
        desc[2] = nports;
        // wHubCharacteristics: power switching mode straight from the
        // controller's description of itself.
        desc[3] = (a >> 8) as u8 & 0x1F;
        desc[4] = 0;
        // bPwrOn2PwrGood, in 2 ms units
        desc[5] = (a >> 24) as u8;
        desc[6] = 0;
        for i in 0..bitmap_bytes {
            desc[7 + i] = (b >> (8 * i)) as u8;
            // PortPwrCtrlMask is all ones by convention.
            desc[7 + bitmap_bytes + i] = 0xFF;
        }
        (desc, len)
    }

    fn port_feature(&mut self, port: u8, feature: u16, set: bool) -> TransferStatus {
        if port == 0 || port > self.nports {
            return TransferStatus::Stall;
        }
        let reg = &self.regs.HCRHPORTSTATUS[port as usize - 1];
        let bits = match (set, feature) {
            (true, feature::PORT_ENABLE) => PortStatus::PES,
            (true, feature::PORT_SUSPEND) => PortStatus::PSS,
            (true, feature::PORT_RESET) => PortStatus::PRS,
            (true, feature::PORT_POWER) => PortStatus::PPS,
            // Clears write the paired strobe bit.
            (false, feature::PORT_ENABLE) => PortStatus::CCS,
            (false, feature::PORT_SUSPEND) => PortStatus::POCI,
            (false, feature::PORT_POWER) => PortStatus::LSDA,
            (false, feature::C_PORT_CONNECTION) => PortStatus::CSC,
            (false, feature::C_PORT_ENABLE) => PortStatus::PESC,
            (false, feature::C_PORT_SUSPEND) => PortStatus::PSSC,
            (false, feature::C_PORT_OVER_CURRENT) => PortStatus::OCIC,
            (false, feature::C_PORT_RESET) => PortStatus::PRSC,
            _ => return TransferStatus::Stall,
        };
        reg.write(bits.bits());
        TransferStatus::Success
    }

    /// ISR path: fold port-change bits into the bitmap and complete a
    /// parked status-change IRP if one is waiting
    pub(crate) fn roothub_status_change(&mut self) {
        let mut changes = self.roothub.changes;
        for port in 0..self.nports as usize {
            let status = PortStatus::from_bits_truncate(self.regs.HCRHPORTSTATUS[port].read());
            if status.intersects(PortStatus::CHANGE_MASK) {
                changes |= 1 << (port + 1);
            }
        }
        self.roothub.changes = changes;
        if changes != 0 {
            if let Some(irp_ptr) = self.roothub.change_irp.take() {
                self.deliver_change(irp_ptr);
            }
        }
    }

    fn deliver_change(&mut self, irp_ptr: NonNull<Irp>) {
        let irp = unsafe { &mut *irp_ptr.as_ptr() };
        let bitmap = self.roothub.changes.to_le_bytes();
        let copy = irp.len.min(bitmap.len());
        if copy > 0 && !irp.data.is_null() {
            unsafe {
                core::ptr::copy_nonoverlapping(bitmap.as_ptr(), irp.data, copy);
            }
        }
        irp.actual = copy;
        irp.status = TransferStatus::Success;
        self.roothub.changes = 0;
        let id = PipeId {
            function: self.roothub.addr,
            endpoint: 0x81,
        };
        if let Some(callback) = irp.callback {
            callback(id, irp);
        }
    }
}
