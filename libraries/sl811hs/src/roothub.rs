// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Virtual Root Hub: makes the controller's single physical port look like
//! a standard USB hub port, so the stack can enumerate it the same way it
//! would enumerate a device behind a real hub (§4.5).

use log::debug;

use crate::error::UsbError;

// Port status bits, USB hub class layout.
pub const PORT_CONNECTION: u16 = 1 << 0;
pub const PORT_ENABLE: u16 = 1 << 1;
pub const PORT_SUSPEND: u16 = 1 << 2;
pub const PORT_OVER_CURRENT: u16 = 1 << 3;
pub const PORT_RESET: u16 = 1 << 4;
pub const PORT_POWER: u16 = 1 << 8;
pub const PORT_LOW_SPEED: u16 = 1 << 9;

// Hub/port feature selectors (SetPortFeature/ClearPortFeature wValue).
const FEATURE_PORT_CONNECTION: u16 = 0;
const FEATURE_PORT_ENABLE: u16 = 1;
const FEATURE_PORT_SUSPEND: u16 = 2;
const FEATURE_PORT_OVER_CURRENT: u16 = 3;
const FEATURE_PORT_RESET: u16 = 4;
const FEATURE_PORT_POWER: u16 = 8;
const FEATURE_C_PORT_BASE: u16 = 16;

// Standard request codes.
const REQ_GET_STATUS: u8 = 0;
const REQ_CLEAR_FEATURE: u8 = 1;
const REQ_SET_FEATURE: u8 = 3;
const REQ_SET_ADDRESS: u8 = 5;
const REQ_GET_DESCRIPTOR: u8 = 6;
const REQ_GET_CONFIGURATION: u8 = 8;
const REQ_SET_CONFIGURATION: u8 = 9;

const DESC_DEVICE: u8 = 1;
const DESC_CONFIGURATION: u8 = 2;
const DESC_STRING: u8 = 3;
const DESC_INTERFACE: u8 = 4;
const DESC_ENDPOINT: u8 = 5;
const DESC_HUB: u8 = 0x29;

const RECIPIENT_MASK: u8 = 0x1f;
const RECIPIENT_DEVICE: u8 = 0;
const RECIPIENT_INTERFACE: u8 = 1;
const RECIPIENT_ENDPOINT: u8 = 2;
const RECIPIENT_OTHER: u8 = 3;

/// Device descriptor, §9B: the chip family presents itself as a Cypress
/// SL811HS-based root hub.
#[rustfmt::skip]
const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1,              // bLength, bDescriptorType
    0x00, 0x02,         // bcdUSB = 0x0200
    9,                  // bDeviceClass = hub
    0, 0,               // bDeviceSubClass, bDeviceProtocol
    64,                 // bMaxPacketSize0
    0xb4, 0x04,         // idVendor = 0x04b4
    0x50, 0x20,         // idProduct = 0x2050
    0x00, 0x01,         // bcdDevice = 0x0100
    1, 2,               // iManufacturer, iProduct
    0,                  // iSerialNumber
    1,                  // bNumConfigurations
];

#[rustfmt::skip]
const CONFIG_DESCRIPTOR: [u8; 9] = [
    9, 2,               // bLength, bDescriptorType
    34, 0,              // wTotalLength = 9+9+7+9
    1,                  // bNumInterfaces
    1,                  // bConfigurationValue
    0,                  // iConfiguration
    0b1110_0000,        // bmAttributes: self-powered | one | remote-wakeup
    0,                  // bMaxPower
];

#[rustfmt::skip]
const INTERFACE_DESCRIPTOR: [u8; 9] = [
    9, 4,               // bLength, bDescriptorType
    0, 0,               // bInterfaceNumber, bAlternateSetting
    1,                  // bNumEndpoints
    9, 0, 0,            // bInterfaceClass (hub), bInterfaceSubClass, bInterfaceProtocol
    0,                  // iInterface
];

#[rustfmt::skip]
const ENDPOINT_DESCRIPTOR: [u8; 7] = [
    7, 5,               // bLength, bDescriptorType
    0x81,               // bEndpointAddress: IN, EP1
    3,                  // bmAttributes: interrupt
    2, 0,               // wMaxPacketSize
    255,                // bInterval
];

#[rustfmt::skip]
const HUB_DESCRIPTOR: [u8; 9] = [
    9, DESC_HUB,
    1,                  // bNbrPorts
    0, 0,               // wHubCharacteristics
    25,                 // bPwrOn2PwrGood (50ms)
    25,                 // bHubContrCurrent (25mA)
    0,                  // DeviceRemovable
    0xff,               // PortPwrCtrlMask
];

const STRING_LANGIDS: [u8; 4] = [4, DESC_STRING, 0x09, 0x04];
const STRING_MANUFACTURER: &str = "Cypress";
const STRING_PRODUCT: &str = "SL811HS";

/// Real hardware action the caller (the controller, which owns the
/// register port and transaction engines) must carry out after a hub-class
/// request that affects the wire, beyond this module's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubAction {
    None,
    DriveReset,
    DriveSuspend,
    DriveResume,
}

/// Per-controller virtual root hub state (§3 RootHubState).
pub struct RootHubState {
    pub port_status: u16,
    pub port_change: u16,
    /// Device address the stack assigned the root hub via SET_ADDRESS;
    /// zero until then.
    pub address: u8,
    pub config_index: u8,
    /// Cleared by the ISR's DETECT-CHANGE handler; set once the worker
    /// has rescanned the port (§4.5 "Port scan").
    pub scanned: bool,
}

impl RootHubState {
    pub const fn new() -> Self {
        RootHubState {
            port_status: 0,
            port_change: 0,
            address: 0,
            config_index: 0,
            scanned: true,
        }
    }

    pub fn reset_hardware_state(&mut self) {
        self.port_status = 0;
        self.port_change = 0;
    }

    /// Pack `(status, change)` as the 4-byte wire format GET_STATUS(port)
    /// returns: low 16 bits status, high 16 bits change.
    pub fn packed_status(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0..2].copy_from_slice(&self.port_status.to_le_bytes());
        out[2..4].copy_from_slice(&self.port_change.to_le_bytes());
        out
    }

    /// Apply freshly sampled connection/speed bits from a port scan.
    pub fn apply_scan(&mut self, connected: bool, low_speed: bool) {
        let was_connected = self.port_status & PORT_CONNECTION != 0;
        if connected {
            self.port_status |= PORT_CONNECTION;
            if low_speed {
                self.port_status |= PORT_LOW_SPEED;
            } else {
                self.port_status &= !PORT_LOW_SPEED;
            }
        } else {
            // I4: enable is clear whenever connection is clear.
            self.port_status &= !(PORT_CONNECTION | PORT_ENABLE | PORT_LOW_SPEED);
        }
        if connected != was_connected {
            self.port_change |= PORT_CONNECTION;
        }
        self.scanned = true;
    }

    /// The interrupt-IN status-change pipe: one byte with bit 1 set (the
    /// single port) whenever any change bit is non-zero, else "not ready".
    pub fn status_change_byte(&self) -> Option<u8> {
        if self.port_change != 0 {
            Some(0b10)
        } else {
            None
        }
    }

    /// Handle a control request addressed to the root hub's own address.
    /// Returns the number of bytes written into `buffer` (for IN data
    /// stages) and any real-hardware action the caller must still perform.
    pub fn handle_control(
        &mut self,
        setup: &[u8; 8],
        buffer: Option<&mut [u8]>,
    ) -> Result<(usize, HubAction), UsbError> {
        let bm_request_type = setup[0];
        let b_request = setup[1];
        let w_value = u16::from_le_bytes([setup[2], setup[3]]);
        let w_index = u16::from_le_bytes([setup[4], setup[5]]);
        let w_length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        let recipient = bm_request_type & RECIPIENT_MASK;

        debug!(
            "root hub: bmRequestType={:#x} bRequest={:#x} wValue={:#x} wIndex={:#x} wLength={}",
            bm_request_type, b_request, w_value, w_index, w_length
        );

        if is_hub_class(bm_request_type) {
            return match recipient {
                RECIPIENT_DEVICE if b_request == REQ_GET_DESCRIPTOR => {
                    let buffer = buffer.ok_or(UsbError::BadParams)?;
                    let n = HUB_DESCRIPTOR.len().min(w_length).min(buffer.len());
                    buffer[..n].copy_from_slice(&HUB_DESCRIPTOR[..n]);
                    Ok((n, HubAction::None))
                }
                RECIPIENT_DEVICE if b_request == REQ_GET_STATUS => {
                    let buffer = buffer.ok_or(UsbError::BadParams)?;
                    if buffer.len() < 4 {
                        return Err(UsbError::Overflow);
                    }
                    buffer[..4].copy_from_slice(&[0, 0, 0, 0]);
                    Ok((4, HubAction::None))
                }
                RECIPIENT_OTHER => self.handle_port_request(b_request, w_value, buffer, w_length),
                _ => Err(UsbError::BadParams),
            };
        }

        match (recipient, b_request) {
            (RECIPIENT_DEVICE, REQ_SET_ADDRESS) => {
                self.address = w_value as u8;
                Ok((0, HubAction::None))
            }
            (RECIPIENT_DEVICE, REQ_GET_DESCRIPTOR) => {
                let desc_type = (w_value >> 8) as u8;
                let buffer = buffer.ok_or(UsbError::BadParams)?;
                if w_length > buffer.len() {
                    return Err(UsbError::Overflow);
                }
                let n = self.write_standard_descriptor(desc_type, w_value as u8, buffer, w_length)?;
                Ok((n, HubAction::None))
            }
            (RECIPIENT_DEVICE, REQ_GET_CONFIGURATION) => {
                let buffer = buffer.ok_or(UsbError::BadParams)?;
                if buffer.is_empty() {
                    return Err(UsbError::Overflow);
                }
                buffer[0] = self.config_index;
                Ok((1, HubAction::None))
            }
            (RECIPIENT_DEVICE, REQ_SET_CONFIGURATION) => {
                self.config_index = w_value as u8;
                Ok((0, HubAction::None))
            }
            (RECIPIENT_DEVICE, REQ_GET_STATUS)
            | (RECIPIENT_INTERFACE, REQ_GET_STATUS)
            | (RECIPIENT_ENDPOINT, REQ_GET_STATUS) => {
                let buffer = buffer.ok_or(UsbError::BadParams)?;
                if buffer.len() < 2 {
                    return Err(UsbError::Overflow);
                }
                // Self-powered, no remote wakeup pending; no halted
                // endpoints on the synthetic device.
                buffer[0] = 0;
                buffer[1] = 0;
                Ok((2, HubAction::None))
            }
            _ => Err(UsbError::BadParams),
        }
    }

    fn handle_port_request(
        &mut self,
        b_request: u8,
        w_value: u16,
        buffer: Option<&mut [u8]>,
        w_length: usize,
    ) -> Result<(usize, HubAction), UsbError> {
        match b_request {
            REQ_GET_STATUS => {
                let buffer = buffer.ok_or(UsbError::BadParams)?;
                if buffer.len() < 4 || w_length < 4 {
                    return Err(UsbError::Overflow);
                }
                buffer[..4].copy_from_slice(&self.packed_status());
                Ok((4, HubAction::None))
            }
            REQ_SET_FEATURE => {
                let mut action = HubAction::None;
                match w_value {
                    FEATURE_PORT_RESET => {
                        self.port_status |= PORT_RESET;
                        self.port_status &= !PORT_ENABLE; // I4
                        action = HubAction::DriveReset;
                    }
                    FEATURE_PORT_SUSPEND => {
                        self.port_status |= PORT_SUSPEND;
                        action = HubAction::DriveSuspend;
                    }
                    FEATURE_PORT_POWER => {
                        self.port_status |= PORT_POWER;
                    }
                    _ => return Err(UsbError::BadParams),
                }
                Ok((0, action))
            }
            REQ_CLEAR_FEATURE => {
                let mut action = HubAction::None;
                if w_value >= FEATURE_C_PORT_BASE {
                    // Acknowledge and clear the corresponding change bit.
                    let change_bit = 1u16 << (w_value - FEATURE_C_PORT_BASE);
                    self.port_change &= !change_bit;
                } else {
                    match w_value {
                        FEATURE_PORT_SUSPEND => {
                            self.port_status &= !PORT_SUSPEND;
                            action = HubAction::DriveResume;
                        }
                        FEATURE_PORT_POWER => self.port_status &= !PORT_POWER,
                        FEATURE_PORT_ENABLE => self.port_status &= !PORT_ENABLE,
                        FEATURE_PORT_CONNECTION | FEATURE_PORT_OVER_CURRENT => {}
                        _ => return Err(UsbError::BadParams),
                    }
                }
                Ok((0, action))
            }
            _ => Err(UsbError::BadParams),
        }
    }

    fn write_standard_descriptor(
        &self,
        desc_type: u8,
        index: u8,
        buffer: &mut [u8],
        w_length: usize,
    ) -> Result<usize, UsbError> {
        match desc_type {
            DESC_DEVICE => Ok(copy_truncated(&DEVICE_DESCRIPTOR, buffer, w_length)),
            DESC_CONFIGURATION => {
                let mut n = 0;
                for chunk in [
                    &CONFIG_DESCRIPTOR[..],
                    &INTERFACE_DESCRIPTOR[..],
                    &ENDPOINT_DESCRIPTOR[..],
                    &HUB_DESCRIPTOR[..],
                ] {
                    let room = w_length.min(buffer.len()).saturating_sub(n);
                    if room == 0 {
                        break;
                    }
                    let take = chunk.len().min(room);
                    buffer[n..n + take].copy_from_slice(&chunk[..take]);
                    n += take;
                    if take < chunk.len() {
                        break;
                    }
                }
                Ok(n)
            }
            DESC_STRING => {
                if index == 0 {
                    return Ok(copy_truncated(&STRING_LANGIDS, buffer, w_length));
                }
                let s = match index {
                    1 => STRING_MANUFACTURER,
                    2 => STRING_PRODUCT,
                    _ => return Err(UsbError::BadParams),
                };
                let mut desc = [0u8; 2 + 64];
                desc[0] = (2 + s.len() * 2) as u8;
                desc[1] = DESC_STRING;
                for (i, c) in s.encode_utf16().enumerate() {
                    desc[2 + 2 * i..4 + 2 * i].copy_from_slice(&c.to_le_bytes());
                }
                let len = desc[0] as usize;
                Ok(copy_truncated(&desc[..len], buffer, w_length))
            }
            DESC_INTERFACE => Ok(copy_truncated(&INTERFACE_DESCRIPTOR, buffer, w_length)),
            DESC_ENDPOINT => Ok(copy_truncated(&ENDPOINT_DESCRIPTOR, buffer, w_length)),
            DESC_HUB => Ok(copy_truncated(&HUB_DESCRIPTOR, buffer, w_length)),
            _ => Err(UsbError::BadParams),
        }
    }
}

impl Default for RootHubState {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hub_class(bm_request_type: u8) -> bool {
    (bm_request_type >> 5) & 0x3 == 1
}

fn copy_truncated(src: &[u8], dst: &mut [u8], w_length: usize) -> usize {
    let n = src.len().min(dst.len()).min(w_length);
    dst[..n].copy_from_slice(&src[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(bm: u8, req: u8, value: u16, index: u16, len: u16) -> [u8; 8] {
        let mut s = [0u8; 8];
        s[0] = bm;
        s[1] = req;
        s[2..4].copy_from_slice(&value.to_le_bytes());
        s[4..6].copy_from_slice(&index.to_le_bytes());
        s[6..8].copy_from_slice(&len.to_le_bytes());
        s
    }

    #[test]
    fn get_device_descriptor() {
        let mut rh = RootHubState::new();
        let mut buf = [0u8; 18];
        let s = setup(0x80, REQ_GET_DESCRIPTOR, (DESC_DEVICE as u16) << 8, 0, 18);
        let (n, action) = rh.handle_control(&s, Some(&mut buf)).unwrap();
        assert_eq!(n, 18);
        assert_eq!(action, HubAction::None);
        assert_eq!(buf[0], 18);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x0200);
        assert_eq!(u16::from_le_bytes([buf[8], buf[9]]), 0x04b4);
        assert_eq!(u16::from_le_bytes([buf[10], buf[11]]), 0x2050);
        assert_eq!(buf[17], 1);
    }

    #[test]
    fn get_config_descriptor_chain_and_total_length() {
        let mut rh = RootHubState::new();
        let mut buf = [0u8; 32];
        let s = setup(
            0x80,
            REQ_GET_DESCRIPTOR,
            (DESC_CONFIGURATION as u16) << 8,
            0,
            32,
        );
        let (n, _) = rh.handle_control(&s, Some(&mut buf)).unwrap();
        assert_eq!(n, 32);
        let total = 9 + 9 + 7 + 9;
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), total as u16);
    }

    #[test]
    fn set_feature_port_reset_clears_enable_and_requests_reset() {
        let mut rh = RootHubState::new();
        rh.port_status |= PORT_ENABLE | PORT_CONNECTION;
        let s = setup(0x23, REQ_SET_FEATURE, FEATURE_PORT_RESET, 1, 0);
        let (_, action) = rh.handle_control(&s, None).unwrap();
        assert_eq!(action, HubAction::DriveReset);
        assert!(rh.port_status & PORT_RESET != 0);
        assert!(rh.port_status & PORT_ENABLE == 0);
    }

    #[test]
    fn get_port_status_reflects_reset_change() {
        let mut rh = RootHubState::new();
        rh.port_status |= PORT_RESET;
        rh.port_change |= PORT_RESET;
        let mut buf = [0u8; 4];
        let s = setup(0xa3, REQ_GET_STATUS, 0, 1, 4);
        let (n, _) = rh.handle_control(&s, Some(&mut buf)).unwrap();
        assert_eq!(n, 4);
        let change = u16::from_le_bytes([buf[2], buf[3]]);
        assert!(change & PORT_RESET != 0);
    }

    #[test]
    fn clear_feature_on_change_bit_acknowledges() {
        let mut rh = RootHubState::new();
        rh.port_change |= PORT_CONNECTION;
        let s = setup(0x23, REQ_CLEAR_FEATURE, FEATURE_C_PORT_BASE, 1, 0);
        rh.handle_control(&s, None).unwrap();
        assert_eq!(rh.port_change & PORT_CONNECTION, 0);
    }

    #[test]
    fn status_change_pipe_nak_when_no_change() {
        let rh = RootHubState::new();
        assert_eq!(rh.status_change_byte(), None);
    }

    #[test]
    fn status_change_pipe_reports_single_port_bit() {
        let mut rh = RootHubState::new();
        rh.port_change |= PORT_CONNECTION;
        assert_eq!(rh.status_change_byte(), Some(0b10));
    }
}
