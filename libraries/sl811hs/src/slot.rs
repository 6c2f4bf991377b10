// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Transaction Engine: formats and arms one USB transaction per slot, and
//! decodes the result on completion (§4.3).

use core::sync::atomic::{AtomicBool, Ordering};

use log::trace;

use crate::bus::{regs, Bus, RegisterPort};
use crate::request::{Direction, Request};
use crate::toggle::ToggleTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    fn bank_offset(self) -> u8 {
        match self {
            SlotId::A => 0,
            SlotId::B => regs::BANK_B_OFFSET,
        }
    }
}

/// Parameters for a single transaction, decided by the RSM (§4.4) and
/// handed to the Transaction Engine to issue.
pub struct TransactionParams {
    pub pid: u8,
    pub direction: Direction,
    pub iso: bool,
    pub device_address: u8,
    pub endpoint: u8,
    pub low_speed: bool,
    pub length: u16,
    pub toggle: bool,
}

/// Decoded outcome of a completed transaction, §4.3's priority-ordered
/// status decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Aborted,
    HostError,
    Stall,
    Overflow,
    Timeout,
    Nak,
    Ack,
    /// ACK on an IN with the SEQ (sequence mismatch) bit set: treat as a
    /// retry condition rather than forward progress.
    UnitBusy,
}

/// One of the controller's two "ping-pong" transaction engines.
pub struct TransactionSlot {
    pub id: SlotId,
    pub fifo_base: u16,
    pub fifo_capacity: u16,
    /// Set by the ISR when the hardware reports this slot's transaction
    /// done; cleared by the worker once it has processed the completion.
    /// Shared between ISR and worker, hence atomic (§3 TransactionSlot,
    /// §5 shared-resource discipline).
    completed: AtomicBool,
    /// Present iff the slot is in flight or completed-but-unprocessed (I2).
    pub request: Option<Request>,
    last_len: u16,
    last_was_iso: bool,
}

impl TransactionSlot {
    pub fn new(id: SlotId, fifo_base: u16, fifo_capacity: u16) -> Self {
        TransactionSlot {
            id,
            fifo_base,
            fifo_capacity,
            completed: AtomicBool::new(false),
            request: None,
            last_len: 0,
            last_was_iso: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.request.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Called by the ISR when the hardware interrupt status indicates this
    /// slot finished.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    fn clear_completed(&self) {
        self.completed.store(false, Ordering::SeqCst);
    }

    /// Arm one USB transaction on this slot (§4.3 steps 1-6). The outbound
    /// payload for an OUT transaction, if any, is read straight out of
    /// `request` (the 8-byte setup buffer for a SETUP PID, otherwise the
    /// next slice of the request's data buffer); `sof_remaining` is the
    /// bit-times left in the current frame, consulted for the SYNC-SOF
    /// errata on full-speed devices.
    pub fn issue<B: Bus>(
        &mut self,
        rp: &RegisterPort<B>,
        request: Request,
        params: TransactionParams,
        sof_remaining: u16,
    ) {
        let bank = self.id.bank_offset();

        let mut control = 0u8;
        if params.low_speed {
            control |= regs::HOSTCTRL_PREAMBLE;
        }
        if params.toggle {
            control |= regs::HOSTCTRL_DATA1;
        }
        if params.iso {
            control |= regs::HOSTCTRL_ISO;
        }
        if params.direction == Direction::Out {
            control |= regs::HOSTCTRL_DIR_OUT;
        }
        control |= regs::HOSTCTRL_ENABLE | regs::HOSTCTRL_ARM;

        if params.direction == Direction::Out {
            let len = params.length as usize;
            if params.pid == regs::PID_SETUP {
                let setup = request.setup;
                let mut first = true;
                for byte in setup.iter() {
                    rp.write_next(bank + regs::HOSTBASE, first, *byte);
                    first = false;
                }
            } else if let Some(buffer) = request.buffer.as_ref() {
                let start = request.actual_len;
                let mut first = true;
                for i in 0..len {
                    if start + i >= buffer.len() {
                        break;
                    }
                    rp.write_next(bank + regs::HOSTBASE, first, buffer[start + i]);
                    first = false;
                }
            }
        }

        self.last_len = params.length;
        self.last_was_iso = params.iso;
        self.clear_completed();
        self.request = Some(request);

        rp.write_byte(bank + regs::HOSTBASE, self.fifo_base as u8);
        rp.write_byte(bank + regs::HOSTLEN, params.length as u8);
        rp.write_byte(
            bank + regs::HOSTID,
            (params.pid << 4) | (params.endpoint & 0xf),
        );
        rp.write_byte(bank + regs::HOSTDEVICEADDR, params.device_address & 0x7f);

        if !params.low_speed {
            let bit_times_needed = (params.length >> 3) + 3;
            if sof_remaining < bit_times_needed {
                control |= regs::HOSTCTRL_SYNCSOF;
            }
        }

        trace!(
            "slot {:?}: issue pid={:#x} ep={} dev={} len={} ctrl={:#x}",
            self.id,
            params.pid,
            params.endpoint,
            params.device_address,
            params.length,
            control
        );

        rp.write_byte(bank + regs::HOSTCTRL, control);
    }

    /// Complete a finished transaction (§4.3). Drains IN data into
    /// `request`'s buffer, advances `actual_len`, flips the toggle on a
    /// successful non-ISO ACK, and returns the decoded outcome. Leaves
    /// `self.request` in place regardless of outcome; the caller (`finish_slot`)
    /// is the sole owner of taking it back out via `self.request.take()`, so
    /// `is_free()` only goes true once that take happens.
    pub fn complete<B: Bus>(
        &mut self,
        rp: &RegisterPort<B>,
        toggle: &mut ToggleTable,
    ) -> TransactionOutcome {
        let bank = self.id.bank_offset();
        let status = rp.read_byte(bank + regs::HOSTSTATUS);

        let aborted = self
            .request
            .as_ref()
            .map(|r| r.is_aborted())
            .unwrap_or(false);

        let outcome = if aborted {
            TransactionOutcome::Aborted
        } else if status & regs::HOSTSTATUS_ERROR != 0 {
            TransactionOutcome::HostError
        } else if status & regs::HOSTSTATUS_STALL != 0 {
            TransactionOutcome::Stall
        } else if status & regs::HOSTSTATUS_OVERFLOW != 0 {
            TransactionOutcome::Overflow
        } else if status & regs::HOSTSTATUS_TIMEOUT != 0 {
            TransactionOutcome::Timeout
        } else if status & regs::HOSTSTATUS_NAK != 0 {
            TransactionOutcome::Nak
        } else if status & regs::HOSTSTATUS_ACK != 0 {
            let direction = self.request.as_ref().map(|r| r.direction);
            if direction == Some(Direction::In) && status & regs::HOSTSTATUS_SEQ != 0 {
                TransactionOutcome::UnitBusy
            } else {
                TransactionOutcome::Ack
            }
        } else {
            TransactionOutcome::HostError
        };

        trace!("slot {:?}: complete status={:#x} -> {:?}", self.id, status, outcome);

        if outcome == TransactionOutcome::Ack {
            if let Some(request) = self.request.as_mut() {
                if !self.last_was_iso {
                    toggle.flip(request.device_address, request.endpoint, request.direction);
                }
                match request.direction {
                    Direction::In => {
                        // The chip overwrites HOSTLEN with the actual byte
                        // count received, which can be less than requested
                        // (a short packet, §7 RUNTPACKET) if the device had
                        // less data than asked for.
                        let requested = self.last_len as usize;
                        let reported = rp.read_byte(bank + regs::HOSTLEN) as usize;
                        let actual = reported.min(requested);
                        if let Some(buffer) = request.buffer.as_mut() {
                            let start = request.actual_len;
                            let mut first = true;
                            for i in 0..actual {
                                if start + i >= buffer.len() {
                                    break;
                                }
                                buffer[start + i] = rp.read_next(bank + regs::HOSTBASE, first);
                                first = false;
                            }
                        }
                        request.actual_len += actual;
                        request.last_short = actual < requested;
                    }
                    Direction::Out => {
                        request.actual_len += self.last_len as usize;
                        request.last_short = false;
                    }
                }
            }
        }

        self.clear_completed();

        outcome
    }
}
