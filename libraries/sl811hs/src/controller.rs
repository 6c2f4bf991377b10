// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Ties the Register Port, Transaction Engine, Request State Machine, and
//! Virtual Root Hub together behind a single non-blocking dispatcher
//! (§4.6, §6). This is the crate's public entry point.
//!
//! The original driver's worker is a blocking, cooperatively-scheduled
//! task that wakes on a three-way wait-multiplexer (command inbox,
//! interrupt-done signal, timer-reply port). This crate keeps every
//! ordering guarantee of that design (§5) but restructures the blocking
//! wait into a non-blocking, re-entrant `poll()` the caller drives from
//! whatever event loop it already has — the Rust-idiomatic redesign noted
//! in REDESIGN FLAGS.

use log::{debug, error, trace, warn};

use crate::bus::{regs, Bus, RegisterPort};
use crate::error::UsbError;
use crate::hil::Alarm;
use crate::queue::RequestQueue;
use crate::request::{Command, Direction, NakRetry, Request, RequestState, DEFAULT_INTERVAL_MS};
use crate::roothub::{HubAction, RootHubState};
use crate::slot::{SlotId, TransactionOutcome, TransactionParams, TransactionSlot};
use crate::toggle::ToggleTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Reset,
    Operational,
    Suspended,
    Resuming,
}

/// Per-instance configuration (§9A): FIFO layout and behavioral constants
/// a board chooses at construction time, in place of a dynamic config-file
/// layer this execution context has no use for.
#[derive(Debug, Clone, Copy)]
pub struct Sl811Config {
    pub slot_a_fifo_base: u16,
    pub slot_a_fifo_capacity: u16,
    pub slot_b_enabled: bool,
    pub slot_b_fifo_base: u16,
    pub slot_b_fifo_capacity: u16,
    /// Revision byte at/below which the autoincrement errata workaround is
    /// required (§4.1, §9B: `0x20` for the errata-1.5 family).
    pub errata_threshold: u8,
    pub default_nak_interval_ms: u32,
}

impl Sl811Config {
    /// Slot A alone, using the chip's full internal SRAM (§9B FIFO layout).
    pub const fn single_slot() -> Self {
        Sl811Config {
            slot_a_fifo_base: 16,
            slot_a_fifo_capacity: 240,
            slot_b_enabled: false,
            slot_b_fifo_base: 136,
            slot_b_fifo_capacity: 120,
            errata_threshold: regs::REVISION_1_5_FAMILY,
            default_nak_interval_ms: DEFAULT_INTERVAL_MS,
        }
    }

    /// Both banks enabled, each with half the SRAM (§9B).
    pub const fn dual_slot() -> Self {
        Sl811Config {
            slot_a_fifo_base: 16,
            slot_a_fifo_capacity: 120,
            slot_b_enabled: true,
            slot_b_fifo_base: 136,
            slot_b_fifo_capacity: 120,
            errata_threshold: regs::REVISION_1_5_FAMILY,
            default_nak_interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

/// Outcome of performing one transaction-issuing step of the RSM (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PerformResult {
    Done,
    Busy,
    Active,
}

/// The `{manufacturer, product, description, state, revision}` tuple
/// `UHCMD_QUERYDEVICE` answers synchronously (§6).
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub description: &'static str,
    pub state: ControllerState,
    pub hardware_revision: u8,
}

/// Reply callback. A request's ownership returns to the caller exactly
/// once, carrying its final error (if any) and `actual_len`.
pub trait Client {
    fn request_complete(&self, request: Request);
}

const INBOX_CAPACITY: usize = 8;
const ACTIVE_CAPACITY: usize = 4;
const NAK_WAIT_CAPACITY: usize = 4;

pub struct Controller<'a, B: Bus, A: Alarm<'a>> {
    rp: RegisterPort<'a, B>,
    alarm: &'a A,
    config: Sl811Config,
    state: ControllerState,
    slot_a: TransactionSlot,
    slot_b: Option<TransactionSlot>,
    toggle: ToggleTable,
    root_hub: RootHubState,
    command_inbox: RequestQueue<INBOX_CAPACITY>,
    packets_active: RequestQueue<ACTIVE_CAPACITY>,
    nak_wait: RequestQueue<NAK_WAIT_CAPACITY>,
    client: core::cell::Cell<Option<&'a dyn Client>>,
    revision: u8,
    alive: bool,
    reset_seq: ResetSequence,
    /// The `CMD_RESET`/`UHCMD_USBRESET` request a reset sequence in
    /// progress will reply to on completion, if any (§9B).
    reset_reply: Option<Request>,
}

/// State of an in-progress bus reset sequence (§5, §9B): the one real
/// suspension point this crate has, modeled as an alarm-gated split rather
/// than a blocking sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetSequence {
    Idle,
    /// `CMD_RESET` only: 40 ms with interrupts masked before the bus reset
    /// itself is asserted.
    PreDelay { due_at_ms: u32 },
    /// Bus reset is asserted; waiting out the 50 ms settle time before
    /// de-asserting it and rescanning the port.
    Settling {
        due_at_ms: u32,
        final_state: Option<ControllerState>,
    },
}

fn timer_elapsed(now: u32, due: u32) -> bool {
    now.wrapping_sub(due) < u32::MAX / 2
}

impl<'a, B: Bus, A: Alarm<'a>> Controller<'a, B, A> {
    /// Probe the hardware revision byte; on mismatch, return `None` rather
    /// than constructing a controller (§6 `attach`). The check accepts
    /// either silicon family (§9 open question: a family probe, not a gate
    /// on one exact byte), and records the observed byte for diagnostics
    /// either way.
    pub fn attach(bus: &'a B, alarm: &'a A, config: Sl811Config) -> Option<Self> {
        let probe_rp = RegisterPort::new(bus, config.errata_threshold);
        let revision = probe_rp.read_byte(regs::HWREVISION);
        debug!("sl811hs: observed revision byte {:#x}", revision);
        let family = revision & regs::REVISION_NIBBLE_MASK;
        if family != regs::REVISION_1_2_FAMILY && family != regs::REVISION_1_5_FAMILY {
            warn!(
                "sl811hs: revision {:#x} not in a recognized family, refusing to attach",
                revision
            );
            return None;
        }

        let controller = Controller {
            rp: probe_rp,
            alarm,
            config,
            state: ControllerState::Reset,
            slot_a: TransactionSlot::new(SlotId::A, config.slot_a_fifo_base, config.slot_a_fifo_capacity),
            slot_b: if config.slot_b_enabled {
                Some(TransactionSlot::new(
                    SlotId::B,
                    config.slot_b_fifo_base,
                    config.slot_b_fifo_capacity,
                ))
            } else {
                None
            },
            toggle: ToggleTable::new(),
            root_hub: RootHubState::new(),
            command_inbox: RequestQueue::new(),
            packets_active: RequestQueue::new(),
            nak_wait: RequestQueue::new(),
            client: core::cell::Cell::new(None),
            revision,
            alive: true,
            reset_seq: ResetSequence::Idle,
            reset_reply: None,
        };

        // CMD_INVALID handshake: the original blocks on a command
        // round-trip to prove the worker task is alive before attach
        // returns (§9B). This crate's dispatcher is an ordinary function
        // rather than a task with its own stack, so there is nothing to
        // prove alive beyond construction completing; the handshake's
        // round-trip has no remaining work to do.
        debug!("sl811hs: attach handshake complete, revision {:#x}", revision);
        Some(controller)
    }

    pub fn set_client(&self, client: &'a dyn Client) {
        self.client.set(Some(client));
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// `UHCMD_QUERYDEVICE`, answered synchronously without touching the
    /// command inbox (§6).
    pub fn query_device(&self) -> DeviceInfo {
        let hardware_revision = if self.revision & regs::REVISION_NIBBLE_MASK == regs::REVISION_1_2_FAMILY {
            2
        } else {
            5
        };
        DeviceInfo {
            manufacturer: "Cypress",
            product: "SL811HS",
            description: "USB 1.1 Host",
            state: self.state,
            hardware_revision,
        }
    }

    /// Validate and enqueue a request (§6 `begin_io`). Synchronous queries
    /// (`QueryDevice`) never reach here; callers use [`Self::query_device`].
    pub fn begin_io(&mut self, mut request: Request) {
        trace!(
            "begin_io: command={:?} dev={} ep={} dir={:?}",
            request.command, request.device_address, request.endpoint, request.direction
        );
        if matches!(request.command, Command::QueryDevice | Command::Invalid) {
            request.fail(UsbError::NoCommand);
            self.reply(request);
            return;
        }
        if self.command_inbox.push_back(request).is_err() {
            error!("sl811hs: command inbox full, dropping request");
        }
    }

    /// `AbortIO`: set the abort flag on one outstanding request,
    /// interrupts masked (here: atomically) (§5).
    pub fn abort_io(&self, request: &Request) {
        request.set_abort();
    }

    /// Called by the interrupt handler. Touches only slot completion flags
    /// and the "port scanned" latch — no user buffers, no request state
    /// (§4.2). Returns true if the worker should be woken.
    pub fn handle_interrupt(&mut self) -> bool {
        let status = self.rp.read_byte(regs::INTSTATUS);
        let mut wake = false;

        if status & regs::INT_DETECT != 0 {
            self.root_hub.scanned = false;
            wake = true;
        }
        if status & regs::INT_USB_A != 0 {
            self.slot_a.mark_completed();
            wake = true;
        }
        if let Some(slot_b) = self.slot_b.as_ref() {
            if status & regs::INT_USB_B != 0 {
                slot_b.mark_completed();
                wake = true;
            }
        }

        self.rp.write_byte(regs::INTSTATUS, status);
        wake
    }

    /// The worker's single pass over its three event sources (§4.6). A
    /// caller drives this from a timer tick / interrupt-bottom-half /
    /// inbox-non-empty check; it is safe to call spuriously.
    pub fn poll(&mut self) {
        if !self.alive {
            return;
        }

        // A bus reset in progress is this crate's one real suspension
        // point (§5): the original worker blocks the whole task for the
        // settle delay, so nothing else is serviced until it elapses here
        // either.
        if self.reset_seq != ResetSequence::Idle {
            self.advance_reset_sequence();
            return;
        }

        self.drain_completed_slots();
        self.port_scan_if_needed();
        self.drain_nak_wait();
        self.drain_inbox();
        self.drive_active_queue();
    }

    /// Resume a bus reset sequence once its alarm-gated delay has elapsed
    /// (§9B, §5). A no-op if the deadline hasn't passed yet.
    fn advance_reset_sequence(&mut self) {
        let now = self.alarm.now();
        match self.reset_seq {
            ResetSequence::Idle => {}
            ResetSequence::PreDelay { due_at_ms } => {
                if timer_elapsed(now, due_at_ms) {
                    self.reset_seq = ResetSequence::Idle;
                    self.begin_bus_reset(Some(ControllerState::Reset));
                }
            }
            ResetSequence::Settling { due_at_ms, final_state } => {
                if timer_elapsed(now, due_at_ms) {
                    self.reset_seq = ResetSequence::Idle;
                    self.finish_bus_reset(final_state);
                }
            }
        }
    }

    fn drain_completed_slots(&mut self) {
        if self.slot_a.is_completed() {
            self.finish_slot(SlotId::A);
        }
        if let Some(true) = self.slot_b.as_ref().map(|s| s.is_completed()) {
            self.finish_slot(SlotId::B);
        }
    }

    fn finish_slot(&mut self, id: SlotId) {
        let rp = &self.rp;
        let toggle = &mut self.toggle;
        let outcome = match id {
            SlotId::A => self.slot_a.complete(rp, toggle),
            SlotId::B => self.slot_b.as_mut().unwrap().complete(rp, toggle),
        };
        let request = match id {
            SlotId::A => self.slot_a.request.take(),
            SlotId::B => self.slot_b.as_mut().unwrap().request.take(),
        };
        let Some(mut request) = request else { return };

        // Whether `request` still holds real content to hand to
        // `reply_or_retry` below. `advance_rsm` re-queues a continuing
        // multi-transaction request under the hood and leaves only a
        // placeholder behind; replying with that placeholder would breach
        // the "replies exactly once" contract (§3 `Client`).
        let mut finished = true;
        match outcome {
            TransactionOutcome::UnitBusy => {
                // Sequence mismatch: retry immediately, keep state.
                if self.packets_active.push_back(request).is_err() {
                    warn!("sl811hs: active queue full retrying unit-busy transaction");
                }
                return;
            }
            TransactionOutcome::Ack => {
                if let Some(next) = request.pending_state.take() {
                    request.state = next;
                }
                finished = self.advance_rsm(&mut request);
            }
            TransactionOutcome::Nak => {
                request.pending_state = None;
                request.error = Some(UsbError::Nak);
            }
            TransactionOutcome::Aborted => request.fail(UsbError::Aborted),
            TransactionOutcome::HostError => request.fail(UsbError::HostError),
            TransactionOutcome::Stall => request.fail(UsbError::Stall),
            TransactionOutcome::Overflow => request.fail(UsbError::Overflow),
            TransactionOutcome::Timeout => request.fail(UsbError::Timeout),
        }

        if finished {
            self.reply_or_retry(request);
        }
    }

    fn port_scan_if_needed(&mut self) {
        if self.root_hub.scanned {
            return;
        }
        let status = self.rp.read_byte(regs::INTSTATUS);
        // DETECT is asserted while the port is disconnected, not while it
        // is; FULLSPEED is the live speed-detect bit, not a register this
        // driver itself writes (sl811hs_PortScan, sl811hs.c:834,852).
        let connected = status & regs::INT_DETECT == 0;
        let low_speed = status & regs::INT_FULLSPEED == 0;
        debug!("sl811hs: port scan connected={} low_speed={}", connected, low_speed);

        let mut control2 = regs::CONTROL2_MASTER;
        if low_speed {
            control2 |= regs::CONTROL2_LOW_SPEED;
        }
        self.rp.write_byte(regs::CONTROL2, control2);

        self.root_hub.apply_scan(connected, low_speed);
    }

    fn drain_nak_wait(&mut self) {
        // Timer-fired expiry: move every request whose retry deadline has
        // passed back onto the active queue (§4.6). Our non-blocking
        // redesign checks elapsed time against `now()` rather than waiting
        // for a discrete timer-reply message.
        let now = self.alarm.now();
        let mut requeue = RequestQueue::<NAK_WAIT_CAPACITY>::new();
        while let Some(request) = self.nak_wait.pop_front() {
            let due = request.nak.as_ref().map(|n| n.due_at_ms).unwrap_or(now);
            if timer_elapsed(now, due) {
                if self.packets_active.push_back(request).is_err() {
                    warn!("sl811hs: active queue full draining nak wait");
                }
            } else if requeue.push_back(request).is_err() {
                error!("sl811hs: nak-wait requeue overflow, dropping request");
            }
        }
        self.nak_wait = requeue;
    }

    fn drain_inbox(&mut self) {
        while let Some(request) = self.command_inbox.pop_front() {
            self.dispatch(request);
        }
    }

    fn drive_active_queue(&mut self) {
        loop {
            let Some(mut request) = self.packets_active.pop_front() else {
                break;
            };
            match self.perform(&mut request) {
                PerformResult::Active => {
                    // A slot is now occupied; the hardware can host at
                    // most two concurrent transactions on a half-duplex
                    // bus. Put the request back at the front conceptually
                    // by stopping here; it's already off the active queue
                    // and now owned by the slot, so there is nothing more
                    // to push back.
                    break;
                }
                PerformResult::Busy => {
                    // No free slot. Put it back at the head (§4.4: BUSY
                    // "leav[es] the request at the list head") rather than
                    // the back, so it doesn't lose its place in front of
                    // whatever else is already queued behind it.
                    if self.packets_active.push_front(request).is_err() {
                        error!("sl811hs: could not return busy request to active queue");
                    }
                    break;
                }
                PerformResult::Done => {
                    self.reply_or_retry(request);
                }
            }
        }
    }

    /// Dispatch one command out of the inbox (§4.6's `todo` loop): either
    /// a one-shot controller command, or a transfer that needs RSM
    /// processing and so goes onto the active queue.
    fn dispatch(&mut self, mut request: Request) {
        match request.command {
            Command::Invalid => {
                request.succeed();
                self.reply(request);
            }
            Command::Reset => {
                self.begin_hardware_reset(request);
            }
            Command::Flush => {
                self.flush();
                request.succeed();
                self.reply(request);
            }
            Command::UsbReset => {
                self.reset_reply = Some(request);
                self.begin_bus_reset(Some(ControllerState::Operational));
            }
            Command::UsbOperational => {
                self.port_scan_if_needed();
                self.state = ControllerState::Operational;
                request.succeed();
                self.reply(request);
            }
            Command::UsbSuspend => {
                if self.state != ControllerState::Operational {
                    request.fail(UsbError::UsbOffline);
                } else {
                    self.drive_suspend();
                    self.state = ControllerState::Suspended;
                    request.succeed();
                }
                self.reply(request);
            }
            Command::UsbResume => {
                if self.state != ControllerState::Suspended {
                    request.fail(UsbError::UsbOffline);
                } else {
                    self.state = ControllerState::Resuming;
                    self.drive_resume();
                    self.state = ControllerState::Operational;
                    request.succeed();
                }
                self.reply(request);
            }
            Command::Death => {
                self.shutdown();
                request.succeed();
                self.reply(request);
            }
            Command::QueryDevice => {
                request.fail(UsbError::NoCommand);
                self.reply(request);
            }
            Command::ControlTransfer
            | Command::BulkTransfer
            | Command::InterruptTransfer
            | Command::IsoTransfer => {
                if request.targets_root_hub(self.root_hub.address) {
                    self.handle_root_hub_request(&mut request);
                    self.reply(request);
                    return;
                }
                if self.packets_active.push_back(request).is_err() {
                    // No room on the active queue; caller will see no
                    // reply until a slot frees up and the queue is drained
                    // on a subsequent poll, matching §4.6's todo loop.
                    warn!("sl811hs: active queue full, request delayed");
                }
            }
        }
    }

    fn handle_root_hub_request(&mut self, request: &mut Request) {
        if request.endpoint != 0 {
            // The virtual interrupt-IN status-change pipe.
            match self.root_hub.status_change_byte() {
                Some(byte) => {
                    if let Some(buffer) = request.buffer.as_mut() {
                        if !buffer.is_empty() {
                            buffer[0] = byte;
                            request.actual_len = 1;
                        }
                    }
                    request.succeed();
                }
                None => request.fail(UsbError::Nak),
            }
            return;
        }

        let buffer = request.buffer.as_deref_mut();
        match self.root_hub.handle_control(&request.setup, buffer) {
            Ok((n, action)) => {
                request.actual_len = n;
                match action {
                    HubAction::None => {}
                    // The hub-class reply above already carries error=0
                    // synchronously; the underlying reset runs to
                    // completion in the background (§9B), so no reply is
                    // attached to this sequence.
                    HubAction::DriveReset => self.begin_bus_reset(None),
                    HubAction::DriveSuspend => self.drive_suspend(),
                    HubAction::DriveResume => self.drive_resume(),
                }
                request.succeed();
            }
            Err(err) => request.fail(err),
        }
    }

    /// Pull the head of the active list and try to advance it one
    /// transaction (§4.4 `perform`).
    fn perform(&mut self, request: &mut Request) -> PerformResult {
        if request.is_aborted() {
            return PerformResult::Done;
        }
        if self.state != ControllerState::Operational {
            request.fail(UsbError::UsbOffline);
            return PerformResult::Done;
        }
        if self.root_hub.port_status & crate::roothub::PORT_ENABLE == 0 {
            request.fail(UsbError::UsbOffline);
            return PerformResult::Done;
        }

        let Some((pid, direction, length, iso, next_state)) = self.next_transaction(request) else {
            return PerformResult::Done;
        };

        let slot_choice = if self.slot_a.is_free() {
            Some(SlotId::A)
        } else if self.slot_b.as_ref().map(|s| s.is_free()).unwrap_or(false) {
            Some(SlotId::B)
        } else {
            None
        };
        let Some(slot_id) = slot_choice else {
            return PerformResult::Busy;
        };

        // Staged, not committed: only applied in `finish_slot` if this
        // transaction actually ACKs. A NAK (or any other non-ACK outcome)
        // must leave `state` as-is so the retry recomputes and reissues
        // this same transaction rather than finding the RSM already done.
        request.pending_state = Some(next_state);
        let toggle_bit = if iso {
            false
        } else if pid == regs::PID_SETUP {
            // Every control transfer's SETUP stage is DATA0, regardless of
            // where a previous transfer on this endpoint left the toggle.
            self.toggle.clear(request.device_address, request.endpoint, Direction::Out);
            false
        } else {
            self.toggle.get(request.device_address, request.endpoint, request.direction)
        };

        let params = TransactionParams {
            pid,
            direction,
            iso,
            device_address: request.device_address,
            endpoint: request.endpoint,
            low_speed: request.low_speed,
            length,
            toggle: toggle_bit,
        };

        let sof_remaining = self.rp.read_byte(regs::SOFHIGH) as u16 * 8;

        let owned = core::mem::replace(request, Request::new(Command::Invalid, 0, 0, Direction::In, 0));
        match slot_id {
            SlotId::A => self.slot_a.issue(&self.rp, owned, params, sof_remaining),
            SlotId::B => self
                .slot_b
                .as_mut()
                .unwrap()
                .issue(&self.rp, owned, params, sof_remaining),
        }

        PerformResult::Active
    }

    /// Compute `(pid, direction, length, iso, next_state)` for the next
    /// transaction of `request`, per the RSM table (§4.4). Returns `None`
    /// once the request is `Done`.
    fn next_transaction(
        &self,
        request: &mut Request,
    ) -> Option<(u8, Direction, u16, bool, RequestState)> {
        match request.state {
            RequestState::Done => None,
            RequestState::SetupStart => {
                let data_len = request.data_len();
                let next = if data_len == 0 {
                    RequestState::SetupStatus
                } else if request.direction == Direction::In {
                    RequestState::SetupIn
                } else {
                    RequestState::SetupOut
                };
                Some((regs::PID_SETUP, Direction::Out, 8, false, next))
            }
            RequestState::SetupIn => {
                if core::mem::take(&mut request.last_short) {
                    request.fail(UsbError::RuntPacket);
                    return None;
                }
                let remaining = request.remaining();
                if remaining == 0 {
                    return Some((regs::PID_OUT, Direction::Out, 0, false, RequestState::SetupStatus));
                }
                let len = remaining.min(request.max_packet_size as usize).min(64) as u16;
                Some((regs::PID_IN, Direction::In, len, false, RequestState::SetupIn))
            }
            RequestState::SetupOut => {
                let remaining = request.remaining();
                if remaining == 0 {
                    return Some((regs::PID_IN, Direction::In, 0, false, RequestState::SetupStatus));
                }
                let len = remaining.min(request.max_packet_size as usize).min(64) as u16;
                Some((regs::PID_OUT, Direction::Out, len, false, RequestState::SetupOut))
            }
            RequestState::SetupStatus => {
                // Opposite direction of the data phase; IN if there was no
                // data phase or it was OUT.
                let dir = if request.data_len() == 0 || request.direction == Direction::Out {
                    Direction::In
                } else {
                    Direction::Out
                };
                let pid = if dir == Direction::In { regs::PID_IN } else { regs::PID_OUT };
                Some((pid, dir, 0, false, RequestState::Done))
            }
            RequestState::BulkIn | RequestState::IntIn => {
                if core::mem::take(&mut request.last_short) {
                    request.fail(UsbError::RuntPacket);
                    return None;
                }
                let remaining = request.remaining();
                if remaining == 0 && request.actual_len > 0 {
                    return mark_request_done(request);
                }
                let cap = self.slot_capacity();
                let len = remaining.min(request.max_packet_size as usize).min(64).min(cap) as u16;
                let next = if request.state == RequestState::BulkIn {
                    RequestState::BulkIn
                } else {
                    RequestState::Done
                };
                if len == 0 && request.state == RequestState::BulkIn {
                    return mark_request_done(request);
                }
                Some((regs::PID_IN, Direction::In, len, false, next))
            }
            RequestState::BulkOut | RequestState::IntOut => {
                let remaining = request.remaining();
                if remaining == 0 && request.data_len() > 0 && request.actual_len >= request.data_len() {
                    return mark_request_done(request);
                }
                let cap = self.slot_capacity();
                let len = remaining.min(request.max_packet_size as usize).min(64).min(cap) as u16;
                let next = if request.state == RequestState::BulkOut {
                    RequestState::BulkOut
                } else {
                    RequestState::Done
                };
                if remaining == 0 {
                    return mark_request_done(request);
                }
                Some((regs::PID_OUT, Direction::Out, len, false, next))
            }
            RequestState::IsoIn => {
                let len = request.data_len().min(request.max_packet_size as usize) as u16;
                Some((regs::PID_IN, Direction::In, len, true, RequestState::Done))
            }
            RequestState::IsoOut => {
                let len = request.data_len().min(request.max_packet_size as usize) as u16;
                Some((regs::PID_OUT, Direction::Out, len, true, RequestState::Done))
            }
        }
    }

    fn slot_capacity(&self) -> usize {
        self.config.slot_a_fifo_capacity as usize
    }

    /// Advance the RSM after a successful ACK (§4.4): clear the toggle
    /// before SETUP, otherwise let the transaction engine's own toggle
    /// flip (already applied in `TransactionSlot::complete`) stand. Returns
    /// true once `request` is actually done and ready for `reply_or_retry`;
    /// if more transactions remain it is re-queued here instead, and the
    /// caller must not reply to the placeholder left behind.
    fn advance_rsm(&mut self, request: &mut Request) -> bool {
        if request.is_done() {
            request.succeed();
            return true;
        }
        // More transactions remain; put back on the active queue.
        if self.packets_active.push_back(core::mem::replace(
            request,
            Request::new(Command::Invalid, 0, 0, Direction::In, 0),
        )).is_err()
        {
            error!("sl811hs: active queue full continuing multi-transaction request");
        }
        false
    }

    /// §4.6 `reply-or-retry`: NAK recycles through the retry scheduler;
    /// everything else replies once.
    fn reply_or_retry(&mut self, mut request: Request) {
        if request.is_done() && request.error().is_none() {
            self.reply(request);
            return;
        }
        match request.error() {
            Some(UsbError::RuntPacket) if request.allow_runt => {
                request.error = None;
                request.succeed();
                self.reply(request);
            }
            Some(UsbError::Nak) => self.schedule_nak_retry(request),
            Some(_) => self.reply(request),
            None => {
                // RSM wants to continue (state advanced but not Done and
                // no transaction is pending): give it another pass.
                if self.packets_active.push_back(request).is_err() {
                    error!("sl811hs: active queue full on reply_or_retry continuation");
                }
            }
        }
    }

    /// A NAK defers the request rather than failing it (§4.6
    /// `reply-or-retry`): the interval is the caller's explicit
    /// `interval_ms`, else derived from its `nak_timeout_ms` budget, else
    /// the configured default. Once cumulative NAK wait exceeds
    /// `nak_timeout_ms`, the request fails with `NakTimeout`.
    fn schedule_nak_retry(&mut self, mut request: Request) {
        let interval_ms = request
            .nak
            .map(|n| n.interval_ms)
            .or(request.interval_ms)
            .or(request.nak_timeout_ms.map(|budget_ms| (budget_ms / 16).max(1)))
            .unwrap_or(self.config.default_nak_interval_ms)
            .max(1);
        let elapsed_ms = request.nak.map(|n| n.elapsed_ms).unwrap_or(0) + interval_ms;

        if let Some(budget_ms) = request.nak_timeout_ms {
            if elapsed_ms >= budget_ms {
                request.fail(UsbError::NakTimeout);
                self.reply(request);
                return;
            }
        }

        let now = self.alarm.now();
        request.nak = Some(NakRetry {
            interval_ms,
            due_at_ms: now.wrapping_add(interval_ms),
            elapsed_ms,
        });
        request.error = None;
        self.alarm.set_alarm(interval_ms);
        if self.nak_wait.push_back(request).is_err() {
            error!("sl811hs: nak-wait queue full, dropping retry");
        }
    }

    fn reply(&mut self, request: Request) {
        if let Some(client) = self.client.get() {
            client.request_complete(request);
        } else {
            warn!("sl811hs: reply with no client registered, dropping request");
        }
    }

    /// `CMD_FLUSH`: abort both in-flight slots' owning requests; the
    /// worker observes the flag on completion and replies `IOERR_ABORTED`.
    pub fn flush(&mut self) {
        if let Some(r) = self.slot_a.request.as_ref() {
            r.set_abort();
        }
        if let Some(slot_b) = self.slot_b.as_ref() {
            if let Some(r) = slot_b.request.as_ref() {
                r.set_abort();
            }
        }
        self.packets_active.for_each_mut(|r| r.set_abort());
        self.nak_wait.for_each_mut(|r| r.set_abort());
    }

    /// `CMD_RESET`: mask interrupts and wait 40 ms before driving the bus
    /// reset sequence itself (§9B). Resumed by [`Self::advance_reset_sequence`]
    /// once the delay elapses.
    fn begin_hardware_reset(&mut self, request: Request) {
        debug!("sl811hs: hardware reset requested, revision probed as {:#x}", self.revision);
        self.rp.write_byte(regs::INTENABLE, 0);
        self.reset_reply = Some(request);
        let due_at_ms = self.alarm.now().wrapping_add(40);
        self.alarm.set_alarm(40);
        self.reset_seq = ResetSequence::PreDelay { due_at_ms };
    }

    /// Bus reset sequencing, §9B, part one: assert USB_RESET alone, mask
    /// interrupts, fail in-flight transfers as USBOFFLINE, clear toggles,
    /// and arm the 50 ms settle delay. `final_state` is the controller
    /// state to adopt once [`Self::finish_bus_reset`] runs, or `None` to
    /// leave it unchanged (the hub-class `SET_FEATURE(PORT_RESET)` path,
    /// whose own reply already went out synchronously).
    fn begin_bus_reset(&mut self, final_state: Option<ControllerState>) {
        self.rp.write_byte(regs::INTENABLE, 0);
        self.rp.write_byte(regs::CONTROL1, regs::CONTROL1_USB_RESET);

        self.root_hub.port_status |= PORT_RESET_BITS;
        self.root_hub.port_change |= PORT_RESET_BITS;
        self.toggle.clear_all();
        self.fail_in_flight(UsbError::UsbOffline);

        let due_at_ms = self.alarm.now().wrapping_add(50);
        self.alarm.set_alarm(50);
        self.reset_seq = ResetSequence::Settling { due_at_ms, final_state };
    }

    /// Bus reset sequencing, §9B, part two: de-assert CONTROL1, rescan the
    /// port, reprogram both banks to power-on values, and re-enable
    /// interrupts, leaving PORT_RESET's change bit set. Replies to the
    /// `CMD_RESET`/`UHCMD_USBRESET` request that started the sequence, if
    /// any.
    fn finish_bus_reset(&mut self, final_state: Option<ControllerState>) {
        self.rp.write_byte(regs::CONTROL1, 0);
        self.root_hub.scanned = false;
        self.port_scan_if_needed();

        self.rp.write_byte(regs::HOSTCTRL, 0);
        self.rp.write_byte(regs::HOSTBASE, self.config.slot_a_fifo_base as u8);
        if self.config.slot_b_enabled {
            self.rp
                .write_byte(regs::BANK_B_OFFSET + regs::HOSTCTRL, 0);
            self.rp.write_byte(
                regs::BANK_B_OFFSET + regs::HOSTBASE,
                self.config.slot_b_fifo_base as u8,
            );
        }

        let mut int_enable = regs::INT_DETECT | regs::INT_USB_A;
        if self.config.slot_b_enabled {
            int_enable |= regs::INT_USB_B;
        }
        self.rp.write_byte(regs::INTENABLE, int_enable);

        self.root_hub.port_status &= !PORT_RESET_BITS;
        self.root_hub.port_status |= crate::roothub::PORT_ENABLE | crate::roothub::PORT_POWER;

        if let Some(state) = final_state {
            self.state = state;
        }
        if let Some(mut request) = self.reset_reply.take() {
            request.succeed();
            self.reply(request);
        }
    }

    fn drive_suspend(&mut self) {
        self.rp.write_byte(
            regs::CONTROL1,
            regs::CONTROL1_USB_RESET | regs::CONTROL1_SUSPEND,
        );
        self.root_hub.port_status |= crate::roothub::PORT_SUSPEND;
        self.root_hub.port_change |= crate::roothub::PORT_SUSPEND;
    }

    fn drive_resume(&mut self) {
        self.rp.write_byte(regs::HOSTDEVICEADDR, 0);
        let c1 = self.rp.read_byte(regs::CONTROL1);
        self.rp.write_byte(regs::CONTROL1, c1 & !regs::CONTROL1_SUSPEND);
        self.root_hub.port_change |= crate::roothub::PORT_SUSPEND;
    }

    fn fail_in_flight(&mut self, err: UsbError) {
        if let Some(mut r) = self.slot_a.request.take() {
            r.fail(err);
            self.reply(r);
        }
        if let Some(slot_b) = self.slot_b.as_mut() {
            if let Some(mut r) = slot_b.request.take() {
                r.fail(err);
                self.reply(r);
            }
        }
        while let Some(mut r) = self.packets_active.pop_front() {
            r.fail(err);
            self.reply(r);
        }
        while let Some(mut r) = self.nak_wait.pop_front() {
            r.fail(err);
            self.reply(r);
        }
    }

    /// Detach: post the death command, which zeroes hardware state and
    /// marks the dispatcher dead so no further `poll()` does work (§6, §9B).
    fn shutdown(&mut self) {
        self.fail_in_flight(UsbError::Aborted);
        self.rp.write_byte(regs::HOSTCTRL, 0);
        self.rp.write_byte(regs::BANK_B_OFFSET + regs::HOSTCTRL, 0);
        self.rp.write_byte(regs::CONTROL1, 0);
        self.rp.write_byte(regs::INTENABLE, 0);
        self.alive = false;
    }

    /// Public detach entry point (§6). Drains/aborts outstanding requests
    /// and zeroes the registers; the caller is then responsible for
    /// unhooking the interrupt line and dropping the controller.
    pub fn detach(mut self) {
        let death = Request::new(Command::Death, 0, 0, Direction::In, 0);
        self.dispatch(death);
    }
}

const PORT_RESET_BITS: u16 = crate::roothub::PORT_RESET;

fn mark_request_done(request: &mut Request) -> Option<(u8, Direction, u16, bool, RequestState)> {
    request.state = RequestState::Done;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_bus::FakeBus;
    use crate::hil::AlarmClient;
    use crate::roothub::{PORT_CONNECTION, PORT_ENABLE};
    use std::cell::{Cell, RefCell};
    use std::vec::Vec;

    // Standard USB request/feature codes used to build SETUP packets below.
    const REQ_GET_STATUS: u8 = 0;
    const REQ_SET_FEATURE: u8 = 3;
    const REQ_SET_ADDRESS: u8 = 5;
    const REQ_GET_DESCRIPTOR: u8 = 6;
    const FEATURE_PORT_RESET: u16 = 4;
    const DESC_DEVICE: u16 = 1;
    const DESC_CONFIGURATION: u16 = 2;

    struct FakeAlarm {
        now: Cell<u32>,
        armed: Cell<Option<u32>>,
    }

    impl FakeAlarm {
        fn new() -> Self {
            FakeAlarm { now: Cell::new(0), armed: Cell::new(None) }
        }

        fn advance(&self, dt_ms: u32) {
            self.now.set(self.now.get().wrapping_add(dt_ms));
        }
    }

    impl<'a> Alarm<'a> for FakeAlarm {
        fn now(&self) -> u32 {
            self.now.get()
        }

        fn set_alarm(&self, dt_ms: u32) {
            self.armed.set(Some(self.now.get().wrapping_add(dt_ms)));
        }

        fn disarm(&self) {
            self.armed.set(None);
        }

        fn set_alarm_client(&self, _client: &'a dyn AlarmClient) {}
    }

    #[derive(Default)]
    struct RecordingClient {
        replies: RefCell<Vec<Request>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            RecordingClient::default()
        }

        fn take(&self) -> Vec<Request> {
            self.replies.borrow_mut().drain(..).collect()
        }
    }

    impl Client for RecordingClient {
        fn request_complete(&self, request: Request) {
            self.replies.borrow_mut().push(request);
        }
    }

    fn setup(bm: u8, req: u8, value: u16, index: u16, len: u16) -> [u8; 8] {
        let mut s = [0u8; 8];
        s[0] = bm;
        s[1] = req;
        s[2..4].copy_from_slice(&value.to_le_bytes());
        s[4..6].copy_from_slice(&index.to_le_bytes());
        s[6..8].copy_from_slice(&len.to_le_bytes());
        s
    }

    /// Bring a freshly attached controller into `Operational` with its one
    /// port connected and enabled, bypassing the real hardware scan (the
    /// `FakeBus` has no interrupt status to drive it).
    fn operational<'a>(bus: &'a FakeBus, alarm: &'a FakeAlarm) -> Controller<'a, FakeBus, FakeAlarm> {
        bus.set_reg(regs::HWREVISION, regs::REVISION_1_5_FAMILY);
        let mut controller = Controller::attach(bus, alarm, Sl811Config::single_slot()).unwrap();
        controller.state = ControllerState::Operational;
        controller.root_hub.port_status |= PORT_ENABLE | PORT_CONNECTION;
        controller
    }

    #[test]
    fn attach_rejects_unrecognized_revision() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        bus.set_reg(regs::HWREVISION, 0xff);
        assert!(Controller::attach(&bus, &alarm, Sl811Config::single_slot()).is_none());
    }

    #[test]
    fn attach_accepts_both_families_and_query_device_maps_revision() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();

        bus.set_reg(regs::HWREVISION, regs::REVISION_1_5_FAMILY);
        let controller = Controller::attach(&bus, &alarm, Sl811Config::single_slot()).unwrap();
        assert_eq!(controller.query_device().hardware_revision, 5);

        bus.set_reg(regs::HWREVISION, regs::REVISION_1_2_FAMILY | 0x3);
        let controller = Controller::attach(&bus, &alarm, Sl811Config::single_slot()).unwrap();
        assert_eq!(controller.query_device().hardware_revision, 2);
    }

    #[test]
    fn usb_operational_command_transitions_state_and_replies() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        bus.set_reg(regs::HWREVISION, regs::REVISION_1_5_FAMILY);
        let mut controller = Controller::attach(&bus, &alarm, Sl811Config::single_slot()).unwrap();
        let client = RecordingClient::new();
        controller.set_client(&client);

        assert_eq!(controller.state(), ControllerState::Reset);
        controller.begin_io(Request::new(Command::UsbOperational, 0, 0, Direction::In, 0));
        controller.poll();

        assert_eq!(controller.state(), ControllerState::Operational);
        let replies = client.take();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error().is_none());
    }

    #[test]
    fn setup_stage_always_issues_data0_regardless_of_prior_toggle() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        // Leave endpoint 0's OUT toggle at DATA1, as a previous control
        // transfer on this device might have, and confirm the next SETUP
        // still goes out as DATA0 (§8 round-trip law).
        controller.toggle.flip(9, 0, Direction::Out);
        assert!(controller.toggle.get(9, 0, Direction::Out));

        let mut req = Request::new(Command::ControlTransfer, 9, 0, Direction::Out, 64);
        req.setup = setup(0x00, REQ_SET_ADDRESS, 5, 0, 0);
        controller.begin_io(req);
        controller.poll();

        let writes = bus.writes.borrow();
        let ctrl_write = writes
            .iter()
            .find(|(addr, _)| *addr == regs::HOSTCTRL)
            .expect("HOSTCTRL was written");
        assert_eq!(ctrl_write.1 & regs::HOSTCTRL_DATA1, 0);
        assert!(!controller.toggle.get(9, 0, Direction::Out));
    }

    #[test]
    fn root_hub_get_device_descriptor() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::ControlTransfer, 0, 0, Direction::In, 64);
        req.setup = setup(0x80, REQ_GET_DESCRIPTOR, DESC_DEVICE << 8, 0, 18);
        req.buffer = Some(Box::leak(Box::new([0u8; 18])));
        controller.begin_io(req);
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert!(reply.error().is_none());
        assert_eq!(reply.actual_len, 18);
        let buf = reply.buffer.as_ref().unwrap();
        assert_eq!(buf[0], 18);
        assert_eq!(u16::from_le_bytes([buf[8], buf[9]]), 0x04b4);
    }

    #[test]
    fn root_hub_set_address_then_get_config_descriptor() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut assign = Request::new(Command::ControlTransfer, 0, 0, Direction::Out, 64);
        assign.setup = setup(0x00, REQ_SET_ADDRESS, 5, 0, 0);
        controller.begin_io(assign);
        controller.poll();
        assert!(client.take()[0].error().is_none());
        assert_eq!(controller.root_hub.address, 5);

        let mut req = Request::new(Command::ControlTransfer, 5, 0, Direction::In, 64);
        req.setup = setup(0x80, REQ_GET_DESCRIPTOR, DESC_CONFIGURATION << 8, 0, 32);
        req.buffer = Some(Box::leak(Box::new([0u8; 32])));
        controller.begin_io(req);
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert!(reply.error().is_none());
        let buf = reply.buffer.as_ref().unwrap();
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 34);
    }

    #[test]
    fn hub_class_port_reset_settles_after_alarm_and_sets_change_bit() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::ControlTransfer, 0, 0, Direction::Out, 64);
        req.setup = setup(0x23, REQ_SET_FEATURE, FEATURE_PORT_RESET, 1, 0);
        controller.begin_io(req);
        controller.poll();
        // The hub-class SET_FEATURE reply goes out synchronously; the reset
        // it triggers keeps running in the background.
        assert!(client.take()[0].error().is_none());
        assert_ne!(controller.reset_seq, ResetSequence::Idle);

        // Bus-reset settle delay (§9B): nothing finishes until it elapses.
        controller.poll();
        assert_ne!(controller.reset_seq, ResetSequence::Idle);
        alarm.advance(50);
        controller.poll();
        assert_eq!(controller.reset_seq, ResetSequence::Idle);
        assert_eq!(controller.state(), ControllerState::Operational);

        let mut status_req = Request::new(Command::ControlTransfer, 0, 0, Direction::In, 64);
        status_req.setup = setup(0xa3, REQ_GET_STATUS, 0, 1, 4);
        status_req.buffer = Some(Box::leak(Box::new([0u8; 4])));
        controller.begin_io(status_req);
        controller.poll();
        let mut replies = client.take();
        let reply = replies.remove(0);
        let buf = reply.buffer.as_ref().unwrap();
        let change = u16::from_le_bytes([buf[2], buf[3]]);
        assert_ne!(change & crate::roothub::PORT_RESET, 0);
    }

    #[test]
    fn bulk_in_transfer_completes_after_a_nak_retry() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::BulkTransfer, 9, 1, Direction::In, 4);
        req.buffer = Some(Box::leak(Box::new([0u8; 4])));
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        // First transaction NAKs; the request goes into the NAK-wait queue
        // rather than failing or replying immediately (§4.6).
        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_NAK);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();
        assert!(client.take().is_empty());

        alarm.advance(DEFAULT_INTERVAL_MS.max(1));
        controller.poll();

        // Second transaction ACKs and completes the 4-byte transfer.
        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_ACK);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert!(reply.error().is_none());
        assert_eq!(reply.actual_len, 4);
    }

    #[test]
    fn nak_retry_interval_falls_back_to_nak_timeout_over_sixteen() {
        // §4.6: with no explicit interval, the retry interval derives from
        // the caller's NakTimeout budget (NakTimeout/16) rather than going
        // straight to the 4 ms default.
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::InterruptTransfer, 9, 1, Direction::In, 4);
        req.buffer = Some(Box::leak(Box::new([0u8; 4])));
        req.nak_timeout_ms = Some(160);
        controller.begin_io(req);
        controller.poll();

        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_NAK);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();

        // 160 / 16 = 10 ms: not yet due at +4 ms (the unrelated default).
        alarm.advance(4);
        controller.poll();
        assert!(client.take().is_empty());
        bus.set_reg(regs::INTSTATUS, 0);
        controller.handle_interrupt();
        controller.poll();
        assert!(client.take().is_empty());

        alarm.advance(6);
        controller.poll();

        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_ACK);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        assert!(replies.remove(0).error().is_none());
    }

    #[test]
    fn bulk_in_nak_budget_exhausted_reports_nak_timeout() {
        // §8 scenario 4: an INT IN the simulator perpetually NAKs, with a
        // caller-supplied NakTimeout budget, eventually fails with
        // NakTimeout instead of retrying forever.
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::InterruptTransfer, 9, 1, Direction::In, 4);
        req.buffer = Some(Box::leak(Box::new([0u8; 4])));
        req.interval_ms = Some(4);
        req.nak_timeout_ms = Some(10);
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_NAK);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);

        // Each retry round: interrupt fires the NAK completion, the alarm
        // elapses, poll() re-submits. After enough rounds the accumulated
        // wait crosses the 10 ms budget and the request fails instead of
        // retrying again.
        for _ in 0..5 {
            controller.handle_interrupt();
            controller.poll();
            if !client.replies.borrow().is_empty() {
                break;
            }
            alarm.advance(4);
            controller.poll();
        }

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert_eq!(reply.error(), Some(UsbError::NakTimeout));
    }

    #[test]
    fn short_bulk_in_packet_reports_runt_packet_unless_allowed() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::BulkTransfer, 9, 1, Direction::In, 8);
        req.buffer = Some(Box::leak(Box::new([0u8; 8])));
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        // The device ACKs but only returns 4 of the 8 bytes requested: the
        // chip overwrites HOSTLEN with the actual count received.
        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_ACK);
        bus.set_reg(regs::HOSTLEN, 4);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert_eq!(reply.error(), Some(UsbError::RuntPacket));
        assert_eq!(reply.actual_len, 4);
    }

    #[test]
    fn short_bulk_in_packet_succeeds_when_runts_allowed() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::BulkTransfer, 9, 1, Direction::In, 8);
        req.buffer = Some(Box::leak(Box::new([0u8; 8])));
        req.allow_runt = true;
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        bus.set_reg(regs::HOSTSTATUS, regs::HOSTSTATUS_ACK);
        bus.set_reg(regs::HOSTLEN, 4);
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert!(reply.error().is_none());
        assert_eq!(reply.actual_len, 4);
    }

    #[test]
    fn flush_aborts_an_in_flight_transfer() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::BulkTransfer, 9, 1, Direction::Out, 4);
        req.buffer = Some(Box::leak(Box::new([0xaa; 4])));
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        controller.flush();
        bus.set_reg(regs::INTSTATUS, regs::INT_USB_A);
        controller.handle_interrupt();
        controller.poll();

        let mut replies = client.take();
        assert_eq!(replies.len(), 1);
        let reply = replies.remove(0);
        assert_eq!(reply.error(), Some(UsbError::Aborted));
    }

    #[test]
    fn detach_fails_queued_requests() {
        let bus = FakeBus::new();
        let alarm = FakeAlarm::new();
        let mut controller = operational(&bus, &alarm);
        let client = RecordingClient::new();
        controller.set_client(&client);

        let mut req = Request::new(Command::BulkTransfer, 9, 1, Direction::Out, 4);
        req.buffer = Some(Box::leak(Box::new([0u8; 4])));
        controller.begin_io(req);
        controller.poll();
        assert!(client.take().is_empty());

        controller.detach();
        let mut replies = client.take();
        assert!(!replies.is_empty());
        assert!(replies.drain(..).any(|r| r.error() == Some(UsbError::Aborted)));
    }
}
