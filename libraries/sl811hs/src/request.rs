// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! A transfer request and the per-request state machine (RSM, §4.4) that
//! carries it through its USB phases.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::UsbError;

/// Supported commands (§6). `Death` is the reserved value posted by
/// `detach`; it never comes from a caller's `begin_io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Invalid,
    Reset,
    Flush,
    UsbReset,
    UsbOperational,
    UsbSuspend,
    UsbResume,
    ControlTransfer,
    BulkTransfer,
    InterruptTransfer,
    IsoTransfer,
    QueryDevice,
    Death,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Private per-request state, §4.4. The initial state is chosen by
/// `Request::new` from the command and transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    SetupStart,
    SetupIn,
    SetupOut,
    SetupStatus,
    BulkIn,
    BulkOut,
    IntIn,
    IntOut,
    IsoIn,
    IsoOut,
    Done,
}

/// NAK-retry bookkeeping, attached to a request on its first NAK and freed
/// on reply or once the retry budget is exhausted (§4.6). Scheduling is
/// driven off the alarm's real millisecond clock rather than a counted
/// microframe budget, since that's the clock the alarm HIL actually gives
/// us; the microframe unit from §9B is only used to size the interval.
#[derive(Debug, Clone, Copy)]
pub struct NakRetry {
    /// Retry interval, in milliseconds.
    pub interval_ms: u32,
    /// `Alarm::now()` timestamp at which this request should be retried.
    pub due_at_ms: u32,
    /// Cumulative time spent waiting on NAKs for this request, compared
    /// against the caller's `nak_timeout_ms` budget.
    pub elapsed_ms: u32,
}

/// Default NAK retry interval when neither an explicit interval nor a
/// NAK-timeout-derived fallback is available: 32 microframes (4 ms, §9B).
pub const DEFAULT_INTERVAL_UFRAMES: u32 = 32;
pub const DEFAULT_INTERVAL_MS: u32 = DEFAULT_INTERVAL_UFRAMES / 8;

/// A single transfer request. Created by the caller, queued into the
/// controller, and returned on reply (§3).
pub struct Request {
    pub command: Command,
    pub device_address: u8,
    pub endpoint: u8,
    pub direction: Direction,
    pub max_packet_size: u16,
    /// 8-byte SETUP payload; only meaningful for `Command::ControlTransfer`.
    pub setup: [u8; 8],
    /// Caller-owned data buffer. `None` for zero-length transfers.
    pub buffer: Option<&'static mut [u8]>,
    /// Bytes actually transferred so far.
    pub actual_len: usize,
    /// Caller-supplied retry interval, in milliseconds, if any.
    pub interval_ms: Option<u32>,
    /// Caller's NAK-timeout budget, in milliseconds, if the
    /// `UHFF_NAKTIMEOUT` flag is set.
    pub nak_timeout_ms: Option<u32>,
    /// If set, a short transfer is not an error.
    pub allow_runt: bool,
    /// Whether the device is attached as low-speed (adds PREAMBLE).
    pub low_speed: bool,

    pub(crate) state: RequestState,
    /// The state `perform()` plans to commit once the in-flight transaction
    /// it issued actually ACKs. Left uncommitted (and `state` left alone)
    /// on any other outcome, so a NAKed single-transaction request (INT,
    /// ISO) recomputes and reissues the *same* transaction on retry instead
    /// of finding itself already `Done` with nothing left to do.
    pub(crate) pending_state: Option<RequestState>,
    pub(crate) error: Option<UsbError>,
    pub(crate) nak: Option<NakRetry>,
    /// Set by the transaction engine when the last completed IN transaction
    /// returned fewer bytes than requested; consumed (and cleared) by the
    /// RSM's next `next_transaction` call to raise `RuntPacket` (§7).
    pub(crate) last_short: bool,
    abort: AtomicBool,
}

impl Request {
    pub fn new(
        command: Command,
        device_address: u8,
        endpoint: u8,
        direction: Direction,
        max_packet_size: u16,
    ) -> Self {
        let state = Self::initial_state(command, direction);
        Request {
            command,
            device_address,
            endpoint,
            direction,
            max_packet_size,
            setup: [0; 8],
            buffer: None,
            actual_len: 0,
            interval_ms: None,
            nak_timeout_ms: None,
            allow_runt: false,
            low_speed: false,
            state,
            pending_state: None,
            error: None,
            nak: None,
            last_short: false,
            abort: AtomicBool::new(false),
        }
    }

    fn initial_state(command: Command, direction: Direction) -> RequestState {
        match command {
            Command::ControlTransfer => RequestState::SetupStart,
            Command::BulkTransfer => match direction {
                Direction::In => RequestState::BulkIn,
                Direction::Out => RequestState::BulkOut,
            },
            Command::InterruptTransfer => match direction {
                Direction::In => RequestState::IntIn,
                Direction::Out => RequestState::IntOut,
            },
            Command::IsoTransfer => match direction {
                Direction::In => RequestState::IsoIn,
                Direction::Out => RequestState::IsoOut,
            },
            _ => RequestState::Done,
        }
    }

    /// Length of the (optional) data phase, in bytes.
    pub fn data_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub fn remaining(&self) -> usize {
        self.data_len().saturating_sub(self.actual_len)
    }

    pub fn is_done(&self) -> bool {
        self.state == RequestState::Done
    }

    pub fn error(&self) -> Option<UsbError> {
        self.error
    }

    /// Terminate the request immediately with the given error, short of
    /// any further transaction issue.
    pub fn fail(&mut self, err: UsbError) {
        self.error = Some(err);
        self.state = RequestState::Done;
    }

    pub fn succeed(&mut self) {
        if self.error.is_none() {
            self.error = None;
        }
        self.state = RequestState::Done;
    }

    /// Set atomically from any context (worker or a caller's `abort_io`),
    /// matching the spec's "interrupts masked" discipline for this flag.
    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Is this request addressed to the controller's own (root-hub)
    /// address? Steered to the virtual root hub rather than the wire.
    pub fn targets_root_hub(&self, root_hub_address: u8) -> bool {
        self.device_address == root_hub_address
    }
}
