// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Error taxonomy surfaced on a [`crate::Request`]'s reply.
//!
//! Only [`UsbError::Nak`] and the sequence-mismatch "unit busy" condition
//! recycle a request into the active queue; every other outcome is terminal
//! and replies exactly once.

use core::fmt;

/// Outcome of a transfer request, carried back to the caller on reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// The port is not enabled, or the controller is not `Operational`.
    UsbOffline,
    /// The controller reported bit 7 of `HOSTSTATUS`, or an otherwise
    /// impossible hardware state.
    HostError,
    /// A descriptor (or other reply) was longer than the caller's buffer.
    Overflow,
    /// The transaction timed out on the wire.
    Timeout,
    /// The endpoint stalled. Not retried; surfaced as the reply status.
    Stall,
    /// The endpoint NAKed. Recovered locally by the NAK retry scheduler;
    /// only ever observed by a caller if it escalates to [`UsbError::NakTimeout`].
    Nak,
    /// The caller's NAK budget (`NakTimeout`) was exhausted.
    NakTimeout,
    /// The request's abort flag was observed.
    Aborted,
    /// Invalid direction, or a length mismatch between setup and buffer.
    BadParams,
    /// Unrecognised command code.
    NoCommand,
    /// Short transfer; cleared to success upstream when the caller allows
    /// runt packets, so this variant should not escape to callers that set
    /// the allow-runts flag.
    RuntPacket,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UsbError::UsbOffline => "port not enabled or controller not operational",
            UsbError::HostError => "host controller signalled an error condition",
            UsbError::Overflow => "reply longer than caller buffer",
            UsbError::Timeout => "transaction timed out on the wire",
            UsbError::Stall => "endpoint stalled",
            UsbError::Nak => "endpoint not ready (NAK)",
            UsbError::NakTimeout => "NAK retry budget exhausted",
            UsbError::Aborted => "request aborted",
            UsbError::BadParams => "invalid request parameters",
            UsbError::NoCommand => "unrecognised command",
            UsbError::RuntPacket => "short transfer",
        };
        write!(f, "{}", msg)
    }
}

impl UsbError {
    /// True for the two conditions that recycle a request instead of
    /// replying: a plain NAK, or (not modeled as a distinct variant; see
    /// [`crate::slot::TransactionOutcome::UnitBusy`]) a sequence mismatch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsbError::Nak)
    }
}
