// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Hardware interfaces this crate consumes: the register bus (see
//! [`crate::bus`]) and a millisecond timer source used for NAK-retry
//! scheduling and the bus-reset settle delay.
//!
//! Modeled on the shape of `kernel::hil::time::{Alarm, AlarmClient}`, but
//! kept local to this crate (in place of a `kernel` dependency) since the
//! ambient stack here is the `log` facade, not the in-tree kernel crate.

/// A free-running millisecond timer with a one-shot alarm.
///
/// Implementations are expected to be cheap to poll and to call
/// [`AlarmClient::alarm`] from whatever context the underlying timer
/// interrupt fires in; the worker dispatcher (see [`crate::controller`])
/// treats that callback as just another wake-up source.
pub trait Alarm<'a> {
    /// Current time, in milliseconds, since an arbitrary epoch.
    fn now(&self) -> u32;

    /// Arm the alarm to fire at `now() + dt_ms`. Re-arming overwrites any
    /// previously pending request.
    fn set_alarm(&self, dt_ms: u32);

    /// Cancel a pending alarm. A no-op if none is pending.
    fn disarm(&self);

    /// Register the callback invoked when the alarm fires.
    fn set_alarm_client(&self, client: &'a dyn AlarmClient);
}

/// Callback for [`Alarm::set_alarm`].
pub trait AlarmClient {
    fn alarm(&self);
}
