//! The conversion protocol, independent of how the wait phase is scheduled.
//!
//! Both drivers run the same cycle: optionally write a config byte
//! (channel switch, one-shot trigger), then poll 3-byte frames until the
//! echoed config byte reports readiness or the poll budget runs out. The
//! pieces that do not touch the bus live here so the blocking and
//! suspending drivers cannot drift apart.

use byteorder::{BigEndian, ByteOrder};
use core::fmt;

use crate::config::{self, Config, Gain, Mode, Resolution};
use crate::conversion::ConversionResult;
use crate::{Client, InvalidChannel};

/// Per-instance tuning knobs.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Options {
    /// Expected conversion times below this many microseconds take the
    /// non-yielding wait path in the async driver.
    pub busy_threshold_us: u32,
    /// Total wait budget, as a multiple of the conversion time.
    pub timeout_factor: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            busy_threshold_us: 20_000,
            timeout_factor: 5,
        }
    }
}

/// Driver-side mirror of the device state.
///
/// Updated only from bytes the device actually echoed, never from what the
/// driver asked for.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Shadow {
    pub config: Config,
    pub frame: [u8; 3],
    pub last_conversion: Option<ConversionResult>,
}

impl Shadow {
    pub fn new(frame: [u8; 3]) -> Self {
        Shadow {
            config: Config::decode(frame[2]),
            frame,
            last_conversion: None,
        }
    }

    /// Last config byte as echoed by the device.
    pub fn config_byte(&self) -> u8 {
        self.frame[2]
    }

    /// Stores a freshly read frame, reconciles the mirrored configuration
    /// from the echoed byte and reports whether the result is ready.
    pub fn absorb(&mut self, frame: [u8; 3]) -> bool {
        self.frame = frame;
        self.config = Config::decode(frame[2]);
        self.config.ready
    }

    /// Builds the result for the current frame and makes it the last
    /// conversion. Only called once readiness has been observed.
    pub fn complete(&mut self) -> ConversionResult {
        let raw = BigEndian::read_i16(&self.frame[..2]);
        let result = ConversionResult::new(self.config.channel, raw, self.config.resolution);
        self.last_conversion = Some(result);
        result
    }
}

/// One planned read: what to write before polling, and the poll bounds.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) struct ReadCycle {
    /// Config byte to send before the poll loop, if any.
    pub write: Option<u8>,
    pub poll_interval_us: u32,
    pub max_polls: u32,
    pub conversion_time_us: u32,
}

impl ReadCycle {
    /// Plans a read according to the mode the device last reported.
    pub fn plan(
        shadow: &Shadow,
        channel: u8,
        channel_count: u8,
        options: &Options,
    ) -> Result<Self, InvalidChannel> {
        match shadow.config.mode {
            Mode::OneShot => Self::one_shot(shadow, channel, channel_count, options),
            Mode::Continuous => Self::continuous(shadow, channel, channel_count, options),
        }
    }

    /// Plans a read in continuous mode.
    ///
    /// The device free-runs, so the only write is a channel switch, and
    /// polling happens at a fifth of the conversion time to pick the
    /// result up quickly. Requesting channel 0 never writes, even when the
    /// device reports a different channel; deliberate fidelity to the
    /// long-standing behavior callers rely on.
    pub fn continuous(
        shadow: &Shadow,
        channel: u8,
        channel_count: u8,
        options: &Options,
    ) -> Result<Self, InvalidChannel> {
        if channel >= channel_count {
            return Err(InvalidChannel(channel));
        }
        let write = if channel > 0 && channel != shadow.config.channel {
            Some(config::set_channel(shadow.config_byte(), channel, channel_count)?)
        } else {
            None
        };
        let conversion_time_us = shadow.config.resolution.conversion_time_us();
        let poll_interval_us = conversion_time_us / 5;
        Ok(ReadCycle {
            write,
            poll_interval_us,
            max_polls: options.timeout_factor * conversion_time_us / poll_interval_us,
            conversion_time_us,
        })
    }

    /// Plans a read in one-shot mode.
    ///
    /// The write is mandatory: clearing the ready bit is what starts the
    /// conversion, a bare channel switch would not. Polling happens at the
    /// conversion time since nothing can be ready earlier.
    pub fn one_shot(
        shadow: &Shadow,
        channel: u8,
        channel_count: u8,
        options: &Options,
    ) -> Result<Self, InvalidChannel> {
        if channel >= channel_count {
            return Err(InvalidChannel(channel));
        }
        let mut byte = config::set_ready(shadow.config_byte(), false);
        if channel != shadow.config.channel {
            byte = config::set_channel(byte, channel, channel_count)?;
        }
        let conversion_time_us = shadow.config.resolution.conversion_time_us();
        Ok(ReadCycle {
            write: Some(byte),
            poll_interval_us: conversion_time_us,
            max_polls: options.timeout_factor,
            conversion_time_us,
        })
    }
}

/// Per-field outcome of a verified configuration write.
///
/// Each populated field holds `(requested, echoed)`. The device may defer a
/// field that races an in-flight conversion, so a mismatch is a diagnostic,
/// not an error.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigCheck {
    pub channel: Option<(u8, u8)>,
    pub mode: Option<(Mode, Mode)>,
    pub gain: Option<(Gain, Gain)>,
    pub resolution: Option<(Resolution, Resolution)>,
}

impl ConfigCheck {
    pub(crate) fn compare(requested: &Config, echoed: &Config) -> Self {
        let mut check = ConfigCheck::default();
        if requested.channel != echoed.channel {
            check.channel = Some((requested.channel, echoed.channel));
        }
        if requested.mode != echoed.mode {
            check.mode = Some((requested.mode, echoed.mode));
        }
        if requested.gain != echoed.gain {
            check.gain = Some((requested.gain, echoed.gain));
        }
        if requested.resolution != echoed.resolution {
            check.resolution = Some((requested.resolution, echoed.resolution));
        }
        check
    }

    /// True when the device echoed every requested field back.
    pub fn fully_applied(&self) -> bool {
        self.channel.is_none()
            && self.mode.is_none()
            && self.gain.is_none()
            && self.resolution.is_none()
    }
}

impl fmt::Display for ConfigCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fully_applied() {
            return f.write_str("config applied");
        }
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            Ok(())
        };
        if let Some((requested, echoed)) = self.channel {
            sep(f)?;
            write!(f, "channel: requested {requested}, device reports {echoed}")?;
        }
        if let Some((requested, echoed)) = self.mode {
            sep(f)?;
            write!(f, "mode: requested {requested:?}, device reports {echoed:?}")?;
        }
        if let Some((requested, echoed)) = self.gain {
            sep(f)?;
            write!(f, "gain: requested {requested:?}, device reports {echoed:?}")?;
        }
        if let Some((requested, echoed)) = self.resolution {
            sep(f)?;
            write!(
                f,
                "resolution: requested {requested:?}, device reports {echoed:?}"
            )?;
        }
        Ok(())
    }
}

pub(crate) const MAX_CLIENTS: usize = 4;

/// Registered conversion observers, notified in registration order.
pub(crate) struct Clients<'a> {
    slots: [Option<&'a dyn Client>; MAX_CLIENTS],
}

impl<'a> Clients<'a> {
    pub fn new() -> Self {
        Clients {
            slots: [None; MAX_CLIENTS],
        }
    }

    /// Registers a client. Returns false when all slots are taken.
    pub fn add(&mut self, client: &'a dyn Client) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(client);
                return true;
            }
        }
        false
    }

    pub fn notify(&self, result: &ConversionResult) {
        for client in self.slots.iter().flatten() {
            client.conversion_done(result);
        }
    }
}
