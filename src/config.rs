//! Configuration register codec and conversion timing.
//!
//! The MCP342x exposes exactly one register: a single byte that is both the
//! command the host writes and the status the device echoes after the two
//! data bytes. Layout from datasheet section 5.2:
//!
//! ```text
//! bit 7    | bit 6:5 | bit 4 | bit 3:2    | bit 1:0
//! nRDY     | channel | mode  | resolution | gain
//! ```
//!
//! Bit 7 reads back 0 once a conversion result is valid; writing it to 1 is
//! the "start a conversion" request in one-shot mode. The driver never
//! writes it to 0.

use crate::InvalidChannel;

pub(crate) const GAIN_MASK: u8 = 0b0000_0011;
pub(crate) const RESOLUTION_MASK: u8 = 0b0000_1100;
pub(crate) const MODE_MASK: u8 = 0b0001_0000;
pub(crate) const CHANNEL_MASK: u8 = 0b0110_0000;
pub(crate) const READY_MASK: u8 = 0b1000_0000;

const RESOLUTION_SHIFT: u8 = 2;
const MODE_SHIFT: u8 = 4;
const CHANNEL_SHIFT: u8 = 5;

/// PGA gain setting.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Gain {
    X1 = 0b00,
    X2 = 0b01,
    X4 = 0b10,
    X8 = 0b11,
}

/// Sample resolution, which also fixes the conversion cadence.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Resolution {
    Bit12 = 0b00,
    Bit14 = 0b01,
    Bit16 = 0b10,
}

/// Conversion mode.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    /// One conversion per ready-bit trigger, then the device halts.
    OneShot = 0,
    /// Free-running conversions at the intrinsic update rate.
    Continuous = 1,
}

impl Resolution {
    /// Intrinsic update rate in samples per second (datasheet table 1-1).
    pub fn update_rate(self) -> u32 {
        match self {
            Resolution::Bit12 => 240,
            Resolution::Bit14 => 60,
            Resolution::Bit16 => 15,
        }
    }

    /// Minimum time for one conversion, in microseconds, rounded up.
    pub fn conversion_time_us(self) -> u32 {
        let rate = self.update_rate();
        (1_000_000 + rate - 1) / rate
    }

    /// Reciprocal of the LSB voltage step: raw / divisor = volts.
    pub fn lsb_divisor(self) -> u16 {
        match self {
            Resolution::Bit12 => 1_000,
            Resolution::Bit14 => 4_000,
            Resolution::Bit16 => 16_000,
        }
    }
}

/// Replaces the gain bits of a config byte.
pub const fn set_gain(byte: u8, gain: Gain) -> u8 {
    (byte & !GAIN_MASK) | gain as u8
}

/// Replaces the resolution bits of a config byte.
pub const fn set_resolution(byte: u8, resolution: Resolution) -> u8 {
    (byte & !RESOLUTION_MASK) | ((resolution as u8) << RESOLUTION_SHIFT)
}

/// Replaces the mode bit of a config byte.
pub const fn set_mode(byte: u8, mode: Mode) -> u8 {
    (byte & !MODE_MASK) | ((mode as u8) << MODE_SHIFT)
}

/// Replaces the channel bits of a config byte.
///
/// The channel must be below the device's channel count (2 on the
/// MCP3426/7, 4 on the MCP3428).
pub fn set_channel(byte: u8, channel: u8, channel_count: u8) -> Result<u8, InvalidChannel> {
    if channel >= channel_count {
        return Err(InvalidChannel(channel));
    }
    Ok((byte & !CHANNEL_MASK) | (channel << CHANNEL_SHIFT))
}

/// Replaces the ready bit of a config byte.
///
/// `ready = false` sets bit 7, which is how the driver requests a new
/// conversion; `ready = true` clears it and is only meaningful when
/// reconstructing a device-reported byte.
pub const fn set_ready(byte: u8, ready: bool) -> u8 {
    if ready {
        byte & !READY_MASK
    } else {
        byte | READY_MASK
    }
}

/// Decoded view of a configuration byte.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// A conversion result is valid and latched.
    pub ready: bool,
    pub channel: u8,
    pub mode: Mode,
    pub gain: Gain,
    pub resolution: Resolution,
}

impl Config {
    /// Decodes a device-reported configuration byte.
    pub fn decode(byte: u8) -> Self {
        Config {
            // nRDY is active low.
            ready: byte & READY_MASK == 0,
            channel: (byte & CHANNEL_MASK) >> CHANNEL_SHIFT,
            mode: if byte & MODE_MASK == 0 {
                Mode::OneShot
            } else {
                Mode::Continuous
            },
            gain: match byte & GAIN_MASK {
                0b00 => Gain::X1,
                0b01 => Gain::X2,
                0b10 => Gain::X4,
                _ => Gain::X8,
            },
            resolution: match (byte & RESOLUTION_MASK) >> RESOLUTION_SHIFT {
                0b00 => Resolution::Bit12,
                0b01 => Resolution::Bit14,
                // 0b11 is reserved on this family; treat it as the slowest rate.
                _ => Resolution::Bit16,
            },
        }
    }

    /// Packs the fields back into a register byte.
    pub fn encode(&self) -> u8 {
        let byte = set_gain(0, self.gain);
        let byte = set_resolution(byte, self.resolution);
        let byte = set_mode(byte, self.mode);
        let byte = set_ready(byte, self.ready);
        (byte & !CHANNEL_MASK) | ((self.channel & 0b11) << CHANNEL_SHIFT)
    }
}
