//! # Microchip MCP3426/MCP3427/MCP3428 Driver
//!
//! The MCP342x family are 2- and 4-channel delta-sigma ADCs driven through
//! a single shared configuration/status byte on I2C. This crate provides a
//! blocking driver ([`blocking::Mcp342x`]) and a suspending driver
//! ([`asynch::Mcp342x`]) over the same protocol core.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

pub mod asynch;
pub mod blocking;
pub mod config;
mod conversion;
mod protocol;

pub use config::{Config, Gain, Mode, Resolution};
pub use conversion::ConversionResult;
pub use protocol::{ConfigCheck, Options};

/// I2C address with both address pins low (or absent, on the MCP3426).
pub const DEFAULT_ADDRESS: u8 = 0x68;

/// Device models supported by this driver.
///
/// The models differ only in channel count and addressing; the protocol is
/// identical.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Model {
    /// 2 channels, fixed address.
    Mcp3426,
    /// 2 channels, address pins.
    Mcp3427,
    /// 4 channels, address pins.
    Mcp3428,
}

impl Model {
    pub fn channel_count(self) -> u8 {
        match self {
            Model::Mcp3426 | Model::Mcp3427 => 2,
            Model::Mcp3428 => 4,
        }
    }
}

/// Electrical state of an address strap pin.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinState {
    Low,
    High,
    Floating,
}

/// I2C address selected by the Adr0/Adr1 straps, from datasheet table 5-3.
///
/// Only meaningful for the MCP3427/MCP3428; the MCP3426 always answers at
/// [`DEFAULT_ADDRESS`].
pub fn address_from_pins(adr0: PinState, adr1: PinState) -> u8 {
    use PinState::*;
    let offset = match (adr0, adr1) {
        (Low, Low) | (Floating, Floating) => 0,
        (Low, Floating) => 1,
        (Low, High) => 2,
        (Floating, Low) => 3,
        (High, Low) => 4,
        (High, Floating) => 5,
        (High, High) => 6,
        (Floating, High) => 7,
    };
    DEFAULT_ADDRESS + offset
}

/// Errors that can occur when using the MCP342x driver.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Bus transfer failed.
    I2c(E),
    /// Channel index outside the device's channel count.
    InvalidChannel(u8),
    /// A one-shot operation was requested while the device free-runs.
    ModeMismatch,
    /// The ready bit never appeared within the poll budget.
    Timeout,
    /// The wait was cancelled before a result was ready.
    Cancelled,
}

/// Channel index rejected by the codec. Converts into [`Error::InvalidChannel`].
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidChannel(pub u8);

impl<E> From<InvalidChannel> for Error<E> {
    fn from(InvalidChannel(channel): InvalidChannel) -> Self {
        Error::InvalidChannel(channel)
    }
}

/// Callback invoked in-line each time a conversion completes.
pub trait Client {
    fn conversion_done(&self, result: &ConversionResult);
}

/// Cooperative cancellation flag for the suspending driver.
///
/// Shared by reference with whatever wants to cut a wait short; the driver
/// checks it between polls, never mid-transfer.
#[derive(Debug, Default)]
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub const fn new() -> Self {
        CancelToken(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_channel_counts() {
        assert_eq!(Model::Mcp3426.channel_count(), 2);
        assert_eq!(Model::Mcp3427.channel_count(), 2);
        assert_eq!(Model::Mcp3428.channel_count(), 4);
    }

    #[test]
    fn address_strap_table() {
        use PinState::*;
        assert_eq!(address_from_pins(Low, Low), 0x68);
        assert_eq!(address_from_pins(Floating, Floating), 0x68);
        assert_eq!(address_from_pins(Low, Floating), 0x69);
        assert_eq!(address_from_pins(Low, High), 0x6A);
        assert_eq!(address_from_pins(Floating, Low), 0x6B);
        assert_eq!(address_from_pins(High, Low), 0x6C);
        assert_eq!(address_from_pins(High, Floating), 0x6D);
        assert_eq!(address_from_pins(High, High), 0x6E);
        assert_eq!(address_from_pins(Floating, High), 0x6F);
    }

    #[test]
    fn cancel_token_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
