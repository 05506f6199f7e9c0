//! Blocking driver: the calling thread sleeps between polls.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::config::{self, Config, Gain, Mode, Resolution};
use crate::conversion::ConversionResult;
use crate::protocol::{Clients, ConfigCheck, Options, ReadCycle, Shadow};
use crate::{Client, Error, Model, DEFAULT_ADDRESS};

/// Blocking MCP342x driver.
///
/// Owns exclusive access to one device; the protocol is write-then-read
/// sequential, so no internal locking exists or is needed.
pub struct Mcp342x<'c, I2C, D, const ADDRESS: u8 = DEFAULT_ADDRESS>
where
    I2C: I2c,
    D: DelayNs,
{
    i2c: I2C,
    delay: D,
    channel_count: u8,
    options: Options,
    shadow: Shadow,
    clients: Clients<'c>,
}

impl<'c, I2C, D, const ADDRESS: u8, E> Mcp342x<'c, I2C, D, ADDRESS>
where
    I2C: I2c<Error = E>,
    D: DelayNs,
{
    /// Creates a driver and seeds its state from the live device.
    ///
    /// Performs one frame read; a device that cannot be read is a
    /// construction failure.
    pub fn try_new(i2c: I2C, model: Model, delay: D) -> Result<Self, Error<E>> {
        Self::try_new_with_options(i2c, model, delay, Options::default())
    }

    pub fn try_new_with_options(
        mut i2c: I2C,
        model: Model,
        delay: D,
        options: Options,
    ) -> Result<Self, Error<E>> {
        let mut frame = [0u8; 3];
        i2c.read(ADDRESS, &mut frame).map_err(Error::I2c)?;
        Ok(Mcp342x {
            i2c,
            delay,
            channel_count: model.channel_count(),
            options,
            shadow: Shadow::new(frame),
            clients: Clients::new(),
        })
    }

    /// Reads one conversion from the given channel.
    ///
    /// In continuous mode this polls the free-running device; in one-shot
    /// mode it triggers a conversion first. Blocks until the result is
    /// ready or the poll budget is exhausted.
    pub fn read_channel(&mut self, channel: u8) -> Result<ConversionResult, Error<E>> {
        let cycle = ReadCycle::plan(&self.shadow, channel, self.channel_count, &self.options)?;
        self.run(cycle)
    }

    /// Reads one conversion and returns the scaled voltage.
    pub fn read_voltage(&mut self, channel: u8) -> Result<f64, Error<E>> {
        Ok(self.read_channel(channel)?.voltage())
    }

    /// Triggers and reads a single one-shot conversion.
    pub fn read_one_shot(&mut self, channel: u8) -> Result<ConversionResult, Error<E>> {
        if self.shadow.config.mode != Mode::OneShot {
            return Err(Error::ModeMismatch);
        }
        let cycle = ReadCycle::one_shot(&self.shadow, channel, self.channel_count, &self.options)?;
        self.run(cycle)
    }

    /// Switches the conversion mode, confirming against the device echo.
    pub fn set_mode(&mut self, mode: Mode) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_mode(self.shadow.config_byte(), mode))
    }

    /// Switches the PGA gain, confirming against the device echo.
    pub fn set_gain(&mut self, gain: Gain) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_gain(self.shadow.config_byte(), gain))
    }

    /// Switches the resolution, confirming against the device echo.
    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_resolution(self.shadow.config_byte(), resolution))
    }

    /// Writes a full configuration in one transfer.
    pub fn set_config(
        &mut self,
        channel: u8,
        mode: Mode,
        resolution: Resolution,
        gain: Gain,
    ) -> Result<ConfigCheck, Error<E>> {
        let byte = config::set_channel(0, channel, self.channel_count)?;
        let byte = config::set_mode(byte, mode);
        let byte = config::set_resolution(byte, resolution);
        let byte = config::set_gain(byte, gain);
        self.apply(byte)
    }

    /// Registers a conversion observer. Returns false when the slots are
    /// exhausted.
    pub fn add_client(&mut self, client: &'c dyn Client) -> bool {
        self.clients.add(client)
    }

    pub fn mode(&self) -> Mode {
        self.shadow.config.mode
    }

    pub fn gain(&self) -> Gain {
        self.shadow.config.gain
    }

    pub fn resolution(&self) -> Resolution {
        self.shadow.config.resolution
    }

    /// Channel the device last reported converting.
    pub fn last_channel(&self) -> u8 {
        self.shadow.config.channel
    }

    pub fn last_conversion(&self) -> Option<ConversionResult> {
        self.shadow.last_conversion
    }

    /// Raw bytes of the most recent frame. Debug aid.
    pub fn last_frame(&self) -> &[u8; 3] {
        &self.shadow.frame
    }

    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    /// Releases the bus and delay. The device keeps converting.
    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    fn run(&mut self, cycle: ReadCycle) -> Result<ConversionResult, Error<E>> {
        if let Some(byte) = cycle.write {
            self.write_config(byte)?;
        }
        let mut polls = 0;
        loop {
            let frame = self.read_frame()?;
            polls += 1;
            if self.shadow.absorb(frame) {
                break;
            }
            if polls >= cycle.max_polls {
                return Err(Error::Timeout);
            }
            self.delay.delay_us(cycle.poll_interval_us);
        }
        let result = self.shadow.complete();
        self.clients.notify(&result);
        Ok(result)
    }

    fn apply(&mut self, byte: u8) -> Result<ConfigCheck, Error<E>> {
        self.write_config(byte)?;
        let frame = self.read_frame()?;
        self.shadow.absorb(frame);
        let check = ConfigCheck::compare(&Config::decode(byte), &self.shadow.config);
        #[cfg(feature = "defmt")]
        if !check.fully_applied() {
            defmt::warn!("config readback mismatch: {}", check);
        }
        Ok(check)
    }

    fn write_config(&mut self, byte: u8) -> Result<(), Error<E>> {
        // Writes always request a conversion; only the device reports
        // readiness.
        let byte = config::set_ready(byte, false);
        self.i2c.write(ADDRESS, &[byte]).map_err(Error::I2c)
    }

    fn read_frame(&mut self) -> Result<[u8; 3], Error<E>> {
        let mut frame = [0u8; 3];
        self.i2c.read(ADDRESS, &mut frame).map_err(Error::I2c)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c::{Mock as MockI2c, Transaction as I2cTransaction};

    // Continuous, 12-bit, gain x1, channel 0, result valid.
    const CONTINUOUS_READY: u8 = 0b0001_0000;
    // Same configuration with the conversion still running.
    const CONTINUOUS_BUSY: u8 = 0b1001_0000;
    // One-shot, 12-bit, gain x1, channel 0.
    const ONE_SHOT_IDLE: u8 = 0b0000_0000;
    const ONE_SHOT_BUSY: u8 = 0b1000_0000;

    fn read(frame: [u8; 3]) -> I2cTransaction {
        I2cTransaction::read(DEFAULT_ADDRESS, frame.to_vec())
    }

    fn write(byte: u8) -> I2cTransaction {
        I2cTransaction::write(DEFAULT_ADDRESS, vec![byte])
    }

    #[test]
    fn try_new_seeds_state_from_device() {
        let mut mock = MockI2c::new(&[read([0x00, 0x64, CONTINUOUS_READY])]);

        let adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        assert_eq!(adc.mode(), Mode::Continuous);
        assert_eq!(adc.resolution(), Resolution::Bit12);
        assert_eq!(adc.gain(), Gain::X1);
        assert_eq!(adc.last_channel(), 0);
        assert_eq!(adc.last_conversion(), None);
        assert_eq!(adc.last_frame(), &[0x00, 0x64, CONTINUOUS_READY]);

        mock.done();
    }

    #[test]
    fn continuous_read_same_channel_polls_without_writing() {
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, CONTINUOUS_BUSY]),
            read([0x00, 0x00, CONTINUOUS_BUSY]),
            read([0x03, 0xE8, CONTINUOUS_READY]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        let result = adc.read_channel(0).unwrap();
        assert_eq!(result.channel(), 0);
        assert_eq!(result.raw(), 1_000);
        assert_eq!(result.voltage(), 1.0);
        assert_eq!(result.accuracy(), 0.001);

        mock.done();
    }

    #[test]
    fn continuous_channel_switch_writes_once() {
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, CONTINUOUS_READY]),
            // Channel 1, ready bit requesting a conversion.
            write(0b1011_0000),
            read([0x01, 0x00, 0b0011_0000]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        let result = adc.read_channel(1).unwrap();
        assert_eq!(result.channel(), 1);
        assert_eq!(result.raw(), 256);
        assert_eq!(adc.last_channel(), 1);

        mock.done();
    }

    #[test]
    fn one_shot_read_triggers_then_polls() {
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, ONE_SHOT_IDLE]),
            write(0b1000_0000),
            read([0x00, 0x00, ONE_SHOT_BUSY]),
            read([0xFF, 0x38, ONE_SHOT_IDLE]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3426, NoopDelay).unwrap();

        let result = adc.read_channel(0).unwrap();
        assert_eq!(result.raw(), -200);
        assert_eq!(result.voltage(), -0.2);

        mock.done();
    }

    #[test]
    fn one_shot_timeout_leaves_last_conversion_untouched() {
        let mut transactions = vec![read([0x00, 0x00, ONE_SHOT_IDLE]), write(0b1000_0000)];
        for _ in 0..5 {
            transactions.push(read([0x00, 0x00, ONE_SHOT_BUSY]));
        }
        let mut mock = MockI2c::new(&transactions);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        assert_eq!(adc.read_channel(0), Err(Error::Timeout));
        assert_eq!(adc.last_conversion(), None);
        // The echoed byte still reflects the trigger attempt.
        assert_eq!(adc.last_frame()[2], ONE_SHOT_BUSY);

        mock.done();
    }

    #[test]
    fn read_one_shot_in_continuous_mode_is_a_mode_mismatch() {
        let mut mock = MockI2c::new(&[read([0x00, 0x00, CONTINUOUS_READY])]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        assert_eq!(adc.read_one_shot(0), Err(Error::ModeMismatch));

        mock.done();
    }

    #[test]
    fn invalid_channel_is_rejected_before_any_transfer() {
        let mut mock = MockI2c::new(&[read([0x00, 0x00, CONTINUOUS_READY])]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3427, NoopDelay).unwrap();

        assert_eq!(adc.read_channel(2), Err(Error::InvalidChannel(2)));
        assert_eq!(adc.read_channel(255), Err(Error::InvalidChannel(255)));

        mock.done();
    }

    #[test]
    fn set_resolution_confirms_against_echo() {
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, CONTINUOUS_READY]),
            write(0b1001_1000),
            read([0x00, 0x00, 0b1001_1000]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        let check = adc.set_resolution(Resolution::Bit16).unwrap();
        assert!(check.fully_applied());
        assert_eq!(adc.resolution(), Resolution::Bit16);

        mock.done();
    }

    #[test]
    fn set_config_reports_unapplied_fields() {
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, CONTINUOUS_READY]),
            // Channel 2, one-shot, 16-bit, gain x8.
            write(0b1100_1011),
            // Device kept its old configuration entirely.
            read([0x00, 0x00, CONTINUOUS_READY]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();

        let check = adc
            .set_config(2, Mode::OneShot, Resolution::Bit16, Gain::X8)
            .unwrap();
        assert!(!check.fully_applied());
        assert_eq!(check.channel, Some((2, 0)));
        assert_eq!(check.mode, Some((Mode::OneShot, Mode::Continuous)));
        assert_eq!(check.resolution, Some((Resolution::Bit16, Resolution::Bit12)));
        assert_eq!(check.gain, Some((Gain::X8, Gain::X1)));
        let rendered = format!("{check}");
        assert!(rendered.contains("channel: requested 2, device reports 0"));

        mock.done();
    }

    struct Probe {
        seen: Cell<Option<(u8, i16)>>,
    }

    impl Client for Probe {
        fn conversion_done(&self, result: &ConversionResult) {
            self.seen.set(Some((result.channel(), result.raw())));
        }
    }

    #[test]
    fn clients_are_notified_on_completion() {
        let probe = Probe {
            seen: Cell::new(None),
        };
        let mut mock = MockI2c::new(&[
            read([0x00, 0x00, CONTINUOUS_READY]),
            read([0x03, 0xE8, CONTINUOUS_READY]),
        ]);

        let mut adc: Mcp342x<'_, MockI2c, NoopDelay> =
            Mcp342x::try_new(mock.clone(), Model::Mcp3428, NoopDelay).unwrap();
        assert!(adc.add_client(&probe));

        let volts = adc.read_voltage(0).unwrap();
        assert_eq!(volts, 1.0);
        assert_eq!(probe.seen.get(), Some((0, 1_000)));

        mock.done();
    }
}
