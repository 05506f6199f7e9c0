//! Suspending driver: the wait yields between polls and can be cancelled.
//!
//! The delay provider must implement both the async and the blocking
//! [`DelayNs`](embedded_hal::delay::DelayNs) traits. Waits shorter than
//! [`Options::busy_threshold_us`] sleep through the blocking impl, skipping
//! the suspension overhead the way short waits warrant; longer waits yield
//! to the scheduler at every poll boundary.

use embedded_hal_async::{delay, i2c};

use crate::config::{self, Config, Gain, Mode, Resolution};
use crate::conversion::ConversionResult;
use crate::protocol::{Clients, ConfigCheck, Options, ReadCycle, Shadow};
use crate::{CancelToken, Client, Error, Model, DEFAULT_ADDRESS};

/// Suspending MCP342x driver.
pub struct Mcp342x<'c, I2C, D, const ADDRESS: u8 = DEFAULT_ADDRESS>
where
    I2C: i2c::I2c,
    D: delay::DelayNs + embedded_hal::delay::DelayNs,
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
    I2C: i2c::I2c<Error = E>,
    D: delay::DelayNs + embedded_hal::delay::DelayNs,
{
    /// Creates a driver and seeds its state from the live device.
    ///
    /// Performs one frame read; a device that cannot be read is a
    /// construction failure.
    pub async fn try_new(i2c: I2C, model: Model, delay: D) -> Result<Self, Error<E>> {
        Self::try_new_with_options(i2c, model, delay, Options::default()).await
    }

    pub async fn try_new_with_options(
        mut i2c: I2C,
        model: Model,
        delay: D,
        options: Options,
    ) -> Result<Self, Error<E>> {
        let mut frame = [0u8; 3];
        i2c.read(ADDRESS, &mut frame).await.map_err(Error::I2c)?;
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
    /// Short expected waits take the non-yielding path automatically; see
    /// the module docs.
    pub async fn read_channel(&mut self, channel: u8) -> Result<ConversionResult, Error<E>> {
        let cycle = ReadCycle::plan(&self.shadow, channel, self.channel_count, &self.options)?;
        self.execute(cycle).await
    }

    /// Reads one conversion and returns the scaled voltage.
    pub async fn read_voltage(&mut self, channel: u8) -> Result<f64, Error<E>> {
        Ok(self.read_channel(channel).await?.voltage())
    }

    /// Reads one conversion, aborting with [`Error::Cancelled`] as soon as
    /// the token is observed between polls. Always takes the suspending
    /// path so the token is actually observed.
    pub async fn read_channel_cancellable(
        &mut self,
        channel: u8,
        cancel: &CancelToken,
    ) -> Result<ConversionResult, Error<E>> {
        let cycle = ReadCycle::plan(&self.shadow, channel, self.channel_count, &self.options)?;
        self.run(cycle, true, Some(cancel)).await
    }

    /// Triggers and reads a single one-shot conversion.
    pub async fn read_one_shot(&mut self, channel: u8) -> Result<ConversionResult, Error<E>> {
        if self.shadow.config.mode != Mode::OneShot {
            return Err(Error::ModeMismatch);
        }
        let cycle = ReadCycle::one_shot(&self.shadow, channel, self.channel_count, &self.options)?;
        self.execute(cycle).await
    }

    /// Switches the conversion mode, confirming against the device echo.
    pub async fn set_mode(&mut self, mode: Mode) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_mode(self.shadow.config_byte(), mode))
            .await
    }

    /// Switches the PGA gain, confirming against the device echo.
    pub async fn set_gain(&mut self, gain: Gain) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_gain(self.shadow.config_byte(), gain))
            .await
    }

    /// Switches the resolution, confirming against the device echo.
    pub async fn set_resolution(&mut self, resolution: Resolution) -> Result<ConfigCheck, Error<E>> {
        self.apply(config::set_resolution(self.shadow.config_byte(), resolution))
            .await
    }

    /// Writes a full configuration in one transfer.
    pub async fn set_config(
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
        self.apply(byte).await
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

    async fn execute(&mut self, cycle: ReadCycle) -> Result<ConversionResult, Error<E>> {
        let suspend = cycle.conversion_time_us >= self.options.busy_threshold_us;
        self.run(cycle, suspend, None).await
    }

    async fn run(
        &mut self,
        cycle: ReadCycle,
        suspend: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<ConversionResult, Error<E>> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if let Some(byte) = cycle.write {
            self.write_config(byte).await?;
        }
        let mut polls = 0;
        loop {
            let frame = self.read_frame().await?;
            polls += 1;
            if self.shadow.absorb(frame) {
                break;
            }
            if polls >= cycle.max_polls {
                return Err(Error::Timeout);
            }
            if suspend {
                delay::DelayNs::delay_us(&mut self.delay, cycle.poll_interval_us).await;
            } else {
                embedded_hal::delay::DelayNs::delay_us(&mut self.delay, cycle.poll_interval_us);
            }
            // A transfer is never interrupted; the token is only looked at
            // here, between polls.
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Cancelled);
            }
        }
        let result = self.shadow.complete();
        self.clients.notify(&result);
        Ok(result)
    }

    async fn apply(&mut self, byte: u8) -> Result<ConfigCheck, Error<E>> {
        self.write_config(byte).await?;
        let frame = self.read_frame().await?;
        self.shadow.absorb(frame);
        let check = ConfigCheck::compare(&Config::decode(byte), &self.shadow.config);
        #[cfg(feature = "defmt")]
        if !check.fully_applied() {
            defmt::warn!("config readback mismatch: {}", check);
        }
        Ok(check)
    }

    async fn write_config(&mut self, byte: u8) -> Result<(), Error<E>> {
        // Writes always request a conversion; only the device reports
        // readiness.
        let byte = config::set_ready(byte, false);
        self.i2c.write(ADDRESS, &[byte]).await.map_err(Error::I2c)
    }

    async fn read_frame(&mut self) -> Result<[u8; 3], Error<E>> {
        let mut frame = [0u8; 3];
        self.i2c.read(ADDRESS, &mut frame).await.map_err(Error::I2c)?;
        Ok(frame)
    }
}
