//! Device facade: one open board.
//!
//! [`LmsDevice`] owns the transport, the LMS64C protocol engine and the
//! stream pipeline of one board, and hands out the clock and firmware
//! helpers bound to its control port. Closing it runs the shutdown order
//! the streaming threads need: stop both, join both, then close the
//! transport.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::{ClockSynthesizer, FpgaPllClock};
use crate::config::{DriverConfig, StreamDefaults};
use crate::connection::{Connection, ConnectionHandle, ConnectionRegistry};
use crate::error::{LmsError, Result, ResultExt};
use crate::fpga::FpgaStreamControl;
use crate::mcu::{McuLoader, McuMode, Progress};
use crate::poll::{BoundedPoll, CancellationToken};
use crate::protocol::{CommandProtocol, ControlPort, DeviceInfo};
use crate::stream::{Direction, StreamConfig, StreamConfigBuilder, StreamHandle, StreamPipeline};
use crate::transport::TransportChannel;

/// An open board.
pub struct LmsDevice {
    handle: ConnectionHandle,
    transport: Arc<TransportChannel>,
    protocol: Arc<CommandProtocol>,
    pipeline: StreamPipeline,
    stream_defaults: StreamDefaults,
    pll_reference_hz: f64,
    pll_poll: BoundedPoll,
    mcu_poll: BoundedPoll,
    closed: AtomicBool,
}

impl LmsDevice {
    /// Open the first enumerated board matching `identifier`.
    ///
    /// `identifier` is a serialized [`ConnectionHandle`]; only its non-empty
    /// fields are compared, so `""` opens the first board found and
    /// `"serial=0009060B00471B1F"` a specific one.
    #[instrument(skip(registry, config), err)]
    pub fn open(registry: &ConnectionRegistry, identifier: &str, config: &DriverConfig) -> Result<Self> {
        let hint = identifier.parse::<ConnectionHandle>().reported()?;
        let handle = registry
            .find_connections(&hint)
            .into_iter()
            .next()
            .ok_or_else(|| LmsError::not_connected(format!("no device matches '{identifier}'")))
            .reported()?;
        let connection = registry.make_connection(&handle).reported()?;
        Self::from_connection(connection, config)
    }

    /// Open the board behind an already built connection.
    pub fn from_connection(connection: Connection, config: &DriverConfig) -> Result<Self> {
        let Connection {
            handle,
            transport,
            rx_channels,
            tx_channels,
        } = connection;
        transport.open().reported()?;

        let protocol = Arc::new(CommandProtocol::new(
            Arc::clone(&transport),
            config.control_timeouts(),
        ));
        let control: Arc<dyn ControlPort> = Arc::clone(&protocol) as Arc<dyn ControlPort>;
        let pipeline = StreamPipeline::new(
            Arc::clone(&transport),
            config.stream_settings(),
            rx_channels,
            tx_channels,
        )
        .with_control(Arc::new(FpgaStreamControl::new(control)));

        info!(device = %handle, rx_channels, tx_channels, "Device opened");
        Ok(Self {
            handle,
            transport,
            protocol,
            pipeline,
            stream_defaults: config.stream.clone(),
            pll_reference_hz: config.pll.reference_hz,
            pll_poll: config.pll_poll(),
            mcu_poll: config.mcu_poll(),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle of the opened board.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Whether the device is still open.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            let err = LmsError::not_connected(format!("device '{}' is closed", self.handle));
            return Err(err.report());
        }
        Ok(())
    }

    /// Read board identification.
    pub fn info(&self) -> Result<DeviceInfo> {
        self.ensure_open()?;
        self.protocol.device_info().reported()
    }

    /// Control port for register, SPI, I2C, GPIO and custom-parameter access.
    pub fn control(&self) -> Arc<dyn ControlPort> {
        Arc::clone(&self.protocol) as Arc<dyn ControlPort>
    }

    /// Channel count for `direction`.
    pub fn channel_count(&self, direction: Direction) -> usize {
        self.pipeline.channel_count(direction)
    }

    /// Stream configuration builder seeded from the `[stream]` section.
    pub fn stream_config(&self, direction: Direction) -> StreamConfigBuilder {
        StreamConfig::builder()
            .direction(direction)
            .format(self.stream_defaults.format)
            .buffer_depth(self.stream_defaults.buffer_depth)
            .latency(self.stream_defaults.latency)
    }

    /// Create a stream. The channel id is checked before any transport I/O.
    pub fn setup_stream(&self, config: StreamConfig) -> Result<StreamHandle> {
        self.ensure_open()?;
        self.pipeline.setup(config)
    }

    /// Latest hardware timestamp seen on the RX path.
    pub fn hardware_timestamp(&self) -> u64 {
        self.pipeline.hardware_timestamp()
    }

    /// FPGA PLL programmer bound to this device.
    pub fn clock_synthesizer(&self) -> ClockSynthesizer {
        ClockSynthesizer::new(self.control()).with_poll(self.pll_poll)
    }

    /// Program PLL `pll_index` from the configured reference clock.
    ///
    /// Returns the achieved frequency of every clock, in input order.
    pub fn configure_fpga_pll(&self, pll_index: u8, clocks: &mut [FpgaPllClock]) -> Result<Vec<f64>> {
        self.ensure_open()?;
        self.clock_synthesizer()
            .set_pll_frequency(pll_index, self.pll_reference_hz, clocks)
    }

    /// MCU firmware loader bound to this device.
    pub fn mcu_loader(&self) -> McuLoader {
        McuLoader::new(self.control()).with_poll(self.mcu_poll)
    }

    /// Program the MCU from a byte buffer.
    pub fn program_mcu(&self, image: &[u8], mode: McuMode, progress: Option<Progress<'_>>) -> Result<()> {
        self.ensure_open()?;
        self.mcu_loader().program(image, mode, progress)
    }

    /// Program the MCU from an image file.
    pub fn program_mcu_file(
        &self,
        path: impl AsRef<Path>,
        mode: McuMode,
        progress: Option<Progress<'_>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.mcu_loader().program_file(path, mode, progress)
    }

    /// Program the MCU, stopping when `cancel` fires.
    pub fn program_mcu_with_cancel(
        &self,
        image: &[u8],
        mode: McuMode,
        cancel: &CancellationToken,
        progress: Option<Progress<'_>>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.mcu_loader().program_with_cancel(image, mode, cancel, progress)
    }

    /// Stop streaming and close the transport.
    pub fn close(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pipeline.shutdown();
        self.transport.close();
        if self.pipeline.is_poisoned() {
            warn!(device = %self.handle, "Device closed after a transport failure");
        }
        debug!(device = %self.handle, "Device closed");
    }
}

impl Drop for LmsDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LmsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmsDevice")
            .field("handle", &self.handle)
            .field("open", &self.is_open())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBoard;

    #[test]
    fn test_open_from_registry_and_close() {
        let board = MockBoard::new();
        let mut registry = ConnectionRegistry::new();
        registry.register(Arc::new(board.entry()));

        let device = LmsDevice::open(&registry, "", &DriverConfig::default()).unwrap();
        assert!(board.is_control_open());
        assert_eq!(device.handle().module, "Mock");
        assert_eq!(device.info().unwrap().device_name, "LimeSDR-QPCIe");

        device.close();
        assert!(!board.is_control_open());
    }

    #[test]
    fn test_open_without_match_is_not_connected() {
        let board = MockBoard::new();
        let mut registry = ConnectionRegistry::new();
        registry.register(Arc::new(board.entry()));
        let err = LmsDevice::open(&registry, "serial=FFFF", &DriverConfig::default()).unwrap_err();
        assert!(err.is_not_connected());
        assert!(!board.is_control_open());
    }

    #[test]
    fn test_busy_board_fails_open() {
        let board = MockBoard::new();
        board.set_busy_on_open(true);
        let err = LmsDevice::from_connection(board.connection(), &DriverConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);
    }

    #[test]
    fn test_stream_config_uses_defaults() {
        let board = MockBoard::new();
        let mut config = DriverConfig::default();
        config.stream.buffer_depth = 16;
        let device = LmsDevice::from_connection(board.connection(), &config).unwrap();
        let stream = device.stream_config(Direction::Tx).channel(1).build().unwrap();
        assert_eq!(stream.buffer_depth, 16);
        assert_eq!(stream.direction, Direction::Tx);
    }

    #[test]
    fn test_closed_device_rejects_calls() {
        let board = MockBoard::new();
        let device = LmsDevice::from_connection(board.connection(), &DriverConfig::default()).unwrap();
        device.shutdown();
        assert!(device.info().unwrap_err().is_not_connected());
        assert!(device.setup_stream(StreamConfig::default()).is_err());
    }
}
