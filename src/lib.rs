//! # LMS Driver
//!
//! Host-side driver for LimeSDR-class boards: an FPGA bridging the host to
//! an LMS7002M transceiver over a control link and a data link.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the two byte channels of a board (control and data), with
//!   deadline-bounded read/write over device files or a memory-mapped mailbox.
//! - **`protocol`**: the LMS64C command protocol and the [`ControlPort`] trait
//!   carrying every register, SPI, I2C, GPIO and custom-parameter primitive.
//! - **`stream`**: background RX/TX threads moving sample packets between the
//!   data channel and per-stream FIFOs; sample codecs and packet framing.
//! - **`fpga`**: FPGA register map and streaming control.
//! - **`clock`**: FPGA PLL and direct-clock programming.
//! - **`mcu`**: firmware loader for the LMS7002M microcontroller.
//! - **`connection`**: device enumeration and connection construction.
//! - **`device`**: [`LmsDevice`], one open board.
//! - **`mock`**: an in-process simulated board for tests and demos.
//! - **`config`**, **`logging`**, **`error`**, **`poll`**: ambient support.
//!
//! ## Example
//!
//! ```no_run
//! use lms_driver::config::DriverConfig;
//! use lms_driver::connection::ConnectionRegistry;
//! use lms_driver::LmsDevice;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::load()?;
//! lms_driver::logging::init_from_config(&config)?;
//!
//! let registry = ConnectionRegistry::with_defaults(&config);
//! for handle in registry.find_connections(&Default::default()) {
//!     println!("found {handle}");
//! }
//! let device = LmsDevice::open(&registry, "", &config)?;
//! println!("{:?}", device.info()?);
//! device.close();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod fpga;
pub mod logging;
pub mod mcu;
pub mod mock;
pub mod poll;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use clock::{ClockSynthesizer, FpgaPllClock};
pub use config::DriverConfig;
pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use device::LmsDevice;
pub use error::{ErrorKind, LmsError, Result};
pub use mcu::{McuLoader, McuMode};
pub use protocol::{CommandProtocol, ControlPort, DeviceInfo};
pub use stream::{Direction, SampleFormat, StreamConfig, StreamHandle, StreamMetadata};
