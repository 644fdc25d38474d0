//! Physical link abstraction.
//!
//! A [`TransportChannel`] exposes two independent byte channels: a narrow
//! control channel carrying LMS64C packets and a wide data channel carrying
//! sample packets. Each is a [`Channel`] wrapping a backend [`ByteStream`].
//!
//! Backends only implement single non-blocking attempts. The retry-until-deadline
//! policy lives here, once, for every backend:
//!
//! - `WouldBlock` and `Interrupted` are retried until the full length moved or
//!   the deadline elapsed; the partial count is returned, not an error.
//! - Any other error is reported as [`LmsError::TransportFatal`] carrying the
//!   partial count already achieved.

pub mod device_file;
pub mod mailbox;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{LmsError, Result};
use crate::poll::{system_clock, SharedClock};

pub use device_file::{DeviceFilePaths, DeviceFileStream};
pub use mailbox::{MailboxLayout, MappedMailbox};

/// Backend for one duplex byte channel.
///
/// Methods take `&self`: a reader thread and a writer thread may use the
/// same channel concurrently, so implementations synchronize internally.
pub trait ByteStream: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;
    /// Open the underlying descriptors.
    fn open(&self) -> io::Result<()>;
    /// Close the underlying descriptors. Idempotent.
    fn close(&self);
    /// Whether the descriptors are open.
    fn is_open(&self) -> bool;
    /// One write attempt. `WouldBlock` means "try again".
    fn write_once(&self, buf: &[u8]) -> io::Result<usize>;
    /// One read attempt. `WouldBlock` means "try again".
    fn read_once(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Push buffered bytes to the device after a complete write.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Channel role, used in log fields and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// LMS64C request/response packets.
    Control,
    /// Sample packets.
    Data,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Data => f.write_str("data"),
        }
    }
}

/// One byte channel with deadline-bounded read/write.
pub struct Channel {
    role: ChannelRole,
    backend: Option<Box<dyn ByteStream>>,
    clock: SharedClock,
    retry_interval: Duration,
}

impl Channel {
    /// Wrap a backend.
    pub fn new(role: ChannelRole, backend: Box<dyn ByteStream>) -> Self {
        Self {
            role,
            backend: Some(backend),
            clock: system_clock(),
            retry_interval: Duration::from_micros(50),
        }
    }

    /// A channel the transport variant does not provide.
    ///
    /// Every operation fails with [`LmsError::NotSupported`].
    pub fn unsupported(role: ChannelRole) -> Self {
        Self {
            role,
            backend: None,
            clock: system_clock(),
            retry_interval: Duration::from_micros(50),
        }
    }

    /// Use a different clock for deadlines and retry back-off.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Delay between would-block retries.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Channel role.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Whether the transport variant provides this channel at all.
    pub fn is_supported(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&dyn ByteStream> {
        self.backend.as_deref().ok_or_else(|| {
            LmsError::not_supported(format!("transport has no {} channel", self.role))
        })
    }

    /// Open the channel. Opening an open channel is a no-op.
    pub fn open(&self) -> Result<()> {
        let backend = self.backend()?;
        if backend.is_open() {
            return Ok(());
        }
        backend.open().map_err(|e| {
            let message = format!("cannot open {} channel ({}): {e}", self.role, backend.name());
            if e.raw_os_error() == Some(libc::EBUSY) {
                LmsError::busy(message)
            } else {
                LmsError::not_connected(message)
            }
        })?;
        debug!(channel = %self.role, backend = backend.name(), "Opened channel");
        Ok(())
    }

    /// Close the channel. Closing a closed channel is a no-op.
    pub fn close(&self) {
        if let Some(backend) = self.backend.as_deref() {
            if backend.is_open() {
                backend.close();
                debug!(channel = %self.role, backend = backend.name(), "Closed channel");
            }
        }
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.backend.as_deref().is_some_and(ByteStream::is_open)
    }

    /// Write all of `buf` or as much as fits before `timeout`.
    pub fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let backend = self.open_backend()?;
        let written = self.retry(buf.len(), timeout, |offset| backend.write_once(&buf[offset..]))?;
        if written == buf.len() {
            backend.flush().map_err(|source| LmsError::TransportFatal {
                transferred: written,
                source,
            })?;
        }
        trace!(channel = %self.role, requested = buf.len(), written, "write");
        Ok(written)
    }

    /// Read until `buf` is full or `timeout` elapses.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let backend = self.open_backend()?;
        let len = buf.len();
        let read = self.retry(len, timeout, |offset| backend.read_once(&mut buf[offset..]))?;
        trace!(channel = %self.role, requested = len, read, "read");
        Ok(read)
    }

    fn open_backend(&self) -> Result<&dyn ByteStream> {
        let backend = self.backend()?;
        if !backend.is_open() {
            return Err(LmsError::not_connected(format!("{} channel is closed", self.role)));
        }
        Ok(backend)
    }

    fn retry<F>(&self, len: usize, timeout: Duration, mut attempt: F) -> Result<usize>
    where
        F: FnMut(usize) -> io::Result<usize>,
    {
        let deadline = self.clock.now() + timeout;
        let mut done = 0;
        while done < len {
            match attempt(done) {
                Ok(0) => {}
                Ok(n) => {
                    done += n;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(source) => {
                    return Err(LmsError::TransportFatal {
                        transferred: done,
                        source,
                    })
                }
            }
            if self.clock.now() >= deadline {
                break;
            }
            self.clock.sleep(self.retry_interval);
        }
        Ok(done)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role)
            .field("backend", &self.backend.as_deref().map(ByteStream::name))
            .field("open", &self.is_open())
            .finish()
    }
}

/// The control and data channels of one physical link.
#[derive(Debug)]
pub struct TransportChannel {
    control: Channel,
    data: Channel,
}

impl TransportChannel {
    /// Combine a control and a data channel.
    pub fn new(control: Channel, data: Channel) -> Self {
        Self { control, data }
    }

    /// Transport over paired device files (Xillybus layout).
    pub fn device_files(paths: &DeviceFilePaths) -> Self {
        let control = DeviceFileStream::new(&paths.control_write, &paths.control_read)
            .with_write_flush(true);
        let data = DeviceFileStream::new(&paths.data_write, &paths.data_read);
        Self::new(
            Channel::new(ChannelRole::Control, Box::new(control)),
            Channel::new(ChannelRole::Data, Box::new(data)),
        )
    }

    /// Transport over a memory-mapped control mailbox. Has no data channel.
    pub fn mapped_mailbox(mailbox: MappedMailbox) -> Self {
        Self::new(
            Channel::new(ChannelRole::Control, Box::new(mailbox)),
            Channel::unsupported(ChannelRole::Data),
        )
    }

    /// Use `clock` for both channels' deadlines.
    pub fn with_clock(self, clock: SharedClock) -> Self {
        Self {
            control: self.control.with_clock(Arc::clone(&clock)),
            data: self.data.with_clock(clock),
        }
    }

    /// Delay between would-block retries on both channels.
    pub fn with_retry_interval(self, interval: Duration) -> Self {
        Self {
            control: self.control.with_retry_interval(interval),
            data: self.data.with_retry_interval(interval),
        }
    }

    /// Open the control channel. The data channel opens lazily via [`Self::data`].
    pub fn open(&self) -> Result<()> {
        self.control.open()
    }

    /// Close both channels.
    ///
    /// Callers must have stopped every streaming thread first.
    pub fn close(&self) {
        self.data.close();
        self.control.close();
    }

    /// Whether the control channel is open.
    pub fn is_open(&self) -> bool {
        self.control.is_open()
    }

    /// Control channel.
    pub fn control(&self) -> &Channel {
        &self.control
    }

    /// Data channel, opening it on first use.
    pub fn data(&self) -> Result<&Channel> {
        if !self.data.is_open() {
            self.data.open()?;
        }
        Ok(&self.data)
    }

    /// Data channel without opening it.
    pub fn data_channel(&self) -> &Channel {
        &self.data
    }
}
