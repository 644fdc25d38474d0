//! Continuous sample streaming.
//!
//! The pipeline owns one background thread per direction. Application calls
//! never touch the hardware: [`StreamHandle::recv`] and [`StreamHandle::send`]
//! dequeue from or enqueue into a bounded [`SampleFifo`], and the threads move
//! packets between the FIFOs and the data channel.
//!
//! ```text
//!            recv()                               send()
//!              ▲                                    │
//!     ┌────────┴────────┐                  ┌────────▼────────┐
//!     │  RX SampleFifo  │  (one per stream) │  TX SampleFifo  │
//!     └────────▲────────┘                  └────────┬────────┘
//!              │ decode                      encode │
//!     ┌────────┴────────┐                  ┌────────▼────────┐
//!     │    RX thread    │                  │    TX thread    │
//!     └────────▲────────┘                  └────────┬────────┘
//!              └──────────── data channel ◄─────────┘
//! ```
//!
//! Timeouts on individual transfers are reported to the next `recv`/`send`
//! and the stream keeps running. A fatal transport error stops both threads
//! and poisons the pipeline: every later call fails with `TransportFatal`
//! without touching the transport.
//!
//! # Example
//!
//! ```no_run
//! use lms_driver::stream::{Direction, StreamConfig, StreamMetadata};
//! use num_complex::Complex;
//! use std::time::Duration;
//!
//! # fn example(device: &lms_driver::LmsDevice) -> lms_driver::Result<()> {
//! let config = StreamConfig::builder()
//!     .direction(Direction::Rx)
//!     .channel(0)
//!     .buffer_depth(128)
//!     .build()?;
//! let stream = device.setup_stream(config)?;
//! stream.start()?;
//!
//! let mut samples = vec![Complex::<i16>::default(); 4096];
//! let mut meta = StreamMetadata::default();
//! let n = stream.recv(&mut samples, &mut meta, Duration::from_millis(100))?;
//! println!("{n} samples at {}", meta.timestamp);
//! stream.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod fifo;
pub mod packet;
mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{LmsError, Result, ResultExt};
use crate::transport::TransportChannel;

pub use codec::{HostSample, SampleFormat};
pub use fifo::{FifoError, SampleBlock, SampleFifo};

/// Upper bound on packets moved per hardware transfer.
pub const MAX_PACKETS_PER_TRANSFER: usize = 16;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Board to host.
    Rx,
    /// Host to board.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("rx"),
            Self::Tx => f.write_str("tx"),
        }
    }
}

/// Timestamp and flags accompanying a run of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetadata {
    /// Hardware timestamp of the first sample, in samples.
    pub timestamp: u64,
    /// Last samples of a burst.
    pub end_of_burst: bool,
    /// Transmit time had already passed; the samples were not sent.
    pub late: bool,
    /// Samples were lost before this block.
    pub dropped: bool,
    /// Honour `timestamp`: transmit at it, or receive from it.
    pub sync: bool,
}

impl StreamMetadata {
    /// Metadata requesting synchronization to `timestamp`.
    pub fn at(timestamp: u64) -> Self {
        Self {
            timestamp,
            sync: true,
            ..Self::default()
        }
    }

    /// Mark the end of a burst.
    pub fn with_end_of_burst(mut self) -> Self {
        self.end_of_burst = true;
        self
    }
}

/// Configuration of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// RX or TX.
    pub direction: Direction,
    /// Host-side sample format.
    pub format: SampleFormat,
    /// Channel index within the direction.
    pub channel: usize,
    /// FIFO depth in blocks.
    pub buffer_depth: usize,
    /// 0.0 favours throughput (large transfers), 1.0 favours latency.
    pub latency: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Rx,
            format: SampleFormat::I12In16,
            channel: 0,
            buffer_depth: 64,
            latency: 0.5,
        }
    }
}

impl StreamConfig {
    /// Create a builder.
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// Validate the device-independent fields.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_depth == 0 {
            return Err(LmsError::invalid_argument("buffer depth must be at least one block"));
        }
        if !(0.0..=1.0).contains(&self.latency) {
            return Err(LmsError::invalid_argument(format!(
                "latency hint {} outside [0, 1]",
                self.latency
            )));
        }
        Ok(())
    }

    /// Packets per hardware transfer implied by the latency hint.
    pub fn packets_per_transfer(&self) -> usize {
        let span = (MAX_PACKETS_PER_TRANSFER - 1) as f32;
        1 + ((1.0 - self.latency.clamp(0.0, 1.0)) * span).round() as usize
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Set the direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.config.direction = direction;
        self
    }

    /// Set the host sample format.
    pub fn format(mut self, format: SampleFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Set the channel index.
    pub fn channel(mut self, channel: usize) -> Self {
        self.config.channel = channel;
        self
    }

    /// Set the FIFO depth in blocks.
    pub fn buffer_depth(mut self, depth: usize) -> Self {
        self.config.buffer_depth = depth;
        self
    }

    /// Set the latency-vs-throughput hint.
    pub fn latency(mut self, latency: f32) -> Self {
        self.config.latency = latency;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<StreamConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Pipeline timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Deadline of one hardware transfer.
    pub transfer_timeout: Duration,
    /// How long a streaming thread waits on a full (RX) or empty (TX) FIFO.
    pub fifo_timeout: Duration,
    /// Sleep of an idle streaming thread.
    pub idle_wait: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_millis(100),
            fifo_timeout: Duration::from_millis(20),
            idle_wait: Duration::from_millis(5),
        }
    }
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamStatus {
    /// Whether the stream is started.
    pub active: bool,
    /// Blocks queued.
    pub fifo_filled: usize,
    /// FIFO capacity in blocks.
    pub fifo_size: usize,
    /// Samples queued.
    pub buffered_samples: usize,
    /// RX blocks dropped on a full FIFO.
    pub overruns: u64,
    /// TX packets sent with a channel missing data.
    pub underruns: u64,
    /// Gaps seen in the hardware packet counter.
    pub dropped_packets: u64,
    /// TX blocks not sent because their time had passed.
    pub late: u64,
    /// Bytes per second moved since start.
    pub link_rate: f64,
    /// Latest hardware timestamp seen by the RX thread.
    pub timestamp: u64,
}

/// Streaming state handed to [`StreamControl`] whenever active streams change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamingState {
    /// Link encoding, when any stream is active.
    pub link: Option<SampleFormat>,
    /// Bit per active RX channel.
    pub rx_mask: u8,
    /// Bit per active TX channel.
    pub tx_mask: u8,
    /// Set on the transition from no active stream to one.
    pub reset_timestamp: bool,
}

/// Board-side hook for enabling streaming. Runs on the control path.
pub trait StreamControl: Send + Sync {
    /// Apply the new state.
    fn apply(&self, state: &StreamingState) -> Result<()>;
}

/// Per-stream state shared with the streaming thread.
pub(crate) struct StreamChannel {
    pub(crate) config: StreamConfig,
    pub(crate) fifo: SampleFifo,
    active: AtomicBool,
    closed: AtomicBool,
    pub(crate) pending_timeout: AtomicBool,
    pub(crate) pending_dropped: AtomicBool,
    pub(crate) sync_target: Mutex<Option<u64>>,
    pub(crate) overruns: AtomicU64,
    pub(crate) underruns: AtomicU64,
    pub(crate) dropped_packets: AtomicU64,
    pub(crate) late: AtomicU64,
    bytes: AtomicU64,
    started: Mutex<Option<Instant>>,
    completion: Mutex<Option<StreamMetadata>>,
    completion_ready: Condvar,
}

impl StreamChannel {
    fn new(config: StreamConfig) -> Self {
        let fifo = SampleFifo::new(config.buffer_depth);
        Self {
            config,
            fifo,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending_timeout: AtomicBool::new(false),
            pending_dropped: AtomicBool::new(false),
            sync_target: Mutex::new(None),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            late: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started: Mutex::new(None),
            completion: Mutex::new(None),
            completion_ready: Condvar::new(),
        }
    }

    pub(crate) fn account_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn complete(&self, meta: StreamMetadata) {
        *self.completion.lock() = Some(meta);
        self.completion_ready.notify_all();
    }

    fn wake_all(&self) {
        self.fifo.close();
        self.completion_ready.notify_all();
    }

    fn link_rate(&self) -> f64 {
        let elapsed = self
            .started
            .lock()
            .map_or(0.0, |t| t.elapsed().as_secs_f64());
        if elapsed > 0.0 {
            self.bytes.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// State shared by the pipeline, its handles and its threads.
pub(crate) struct PipelineShared {
    pub(crate) transport: Arc<TransportChannel>,
    pub(crate) settings: StreamSettings,
    rx_streams: RwLock<Vec<Arc<StreamChannel>>>,
    tx_streams: RwLock<Vec<Arc<StreamChannel>>>,
    registered: Mutex<Vec<Arc<StreamChannel>>>,
    pub(crate) hw_timestamp: AtomicU64,
    fatal: AtomicBool,
    fatal_message: Mutex<Option<String>>,
    shut_down: AtomicBool,
}

impl PipelineShared {
    pub(crate) fn active(&self, direction: Direction) -> Vec<Arc<StreamChannel>> {
        match direction {
            Direction::Rx => self.rx_streams.read().clone(),
            Direction::Tx => self.tx_streams.read().clone(),
        }
    }

    fn streams(&self, direction: Direction) -> &RwLock<Vec<Arc<StreamChannel>>> {
        match direction {
            Direction::Rx => &self.rx_streams,
            Direction::Tx => &self.tx_streams,
        }
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    fn fatal_error(&self) -> LmsError {
        let message = self
            .fatal_message
            .lock()
            .clone()
            .unwrap_or_else(|| "stream stopped after a transport failure".to_string());
        LmsError::TransportFatal {
            transferred: 0,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, message),
        }
    }

    /// Fails once the pipeline is poisoned or its device has shut it down.
    fn check_open(&self) -> Result<()> {
        if self.is_fatal() {
            return Err(self.fatal_error());
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(LmsError::not_connected("stream pipeline is shut down"));
        }
        Ok(())
    }

    /// Poison the pipeline: threads exit, waiters wake, later calls fail.
    pub(crate) fn mark_fatal(&self, err: &LmsError) {
        if self.fatal.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(error = %err, "Streaming transport failed; stopping both directions");
        *self.fatal_message.lock() = Some(err.to_string());
        for stream in self.registered.lock().iter() {
            stream.wake_all();
        }
    }

    fn streaming_state(&self) -> StreamingState {
        let mask = |streams: &[Arc<StreamChannel>]| {
            streams
                .iter()
                .fold(0u8, |m, s| m | (1u8 << (s.config.channel.min(7))))
        };
        let rx = self.rx_streams.read();
        let tx = self.tx_streams.read();
        let link = rx
            .first()
            .or_else(|| tx.first())
            .map(|s| s.config.format.link_format());
        StreamingState {
            link,
            rx_mask: mask(&rx),
            tx_mask: mask(&tx),
            reset_timestamp: false,
        }
    }
}

#[derive(Default)]
struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn join(&mut self, direction: Direction) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!(direction = %direction, "Streaming thread panicked: {:?}", e);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct PipelineInner {
    shared: Arc<PipelineShared>,
    control: Option<Arc<dyn StreamControl>>,
    rx_channels: usize,
    tx_channels: usize,
    rx: Mutex<Worker>,
    tx: Mutex<Worker>,
}

impl PipelineInner {
    fn worker(&self, direction: Direction) -> &Mutex<Worker> {
        match direction {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }

    fn apply_control(&self, state: StreamingState) -> Result<()> {
        match &self.control {
            Some(control) => control.apply(&state),
            None => Ok(()),
        }
    }

    fn ensure_worker(&self, direction: Direction) -> Result<()> {
        let mut worker = self.worker(direction).lock();
        if worker.is_running() {
            return Ok(());
        }
        worker.join(direction);

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("lms-{direction}"))
            .spawn(move || match direction {
                Direction::Rx => worker::rx_loop(shared, thread_stop),
                Direction::Tx => worker::tx_loop(shared, thread_stop),
            })?;
        *worker = Worker {
            stop,
            handle: Some(handle),
        };
        debug!(direction = %direction, "Started streaming thread");
        Ok(())
    }

    fn stop_worker(&self, direction: Direction) {
        let mut worker = self.worker(direction).lock();
        worker.signal();
        worker.join(direction);
    }
}

/// Streaming engine of one device.
#[derive(Clone)]
pub struct StreamPipeline {
    inner: Arc<PipelineInner>,
}

impl StreamPipeline {
    /// Pipeline over `transport`'s data channel.
    pub fn new(
        transport: Arc<TransportChannel>,
        settings: StreamSettings,
        rx_channels: usize,
        tx_channels: usize,
    ) -> Self {
        let shared = Arc::new(PipelineShared {
            transport,
            settings,
            rx_streams: RwLock::new(Vec::new()),
            tx_streams: RwLock::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            hw_timestamp: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            fatal_message: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        Self {
            inner: Arc::new(PipelineInner {
                shared,
                control: None,
                rx_channels,
                tx_channels,
                rx: Mutex::new(Worker::default()),
                tx: Mutex::new(Worker::default()),
            }),
        }
    }

    /// Install the board-side streaming hook. Must be called before any stream exists.
    pub fn with_control(self, control: Arc<dyn StreamControl>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.control = Some(control);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("Stream control hook ignored: pipeline already shared");
                Self { inner }
            }
        }
    }

    /// Channel count for `direction`.
    pub fn channel_count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Rx => self.inner.rx_channels,
            Direction::Tx => self.inner.tx_channels,
        }
    }

    /// Create a stream. Performs no transport I/O.
    pub fn setup(&self, config: StreamConfig) -> Result<StreamHandle> {
        self.setup_stream(config).reported()
    }

    fn setup_stream(&self, config: StreamConfig) -> Result<StreamHandle> {
        let shared = &self.inner.shared;
        shared.check_open()?;
        config.validate()?;
        let count = self.channel_count(config.direction);
        if config.channel >= count {
            return Err(LmsError::invalid_argument(format!(
                "{} channel {} out of range: device has {count}",
                config.direction, config.channel
            )));
        }
        if !shared.transport.data_channel().is_supported() {
            return Err(LmsError::not_supported("transport has no data channel"));
        }
        let mut registered = shared.registered.lock();
        if registered.iter().any(|s| {
            s.config.direction == config.direction && s.config.channel == config.channel
        }) {
            return Err(LmsError::busy(format!(
                "{} channel {} already has a stream",
                config.direction, config.channel
            )));
        }
        let channel = Arc::new(StreamChannel::new(config));
        registered.push(Arc::clone(&channel));
        drop(registered);

        info!(
            direction = %channel.config.direction,
            channel = channel.config.channel,
            format = ?channel.config.format,
            depth = channel.config.buffer_depth,
            "Stream set up"
        );
        Ok(StreamHandle {
            channel,
            pipeline: Arc::clone(&self.inner),
        })
    }

    /// Latest hardware timestamp observed on the RX path.
    pub fn hardware_timestamp(&self) -> u64 {
        self.inner.shared.hw_timestamp.load(Ordering::SeqCst)
    }

    /// Whether a fatal transport error poisoned the pipeline.
    pub fn is_poisoned(&self) -> bool {
        self.inner.shared.is_fatal()
    }

    /// Stop both threads and wait for them to exit.
    ///
    /// Signals both directions before joining either. The transport may be
    /// closed once this returns.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shared.shut_down.store(true, Ordering::SeqCst);
        inner.rx.lock().signal();
        inner.tx.lock().signal();
        inner.rx.lock().join(Direction::Rx);
        inner.tx.lock().join(Direction::Tx);

        let shared = &inner.shared;
        let had_active = !shared.rx_streams.read().is_empty() || !shared.tx_streams.read().is_empty();
        for stream in shared.registered.lock().iter() {
            stream.active.store(false, Ordering::SeqCst);
            stream.wake_all();
        }
        shared.rx_streams.write().clear();
        shared.tx_streams.write().clear();
        if had_active && !shared.is_fatal() {
            if let Err(e) = inner.apply_control(StreamingState::default()) {
                warn!(error = %e, "Failed to disable streaming on shutdown");
            }
        }
        debug!("Stream pipeline shut down");
    }
}

impl fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("rx_channels", &self.inner.rx_channels)
            .field("tx_channels", &self.inner.tx_channels)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

/// Handle to one configured stream.
pub struct StreamHandle {
    channel: Arc<StreamChannel>,
    pipeline: Arc<PipelineInner>,
}

impl StreamHandle {
    /// Stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.channel.config
    }

    fn check_usable(&self) -> Result<()> {
        self.pipeline.shared.check_open()?;
        if self.channel.closed.load(Ordering::SeqCst) {
            return Err(LmsError::invalid_argument("stream is closed"));
        }
        Ok(())
    }

    /// Start moving samples. Opens the data channel on first use.
    pub fn start(&self) -> Result<()> {
        self.start_stream().reported()
    }

    fn start_stream(&self) -> Result<()> {
        self.check_usable()?;
        let channel = &self.channel;
        if channel.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.pipeline.shared;
        shared.transport.data()?;
        channel.fifo.clear();
        channel.fifo.reopen();

        let direction = channel.config.direction;
        let was_idle = shared.rx_streams.read().is_empty() && shared.tx_streams.read().is_empty();
        {
            let mut streams = shared.streams(direction).write();
            if let Some(other) = streams.first() {
                if other.config.format.link_format() != channel.config.format.link_format() {
                    return Err(LmsError::invalid_argument(format!(
                        "{:?} stream cannot share the link with a {:?} stream",
                        channel.config.format, other.config.format
                    )));
                }
            }
            streams.push(Arc::clone(channel));
            streams.sort_by_key(|s| s.config.channel);
        }

        let mut state = shared.streaming_state();
        state.reset_timestamp = was_idle;
        if let Err(e) = self.pipeline.apply_control(state) {
            shared.streams(direction).write().retain(|s| !Arc::ptr_eq(s, channel));
            return Err(e);
        }
        if was_idle {
            shared.hw_timestamp.store(0, Ordering::SeqCst);
        }

        *channel.started.lock() = Some(Instant::now());
        channel.active.store(true, Ordering::SeqCst);
        self.pipeline.ensure_worker(direction)?;
        info!(direction = %direction, channel = channel.config.channel, "Stream started");
        Ok(())
    }

    /// Stop moving samples. Queued RX samples stay readable.
    pub fn stop(&self) -> Result<()> {
        let channel = &self.channel;
        if !channel.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = &self.pipeline.shared;
        let direction = channel.config.direction;
        let now_empty = {
            let mut streams = shared.streams(direction).write();
            streams.retain(|s| !Arc::ptr_eq(s, channel));
            streams.is_empty()
        };
        if now_empty {
            self.pipeline.stop_worker(direction);
        }
        info!(
            direction = %direction,
            channel = channel.config.channel,
            overruns = channel.overruns.load(Ordering::Relaxed),
            dropped = channel.dropped_packets.load(Ordering::Relaxed),
            "Stream stopped"
        );
        if shared.is_fatal() {
            return Ok(());
        }
        self.pipeline.apply_control(shared.streaming_state())
    }

    /// Read up to `samples.len()` samples, waiting up to `timeout`.
    ///
    /// When `meta.sync` is set on entry, samples before `meta.timestamp` are
    /// discarded first. On return `meta` describes the first sample read.
    pub fn recv<S: HostSample>(
        &self,
        samples: &mut [S],
        meta: &mut StreamMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        self.receive(samples, meta, timeout).reported()
    }

    fn receive<S: HostSample>(
        &self,
        samples: &mut [S],
        meta: &mut StreamMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        self.check_usable()?;
        let channel = &self.channel;
        self.check_direction(Direction::Rx)?;
        check_format::<S>(channel.config.format)?;
        if samples.is_empty() {
            return Ok(0);
        }

        if meta.sync {
            *channel.sync_target.lock() = Some(meta.timestamp);
            let discarded = channel.fifo.discard_before(meta.timestamp);
            if discarded > 0 {
                debug!(discarded, target = meta.timestamp, "Discarded samples before sync target");
            }
        }

        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        let mut out = StreamMetadata::default();
        while filled < samples.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.fifo.pop_samples(samples.len() - filled, remaining) {
                Ok(block) => {
                    if filled == 0 {
                        out.timestamp = block.meta.timestamp;
                    }
                    out.dropped |= block.meta.dropped;
                    for (dst, src) in samples[filled..].iter_mut().zip(&block.samples) {
                        *dst = S::from_canonical(*src);
                    }
                    filled += block.len();
                }
                Err(FifoError::Timeout) => break,
                Err(FifoError::Closed) => {
                    self.check_usable()?;
                    break;
                }
            }
        }

        if meta.sync && filled > 0 {
            channel.sync_target.lock().take();
        }
        if filled == 0 {
            return Err(if channel.pending_timeout.swap(false, Ordering::SeqCst) {
                LmsError::timeout("receive transfer timed out")
            } else {
                LmsError::timeout(format!("no samples within {timeout:?}"))
            });
        }
        *meta = out;
        Ok(filled)
    }

    /// Queue `samples` for transmission, waiting up to `timeout` for space.
    ///
    /// With `meta.sync` set the first sample is sent at `meta.timestamp`;
    /// `meta.end_of_burst` marks the last sample of a burst. Returns the
    /// number of samples queued.
    pub fn send<S: HostSample>(
        &self,
        samples: &[S],
        meta: &StreamMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        self.transmit(samples, meta, timeout).reported()
    }

    fn transmit<S: HostSample>(
        &self,
        samples: &[S],
        meta: &StreamMetadata,
        timeout: Duration,
    ) -> Result<usize> {
        self.check_usable()?;
        let channel = &self.channel;
        self.check_direction(Direction::Tx)?;
        check_format::<S>(channel.config.format)?;
        if channel.pending_timeout.swap(false, Ordering::SeqCst) {
            return Err(LmsError::timeout("transmit transfer timed out"));
        }

        let block_len = packet::samples_per_packet(channel.config.format.link_format(), 1);
        let deadline = Instant::now() + timeout;
        let mut queued = 0;
        for chunk in samples.chunks(block_len) {
            let mut block = SampleBlock::new(
                meta.timestamp.wrapping_add(queued as u64),
                chunk.iter().map(|s| s.to_canonical()).collect(),
            );
            block.meta.sync = meta.sync;
            block.meta.end_of_burst = meta.end_of_burst && queued + chunk.len() == samples.len();

            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.fifo.push(block, remaining) {
                Ok(()) => queued += chunk.len(),
                Err(FifoError::Timeout) => break,
                Err(FifoError::Closed) => {
                    self.check_usable()?;
                    break;
                }
            }
        }
        if queued == 0 && !samples.is_empty() {
            return Err(LmsError::timeout(format!("TX FIFO full for {timeout:?}")));
        }
        Ok(queued)
    }

    /// Wait for the metadata of the next completed TX write.
    pub fn read_completion(&self, timeout: Duration) -> Result<StreamMetadata> {
        self.check_direction(Direction::Tx)?;
        let channel = &self.channel;
        let deadline = Instant::now() + timeout;
        let mut completion = channel.completion.lock();
        loop {
            if let Some(meta) = completion.take() {
                return Ok(meta);
            }
            self.check_usable()?;
            if channel.completion_ready.wait_until(&mut completion, deadline).timed_out() {
                return completion
                    .take()
                    .ok_or_else(|| LmsError::timeout(format!("no TX completion within {timeout:?}")));
            }
        }
    }

    /// Counters and FIFO fill.
    pub fn status(&self) -> StreamStatus {
        let channel = &self.channel;
        StreamStatus {
            active: channel.active.load(Ordering::SeqCst),
            fifo_filled: channel.fifo.len(),
            fifo_size: channel.fifo.capacity(),
            buffered_samples: channel.fifo.buffered_samples(),
            overruns: channel.overruns.load(Ordering::Relaxed),
            underruns: channel.underruns.load(Ordering::Relaxed),
            dropped_packets: channel.dropped_packets.load(Ordering::Relaxed),
            late: channel.late.load(Ordering::Relaxed),
            link_rate: channel.link_rate(),
            timestamp: self.pipeline.shared.hw_timestamp.load(Ordering::SeqCst),
        }
    }

    /// Stop the stream and release it.
    pub fn close(self) -> Result<()> {
        self.release()
    }

    fn release(&self) -> Result<()> {
        if self.channel.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.stop();
        self.channel.fifo.close();
        self.pipeline
            .shared
            .registered
            .lock()
            .retain(|s| !Arc::ptr_eq(s, &self.channel));
        debug!(
            direction = %self.channel.config.direction,
            channel = self.channel.config.channel,
            "Stream closed"
        );
        result
    }

    fn check_direction(&self, expected: Direction) -> Result<()> {
        if self.channel.config.direction == expected {
            Ok(())
        } else {
            Err(LmsError::invalid_argument(format!(
                "operation needs a {expected} stream, this is {}",
                self.channel.config.direction
            )))
        }
    }
}

fn check_format<S: HostSample>(format: SampleFormat) -> Result<()> {
    if S::accepts(format) {
        Ok(())
    } else {
        Err(LmsError::invalid_argument(format!(
            "buffer type {} does not match stream format {format:?}",
            std::any::type_name::<S>()
        )))
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Error closing stream on drop");
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("config", &self.channel.config)
            .field("active", &self.channel.active.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, ChannelRole};

    fn pipeline_without_data() -> StreamPipeline {
        let transport = TransportChannel::new(
            Channel::unsupported(ChannelRole::Control),
            Channel::unsupported(ChannelRole::Data),
        );
        StreamPipeline::new(Arc::new(transport), StreamSettings::default(), 2, 2)
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = StreamConfig::default();
        assert_eq!(config.format, SampleFormat::I12In16);
        assert_eq!(config.buffer_depth, 64);
        assert!(config.validate().is_ok());

        assert!(StreamConfig::builder().buffer_depth(0).build().is_err());
        assert!(StreamConfig::builder().latency(1.5).build().is_err());
    }

    #[test]
    fn test_latency_hint_maps_to_batch_size() {
        let low_latency = StreamConfig::builder().latency(1.0).build().unwrap();
        let throughput = StreamConfig::builder().latency(0.0).build().unwrap();
        assert_eq!(low_latency.packets_per_transfer(), 1);
        assert_eq!(throughput.packets_per_transfer(), MAX_PACKETS_PER_TRANSFER);
    }

    #[test]
    fn test_metadata_helpers() {
        let meta = StreamMetadata::at(1000).with_end_of_burst();
        assert!(meta.sync);
        assert!(meta.end_of_burst);
        assert_eq!(meta.timestamp, 1000);
    }

    #[test]
    fn test_setup_rejects_transport_without_data_channel() {
        let pipeline = pipeline_without_data();
        let err = pipeline.setup(StreamConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotSupported);
    }

    #[test]
    fn test_setup_rejects_bad_channel_first() {
        let pipeline = pipeline_without_data();
        let config = StreamConfig::builder().channel(2).build().unwrap();
        let err = pipeline.setup(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
