//! Simulated board for tests and demos.
//!
//! [`MockBoard`] answers LMS64C packets on its control channel and produces
//! or consumes sample packets on its data channel, so the whole driver runs
//! without hardware:
//!
//! - FPGA and LMS7002M register maps with the streaming, PLL and MCU side
//!   effects the driver relies on
//! - PLL status model: done, never done, or a fixed error code
//! - MCU program FIFO with byte and chunk counters
//! - RX packet generator with counter-gap injection
//! - TX packet capture
//! - one-shot fatal faults and stalls on the data channel
//!
//! # Example
//!
//! ```rust
//! use lms_driver::mock::MockBoard;
//! use lms_driver::protocol::ControlPort;
//! use lms_driver::LmsDevice;
//!
//! # fn main() -> lms_driver::Result<()> {
//! let board = MockBoard::new();
//! let device = LmsDevice::from_connection(board.connection(), &Default::default())?;
//! device.control().write_register(0x0010, 0xBEEF)?;
//! assert_eq!(board.fpga_register(0x0010), 0xBEEF);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BufMut;
use num_complex::Complex;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionEntry, ConnectionHandle};
use crate::error::{LmsError, Result};
use crate::fpga::reg;
use crate::protocol::{Command, CommandPacket, Status, PACKET_SIZE, PAYLOAD_SIZE};
use crate::stream::packet::{
    encode_packet, samples_per_packet, PacketFlags, PacketHeader, DATA_PACKET_SIZE,
};
use crate::stream::SampleFormat;
use crate::transport::{ByteStream, Channel, ChannelRole, TransportChannel};

const MCU_CONTROL: u16 = 0x0002;
const MCU_STATUS: u16 = 0x0003;
const MCU_DATA: u16 = 0x0004;
const MCU_FIFO_EMPTY: u16 = 1 << 0;
const MCU_PROGRAMMED: u16 = 1 << 6;
const MCU_CHUNK: usize = 32;

/// Device id reported by `GET_INFO` (LimeSDR-QPCIe).
const DEVICE_ID: u8 = 16;

/// How the simulated PLL answers a configuration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PllBehavior {
    /// Done bit set as soon as a start strobe is written.
    #[default]
    Done,
    /// Done bit never set.
    Never,
    /// Error code reported in the status register.
    Error(u8),
}

#[derive(Default)]
struct McuState {
    mode: u16,
    bytes: usize,
    fifo_stuck: bool,
    never_programmed: bool,
}

impl McuState {
    fn status(&self) -> u16 {
        let mut status = 0;
        if !self.fifo_stuck {
            status |= MCU_FIFO_EMPTY;
        }
        if self.mode != 0 && !self.never_programmed {
            status |= MCU_PROGRAMMED;
        }
        status
    }
}

#[derive(Default)]
struct BoardState {
    fpga: BTreeMap<u16, u16>,
    fpga_writes: Vec<(u16, u16)>,
    lms: BTreeMap<(u8, u16), u16>,
    pll: PllBehavior,
    mcu: McuState,
    gpio: Vec<u8>,
    gpio_dir: Vec<u8>,
    si5351: BTreeMap<u8, u8>,
    adf4002: Vec<u32>,
    analog: BTreeMap<u8, [u8; 4]>,
    commands: Vec<Command>,

    // Control channel framing.
    request: Vec<u8>,
    responses: VecDeque<u8>,

    // Data channel.
    rx_counter: u64,
    rx_pending: VecDeque<u8>,
    skip_packets: u64,
    report_late: bool,
    tx_partial: Vec<u8>,
    tx_packets: Vec<Vec<u8>>,
}

impl BoardState {
    fn fpga(&self, addr: u16) -> u16 {
        self.fpga.get(&addr).copied().unwrap_or(0)
    }

    fn write_fpga(&mut self, addr: u16, value: u16) {
        let previous = self.fpga(addr);
        self.fpga.insert(addr, value);
        self.fpga_writes.push((addr, value));
        match addr {
            reg::TIMESTAMP_CTRL if value & reg::TIMESTAMP_RESET != 0 => {
                self.rx_counter = 0;
                self.rx_pending.clear();
            }
            reg::STREAM_CTRL if value & reg::STREAM_EN == 0 => self.rx_pending.clear(),
            reg::PLL_CTRL => {
                let strobes = reg::PLLCFG_START | reg::PHCFG_START;
                let rising = value & !previous & strobes;
                let status = if rising != 0 {
                    match self.pll {
                        PllBehavior::Done => reg::PLL_DONE,
                        PllBehavior::Never => 0,
                        PllBehavior::Error(code) => u16::from(code) << reg::PLL_ERROR_SHIFT,
                    }
                } else if value & strobes == 0 {
                    0
                } else {
                    self.fpga(reg::PLL_STATUS)
                };
                self.fpga.insert(reg::PLL_STATUS, status);
            }
            _ => {}
        }
    }

    fn write_lms(&mut self, chip: u8, addr: u16, value: u16) {
        match addr {
            MCU_CONTROL => {
                if value == 0 {
                    self.mcu.mode = 0;
                    self.mcu.bytes = 0;
                } else {
                    self.mcu.mode = value & 0x3;
                }
            }
            MCU_DATA => self.mcu.bytes += 1,
            _ => {}
        }
        self.lms.insert((chip, addr), value);
    }

    fn read_lms(&self, chip: u8, addr: u16) -> u16 {
        if addr == MCU_STATUS {
            return self.mcu.status();
        }
        self.lms.get(&(chip, addr)).copied().unwrap_or(0)
    }

    /// Execute one request frame and queue the reply.
    fn handle_frame(&mut self, frame: &[u8; PACKET_SIZE]) {
        let mut packet = match CommandPacket::decode(frame) {
            Ok(packet) => packet,
            Err(_) => {
                let mut reply = *frame;
                reply[1] = Status::UnknownCommand.code();
                self.responses.extend(reply);
                return;
            }
        };
        self.commands.push(packet.command);
        let request = packet.inbound;
        let blocks = usize::from(packet.block_count);
        let count = blocks.min(PAYLOAD_SIZE);
        let mut reply = [0u8; PAYLOAD_SIZE];
        let mut status = Status::Completed;

        match packet.command {
            Command::GetInfo => {
                reply[..5].copy_from_slice(&[4, DEVICE_ID, 1, 1, 1]);
                reply[10..18].copy_from_slice(&0x0009_0A0B_0C0D_0E0Fu64.to_be_bytes());
            }
            Command::BoardSpiWrite => {
                for item in request.chunks_exact(4).take(count) {
                    let addr = u16::from_be_bytes([item[0], item[1]]);
                    self.write_fpga(addr, u16::from_be_bytes([item[2], item[3]]));
                }
            }
            Command::BoardSpiRead => {
                let mut out = &mut reply[..];
                for item in request.chunks_exact(2).take(count.min(PAYLOAD_SIZE / 4)) {
                    let addr = u16::from_be_bytes([item[0], item[1]]);
                    out.put_u16(addr);
                    out.put_u16(self.fpga(addr));
                }
            }
            Command::Lms7002Write => {
                for item in request.chunks_exact(4).take(count) {
                    let addr = u16::from_be_bytes([item[0], item[1]]);
                    self.write_lms(packet.periph_id, addr, u16::from_be_bytes([item[2], item[3]]));
                }
            }
            Command::Lms7002Read => {
                let mut out = &mut reply[..];
                for item in request.chunks_exact(2).take(count.min(PAYLOAD_SIZE / 4)) {
                    let addr = u16::from_be_bytes([item[0], item[1]]);
                    out.put_u16(addr);
                    out.put_u16(self.read_lms(packet.periph_id, addr));
                }
            }
            Command::Lms7002Reset => {
                let chip = packet.periph_id;
                self.lms.retain(|(c, _), _| *c != chip);
            }
            Command::Adf4002Write => {
                for item in request.chunks_exact(3).take(count) {
                    self.adf4002
                        .push(u32::from_be_bytes([0, item[0], item[1], item[2]]));
                }
            }
            Command::GpioWrite => self.gpio = request[..count].to_vec(),
            Command::GpioDirWrite => self.gpio_dir = request[..count].to_vec(),
            Command::GpioRead => copy_padded(&mut reply, &self.gpio, count),
            Command::GpioDirRead => copy_padded(&mut reply, &self.gpio_dir, count),
            Command::Si5351Write => {
                for pair in request.chunks_exact(2).take(count) {
                    self.si5351.insert(pair[0], pair[1]);
                }
            }
            Command::Si5351Read => {
                for (i, register) in request[..count].iter().enumerate() {
                    reply[i] = self.si5351.get(register).copied().unwrap_or(0);
                }
            }
            Command::AnalogValueWrite => {
                for item in request.chunks_exact(4).take(count) {
                    self.analog.insert(item[0], [item[0], item[1], item[2], item[3]]);
                }
            }
            Command::AnalogValueRead => {
                for (i, id) in request[..count.min(PAYLOAD_SIZE / 4)].iter().enumerate() {
                    let value = self.analog.get(id).copied().unwrap_or([*id, 0, 0, 0]);
                    reply[i * 4..i * 4 + 4].copy_from_slice(&value);
                }
            }
        }

        if blocks > PAYLOAD_SIZE {
            status = Status::TooManyBlocks;
        }
        packet.status = status;
        packet.inbound = reply;
        self.responses.extend(packet.encode_reply());
    }

    fn streaming(&self) -> bool {
        self.fpga(reg::STREAM_CTRL) & reg::STREAM_EN != 0
    }

    fn link(&self) -> SampleFormat {
        if self.fpga(reg::SAMPLE_WIDTH) == reg::WIDTH_PACKED12 {
            SampleFormat::Packed12
        } else {
            SampleFormat::I12In16
        }
    }

    fn rx_channels(&self) -> usize {
        (self.fpga(reg::CHANNEL_ENABLE) & 0xFF).count_ones().max(1) as usize
    }

    /// Append one generated RX packet to the pending bytes.
    fn generate_rx_packet(&mut self) {
        let link = self.link();
        let channels = self.rx_channels();
        let per_channel = samples_per_packet(link, channels);
        if self.skip_packets > 0 {
            self.rx_counter += self.skip_packets * per_channel as u64;
            self.skip_packets = 0;
        }
        let counter = self.rx_counter;
        let samples: Vec<Vec<Complex<i16>>> = (0..channels)
            .map(|c| {
                (0..per_channel)
                    .map(|n| ramp_sample(counter + n as u64, c))
                    .collect()
            })
            .collect();
        let slices: Vec<&[Complex<i16>]> = samples.iter().map(Vec::as_slice).collect();
        let mut flags = PacketFlags::empty();
        if std::mem::take(&mut self.report_late) {
            flags |= PacketFlags::TX_DROPPED_LATE;
        }
        let mut out = Vec::with_capacity(DATA_PACKET_SIZE);
        if encode_packet(PacketHeader { flags, counter }, link, &slices, &mut out).is_ok() {
            self.rx_pending.extend(out);
        }
        self.rx_counter += per_channel as u64;
    }

    fn capture_tx(&mut self, bytes: &[u8]) {
        self.tx_partial.extend_from_slice(bytes);
        while self.tx_partial.len() >= DATA_PACKET_SIZE {
            let packet: Vec<u8> = self.tx_partial.drain(..DATA_PACKET_SIZE).collect();
            let header = PacketHeader::parse(&packet);
            if !header.flags.contains(PacketFlags::IGNORE_TIMESTAMP) && header.counter < self.rx_counter {
                self.report_late = true;
            }
            self.tx_packets.push(packet);
        }
    }
}

fn copy_padded(reply: &mut [u8; PAYLOAD_SIZE], source: &[u8], count: usize) {
    for (i, byte) in reply.iter_mut().take(count).enumerate() {
        *byte = source.get(i).copied().unwrap_or(0);
    }
}

/// Sample the generator emits at `timestamp` on `channel`.
pub fn ramp_sample(timestamp: u64, channel: usize) -> Complex<i16> {
    let re = ((timestamp + 100 * channel as u64) % 2048) as i16;
    Complex::new(re, -re)
}

struct Shared {
    state: Mutex<BoardState>,
    control_open: AtomicBool,
    data_open: AtomicBool,
    busy_on_open: AtomicBool,
    data_fault: AtomicBool,
    data_stalled: AtomicBool,
    control_transfers: AtomicU64,
    data_reads: AtomicU64,
    data_writes: AtomicU64,
    packet_interval: Mutex<Duration>,
}

/// In-process LimeSDR-like board. Clones share one board.
#[derive(Clone)]
pub struct MockBoard {
    shared: Arc<Shared>,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBoard {
    /// Board with empty register maps and a PLL that always locks.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BoardState::default()),
                control_open: AtomicBool::new(false),
                data_open: AtomicBool::new(false),
                busy_on_open: AtomicBool::new(false),
                data_fault: AtomicBool::new(false),
                data_stalled: AtomicBool::new(false),
                control_transfers: AtomicU64::new(0),
                data_reads: AtomicU64::new(0),
                data_writes: AtomicU64::new(0),
                packet_interval: Mutex::new(Duration::from_micros(200)),
            }),
        }
    }

    /// Delay between generated RX packets.
    pub fn with_packet_interval(self, interval: Duration) -> Self {
        *self.shared.packet_interval.lock() = interval;
        self
    }

    /// Transport whose channels talk to this board. Not yet open.
    pub fn transport(&self) -> TransportChannel {
        TransportChannel::new(
            Channel::new(ChannelRole::Control, Box::new(MockControl { board: self.clone() })),
            Channel::new(ChannelRole::Data, Box::new(MockData { board: self.clone() })),
        )
    }

    /// Connection with two RX and two TX channels.
    pub fn connection(&self) -> Connection {
        Connection {
            handle: MockConnectionEntry::handle(),
            transport: Arc::new(self.transport()),
            rx_channels: 2,
            tx_channels: 2,
        }
    }

    /// Registry entry that enumerates this board.
    pub fn entry(&self) -> MockConnectionEntry {
        MockConnectionEntry { board: self.clone() }
    }

    /// Set how the PLL answers start strobes.
    pub fn set_pll_behavior(&self, behavior: PllBehavior) {
        self.shared.state.lock().pll = behavior;
    }

    /// Keep the MCU FIFO-empty bit cleared.
    pub fn set_mcu_fifo_stuck(&self, stuck: bool) {
        self.shared.state.lock().mcu.fifo_stuck = stuck;
    }

    /// Never raise the MCU programmed bit.
    pub fn set_mcu_never_programmed(&self, never: bool) {
        self.shared.state.lock().mcu.never_programmed = never;
    }

    /// Bytes written to the MCU data register since the last reset.
    pub fn mcu_bytes(&self) -> usize {
        self.shared.state.lock().mcu.bytes
    }

    /// Whole FIFO loads written since the last reset.
    pub fn mcu_chunks(&self) -> usize {
        self.mcu_bytes() / MCU_CHUNK
    }

    /// Boot mode last written to the MCU control register.
    pub fn mcu_mode(&self) -> u16 {
        self.shared.state.lock().mcu.mode
    }

    /// Current FPGA register value.
    pub fn fpga_register(&self, addr: u16) -> u16 {
        self.shared.state.lock().fpga(addr)
    }

    /// Preset an FPGA register without side effects.
    pub fn set_fpga_register(&self, addr: u16, value: u16) {
        self.shared.state.lock().fpga.insert(addr, value);
    }

    /// Every FPGA register write in order.
    pub fn fpga_writes(&self) -> Vec<(u16, u16)> {
        self.shared.state.lock().fpga_writes.clone()
    }

    /// LMS7002M register value of `chip`.
    pub fn lms_register(&self, chip: u8, addr: u16) -> u16 {
        self.shared.state.lock().read_lms(chip, addr)
    }

    /// Words written to the ADF4002.
    pub fn adf4002_words(&self) -> Vec<u32> {
        self.shared.state.lock().adf4002.clone()
    }

    /// Commands executed, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.shared.state.lock().commands.clone()
    }

    /// Skip `packets` packets' worth of counter before the next RX packet.
    pub fn skip_rx_packets(&self, packets: u64) {
        self.shared.state.lock().skip_packets += packets;
    }

    /// Fail the next data channel operation with a broken pipe.
    pub fn trigger_data_failure(&self) {
        self.shared.data_fault.store(true, Ordering::SeqCst);
    }

    /// Make the data channel stop moving bytes.
    pub fn set_data_stalled(&self, stalled: bool) {
        self.shared.data_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fail channel opens with `EBUSY`.
    pub fn set_busy_on_open(&self, busy: bool) {
        self.shared.busy_on_open.store(busy, Ordering::SeqCst);
    }

    /// Captured TX packets, removing them from the board.
    pub fn take_tx_packets(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.shared.state.lock().tx_packets)
    }

    /// Captured TX packet count.
    pub fn tx_packet_count(&self) -> usize {
        self.shared.state.lock().tx_packets.len()
    }

    /// Next RX counter value.
    pub fn rx_counter(&self) -> u64 {
        self.shared.state.lock().rx_counter
    }

    /// Control frames executed.
    pub fn control_transfers(&self) -> u64 {
        self.shared.control_transfers.load(Ordering::SeqCst)
    }

    /// Read attempts on the data channel.
    pub fn data_reads(&self) -> u64 {
        self.shared.data_reads.load(Ordering::SeqCst)
    }

    /// Write attempts on the data channel.
    pub fn data_writes(&self) -> u64 {
        self.shared.data_writes.load(Ordering::SeqCst)
    }

    /// Whether the control channel is open.
    pub fn is_control_open(&self) -> bool {
        self.shared.control_open.load(Ordering::SeqCst)
    }

    /// Whether the data channel is open.
    pub fn is_data_open(&self) -> bool {
        self.shared.data_open.load(Ordering::SeqCst)
    }

    fn open_flag(&self, flag: &AtomicBool) -> io::Result<()> {
        if self.shared.busy_on_open.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn take_data_fault(&self) -> io::Result<()> {
        if self.shared.data_fault.swap(false, Ordering::SeqCst) {
            debug!("Injected data channel failure");
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock data link lost"));
        }
        if self.shared.data_stalled.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBoard")
            .field("control_open", &self.is_control_open())
            .field("data_open", &self.is_data_open())
            .field("control_transfers", &self.control_transfers())
            .finish_non_exhaustive()
    }
}

struct MockControl {
    board: MockBoard,
}

impl ByteStream for MockControl {
    fn name(&self) -> &str {
        "mock-control"
    }

    fn open(&self) -> io::Result<()> {
        self.board.open_flag(&self.board.shared.control_open)
    }

    fn close(&self) {
        self.board.shared.control_open.store(false, Ordering::SeqCst);
        let mut state = self.board.shared.state.lock();
        state.request.clear();
        state.responses.clear();
    }

    fn is_open(&self) -> bool {
        self.board.is_control_open()
    }

    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.board.shared.state.lock();
        let take = buf.len().min(PACKET_SIZE - state.request.len());
        state.request.extend_from_slice(&buf[..take]);
        if state.request.len() == PACKET_SIZE {
            let mut frame = [0u8; PACKET_SIZE];
            frame.copy_from_slice(&state.request);
            state.request.clear();
            state.handle_frame(&frame);
            self.board.shared.control_transfers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(take)
    }

    fn read_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.board.shared.state.lock();
        if state.responses.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.responses.len());
        for (dst, src) in buf.iter_mut().zip(state.responses.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

struct MockData {
    board: MockBoard,
}

impl ByteStream for MockData {
    fn name(&self) -> &str {
        "mock-data"
    }

    fn open(&self) -> io::Result<()> {
        self.board.open_flag(&self.board.shared.data_open)
    }

    fn close(&self) {
        self.board.shared.data_open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.board.is_data_open()
    }

    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        self.board.shared.data_writes.fetch_add(1, Ordering::SeqCst);
        self.board.take_data_fault()?;
        let mut state = self.board.shared.state.lock();
        state.capture_tx(buf);
        trace!(bytes = buf.len(), "Mock TX capture");
        Ok(buf.len())
    }

    fn read_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.board.shared.data_reads.fetch_add(1, Ordering::SeqCst);
        self.board.take_data_fault()?;
        let generated = {
            let mut state = self.board.shared.state.lock();
            if !state.streaming() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if state.rx_pending.is_empty() {
                state.generate_rx_packet();
                true
            } else {
                false
            }
        };
        if generated {
            thread::sleep(*self.board.shared.packet_interval.lock());
        }
        let mut state = self.board.shared.state.lock();
        let n = buf.len().min(state.rx_pending.len());
        for (dst, src) in buf.iter_mut().zip(state.rx_pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

/// Registry entry for a [`MockBoard`].
#[derive(Debug, Clone)]
pub struct MockConnectionEntry {
    board: MockBoard,
}

impl MockConnectionEntry {
    /// Module name.
    pub const MODULE: &'static str = "Mock";

    fn handle() -> ConnectionHandle {
        ConnectionHandle {
            module: Self::MODULE.to_string(),
            media: "Virtual".to_string(),
            name: "LimeSDR-Mock".to_string(),
            addr: String::new(),
            serial: "00090A0B0C0D0E0F".to_string(),
            index: Some(0),
        }
    }
}

impl ConnectionEntry for MockConnectionEntry {
    fn module(&self) -> &str {
        Self::MODULE
    }

    fn enumerate(&self, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
        let handle = Self::handle();
        if handle.matches(hint) {
            vec![handle]
        } else {
            Vec::new()
        }
    }

    fn make(&self, handle: &ConnectionHandle) -> Result<Connection> {
        if !handle.matches(&Self::handle()) && !Self::handle().matches(handle) {
            return Err(LmsError::not_connected(format!("no mock board for '{handle}'")));
        }
        Ok(self.board.connection())
    }
}
