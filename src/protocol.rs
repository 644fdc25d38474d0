//! LMS64C control protocol.
//!
//! Every control operation is one or more fixed-size request/response
//! exchanges on the control channel:
//!
//! ```text
//! byte 0     command code
//! byte 1     status code (0 in requests)
//! byte 2     block count (number of items in the payload)
//! byte 3     peripheral id (chip index)
//! bytes 4-7  reserved
//! bytes 8-63 payload window (56 bytes)
//! ```
//!
//! The protocol is half-duplex with no correlation id, so [`CommandProtocol`]
//! serializes transfers with an internal lock.
//!
//! The register, SPI, I2C, GPIO and custom-parameter primitives are provided
//! methods of [`ControlPort`]; anything that can move one packet gets them.
//! Calibration code outside this crate should only use these primitives.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use crate::error::{LmsError, Result};
use crate::transport::TransportChannel;

/// Size of one control packet on the wire.
pub const PACKET_SIZE: usize = 64;
/// Bytes before the payload window.
pub const HEADER_SIZE: usize = 8;
/// Payload window size.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;
/// Register (address, value) pairs that fit in one packet.
pub const MAX_REGISTERS_PER_PACKET: usize = PAYLOAD_SIZE / 4;

/// SPI bus index of the first LMS7002M transceiver.
pub const LMS7002M_SPI_INDEX: u8 = 0x10;
/// SPI bus index of the ADF4002 reference PLL.
pub const ADF4002_SPI_INDEX: u8 = 0x30;
/// I2C address of the Si5351 clock generator.
pub const SI5351_I2C_ADDR: u8 = 0x20;

/// Write flag in a 32-bit SPI word: `1 << 31 | addr << 16 | data`.
pub const SPI_WRITE_FLAG: u32 = 1 << 31;

/// LMS64C command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Board identification (`GET_INFO`).
    GetInfo = 0x00,
    /// Si5351 register writes over I2C.
    Si5351Write = 0x13,
    /// Si5351 register reads over I2C.
    Si5351Read = 0x14,
    /// Reset, enable or disable the LMS7002M.
    Lms7002Reset = 0x20,
    /// LMS7002M SPI writes.
    Lms7002Write = 0x21,
    /// LMS7002M SPI reads.
    Lms7002Read = 0x22,
    /// ADF4002 PLL writes.
    Adf4002Write = 0x31,
    /// Set GPIO directions.
    GpioDirWrite = 0x4F,
    /// Read GPIO directions.
    GpioDirRead = 0x50,
    /// Set GPIO levels.
    GpioWrite = 0x51,
    /// Read GPIO levels.
    GpioRead = 0x52,
    /// FPGA register writes.
    BoardSpiWrite = 0x55,
    /// FPGA register reads.
    BoardSpiRead = 0x56,
    /// Custom parameter writes.
    AnalogValueWrite = 0x61,
    /// Custom parameter reads.
    AnalogValueRead = 0x62,
}

impl Command {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::GetInfo,
            0x13 => Self::Si5351Write,
            0x14 => Self::Si5351Read,
            0x20 => Self::Lms7002Reset,
            0x21 => Self::Lms7002Write,
            0x22 => Self::Lms7002Read,
            0x31 => Self::Adf4002Write,
            0x4F => Self::GpioDirWrite,
            0x50 => Self::GpioDirRead,
            0x51 => Self::GpioWrite,
            0x52 => Self::GpioRead,
            0x55 => Self::BoardSpiWrite,
            0x56 => Self::BoardSpiRead,
            0x61 => Self::AnalogValueWrite,
            0x62 => Self::AnalogValueRead,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::GetInfo => "GET_INFO",
            Self::Si5351Write => "SI5351_WR",
            Self::Si5351Read => "SI5351_RD",
            Self::Lms7002Reset => "LMS7002_RST",
            Self::Lms7002Write => "LMS7002_WR",
            Self::Lms7002Read => "LMS7002_RD",
            Self::Adf4002Write => "ADF4002_WR",
            Self::GpioDirWrite => "GPIO_DIR_WR",
            Self::GpioDirRead => "GPIO_DIR_RD",
            Self::GpioWrite => "GPIO_WR",
            Self::GpioRead => "GPIO_RD",
            Self::BoardSpiWrite => "BRDSPI16_WR",
            Self::BoardSpiRead => "BRDSPI16_RD",
            Self::AnalogValueWrite => "ANALOG_VAL_WR",
            Self::AnalogValueRead => "ANALOG_VAL_RD",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Status byte of a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Status byte outside the known table.
    Undefined,
    /// Command executed.
    Completed,
    /// Firmware does not know the command.
    UnknownCommand,
    /// Board busy; retry later.
    Busy,
    /// Block count exceeds what the command accepts.
    TooManyBlocks,
    /// Command failed.
    Error,
    /// Command issued out of sequence.
    WrongOrder,
    /// Resource held by another client.
    ResourceDenied,
}

impl Status {
    /// Decode a status byte. Codes outside the table read as `Undefined`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Completed,
            2 => Self::UnknownCommand,
            3 => Self::Busy,
            4 => Self::TooManyBlocks,
            5 => Self::Error,
            6 => Self::WrongOrder,
            7 => Self::ResourceDenied,
            _ => Self::Undefined,
        }
    }

    /// Wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Undefined => 0,
            Self::Completed => 1,
            Self::UnknownCommand => 2,
            Self::Busy => 3,
            Self::TooManyBlocks => 4,
            Self::Error => 5,
            Self::WrongOrder => 6,
            Self::ResourceDenied => 7,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Undefined => "undefined",
            Self::Completed => "completed",
            Self::UnknownCommand => "unknown command",
            Self::Busy => "busy",
            Self::TooManyBlocks => "too many blocks",
            Self::Error => "error",
            Self::WrongOrder => "wrong order",
            Self::ResourceDenied => "resource denied",
        };
        f.write_str(text)
    }
}

/// One request and, after [`ControlPort::transfer`], its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Command code.
    pub command: Command,
    /// Response status; `Undefined` until transferred.
    pub status: Status,
    /// Items in the payload.
    pub block_count: u8,
    /// Target chip index.
    pub periph_id: u8,
    /// Outbound payload, at most [`PAYLOAD_SIZE`] bytes.
    pub outbound: Vec<u8>,
    /// Inbound payload window.
    pub inbound: [u8; PAYLOAD_SIZE],
}

impl CommandPacket {
    /// Empty request for `command`.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            status: Status::Undefined,
            block_count: 0,
            periph_id: 0,
            outbound: Vec::new(),
            inbound: [0; PAYLOAD_SIZE],
        }
    }

    /// Set the outbound payload and block count.
    pub fn with_payload(mut self, block_count: u8, payload: Vec<u8>) -> Self {
        self.block_count = block_count;
        self.outbound = payload;
        self
    }

    /// Set the peripheral id.
    pub fn with_periph(mut self, periph_id: u8) -> Self {
        self.periph_id = periph_id;
        self
    }

    /// Serialize the request frame.
    pub fn encode(&self) -> Result<[u8; PACKET_SIZE]> {
        if self.outbound.len() > PAYLOAD_SIZE {
            return Err(LmsError::invalid_argument(format!(
                "{} payload of {} bytes exceeds the {PAYLOAD_SIZE}-byte window",
                self.command,
                self.outbound.len()
            )));
        }
        let mut frame = [0u8; PACKET_SIZE];
        let mut buf = &mut frame[..];
        buf.put_u8(self.command.code());
        buf.put_u8(self.status.code());
        buf.put_u8(self.block_count);
        buf.put_u8(self.periph_id);
        buf.put_u32(0);
        buf.put_slice(&self.outbound);
        Ok(frame)
    }

    /// Serialize a response frame: header with status, then the inbound window.
    pub fn encode_reply(&self) -> [u8; PACKET_SIZE] {
        let mut frame = [0u8; PACKET_SIZE];
        let mut buf = &mut frame[..];
        buf.put_u8(self.command.code());
        buf.put_u8(self.status.code());
        buf.put_u8(self.block_count);
        buf.put_u8(self.periph_id);
        buf.put_u32(0);
        buf.put_slice(&self.inbound);
        frame
    }

    /// Parse a frame (either direction) into a packet with `inbound` filled.
    pub fn decode(frame: &[u8; PACKET_SIZE]) -> Result<Self> {
        let mut buf = &frame[..];
        let code = buf.get_u8();
        let command = Command::from_code(code).ok_or_else(|| {
            LmsError::invalid_argument(format!("unknown command code 0x{code:02X}"))
        })?;
        let status = Status::from_code(buf.get_u8());
        let block_count = buf.get_u8();
        let periph_id = buf.get_u8();
        buf.advance(4);
        let mut inbound = [0u8; PAYLOAD_SIZE];
        inbound.copy_from_slice(buf);
        Ok(Self {
            command,
            status,
            block_count,
            periph_id,
            outbound: Vec::new(),
            inbound,
        })
    }

    fn check(&self) -> Result<()> {
        if self.status == Status::Completed {
            Ok(())
        } else {
            Err(LmsError::Protocol {
                command: self.command,
                status: self.status,
            })
        }
    }
}

/// Target of an SPI transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiTarget {
    /// LMS7002M transceiver by chip index.
    Lms7002m(u8),
    /// ADF4002 reference PLL (write only, 24-bit words).
    Adf4002,
    /// FPGA registers behind the board SPI bridge.
    Board,
}

impl SpiTarget {
    /// Resolve a bus index as reported in [`DeviceInfo`].
    pub fn from_bus_index(index: u8) -> Option<Self> {
        match index {
            ADF4002_SPI_INDEX => Some(Self::Adf4002),
            i if (LMS7002M_SPI_INDEX..LMS7002M_SPI_INDEX + 8).contains(&i) => {
                Some(Self::Lms7002m(i - LMS7002M_SPI_INDEX))
            }
            _ => None,
        }
    }
}

/// Physical unit of a custom parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Unitless raw value.
    Raw,
    /// Volts.
    Volt,
    /// Amperes.
    Ampere,
    /// Ohms.
    Ohm,
    /// Watts.
    Watt,
    /// Degrees Celsius.
    Celsius,
}

impl Unit {
    const LABELS: [&'static str; 6] = ["", "V", "A", "Ohm", "W", "C"];

    /// Decode the 4-bit unit field.
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => Self::Volt,
            2 => Self::Ampere,
            3 => Self::Ohm,
            4 => Self::Watt,
            5 => Self::Celsius,
            _ => Self::Raw,
        }
    }

    /// Look up a unit by label; unknown labels are `Raw`.
    pub fn from_label(label: &str) -> Self {
        Self::LABELS
            .iter()
            .position(|l| l.eq_ignore_ascii_case(label))
            .map_or(Self::Raw, |i| Self::from_index(i as u8))
    }

    /// 4-bit unit field.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        Self::LABELS[self.index() as usize]
    }
}

/// Value of a custom (analog) parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomParameter {
    /// Parameter id.
    pub id: u8,
    /// Physical value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
}

impl CustomParameter {
    /// Encode as `(mantissa, exponent)` with `value = mantissa * 10^exponent`,
    /// choosing the smallest exponent whose mantissa fits in an `i16`.
    pub fn encode_value(value: f64) -> (i16, i8) {
        for exponent in -8i8..=7 {
            let mantissa = (value / 10f64.powi(i32::from(exponent))).round();
            if mantissa.abs() <= f64::from(i16::MAX) {
                return (mantissa as i16, exponent);
            }
        }
        let clamped = (value / 1e7).round().clamp(f64::from(i16::MIN), f64::from(i16::MAX));
        (clamped as i16, 7)
    }

    /// Inverse of [`Self::encode_value`].
    pub fn decode_value(mantissa: i16, exponent: i8) -> f64 {
        f64::from(mantissa) * 10f64.powi(i32::from(exponent))
    }
}

/// Identification read with `GET_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Board model name.
    pub device_name: String,
    /// Expansion board name.
    pub expansion_name: String,
    /// Gateware/firmware version.
    pub firmware_version: u8,
    /// Hardware revision.
    pub hardware_version: u8,
    /// LMS64C protocol revision.
    pub protocol_version: u8,
    /// Board serial number.
    pub board_serial: u64,
    /// SPI bus indices of the LMS7002M chips.
    ///
    /// `GET_INFO` does not carry the peripheral addresses; this and the two
    /// fields below are the fixed board layout.
    pub lms7002m_addrs: Vec<u8>,
    /// I2C address of the Si5351, if fitted.
    pub si5351_addr: Option<u8>,
    /// SPI bus index of the ADF4002, if fitted.
    pub adf4002_addr: Option<u8>,
}

const DEVICE_NAMES: [&str; 18] = [
    "UNKNOWN",
    "EVB6",
    "DigiGreen",
    "DigiRed",
    "EVB7",
    "ZIPPER",
    "Socket Board",
    "EVB7_v2",
    "Stream",
    "Novena",
    "DataSpark",
    "RF-Spark",
    "LMS6002-USB Stick",
    "RF-ESpark",
    "LimeSDR-USB",
    "LimeSDR-PCIe",
    "LimeSDR-QPCIe",
    "LimeSDR-Mini",
];

const EXPANSION_NAMES: [&str; 6] = ["UNKNOWN", "N/A", "Myriad7", "HPM1000", "Myriad7 Novena", "RFDIG"];

impl DeviceInfo {
    fn from_payload(payload: &[u8; PAYLOAD_SIZE]) -> Self {
        let name = |table: &[&str], index: u8| {
            table.get(usize::from(index)).copied().unwrap_or(table[0]).to_string()
        };
        let mut serial = &payload[10..18];
        Self {
            firmware_version: payload[0],
            device_name: name(&DEVICE_NAMES[..], payload[1]),
            protocol_version: payload[2],
            hardware_version: payload[3],
            expansion_name: name(&EXPANSION_NAMES[..], payload[4]),
            board_serial: serial.get_u64(),
            lms7002m_addrs: vec![LMS7002M_SPI_INDEX],
            si5351_addr: Some(SI5351_I2C_ADDR),
            adf4002_addr: Some(ADF4002_SPI_INDEX),
        }
    }
}

fn count_u8(n: usize) -> u8 {
    // Callers bound n by the payload window, which is < 256.
    u8::try_from(n).unwrap_or(u8::MAX)
}

/// Anything that can move one LMS64C packet; provides every control primitive.
pub trait ControlPort: Send + Sync {
    /// Send `packet` and fill in its status and inbound payload.
    ///
    /// Succeeds even when the board reports a non-completed status; the
    /// provided methods check it. Fails with `InvalidArgument`, without
    /// touching the transport, when the outbound payload is too large.
    fn transfer(&self, packet: &mut CommandPacket) -> Result<()>;

    /// Transfer and require `Completed`.
    fn exchange(&self, mut packet: CommandPacket) -> Result<CommandPacket> {
        self.transfer(&mut packet)?;
        packet.check()?;
        Ok(packet)
    }

    /// Write up to [`MAX_REGISTERS_PER_PACKET`] FPGA registers in one packet.
    fn write_register_batch(&self, writes: &[(u16, u16)]) -> Result<()> {
        if writes.len() > MAX_REGISTERS_PER_PACKET {
            return Err(LmsError::invalid_argument(format!(
                "{} register writes exceed {MAX_REGISTERS_PER_PACKET} per packet",
                writes.len()
            )));
        }
        if writes.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(writes.len() * 4);
        for &(addr, value) in writes {
            payload.put_u16(addr);
            payload.put_u16(value);
        }
        self.exchange(
            CommandPacket::new(Command::BoardSpiWrite).with_payload(count_u8(writes.len()), payload),
        )?;
        Ok(())
    }

    /// Read up to [`MAX_REGISTERS_PER_PACKET`] FPGA registers in one packet.
    fn read_register_batch(&self, addrs: &[u16]) -> Result<Vec<u16>> {
        if addrs.len() > MAX_REGISTERS_PER_PACKET {
            return Err(LmsError::invalid_argument(format!(
                "{} register reads exceed {MAX_REGISTERS_PER_PACKET} per packet",
                addrs.len()
            )));
        }
        if addrs.is_empty() {
            return Ok(Vec::new());
        }
        let mut payload = Vec::with_capacity(addrs.len() * 2);
        for &addr in addrs {
            payload.put_u16(addr);
        }
        let reply = self.exchange(
            CommandPacket::new(Command::BoardSpiRead).with_payload(count_u8(addrs.len()), payload),
        )?;
        Ok(reply
            .inbound
            .chunks_exact(4)
            .take(addrs.len())
            .map(|item| u16::from_be_bytes([item[2], item[3]]))
            .collect())
    }

    /// Write any number of FPGA registers, chunked into packets.
    fn write_registers(&self, writes: &[(u16, u16)]) -> Result<()> {
        for chunk in writes.chunks(MAX_REGISTERS_PER_PACKET) {
            self.write_register_batch(chunk)?;
        }
        Ok(())
    }

    /// Read any number of FPGA registers, chunked into packets.
    fn read_registers(&self, addrs: &[u16]) -> Result<Vec<u16>> {
        let mut values = Vec::with_capacity(addrs.len());
        for chunk in addrs.chunks(MAX_REGISTERS_PER_PACKET) {
            values.extend(self.read_register_batch(chunk)?);
        }
        Ok(values)
    }

    /// Write one FPGA register.
    fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        self.write_register_batch(&[(addr, value)])
    }

    /// Read one FPGA register.
    fn read_register(&self, addr: u16) -> Result<u16> {
        let values = self.read_register_batch(&[addr])?;
        values
            .first()
            .copied()
            .ok_or_else(|| LmsError::invalid_argument("empty register reply"))
    }

    /// SPI transaction: `N` words out, `N` words back.
    ///
    /// Words with [`SPI_WRITE_FLAG`] set are writes and are echoed back;
    /// the others are reads and come back as `addr << 16 | data`.
    fn transact_spi(&self, target: SpiTarget, words: &[u32]) -> Result<Vec<u32>> {
        let mut replies = Vec::with_capacity(words.len());
        let mut rest = words;
        while let Some(&first) = rest.first() {
            let is_write = first & SPI_WRITE_FLAG != 0;
            let run = rest
                .iter()
                .take_while(|&&w| (w & SPI_WRITE_FLAG != 0) == is_write)
                .count();
            let (batch, tail) = rest.split_at(run);
            rest = tail;
            if is_write {
                spi_write(self, target, batch)?;
                replies.extend_from_slice(batch);
            } else {
                replies.extend(spi_read(self, target, batch)?);
            }
        }
        Ok(replies)
    }

    /// I2C write of register/value byte pairs. Only the Si5351 is reachable.
    fn write_i2c(&self, addr: u8, data: &[u8]) -> Result<()> {
        if addr != SI5351_I2C_ADDR {
            return Err(LmsError::not_supported(format!("no I2C device at 0x{addr:02X}")));
        }
        if data.len() % 2 != 0 {
            return Err(LmsError::invalid_argument(format!(
                "I2C write needs register/value pairs, got {} bytes",
                data.len()
            )));
        }
        for chunk in data.chunks(PAYLOAD_SIZE) {
            self.exchange(
                CommandPacket::new(Command::Si5351Write)
                    .with_payload(count_u8(chunk.len() / 2), chunk.to_vec()),
            )?;
        }
        Ok(())
    }

    /// I2C read of the given registers. Only the Si5351 is reachable.
    fn read_i2c(&self, addr: u8, registers: &[u8]) -> Result<Vec<u8>> {
        if addr != SI5351_I2C_ADDR {
            return Err(LmsError::not_supported(format!("no I2C device at 0x{addr:02X}")));
        }
        let mut values = Vec::with_capacity(registers.len());
        for chunk in registers.chunks(PAYLOAD_SIZE) {
            let reply = self.exchange(
                CommandPacket::new(Command::Si5351Read)
                    .with_payload(count_u8(chunk.len()), chunk.to_vec()),
            )?;
            values.extend_from_slice(&reply.inbound[..chunk.len()]);
        }
        Ok(values)
    }

    /// Set GPIO output levels, one byte per 8 pins.
    fn write_gpio(&self, levels: &[u8]) -> Result<()> {
        gpio_write(self, Command::GpioWrite, levels)
    }

    /// Read `len` bytes of GPIO input levels.
    fn read_gpio(&self, len: usize) -> Result<Vec<u8>> {
        gpio_read(self, Command::GpioRead, len)
    }

    /// Set GPIO directions (1 = output), one byte per 8 pins.
    fn write_gpio_dir(&self, dirs: &[u8]) -> Result<()> {
        gpio_write(self, Command::GpioDirWrite, dirs)
    }

    /// Read `len` bytes of GPIO directions.
    fn read_gpio_dir(&self, len: usize) -> Result<Vec<u8>> {
        gpio_read(self, Command::GpioDirRead, len)
    }

    /// Write custom parameters.
    fn write_custom_parameters(&self, params: &[CustomParameter]) -> Result<()> {
        for chunk in params.chunks(MAX_REGISTERS_PER_PACKET) {
            let mut payload = Vec::with_capacity(chunk.len() * 4);
            for param in chunk {
                let (mantissa, exponent) = CustomParameter::encode_value(param.value);
                payload.put_u8(param.id);
                payload.put_u8(param.unit.index() << 4 | (exponent as u8 & 0x0F));
                payload.put_i16(mantissa);
            }
            self.exchange(
                CommandPacket::new(Command::AnalogValueWrite)
                    .with_payload(count_u8(chunk.len()), payload),
            )?;
        }
        Ok(())
    }

    /// Read custom parameters by id.
    fn read_custom_parameters(&self, ids: &[u8]) -> Result<Vec<CustomParameter>> {
        let mut params = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_REGISTERS_PER_PACKET) {
            let reply = self.exchange(
                CommandPacket::new(Command::AnalogValueRead)
                    .with_payload(count_u8(chunk.len()), chunk.to_vec()),
            )?;
            for item in reply.inbound.chunks_exact(4).take(chunk.len()) {
                // Sign-extend the 4-bit exponent.
                let exponent = ((item[1] << 4) as i8) >> 4;
                let mantissa = i16::from_be_bytes([item[2], item[3]]);
                params.push(CustomParameter {
                    id: item[0],
                    value: CustomParameter::decode_value(mantissa, exponent),
                    unit: Unit::from_index(item[1] >> 4),
                });
            }
        }
        Ok(params)
    }

    /// Read board identification.
    fn device_info(&self) -> Result<DeviceInfo> {
        let reply = self.exchange(CommandPacket::new(Command::GetInfo))?;
        Ok(DeviceInfo::from_payload(&reply.inbound))
    }

    /// Pulse the LMS7002M hardware reset line.
    fn reset_lms7002m(&self, chip: u8) -> Result<()> {
        const RESET_PULSE: u8 = 2;
        self.exchange(
            CommandPacket::new(Command::Lms7002Reset)
                .with_periph(chip)
                .with_payload(1, vec![RESET_PULSE]),
        )?;
        Ok(())
    }
}

fn spi_write<P: ControlPort + ?Sized>(port: &P, target: SpiTarget, words: &[u32]) -> Result<()> {
    let (command, periph, width) = match target {
        SpiTarget::Lms7002m(chip) => (Command::Lms7002Write, chip, 4),
        SpiTarget::Board => (Command::BoardSpiWrite, 0, 4),
        SpiTarget::Adf4002 => (Command::Adf4002Write, 0, 3),
    };
    for chunk in words.chunks(PAYLOAD_SIZE / width) {
        let mut payload = Vec::with_capacity(chunk.len() * width);
        for &word in chunk {
            let word = word & !SPI_WRITE_FLAG;
            if width == 3 {
                payload.put_uint(u64::from(word & 0x00FF_FFFF), 3);
            } else {
                payload.put_u16((word >> 16) as u16);
                payload.put_u16(word as u16);
            }
        }
        port.exchange(
            CommandPacket::new(command)
                .with_periph(periph)
                .with_payload(count_u8(chunk.len()), payload),
        )?;
    }
    Ok(())
}

fn spi_read<P: ControlPort + ?Sized>(port: &P, target: SpiTarget, words: &[u32]) -> Result<Vec<u32>> {
    let (command, periph) = match target {
        SpiTarget::Lms7002m(chip) => (Command::Lms7002Read, chip),
        SpiTarget::Board => (Command::BoardSpiRead, 0),
        SpiTarget::Adf4002 => {
            return Err(LmsError::not_supported("ADF4002 registers are write-only"))
        }
    };
    let mut values = Vec::with_capacity(words.len());
    for chunk in words.chunks(MAX_REGISTERS_PER_PACKET) {
        let mut payload = Vec::with_capacity(chunk.len() * 2);
        for &word in chunk {
            payload.put_u16((word >> 16) as u16 & 0x7FFF);
        }
        let reply = port.exchange(
            CommandPacket::new(command)
                .with_periph(periph)
                .with_payload(count_u8(chunk.len()), payload),
        )?;
        values.extend(reply.inbound.chunks_exact(4).take(chunk.len()).map(|item| {
            u32::from(u16::from_be_bytes([item[0], item[1]])) << 16
                | u32::from(u16::from_be_bytes([item[2], item[3]]))
        }));
    }
    Ok(values)
}

fn gpio_write<P: ControlPort + ?Sized>(port: &P, command: Command, bytes: &[u8]) -> Result<()> {
    if bytes.len() > PAYLOAD_SIZE {
        return Err(LmsError::invalid_argument(format!(
            "{} GPIO bytes exceed the payload window",
            bytes.len()
        )));
    }
    port.exchange(CommandPacket::new(command).with_payload(count_u8(bytes.len()), bytes.to_vec()))?;
    Ok(())
}

fn gpio_read<P: ControlPort + ?Sized>(port: &P, command: Command, len: usize) -> Result<Vec<u8>> {
    if len > PAYLOAD_SIZE {
        return Err(LmsError::invalid_argument(format!(
            "{len} GPIO bytes exceed the payload window"
        )));
    }
    let reply = port.exchange(CommandPacket::new(command).with_payload(count_u8(len), Vec::new()))?;
    Ok(reply.inbound[..len].to_vec())
}

/// Timeouts for one control exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTimeouts {
    /// Deadline for sending the request frame.
    pub write: Duration,
    /// Deadline for receiving the response frame.
    pub read: Duration,
}

impl Default for ControlTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_millis(500),
            read: Duration::from_millis(1000),
        }
    }
}

/// LMS64C over a [`TransportChannel`]'s control channel.
pub struct CommandProtocol {
    transport: Arc<TransportChannel>,
    timeouts: ControlTimeouts,
    // One request in flight per transport.
    in_flight: Mutex<()>,
}

impl CommandProtocol {
    /// Protocol engine over `transport`.
    pub fn new(transport: Arc<TransportChannel>, timeouts: ControlTimeouts) -> Self {
        Self {
            transport,
            timeouts,
            in_flight: Mutex::new(()),
        }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }
}

impl fmt::Debug for CommandProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProtocol")
            .field("timeouts", &self.timeouts)
            .field("open", &self.transport.is_open())
            .finish()
    }
}

impl ControlPort for CommandProtocol {
    #[instrument(level = "trace", skip_all, fields(command = %packet.command), err)]
    fn transfer(&self, packet: &mut CommandPacket) -> Result<()> {
        let frame = packet.encode()?;
        let control = self.transport.control();

        let _guard = self.in_flight.lock();
        let written = control.write(&frame, self.timeouts.write)?;
        if written != PACKET_SIZE {
            return Err(LmsError::timeout(format!(
                "{}: wrote {written} of {PACKET_SIZE} bytes",
                packet.command
            )));
        }
        let mut response = [0u8; PACKET_SIZE];
        let read = control.read(&mut response, self.timeouts.read)?;
        if read != PACKET_SIZE {
            return Err(LmsError::timeout(format!(
                "{}: read {read} of {PACKET_SIZE} bytes",
                packet.command
            )));
        }

        let reply = CommandPacket::decode(&response)?;
        if reply.command != packet.command {
            debug!(sent = %packet.command, received = %reply.command, "Reply command mismatch");
        }
        packet.status = reply.status;
        packet.inbound = reply.inbound;
        trace!(status = %packet.status, "transfer complete");
        Ok(())
    }
}
