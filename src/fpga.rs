//! FPGA register map and streaming control.
//!
//! The FPGA sits behind the board SPI bus (`BRDSPI16`). Streaming is
//! enabled through four registers; the PLL and direct-clock blocks used by
//! [`crate::clock`] live further up the map.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::protocol::ControlPort;
use crate::stream::{SampleFormat, StreamControl, StreamingState};

/// FPGA register addresses and bit fields.
pub mod reg {
    /// Phase-interpolator tap select for direct clocking.
    pub const DIRECT_PHASE: u16 = 0x0004;
    /// Direct-clock enable, one bit per clock index.
    pub const DIRECT_CLOCK_EN: u16 = 0x0005;
    /// Direct-clock control: counter and clock index, load strobe.
    pub const DIRECT_CLOCK_CTRL: u16 = 0x0006;
    /// Channel enable mask.
    pub const CHANNEL_ENABLE: u16 = 0x0007;
    /// Link sample width.
    pub const SAMPLE_WIDTH: u16 = 0x0008;
    /// Timestamp reset strobe.
    pub const TIMESTAMP_CTRL: u16 = 0x0009;
    /// Stream enable.
    pub const STREAM_CTRL: u16 = 0x000A;

    /// PLL status: done and error code.
    pub const PLL_STATUS: u16 = 0x0021;
    /// PLL control: start strobes, PLL and counter select.
    pub const PLL_CTRL: u16 = 0x0023;
    /// Phase step count.
    pub const PLL_PHASE_STEPS: u16 = 0x0024;
    /// N and M counter bypass/odd bits.
    pub const PLL_NM_FLAGS: u16 = 0x0026;
    /// Bypass/odd bits of counters C0..C7.
    pub const PLL_C_FLAGS_LO: u16 = 0x0027;
    /// Bypass/odd bits of counters C8..C15.
    pub const PLL_C_FLAGS_HI: u16 = 0x0028;
    /// N counter high/low counts.
    pub const PLL_N_COUNT: u16 = 0x002A;
    /// M counter high/low counts.
    pub const PLL_M_COUNT: u16 = 0x002B;
    /// C0 counter high/low counts; C`i` is at `PLL_C_COUNT_BASE + i`.
    pub const PLL_C_COUNT_BASE: u16 = 0x002E;

    /// Strobe that latches the tap select in [`DIRECT_CLOCK_CTRL`].
    pub const LOAD_PH_REG: u16 = 1 << 10;
    /// Counter select written with the clock index in [`DIRECT_CLOCK_CTRL`].
    pub const DIRECT_CNT_IND: u16 = 1 << 5;

    /// [`PLL_CTRL`] strobe: load counters and reconfigure.
    pub const PLLCFG_START: u16 = 0x0001;
    /// [`PLL_CTRL`] strobe: run the phase shifter.
    pub const PHCFG_START: u16 = 0x0002;
    /// [`PLL_CTRL`] strobe: reset the selected PLL.
    pub const PLLRST_START: u16 = 0x0004;
    /// PLL select offset in [`PLL_CTRL`].
    pub const PLL_IND_SHIFT: u16 = 3;
    /// PLL select field.
    pub const PLL_IND_MASK: u16 = 0x1F << PLL_IND_SHIFT;
    /// Counter select offset in [`PLL_CTRL`].
    pub const CNT_IND_SHIFT: u16 = 8;
    /// Counter select field.
    pub const CNT_IND_MASK: u16 = 0x1F << CNT_IND_SHIFT;
    /// Phase shift direction: set for positive steps.
    pub const PHCFG_UPDN: u16 = 1 << 13;

    /// Done bit in [`PLL_STATUS`].
    pub const PLL_DONE: u16 = 0x0001;
    /// Error code field offset in [`PLL_STATUS`].
    pub const PLL_ERROR_SHIFT: u16 = 7;

    /// Stream enable bit in [`STREAM_CTRL`].
    pub const STREAM_EN: u16 = 0x0001;
    /// TX path enable bit in [`STREAM_CTRL`].
    pub const TX_EN: u16 = 0x0002;
    /// Reset strobe in [`TIMESTAMP_CTRL`].
    pub const TIMESTAMP_RESET: u16 = 0x0001;

    /// [`SAMPLE_WIDTH`] value for packed 12-bit samples.
    pub const WIDTH_PACKED12: u16 = 0x0002;
    /// [`SAMPLE_WIDTH`] value for 12-bit-in-16 samples.
    pub const WIDTH_I16: u16 = 0x0000;
}

/// `SAMPLE_WIDTH` register value for a link encoding.
pub fn sample_width_code(link: SampleFormat) -> u16 {
    match link.link_format() {
        SampleFormat::Packed12 => reg::WIDTH_PACKED12,
        SampleFormat::Float32 | SampleFormat::I12In16 => reg::WIDTH_I16,
    }
}

/// Set the channel mask and link width, then enable the stream.
#[instrument(level = "debug", skip(port), err)]
pub fn start_streaming<P: ControlPort + ?Sized>(
    port: &P,
    link: SampleFormat,
    channel_mask: u8,
    tx: bool,
) -> Result<()> {
    let ctrl = port.read_register(reg::STREAM_CTRL)? & !(reg::STREAM_EN | reg::TX_EN);
    let enable = if tx {
        reg::STREAM_EN | reg::TX_EN
    } else {
        reg::STREAM_EN
    };
    port.write_register_batch(&[
        (reg::CHANNEL_ENABLE, u16::from(channel_mask)),
        (reg::SAMPLE_WIDTH, sample_width_code(link)),
        (reg::STREAM_CTRL, ctrl | enable),
    ])
}

/// Disable the stream.
#[instrument(level = "debug", skip(port), err)]
pub fn stop_streaming<P: ControlPort + ?Sized>(port: &P) -> Result<()> {
    let ctrl = port.read_register(reg::STREAM_CTRL)?;
    port.write_register(reg::STREAM_CTRL, ctrl & !(reg::STREAM_EN | reg::TX_EN))
}

/// Pulse the timestamp reset strobe.
pub fn reset_timestamp<P: ControlPort + ?Sized>(port: &P) -> Result<()> {
    let ctrl = port.read_register(reg::TIMESTAMP_CTRL)? & !reg::TIMESTAMP_RESET;
    port.write_register_batch(&[
        (reg::TIMESTAMP_CTRL, ctrl | reg::TIMESTAMP_RESET),
        (reg::TIMESTAMP_CTRL, ctrl),
    ])
}

/// [`StreamControl`] that drives the FPGA streaming registers.
pub struct FpgaStreamControl {
    port: Arc<dyn ControlPort>,
}

impl FpgaStreamControl {
    /// Control over `port`.
    pub fn new(port: Arc<dyn ControlPort>) -> Self {
        Self { port }
    }
}

impl fmt::Debug for FpgaStreamControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FpgaStreamControl").finish_non_exhaustive()
    }
}

impl StreamControl for FpgaStreamControl {
    fn apply(&self, state: &StreamingState) -> Result<()> {
        let port = self.port.as_ref();
        match state.link {
            None => {
                debug!("No active streams, disabling FPGA streaming");
                stop_streaming(port)
            }
            Some(link) => {
                if state.reset_timestamp {
                    reset_timestamp(port)?;
                }
                let mask = state.rx_mask | state.tx_mask;
                debug!(mask, ?link, tx = state.tx_mask != 0, "Configuring FPGA streaming");
                start_streaming(port, link, mask, state.tx_mask != 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, CommandPacket, Status};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Register file answering BRDSPI16 reads and writes.
    #[derive(Default)]
    struct Registers {
        map: Mutex<BTreeMap<u16, u16>>,
        writes: Mutex<Vec<(u16, u16)>>,
    }

    impl ControlPort for Registers {
        fn transfer(&self, packet: &mut CommandPacket) -> Result<()> {
            let count = usize::from(packet.block_count);
            match packet.command {
                Command::BoardSpiWrite => {
                    for item in packet.outbound.chunks_exact(4).take(count) {
                        let addr = u16::from_be_bytes([item[0], item[1]]);
                        let value = u16::from_be_bytes([item[2], item[3]]);
                        self.map.lock().insert(addr, value);
                        self.writes.lock().push((addr, value));
                    }
                }
                Command::BoardSpiRead => {
                    let outbound = packet.outbound.clone();
                    for (i, item) in outbound.chunks_exact(2).take(count).enumerate() {
                        let addr = u16::from_be_bytes([item[0], item[1]]);
                        let value = self.map.lock().get(&addr).copied().unwrap_or(0);
                        packet.inbound[i * 4..i * 4 + 2].copy_from_slice(&addr.to_be_bytes());
                        packet.inbound[i * 4 + 2..i * 4 + 4].copy_from_slice(&value.to_be_bytes());
                    }
                }
                _ => {}
            }
            packet.status = Status::Completed;
            Ok(())
        }
    }

    #[test]
    fn test_start_streaming_writes_mask_width_and_enable() {
        let regs = Registers::default();
        regs.map.lock().insert(reg::STREAM_CTRL, 0x0100);
        start_streaming(&regs, SampleFormat::Packed12, 0b11, false).unwrap();

        let map = regs.map.lock();
        assert_eq!(map[&reg::CHANNEL_ENABLE], 0b11);
        assert_eq!(map[&reg::SAMPLE_WIDTH], reg::WIDTH_PACKED12);
        assert_eq!(map[&reg::STREAM_CTRL], 0x0101);
    }

    #[test]
    fn test_stop_keeps_unrelated_bits() {
        let regs = Registers::default();
        regs.map.lock().insert(reg::STREAM_CTRL, 0x0103);
        stop_streaming(&regs).unwrap();
        assert_eq!(regs.map.lock()[&reg::STREAM_CTRL], 0x0100);
    }

    #[test]
    fn test_timestamp_reset_is_a_pulse() {
        let regs = Registers::default();
        reset_timestamp(&regs).unwrap();
        assert_eq!(
            *regs.writes.lock(),
            vec![(reg::TIMESTAMP_CTRL, 1), (reg::TIMESTAMP_CTRL, 0)]
        );
    }

    #[test]
    fn test_control_hook_disables_when_idle() {
        let regs = Arc::new(Registers::default());
        let control = FpgaStreamControl::new(Arc::clone(&regs) as Arc<dyn ControlPort>);
        control
            .apply(&StreamingState {
                link: Some(SampleFormat::I12In16),
                rx_mask: 1,
                tx_mask: 2,
                reset_timestamp: true,
            })
            .unwrap();
        assert_eq!(regs.map.lock()[&reg::STREAM_CTRL], reg::STREAM_EN | reg::TX_EN);
        assert_eq!(regs.map.lock()[&reg::CHANNEL_ENABLE], 0b11);

        control.apply(&StreamingState::default()).unwrap();
        assert_eq!(regs.map.lock()[&reg::STREAM_CTRL], 0);
    }
}
