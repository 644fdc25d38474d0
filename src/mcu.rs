//! Firmware loader for the microcontroller inside the LMS7002M.
//!
//! The MCU exposes three SPI registers: a control register taking the
//! reset and boot mode, a status register, and a data register feeding a
//! 32-byte program FIFO. The image is pumped one FIFO load at a time, each
//! load preceded by a bounded wait for the FIFO to drain.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use crate::error::{LmsError, Result, ResultExt};
use crate::poll::{system_clock, BoundedPoll, CancellationToken, PollStep, SharedClock};
use crate::protocol::{ControlPort, SpiTarget, SPI_WRITE_FLAG};

/// Depth of the MCU program FIFO in bytes.
pub const MCU_FIFO_LEN: usize = 32;

const CONTROL_ADDR: u16 = 0x0002;
const STATUS_ADDR: u16 = 0x0003;
const DATA_ADDR: u16 = 0x0004;

const FIFO_EMPTY: u16 = 1 << 0;
const PROGRAMMED: u16 = 1 << 6;

/// Where the MCU loads its program from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McuMode {
    /// Load the image into SRAM.
    Sram = 1,
    /// Write the image to EEPROM and load it into SRAM.
    EepromAndSram = 2,
    /// Boot from the image already in EEPROM. Takes an empty image.
    BootFromEeprom = 3,
}

impl McuMode {
    fn bits(self) -> u16 {
        self as u16 & 0x3
    }
}

impl fmt::Display for McuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sram => f.write_str("SRAM"),
            Self::EepromAndSram => f.write_str("EEPROM+SRAM"),
            Self::BootFromEeprom => f.write_str("boot from EEPROM"),
        }
    }
}

/// Progress observer: `(bytes_done, bytes_total) -> abort`.
pub type Progress<'a> = &'a mut dyn FnMut(usize, usize) -> bool;

fn spi_write(addr: u16, value: u16) -> u32 {
    SPI_WRITE_FLAG | u32::from(addr) << 16 | u32::from(value)
}

fn notify(progress: &mut Option<Progress<'_>>, done: usize, total: usize) -> bool {
    progress.as_mut().is_some_and(|callback| callback(done, total))
}

/// Pumps firmware images into the MCU.
pub struct McuLoader {
    port: Arc<dyn ControlPort>,
    chip: u8,
    clock: SharedClock,
    poll: BoundedPoll,
}

impl McuLoader {
    /// Loader for the MCU of LMS7002M chip 0, with 100 ms status polls.
    pub fn new(port: Arc<dyn ControlPort>) -> Self {
        Self {
            port,
            chip: 0,
            clock: system_clock(),
            poll: BoundedPoll::new(Duration::from_millis(100)),
        }
    }

    /// Target another LMS7002M on the board.
    pub fn with_chip(mut self, chip: u8) -> Self {
        self.chip = chip;
        self
    }

    /// Use `clock` for status polls.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Budget for each status poll.
    pub fn with_poll(mut self, poll: BoundedPoll) -> Self {
        self.poll = poll;
        self
    }

    /// Program `image` in `mode`.
    ///
    /// `progress` is called once before the first chunk and after every
    /// chunk; returning `true` aborts.
    pub fn program(&self, image: &[u8], mode: McuMode, progress: Option<Progress<'_>>) -> Result<()> {
        self.run(image, mode, &CancellationToken::new(), progress).reported()
    }

    /// Program the image stored at `path`.
    pub fn program_file(
        &self,
        path: impl AsRef<Path>,
        mode: McuMode,
        progress: Option<Progress<'_>>,
    ) -> Result<()> {
        let path = path.as_ref();
        let image = std::fs::read(path).map_err(LmsError::from).reported()?;
        debug!(path = %path.display(), bytes = image.len(), "Loaded MCU image");
        self.program(&image, mode, progress)
    }

    /// Program `image`, also stopping when `cancel` fires.
    ///
    /// The token is checked before every chunk and between status polls.
    /// Nothing is written after cancellation is observed.
    #[instrument(skip(self, image, cancel, progress), fields(bytes = image.len(), chip = self.chip), err)]
    pub fn program_with_cancel(
        &self,
        image: &[u8],
        mode: McuMode,
        cancel: &CancellationToken,
        progress: Option<Progress<'_>>,
    ) -> Result<()> {
        self.run(image, mode, cancel, progress).reported()
    }

    fn run(
        &self,
        image: &[u8],
        mode: McuMode,
        cancel: &CancellationToken,
        mut progress: Option<Progress<'_>>,
    ) -> Result<()> {
        let port = self.port.as_ref();
        let target = SpiTarget::Lms7002m(self.chip);
        let total = image.len();

        port.transact_spi(
            target,
            &[spi_write(CONTROL_ADDR, 0), spi_write(CONTROL_ADDR, mode.bits())],
        )?;
        if notify(&mut progress, 0, total) || cancel.is_cancelled() {
            return Err(LmsError::aborted("MCU programming aborted before the first chunk"));
        }

        let chunks = total.div_ceil(MCU_FIFO_LEN);
        for (index, chunk) in image.chunks(MCU_FIFO_LEN).enumerate() {
            if cancel.is_cancelled() {
                return Err(LmsError::aborted(format!(
                    "MCU programming aborted after {index} of {chunks} chunks"
                )));
            }
            self.wait_status(target, FIFO_EMPTY, "MCU FIFO empty", cancel)?;

            let words: Vec<u32> = (0..MCU_FIFO_LEN)
                .map(|i| spi_write(DATA_ADDR, u16::from(chunk.get(i).copied().unwrap_or(0))))
                .collect();
            port.transact_spi(target, &words)?;

            let done = ((index + 1) * MCU_FIFO_LEN).min(total);
            trace!(chunk = index + 1, chunks, done, "MCU chunk written");
            if notify(&mut progress, done, total) {
                return Err(LmsError::aborted(format!(
                    "MCU programming aborted after {} of {chunks} chunks",
                    index + 1
                )));
            }
        }

        self.wait_status(target, PROGRAMMED, "MCU programmed flag", cancel)?;
        info!(mode = %mode, bytes = total, "MCU programmed");
        Ok(())
    }

    fn wait_status(
        &self,
        target: SpiTarget,
        mask: u16,
        what: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let port = self.port.as_ref();
        self.poll.run(self.clock.as_ref(), Some(cancel), what, || {
            let reply = port.transact_spi(target, &[u32::from(STATUS_ADDR) << 16])?;
            let status = reply.first().map_or(0, |word| *word as u16);
            Ok(if status & mask != 0 {
                PollStep::Ready(())
            } else {
                PollStep::Pending
            })
        })
    }
}

impl fmt::Debug for McuLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McuLoader")
            .field("chip", &self.chip)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::ManualClock;
    use crate::protocol::{Command, CommandPacket, Status};
    use parking_lot::Mutex;

    /// LMS7002M SPI endpoint with a fixed status word.
    struct McuPort {
        status: u16,
        writes: Mutex<Vec<(u16, u16)>>,
    }

    impl ControlPort for McuPort {
        fn transfer(&self, packet: &mut CommandPacket) -> Result<()> {
            let count = usize::from(packet.block_count);
            match packet.command {
                Command::Lms7002Write => {
                    for item in packet.outbound.chunks_exact(4).take(count) {
                        self.writes.lock().push((
                            u16::from_be_bytes([item[0], item[1]]),
                            u16::from_be_bytes([item[2], item[3]]),
                        ));
                    }
                }
                Command::Lms7002Read => {
                    packet.inbound[..2].copy_from_slice(&STATUS_ADDR.to_be_bytes());
                    packet.inbound[2..4].copy_from_slice(&self.status.to_be_bytes());
                }
                _ => {}
            }
            packet.status = Status::Completed;
            Ok(())
        }
    }

    fn loader(status: u16) -> (Arc<McuPort>, McuLoader) {
        let port = Arc::new(McuPort {
            status,
            writes: Mutex::new(Vec::new()),
        });
        let loader = McuLoader::new(Arc::clone(&port) as Arc<dyn ControlPort>)
            .with_clock(Arc::new(ManualClock::new()));
        (port, loader)
    }

    #[test]
    fn test_reset_mode_and_padded_final_chunk() {
        let (port, loader) = loader(FIFO_EMPTY | PROGRAMMED);
        loader.program(&[0xAA; 40], McuMode::EepromAndSram, None).unwrap();

        let writes = port.writes.lock();
        assert_eq!(writes[0], (CONTROL_ADDR, 0));
        assert_eq!(writes[1], (CONTROL_ADDR, 2));
        let data: Vec<u16> = writes[2..].iter().map(|w| w.1).collect();
        assert_eq!(data.len(), 2 * MCU_FIFO_LEN);
        assert!(data[..40].iter().all(|&b| b == 0xAA));
        assert!(data[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fifo_never_empty_times_out() {
        let (port, loader) = loader(0);
        let err = loader.program(&[1; 64], McuMode::Sram, None).unwrap_err();
        assert!(err.is_timeout());
        // Only the reset and mode writes went out.
        assert_eq!(port.writes.lock().len(), 2);
    }

    #[test]
    fn test_not_programmed_times_out() {
        let (_, loader) = loader(FIFO_EMPTY);
        let err = loader.program(&[1; 32], McuMode::Sram, None).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_progress_reports_clamped_totals() {
        let (_, loader) = loader(FIFO_EMPTY | PROGRAMMED);
        let mut seen = Vec::new();
        let mut progress = |done: usize, total: usize| {
            seen.push((done, total));
            false
        };
        loader.program(&[0; 40], McuMode::Sram, Some(&mut progress)).unwrap();
        assert_eq!(seen, vec![(0, 40), (32, 40), (40, 40)]);
    }

    #[test]
    fn test_pre_cancelled_token_writes_nothing_but_reset() {
        let (port, loader) = loader(FIFO_EMPTY | PROGRAMMED);
        let token = CancellationToken::new();
        token.cancel();
        let err = loader
            .program_with_cancel(&[0; 64], McuMode::Sram, &token, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Aborted);
        assert_eq!(port.writes.lock().len(), 2);
    }
}
