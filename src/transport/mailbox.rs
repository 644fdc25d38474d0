//! Memory-mapped control mailbox.
//!
//! Some boards expose their control endpoint as a register window (PCIe BAR
//! or UIO region) instead of a byte pipe. The window holds one request slot
//! and one response slot:
//!
//! ```text
//! offset 0                  request_len: u32 LE   (0 = slot free)
//! offset 4                  request bytes [capacity]
//! offset 4 + capacity       response_len: u32 LE (0 = nothing to read)
//! offset 8 + capacity       response bytes [capacity]
//! ```
//!
//! The host fills the request bytes, then publishes the length. The board
//! clears the length once consumed and publishes a response length. The host
//! clears the response length after reading it completely.
//!
//! This variant has no sample path; the data channel reports `NotSupported`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use super::ByteStream;

/// Geometry of a mailbox window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLayout {
    /// Byte offset of the window inside the mapped file.
    pub base: u64,
    /// Size of each of the request and response slots.
    pub capacity: usize,
}

impl MailboxLayout {
    /// Window at `base` with `capacity`-byte slots.
    pub fn new(base: u64, capacity: usize) -> Self {
        Self { base, capacity }
    }

    /// Offset of the request length word, relative to the window.
    pub fn request_len_offset(&self) -> usize {
        0
    }

    /// Offset of the request bytes.
    pub fn request_offset(&self) -> usize {
        4
    }

    /// Offset of the response length word.
    pub fn response_len_offset(&self) -> usize {
        4 + self.capacity
    }

    /// Offset of the response bytes.
    pub fn response_offset(&self) -> usize {
        8 + self.capacity
    }

    /// Total mapped length.
    pub fn total_len(&self) -> usize {
        8 + 2 * self.capacity
    }
}

impl Default for MailboxLayout {
    fn default() -> Self {
        Self::new(0, 64)
    }
}

struct Mapped {
    map: MmapMut,
    // Progress through the current response.
    read_offset: usize,
    _file: File,
}

/// Control channel backed by a memory-mapped mailbox window.
pub struct MappedMailbox {
    name: String,
    path: PathBuf,
    layout: MailboxLayout,
    mapped: Mutex<Option<Mapped>>,
}

impl MappedMailbox {
    /// Mailbox in the file at `path` (for example `/dev/uio0`).
    pub fn new(path: impl Into<PathBuf>, layout: MailboxLayout) -> Self {
        let path = path.into();
        Self {
            name: format!("mailbox:{}", path.display()),
            path,
            layout,
            mapped: Mutex::new(None),
        }
    }

    /// Window geometry.
    pub fn layout(&self) -> MailboxLayout {
        self.layout
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

impl ByteStream for MappedMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<()> {
        let mut mapped = self.mapped.lock();
        if mapped.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let needed = self.layout.base + self.layout.total_len() as u64;
        if file.metadata()?.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mailbox window needs {needed} bytes"),
            ));
        }
        // SAFETY: the file length was checked above; the board is the only
        // other party writing to the window and all accesses go through the
        // length-word handshake.
        #[allow(unsafe_code)]
        let map = unsafe {
            MmapOptions::new()
                .offset(self.layout.base)
                .len(self.layout.total_len())
                .map_mut(&file)?
        };
        *mapped = Some(Mapped {
            map,
            read_offset: 0,
            _file: file,
        });
        Ok(())
    }

    fn close(&self) {
        self.mapped.lock().take();
    }

    fn is_open(&self) -> bool {
        self.mapped.lock().is_some()
    }

    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.mapped.lock();
        let mapped = guard.as_mut().ok_or_else(closed)?;
        let layout = self.layout;
        if read_u32(&mapped.map, layout.request_len_offset()) != 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(layout.capacity);
        let start = layout.request_offset();
        mapped.map[start..start + n].copy_from_slice(&buf[..n]);
        fence(Ordering::Release);
        write_u32(&mut mapped.map, layout.request_len_offset(), n as u32);
        Ok(n)
    }

    fn read_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.mapped.lock();
        let mapped = guard.as_mut().ok_or_else(closed)?;
        let layout = self.layout;
        let len = (read_u32(&mapped.map, layout.response_len_offset()) as usize).min(layout.capacity);
        if len == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        fence(Ordering::Acquire);
        let remaining = len.saturating_sub(mapped.read_offset);
        let n = buf.len().min(remaining);
        let start = layout.response_offset() + mapped.read_offset;
        buf[..n].copy_from_slice(&mapped.map[start..start + n]);
        mapped.read_offset += n;
        if mapped.read_offset >= len {
            mapped.read_offset = 0;
            write_u32(&mut mapped.map, layout.response_len_offset(), 0);
        }
        Ok(n)
    }

    fn flush(&self) -> io::Result<()> {
        let guard = self.mapped.lock();
        match guard.as_ref() {
            Some(mapped) => mapped.map.flush_async(),
            None => Err(closed()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "mailbox not mapped")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_file(layout: MailboxLayout) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bar0");
        let file = File::create(&path).unwrap();
        file.set_len(layout.base + layout.total_len() as u64).unwrap();
        (dir, path)
    }

    /// Map the window a second time, playing the board's side.
    fn board_view(path: &PathBuf, layout: MailboxLayout) -> MmapMut {
        let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        unsafe {
            MmapOptions::new()
                .offset(layout.base)
                .len(layout.total_len())
                .map_mut(&file)
                .unwrap()
        }
    }

    #[test]
    fn test_request_response_handshake() {
        let layout = MailboxLayout::new(0, 64);
        let (_dir, path) = window_file(layout);
        let mailbox = MappedMailbox::new(&path, layout);
        mailbox.open().unwrap();

        assert_eq!(mailbox.write_once(&[0xAB; 64]).unwrap(), 64);
        // Slot is occupied until the board consumes it.
        assert_eq!(
            mailbox.write_once(&[0; 64]).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let mut board = board_view(&path, layout);
        assert_eq!(read_u32(&board, layout.request_len_offset()), 64);
        assert_eq!(board[layout.request_offset()], 0xAB);
        write_u32(&mut board, layout.request_len_offset(), 0);
        let resp = layout.response_offset();
        board[resp..resp + 64].copy_from_slice(&[0x01; 64]);
        write_u32(&mut board, layout.response_len_offset(), 64);

        let mut first = [0u8; 40];
        let mut second = [0u8; 40];
        assert_eq!(mailbox.read_once(&mut first).unwrap(), 40);
        assert_eq!(mailbox.read_once(&mut second).unwrap(), 24);
        assert_eq!(read_u32(&board, layout.response_len_offset()), 0);
        assert_eq!(
            mailbox.read_once(&mut second).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_short_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        File::create(&path).unwrap().set_len(16).unwrap();
        let mailbox = MappedMailbox::new(&path, MailboxLayout::default());
        assert_eq!(mailbox.open().unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}
