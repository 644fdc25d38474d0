//! Device-file backend (Xillybus PCIe layout).
//!
//! Each channel is a pair of character devices: one opened write-only, one
//! read-only. On Unix both are opened with `O_NONBLOCK` so a single attempt
//! never stalls the caller; the retry policy in [`super::Channel`] supplies
//! the deadline.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::warn;

use super::ByteStream;

/// Paths of the four device nodes used by a device-file transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilePaths {
    /// Host-to-board control pipe.
    pub control_write: PathBuf,
    /// Board-to-host control pipe.
    pub control_read: PathBuf,
    /// Host-to-board sample pipe.
    pub data_write: PathBuf,
    /// Board-to-host sample pipe.
    pub data_read: PathBuf,
}

impl DeviceFilePaths {
    /// Standard Xillybus node names under `dir`.
    pub fn xillybus(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            control_write: dir.join("xillybus_write_8"),
            control_read: dir.join("xillybus_read_8"),
            data_write: dir.join("xillybus_write_32"),
            data_read: dir.join("xillybus_read_32"),
        }
    }

    /// Whether both control nodes exist.
    pub fn control_present(&self) -> bool {
        self.control_write.exists() && self.control_read.exists()
    }
}

struct OpenFiles {
    write: File,
    read: File,
}

/// A write node and a read node used as one duplex channel.
pub struct DeviceFileStream {
    name: String,
    write_path: PathBuf,
    read_path: PathBuf,
    flush_after_write: bool,
    files: RwLock<Option<OpenFiles>>,
}

impl DeviceFileStream {
    /// Channel over `write_path` (host to board) and `read_path` (board to host).
    pub fn new(write_path: impl Into<PathBuf>, read_path: impl Into<PathBuf>) -> Self {
        let write_path = write_path.into();
        let read_path = read_path.into();
        Self {
            name: format!("file:{}", write_path.display()),
            write_path,
            read_path,
            flush_after_write: false,
            files: RwLock::new(None),
        }
    }

    /// Issue a zero-length write after each complete write. Xillybus
    /// asynchronous pipes hold data until flushed this way.
    pub fn with_write_flush(mut self, enabled: bool) -> Self {
        self.flush_after_write = enabled;
        self
    }

    fn open_options(write: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        if write {
            options.write(true);
        } else {
            options.read(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY);
        }
        options
    }
}

impl ByteStream for DeviceFileStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<()> {
        let mut files = self.files.write();
        if files.is_some() {
            return Ok(());
        }
        let write = Self::open_options(true).open(&self.write_path)?;
        let read = Self::open_options(false).open(&self.read_path)?;
        *files = Some(OpenFiles { write, read });
        Ok(())
    }

    fn close(&self) {
        // Dropping the files closes both descriptors; waits for in-flight attempts.
        self.files.write().take();
    }

    fn is_open(&self) -> bool {
        self.files.read().is_some()
    }

    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        let files = self.files.read();
        let files = files.as_ref().ok_or_else(closed)?;
        (&files.write).write(buf)
    }

    fn read_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        let files = self.files.read();
        let files = files.as_ref().ok_or_else(closed)?;
        (&files.read).read(buf)
    }

    fn flush(&self) -> io::Result<()> {
        if !self.flush_after_write {
            return Ok(());
        }
        let files = self.files.read();
        let files = files.as_ref().ok_or_else(closed)?;
        zero_length_write(&files.write)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device file closed")
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn zero_length_write(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: a zero-length write never dereferences the buffer pointer and
    // the descriptor stays valid while `file` is borrowed.
    let rc = unsafe { libc::write(file.as_raw_fd(), std::ptr::null(), 0) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        warn!(error = %err, "Zero-length flush write failed");
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn zero_length_write(mut file: &File) -> io::Result<()> {
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xillybus_paths() {
        let paths = DeviceFilePaths::xillybus("/dev");
        assert_eq!(paths.control_write, PathBuf::from("/dev/xillybus_write_8"));
        assert_eq!(paths.data_read, PathBuf::from("/dev/xillybus_read_32"));
    }

    #[test]
    fn test_open_missing_node_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stream = DeviceFileStream::new(dir.path().join("w"), dir.path().join("r"));
        let err = stream.open().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!stream.is_open());
    }

    #[test]
    fn test_regular_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        std::fs::write(&path, b"").unwrap();

        let stream = DeviceFileStream::new(&path, &path).with_write_flush(true);
        stream.open().unwrap();
        assert_eq!(stream.write_once(b"abcd").unwrap(), 4);
        stream.flush().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(stream.read_once(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        stream.close();
        assert!(!stream.is_open());
        assert_eq!(
            stream.write_once(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
