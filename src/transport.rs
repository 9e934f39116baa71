//! Serial transport for the SSP line.
//!
//! The device node is opened at 9600 8N1 with no flow control. Reads are
//! blocking with a caller-supplied timeout, writes block until the kernel
//! has drained the output buffer.

use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;

use serialport::TTYPort;

use crate::error::{Error, Result};

/// Fixed SSP line speed (bps).
pub const BAUD_RATE: u32 = 9_600;

/// Byte-stream access to the serial line.
///
/// The protocol layer is written against this trait so tests can run the
/// full framing/session stack over a scripted in-memory link.
pub trait SerialLink {
    /// Writes the whole buffer and drains it to the device.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fills `buf` completely or fails with [Error::ReadTimeout].
    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;
}

/// A [SerialLink] over a POSIX character device.
pub struct TtyLink {
    port: TTYPort,
}

impl TtyLink {
    /// Opens `path` as an SSP serial line.
    ///
    /// The path must exist and be a character device; anything else is
    /// rejected before the line discipline is touched.
    pub fn open(path: &str) -> Result<Self> {
        probe(path)?;

        let port = serialport::new(path, BAUD_RATE)
            .flow_control(serialport::FlowControl::None)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(1_000))
            .open_native()
            .map_err(|source| Error::OpenFailed {
                path: path.into(),
                source,
            })?;

        Ok(Self { port })
    }
}

impl SerialLink for TtyLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::ReadTimeout);
        }

        use serialport::SerialPort;
        self.port.set_timeout(timeout).map_err(std::io::Error::from)?;

        match self.port.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Err(Error::ReadTimeout),
            Err(err) => Err(err.into()),
        }
    }
}

// The port itself closes on drop; this only exists so callers can name the
// operation at shutdown.
impl Drop for TtyLink {
    fn drop(&mut self) {
        log::debug!("serial line closed");
    }
}

fn probe(path: &str) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::DeviceNotFound(path.into())
        } else {
            Error::Io(err)
        }
    })?;

    if !meta.file_type().is_char_device() {
        return Err(Error::NotACharacterDevice(path.into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_device_not_found() {
        let err = probe("/dev/no-such-acm-device").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn regular_file_is_not_a_character_device() {
        let path = std::env::temp_dir().join("payoutd-transport-probe");
        std::fs::write(&path, b"x").unwrap();

        let err = probe(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::NotACharacterDevice(_)));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn char_device_passes_probe() {
        probe("/dev/null").unwrap();
    }
}
