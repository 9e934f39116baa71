//! Shared test double for the serial line.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::SerialLink;

/// Scripted in-memory serial link.
///
/// Writes are recorded frame-by-frame; reads drain a byte stream assembled
/// from the pushed replies. An exhausted stream reads as a timeout, which
/// is exactly what a silent device looks like.
#[derive(Default)]
pub struct MockLink {
    pub written: Vec<Vec<u8>>,
    stream: VecDeque<u8>,
}

impl MockLink {
    pub fn push_reply(&mut self, bytes: Vec<u8>) {
        self.stream.extend(bytes);
    }
}

impl SerialLink for MockLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
        for slot in buf.iter_mut() {
            *slot = self.stream.pop_front().ok_or(Error::ReadTimeout)?;
        }
        Ok(())
    }
}
