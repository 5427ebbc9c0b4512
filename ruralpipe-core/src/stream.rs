//! Blocking tunnel-frame I/O over one byte-stream descriptor.
//!
//! A [`TunnelFrameStream`] owns a connected socket (or any byte stream) and
//! moves exactly one frame per call: `send` writes the full frame, blocking
//! on the kernel buffer when necessary; `receive` reads the six header-info
//! bytes, validates them, then reads the remainder of the frame. Partial
//! reads and writes are coalesced by looping; end of stream is a terminal
//! error which ends the owning receive task.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;

use crate::fd;
use crate::interrupt::Interrupt;
use crate::pipe::PipeError;
use crate::proto::{self, FRAME_HEADER_INFO_SIZE, TUNNEL_FRAME_MAX_SIZE};

pub struct TunnelFrameStream {
    fd: OwnedFd,
    interrupt: Arc<Interrupt>,
}

impl TunnelFrameStream {
    /// Takes ownership of an established descriptor and switches it to
    /// non-blocking mode.
    pub fn new(fd: OwnedFd, interrupt: Arc<Interrupt>) -> io::Result<Self> {
        fd::set_nonblocking(fd.as_fd())?;
        Ok(Self { fd, interrupt })
    }

    /// Sends one closed frame, blocking until every byte is written.
    pub fn send(&self, frame: &[u8]) -> Result<(), PipeError> {
        let mut written = 0;
        while written < frame.len() {
            self.interrupt.check()?;
            match fd::write(self.fd.as_fd(), &frame[written..]) {
                Ok(0) => {
                    return Err(PipeError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream closed while sending a frame",
                    )))
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    fd::wait_writable(self.fd.as_fd(), &self.interrupt)?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::trace!(fd = self.fd.as_raw_fd(), bytes = frame.len(), "sent frame");
        Ok(())
    }

    /// Receives exactly one frame into `buf` and returns its length.
    ///
    /// `buf` must hold at least [`TUNNEL_FRAME_MAX_SIZE`] bytes; keeping one
    /// such buffer per stream bounds memory without per-frame allocation.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        debug_assert!(buf.len() >= TUNNEL_FRAME_MAX_SIZE);

        self.read_exact(&mut buf[..FRAME_HEADER_INFO_SIZE])?;
        let total = proto::check_header_info(&buf[..FRAME_HEADER_INFO_SIZE])?;
        tracing::trace!(
            fd = self.fd.as_raw_fd(),
            bytes = total,
            "received frame header"
        );

        self.read_exact(&mut buf[FRAME_HEADER_INFO_SIZE..total])?;
        Ok(total)
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), PipeError> {
        let mut received = 0;
        while received < buf.len() {
            self.interrupt.check()?;
            match fd::read(self.fd.as_fd(), &mut buf[received..]) {
                Ok(0) => {
                    return Err(PipeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed by peer",
                    )))
                }
                Ok(n) => received += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    fd::wait_readable(self.fd.as_fd(), None, &self.interrupt)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TunnelFrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelFrameStream")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
