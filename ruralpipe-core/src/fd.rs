//! File descriptor plumbing for the data-plane loops.
//!
//! Thin safe wrappers over the raw `poll`/`read`/`write`/`fcntl` calls the
//! tunnel queues and socket streams are driven through. Polls are sliced so
//! a raised [`Interrupt`] is observed promptly even inside the long waits.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use crate::interrupt::Interrupt;
use crate::pipe::PipeError;

/// Upper bound on a single poll(2) call so interrupts are observed quickly.
const POLL_SLICE: Duration = Duration::from_millis(100);

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn poll_once(fd: BorrowedFd<'_>, events: libc::c_short, timeout_ms: libc::c_int) -> io::Result<libc::c_short> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };

    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(if rc == 0 { 0 } else { pollfd.revents });
    }
}

fn wait(
    fd: BorrowedFd<'_>,
    events: libc::c_short,
    timeout: Option<Duration>,
    interrupt: &Interrupt,
) -> Result<bool, PipeError> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        interrupt.check()?;

        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                (deadline - now).min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };
        let slice_ms = (slice.as_millis() as libc::c_int).max(1);

        // Error and hangup conditions count as ready; the following read or
        // write surfaces them.
        if poll_once(fd, events, slice_ms)? != 0 {
            return Ok(true);
        }
    }
}

/// Waits until the descriptor is readable. Returns false on timeout.
pub fn wait_readable(
    fd: BorrowedFd<'_>,
    timeout: Option<Duration>,
    interrupt: &Interrupt,
) -> Result<bool, PipeError> {
    wait(fd, libc::POLLIN, timeout, interrupt)
}

/// Waits until the descriptor is writable.
pub fn wait_writable(fd: BorrowedFd<'_>, interrupt: &Interrupt) -> Result<(), PipeError> {
    wait(fd, libc::POLLOUT, None, interrupt)?;
    Ok(())
}

pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

pub fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

pub fn is_socket(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
}

fn setsockopt_int(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_send_buffer_size(fd: BorrowedFd<'_>, bytes: usize) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, bytes as libc::c_int)
}

pub fn set_tcp_nodelay(fd: BorrowedFd<'_>) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}
