//! Multi-queue TUN device creation (Linux).
//!
//! Opens `/dev/net/tun` once per queue against a shared device name, so the
//! kernel fans incoming datagrams out across the queue descriptors. The
//! descriptors are handed straight to
//! [`TunnelProducerConsumer`](crate::tunnel::TunnelProducerConsumer); this
//! module does not read or write them.
//!
//! Creating the device requires `CAP_NET_ADMIN` (in practice, root).
//! Address and route configuration stay with the surrounding scripts.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// An opened multi-queue TUN device.
#[derive(Debug)]
pub struct TunDevice {
    pub name: String,
    pub mtu: usize,
    pub queues: Vec<OwnedFd>,
}

impl TunDevice {
    /// Creates (or attaches to) the named device with `num_queues` queues.
    pub fn open(name: &str, num_queues: usize) -> io::Result<Self> {
        if num_queues == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a tunnel device needs at least one queue",
            ));
        }

        let mut queues = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            queues.push(open_queue(name)?);
        }

        let mtu = query_mtu(name)?;
        tracing::info!(name, mtu, queues = num_queues, "tunnel device ready");

        Ok(Self {
            name: name.to_string(),
            mtu,
            queues,
        })
    }
}

fn ifreq_with_name(name: &str) -> io::Result<libc::ifreq> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "device name contains NUL"))?;
    let bytes = name.as_bytes_with_nul();
    if bytes.len() > ifr.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device name too long",
        ));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn open_queue(name: &str) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::open(b"/dev/net/tun\0".as_ptr().cast(), libc::O_RDWR) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr = ifreq_with_name(name)?;
    ifr.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE;

    if unsafe { libc::ioctl(raw, TUNSETIFF, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn query_mtu(name: &str) -> io::Result<usize> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let _sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr = ifreq_with_name(name)?;
    if unsafe { libc::ioctl(raw, libc::SIOCGIFMTU, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as usize)
}
