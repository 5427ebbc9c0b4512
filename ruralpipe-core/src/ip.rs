//! Minimal IPv4 header peek for trace-level log lines.
//!
//! The data plane never routes on packet contents; this exists purely so
//! that datagram-level traces are readable.

use std::fmt;
use std::net::Ipv4Addr;

/// Renders a one-line description of a datagram for logging.
pub fn describe(datagram: &[u8]) -> DatagramDescription<'_> {
    DatagramDescription(datagram)
}

pub struct DatagramDescription<'a>(&'a [u8]);

impl fmt::Display for DatagramDescription<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datagram = self.0;
        if datagram.len() < 20 || datagram[0] >> 4 != 4 {
            return write!(f, "non-IPv4 datagram of {} bytes", datagram.len());
        }

        let tot_len = u16::from_be_bytes([datagram[2], datagram[3]]);
        let id = u16::from_be_bytes([datagram[4], datagram[5]]);
        let protocol = datagram[9];
        let src = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
        let dst = Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]);

        match protocol {
            1 => write!(f, "ICMP")?,
            6 => write!(f, "TCP")?,
            17 => write!(f, "UDP")?,
            other => write!(f, "proto {other}")?,
        }
        write!(f, " {src} -> {dst} id={id} len={tot_len}")
    }
}
