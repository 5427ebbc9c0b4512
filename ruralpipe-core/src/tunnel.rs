//! Tunnel-device side of the pipe chain.
//!
//! One reader thread per TUN queue batches outbound datagrams into tunnel
//! frames; frames arriving back from the network are split into datagrams
//! and written across the queues round-robin.
//!
//! Batching uses two timeouts: an empty frame waits up to
//! [`WAIT_FOR_DATA`] for the first datagram, while a frame which already
//! holds one waits only [`WAIT_FOR_FULLER_BATCH`] for more. This amortises
//! per-frame overhead without adding more than a few milliseconds of
//! head-of-line latency once batching has started.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::control::{QueueStats, TunnelStats};
use crate::fd;
use crate::interrupt::Interrupt;
use crate::ip;
use crate::pipe::{PipeError, PipeLinks, TunnelFramePipe};
use crate::proto::{TunnelFrameReader, TunnelFrameWriter, TUNNEL_FRAME_MAX_SIZE};

/// How long an empty frame waits for its first datagram.
const WAIT_FOR_DATA: Duration = Duration::from_secs(5);

/// How long a non-empty frame waits for further datagrams.
const WAIT_FOR_FULLER_BATCH: Duration = Duration::from_millis(5);

/// Backoff before re-delivering a frame when the socket side is not
/// attached yet.
const NOT_READY_RETRY: Duration = Duration::from_secs(5);

/// Consumes datagrams from a set of TUN queue descriptors and produces
/// tunnel frames toward the network, and vice versa.
///
/// Shutdown is explicit through [`shutdown`](Self::shutdown) and also runs
/// on drop; both are idempotent.
pub struct TunnelProducerConsumer {
    state: Arc<TunnelState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

struct QueueCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

struct TunnelState {
    links: PipeLinks,
    queues: Vec<OwnedFd>,
    mtu: usize,
    counters: Vec<QueueCounters>,
    round_robin: AtomicU64,
    seq_num: AtomicU64,
    interrupt: Interrupt,
}

impl TunnelProducerConsumer {
    /// Takes ownership of the per-queue descriptors of the tunnel device
    /// and spawns one reader thread per queue.
    pub fn new(queues: Vec<OwnedFd>, mtu: usize) -> Self {
        let counters = queues
            .iter()
            .map(|_| QueueCounters {
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
            })
            .collect();

        let state = Arc::new(TunnelState {
            links: PipeLinks::new("tunnel"),
            queues,
            mtu,
            counters,
            round_robin: AtomicU64::new(0),
            seq_num: AtomicU64::new(0),
            interrupt: Interrupt::new(),
        });

        let threads = (0..state.queues.len())
            .map(|queue| {
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name(format!("tun-queue-{queue}"))
                    .spawn(move || {
                        tracing::info!(queue, "tunnel queue thread starting");
                        let err = state.receive_from_tunnel_loop(queue);
                        tracing::info!(queue, error = %err, "tunnel queue thread finished");
                    })
                    .expect("failed to spawn tunnel queue thread")
            })
            .collect();

        tracing::info!("tunnel producer/consumer started");
        Self {
            state,
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The chain stage to attach the network side in front of.
    pub fn pipe(&self) -> Arc<dyn TunnelFramePipe> {
        Arc::clone(&self.state) as Arc<dyn TunnelFramePipe>
    }

    pub fn queue_count(&self) -> usize {
        self.state.queues.len()
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            queues: self
                .state
                .counters
                .iter()
                .map(|counters| QueueStats {
                    bytes_in: counters.bytes_in.load(Ordering::Relaxed),
                    bytes_out: counters.bytes_out.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Interrupts and joins the queue threads.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state.interrupt.raise();
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        tracing::info!("tunnel producer/consumer finished");
    }
}

impl Drop for TunnelProducerConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TunnelState {
    /// Runs on one thread per tunnel queue until interrupted or the queue
    /// descriptor fails.
    fn receive_from_tunnel_loop(&self, queue: usize) -> PipeError {
        let queue_fd = self.queues[queue].as_fd();
        if let Err(err) = fd::set_nonblocking(queue_fd) {
            return err.into();
        }

        let mut frame_buf = [0u8; TUNNEL_FRAME_MAX_SIZE];
        // One datagram of scratch so a datagram which does not fit into the
        // frame being built is carried over into the next frame.
        let mut scratch = vec![0u8; self.mtu];
        let mut scratch_len = 0usize;

        loop {
            if let Err(err) =
                self.pump_one_frame(queue, &mut frame_buf, &mut scratch, &mut scratch_len)
            {
                return err;
            }
        }
    }

    /// Batches datagrams into one frame, closes it and delivers it toward
    /// the network.
    fn pump_one_frame(
        &self,
        queue: usize,
        frame_buf: &mut [u8; TUNNEL_FRAME_MAX_SIZE],
        scratch: &mut [u8],
        scratch_len: &mut usize,
    ) -> Result<(), PipeError> {
        let queue_fd = self.queues[queue].as_fd();
        let mut writer = TunnelFrameWriter::new(&mut frame_buf[..])?;
        let mut num_datagrams = 0u32;

        loop {
            self.interrupt.check()?;

            if *scratch_len == 0 {
                let timeout = if num_datagrams > 0 {
                    WAIT_FOR_FULLER_BATCH
                } else {
                    WAIT_FOR_DATA
                };
                tracing::trace!(queue, batched = num_datagrams, "waiting for datagrams");

                if !fd::wait_readable(queue_fd, Some(timeout), &self.interrupt)? {
                    if num_datagrams > 0 {
                        // Nothing further arrived; ship what we have.
                        break;
                    }
                    continue;
                }

                match fd::read(queue_fd, scratch) {
                    Ok(0) => {
                        return Err(PipeError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "tunnel queue closed",
                        )))
                    }
                    Ok(n) => *scratch_len = n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            if *scratch_len > writer.remaining_bytes() {
                if num_datagrams == 0 {
                    // Cannot ever fit; an MTU that large is a configuration
                    // problem, not a reason to stall the queue.
                    tracing::warn!(
                        queue,
                        bytes = *scratch_len,
                        "dropping datagram larger than the frame payload capacity"
                    );
                    *scratch_len = 0;
                    continue;
                }
                // Frame is full; the datagram stays in scratch for the next
                // frame.
                break;
            }

            tracing::trace!(
                queue,
                bytes = *scratch_len,
                datagram = %ip::describe(&scratch[..*scratch_len]),
                "read datagram from tunnel queue"
            );
            writer.append(&scratch[..*scratch_len])?;
            self.counters[queue]
                .bytes_in
                .fetch_add(*scratch_len as u64, Ordering::Relaxed);
            *scratch_len = 0;
            num_datagrams += 1;
        }

        writer.set_seq_num(self.seq_num.fetch_add(1, Ordering::Relaxed));
        let size = writer.close();
        let frame = &mut frame_buf[..size];

        loop {
            self.interrupt.check()?;
            match self.links.invoke_next(frame) {
                Ok(()) => break,
                Err(PipeError::NotYetReady) => {
                    tracing::trace!(queue, "socket side not yet ready; retrying");
                    if self.interrupt.wait_for(NOT_READY_RETRY) {
                        return Err(PipeError::Interrupted);
                    }
                }
                Err(PipeError::Interrupted) => {
                    // The socket side is shutting down, not us. The frame is
                    // lost; keep producing.
                    tracing::debug!(queue, "frame delivery interrupted downstream; dropping");
                    break;
                }
                Err(err) => {
                    tracing::warn!(queue, error = %err, "failed to deliver frame; dropping");
                    break;
                }
            }
        }

        Ok(())
    }
}

impl TunnelFramePipe for TunnelState {
    fn links(&self) -> &PipeLinks {
        &self.links
    }

    fn on_frame_from_prev(&self, _frame: &mut [u8]) -> Result<(), PipeError> {
        unreachable!("the tunnel producer/consumer must be the first stage in the chain")
    }

    fn on_frame_from_next(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        let mut reader = TunnelFrameReader::new(frame)?;
        while reader.next()? {
            let datagram = reader.datagram();
            let queue =
                (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize) % self.queues.len();
            let queue_fd = self.queues[queue].as_fd();

            loop {
                self.interrupt.check()?;
                match fd::write(queue_fd, datagram) {
                    Ok(n) => {
                        self.counters[queue]
                            .bytes_out
                            .fetch_add(n as u64, Ordering::Relaxed);
                        tracing::trace!(
                            queue,
                            bytes = n,
                            datagram = %ip::describe(datagram),
                            "wrote datagram to tunnel queue"
                        );
                        break;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        fd::wait_writable(queue_fd, &self.interrupt)?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    use super::*;
    use crate::pipe::{attach, testing::RecordingPipe};
    use crate::proto::TunnelFrameWriter;

    const TEST_MTU: usize = 1500;

    fn datagram_queue() -> (OwnedFd, UnixDatagram) {
        let (queue, peer) = UnixDatagram::pair().expect("datagram pair");
        peer.set_read_timeout(Some(Duration::from_secs(10)))
            .expect("timeout");
        (queue.into(), peer)
    }

    #[test]
    fn test_single_datagram_becomes_one_frame() {
        let (queue, peer) = datagram_queue();
        let tunnel = TunnelProducerConsumer::new(vec![queue], TEST_MTU);
        let recorder = RecordingPipe::new();
        attach(recorder.clone(), tunnel.pipe());

        peer.send(b"DG1.1").expect("send datagram");

        let frames = recorder.wait_for_frames(1, Duration::from_secs(10));
        let mut reader = TunnelFrameReader::new(&frames[0]).expect("reader");
        assert_eq!(reader.header().seq_num, 0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.datagram(), b"DG1.1");
        assert!(!reader.next().unwrap());

        tunnel.shutdown();
    }

    #[test]
    fn test_datagrams_are_batched_into_one_frame() {
        let (queue, peer) = datagram_queue();

        // Both datagrams are queued before the reader thread starts, so they
        // land in the same frame under one sequence number.
        peer.send(b"A").expect("send");
        peer.send(b"B").expect("send");

        let tunnel = TunnelProducerConsumer::new(vec![queue], TEST_MTU);
        let recorder = RecordingPipe::new();
        attach(recorder.clone(), tunnel.pipe());

        let frames = recorder.wait_for_frames(1, Duration::from_secs(10));
        assert_eq!(frames.len(), 1);

        let mut reader = TunnelFrameReader::new(&frames[0]).expect("reader");
        assert_eq!(reader.header().seq_num, 0);
        assert!(reader.next().unwrap());
        assert_eq!(reader.datagram(), b"A");
        assert!(reader.next().unwrap());
        assert_eq!(reader.datagram(), b"B");
        assert!(!reader.next().unwrap());

        tunnel.shutdown();
    }

    #[test]
    fn test_frames_are_debatched_round_robin() {
        let (queue_a, peer_a) = datagram_queue();
        let (queue_b, peer_b) = datagram_queue();
        let tunnel = TunnelProducerConsumer::new(vec![queue_a, queue_b], TEST_MTU);

        let mut buf = [0u8; 1024];
        let mut writer = TunnelFrameWriter::new(&mut buf).expect("writer");
        for record in [b"r0", b"r1", b"r2", b"r3"] {
            writer.append(record).expect("append");
        }
        let size = writer.close();

        tunnel
            .pipe()
            .on_frame_from_next(&mut buf[..size])
            .expect("deliver");

        let mut recv = [0u8; 64];
        for expected in [b"r0", b"r2"] {
            let n = peer_a.recv(&mut recv).expect("queue a");
            assert_eq!(&recv[..n], expected.as_slice());
        }
        for expected in [b"r1", b"r3"] {
            let n = peer_b.recv(&mut recv).expect("queue b");
            assert_eq!(&recv[..n], expected.as_slice());
        }

        let stats = tunnel.stats();
        assert_eq!(stats.queues.len(), 2);
        assert_eq!(stats.queues[0].bytes_out, 4);
        assert_eq!(stats.queues[1].bytes_out, 4);

        tunnel.shutdown();
    }

    #[test]
    fn test_bytes_in_accounting() {
        let (queue, peer) = datagram_queue();
        let tunnel = TunnelProducerConsumer::new(vec![queue], TEST_MTU);
        let recorder = RecordingPipe::new();
        attach(recorder.clone(), tunnel.pipe());

        peer.send(b"12345678").expect("send");
        recorder.wait_for_frames(1, Duration::from_secs(10));

        assert_eq!(tunnel.stats().queues[0].bytes_in, 8);
        tunnel.shutdown();
    }
}
