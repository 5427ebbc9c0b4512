//! Network side of the pipe chain.
//!
//! A [`SocketProducerConsumer`] owns the table of sessions, one receive
//! thread per registered socket, and the compressing and signing stages it
//! keeps attached in front of itself for the lifetime of the object.
//!
//! Every registered socket first runs the initial exchange: the client
//! announces a randomly generated session identifier and its identity
//! string; the server echoes the identifier back with its own identity.
//! Only then does the socket become a stream of the session and start
//! carrying data frames.
//!
//! Outbound frames pick the first stream of the session which is not
//! currently sending. When every stream is busy the sender waits on the
//! session condition variable for one to free up, which bounds the wait to
//! the fastest in-flight completion. Sequence numbers are taken from the
//! per-session counter in the same critical section in which the stream is
//! secured, so the per-session order observed on any one stream is strictly
//! increasing.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::compress::CompressingPipe;
use crate::control::{SessionStats, SocketStats, StreamStats};
use crate::fd;
use crate::interrupt::Interrupt;
use crate::pipe::{self, PipeError, PipeLinks, TunnelFramePipe};
use crate::proto::{
    self, SessionId, TunnelFrameReader, TunnelFrameWriter, CLIENT_IDENTIFIER, IDENTIFIER_SIZE,
    SERVER_IDENTIFIER, TUNNEL_FRAME_MAX_SIZE,
};
use crate::sign::SigningPipe;
use crate::stream::TunnelFrameStream;

/// Send buffer sized for two frames in flight per stream.
const SEND_BUFFER_SIZE: usize = 2 * TUNNEL_FRAME_MAX_SIZE;

/// Handles the client/server socket communication on the network end of the
/// chain.
///
/// Constructed as a client when `client_session_id` is given and as a server
/// otherwise. Shutdown is explicit through [`shutdown`](Self::shutdown) and
/// also runs on drop.
pub struct SocketProducerConsumer {
    state: Arc<SocketState>,
    compressor: Arc<CompressingPipe>,
    signer: Arc<SigningPipe>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

struct SocketState {
    links: PipeLinks,
    client_session_id: Option<SessionId>,
    interrupt: Arc<Interrupt>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_tracker_id: AtomicU64,
}

struct Session {
    session_id: SessionId,
    inner: Mutex<SessionInner>,
    stream_freed: Condvar,
}

struct SessionInner {
    next_seq_num: u64,
    streams: Vec<StreamTracker>,
}

struct StreamTracker {
    id: u64,
    stream: Arc<TunnelFrameStream>,
    in_use: bool,
    bytes_sending: u64,
    bytes_sent: u64,
}

struct InitialExchange {
    identifier: String,
    session_id: SessionId,
}

impl Session {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            inner: Mutex::new(SessionInner {
                // Sequence 0 belongs to the identity frames.
                next_seq_num: 1,
                streams: Vec::new(),
            }),
            stream_freed: Condvar::new(),
        }
    }
}

impl SocketProducerConsumer {
    /// Creates the stage and attaches it, behind its compressing and
    /// signing stages, in front of `prev`.
    pub fn new(client_session_id: Option<SessionId>, prev: Arc<dyn TunnelFramePipe>) -> Self {
        Self::assemble(client_session_id, prev, SigningPipe::passthrough())
    }

    /// Same as [`new`](Self::new) with the keyed signing profile enabled.
    pub fn with_signing_key(
        client_session_id: Option<SessionId>,
        prev: Arc<dyn TunnelFramePipe>,
        key: &[u8],
    ) -> Self {
        Self::assemble(client_session_id, prev, SigningPipe::with_key(key))
    }

    fn assemble(
        client_session_id: Option<SessionId>,
        prev: Arc<dyn TunnelFramePipe>,
        signer: Arc<SigningPipe>,
    ) -> Self {
        let compressor = CompressingPipe::attached(prev);
        pipe::attach(signer.clone(), compressor.clone());

        let state = Arc::new(SocketState {
            links: PipeLinks::new("socket"),
            client_session_id,
            interrupt: Arc::new(Interrupt::new()),
            sessions: RwLock::new(HashMap::new()),
            next_tracker_id: AtomicU64::new(0),
        });
        pipe::attach(state.clone(), signer.clone());

        tracing::info!(
            role = if state.client_session_id.is_some() {
                "client"
            } else {
                "server"
            },
            "socket producer/consumer started"
        );

        Self {
            state,
            compressor,
            signer,
            threads: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registers an established, connected descriptor and spawns its
    /// receive thread.
    ///
    /// Sockets get a bounded send buffer and Nagle disabled; a descriptor
    /// which is not a socket still works (useful against fifos) but is
    /// logged.
    pub fn add_socket(&self, socket: OwnedFd) -> io::Result<()> {
        match fd::is_socket(socket.as_fd())? {
            true => {
                if let Err(err) = fd::set_send_buffer_size(socket.as_fd(), SEND_BUFFER_SIZE) {
                    tracing::debug!(error = %err, "could not bound the socket send buffer");
                }
                if let Err(err) = fd::set_tcp_nodelay(socket.as_fd()) {
                    tracing::debug!(error = %err, "could not disable Nagle on the socket");
                }
            }
            false => {
                tracing::warn!(fd = socket.as_raw_fd(), "file descriptor is not a socket");
            }
        }

        tracing::info!(fd = socket.as_raw_fd(), "starting receive thread for stream");

        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name(format!("stream-{}", socket.as_raw_fd()))
            .spawn(move || state.run_stream(socket))?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }

    pub fn stats(&self) -> SocketStats {
        let sessions = self.state.sessions.read().unwrap();
        SocketStats {
            sessions: sessions
                .values()
                .map(|session| {
                    let inner = session.inner.lock().unwrap();
                    SessionStats {
                        session_id: session.session_id,
                        next_seq_num: inner.next_seq_num,
                        streams: inner
                            .streams
                            .iter()
                            .map(|tracker| StreamStats {
                                bytes_sent: tracker.bytes_sent,
                                bytes_sending: tracker.bytes_sending,
                                in_use: tracker.in_use,
                            })
                            .collect(),
                    }
                })
                .collect(),
        }
    }

    /// Interrupts every stream thread, joins them and detaches from the
    /// chain. The session table empties as the threads unwind.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state.interrupt.raise();
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        let leftover = self.state.sessions.read().unwrap().len();
        if leftover != 0 {
            tracing::error!(sessions = leftover, "session table not empty at shutdown");
        }
        debug_assert_eq!(leftover, 0);

        // Detach in reverse construction order.
        pipe::detach(self.state.as_ref());
        pipe::detach(self.signer.as_ref());
        pipe::detach(self.compressor.as_ref());

        tracing::info!("socket producer/consumer finished");
    }
}

impl Drop for SocketProducerConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SocketState {
    /// Body of one stream thread: initial exchange, registration, receive
    /// loop, deregistration.
    fn run_stream(&self, socket: OwnedFd) {
        let raw = socket.as_raw_fd();
        let stream = match TunnelFrameStream::new(socket, Arc::clone(&self.interrupt)) {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                tracing::info!(fd = raw, error = %err, "failed to initialise stream");
                return;
            }
        };

        let exchange = match self.initial_exchange(&stream) {
            Ok(exchange) => exchange,
            Err(err) => {
                tracing::info!(fd = raw, error = %err, "initial exchange failed");
                return;
            }
        };
        tracing::info!(
            fd = raw,
            identifier = %exchange.identifier,
            session = %exchange.session_id,
            "initial exchange successful"
        );

        let (session, tracker_id) = match self.register_stream(exchange.session_id, stream.clone())
        {
            Ok(registered) => registered,
            Err(err) => {
                tracing::info!(fd = raw, session = %exchange.session_id, error = %err,
                    "stream rejected");
                return;
            }
        };

        let err = self.receive_from_socket_loop(&stream);
        tracing::info!(fd = raw, session = %session.session_id, error = %err,
            "stream receive thread finished");

        self.unregister_stream(&session, tracker_id);
    }

    /// Exchanges the identity frames which open every stream. The client
    /// speaks first; the sequence number of both frames is zero.
    fn initial_exchange(&self, stream: &TunnelFrameStream) -> Result<InitialExchange, PipeError> {
        let mut buf = [0u8; TUNNEL_FRAME_MAX_SIZE];

        match self.client_session_id {
            Some(session_id) => {
                let size = build_identity_frame(&mut buf, session_id, CLIENT_IDENTIFIER)?;
                stream.send(&buf[..size])?;

                let size = stream.receive(&mut buf)?;
                parse_identity_frame(&buf[..size])
            }
            None => {
                let size = stream.receive(&mut buf)?;
                let exchange = parse_identity_frame(&buf[..size])?;

                let size = build_identity_frame(&mut buf, exchange.session_id, SERVER_IDENTIFIER)?;
                stream.send(&buf[..size])?;
                Ok(exchange)
            }
        }
    }

    fn register_stream(
        &self,
        session_id: SessionId,
        stream: Arc<TunnelFrameStream>,
    ) -> Result<(Arc<Session>, u64), PipeError> {
        let mut sessions = self.sessions.write().unwrap();

        let session = match sessions.get(&session_id) {
            Some(session) => Arc::clone(session),
            None => {
                // A server serves a single client instance; a stream for a
                // second session is turned away rather than multiplexed.
                if self.client_session_id.is_none() && !sessions.is_empty() {
                    return Err(PipeError::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "server already serves a different session",
                    )));
                }
                let session = Arc::new(Session::new(session_id));
                sessions.insert(session_id, Arc::clone(&session));
                tracing::info!(session = %session_id, "session created");
                session
            }
        };

        let tracker_id = self.next_tracker_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = session.inner.lock().unwrap();
        inner.streams.push(StreamTracker {
            id: tracker_id,
            stream,
            in_use: false,
            bytes_sending: 0,
            bytes_sent: 0,
        });
        tracing::info!(
            session = %session_id,
            streams = inner.streams.len(),
            "stream added to session"
        );

        drop(inner);
        Ok((session, tracker_id))
    }

    fn unregister_stream(&self, session: &Arc<Session>, tracker_id: u64) {
        let now_empty = {
            let mut inner = session.inner.lock().unwrap();
            inner.streams.retain(|tracker| tracker.id != tracker_id);
            // Senders parked on the condition variable must notice the list
            // changed under them.
            session.stream_freed.notify_all();
            inner.streams.is_empty()
        };
        tracing::info!(session = %session.session_id, "stream removed from session");

        if now_empty {
            let mut sessions = self.sessions.write().unwrap();
            let still_empty = sessions
                .get(&session.session_id)
                .map(|session| session.inner.lock().unwrap().streams.is_empty())
                .unwrap_or(false);
            if still_empty {
                sessions.remove(&session.session_id);
                tracing::info!(session = %session.session_id, "session removed");
            }
        }
    }

    /// Drains one stream, handing every received frame toward the tunnel
    /// side. The tunnel side is attached for the lifetime of the chain, so
    /// unreadiness there is terminal rather than retryable.
    fn receive_from_socket_loop(&self, stream: &TunnelFrameStream) -> PipeError {
        let mut buf = [0u8; TUNNEL_FRAME_MAX_SIZE];

        loop {
            if let Err(err) = self.interrupt.check() {
                return err;
            }

            let size = match stream.receive(&mut buf) {
                Ok(size) => size,
                Err(err) => return err,
            };
            tracing::trace!(bytes = size, "received frame from stream");

            if let Err(err) = self.links.invoke_prev(&mut buf[..size]) {
                return err;
            }
        }
    }
}

impl TunnelFramePipe for SocketState {
    fn links(&self) -> &PipeLinks {
        &self.links
    }

    fn on_frame_from_prev(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        let session = {
            let sessions = self.sessions.read().unwrap();
            match sessions.values().next() {
                Some(session) => Arc::clone(session),
                None => return Err(PipeError::NotYetReady),
            }
        };

        // Secure a free stream and take the next sequence number in one
        // critical section; `in_use` then serialises the stream, so each
        // stream observes its session's sequence in increasing order.
        let (seq_num, tracker_id, stream) = {
            let mut inner = session.inner.lock().unwrap();
            let index = loop {
                self.interrupt.check()?;
                if inner.streams.is_empty() {
                    return Err(PipeError::NotYetReady);
                }
                if let Some(index) = inner.streams.iter().position(|tracker| !tracker.in_use) {
                    break index;
                }
                // Every stream is busy: wait for the head tracker
                // specifically and take it, which bounds the wait to the
                // fastest in-flight completion.
                while !inner.streams.is_empty() && inner.streams[0].in_use {
                    inner = session.stream_freed.wait(inner).unwrap();
                    self.interrupt.check()?;
                }
                if !inner.streams.is_empty() {
                    break 0;
                }
            };

            let seq_num = inner.next_seq_num;
            inner.next_seq_num += 1;

            let tracker = &mut inner.streams[index];
            tracker.in_use = true;
            tracker.bytes_sending += frame.len() as u64;
            (seq_num, tracker.id, Arc::clone(&tracker.stream))
        };

        proto::set_seq_num(frame, seq_num);
        tracing::trace!(
            session = %session.session_id,
            seq_num,
            bytes = frame.len(),
            "sending frame"
        );
        let result = stream.send(frame);

        let mut inner = session.inner.lock().unwrap();
        if let Some(tracker) = inner
            .streams
            .iter_mut()
            .find(|tracker| tracker.id == tracker_id)
        {
            tracker.in_use = false;
            tracker.bytes_sending -= frame.len() as u64;
            if result.is_ok() {
                tracker.bytes_sent += frame.len() as u64;
            }
        }
        drop(inner);
        session.stream_freed.notify_one();

        result
    }

    fn on_frame_from_next(&self, _frame: &mut [u8]) -> Result<(), PipeError> {
        unreachable!("the socket producer/consumer must be the last stage in the chain")
    }
}

fn build_identity_frame(
    buf: &mut [u8],
    session_id: SessionId,
    identifier: &[u8; IDENTIFIER_SIZE],
) -> Result<usize, PipeError> {
    let mut writer = TunnelFrameWriter::new(buf)?;
    writer.set_session_id(session_id);
    writer.append(identifier)?;
    Ok(writer.close())
}

fn parse_identity_frame(frame: &[u8]) -> Result<InitialExchange, PipeError> {
    let mut reader = TunnelFrameReader::new(frame)?;
    let header = reader.header();

    if !reader.next()? {
        return Err(PipeError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "initial frame carries no identity record",
        )));
    }

    let record = reader.datagram();
    let end = record
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(record.len());
    let identifier = String::from_utf8_lossy(&record[..end]).into_owned();

    Ok(InitialExchange {
        identifier,
        session_id: header.session_id,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::pipe::testing::RecordingPipe;
    use crate::proto::{FRAME_HEADER_SIZE, INIT_FRAME_SEQ_NUM};

    /// Reads one whole frame off the far (plain blocking) end of a stream.
    fn read_frame(far: &mut UnixStream) -> io::Result<Vec<u8>> {
        let mut header = [0u8; proto::FRAME_HEADER_INFO_SIZE];
        far.read_exact(&mut header)?;
        let total = proto::check_header_info(&header)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut frame = vec![0u8; total];
        frame[..header.len()].copy_from_slice(&header);
        far.read_exact(&mut frame[header.len()..])?;
        Ok(frame)
    }

    /// Acts as the far-side peer of the initial exchange.
    fn answer_handshake_as_server(far: &mut UnixStream) -> SessionId {
        let frame = read_frame(far).expect("client identity frame");
        let mut reader = TunnelFrameReader::new(&frame).expect("reader");
        let session_id = reader.header().session_id;
        assert_eq!(reader.header().seq_num, INIT_FRAME_SEQ_NUM);
        assert!(reader.next().unwrap());
        let record = reader.datagram();
        assert_eq!(record.len(), IDENTIFIER_SIZE);
        assert!(record.starts_with(b"RuralPipeClient"));

        let mut buf = [0u8; 512];
        let size = build_identity_frame(&mut buf, session_id, SERVER_IDENTIFIER).expect("frame");
        far.write_all(&buf[..size]).expect("server identity frame");
        session_id
    }

    fn wait_for_sessions(pc: &SocketProducerConsumer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pc.stats().sessions.len() != count {
            assert!(Instant::now() < deadline, "session table never reached {count}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_streams(pc: &SocketProducerConsumer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let streams: usize = pc
                .stats()
                .sessions
                .iter()
                .map(|session| session.streams.len())
                .sum();
            if streams == count {
                return;
            }
            assert!(Instant::now() < deadline, "never reached {count} streams");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn data_frame(buf: &mut [u8], payload: &[u8]) -> usize {
        let mut writer = TunnelFrameWriter::new(buf).expect("writer");
        writer.append(payload).expect("append");
        writer.close()
    }

    #[test]
    fn test_client_initial_exchange() {
        let recorder = RecordingPipe::new();
        let session_id = SessionId::generate();
        let socket_pc = SocketProducerConsumer::new(Some(session_id), recorder.clone());

        let (local, mut far) = UnixStream::pair().expect("socketpair");
        far.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local.into()).expect("add socket");

        let negotiated = answer_handshake_as_server(&mut far);
        assert_eq!(negotiated, session_id);

        wait_for_sessions(&socket_pc, 1);
        assert_eq!(socket_pc.stats().sessions[0].session_id, session_id);

        socket_pc.shutdown();
        wait_for_sessions(&socket_pc, 0);
    }

    #[test]
    fn test_server_initial_exchange() {
        let recorder = RecordingPipe::new();
        let socket_pc = SocketProducerConsumer::new(None, recorder.clone());

        let (local, mut far) = UnixStream::pair().expect("socketpair");
        far.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local.into()).expect("add socket");

        // Far side plays the client.
        let session_id = SessionId::generate();
        let mut buf = [0u8; 512];
        let size = build_identity_frame(&mut buf, session_id, CLIENT_IDENTIFIER).expect("frame");
        far.write_all(&buf[..size]).expect("client identity frame");

        let reply = read_frame(&mut far).expect("server identity frame");
        let mut reader = TunnelFrameReader::new(&reply).expect("reader");
        assert_eq!(reader.header().session_id, session_id);
        assert_eq!(reader.header().seq_num, INIT_FRAME_SEQ_NUM);
        assert!(reader.next().unwrap());
        assert!(reader.datagram().starts_with(b"RuralPipeServer"));

        wait_for_sessions(&socket_pc, 1);
        socket_pc.shutdown();
    }

    #[test]
    fn test_send_before_any_session_is_not_yet_ready() {
        let recorder = RecordingPipe::new();
        let socket_pc = SocketProducerConsumer::new(Some(SessionId::generate()), recorder.clone());

        let mut buf = [0u8; 512];
        let size = data_frame(&mut buf, b"too early");
        assert!(matches!(
            recorder.links().invoke_next(&mut buf[..size]),
            Err(PipeError::NotYetReady)
        ));

        socket_pc.shutdown();
    }

    #[test]
    fn test_sequence_numbers_are_assigned_in_order() {
        let recorder = RecordingPipe::new();
        let session_id = SessionId::generate();
        let socket_pc = SocketProducerConsumer::new(Some(session_id), recorder.clone());

        let (local, mut far) = UnixStream::pair().expect("socketpair");
        far.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local.into()).expect("add socket");
        answer_handshake_as_server(&mut far);
        wait_for_sessions(&socket_pc, 1);

        let mut buf = [0u8; 512];
        for i in 0..5 {
            let size = data_frame(&mut buf, format!("frame {i}").as_bytes());
            recorder
                .links()
                .invoke_next(&mut buf[..size])
                .expect("send");
        }

        for expected_seq in 1..=5u64 {
            let frame = read_frame(&mut far).expect("data frame");
            let reader = TunnelFrameReader::new(&frame).expect("reader");
            assert_eq!(reader.header().seq_num, expected_seq);
        }

        socket_pc.shutdown();
    }

    #[test]
    fn test_frames_stripe_across_two_streams() {
        let recorder = RecordingPipe::new();
        let session_id = SessionId::generate();
        let socket_pc = Arc::new(SocketProducerConsumer::new(
            Some(session_id),
            recorder.clone(),
        ));

        let mut far_ends = Vec::new();
        for _ in 0..2 {
            let (local, mut far) = UnixStream::pair().expect("socketpair");
            far.set_read_timeout(Some(Duration::from_secs(30)))
                .expect("timeout");
            socket_pc.add_socket(local.into()).expect("add socket");
            answer_handshake_as_server(&mut far);
            far_ends.push(far);
        }
        wait_for_streams(&socket_pc, 2);

        // Slow far ends force sends to block once the kernel buffers fill,
        // which is what makes the striping observable.
        let readers: Vec<_> = far_ends
            .into_iter()
            .map(|mut far| {
                thread::spawn(move || {
                    let mut seqs = Vec::new();
                    while seqs.len() < 100 {
                        match read_frame(&mut far) {
                            Ok(frame) => {
                                let reader = TunnelFrameReader::new(&frame).expect("reader");
                                seqs.push(reader.header().seq_num);
                                thread::sleep(Duration::from_millis(2));
                            }
                            Err(_) => break,
                        }
                    }
                    seqs
                })
            })
            .collect();

        let payload = vec![0x42u8; 3000];
        let senders: Vec<_> = (0..4)
            .map(|_| {
                let recorder = recorder.clone();
                let payload = payload.clone();
                thread::spawn(move || {
                    let mut buf = [0u8; TUNNEL_FRAME_MAX_SIZE];
                    for _ in 0..25 {
                        let size = data_frame(&mut buf, &payload);
                        recorder
                            .links()
                            .invoke_next(&mut buf[..size])
                            .expect("send");
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender");
        }

        socket_pc.shutdown();

        let per_stream: Vec<Vec<u64>> = readers
            .into_iter()
            .map(|reader| reader.join().expect("reader"))
            .collect();

        let union: BTreeSet<u64> = per_stream.iter().flatten().copied().collect();
        assert_eq!(union, (1..=100).collect::<BTreeSet<u64>>());
        for (stream, seqs) in per_stream.iter().enumerate() {
            assert!(
                seqs.len() >= 30,
                "stream {stream} carried only {} of 100 frames",
                seqs.len()
            );
        }
    }

    #[test]
    fn test_server_rejects_second_session() {
        let recorder = RecordingPipe::new();
        let socket_pc = SocketProducerConsumer::new(None, recorder.clone());

        let (local_a, mut far_a) = UnixStream::pair().expect("socketpair");
        far_a
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local_a.into()).expect("add socket");

        let mut buf = [0u8; 512];
        let size =
            build_identity_frame(&mut buf, SessionId::generate(), CLIENT_IDENTIFIER).expect("frame");
        far_a.write_all(&buf[..size]).expect("first client");
        read_frame(&mut far_a).expect("first reply");
        wait_for_sessions(&socket_pc, 1);

        let (local_b, mut far_b) = UnixStream::pair().expect("socketpair");
        far_b
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local_b.into()).expect("add socket");

        let size =
            build_identity_frame(&mut buf, SessionId::generate(), CLIENT_IDENTIFIER).expect("frame");
        far_b.write_all(&buf[..size]).expect("second client");
        read_frame(&mut far_b).expect("second reply");

        // The second stream is torn down right after the exchange.
        let mut probe = [0u8; 1];
        assert_eq!(far_b.read(&mut probe).expect("eof"), 0);
        assert_eq!(socket_pc.stats().sessions.len(), 1);

        socket_pc.shutdown();
    }

    #[test]
    fn test_received_frames_reach_the_tunnel_side() {
        let recorder = RecordingPipe::new();
        let session_id = SessionId::generate();
        let socket_pc = SocketProducerConsumer::new(Some(session_id), recorder.clone());

        let (local, mut far) = UnixStream::pair().expect("socketpair");
        far.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local.into()).expect("add socket");
        answer_handshake_as_server(&mut far);
        wait_for_sessions(&socket_pc, 1);

        let mut buf = [0u8; 512];
        let size = data_frame(&mut buf, b"inbound datagram");
        far.write_all(&buf[..size]).expect("write data frame");

        let frames = recorder.wait_for_frames(1, Duration::from_secs(5));
        let mut reader = TunnelFrameReader::new(&frames[0]).expect("reader");
        assert!(reader.next().unwrap());
        assert_eq!(reader.datagram(), b"inbound datagram");

        socket_pc.shutdown();
    }

    #[test]
    fn test_detached_chain_is_not_yet_ready_again() {
        let recorder = RecordingPipe::new();
        let session_id = SessionId::generate();
        let socket_pc = SocketProducerConsumer::new(Some(session_id), recorder.clone());

        let (local, mut far) = UnixStream::pair().expect("socketpair");
        far.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        socket_pc.add_socket(local.into()).expect("add socket");
        answer_handshake_as_server(&mut far);
        wait_for_sessions(&socket_pc, 1);

        drop(socket_pc);

        let mut buf = [0u8; 512];
        let size = data_frame(&mut buf, b"after teardown");
        assert!(matches!(
            recorder.links().invoke_next(&mut buf[..size]),
            Err(PipeError::NotYetReady)
        ));

        // The far end observes the stream closing.
        let mut probe = [0u8; 1];
        assert_eq!(far.read(&mut probe).expect("eof"), 0);
    }

    #[test]
    fn test_empty_frame_header_minimum() {
        // The identity frame is header plus one 16-byte record.
        let mut buf = [0u8; 512];
        let size =
            build_identity_frame(&mut buf, SessionId::generate(), CLIENT_IDENTIFIER).expect("frame");
        assert_eq!(size, FRAME_HEADER_SIZE + 2 + IDENTIFIER_SIZE);
    }
}
