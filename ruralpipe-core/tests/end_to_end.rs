//! Full-chain loopback: two complete pipe chains wired back to back over
//! socketpairs, with datagram socketpairs standing in for the TUN queues.

use std::os::unix::net::{UnixDatagram, UnixStream};
use std::time::Duration;

use ruralpipe_core::proto::SessionId;
use ruralpipe_core::socket::SocketProducerConsumer;
use ruralpipe_core::tunnel::TunnelProducerConsumer;

const MTU: usize = 1500;
const RECV_TIMEOUT: Duration = Duration::from_secs(15);

struct Endpoint {
    tunnel: TunnelProducerConsumer,
    socket: SocketProducerConsumer,
    tun_peer: UnixDatagram,
}

impl Endpoint {
    fn new(session_id: Option<SessionId>, signing_key: Option<&[u8]>) -> Self {
        let (queue, tun_peer) = UnixDatagram::pair().expect("datagram pair");
        tun_peer
            .set_read_timeout(Some(RECV_TIMEOUT))
            .expect("timeout");

        let tunnel = TunnelProducerConsumer::new(vec![queue.into()], MTU);
        let socket = match signing_key {
            Some(key) => SocketProducerConsumer::with_signing_key(session_id, tunnel.pipe(), key),
            None => SocketProducerConsumer::new(session_id, tunnel.pipe()),
        };

        Self {
            tunnel,
            socket,
            tun_peer,
        }
    }

    fn shutdown(self) {
        self.socket.shutdown();
        self.tunnel.shutdown();
    }
}

fn run_loopback(signing_key: Option<&[u8]>) {
    let client = Endpoint::new(Some(SessionId::generate()), signing_key);
    let server = Endpoint::new(None, signing_key);

    let (client_sock, server_sock) = UnixStream::pair().expect("wire");
    client
        .socket
        .add_socket(client_sock.into())
        .expect("client socket");
    server
        .socket
        .add_socket(server_sock.into())
        .expect("server socket");

    // Client to server.
    client
        .tun_peer
        .send(b"datagram heading to the server")
        .expect("send");
    let mut buf = [0u8; 2048];
    let n = server.tun_peer.recv(&mut buf).expect("server TUN output");
    assert_eq!(&buf[..n], b"datagram heading to the server");

    // And back.
    server
        .tun_peer
        .send(b"datagram heading to the client")
        .expect("send");
    let n = client.tun_peer.recv(&mut buf).expect("client TUN output");
    assert_eq!(&buf[..n], b"datagram heading to the client");

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_datagrams_cross_the_tunnel_both_ways() {
    run_loopback(None);
}

#[test]
fn test_datagrams_cross_a_signed_tunnel() {
    run_loopback(Some(b"shared loopback signing key"));
}

#[test]
fn test_traffic_spread_over_two_connections() {
    let client = Endpoint::new(Some(SessionId::generate()), None);
    let server = Endpoint::new(None, None);

    for _ in 0..2 {
        let (client_sock, server_sock) = UnixStream::pair().expect("wire");
        client
            .socket
            .add_socket(client_sock.into())
            .expect("client socket");
        server
            .socket
            .add_socket(server_sock.into())
            .expect("server socket");
    }

    let mut buf = [0u8; 2048];
    for i in 0..50u32 {
        let datagram = format!("datagram number {i}");
        client.tun_peer.send(datagram.as_bytes()).expect("send");
        let n = server.tun_peer.recv(&mut buf).expect("receive");
        assert_eq!(&buf[..n], datagram.as_bytes());
    }

    client.shutdown();
    server.shutdown();
}
