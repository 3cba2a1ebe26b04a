use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hex_literal::hex;
use natneg_relay::{Config, Proxy, PublicAddress};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MAGIC: [u8; 6] = hex!("FDFC1E666AB2");
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

#[tokio::test]
async fn rewrites_address_embedded_in_connect() {
    let _guard = logging::test("natneg_relay=debug");

    let fake_server = bind().await;
    let proxy = spawn_proxy(&fake_server, Duration::from_secs(60)).await;

    let client_game = bind().await;
    let client_comm = bind().await;

    // The game-plane leg: `init` with sequence number 0.
    send(&client_game, &init_packet(hex!("AABBCCDD"), 0, 5), proxy).await;
    let (_, game_public_addr) = recv(&fake_server).await;

    // The communication leg arrives from a different source, so the proxy
    // forwards it from the session's private socket.
    send(&client_comm, &init_packet(hex!("AABBCCDD"), 1, 5), proxy).await;
    let (_, comm_addr) = recv(&fake_server).await;

    assert_ne!(comm_addr, game_public_addr);

    // The server answers the communication leg with a `connect` that embeds
    // the remote peer's endpoint.
    fake_server
        .send_to(
            &connect_packet(hex!("AABBCCDD"), [192, 168, 1, 10], 6666),
            comm_addr,
        )
        .await
        .unwrap();

    let (payload, from) = recv(&client_comm).await;

    // The reply must appear to come from the proxy's well-known port.
    assert_eq!(from, proxy);

    // Magic, version, step and NatNeg ID pass through untouched.
    assert_eq!(payload[..12], connect_packet(hex!("AABBCCDD"), [192, 168, 1, 10], 6666)[..12]);
    // The embedded address is now the proxy's public IP and the fake remote
    // player socket's port.
    assert_eq!(payload[12..16], [203, 0, 113, 7]);
    let fake_socket_port = u16::from_be_bytes([payload[16], payload[17]]);
    assert_ne!(fake_socket_port, 0);
    // The opaque tail survives the rewrite.
    assert_eq!(payload[18..], hex!("0102030405"));
}

#[tokio::test]
async fn creates_one_game_connection_per_key() {
    let _guard = logging::test("natneg_relay=debug");

    let fake_server = bind().await;
    let proxy = spawn_proxy(&fake_server, Duration::from_secs(60)).await;

    let client_game = bind().await;

    send(&client_game, &init_packet(hex!("11223344"), 0, 1), proxy).await;
    let (_, first) = recv(&fake_server).await;

    // A second `init` from the same source, sequence number 1: no new game
    // connection, the packet still leaves through the existing game socket.
    send(&client_game, &init_packet(hex!("11223344"), 1, 1), proxy).await;
    let (_, second) = recv(&fake_server).await;

    assert_eq!(first, second);

    // Even a sequence number of 0 from a different source must not replace
    // the game connection: the client public address is fixed at creation,
    // so this is treated as the communication leg.
    let client_other = bind().await;
    send(&client_other, &init_packet(hex!("11223344"), 0, 1), proxy).await;
    let (_, third) = recv(&fake_server).await;

    assert_ne!(third, first);
}

#[tokio::test]
async fn idle_session_is_reaped() {
    let _guard = logging::test("natneg_relay=debug");

    let fake_server = bind().await;
    let proxy = spawn_proxy(&fake_server, Duration::from_millis(250)).await;

    let client_game = bind().await;

    send(&client_game, &init_packet(hex!("55667788"), 0, 2), proxy).await;
    let (_, first) = recv(&fake_server).await;

    // Nothing else happens; the idle timer reaps the session and both
    // private sockets with it.
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The same key now creates a fresh session with fresh sockets.
    send(&client_game, &init_packet(hex!("55667788"), 0, 2), proxy).await;
    let (_, second) = recv(&fake_server).await;

    assert_ne!(first, second);
}

#[tokio::test]
async fn follows_client_rebinding_on_the_fake_socket() {
    let _guard = logging::test("natneg_relay=debug");

    let fake_server = bind().await;
    let proxy = spawn_proxy(&fake_server, Duration::from_secs(60)).await;

    let client_game = bind().await;
    let client_comm = bind().await;

    send(&client_game, &init_packet(hex!("99AABBCC"), 0, 3), proxy).await;
    let (_, game_public_addr) = recv(&fake_server).await;

    send(&client_comm, &init_packet(hex!("99AABBCC"), 1, 3), proxy).await;
    let (_, comm_addr) = recv(&fake_server).await;

    // The `connect` reply arms the fake remote player socket and tells the
    // client where to punch.
    fake_server
        .send_to(
            &connect_packet(hex!("99AABBCC"), [192, 168, 1, 10], 6666),
            comm_addr,
        )
        .await
        .unwrap();
    let (payload, _) = recv(&client_comm).await;
    let fake_socket_port = u16::from_be_bytes([payload[16], payload[17]]);
    let fake_socket = SocketAddr::from((Ipv4Addr::LOCALHOST, fake_socket_port));

    // The remote peer shows up on the game-plane socket; its traffic is
    // relayed to the client through the fake socket.
    let remote = bind().await;
    remote.send_to(b"hello", game_public_addr).await.unwrap();

    let (relayed, relayed_from) = recv(&client_game).await;
    assert_eq!(relayed, b"hello");
    assert_eq!(relayed_from, fake_socket);

    // The client's NAT rebinds: punches arrive from a new source port. The
    // relay must follow it.
    let client_rebound = bind().await;
    client_rebound.send_to(b"punch", fake_socket).await.unwrap();

    let (punched, _) = recv(&remote).await;
    assert_eq!(punched, b"punch");

    remote.send_to(b"hello again", game_public_addr).await.unwrap();

    let (relayed, _) = recv(&client_rebound).await;
    assert_eq!(relayed, b"hello again");
}

#[tokio::test]
async fn ignores_datagrams_without_a_session_key() {
    let _guard = logging::test("natneg_relay=debug");

    let fake_server = bind().await;
    let proxy = spawn_proxy(&fake_server, Duration::from_secs(60)).await;

    let client = bind().await;

    // Not NatNeg at all.
    send(&client, b"definitely not natneg", proxy).await;
    // NatNeg but `connect` carries no player ID, hence no session key.
    send(
        &client,
        &connect_packet(hex!("AABBCCDD"), [192, 168, 1, 10], 6666),
        proxy,
    )
    .await;

    let mut buf = [0u8; 1024];
    let result = timeout(Duration::from_millis(300), fake_server.recv_from(&mut buf)).await;

    assert!(result.is_err(), "nothing must reach the upstream server");
}

async fn spawn_proxy(fake_server: &UdpSocket, idle_timeout: Duration) -> SocketAddr {
    let public_address = Arc::new(PublicAddress::new());
    public_address.set(PUBLIC_IP);

    let config = Config {
        listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        server_host: "127.0.0.1".to_owned(),
        server_port: fake_server.local_addr().unwrap().port(),
        idle_timeout,
    };

    let proxy = Proxy::bind(config, public_address).await.unwrap();
    let addr = proxy.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    addr
}

async fn bind() -> UdpSocket {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap()
}

async fn send(socket: &UdpSocket, payload: &[u8], to: SocketAddr) {
    socket.send_to(payload, to).await.unwrap();
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1024];

    let (len, from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();

    (buf[..len].to_vec(), from)
}

fn init_packet(natneg_id: [u8; 4], sequence_number: u8, player_id: u8) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&MAGIC);
    packet.push(0x02); // version
    packet.push(0x00); // step: init
    packet.extend_from_slice(&natneg_id);
    packet.push(sequence_number);
    packet.push(player_id);

    packet
}

fn connect_packet(natneg_id: [u8; 4], ip: [u8; 4], port: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&MAGIC);
    packet.push(0x02); // version
    packet.push(0x05); // step: connect
    packet.extend_from_slice(&natneg_id);
    packet.extend_from_slice(&ip);
    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(&hex!("0102030405")); // opaque tail

    packet
}
