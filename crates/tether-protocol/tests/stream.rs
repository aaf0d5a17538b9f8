//! Tests for stream implementations and the address codec

use std::time::Duration;

use tether_protocol::stream::{memory_pair, TcpServer, TcpStream};
use tether_protocol::{Packet, SocketAddress, Stream, Transport};

#[test]
fn test_address_parse_full()
{
    let address = SocketAddress::parse("192.168.1.20:4014");
    assert_eq!(address.host(), [192, 168, 1, 20]);
    assert_eq!(address.port(), 4014);
    assert_eq!(address.to_string(), "192.168.1.20:4014");
}

#[test]
fn test_address_missing_parts_default_to_zero()
{
    assert_eq!(SocketAddress::parse("127.0.0.1"), SocketAddress::new([127, 0, 0, 1], 0));
    assert_eq!(SocketAddress::parse(":8000"), SocketAddress::new([0, 0, 0, 0], 8000));
    assert_eq!(SocketAddress::parse("10.1:22"), SocketAddress::new([0, 0, 0, 0], 22));
    assert_eq!(SocketAddress::parse("1.2.3.x:port"), SocketAddress::new([1, 2, 3, 0], 0));
    assert_eq!(SocketAddress::parse(""), SocketAddress::default());
}

#[test]
fn test_address_from_str()
{
    let address: SocketAddress = "127.0.0.1:9".parse().unwrap();
    assert_eq!(address.port(), 9);
}

#[test]
fn test_memory_stream_reports_empty_then_data()
{
    let (mut left, mut right) = memory_pair();
    let mut buf = [0u8; 8];
    assert_eq!(right.read(&mut buf).unwrap(), 0);
    assert!(!right.poll_readable(Duration::from_millis(5)).unwrap());

    left.write_all(b"$#00").unwrap();
    assert!(right.poll_readable(Duration::ZERO).unwrap());
    assert_eq!(right.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"$#00");
}

#[test]
fn test_memory_stream_drains_before_reporting_close()
{
    let (mut left, mut right) = memory_pair();
    left.write_all(b"+").unwrap();
    drop(left);

    let mut buf = [0u8; 4];
    assert_eq!(right.read(&mut buf).unwrap(), 1);
    assert!(right.read(&mut buf).is_err());
    assert!(right.write(b"x").is_err());
}

#[test]
fn test_tcp_loopback_exchange()
{
    let server = TcpServer::bind(SocketAddress::parse("127.0.0.1:0")).unwrap();
    let address = server.local_address().unwrap();

    let target = std::thread::spawn(move || {
        let stream = server
            .accept_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("client connects");
        let mut transport = Transport::new(Box::new(stream));
        let mut request = Packet::new();
        transport.receive(&mut request, Duration::from_secs(5)).unwrap();
        transport.send(&Packet::from_payload("OK"), Duration::from_secs(5)).unwrap();
        request
    });

    let stream = TcpStream::connect_timeout(address, Duration::from_secs(5)).unwrap();
    let mut transport = Transport::new(Box::new(stream));
    transport.send(&Packet::from_payload("qAttached"), Duration::from_secs(5)).unwrap();
    let mut reply = Packet::new();
    transport.receive(&mut reply, Duration::from_secs(5)).unwrap();

    assert_eq!(reply.payload(), b"OK");
    assert_eq!(target.join().unwrap().payload(), b"qAttached");
}

#[test]
fn test_tcp_accept_timeout_without_client()
{
    let server = TcpServer::bind(SocketAddress::parse("127.0.0.1:0")).unwrap();
    assert!(server.accept_timeout(Duration::from_millis(20)).unwrap().is_none());
}

#[test]
fn test_tcp_peer_close_is_an_error()
{
    let server = TcpServer::bind(SocketAddress::parse("127.0.0.1:0")).unwrap();
    let address = server.local_address().unwrap();
    let client = TcpStream::connect(address).unwrap();
    let mut accepted = server.accept().unwrap();
    drop(client);

    assert!(accepted.poll_readable(Duration::from_secs(2)).is_err());
}
