//! End-to-end echo: bytes in, same bytes out, clean teardown.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use edge_reactor::{Address, EventLoop, TcpConnection, TcpServer};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_round_trip() {
    let (tx, rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server = TcpServer::bind(event_loop.handle(), "echo", &Address::loopback(0))
            .unwrap()
            .set_message_callback(|lp, conn, buf| {
                let data = buf.take();
                TcpConnection::send_in_loop(conn, lp, &data);
            });
        server.start(&mut event_loop).unwrap();

        tx.send((event_loop.handle(), server.handle(), server.local_addr()))
            .unwrap();
        event_loop.run().unwrap();
    });

    let (loop_handle, server_handle, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr.to_socket_addr()).unwrap();
    client.write_all(b"hello").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"hello");

    wait_until("connection teardown", || {
        server_handle.active_connections() == 0
    });

    let stats = server_handle.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.bytes_received, 5);
    assert_eq!(stats.bytes_sent, 5);

    loop_handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn names_are_sequential_per_server() {
    let (tx, rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(event_loop.handle(), "seq", &Address::loopback(0)).unwrap();
        server.start(&mut event_loop).unwrap();
        tx.send((event_loop.handle(), server.handle(), server.local_addr()))
            .unwrap();
        event_loop.run().unwrap();
    });

    let (loop_handle, server_handle, addr) = rx.recv().unwrap();

    let _c1 = TcpStream::connect(addr.to_socket_addr()).unwrap();
    let _c2 = TcpStream::connect(addr.to_socket_addr()).unwrap();
    wait_until("both connections", || {
        server_handle.active_connections() == 2
    });

    assert!(server_handle.connection("seq#1").is_some());
    assert!(server_handle.connection("seq#2").is_some());
    assert!(server_handle.connection("seq#3").is_none());

    loop_handle.quit();
    server_thread.join().unwrap();
}
