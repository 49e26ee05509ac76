//! Thread-safe send: many writer threads, one connection, no lost bytes.

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use edge_reactor::{Address, EventLoop, TcpServer};

const WRITERS: usize = 4;
const SENDS_PER_WRITER: usize = 1000;

#[test]
fn concurrent_sends_deliver_every_byte() {
    let (tx, rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(event_loop.handle(), "cross", &Address::loopback(0)).unwrap();
        server.start(&mut event_loop).unwrap();
        tx.send((event_loop.handle(), server.handle(), server.local_addr()))
            .unwrap();
        event_loop.run().unwrap();
    });

    let (loop_handle, server_handle, addr) = rx.recv().unwrap();
    let mut client = TcpStream::connect(addr.to_socket_addr()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let conn = loop {
        if let Some(conn) = server_handle.connection("cross#1") {
            break conn;
        }
        assert!(Instant::now() < deadline, "connection never registered");
        thread::sleep(Duration::from_millis(5));
    };

    // Zero-length sends are accepted from any thread and deliver nothing.
    conn.send(&[]);

    // Each writer sends a distinguishable byte so per-writer loss would
    // show up in the counts.
    let writers: Vec<_> = (0..WRITERS)
        .map(|i| {
            let conn = conn.clone();
            thread::spawn(move || {
                let byte = [b'A' + i as u8];
                for _ in 0..SENDS_PER_WRITER {
                    conn.send(&byte);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let expected = WRITERS * SENDS_PER_WRITER;
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = Vec::with_capacity(expected);
    let mut chunk = [0u8; 4096];
    while received.len() < expected {
        let n = client.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "peer closed before all bytes arrived");
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received.len(), expected);

    for i in 0..WRITERS {
        let byte = b'A' + i as u8;
        let count = received.iter().filter(|&&b| b == byte).count();
        assert_eq!(count, SENDS_PER_WRITER, "writer {i} lost bytes");
    }

    assert_eq!(conn.bytes_sent(), expected as u64);

    loop_handle.quit();
    server_thread.join().unwrap();
}
