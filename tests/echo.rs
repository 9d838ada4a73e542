//! Integration tests: echo server over real TCP connections.
//!
//! Each test launches a server on an ephemeral port, connects with std
//! TCP streams, and verifies echoed bytes, callback behavior, and
//! teardown.

use echod::server::Server;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ── Helpers ─────────────────────────────────────────────────────────

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_server(workers: usize) -> (Arc<Server>, thread::JoinHandle<()>, String) {
    let port = free_port();
    let server = Arc::new(Server::new("127.0.0.1", port, workers).unwrap());
    let runner = Arc::clone(&server);
    let handle = thread::spawn(move || {
        let _ = runner.start();
    });
    (server, handle, format!("127.0.0.1:{port}"))
}

/// Connect, retrying until the listener is up.
fn connect_when_ready(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Deterministic byte generator for large payloads.
fn pseudo_random_bytes(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e3779b97f4a7c15;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_small_message() {
    let (server, handle, addr) = start_server(1);

    let connects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        server.set_connection_callback(move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let closes = Arc::clone(&closes);
        server.set_close_callback(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
        let write_completes = Arc::clone(&write_completes);
        server.set_write_complete_callback(move |_| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut client = connect_when_ready(&addr);
    client.write_all(b"hello\n").unwrap();
    assert_eq!(read_exact_len(&mut client, 6), b"hello\n");

    wait_until(|| write_completes.load(Ordering::SeqCst) >= 1);
    drop(client);

    // Exactly one connection event and one close event.
    wait_until(|| closes.load(Ordering::SeqCst) == 1);
    wait_until(|| server.connection_count() == 0);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn echo_one_mebibyte() {
    let (server, handle, addr) = start_server(1);
    let mut client = connect_when_ready(&addr);

    let payload = pseudo_random_bytes(1024 * 1024);
    client.write_all(&payload).unwrap();

    // The echo may come back reassembled from many reads.
    let echoed = read_exact_len(&mut client, payload.len());
    assert_eq!(echoed, payload);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn back_pressure_does_not_block_other_connections() {
    // One worker so both connections share one loop: staged output for the
    // slow client must not stall the other one.
    let (server, handle, addr) = start_server(1);

    let mut slow = connect_when_ready(&addr);
    let mut quick = connect_when_ready(&addr);

    let payload = pseudo_random_bytes(8 * 1024 * 1024);
    let writer_payload = payload.clone();
    let mut slow_writer = slow.try_clone().unwrap();
    let writer = thread::spawn(move || {
        slow_writer.write_all(&writer_payload).unwrap();
    });

    // While the big echo is queueing up, the shared loop stays responsive.
    for _ in 0..10 {
        quick.write_all(b"ping").unwrap();
        assert_eq!(read_exact_len(&mut quick, 4), b"ping");
    }

    writer.join().unwrap();
    let echoed = read_exact_len(&mut slow, payload.len());
    assert_eq!(echoed, payload);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn many_concurrent_clients_in_order() {
    const CLIENTS: usize = 64;
    const MESSAGES: usize = 100;
    const MESSAGE_LEN: usize = 128;

    let (server, handle, addr) = start_server(4);

    let mut workers = Vec::new();
    for client_id in 0..CLIENTS {
        let addr = addr.clone();
        workers.push(thread::spawn(move || {
            let mut stream = connect_when_ready(&addr);

            let mut expected = Vec::with_capacity(MESSAGES * MESSAGE_LEN);
            for seq in 0..MESSAGES {
                let mut msg = format!("client-{client_id}-seq-{seq}-").into_bytes();
                msg.resize(MESSAGE_LEN, b'.');
                expected.extend_from_slice(&msg);
                stream.write_all(&msg).unwrap();
            }

            // Every client gets its own bytes back, in order.
            let echoed = read_exact_len(&mut stream, expected.len());
            assert_eq!(echoed, expected);
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    server.stop();
    handle.join().unwrap();
}

#[test]
fn abrupt_disconnect_removes_connection() {
    let (server, handle, addr) = start_server(2);

    let mut client = connect_when_ready(&addr);
    client.write_all(b"x").unwrap();
    assert_eq!(read_exact_len(&mut client, 1), b"x");
    wait_until(|| server.connection_count() >= 1);

    // SO_LINGER with zero timeout turns the close into an RST.
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            client.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
    drop(client);

    // The reset propagates to the owning worker loop and the map entry
    // disappears.
    wait_until(|| server.connection_count() == 0);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn cross_thread_sends_arrive_in_order() {
    let (server, handle, addr) = start_server(2);

    let (conn_tx, conn_rx) = mpsc::channel();
    let conn_tx = Mutex::new(conn_tx);
    server.set_connection_callback(move |conn| {
        let _ = conn_tx.lock().unwrap().send(Arc::clone(conn));
    });

    let mut client = connect_when_ready(&addr);
    let conn = conn_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // A non-loop thread issues a sequence of sends; the peer must observe
    // them concatenated in call order.
    let producer = thread::spawn(move || {
        let mut expected = Vec::new();
        for i in 0..50 {
            let msg = format!("msg-{i:03};").into_bytes();
            expected.extend_from_slice(&msg);
            conn.send(msg);
        }
        expected
    });

    let expected = producer.join().unwrap();
    let echoed = read_exact_len(&mut client, expected.len());
    assert_eq!(echoed, expected);

    server.stop();
    handle.join().unwrap();
}

#[test]
fn callbacks_share_one_loop_thread() {
    let (server, handle, addr) = start_server(2);

    // Record the thread every callback runs on; for a single connection
    // they must all agree.
    let threads = Arc::new(Mutex::new(Vec::new()));
    {
        let threads = Arc::clone(&threads);
        server.set_connection_callback(move |_| {
            threads.lock().unwrap().push(thread::current().id());
        });
    }
    {
        let threads = Arc::clone(&threads);
        server.set_message_callback(move |conn, buffer| {
            threads.lock().unwrap().push(thread::current().id());
            let message = buffer.retrieve_all_as_bytes();
            conn.send(message);
        });
    }
    {
        let threads = Arc::clone(&threads);
        server.set_close_callback(move |_| {
            threads.lock().unwrap().push(thread::current().id());
        });
    }

    let mut client = connect_when_ready(&addr);
    client.write_all(b"one").unwrap();
    read_exact_len(&mut client, 3);
    client.write_all(b"two").unwrap();
    read_exact_len(&mut client, 3);
    drop(client);

    // Connection event, two reads, one close.
    wait_until(|| threads.lock().unwrap().len() >= 4);
    let threads = threads.lock().unwrap();
    assert!(threads.windows(2).all(|pair| pair[0] == pair[1]));

    server.stop();
    handle.join().unwrap();
}

#[test]
fn stop_fires_no_further_callbacks() {
    let (server, handle, addr) = start_server(1);

    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = Arc::clone(&closes);
        server.set_close_callback(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let client = connect_when_ready(&addr);
    wait_until(|| server.connection_count() >= 1);

    server.stop();
    handle.join().unwrap();
    assert_eq!(server.connection_count(), 0);

    // The surviving connection was force-closed after its loop quit, so
    // its close callback never ran.
    drop(client);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(closes.load(Ordering::SeqCst), 0);
}
