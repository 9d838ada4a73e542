//! Per-peer connection state machine.
//!
//! A `Connection` pins one socket to one event loop and owns the input and
//! output buffers for it. Every callback and buffer mutation happens on
//! the owning loop's thread; `send` may be called from anywhere and is
//! linearised through the loop's task queue.
//!
//! State only moves forward:
//!
//! ```text
//! Connecting ──establish──► Connected ──shutdown──► Disconnecting ──► Disconnected
//!                               └────────── close / error / EOF ──────────┘
//! ```

use crate::runtime::buffer::Buffer;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::handler::EventHandler;
use crate::runtime::socket::Socket;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle states, monotonic within a connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// One established TCP peer, pinned to one event loop for its whole life.
pub struct Connection {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    handler: Arc<EventHandler>,
    name: String,
    state: AtomicU8,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl Connection {
    /// Wrap an accepted socket. Callbacks must be installed before
    /// [`Connection::establish`] is scheduled.
    pub fn new(event_loop: Arc<EventLoop>, socket: Socket, name: String) -> Arc<Self> {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(name = %name, error = %e, "failed to disable Nagle");
        }

        let handler = Arc::new(EventHandler::new(socket.fd()));
        let conn = Arc::new(Self {
            event_loop,
            socket,
            handler: Arc::clone(&handler),
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        });

        // The handler table must not keep the connection alive on its own;
        // each dispatch upgrades for the duration of the callback.
        let weak = Arc::downgrade(&conn);
        handler.set_read_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }
        });
        handler.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        handler.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        handler.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        debug!(name = %conn.name, "connection created");
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn local_addr_string(&self) -> String {
        self.socket.local_addr_string()
    }

    pub fn peer_addr_string(&self) -> String {
        self.socket.peer_addr_string()
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.connection_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&Arc<Connection>, &mut Buffer) + Send + Sync + 'static,
    ) {
        *self.message_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.write_complete_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_error_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.error_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_close_callback(
        &self,
        callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.close_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Finish setup on the owning loop: mark connected, enable read
    /// interest, register the handler, then fire the connection callback.
    pub fn establish(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            conn.set_state(ConnState::Connected);
            conn.handler.enable_reading();
            conn.event_loop.add_handler(Arc::clone(&conn.handler));
            info!(
                name = %conn.name,
                peer = %conn.peer_addr_string(),
                "connection established"
            );
            let callback = conn.connection_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(&conn);
            }
        });
    }

    /// Tear down on the owning loop after the server dropped its
    /// reference: remove the handler so no further event reaches it.
    pub fn destroy(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if conn.state() == ConnState::Connected {
                conn.set_state(ConnState::Disconnected);
                conn.handler.disable_all();
            }
            conn.event_loop.remove_handler(Arc::clone(&conn.handler));
            debug!(name = %conn.name, "connection destroyed");
        });
    }

    /// Queue bytes for transmission. Callable from any thread; writes from
    /// one thread arrive on the wire in call order.
    pub fn send(self: &Arc<Self>, data: impl Into<Bytes>) {
        if self.state() != ConnState::Connected {
            warn!(name = %self.name, "send on a connection that is not connected, dropping");
            return;
        }
        let data = data.into();
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || conn.send_in_loop(data));
        }
    }

    /// Half-close: stop writing once the output buffer drains, keep
    /// reading so the peer's close is still observed. Idempotent.
    pub fn shutdown(self: &Arc<Self>) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Close immediately, regardless of pending output.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || conn.force_close_in_loop());
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_read(self: &Arc<Self>) {
        let mut input = self.input_buffer.lock().unwrap();
        match input.fill_from(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "read");
                let callback = self.message_callback.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(self, &mut input);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.handler.is_writing() {
            trace!(name = %self.name, "writable event with write interest off, ignoring");
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match self.socket.send(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.handler.disable_writing();
                    self.event_loop.update_handler(Arc::clone(&self.handler));
                    drop(output);
                    self.schedule_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "write failed");
            }
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: Bytes) {
        if self.state() != ConnState::Connected {
            warn!(name = %self.name, "connection went down before the write, giving up");
            return;
        }

        let mut sent = 0;
        let mut fault = false;

        // Nothing staged: try to push straight to the kernel first.
        if self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match self.socket.send(&data) {
                Ok(n) => {
                    sent = n;
                    if sent == data.len() {
                        self.schedule_write_complete();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "direct send failed");
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && sent < data.len() {
            let mut output = self.output_buffer.lock().unwrap();
            output.append(&data[sent..]);
            if !self.handler.is_writing() {
                self.handler.enable_writing();
                self.event_loop.update_handler(Arc::clone(&self.handler));
            }
        }
    }

    fn shutdown_in_loop(&self) {
        // Only close the write half once nothing is staged; otherwise the
        // drain in handle_write performs the shutdown when it finishes.
        if !self.handler.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, error = %e, "shutdown write failed");
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.handle_close();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        // EOF, hang-up, and force-close can all land here; only the first
        // one runs the close callback.
        if self.state() == ConnState::Disconnected {
            return;
        }
        info!(name = %self.name, "connection closed");
        self.set_state(ConnState::Disconnected);
        self.handler.disable_all();

        let guard = Arc::clone(self);
        let callback = self.close_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&guard);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = self.socket.take_error().ok().flatten();
        match &err {
            Some(e) => error!(name = %self.name, error = %e, "connection error"),
            None => error!(name = %self.name, "connection error"),
        }
        let callback = self.error_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&Arc::clone(self));
        }
    }

    fn schedule_write_complete(self: &Arc<Self>) {
        let callback = self.write_complete_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            let conn = Arc::clone(self);
            self.event_loop.queue_in_loop(move || callback(&conn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn tcp_pair() -> (Socket, TcpStream) {
        let listener = Socket::new().unwrap();
        listener.set_reuse_address(true).unwrap();
        listener.bind("127.0.0.1", 0).unwrap();
        listener.listen(16).unwrap();
        let port: u16 = listener
            .local_addr_string()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (sock, _) = listener.accept().unwrap().unwrap();
        sock.set_nonblocking(true).unwrap();
        (sock, client)
    }

    #[test]
    fn test_state_encoding_round_trips() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
        // Unknown encodings collapse to the terminal state.
        assert_eq!(ConnState::from_u8(42), ConnState::Disconnected);
    }

    #[test]
    fn test_establish_send_and_close() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let runner = Arc::clone(&event_loop);
        let loop_thread = thread::spawn(move || runner.run());

        let (sock, mut client) = tcp_pair();
        let conn = Connection::new(Arc::clone(&event_loop), sock, "Connection-1".into());
        assert_eq!(conn.state(), ConnState::Connecting);

        let (established_tx, established_rx) = mpsc::channel();
        conn.set_connection_callback(move |c| {
            established_tx.send(c.state()).unwrap();
        });
        let (closed_tx, closed_rx) = mpsc::channel();
        conn.set_close_callback(move |c| {
            closed_tx.send(c.name().to_string()).unwrap();
        });
        conn.set_message_callback(|conn, buffer| {
            let msg = buffer.retrieve_all_as_bytes();
            conn.send(msg);
        });

        conn.establish();
        assert_eq!(
            established_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ConnState::Connected
        );

        // Echo through the loop.
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"marco").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"marco");

        // Cross-thread send lands on the same wire.
        conn.send(Bytes::from_static(b"polo"));
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"polo");

        // Peer close runs the close callback exactly once.
        drop(client);
        assert_eq!(
            closed_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "Connection-1"
        );
        assert!(closed_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(conn.state(), ConnState::Disconnected);

        conn.destroy();
        event_loop.stop();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_double_shutdown_is_single_shutdown() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let runner = Arc::clone(&event_loop);
        let loop_thread = thread::spawn(move || runner.run());

        let (sock, mut client) = tcp_pair();
        let conn = Connection::new(Arc::clone(&event_loop), sock, "Connection-2".into());
        conn.establish();

        // Wait for establishment to land on the loop.
        let (tx, rx) = mpsc::channel();
        event_loop.run_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        conn.shutdown();
        conn.shutdown();
        assert_eq!(conn.state(), ConnState::Disconnecting);

        // The peer sees exactly one EOF.
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        conn.destroy();
        event_loop.stop();
        loop_thread.join().unwrap();
    }

    #[test]
    fn test_send_after_disconnect_is_dropped() {
        let event_loop = Arc::new(EventLoop::new().unwrap());
        let runner = Arc::clone(&event_loop);
        let loop_thread = thread::spawn(move || runner.run());

        let (sock, client) = tcp_pair();
        let conn = Connection::new(Arc::clone(&event_loop), sock, "Connection-3".into());

        // Never established: still Connecting, so sends are refused.
        conn.send(Bytes::from_static(b"dropped"));
        assert_eq!(conn.state(), ConnState::Connecting);

        drop(client);
        event_loop.stop();
        loop_thread.join().unwrap();
    }
}
