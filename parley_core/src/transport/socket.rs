//! Point-to-point socket transport
//!
//! Carries AMP messages over TCP with two patterns: emitter sockets fan
//! messages out to every connected peer (pub side), and req/rep sockets
//! correlate a request with its reply through a trailing id field.
//!
//! A socket is created with a mode tag matching the peer pairing of the
//! discovery layer:
//!
//! - `PubEmitter` — binds a listener, broadcasts to all accepted streams
//! - `SubEmitter` — connects out, receives broadcasts
//! - `Req` — connects out, round-robins requests, awaits correlated replies
//! - `Rep` — binds a listener, answers requests on the stream they came in on
//!
//! Inbound traffic is delivered on the reader thread of the connection it
//! arrived on; the registered message handler must therefore be quick or
//! hand off to its own thread.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::amp::{Field, Message};
use crate::error::{ParleyError, ParleyResult};

/// Accept-loop poll period while waiting for incoming connections
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Socket pattern tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Binds and broadcasts to every connected subscriber
    PubEmitter,
    /// Connects to publishers and receives broadcasts
    SubEmitter,
    /// Connects to repliers and sends correlated requests
    Req,
    /// Binds and replies to correlated requests
    Rep,
}

type BindHandler = dyn Fn(u16) + Send + Sync;
type MessageHandler = dyn Fn(Message) -> Option<Message> + Send + Sync;
type ErrorHandler = dyn Fn(&str) + Send + Sync;

/// One live TCP connection
struct Conn {
    id: u64,
    /// Identity the caller connected with; `None` for accepted streams
    endpoint: Option<(String, u16)>,
    /// Write half; reads run on a cloned handle owned by the reader thread
    writer: Mutex<TcpStream>,
}

struct Shared {
    mode: SocketMode,
    stopped: AtomicBool,
    next_conn: AtomicU64,
    next_request: AtomicU64,
    rr: AtomicUsize,
    conns: Mutex<Vec<Arc<Conn>>>,
    /// Signalled when a connection is added, for requesters waiting on one
    conn_ready: Condvar,
    pending: Mutex<HashMap<u64, mpsc::SyncSender<Message>>>,
    listener: Mutex<Option<TcpListener>>,
    on_bind: Mutex<Option<Box<BindHandler>>>,
    on_message: Mutex<Option<Arc<MessageHandler>>>,
    on_error: Mutex<Option<Arc<ErrorHandler>>>,
}

/// AMP socket endpoint
pub struct AmpSocket {
    shared: Arc<Shared>,
}

impl AmpSocket {
    /// Create a socket with the given pattern tag
    pub fn new(mode: SocketMode) -> Self {
        AmpSocket {
            shared: Arc::new(Shared {
                mode,
                stopped: AtomicBool::new(false),
                next_conn: AtomicU64::new(1),
                next_request: AtomicU64::new(1),
                rr: AtomicUsize::new(0),
                conns: Mutex::new(Vec::new()),
                conn_ready: Condvar::new(),
                pending: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                on_bind: Mutex::new(None),
                on_message: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Register the bind event handler
    pub fn on_bind<F: Fn(u16) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_bind.lock() = Some(Box::new(f));
    }

    /// Register the inbound message handler
    ///
    /// For `Rep` sockets the handler's return value, if any, is sent back
    /// to the requester. Other modes discard it.
    pub fn on_message<F: Fn(Message) -> Option<Message> + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_message.lock() = Some(Arc::new(f));
    }

    /// Register the error event handler
    pub fn on_error<F: Fn(&str) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_error.lock() = Some(Arc::new(f));
    }

    /// Bind the listener side (`PubEmitter`/`Rep`)
    ///
    /// Port 0 asks the OS for a free port. Fires the bind event with the
    /// effective port before accepting, then accepts in the background.
    pub fn bind(&self, port: u16) -> ParleyResult<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let bound = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let accept = listener.try_clone()?;
        *self.shared.listener.lock() = Some(listener);

        if let Some(f) = self.shared.on_bind.lock().as_ref() {
            f(bound);
        }

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || accept_loop(shared, accept));
        Ok(bound)
    }

    /// Open an outgoing connection (`SubEmitter`/`Req`)
    ///
    /// The `(host, port)` pair is the connection identity reported by
    /// [`AmpSocket::is_connected`], stored exactly as passed.
    pub fn connect(&self, host: &str, port: u16) -> ParleyResult<()> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| ParleyError::transport(format!("connect {}:{}: {}", host, port, e)))?;
        self.add_conn(Some((host.to_string(), port)), stream)?;
        Ok(())
    }

    /// Whether an outgoing connection to this endpoint is already open
    pub fn is_connected(&self, host: &str, port: u16) -> bool {
        self.shared
            .conns
            .lock()
            .iter()
            .any(|c| matches!(&c.endpoint, Some((h, p)) if h == host && *p == port))
    }

    /// Broadcast a message to every live connection
    pub fn send(&self, msg: &Message) -> ParleyResult<()> {
        let bytes = msg.encode()?;
        let conns: Vec<Arc<Conn>> = self.shared.conns.lock().clone();
        for conn in conns {
            let res = conn.writer.lock().write_all(&bytes);
            if let Err(e) = res {
                self.shared
                    .report_error(&format!("send failed, dropping connection: {}", e));
                self.shared.drop_conn(conn.id);
            }
        }
        Ok(())
    }

    /// Send a request and block for its reply (`Req`)
    ///
    /// Appends the correlation id, picks a live connection round-robin
    /// (waiting until the deadline for one to appear), and blocks for the
    /// correlated reply. On timeout the pending entry is discarded, so a
    /// late reply is silently dropped.
    pub fn request(&self, mut msg: Message, timeout: Duration) -> ParleyResult<Message> {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        msg.push(Field::BigInt(id as i64));
        let bytes = msg.encode()?;

        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.pending.lock().insert(id, tx);
        let deadline = Instant::now() + timeout;

        let conn = loop {
            let mut conns = self.shared.conns.lock();
            if self.shared.stopped.load(Ordering::SeqCst) {
                drop(conns);
                self.shared.pending.lock().remove(&id);
                return Err(ParleyError::transport("socket closed"));
            }
            if !conns.is_empty() {
                let idx = self.shared.rr.fetch_add(1, Ordering::Relaxed) % conns.len();
                break Arc::clone(&conns[idx]);
            }
            let now = Instant::now();
            if now >= deadline {
                drop(conns);
                self.shared.pending.lock().remove(&id);
                return Err(ParleyError::timeout("no replier available"));
            }
            self.shared.conn_ready.wait_for(&mut conns, deadline - now);
        };

        if let Err(e) = conn.writer.lock().write_all(&bytes) {
            self.shared.pending.lock().remove(&id);
            self.shared.drop_conn(conn.id);
            return Err(ParleyError::transport(format!("request write failed: {}", e)));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(ParleyError::timeout("no reply before deadline"))
            }
        }
    }

    /// Shut the socket down: stop accepting, close every stream
    ///
    /// Idempotent. Reader threads notice the closed streams and unwind on
    /// their own.
    pub fn close(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.listener.lock().take();
        let conns: Vec<Arc<Conn>> = {
            let mut guard = self.shared.conns.lock();
            std::mem::take(&mut *guard)
        };
        for conn in conns {
            let _ = conn.writer.lock().shutdown(Shutdown::Both);
        }
        self.shared.conn_ready.notify_all();
        self.shared.pending.lock().clear();
    }

    fn add_conn(&self, endpoint: Option<(String, u16)>, stream: TcpStream) -> ParleyResult<()> {
        Shared::register(&self.shared, endpoint, stream)
    }
}

impl Drop for AmpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn register(
        shared: &Arc<Shared>,
        endpoint: Option<(String, u16)>,
        stream: TcpStream,
    ) -> ParleyResult<()> {
        let reader = stream.try_clone()?;
        let conn = Arc::new(Conn {
            id: shared.next_conn.fetch_add(1, Ordering::Relaxed),
            endpoint,
            writer: Mutex::new(stream),
        });
        {
            let mut conns = shared.conns.lock();
            conns.push(Arc::clone(&conn));
        }
        shared.conn_ready.notify_all();

        let shared = Arc::clone(shared);
        thread::spawn(move || reader_loop(shared, conn, reader));
        Ok(())
    }

    fn drop_conn(&self, id: u64) {
        self.conns.lock().retain(|c| c.id != id);
    }

    fn report_error(&self, msg: &str) {
        let handler = self.on_error.lock().clone();
        if let Some(f) = handler {
            f(msg);
        }
    }

    fn message_handler(&self) -> Option<Arc<MessageHandler>> {
        self.on_message.lock().clone()
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("accepted connection from {}", addr);
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                if let Err(e) = Shared::register(&shared, None, stream) {
                    shared.report_error(&format!("failed to register connection: {}", e));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if !shared.stopped.load(Ordering::SeqCst) {
                    shared.report_error(&format!("accept failed: {}", e));
                }
                break;
            }
        }
    }
}

fn reader_loop(shared: Arc<Shared>, conn: Arc<Conn>, mut stream: TcpStream) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        match Message::read_from(&mut stream) {
            Ok(Some(msg)) => handle_inbound(&shared, &conn, msg),
            Ok(None) => break,
            Err(e) => {
                if !shared.stopped.load(Ordering::SeqCst) {
                    shared.report_error(&format!("read failed: {}", e));
                }
                break;
            }
        }
    }
    shared.drop_conn(conn.id);
}

fn handle_inbound(shared: &Shared, conn: &Conn, mut msg: Message) {
    match shared.mode {
        SocketMode::SubEmitter => {
            if let Some(handler) = shared.message_handler() {
                handler(msg);
            }
        }
        SocketMode::Rep => {
            // Requests carry their correlation id as the trailing field
            let id = match msg.pop_back() {
                Some(Field::BigInt(id)) => id,
                _ => {
                    debug!("dropping request without correlation id");
                    return;
                }
            };
            let reply = shared.message_handler().and_then(|handler| handler(msg));
            if let Some(mut reply) = reply {
                reply.push_front(Field::BigInt(id));
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(e) = conn.writer.lock().write_all(&bytes) {
                            shared.report_error(&format!("reply write failed: {}", e));
                        }
                    }
                    Err(e) => shared.report_error(&format!("reply encode failed: {}", e)),
                }
            }
        }
        SocketMode::Req => {
            // Replies lead with the correlation id of their request
            let id = match msg.pop_front() {
                Some(Field::BigInt(id)) => id as u64,
                _ => {
                    debug!("dropping reply without correlation id");
                    return;
                }
            };
            match shared.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.try_send(msg);
                }
                None => debug!("dropping late reply {}", id),
            }
        }
        SocketMode::PubEmitter => {
            warn!("unexpected inbound message on pub-emitter socket");
        }
    }
}
