//! Peer discovery over UDP hello beacons
//!
//! Each service periodically announces itself with a JSON beacon on a
//! shared segment port (multicast group, broadcast address, or explicit
//! unicast targets) and tracks the beacons of everyone else. A previously
//! unseen instance fires `added`; an instance that stays silent past the
//! node timeout fires `removed`. The advertisement carried in the beacon is
//! opaque to this layer.
//!
//! Master accounting mirrors the segment-election convention: when fewer
//! than `mastersRequired` masters have been heard from for `masterTimeout`,
//! the highest-weight non-client service promotes itself. Mastership only
//! changes the beacon flag; consumers are free to ignore it.

pub(crate) mod beacon;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use uuid::Uuid;

use crate::core::options::OptionValue;
use crate::error::{ParleyError, ParleyResult};
use beacon::{Beacon, HELLO_EVENT};

/// Receive poll period; bounds how quickly stop() is observed
const RECV_POLL: Duration = Duration::from_millis(250);

/// Discovery configuration bag
///
/// Every knob is settable by name through [`Discovery::set_option`]; the
/// node layer forwards the discovery-scoped option names here verbatim.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub hello_interval: Duration,
    pub check_interval: Duration,
    pub node_timeout: Duration,
    pub master_timeout: Duration,
    pub address: String,
    pub port: u16,
    pub broadcast: String,
    pub multicast: Option<String>,
    pub multicast_ttl: u32,
    pub unicast: Vec<String>,
    pub key: Option<String>,
    pub masters_required: u32,
    pub weight: f64,
    pub client: bool,
    pub reuse_addr: bool,
    pub ignore_process: bool,
    pub ignore_instance: bool,
    pub hostname: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            hello_interval: Duration::from_millis(1000),
            check_interval: Duration::from_millis(2000),
            node_timeout: Duration::from_millis(2000),
            master_timeout: Duration::from_millis(2000),
            address: "0.0.0.0".to_string(),
            port: 12345,
            broadcast: "255.255.255.255".to_string(),
            multicast: None,
            multicast_ttl: 1,
            unicast: Vec::new(),
            key: None,
            masters_required: 1,
            weight: default_weight(),
            client: false,
            reuse_addr: true,
            ignore_process: false,
            ignore_instance: true,
            hostname: local_hostname(),
        }
    }
}

/// Start-time based weight: later starters weigh more, which breaks
/// promotion ties deterministically
fn default_weight() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64() * 1e-9,
        Err(_) => 0.0,
    }
}

/// Get the local hostname using libc gethostname
fn local_hostname() -> String {
    let mut buf = [0u8; 256];

    // SAFETY: gethostname writes to the buffer and returns 0 on success
    let result = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if result != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

/// Another service observed on the segment
#[derive(Debug, Clone)]
pub struct Peer {
    /// Instance id from the beacon
    pub iid: String,
    /// Process id from the beacon
    pub pid: u32,
    /// Sender address of the most recent beacon
    pub address: String,
    /// Hostname from the beacon
    pub hostname: String,
    pub is_master: bool,
    /// Advertisement payload, opaque at this layer
    pub advertisement: Option<Value>,
}

struct PeerState {
    peer: Peer,
    weight: f64,
    last_seen: Instant,
}

type PeerHandler = dyn Fn(&Peer) + Send + Sync;
type ErrorHandler = dyn Fn(&str) + Send + Sync;

struct DiscoveryShared {
    iid: String,
    pid: u32,
    stopped: AtomicBool,
    is_master: AtomicBool,
    options: Mutex<DiscoveryOptions>,
    advertisement: Mutex<Option<Value>>,
    peers: Mutex<HashMap<String, PeerState>>,
    last_master_seen: Mutex<Option<Instant>>,
    /// Interval sleeps park here so stop() can wake them early
    wake: (Mutex<bool>, Condvar),
    on_added: Mutex<Option<Arc<PeerHandler>>>,
    on_removed: Mutex<Option<Arc<PeerHandler>>>,
    on_error: Mutex<Option<Arc<ErrorHandler>>>,
}

/// Discovery service instance
pub struct Discovery {
    shared: Arc<DiscoveryShared>,
    started: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Create a stopped discovery service with default options
    pub fn new() -> Self {
        Discovery {
            shared: Arc::new(DiscoveryShared {
                iid: Uuid::new_v4().to_string(),
                pid: std::process::id(),
                stopped: AtomicBool::new(false),
                is_master: AtomicBool::new(false),
                options: Mutex::new(DiscoveryOptions::default()),
                advertisement: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                last_master_seen: Mutex::new(None),
                wake: (Mutex::new(false), Condvar::new()),
                on_added: Mutex::new(None),
                on_removed: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Instance id carried in this service's beacons
    pub fn iid(&self) -> &str {
        &self.shared.iid
    }

    /// Register the peer-added event handler
    pub fn on_added<F: Fn(&Peer) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_added.lock() = Some(Arc::new(f));
    }

    /// Register the peer-removed event handler
    pub fn on_removed<F: Fn(&Peer) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_removed.lock() = Some(Arc::new(f));
    }

    /// Register the error event handler
    pub fn on_error<F: Fn(&str) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_error.lock() = Some(Arc::new(f));
    }

    /// Replace the advertisement carried by subsequent beacons
    pub fn advertise(&self, advertisement: Option<Value>) {
        *self.shared.advertisement.lock() = advertisement;
    }

    #[cfg(test)]
    pub(crate) fn advertisement(&self) -> Option<Value> {
        self.shared.advertisement.lock().clone()
    }

    /// Set a discovery option by wire name
    ///
    /// Unknown names and mistyped values are rejected. Interval changes
    /// take effect on the next loop turn; socket-scoped options (address,
    /// port, reuseAddr, multicast membership) apply at [`Discovery::start`].
    pub fn set_option(&self, name: &str, value: &OptionValue) -> ParleyResult<()> {
        let mut opts = self.shared.options.lock();
        match name {
            "helloInterval" => opts.hello_interval = value.as_millis()?,
            "checkInterval" => opts.check_interval = value.as_millis()?,
            "nodeTimeout" => opts.node_timeout = value.as_millis()?,
            "masterTimeout" => opts.master_timeout = value.as_millis()?,
            "address" => opts.address = value.as_str()?.to_string(),
            "port" => opts.port = value.as_port()?,
            "broadcast" => opts.broadcast = value.as_str()?.to_string(),
            "multicast" => opts.multicast = Some(value.as_str()?.to_string()),
            "multicastTTL" => opts.multicast_ttl = value.as_u32()?,
            "unicast" => opts.unicast = value.as_string_list()?,
            "key" => opts.key = Some(value.as_str()?.to_string()),
            "mastersRequired" => opts.masters_required = value.as_u32()?,
            "weight" => opts.weight = value.as_f64()?,
            "client" => opts.client = value.as_bool()?,
            "reuseAddr" => opts.reuse_addr = value.as_bool()?,
            "ignoreProcess" => opts.ignore_process = value.as_bool()?,
            "ignoreInstance" => opts.ignore_instance = value.as_bool()?,
            "hostname" => opts.hostname = value.as_str()?.to_string(),
            _ => {
                return Err(ParleyError::invalid_input(format!(
                    "unknown discovery option '{}'",
                    name
                )))
            }
        }
        Ok(())
    }

    /// Bind the segment socket and start the hello/receive/check loops
    pub fn start(&self) -> ParleyResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ParleyError::invalid_input("discovery already started"));
        }

        let socket = self.open_socket()?;
        let mut threads = self.threads.lock();

        let shared = Arc::clone(&self.shared);
        let tx = socket.try_clone()?;
        threads.push(thread::spawn(move || hello_loop(shared, tx)));

        let shared = Arc::clone(&self.shared);
        threads.push(thread::spawn(move || recv_loop(shared, socket)));

        let shared = Arc::clone(&self.shared);
        threads.push(thread::spawn(move || check_loop(shared)));

        Ok(())
    }

    /// Stop the loops and join every one not running on the calling thread
    ///
    /// Idempotent. An event handler is allowed to trigger teardown, which
    /// is why its own loop thread is skipped when joining.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let (lock, cvar) = &self.shared.wake;
            *lock.lock() = true;
            cvar.notify_all();
        }
        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.threads.lock();
            std::mem::take(&mut *guard)
        };
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    fn open_socket(&self) -> ParleyResult<UdpSocket> {
        let opts = self.shared.options.lock().clone();

        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        sock.set_reuse_address(opts.reuse_addr)?;

        let ip: Ipv4Addr = opts
            .address
            .parse()
            .map_err(|_| ParleyError::discovery(format!("bad bind address '{}'", opts.address)))?;
        let bind_addr = SocketAddr::from((ip, opts.port));
        sock.bind(&bind_addr.into())
            .map_err(|e| ParleyError::discovery(format!("bind {}: {}", bind_addr, e)))?;
        sock.set_broadcast(true)?;

        if let Some(group) = &opts.multicast {
            let group: Ipv4Addr = group
                .parse()
                .map_err(|_| ParleyError::discovery(format!("bad multicast group '{}'", group)))?;
            sock.set_multicast_loop_v4(true)?;
            sock.set_multicast_ttl_v4(opts.multicast_ttl)?;
            if sock
                .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                .is_err()
            {
                // No routable interface for the group: fall back to loopback
                // so same-host peers still hear each other
                sock.join_multicast_v4(&group, &Ipv4Addr::LOCALHOST)
                    .map_err(|e| {
                        ParleyError::discovery(format!("join multicast {}: {}", group, e))
                    })?;
                sock.set_multicast_if_v4(&Ipv4Addr::LOCALHOST)?;
            }
        }

        let socket: UdpSocket = sock.into();
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(socket)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DiscoveryShared {
    fn report_error(&self, msg: &str) {
        let handler = self.on_error.lock().clone();
        if let Some(f) = handler {
            f(msg);
        }
    }

    /// Park for `dur` or until stop() wakes the condvar
    fn sleep(&self, dur: Duration) {
        let (lock, cvar) = &self.wake;
        let mut stopped = lock.lock();
        if !*stopped {
            cvar.wait_for(&mut stopped, dur);
        }
    }
}

fn hello_loop(shared: Arc<DiscoveryShared>, socket: UdpSocket) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = send_hello(&shared, &socket) {
            shared.report_error(&format!("hello send failed: {}", e));
        }
        let interval = shared.options.lock().hello_interval;
        shared.sleep(interval);
    }
}

fn send_hello(shared: &DiscoveryShared, socket: &UdpSocket) -> ParleyResult<()> {
    let (port, destination, unicast, weight, key, hostname) = {
        let opts = shared.options.lock();
        (
            opts.port,
            opts.multicast
                .clone()
                .unwrap_or_else(|| opts.broadcast.clone()),
            opts.unicast.clone(),
            opts.weight,
            opts.key.clone(),
            opts.hostname.clone(),
        )
    };
    let beacon = Beacon {
        event: HELLO_EVENT.to_string(),
        iid: shared.iid.clone(),
        pid: shared.pid,
        hostname,
        is_master: shared.is_master.load(Ordering::SeqCst),
        weight,
        key,
        advertisement: shared.advertisement.lock().clone(),
    };
    let bytes = beacon.encode()?;

    socket
        .send_to(&bytes, (destination.as_str(), port))
        .map_err(|e| ParleyError::discovery(format!("send to {}:{}: {}", destination, port, e)))?;
    for target in unicast {
        if let Err(e) = socket.send_to(&bytes, (target.as_str(), port)) {
            warn!("unicast hello to {}:{} failed: {}", target, port, e);
        }
    }
    Ok(())
}

fn recv_loop(shared: Arc<DiscoveryShared>, socket: UdpSocket) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => handle_beacon(&shared, &buf[..len], src),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if !shared.stopped.load(Ordering::SeqCst) {
                    shared.report_error(&format!("receive failed: {}", e));
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

fn handle_beacon(shared: &Arc<DiscoveryShared>, buf: &[u8], src: SocketAddr) {
    let beacon = match Beacon::decode(buf) {
        Ok(b) => b,
        Err(e) => {
            debug!("dropping malformed beacon from {}: {}", src, e);
            return;
        }
    };
    if beacon.event != HELLO_EVENT {
        debug!("dropping beacon with event '{}'", beacon.event);
        return;
    }

    let (ignore_instance, ignore_process, key) = {
        let opts = shared.options.lock();
        (opts.ignore_instance, opts.ignore_process, opts.key.clone())
    };
    if ignore_instance && beacon.iid == shared.iid {
        return;
    }
    if ignore_process && beacon.pid == shared.pid {
        return;
    }
    if beacon.key != key {
        debug!("dropping beacon from {} with mismatched key", src);
        return;
    }

    if beacon.is_master {
        *shared.last_master_seen.lock() = Some(Instant::now());
    }

    let added = {
        let mut peers = shared.peers.lock();
        match peers.entry(beacon.iid) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.last_seen = Instant::now();
                state.weight = beacon.weight;
                state.peer.address = src.ip().to_string();
                state.peer.hostname = beacon.hostname;
                state.peer.is_master = beacon.is_master;
                state.peer.advertisement = beacon.advertisement;
                None
            }
            Entry::Vacant(entry) => {
                let peer = Peer {
                    iid: entry.key().clone(),
                    pid: beacon.pid,
                    address: src.ip().to_string(),
                    hostname: beacon.hostname,
                    is_master: beacon.is_master,
                    advertisement: beacon.advertisement,
                };
                entry.insert(PeerState {
                    peer: peer.clone(),
                    weight: beacon.weight,
                    last_seen: Instant::now(),
                });
                Some(peer)
            }
        }
    };

    if let Some(peer) = added {
        debug!("peer {} added from {}", peer.iid, src);
        let handler = shared.on_added.lock().clone();
        if let Some(f) = handler {
            f(&peer);
        }
    }
}

fn check_loop(shared: Arc<DiscoveryShared>) {
    loop {
        let interval = shared.options.lock().check_interval;
        shared.sleep(interval);
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let timeout = shared.options.lock().node_timeout;
        let expired: Vec<Peer> = {
            let mut peers = shared.peers.lock();
            let gone: Vec<String> = peers
                .iter()
                .filter(|(_, s)| s.last_seen.elapsed() > timeout)
                .map(|(iid, _)| iid.clone())
                .collect();
            gone.into_iter()
                .filter_map(|iid| peers.remove(&iid))
                .map(|s| s.peer)
                .collect()
        };
        for peer in &expired {
            debug!("peer {} timed out", peer.iid);
            let handler = shared.on_removed.lock().clone();
            if let Some(f) = handler {
                f(peer);
            }
        }

        master_accounting(&shared);
    }
}

/// Promote this service when the segment has run short of masters
fn master_accounting(shared: &DiscoveryShared) {
    let (client, required, weight, master_timeout) = {
        let opts = shared.options.lock();
        (
            opts.client,
            opts.masters_required,
            opts.weight,
            opts.master_timeout,
        )
    };
    if client || shared.is_master.load(Ordering::SeqCst) {
        return;
    }

    let peers = shared.peers.lock();
    let masters = peers.values().filter(|s| s.peer.is_master).count() as u32;
    if masters >= required {
        return;
    }

    let waited_out = match *shared.last_master_seen.lock() {
        Some(seen) => seen.elapsed() >= master_timeout,
        None => true,
    };
    if !waited_out {
        return;
    }

    let heaviest_candidate = peers
        .values()
        .filter(|s| !s.peer.is_master)
        .map(|s| s.weight)
        .fold(f64::MIN, f64::max);
    if weight >= heaviest_candidate {
        debug!("promoting self to master (weight {})", weight);
        shared.is_master.store(true, Ordering::SeqCst);
    }
}
