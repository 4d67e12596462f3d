// src/wire/mod.rs - KOB wire client
//
// Connects to a KOB server over UDP, exchanges 496-byte code/ID packets and
// 2-byte command packets, and monitors the current sender and the stations
// heard on the wire.
pub mod packet;

use crate::error::{Error, Result};
use crate::morse::{CodeSeq, DISCONTINUITY};
use crate::sync::Event;
use packet::{
    decode, encode_long, encode_short, Packet, CMD_CONNECT, CMD_DISCONNECT, MAX_CODE_PER_PACKET,
};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default KOB server port.
pub const DEFAULT_PORT: u16 = 7890;
/// Socket read timeout; bounds how fast the read loop observes shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Interval between keep-alive ID packets.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// A station unheard for this long is dropped from the monitor set.
const STATION_TIMEOUT: Duration = Duration::from_secs(30);

pub type CodeCallback = Box<dyn Fn(CodeSeq) + Send + Sync>;
pub type IdCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

pub struct WireCallbacks {
    /// Inbound code sequences, discontinuities already marked.
    pub code: Option<CodeCallback>,
    /// The current sender changed.
    pub sender: Option<IdCallback>,
    /// A station was heard (ID packet).
    pub station: Option<IdCallback>,
    /// The read loop failed hard and the session is no longer connected.
    pub disconnected: Option<DisconnectCallback>,
}

struct WireState {
    connected: bool,
    wire: u16,
    seq_out: u32,
    seq_in: Option<u32>,
    t_last_listener: Option<Instant>,
    current_sender: String,
    stations: HashMap<String, Instant>,
}

struct Inner {
    socket: UdpSocket,
    server_url: String,
    server: Mutex<Option<SocketAddr>>,
    station_id: String,
    state: Mutex<WireState>,
    callbacks: WireCallbacks,
    write_lock: Mutex<()>,
    shutdown: Event,
    session_stop: Event,
}

/// KOB wire client. One instance per server session; `connect`/`disconnect`
/// may be called repeatedly.
pub struct WireClient {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WireClient {
    pub fn new(server_url: &str, station_id: &str, callbacks: WireCallbacks) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self {
            inner: Arc::new(Inner {
                socket,
                server_url: server_url.to_string(),
                server: Mutex::new(None),
                station_id: station_id.to_string(),
                state: Mutex::new(WireState {
                    connected: false,
                    wire: 0,
                    seq_out: 0,
                    seq_in: None,
                    t_last_listener: None,
                    current_sender: String::new(),
                    stations: HashMap::new(),
                }),
                callbacks,
                write_lock: Mutex::new(()),
                shutdown: Event::new(),
                session_stop: Event::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    pub fn current_sender(&self) -> String {
        self.inner.state.lock().unwrap().current_sender.clone()
    }

    /// Stations heard on the wire within the liveness window.
    pub fn stations(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .stations
            .keys()
            .cloned()
            .collect()
    }

    /// True if any packet arrived within `window` (someone is listening).
    pub fn has_listener(&self, window: Duration) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .t_last_listener
            .is_some_and(|t| t.elapsed() <= window)
    }

    /// Join a wire: announce with a connect command and an ID packet, then
    /// keep announcing every few seconds.
    pub fn connect(&self, wire: u16) -> Result<()> {
        if self.inner.shutdown.is_set() {
            return Err(Error::Wire("client is shut down".into()));
        }
        self.disconnect();
        // The server is resolved per connect so construction works offline.
        let addr = resolve(&self.inner.server_url)?;
        *self.inner.server.lock().unwrap() = Some(addr);
        {
            let mut st = self.inner.state.lock().unwrap();
            st.connected = true;
            st.wire = wire;
            st.seq_in = None;
            st.current_sender.clear();
            st.stations.clear();
        }
        self.inner.session_stop.clear();
        send_short(&self.inner, CMD_CONNECT)?;
        send_id(&self.inner)?;
        let mut threads = self.threads.lock().unwrap();
        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name("wire-read".into())
                .spawn(move || read_loop(&inner))
                .map_err(Error::Io)?,
        );
        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name("wire-keepalive".into())
                .spawn(move || keep_alive_loop(&inner))
                .map_err(Error::Io)?,
        );
        log::info!("connected to wire {wire} at {addr}");
        Ok(())
    }

    /// Leave the wire. Safe to call when not connected.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut st = self.inner.state.lock().unwrap();
            let was = st.connected;
            st.connected = false;
            was
        };
        self.inner.session_stop.set();
        if was_connected {
            if let Err(e) = send_short(&self.inner, CMD_DISCONNECT) {
                log::warn!("disconnect send failed: {e}");
            }
        }
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
        if was_connected {
            log::info!("disconnected from wire");
        }
    }

    /// Send a code sequence, splitting across packets when it exceeds the
    /// per-packet payload. The sequence number advances by 2 per packet.
    pub fn write(&self, code: &[i32]) -> Result<()> {
        if !self.connected() {
            return Err(Error::NotConnected);
        }
        for chunk in code.chunks(MAX_CODE_PER_PACKET) {
            let (seq, wire) = {
                let mut st = self.inner.state.lock().unwrap();
                st.seq_out += 2;
                (st.seq_out, st.wire)
            };
            let pkt = encode_long(&self.inner.station_id, seq, chunk, wire);
            let server = server_addr(&self.inner)?;
            let _w = self.inner.write_lock.lock().unwrap();
            self.inner.socket.send_to(&pkt, server)?;
        }
        Ok(())
    }

    /// Shut the client down for good. Idempotent.
    pub fn exit(&self) {
        self.inner.shutdown.set();
        self.disconnect();
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.exit();
    }
}

fn resolve(server_url: &str) -> Result<SocketAddr> {
    let target = if server_url.contains(':') {
        server_url.to_string()
    } else {
        format!("{server_url}:{DEFAULT_PORT}")
    };
    target
        .to_socket_addrs()
        .map_err(|e| Error::Wire(format!("cannot resolve '{server_url}': {e}")))?
        .next()
        .ok_or_else(|| Error::Wire(format!("no address for '{server_url}'")))
}

fn server_addr(inner: &Inner) -> Result<SocketAddr> {
    inner
        .server
        .lock()
        .unwrap()
        .ok_or_else(|| Error::Wire("server not resolved".into()))
}

fn send_short(inner: &Inner, cmd: u16) -> Result<()> {
    let pkt = encode_short(cmd);
    let server = server_addr(inner)?;
    let _w = inner.write_lock.lock().unwrap();
    inner.socket.send_to(&pkt, server)?;
    Ok(())
}

/// ID packets carry the current sequence number (without advancing it) and
/// the wire number in the status slot.
fn send_id(inner: &Inner) -> Result<()> {
    let (seq, wire) = {
        let st = inner.state.lock().unwrap();
        (st.seq_out, st.wire)
    };
    let pkt = encode_long(&inner.station_id, seq, &[], wire);
    let server = server_addr(inner)?;
    let _w = inner.write_lock.lock().unwrap();
    inner.socket.send_to(&pkt, server)?;
    Ok(())
}

fn keep_alive_loop(inner: &Inner) {
    while !inner.session_stop.wait(KEEP_ALIVE_INTERVAL) {
        if inner.shutdown.is_set() {
            break;
        }
        if let Err(e) = send_id(inner) {
            log::warn!("keep-alive send failed: {e}");
        }
    }
    log::debug!("keep-alive thread done");
}

fn read_loop(inner: &Inner) {
    let mut buf = [0u8; 1024];
    while !inner.session_stop.is_set() && !inner.shutdown.is_set() {
        let n = match inner.socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if inner.session_stop.is_set() || inner.shutdown.is_set() {
                    break;
                }
                log::error!("wire read failed: {e}; marking session disconnected");
                inner.state.lock().unwrap().connected = false;
                inner.session_stop.set();
                if let Some(cb) = &inner.callbacks.disconnected {
                    cb();
                }
                break;
            }
        };
        match decode(&buf[..n]) {
            Ok(Packet::Short(cmd)) => {
                // ACKs and other short commands are not interesting here.
                log::trace!("short packet cmd={cmd}");
            }
            Ok(Packet::Long(pkt)) => handle_long(inner, pkt),
            Err(e) => log::warn!("dropping packet: {e}"),
        }
    }
    log::debug!("wire read thread done");
}

fn handle_long(inner: &Inner, pkt: packet::LongPacket) {
    let now = Instant::now();
    let mut sender_changed = None;
    let mut deliver: Option<CodeSeq> = None;
    {
        let mut st = inner.state.lock().unwrap();
        if !st.connected {
            return;
        }
        st.t_last_listener = Some(now);
        // The timestamp updates on every packet from the station, accepted
        // by the sequence check or not.
        st.stations.insert(pkt.station_id.clone(), now);
        st.stations.retain(|_, t| now - *t <= STATION_TIMEOUT);
        if st.current_sender != pkt.station_id {
            st.current_sender = pkt.station_id.clone();
            sender_changed = Some(pkt.station_id.clone());
        }
        if pkt.is_id() {
            // An ID packet two ahead resets the expected sequence.
            if st.seq_in.is_some_and(|s| pkt.seq_no == s.wrapping_add(2)) {
                st.seq_in = Some(pkt.seq_no);
            }
        } else {
            match st.seq_in {
                Some(s) if pkt.seq_no == s => {
                    // duplicate; drop
                }
                Some(s) if pkt.seq_no == s.wrapping_add(1) => {
                    st.seq_in = Some(pkt.seq_no);
                    deliver = Some(pkt.code.clone());
                }
                Some(_) => {
                    // dropped or reordered packets: flag the discontinuity
                    let mut code = pkt.code.clone();
                    if !code.is_empty() {
                        code[0] = DISCONTINUITY;
                    } else {
                        code.push(DISCONTINUITY);
                    }
                    st.seq_in = Some(pkt.seq_no);
                    deliver = Some(code);
                }
                None => {
                    st.seq_in = Some(pkt.seq_no);
                    deliver = Some(pkt.code.clone());
                }
            }
        }
    }
    if let Some(id) = &sender_changed {
        if let Some(cb) = &inner.callbacks.sender {
            cb(id);
        }
    }
    if pkt.is_id() {
        if let Some(cb) = &inner.callbacks.station {
            cb(&pkt.station_id);
        }
    } else if let Some(code) = deliver {
        if let Some(cb) = &inner.callbacks.code {
            cb(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn loopback_server() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    fn client(addr: SocketAddr, code_tx: mpsc::Sender<CodeSeq>) -> WireClient {
        WireClient::new(
            &addr.to_string(),
            "TEST STATION",
            WireCallbacks {
                code: Some(Box::new(move |c| {
                    let _ = code_tx.send(c);
                })),
                sender: None,
                station: None,
                disconnected: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn connect_announces_and_write_advances_by_two() {
        let (server, addr) = loopback_server();
        let (tx, _rx) = mpsc::channel();
        let c = client(addr, tx);
        c.connect(108).unwrap();
        let mut buf = [0u8; 1024];
        // CON short packet
        let (n, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(decode(&buf[..n]).unwrap(), Packet::Short(CMD_CONNECT));
        // ID packet carrying the wire number in the status slot
        let (n, _) = server.recv_from(&mut buf).unwrap();
        match decode(&buf[..n]).unwrap() {
            Packet::Long(p) => {
                assert!(p.is_id());
                assert_eq!(p.station_id, "TEST STATION");
                assert_eq!(p.status, 108);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Two code writes: sequence numbers differ by 2 and are ordered.
        c.write(&[-230, 60]).unwrap();
        c.write(&[-60, 180]).unwrap();
        let (n, _) = server.recv_from(&mut buf).unwrap();
        let s1 = match decode(&buf[..n]).unwrap() {
            Packet::Long(p) => {
                assert_eq!(p.code, vec![-230, 60]);
                p.seq_no
            }
            other => panic!("unexpected {other:?}"),
        };
        let (n, _) = server.recv_from(&mut buf).unwrap();
        let s2 = match decode(&buf[..n]).unwrap() {
            Packet::Long(p) => p.seq_no,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(s2, s1 + 2);
        c.exit();
        // Disconnect short packet follows
        let (n, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(decode(&buf[..n]).unwrap(), Packet::Short(CMD_DISCONNECT));
    }

    #[test]
    fn sequence_break_injects_discontinuity() {
        let (server, addr) = loopback_server();
        let (tx, rx) = mpsc::channel();
        let c = client(addr, tx);
        c.connect(5).unwrap();
        let mut buf = [0u8; 1024];
        let (_, client_addr) = server.recv_from(&mut buf).unwrap(); // CON
        let _ = server.recv_from(&mut buf).unwrap(); // ID

        // First code packet establishes the sequence.
        let p = encode_long("KA", 41, &[-200, 60], 5);
        server.send_to(&p, client_addr).unwrap();
        let code = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(code, vec![-200, 60]);

        // 41 -> 42 is in order: delivered untouched.
        let p = encode_long("KA", 42, &[-60, 60], 5);
        server.send_to(&p, client_addr).unwrap();
        let code = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(code, vec![-60, 60]);

        // 42 -> 45 is a break: leading element becomes the sentinel.
        let p = encode_long("KA", 45, &[-300, 120], 5);
        server.send_to(&p, client_addr).unwrap();
        let code = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(code, vec![DISCONTINUITY, 120]);

        // A duplicate of 45 is dropped.
        let p = encode_long("KA", 45, &[-300, 120], 5);
        server.send_to(&p, client_addr).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        c.exit();
    }

    #[test]
    fn sender_change_observed_once_per_station() {
        let (server, addr) = loopback_server();
        let (sender_tx, sender_rx) = mpsc::channel::<String>();
        let c = WireClient::new(
            &addr.to_string(),
            "ME",
            WireCallbacks {
                code: None,
                sender: Some(Box::new(move |s| {
                    let _ = sender_tx.send(s.to_string());
                })),
                station: None,
                disconnected: None,
            },
        )
        .unwrap();
        c.connect(3).unwrap();
        let mut buf = [0u8; 1024];
        let (_, client_addr) = server.recv_from(&mut buf).unwrap();
        let _ = server.recv_from(&mut buf).unwrap();

        server
            .send_to(&encode_long("ALPHA", 10, &[-100, 60], 3), client_addr)
            .unwrap();
        server
            .send_to(&encode_long("ALPHA", 11, &[-100, 60], 3), client_addr)
            .unwrap();
        server
            .send_to(&encode_long("BRAVO", 20, &[-100, 60], 3), client_addr)
            .unwrap();
        assert_eq!(
            sender_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "ALPHA"
        );
        assert_eq!(
            sender_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "BRAVO"
        );
        // Same station twice produced a single notification.
        assert!(sender_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(c.stations().len(), 2);
        c.exit();
    }
}
