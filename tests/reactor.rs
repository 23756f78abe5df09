use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netloop::{Builder, Conn, Error, Handler, State};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::try_init();
}

#[derive(Debug, PartialEq)]
enum Ev {
    Open(Option<String>),
    Data(Vec<u8>),
    Close(Option<String>),
}

/// Forwards every callback into a channel so tests can assert on ordering.
struct Recorder {
    tx: Mutex<Sender<Ev>>,
    consume: bool,
}

impl Recorder {
    fn new() -> (Recorder, Receiver<Ev>) {
        Recorder::with_consume(true)
    }

    /// Records data without consuming any of it, so the loop retains the
    /// full tail between reads.
    fn hoarding() -> (Recorder, Receiver<Ev>) {
        Recorder::with_consume(false)
    }

    fn with_consume(consume: bool) -> (Recorder, Receiver<Ev>) {
        let (tx, rx) = channel();
        (
            Recorder {
                tx: Mutex::new(tx),
                consume,
            },
            rx,
        )
    }

    fn emit(&self, ev: Ev) {
        let _ = self.tx.lock().unwrap().send(ev);
    }
}

impl Handler for Recorder {
    fn on_open(&self, conn: &Conn) {
        let ctx = conn.context::<String>().map(|s| s.clone());
        self.emit(Ev::Open(ctx));
    }

    fn on_data(&self, _conn: &Conn, data: &[u8]) -> usize {
        self.emit(Ev::Data(data.to_vec()));
        if self.consume {
            data.len()
        } else {
            0
        }
    }

    fn on_close(&self, _conn: &Conn, err: Option<&std::io::Error>) {
        self.emit(Ev::Close(err.map(|e| e.to_string())));
    }
}

/// Accepts connections and echoes whatever arrives back to the sender.
fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

#[test]
fn tcp_echo_round_trip() {
    init();
    let addr = spawn_echo_server();

    let (recorder, rx) = Recorder::new();
    let reactor = Builder::new().loops(2).build(recorder).unwrap();

    let conn = reactor
        .dial(&format!("tcp://{}", addr), "ping-conn".to_string())
        .unwrap();

    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Ev::Open(Some("ping-conn".to_string()))
    );
    assert_eq!(conn.state(), State::Open);
    match conn.remote_addr() {
        netloop::Addr::Ip(remote) => assert_eq!(*remote, addr),
        other => panic!("expected ip remote, got {:?}", other),
    }

    conn.send(b"ping").unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"ping".to_vec()));

    conn.close();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Close(None));
    assert_eq!(conn.state(), State::Closed);

    // Send after close fails without reaching a loop.
    match conn.send(b"late") {
        Err(Error::Closed) => {}
        other => panic!("expected closed error, got {:?}", other.err()),
    }
}

#[test]
fn dial_missing_unix_socket_fails_with_connect_error() {
    init();
    let dir = tempdir::TempDir::new("netloop-test").unwrap();
    let path = dir.path().join("missing.sock");

    let (recorder, rx) = Recorder::new();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();

    match reactor.dial(&format!("unix://{}", path.display()), ()) {
        Err(Error::Connect(_)) => {}
        other => panic!("expected connect error, got {:?}", other.map(|_| ())),
    }

    // Nothing was registered, so no callback may arrive.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn dial_rejects_malformed_addresses() {
    init();
    let (recorder, _rx) = Recorder::new();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();

    match reactor.dial("bogus://localhost:1", ()) {
        Err(Error::Addr(_)) => {}
        other => panic!("expected address error, got {:?}", other.map(|_| ())),
    }

    match reactor.dial("ip://127.0.0.1", ()) {
        Err(Error::Connect(_)) => {}
        other => panic!("expected connect error, got {:?}", other.map(|_| ())),
    }
}

struct CloseCounter {
    closes: Arc<AtomicUsize>,
}

impl Handler for CloseCounter {
    fn on_close(&self, _conn: &Conn, _err: Option<&std::io::Error>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_close_fires_on_close_once() {
    init();
    let addr = spawn_echo_server();

    let closes = Arc::new(AtomicUsize::new(0));
    let reactor = Builder::new()
        .loops(1)
        .build(CloseCounter {
            closes: closes.clone(),
        })
        .unwrap();

    let conn = reactor.dial(&format!("tcp://{}", addr), ()).unwrap();

    let c1 = conn.clone();
    let c2 = conn.clone();
    let t1 = thread::spawn(move || c1.close());
    let t2 = thread::spawn(move || c2.close());
    t1.join().unwrap();
    t2.join().unwrap();

    let deadline = std::time::Instant::now() + TIMEOUT;
    while conn.state() != State::Closed {
        assert!(std::time::Instant::now() < deadline, "close never completed");
        thread::sleep(Duration::from_millis(10));
    }

    // Give a duplicate close event every chance to show up before counting.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

struct Quiet;

impl Handler for Quiet {}

#[test]
fn sequential_dials_spread_round_robin() {
    init();
    let addr = spawn_echo_server();

    let loops = 3;
    let dials = 9;
    let reactor = Builder::new().loops(loops).build(Quiet).unwrap();

    let mut counts = vec![0usize; loops];
    let mut conns = Vec::new();
    for _ in 0..dials {
        let conn = reactor.dial(&format!("tcp://{}", addr), ()).unwrap();
        counts[conn.loop_id()] += 1;
        conns.push(conn);
    }

    let bound = dials / loops + 1;
    for (id, count) in counts.iter().enumerate() {
        assert!(
            *count <= bound,
            "loop {} received {} of {} connections",
            id,
            count,
            dials
        );
        assert!(*count > 0, "loop {} received no connections", id);
    }
}

/// Echoes server-side: everything read is written straight back.
struct EchoBack;

impl Handler for EchoBack {
    fn on_data(&self, conn: &Conn, data: &[u8]) -> usize {
        let _ = conn.send(data);
        data.len()
    }
}

#[test]
fn listen_accepts_and_serves_connections() {
    init();
    let reactor = Builder::new().loops(2).build(EchoBack).unwrap();
    let listener = reactor.listen("tcp://127.0.0.1:0", ()).unwrap();

    let addr = match listener.local_addr() {
        netloop::Addr::Ip(addr) => *addr,
        other => panic!("expected ip listener addr, got {:?}", other),
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello").unwrap();

    let mut buf = [0u8; 5];
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    listener.close();
}

#[test]
fn listen_on_unix_socket() {
    init();
    let dir = tempdir::TempDir::new("netloop-test").unwrap();
    let path = dir.path().join("echo.sock");

    let reactor = Builder::new().loops(1).build(EchoBack).unwrap();
    let _listener = reactor
        .listen(&format!("unix://{}", path.display()), ())
        .unwrap();

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(b"sock").unwrap();

    let mut buf = [0u8; 4];
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"sock");
}

#[test]
fn bytes_sent_just_before_peer_close_are_delivered() {
    init();
    let (recorder, rx) = Recorder::new();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();
    let listener = reactor.listen("tcp://127.0.0.1:0", ()).unwrap();

    let addr = match listener.local_addr() {
        netloop::Addr::Ip(addr) => *addr,
        other => panic!("expected ip listener addr, got {:?}", other),
    };

    // Write-then-close: the hangup arrives right behind the payload and
    // must not preempt its delivery.
    {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
    }

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Open(None));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"ping".to_vec()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Close(None));
}

#[test]
fn retained_tail_is_delivered_before_eof_close() {
    init();
    let (recorder, rx) = Recorder::hoarding();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();
    let listener = reactor.listen("tcp://127.0.0.1:0", ()).unwrap();

    let addr = match listener.local_addr() {
        netloop::Addr::Ip(addr) => *addr,
        other => panic!("expected ip listener addr, got {:?}", other),
    };

    {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"tail").unwrap();
    }

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Open(None));
    // First delivery from the read; nothing consumed, so the tail is
    // retained and offered once more before the connection closes.
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"tail".to_vec()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"tail".to_vec()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Close(None));
}

#[test]
fn concurrent_dials_keep_single_ownership() {
    init();
    let addr = spawn_echo_server();

    let loops = 3;
    let threads = 8;
    let per_thread = 16;
    let total = threads * per_thread;

    let closes = Arc::new(AtomicUsize::new(0));
    let reactor = Arc::new(
        Builder::new()
            .loops(loops)
            .build(CloseCounter {
                closes: closes.clone(),
            })
            .unwrap(),
    );

    let (tx, rx) = channel();
    let mut workers = Vec::new();
    for _ in 0..threads {
        let reactor = reactor.clone();
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..per_thread {
                let conn = reactor.dial(&format!("tcp://{}", addr), ()).unwrap();
                tx.send(conn).unwrap();
            }
        }));
    }
    drop(tx);
    for worker in workers {
        worker.join().unwrap();
    }

    let conns: Vec<Conn> = rx.into_iter().collect();
    assert_eq!(conns.len(), total);

    // Every connection landed on exactly one loop of the pool.
    let mut counts = vec![0usize; loops];
    for conn in &conns {
        counts[conn.loop_id()] += 1;
    }
    assert_eq!(counts.iter().sum::<usize>(), total);

    let mut reactor = Arc::try_unwrap(reactor).unwrap();
    reactor.shutdown();

    // One on_close per dialed connection: no fd entered two maps, none
    // was closed twice.
    assert_eq!(closes.load(Ordering::SeqCst), total);
    for conn in &conns {
        assert_eq!(conn.state(), State::Closed);
    }
}

#[test]
fn udp_sends_preserve_datagram_boundaries() {
    init();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = server.recv_from(&mut buf) {
            let _ = server.send_to(&buf[..n], peer);
        }
    });

    let (recorder, rx) = Recorder::new();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();

    let conn = reactor.dial(&format!("udp://{}", addr), ()).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Open(None));

    conn.send(b"alpha").unwrap();
    conn.send(b"beta!").unwrap();

    // Two sends stay two datagrams: each comes back as its own delivery,
    // never one merged ten-byte payload.
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"alpha".to_vec()));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"beta!".to_vec()));
}

#[test]
fn udp_dial_round_trip() {
    init();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = server.recv_from(&mut buf) {
            let _ = server.send_to(&buf[..n], peer);
        }
    });

    let (recorder, rx) = Recorder::new();
    let reactor = Builder::new().loops(1).build(recorder).unwrap();

    let conn = reactor.dial(&format!("udp://{}", addr), ()).unwrap();
    assert!(conn.is_datagram());
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Open(None));

    conn.send(b"dgram").unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ev::Data(b"dgram".to_vec()));
}

#[test]
fn close_with_buffered_bytes_flushes_before_closed() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let (total_tx, total_rx) = channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut total = 0usize;
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        let _ = total_tx.send(total);
    });

    let closes = Arc::new(AtomicUsize::new(0));
    let reactor = Builder::new()
        .loops(1)
        .build(CloseCounter {
            closes: closes.clone(),
        })
        .unwrap();

    let conn = reactor.dial(&format!("tcp://{}", addr), ()).unwrap();

    let payload: Vec<u8> = (0..4096u32)
        .map(|_| rand::random::<u8>())
        .collect();
    conn.send(&payload).unwrap();
    conn.close();

    // The peer observes EOF only after the buffered bytes went out.
    let total = total_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(total, 4096);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn dial_after_shutdown_is_rejected() {
    init();
    let (recorder, _rx) = Recorder::new();
    let mut reactor = Builder::new().loops(1).build(recorder).unwrap();
    reactor.shutdown();

    match reactor.dial("tcp://127.0.0.1:1", ()) {
        Err(Error::Terminated) => {}
        other => panic!("expected terminated error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn shutdown_closes_owned_connections() {
    init();
    let addr = spawn_echo_server();

    let closes = Arc::new(AtomicUsize::new(0));
    let mut reactor = Builder::new()
        .loops(2)
        .build(CloseCounter {
            closes: closes.clone(),
        })
        .unwrap();

    let conns: Vec<Conn> = (0..4)
        .map(|_| reactor.dial(&format!("tcp://{}", addr), ()).unwrap())
        .collect();

    reactor.shutdown();

    assert_eq!(closes.load(Ordering::SeqCst), 4);
    for conn in &conns {
        assert_eq!(conn.state(), State::Closed);
    }
}
