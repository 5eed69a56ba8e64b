//! Cross-thread async writes and trigger callbacks.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use gyre::{Action, Conn, Engine, EventHandler, Options, serve};

/// Handler that reports the engine handle plus per-connection lifecycle ids.
struct CaptureHandler {
    boot_tx: Mutex<mpsc::Sender<Engine>>,
    open_tx: Mutex<mpsc::Sender<i64>>,
    close_tx: Mutex<mpsc::Sender<i64>>,
}

impl CaptureHandler {
    #[allow(clippy::type_complexity)]
    fn new() -> (
        Arc<CaptureHandler>,
        mpsc::Receiver<Engine>,
        mpsc::Receiver<i64>,
        mpsc::Receiver<i64>,
    ) {
        let (boot_tx, boot_rx) = mpsc::channel();
        let (open_tx, open_rx) = mpsc::channel();
        let (close_tx, close_rx) = mpsc::channel();
        let handler = Arc::new(CaptureHandler {
            boot_tx: Mutex::new(boot_tx),
            open_tx: Mutex::new(open_tx),
            close_tx: Mutex::new(close_tx),
        });
        (handler, boot_rx, open_rx, close_rx)
    }
}

impl EventHandler for CaptureHandler {
    fn on_boot(&self, eng: Engine) -> Action {
        let _ = self.boot_tx.lock().unwrap().send(eng);
        Action::None
    }

    fn on_open(&self, c: &mut Conn) -> (Option<Vec<u8>>, Action) {
        let _ = self.open_tx.lock().unwrap().send(c.conn_id());
        (None, Action::None)
    }

    fn on_close(&self, c: &mut Conn, _err: Option<&std::io::Error>) -> Action {
        let _ = self.close_tx.lock().unwrap().send(c.conn_id());
        Action::None
    }
}

fn start_server(handler: Arc<dyn EventHandler>, opts: Options) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        serve(handler, &["tcp://127.0.0.1:0"], opts).expect("serve failed");
    })
}

fn connect(eng: &Engine) -> TcpStream {
    let addr: SocketAddr = eng.local_addrs()[0].as_socket().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    client
}

/// Read until `want` bytes arrived or the deadline passed.
fn read_n(client: &mut TcpStream, want: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(want);
    let mut buf = [0u8; 4096];
    while out.len() < want && Instant::now() < deadline {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

#[test]
fn async_write_from_foreign_thread_keeps_order() {
    let (handler, boot_rx, open_rx, _close_rx) = CaptureHandler::new();
    let server = start_server(handler, Options::default());
    let eng = boot_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect(&eng);
    let conn_id = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    const ROUNDS: u32 = 1000;
    let writer_eng = eng.clone();
    let writer = thread::spawn(move || {
        for i in 0..ROUNDS {
            writer_eng
                .async_write(conn_id, &i.to_be_bytes())
                .expect("async write failed");
        }
    });
    writer.join().unwrap();

    let bytes = read_n(&mut client, (ROUNDS as usize) * 4, Duration::from_secs(10));
    assert_eq!(bytes.len(), (ROUNDS as usize) * 4);
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        let got = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        assert_eq!(got, i as u32, "out-of-order write at position {i}");
    }

    eng.stop();
    server.join().unwrap();
}

#[test]
fn stale_conn_id_is_silently_dropped() {
    let (handler, boot_rx, open_rx, close_rx) = CaptureHandler::new();
    let server = start_server(handler, Options::default());
    let eng = boot_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let first = connect(&eng);
    let stale_id = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(first);
    close_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The next accept will very likely reuse the fd slot, but the
    // generation differs, so the old id must not reach the new connection.
    let mut second = connect(&eng);
    let fresh_id = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(stale_id, fresh_id);

    eng.async_write(stale_id, b"Z").unwrap();
    eng.async_write(fresh_id, b"W").unwrap();

    let bytes = read_n(&mut second, 1, Duration::from_secs(2));
    assert_eq!(bytes, b"W");
    // Nothing else may trickle in afterwards.
    let extra = read_n(&mut second, 1, Duration::from_millis(300));
    assert!(extra.is_empty(), "stale write leaked: {extra:?}");

    eng.stop();
    server.join().unwrap();
}

#[test]
fn trigger_runs_callback_on_owning_loop() {
    let (handler, boot_rx, open_rx, _close_rx) = CaptureHandler::new();
    let server = start_server(handler, Options::default());
    let eng = boot_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect(&eng);
    let conn_id = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = fired.clone();
    eng.trigger(conn_id, move |c| {
        fired_in_cb.fetch_add(1, Ordering::SeqCst);
        c.write(b"ping");
    });

    let bytes = read_n(&mut client, 4, Duration::from_secs(2));
    assert_eq!(bytes, b"ping");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // A malformed id (unknown loop index) is silently ignored.
    let bogus = (0x7fff_i64 << 48) | conn_id;
    eng.async_write(bogus, b"X").unwrap();
    eng.trigger(bogus, |_c| panic!("must not run"));

    eng.stop();
    server.join().unwrap();
}

#[test]
fn triggers_on_same_connection_are_fifo() {
    let (handler, boot_rx, open_rx, _close_rx) = CaptureHandler::new();
    let server = start_server(handler, Options::default());
    let eng = boot_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect(&eng);
    let conn_id = open_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    eng.trigger(conn_id, |c| c.write(b"A"));
    eng.async_write(conn_id, b"B").unwrap();
    eng.trigger(conn_id, |c| c.write(b"C"));

    let bytes = read_n(&mut client, 3, Duration::from_secs(2));
    assert_eq!(bytes, b"ABC");

    eng.stop();
    server.join().unwrap();
}
