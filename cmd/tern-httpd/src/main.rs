//! tern HTTP/1.1 demo server
//!
//! Answers every request with "Hello from tern!". Request heads are found
//! with receive-buffer continuations on the continuation pool, so no
//! thread ever blocks on a socket.
//!
//! Usage:
//!     ./target/release/tern-httpd [--port 8080] [--threads 4] [--pipe]
//!
//! Environment: `TERN_PORT`, plus everything `ServerConfig::from_env` and
//! `logging::init` read (`TERN_THREADS`, `TERN_DISPATCH`, `TERN_LOG_LEVEL`, ...).
//!
//! Benchmark:
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_core::{env_get, logging, DispatchMode, ServerConfig, TernError};
use tern_transport::{ConnectionIo, FrameFactory, ProduceEndType, TransportServer};

const HELLO_BODY: &[u8] = b"Hello from tern!\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Default)]
struct Stats {
    connections: AtomicU64,
    requests: AtomicU64,
}

struct Hello {
    stats: Arc<Stats>,
}

impl FrameFactory for Hello {
    fn start(&self, io: ConnectionIo) {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Frame {
            io,
            stats: Arc::clone(&self.stats),
        });
        frame.await_input();
    }
}

/// Per-connection request loop
struct Frame {
    io: ConnectionIo,
    stats: Arc<Stats>,
}

impl Frame {
    fn await_input(self: Arc<Self>) {
        let me = Arc::clone(&self);
        self.io.input.on_completed(Box::new(move || me.on_input()));
    }

    fn on_input(self: Arc<Self>) {
        let input = &self.io.input;
        if let Err(e) = input.get_result() {
            tracing::debug!(conn = %self.io.id, error = %e, "receive failed");
            let _ = self.io.control.end(ProduceEndType::SocketDisconnect);
            return;
        }
        loop {
            let view = input.consuming_start();
            match view.find(HEAD_END) {
                Some(pos) => {
                    drop(view);
                    let end = pos + HEAD_END.len();
                    input.consuming_complete(end, end);
                    self.respond();
                }
                None => {
                    let examined = view.len();
                    drop(view);
                    if input.is_fin() {
                        let _ = self.io.control.end(ProduceEndType::SocketShutdownSend);
                        return;
                    }
                    input.consuming_complete(0, examined);
                    break;
                }
            }
        }
        self.await_input();
    }

    fn respond(&self) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let date = self.io.date.values_or_now();
        let mut response = Vec::with_capacity(160);
        response.extend_from_slice(b"HTTP/1.1 200 OK");
        response.extend_from_slice(&date.bytes);
        response.extend_from_slice(
            format!(
                "\r\nContent-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: keep-alive\r\n\
                 Server: tern-httpd\r\n\
                 \r\n",
                HELLO_BODY.len()
            )
            .as_bytes(),
        );
        response.extend_from_slice(HELLO_BODY);

        self.io.output.write(
            response,
            |result, control: tern_transport::ConnectionControl| {
                if let Err(e) = result {
                    tracing::debug!(conn = %control.id(), error = %e, "response write failed");
                    let _ = control.end(ProduceEndType::SocketDisconnect);
                }
            },
            self.io.control.clone(),
        );
    }
}

fn parse_args(mut config: ServerConfig) -> (u16, ServerConfig) {
    let args: Vec<String> = std::env::args().collect();
    let mut port: u16 = env_get("TERN_PORT", 8080);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(port);
            }
            "--threads" | "-t" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) {
                    config = config.thread_count(n);
                }
            }
            "--pipe" => config = config.dispatch(DispatchMode::Pipe),
            s if s.parse::<u16>().is_ok() => port = s.parse().unwrap_or(port),
            other => tracing::warn!(arg = other, "ignoring unknown argument"),
        }
        i += 1;
    }
    (port, config)
}

fn run() -> Result<(), TernError> {
    let (port, config) = parse_args(ServerConfig::from_env()?);

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let stats = Arc::new(Stats::default());
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let server = TransportServer::start(config, addr, Arc::new(Hello { stats: Arc::clone(&stats) }))?;
    tracing::info!(addr = %server.local_addr(), reactors = server.reactor_count(), "tern-httpd ready");

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!(
        connections = stats.connections.load(Ordering::Relaxed),
        requests = stats.requests.load(Ordering::Relaxed),
        "shutting down"
    );
    server.stop()
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        tracing::error!(error = %e, "tern-httpd failed");
        std::process::exit(1);
    }
}
