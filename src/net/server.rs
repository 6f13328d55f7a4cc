use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::net::cipher::CipherStream;
use crate::net::client::{handle_record, RecordOutcome};
use crate::net::records::{Fault, Record};
use crate::telemetry::logging::{log_error, log_net, log_session};
use crate::world::object::MIN_SAY_INTERVAL;
use crate::world::registry::Registry;

#[derive(Debug)]
pub struct ServerControl {
    running: AtomicBool,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
        }
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Attribute flushes per second.
    pub refresh_hz: u32,
    /// Socket read timeout; doubles as the poll interval for outbound
    /// records, kill flags and the idle check.
    pub read_timeout: Duration,
}

pub fn run_server(
    config: ServerConfig,
    registry: Arc<Mutex<Registry>>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    run_server_with_listener(config, registry, control, listener)
}

pub fn run_server_with_listener(
    config: ServerConfig,
    registry: Arc<Mutex<Registry>>,
    control: Arc<ServerControl>,
    listener: TcpListener,
) -> Result<(), String> {
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("listener nonblocking failed: {}", err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| format!("listener address lookup failed: {}", err))?;

    log_session(&format!("Listening on {}", local_addr));
    println!("atrium: listening on {}", local_addr);

    let flush_loop = spawn_flush_loop(
        Arc::clone(&registry),
        Arc::clone(&control),
        config.refresh_hz,
    );
    let say_pump = spawn_say_pump(Arc::clone(&registry), Arc::clone(&control));

    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let config = config.clone();
                let registry = Arc::clone(&registry);
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    if let Err(err) =
                        handle_connection(stream, addr, &config, &registry, &control)
                    {
                        log_error(&format!("connection {} error: {}", addr, err));
                        eprintln!("atrium: connection {} error: {}", addr, err);
                    }
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                log_error(&format!("accept error: {}", err));
                eprintln!("atrium: accept error: {}", err);
            }
        }
    }

    let _ = flush_loop.join();
    let _ = say_pump.join();
    log_session("Server loop stopped");
    println!("atrium: server loop stopped");
    Ok(())
}

/// Ships dirty attribute updates on the configured cadence.
fn spawn_flush_loop(
    registry: Arc<Mutex<Registry>>,
    control: Arc<ServerControl>,
    refresh_hz: u32,
) -> thread::JoinHandle<()> {
    let period = Duration::from_millis(1_000 / u64::from(refresh_hz.max(1)));
    thread::spawn(move || {
        while control.is_running() {
            if let Ok(mut registry) = registry.lock() {
                registry.flush_updates();
            }
            thread::sleep(period);
        }
    })
}

/// Drains queued sayings at the chat rate limit, one per object per tick.
fn spawn_say_pump(
    registry: Arc<Mutex<Registry>>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while control.is_running() {
            if let Ok(mut registry) = registry.lock() {
                registry.pump_sayings(Instant::now());
            }
            thread::sleep(MIN_SAY_INTERVAL);
        }
    })
}

/// Unwinds the session when the connection thread exits, whatever the exit
/// path was.
struct SessionGuard {
    registry: Arc<Mutex<Registry>>,
    session_id: i32,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.disconnect(self.session_id);
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: &ServerConfig,
    registry: &Arc<Mutex<Registry>>,
    control: &Arc<ServerControl>,
) -> Result<(), String> {
    let mut stream = stream;
    stream
        .set_read_timeout(Some(config.read_timeout))
        .map_err(|err| format!("read timeout set failed: {}", err))?;

    let (session_id, seed, idle_after) = {
        let mut registry = lock(registry)?;
        let seed = registry.settings.cipher_seed;
        let idle_after = registry.settings.inactivity_timeout(registry.role);
        match registry.connect(addr.to_string(), Instant::now()) {
            Ok(session_id) => (session_id, seed, idle_after),
            Err(err) => {
                drop(registry);
                let fault = Fault::general("The server cannot accept further connections.");
                let mut cipher = CipherStream::new(seed);
                let _ = write_record(&mut stream, &mut cipher, &fault.to_record());
                return Err(err);
            }
        }
    };
    let _guard = SessionGuard {
        registry: Arc::clone(registry),
        session_id,
    };
    let mut cipher = CipherStream::new(seed);
    let mut inbox: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 2048];

    while control.is_running() {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                let start = inbox.len();
                inbox.extend_from_slice(&chunk[..read]);
                cipher.decrypt_in_place(&mut inbox[start..]);
                loop {
                    match Record::decode(&inbox) {
                        Ok(Some((record, consumed))) => {
                            inbox.drain(..consumed);
                            log_net(&format!(
                                "Connection #{} sent a {} record",
                                session_id,
                                record.type_name()
                            ));
                            let outcome = {
                                let mut registry = lock(registry)?;
                                handle_record(&mut registry, session_id, record, Instant::now())
                            };
                            match outcome {
                                Ok(RecordOutcome::Handled) => {}
                                Ok(RecordOutcome::Shutdown) => {
                                    flush_outbox(&mut stream, &mut cipher, registry, session_id)?;
                                    control.request_shutdown();
                                    return Ok(());
                                }
                                Err(fault) => {
                                    flush_outbox(&mut stream, &mut cipher, registry, session_id)?;
                                    return close_with_fault(
                                        &mut stream,
                                        &mut cipher,
                                        registry,
                                        session_id,
                                        fault,
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            return close_with_fault(
                                &mut stream,
                                &mut cipher,
                                registry,
                                session_id,
                                Fault::from(err),
                            );
                        }
                    }
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(format!("read from {} failed: {}", addr, err)),
        }

        let (records, kill, idle) = {
            let mut registry = lock(registry)?;
            let records = registry.take_outbox(session_id);
            let kill = registry
                .session_mut(session_id)
                .and_then(|session| session.kill.take());
            let idle = match registry.session(session_id) {
                Some(session) => {
                    !registry.is_timeout_exempt(session_id)
                        && Instant::now().saturating_duration_since(session.last_received)
                            > idle_after
                }
                None => false,
            };
            (records, kill, idle)
        };
        for record in &records {
            write_record(&mut stream, &mut cipher, record)?;
        }
        if let Some(fault) = kill {
            return close_with_fault(&mut stream, &mut cipher, registry, session_id, fault);
        }
        if idle {
            let fault = Fault::general("Closing the connection due to inactivity.");
            return close_with_fault(&mut stream, &mut cipher, registry, session_id, fault);
        }
    }
    Ok(())
}

/// Reports the fault to the peer and lets the connection close. Best effort:
/// the peer may already be gone.
fn close_with_fault(
    stream: &mut TcpStream,
    cipher: &mut CipherStream,
    registry: &Arc<Mutex<Registry>>,
    session_id: i32,
    fault: Fault,
) -> Result<(), String> {
    if let Ok(registry) = registry.lock() {
        let who = registry
            .session(session_id)
            .map(|session| session.describe())
            .unwrap_or_else(|| format!("#{}", session_id));
        log_session(&format!("Closing connection {}: {}", who, fault));
    }
    let _ = write_record(stream, cipher, &fault.to_record());
    Ok(())
}

fn flush_outbox(
    stream: &mut TcpStream,
    cipher: &mut CipherStream,
    registry: &Arc<Mutex<Registry>>,
    session_id: i32,
) -> Result<(), String> {
    let records = lock(registry)?.take_outbox(session_id);
    for record in &records {
        write_record(stream, cipher, record)?;
    }
    Ok(())
}

fn write_record(
    stream: &mut TcpStream,
    cipher: &mut CipherStream,
    record: &Record,
) -> Result<(), String> {
    let mut frame = record.encode();
    cipher.encrypt_in_place(&mut frame);
    stream
        .write_all(&frame)
        .map_err(|err| format!("write failed: {}", err))
}

fn lock<'a>(registry: &'a Arc<Mutex<Registry>>) -> Result<MutexGuard<'a, Registry>, String> {
    registry
        .lock()
        .map_err(|_| "registry lock poisoned".to_string())
}
