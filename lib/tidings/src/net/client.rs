use crate::codec::message::Message;
use crate::codec::reader::MessageReader;
use crate::codec::writer::MessageWriter;
use crate::error::ClientError;
use crate::{DEFAULT_PORT, SLEEP_CLIENT_RUN, SLEEP_RECEIVE_BLOCKING, SLEEP_START_BLOCKING};
use crossbeam_channel::{unbounded, Receiver, Sender};
use plinth::{digest, logging};
use serde_derive::{Deserialize, Serialize};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// Client construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Used for logger and thread identity only.
    pub name: String,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: "tidings.client".to_string(),
        }
    }
}

const STATUS_PRE_RUN: u8 = 0;
const STATUS_PRE_CONNECT: u8 = 1;
const STATUS_CONNECTED: u8 = 2;
const STATUS_POST_RUN: u8 = 3;

/// Where the client is in its lifecycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientStatus {
    PreRun,
    PreConnect,
    Connected,
    PostRun,
}

impl ClientStatus {
    fn from_u8(status: u8) -> ClientStatus {
        match status {
            STATUS_PRE_RUN => ClientStatus::PreRun,
            STATUS_PRE_CONNECT => ClientStatus::PreConnect,
            STATUS_CONNECTED => ClientStatus::Connected,
            _ => ClientStatus::PostRun,
        }
    }
}

/// A client connection to a server.
///
/// A single worker thread owns the socket: it completes the welcome/login
/// handshake, then loops shipping queued messages out and pulling incoming
/// messages into a queue the application polls. Pings are answered
/// internally and never reach the application.
pub struct Client {
    status: Arc<AtomicU8>,
    halt: Arc<AtomicBool>,
    incoming: Receiver<Message>,
    outgoing: Sender<Message>,
    error: Arc<Mutex<Option<ClientError>>>,
    seed: Option<Worker>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl Client {
    /// Creates a client for the given server. `version` is the client's
    /// `(major, minor, revision)`, sent during login for the server's
    /// version validator.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        version: (u32, u32, u32),
        username: &str,
        password: &str,
        config: ClientConfig,
        log: L,
    ) -> Client {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("name" => config.name.clone())),
            None => logging::discard(),
        };

        let status = Arc::new(AtomicU8::new(STATUS_PRE_RUN));
        let halt = Arc::new(AtomicBool::new(false));
        let error = Arc::new(Mutex::new(None));

        let (incoming_tx, incoming_rx) = unbounded();
        let (outgoing_tx, outgoing_rx) = unbounded();

        let seed = Worker {
            host: config.host.clone(),
            port: config.port,
            version,
            username: username.to_string(),
            password: password.to_string(),
            status: status.clone(),
            halt: halt.clone(),
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            error: error.clone(),
            log,
        };

        Client {
            status,
            halt,
            incoming: incoming_rx,
            outgoing: outgoing_tx,
            error,
            seed: Some(seed),
            worker: None,
            name: config.name,
        }
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Starts the client worker. Panics if called twice.
    pub fn start(&mut self) {
        let worker = self.seed.take().expect("client already started");

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run())
            .expect("Error spawning client thread");

        self.worker = Some(handle);
    }

    /// Starts the client and waits until it is connected, or fails with
    /// whatever stopped it first.
    pub fn start_blocking(&mut self) -> Result<(), ClientError> {
        self.start();

        loop {
            match self.status() {
                ClientStatus::PreRun | ClientStatus::PreConnect => {
                    if let Some(err) = self.take_error() {
                        return Err(err);
                    }
                    thread::sleep(SLEEP_START_BLOCKING);
                }
                ClientStatus::Connected => return Ok(()),
                ClientStatus::PostRun => {
                    return Err(self.take_error().unwrap_or(ClientError::Halted));
                }
            }
        }
    }

    /// Queues a message for transmission to the server.
    pub fn queue(&self, message: Message) {
        drop(self.outgoing.send(message));
    }

    /// Returns the next message from the server, or `None` if none arrived.
    pub fn receive(&self) -> Option<Message> {
        self.incoming.try_recv().ok()
    }

    /// Waits for the next message from the server.
    ///
    /// When `expected` is non-empty, a message with any other name fails
    /// with `UnexpectedMessage`. Fails with `Halted` if the client shuts
    /// down while waiting.
    pub fn receive_blocking(&self, expected: &[&str]) -> Result<Message, ClientError> {
        loop {
            if let Some(message) = self.receive() {
                if !expected.is_empty() && !expected.contains(&message.name()) {
                    return Err(ClientError::UnexpectedMessage {
                        expected: expected.iter().map(|name| name.to_string()).collect(),
                        got: message.name().to_string(),
                    });
                }
                return Ok(message);
            }

            if self.halt.load(Ordering::Relaxed) {
                return Err(ClientError::Halted);
            }

            thread::sleep(SLEEP_RECEIVE_BLOCKING);
        }
    }

    /// Stops the client, waits for the worker to finish and surfaces any
    /// error the run ended with.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        self.halt.store(true, Ordering::Relaxed);

        if let Some(worker) = self.worker.take() {
            drop(worker.join());
        }

        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_error(&self) -> Option<ClientError> {
        self.error.lock().expect("error lock poisoned").take()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.halt.store(true, Ordering::Relaxed);
    }
}

struct Worker {
    host: String,
    port: u16,
    version: (u32, u32, u32),
    username: String,
    password: String,
    status: Arc<AtomicU8>,
    halt: Arc<AtomicBool>,
    incoming: Sender<Message>,
    outgoing: Receiver<Message>,
    error: Arc<Mutex<Option<ClientError>>>,
    log: logging::Logger,
}

impl Worker {
    fn run(mut self) {
        if let Err(err) = self.session() {
            logging::error!(self.log, "client stopped with error"; "error" => %err);
            *self.error.lock().expect("error lock poisoned") = Some(err);
        }

        self.halt.store(true, Ordering::Relaxed);
        self.status.store(STATUS_POST_RUN, Ordering::Relaxed);
        logging::info!(self.log, "client stopped");
    }

    fn session(&mut self) -> Result<(), ClientError> {
        self.status.store(STATUS_PRE_CONNECT, Ordering::Relaxed);
        logging::info!(self.log, "connecting"; "host" => %self.host, "port" => self.port);

        let mut stream =
            TcpStream::connect((self.host.as_str(), self.port)).map_err(ClientError::Connect)?;
        stream.set_nonblocking(true).map_err(ClientError::Connect)?;

        let mut reader = MessageReader::new();
        let mut writer = MessageWriter::new();

        let welcome = expect_blocking(&mut reader, &mut stream, &["_welcome"])?;
        let salt = welcome.str("salt")?.to_string();

        let login = Message::reserved("_login")
            .with("username", self.username.as_str())?
            .with("password", digest::digest(&self.password, &salt).as_str())?
            .with("major", self.version.0 as i32)?
            .with("minor", self.version.1 as i32)?
            .with("revision", self.version.2 as i32)?;
        writer.send_blocking(&login, &mut stream)?;

        let verdict = expect_blocking(&mut reader, &mut stream, &["_loginAccept", "_loginReject"])?;
        if verdict.name() == "_loginReject" {
            let reason = verdict.str("reason").map(str::to_string).unwrap_or_default();
            drop(stream.shutdown(Shutdown::Both));
            return Err(ClientError::LoginRejected(reason));
        }

        self.status.store(STATUS_CONNECTED, Ordering::Relaxed);
        logging::info!(self.log, "login complete");

        let result = self.run_loop(&mut reader, &mut writer, &mut stream);
        drop(stream.shutdown(Shutdown::Both));
        result
    }

    fn run_loop(
        &mut self,
        reader: &mut MessageReader,
        writer: &mut MessageWriter,
        stream: &mut TcpStream,
    ) -> Result<(), ClientError> {
        while !self.halt.load(Ordering::Relaxed) {
            while let Ok(message) = self.outgoing.try_recv() {
                writer.queue(&message)?;
            }
            writer.send(stream)?;

            while let Some(message) = reader.poll(stream)? {
                if message.name() == "_ping" {
                    logging::debug!(self.log, "ping");
                    writer.queue(&Message::reserved("_pong"))?;
                } else {
                    drop(self.incoming.send(message));
                }
            }

            thread::sleep(SLEEP_CLIENT_RUN);
        }

        Ok(())
    }
}

/// Blocking receive for the handshake, restricted to the expected names.
fn expect_blocking(
    reader: &mut MessageReader,
    stream: &mut TcpStream,
    expected: &[&str],
) -> Result<Message, ClientError> {
    let message = reader
        .poll_blocking(stream, None)?
        .expect("poll_blocking without a deadline only returns with a message");

    if !expected.contains(&message.name()) {
        return Err(ClientError::UnexpectedMessage {
            expected: expected.iter().map(|name| name.to_string()).collect(),
            got: message.name().to_string(),
        });
    }

    Ok(message)
}
