use crate::error::FatalError;
use crate::net::listener::Listener;
use crate::net::manager::Manager;
use crate::net::room::{Room, RoomEvent, RoomRunner};
use crate::net::user::User;
use crate::{DEFAULT_PORT, LOGIN_TIMEOUT, PING_INTERVAL, PING_TIMEOUT, SLEEP_SERVER, SLEEP_SHUTDOWN};
use crossbeam_channel::{unbounded, Sender};
use plinth::logging;
use serde_derive::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// Decides whether a client version `(major, minor, revision)` may log in.
pub type VersionValidator = Box<dyn Fn(i32, i32, i32) -> bool + Send + Sync>;

/// Checks credentials: `(username, password_digest, salt)`. The digest is
/// `plinth::digest::digest(plain_password, salt)`; the validator must make
/// the same computation against its credential store. Returns the
/// authenticated user, or `None` to reject.
pub type UserValidator = Box<dyn Fn(&str, &str, &str) -> Option<User> + Send + Sync>;

/// Keepalive and login timing. Defaults are the module constants.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub login_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            login_timeout: LOGIN_TIMEOUT,
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
        }
    }
}

/// Server construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Used for logger and thread identity only.
    pub name: String,
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: "tidings.server".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Everything a connection needs from the server while being ticked.
pub(crate) struct ServerContext {
    pub(crate) version_validator: VersionValidator,
    pub(crate) user_validator: UserValidator,
    pub(crate) room: Sender<RoomEvent>,
    pub(crate) timeouts: Timeouts,
}

struct Workers {
    manager: Manager,
    listener: Listener,
    room: RoomRunner,
}

/// Binds the listening socket and runs the three workers: the manager owns
/// the connections, the listener feeds it new sockets, and the room worker
/// hands authenticated traffic to user code.
///
/// `stop` (or any fatal worker error) raises the halt flag; joining then
/// drains the workers in order, closes the socket and surfaces the stored
/// error.
pub struct Server {
    config: ServerConfig,
    socket: Option<TcpListener>,
    halt: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<FatalError>>>,
    pending: Option<Workers>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    log: logging::Logger,
}

impl Server {
    /// Creates a server and binds its listening socket. The socket is bound
    /// with address reuse enabled and set non-blocking; accepting starts
    /// once `start` is called.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        version_validator: VersionValidator,
        user_validator: UserValidator,
        room: Box<dyn Room>,
        config: ServerConfig,
        log: L,
    ) -> io::Result<Server> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("name" => config.name.clone())),
            None => logging::discard(),
        };

        let socket = bind(&config.host, config.port)?;
        let address = socket.local_addr()?;
        logging::info!(log, "listening"; "addr" => %address);

        let halt = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(Mutex::new(None));

        let (incoming_tx, incoming_rx) = unbounded();
        let (room_tx, room_rx) = unbounded();

        let ctx = ServerContext {
            version_validator,
            user_validator,
            room: room_tx,
            timeouts: config.timeouts,
        };

        let workers = Workers {
            manager: Manager::new(incoming_rx, ctx, halt.clone(), log.clone()),
            listener: Listener::new(socket.try_clone()?, incoming_tx, halt.clone(), log.clone()),
            room: RoomRunner::new(room, room_rx, halt.clone(), log.clone()),
        };

        Ok(Server {
            config,
            socket: Some(socket),
            halt,
            fatal,
            pending: Some(workers),
            workers: Vec::new(),
            log,
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .as_ref()
            .expect("server socket is open until join")
            .local_addr()
    }

    /// Flag that can be raised from anywhere to shut the server down.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halt.clone()
    }

    /// Starts the three workers. Panics if called twice.
    pub fn start(&mut self) {
        let workers = self.pending.take().expect("server already started");

        logging::info!(self.log, "server starting");

        let manager = workers.manager;
        self.spawn("manager", move || {
            manager.run();
            Ok(())
        });

        let listener = workers.listener;
        self.spawn("listener", move || listener.run());

        let room = workers.room;
        self.spawn("room", move || {
            room.run();
            Ok(())
        });
    }

    fn spawn<F: FnOnce() -> Result<(), FatalError> + Send + 'static>(&mut self, role: &'static str, work: F) {
        let halt = self.halt.clone();
        let fatal = self.fatal.clone();

        let handle = thread::Builder::new()
            .name(format!("{}.{}", self.config.name, role))
            .spawn(move || {
                if let Err(err) = work() {
                    record(&fatal, err);
                    halt.store(true, Ordering::Relaxed);
                }
            })
            .expect("Error spawning worker thread");

        self.workers.push((role, handle));
    }

    /// Stops the server. An error passed in is recorded as the reason for
    /// halting and re-raised on join.
    pub fn stop(&self, error: Option<FatalError>) {
        if let Some(err) = error {
            record(&self.fatal, err);
        }
        self.halt.store(true, Ordering::Relaxed);
    }

    /// Waits for the workers to wind down in order, closes the socket and
    /// surfaces any stored fatal error.
    pub fn join(&mut self) -> Result<(), FatalError> {
        for (role, handle) in self.workers.drain(..) {
            while !handle.is_finished() {
                logging::info!(self.log, "waiting for worker to shut down"; "worker" => role);
                thread::sleep(SLEEP_SHUTDOWN);
            }
            if handle.join().is_err() {
                record(&self.fatal, format!("{} worker panicked", role).into());
            }
        }

        self.socket = None;

        match self.fatal.lock().expect("fatal lock poisoned").take() {
            Some(err) => {
                logging::crit!(self.log, "server halted with error"; "error" => %err);
                Err(err)
            }
            None => {
                logging::info!(self.log, "server halted");
                Ok(())
            }
        }
    }

    /// Runs the server until the halt flag is raised, then shuts down.
    pub fn launch(&mut self) -> Result<(), FatalError> {
        self.start();
        while !self.halt.load(Ordering::Relaxed) {
            thread::sleep(SLEEP_SERVER);
        }
        self.join()
    }
}

/// Binds a non-blocking listening socket with address reuse, so a restarted
/// server does not have to wait out the close timeout of its predecessor.
fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    let address = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses"))?;

    let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

fn record(fatal: &Mutex<Option<FatalError>>, err: FatalError) {
    let mut slot = fatal.lock().expect("fatal lock poisoned");
    if slot.is_none() {
        *slot = Some(err);
    }
}
