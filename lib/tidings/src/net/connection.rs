use crate::codec::message::Message;
use crate::codec::reader::MessageReader;
use crate::codec::writer::MessageWriter;
use crate::net::manager::UserLedger;
use crate::net::room::RoomEvent;
use crate::net::server::ServerContext;
use crate::net::user::User;
use crate::MAX_CONNECTIONS_PER_USER;
use crossbeam_channel::{unbounded, Receiver, Sender};
use plinth::{digest, logging};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The shared face of a server-side connection: the part the room (or any
/// other thread) may hold on to. Queued messages are delivered to the client
/// in queue order; queueing onto a closed connection is a no-op.
pub struct ConnectionHandle {
    addr: SocketAddr,
    outgoing: Sender<Message>,
    alive: AtomicBool,
    user: RwLock<Option<User>>,
}

impl ConnectionHandle {
    /// Queues a message for transmission to the client.
    pub fn queue(&self, message: Message) {
        drop(self.outgoing.send(message));
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// The logged-in user, once the login handshake has completed.
    pub fn user(&self) -> Option<User> {
        self.user.read().expect("user lock poisoned").clone()
    }

    fn adopt(&self, user: User) {
        *self.user.write().expect("user lock poisoned") = Some(user);
    }

    fn retire(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Server-side connection, exclusively owned by the manager.
///
/// Each `tick` performs at most one pass over readable input, one flush of
/// output and one deadline check. The state is encoded in the fields: no
/// salt yet means the welcome has not been sent, a salt without a user means
/// the login exchange is pending, and an adopted user means normal
/// operation.
pub(crate) struct Connection {
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    outgoing: Receiver<Message>,
    reader: MessageReader,
    writer: MessageWriter,
    salt: Option<String>,
    user: Option<User>,
    deadline: Instant,
    ping_sent: bool,
    log: logging::Logger,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, addr: SocketAddr, log: &logging::Logger) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;

        let (outgoing_tx, outgoing_rx) = unbounded();

        Ok(Connection {
            stream,
            handle: Arc::new(ConnectionHandle {
                addr,
                outgoing: outgoing_tx,
                alive: AtomicBool::new(true),
                user: RwLock::new(None),
            }),
            outgoing: outgoing_rx,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
            salt: None,
            user: None,
            deadline: Instant::now(),
            ping_sent: false,
            log: log.new(logging::o!("peer" => addr.to_string())),
        })
    }

    pub(crate) fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub(crate) fn alive(&self) -> bool {
        self.handle.alive()
    }

    /// One scheduled pass: dispatches on the current state.
    pub(crate) fn tick(&mut self, ctx: &ServerContext, users: &mut UserLedger) {
        if !self.alive() {
            return;
        }

        if self.user.is_some() {
            self.tick_normal(ctx, users);
        } else if self.salt.is_some() {
            self.tick_login(ctx, users);
        } else {
            self.tick_initial(ctx, users);
        }
    }

    /// First contact: send the salt and start the login timer.
    fn tick_initial(&mut self, ctx: &ServerContext, users: &mut UserLedger) {
        let salt = digest::salt();
        let welcome = Message::reserved("_welcome")
            .with("salt", salt.as_str())
            .expect("reserved message arguments are valid");

        logging::debug!(self.log, "sending welcome message");
        if let Err(err) = self.writer.send_blocking(&welcome, &mut self.stream) {
            self.close(users, &err.to_string());
            return;
        }

        self.salt = Some(salt);
        self.deadline = Instant::now() + ctx.timeouts.login_timeout;
    }

    /// Login exchange: a single `_login` must arrive before the deadline and
    /// pass version, credential and connection-count checks, in that order.
    fn tick_login(&mut self, ctx: &ServerContext, users: &mut UserLedger) {
        let message = match self.reader.poll(&mut self.stream) {
            Ok(Some(message)) => message,
            Ok(None) => {
                if Instant::now() > self.deadline {
                    self.close(users, "Login time out");
                }
                return;
            }
            Err(err) => {
                self.close(users, &err.to_string());
                return;
            }
        };

        if message.name() != "_login" {
            self.reject(users, "Unexpected message.");
            return;
        }

        let user = match self.evaluate_login(&message, ctx, users) {
            Ok(user) => user,
            Err(reason) => {
                self.reject(users, reason);
                return;
            }
        };

        logging::debug!(self.log, "accepted login"; "user" => %user);
        if let Err(err) = self
            .writer
            .send_blocking(&Message::reserved("_loginAccept"), &mut self.stream)
        {
            self.close(users, &err.to_string());
            return;
        }

        self.handle.adopt(user.clone());
        self.user = Some(user);
        users.enter(self.handle.clone());

        self.ping_sent = false;
        self.deadline = Instant::now() + ctx.timeouts.ping_interval;
    }

    /// Applies the login checks. The connection count is checked after the
    /// credentials so a rejection never discloses whether a username has an
    /// active session.
    fn evaluate_login(
        &self,
        message: &Message,
        ctx: &ServerContext,
        users: &UserLedger,
    ) -> Result<User, &'static str> {
        let (major, minor, revision) = match (
            message.i32("major"),
            message.i32("minor"),
            message.i32("revision"),
        ) {
            (Ok(major), Ok(minor), Ok(revision)) => (major, minor, revision),
            _ => return Err("Unexpected message."),
        };
        let (username, password) = match (message.str("username"), message.str("password")) {
            (Ok(username), Ok(password)) => (username, password),
            _ => return Err("Unexpected message."),
        };

        if !(ctx.version_validator)(major, minor, revision) {
            return Err("Client requires update.");
        }

        let salt = self.salt.as_ref().expect("login is evaluated after the salt was sent");
        let user = match (ctx.user_validator)(username, password, salt) {
            Some(user) => user,
            None => return Err("Invalid credentials."),
        };

        if users.count(user.name()) >= MAX_CONNECTIONS_PER_USER {
            return Err("Maximum number of connections per user reached.");
        }

        Ok(user)
    }

    /// Queues a `_loginReject` with the given reason and closes; the final
    /// flush in `close` carries the reply out.
    fn reject(&mut self, users: &mut UserLedger, reason: &str) {
        let reply = Message::reserved("_loginReject")
            .with("reason", reason)
            .expect("reserved message arguments are valid");

        drop(self.writer.queue(&reply));
        self.close(users, &format!("Rejected login: {}", reason));
    }

    /// Normal operation: flush queued output, drain input, keep the
    /// connection alive with pings.
    fn tick_normal(&mut self, ctx: &ServerContext, users: &mut UserLedger) {
        while let Ok(message) = self.outgoing.try_recv() {
            if let Err(err) = self.writer.queue(&message) {
                self.close(users, &err.to_string());
                return;
            }
        }
        if let Err(err) = self.writer.send(&mut self.stream) {
            self.close(users, &err.to_string());
            return;
        }

        loop {
            match self.reader.poll(&mut self.stream) {
                Ok(Some(message)) => {
                    if message.name() == "_pong" {
                        logging::trace!(self.log, "pong received");
                        self.ping_sent = false;
                        self.deadline = Instant::now() + ctx.timeouts.ping_interval;
                    } else {
                        drop(ctx.room.send(RoomEvent::Message(self.handle.clone(), message)));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.close(users, &err.to_string());
                    return;
                }
            }
        }

        if Instant::now() > self.deadline {
            if self.ping_sent {
                self.close(users, "Ping time out");
            } else {
                logging::trace!(self.log, "pinging client");
                if let Err(err) = self.writer.queue(&Message::reserved("_ping")) {
                    self.close(users, &err.to_string());
                    return;
                }
                self.ping_sent = true;
                self.deadline = Instant::now() + ctx.timeouts.ping_timeout;
            }
        }
    }

    /// Closes the connection. Idempotent; the user ledger is notified
    /// exactly once, and only if a user had been adopted. Buffered outgoing
    /// data gets one final flush attempt; whatever the stream refuses now
    /// is dropped with the connection.
    pub(crate) fn close(&mut self, users: &mut UserLedger, reason: &str) {
        if !self.alive() {
            return;
        }

        drop(self.writer.send(&mut self.stream));

        if let Some(user) = self.user.take() {
            users.exit(user);
        }

        logging::info!(self.log, "closing connection"; "reason" => reason);

        drop(self.stream.shutdown(Shutdown::Both));
        self.handle.retire();
    }
}
