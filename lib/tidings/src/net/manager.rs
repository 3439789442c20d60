use crate::net::connection::{Connection, ConnectionHandle};
use crate::net::room::RoomEvent;
use crate::net::server::ServerContext;
use crate::net::user::User;
use crate::SLEEP_MANAGER;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use plinth::logging;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Per-user connection accounting. Owned by the manager and only ever
/// touched from its thread; enter and exit calls balance per connection, so
/// a count can never go negative.
pub(crate) struct UserLedger {
    counts: HashMap<String, usize>,
    room: Sender<RoomEvent>,
    log: logging::Logger,
}

impl UserLedger {
    fn new(room: Sender<RoomEvent>, log: logging::Logger) -> UserLedger {
        UserLedger {
            counts: HashMap::new(),
            room,
            log,
        }
    }

    /// Active connections for the named user.
    pub(crate) fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// Records a login and notifies the room.
    pub(crate) fn enter(&mut self, connection: Arc<ConnectionHandle>) {
        let user = connection.user().expect("entering connection has a user");

        let count = self.counts.entry(user.name().to_string()).or_insert(0);
        *count += 1;
        logging::debug!(self.log, "user entered"; "user" => %user, "connections" => *count);

        drop(self.room.send(RoomEvent::Enter(connection)));
    }

    /// Records a disconnect and notifies the room.
    pub(crate) fn exit(&mut self, user: User) {
        if let Some(count) = self.counts.get_mut(user.name()) {
            *count -= 1;
            logging::debug!(self.log, "user exited"; "user" => %user, "connections" => *count);
            if *count == 0 {
                self.counts.remove(user.name());
            }
        }

        drop(self.room.send(RoomEvent::Exit(user)));
    }
}

/// Owner of every live connection. Each cycle sweeps out closed
/// connections, admits new ones from the listener, and ticks the rest.
pub(crate) struct Manager {
    connections: Vec<Connection>,
    users: UserLedger,
    incoming: Receiver<Connection>,
    ctx: ServerContext,
    halt: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Manager {
    pub(crate) fn new(
        incoming: Receiver<Connection>,
        ctx: ServerContext,
        halt: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> Manager {
        let users = UserLedger::new(ctx.room.clone(), log.clone());
        Manager {
            connections: Vec::new(),
            users,
            incoming,
            ctx,
            halt,
            log,
        }
    }

    pub(crate) fn run(mut self) {
        logging::info!(self.log, "manager starting");

        while !self.halt.load(Ordering::Relaxed) {
            let mut changed = false;

            let before = self.connections.len();
            self.connections.retain(|connection| connection.alive());
            if self.connections.len() != before {
                changed = true;
                logging::info!(self.log, "removed closed connections";
                               "count" => before - self.connections.len());
            }

            while let Ok(connection) = self.incoming.try_recv() {
                changed = true;
                logging::info!(self.log, "accepting incoming connection";
                               "peer" => %connection.handle().addr());
                self.connections.push(connection);
            }

            if changed {
                logging::info!(self.log, "open connections"; "count" => self.connections.len());
            }

            let ctx = &self.ctx;
            let users = &mut self.users;
            for connection in &mut self.connections {
                connection.tick(ctx, users);
            }

            thread::sleep(SLEEP_MANAGER);
        }

        // Wind down whatever is still open so enter/exit accounting balances.
        let users = &mut self.users;
        for connection in &mut self.connections {
            connection.close(users, "Server shutting down");
        }

        logging::info!(self.log, "manager stopped");
    }
}
