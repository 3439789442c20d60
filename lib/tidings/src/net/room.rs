use crate::codec::message::Message;
use crate::net::connection::ConnectionHandle;
use crate::net::user::User;
use crate::SLEEP_ROOM;
use crossbeam_channel::Receiver;
use plinth::logging;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Application-level handler for authenticated traffic.
///
/// The server drives exactly one room. `handle` runs on the room worker;
/// replies go back through [`ConnectionHandle::queue`].
pub trait Room: Send {
    /// Handles one message from a logged-in user. Errors are logged and do
    /// not stop the room.
    fn handle(&mut self, connection: &Arc<ConnectionHandle>, message: Message) -> Result<(), Box<dyn Error>>;

    /// Called when a user has logged in.
    fn user_enter(&mut self, _connection: &Arc<ConnectionHandle>) {}

    /// Called when a user's connection has closed. The connection is gone at
    /// this point, so nothing can be sent back.
    fn user_exit(&mut self, _user: &User) {}
}

/// Notifications delivered to the room worker, in arrival order. Lifecycle
/// events travel the same queue as messages so a user's enter always
/// precedes their traffic.
pub enum RoomEvent {
    Enter(Arc<ConnectionHandle>),
    Exit(User),
    Message(Arc<ConnectionHandle>, Message),
}

/// Worker that drains the event queue into the user-provided room.
pub(crate) struct RoomRunner {
    room: Box<dyn Room>,
    events: Receiver<RoomEvent>,
    halt: Arc<AtomicBool>,
    log: logging::Logger,
}

impl RoomRunner {
    pub(crate) fn new(
        room: Box<dyn Room>,
        events: Receiver<RoomEvent>,
        halt: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> RoomRunner {
        RoomRunner { room, events, halt, log }
    }

    pub(crate) fn run(mut self) {
        logging::info!(self.log, "room starting");

        while !self.halt.load(Ordering::Relaxed) {
            while let Ok(event) = self.events.try_recv() {
                match event {
                    RoomEvent::Enter(connection) => self.room.user_enter(&connection),
                    RoomEvent::Exit(user) => self.room.user_exit(&user),
                    RoomEvent::Message(connection, message) => {
                        if let Err(err) = self.room.handle(&connection, message) {
                            logging::error!(self.log, "error handling message";
                                            "peer" => %connection.addr(),
                                            "error" => %err);
                        }
                    }
                }
            }

            thread::sleep(SLEEP_ROOM);
        }

        logging::info!(self.log, "room stopped");
    }
}
