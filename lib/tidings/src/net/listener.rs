use crate::error::FatalError;
use crate::net::connection::Connection;
use crate::SLEEP_LISTENER;
use crossbeam_channel::Sender;
use plinth::logging;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Accepts new TCP sockets and publishes them to the manager.
pub(crate) struct Listener {
    socket: TcpListener,
    manager: Sender<Connection>,
    halt: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Listener {
    pub(crate) fn new(
        socket: TcpListener,
        manager: Sender<Connection>,
        halt: Arc<AtomicBool>,
        log: logging::Logger,
    ) -> Listener {
        Listener {
            socket,
            manager,
            halt,
            log,
        }
    }

    /// Accept loop. Transient accept failures back off and retry; anything
    /// else is fatal to the server.
    pub(crate) fn run(self) -> Result<(), FatalError> {
        logging::info!(self.log, "listener starting");

        while !self.halt.load(Ordering::Relaxed) {
            match self.socket.accept() {
                Ok((stream, addr)) => match Connection::new(stream, addr, &self.log) {
                    Ok(connection) => drop(self.manager.send(connection)),
                    Err(err) => {
                        logging::warn!(self.log, "could not prepare accepted socket";
                                       "peer" => %addr, "error" => %err);
                    }
                },
                Err(err) if transient(&err) => thread::sleep(SLEEP_LISTENER),
                Err(err) => {
                    logging::error!(self.log, "listener failed"; "error" => %err);
                    return Err(Box::new(err));
                }
            }
        }

        logging::info!(self.log, "listener stopped");
        Ok(())
    }
}

fn transient(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => true,
        _ => false,
    }
}
