//! Server-side timeout behaviour, exercised with a hand-driven socket so
//! the automatic pong of the real client does not get in the way.

use plinth::digest::digest;
use std::error::Error;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidings::{
    ConnectionHandle, Message, MessageReader, MessageWriter, Room, Server, ServerConfig, Timeouts,
    User, WireError,
};

struct SilentRoom {
    exits: Arc<AtomicUsize>,
}

impl Room for SilentRoom {
    fn handle(&mut self, _connection: &Arc<ConnectionHandle>, _message: Message) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    fn user_exit(&mut self, _user: &User) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }
}

struct Fixture {
    server: Server,
    port: u16,
    exits: Arc<AtomicUsize>,
}

/// Server with millisecond-scale timing so the timeout paths run quickly.
fn start_server(timeouts: Timeouts) -> Fixture {
    let exits = Arc::new(AtomicUsize::new(0));

    let mut server = Server::new(
        Box::new(|_major, _minor, _revision| true),
        Box::new(|username, password, salt| {
            if password == digest("pw", salt) {
                Some(User::new(username))
            } else {
                None
            }
        }),
        Box::new(SilentRoom { exits: exits.clone() }),
        ServerConfig {
            port: 0,
            timeouts,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let port = server.local_addr().unwrap().port();
    server.start();

    Fixture { server, port, exits }
}

fn short_timeouts() -> Timeouts {
    Timeouts {
        login_timeout: Duration::from_millis(200),
        ping_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(200),
    }
}

struct RawClient {
    stream: TcpStream,
    reader: MessageReader,
    writer: MessageWriter,
}

impl RawClient {
    /// Connects and consumes the welcome, returning the salt.
    fn connect(port: u16) -> (RawClient, String) {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nonblocking(true).unwrap();

        let mut client = RawClient {
            stream,
            reader: MessageReader::new(),
            writer: MessageWriter::new(),
        };

        let welcome = client.expect("_welcome");
        let salt = welcome.str("salt").unwrap().to_string();
        (client, salt)
    }

    fn login(&mut self, salt: &str) {
        let login = Message::new("_login")
            .unwrap()
            .with("username", "michael")
            .unwrap()
            .with("password", digest("pw", salt).as_str())
            .unwrap()
            .with("major", 1)
            .unwrap()
            .with("minor", 0)
            .unwrap()
            .with("revision", 0)
            .unwrap();
        self.writer.send_blocking(&login, &mut self.stream).unwrap();
        self.expect("_loginAccept");
    }

    fn send(&mut self, message: &Message) {
        self.writer.send_blocking(message, &mut self.stream).unwrap();
    }

    /// Blocks until a message arrives and asserts its name.
    fn expect(&mut self, name: &str) -> Message {
        let deadline = Instant::now() + Duration::from_secs(5);
        let message = self
            .reader
            .poll_blocking(&mut self.stream, Some(deadline))
            .unwrap()
            .unwrap_or_else(|| panic!("no {} before the deadline", name));
        assert_eq!(message.name(), name);
        message
    }

    /// Blocks until the server closes the connection.
    fn expect_close(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        match self.reader.poll_blocking(&mut self.stream, Some(deadline)) {
            Err(WireError::Closed) | Err(WireError::Io(_)) => {}
            Ok(Some(message)) => panic!("expected close, got {}", message),
            Ok(None) => panic!("connection still open at the deadline"),
            Err(err) => panic!("expected close, got {:?}", err),
        }
    }
}

#[test]
fn test_silent_client_is_pinged_then_dropped() {
    let fixture = start_server(short_timeouts());

    let (mut client, salt) = RawClient::connect(fixture.port);
    client.login(&salt);

    // No traffic: the server pings, gets no pong, and gives up.
    client.expect("_ping");
    client.expect_close();

    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.exits.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fixture.exits.load(Ordering::Relaxed), 1);

    shut_down(fixture);
}

#[test]
fn test_pong_keeps_the_connection_alive() {
    let fixture = start_server(short_timeouts());

    let (mut client, salt) = RawClient::connect(fixture.port);
    client.login(&salt);

    // Answering each ping resets the interval, so pings keep coming instead
    // of the connection being dropped.
    for _ in 0..3 {
        client.expect("_ping");
        client.send(&Message::new("_pong").unwrap());
    }
    assert_eq!(fixture.exits.load(Ordering::Relaxed), 0);

    shut_down(fixture);
}

#[test]
fn test_login_timeout_closes_the_connection() {
    let fixture = start_server(short_timeouts());

    let (mut client, _salt) = RawClient::connect(fixture.port);

    // Never log in.
    client.expect_close();

    assert_eq!(fixture.exits.load(Ordering::Relaxed), 0);

    shut_down(fixture);
}

#[test]
fn test_unexpected_message_during_login_is_rejected() {
    let fixture = start_server(Timeouts::default());

    let (mut client, _salt) = RawClient::connect(fixture.port);
    client.send(&Message::new("_pong").unwrap());

    let reject = client.expect("_loginReject");
    assert_eq!(reject.str("reason").unwrap(), "Unexpected message.");
    client.expect_close();

    shut_down(fixture);
}

fn shut_down(mut fixture: Fixture) {
    fixture.server.stop(None);
    fixture.server.join().unwrap();
}
