use crate::codec::message::Message;
use crate::codec::{MAX_BODY_LEN, MIN_BODY_LEN};
use crate::error::{ProtocolError, WireError};
use crate::SLEEP_HANDSHAKE;
use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::Read;
use std::thread;
use std::time::Instant;

/// Reassembles length-prefixed frames from a non-blocking byte stream.
///
/// The reader alternates between two sub-states: collecting the four byte
/// length prefix and collecting the body it announces. Partial reads are
/// buffered, so a frame may arrive in any number of fragments across any
/// number of `poll` calls.
pub struct MessageReader {
    head: [u8; 4],
    body: Vec<u8>,
    read: usize,
    size: Option<usize>,
}

impl MessageReader {
    pub fn new() -> MessageReader {
        MessageReader {
            head: [0; 4],
            body: Vec::new(),
            read: 0,
            size: None,
        }
    }

    /// Returns the next complete message, or `None` when the stream has no
    /// full frame available yet.
    ///
    /// A read that would block leaves all progress buffered and returns
    /// `None`. A read of zero bytes means the peer closed the connection and
    /// fails with `WireError::Closed`, whether or not a partial frame was
    /// buffered.
    pub fn poll<R: Read>(&mut self, conn: &mut R) -> Result<Option<Message>, WireError> {
        if self.size.is_none() {
            match conn.read(&mut self.head[self.read..]) {
                Ok(0) => return Err(WireError::Closed),
                Ok(count) => self.read += count,
                Err(err) => return suppress_would_block(err),
            }

            if self.read < self.head.len() {
                return Ok(None);
            }

            let size = LittleEndian::read_u32(&self.head) as usize;
            if size < MIN_BODY_LEN || size > MAX_BODY_LEN {
                return Err(ProtocolError::BadLength(size as u32).into());
            }

            self.body = vec![0; size];
            self.read = 0;
            self.size = Some(size);
        }

        if let Some(size) = self.size {
            match conn.read(&mut self.body[self.read..]) {
                Ok(0) => return Err(WireError::Closed),
                Ok(count) => self.read += count,
                Err(err) => return suppress_would_block(err),
            }

            if self.read == size {
                let message = Message::unpack(&self.body)?;
                self.body = Vec::new();
                self.read = 0;
                self.size = None;
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    /// Blocking variant for the handshake: polls with a short sleep until a
    /// message arrives, the stream fails, or the optional deadline passes
    /// (in which case `None` is returned).
    pub fn poll_blocking<R: Read>(
        &mut self,
        conn: &mut R,
        deadline: Option<Instant>,
    ) -> Result<Option<Message>, WireError> {
        loop {
            if let Some(message) = self.poll(conn)? {
                return Ok(Some(message));
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Ok(None);
                }
            }
            thread::sleep(SLEEP_HANDSHAKE);
        }
    }
}

fn suppress_would_block(err: io::Error) -> Result<Option<Message>, WireError> {
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(None),
        _ => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::definition::{Kind, MessageDefinition};
    use crate::codec::writer::MessageWriter;
    use byteorder::WriteBytesExt;
    use std::cmp::min;

    /// Read end of a fake socket: serves the canned data in fixed-size
    /// chunks and reports would-block once drained.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    /// The same frame a writer would emit, as raw bytes.
    fn frame(message: &Message) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer.queue(message).unwrap();
        writer.take_buffer()
    }

    fn sample_message() -> Message {
        MessageDefinition::register(
            "ReaderSample",
            &[("count", Kind::Int32), ("label", Kind::Utf8String)],
        )
        .ok();

        Message::new("ReaderSample")
            .unwrap()
            .with("count", 42)
            .unwrap()
            .with("label", "fragmented")
            .unwrap()
    }

    #[test]
    fn test_poll_reads_whole_frame() {
        let message = sample_message();
        let mut channel = MockChannel::new(frame(&message), 4096);
        let mut reader = MessageReader::new();

        let received = reader.poll(&mut channel).unwrap().expect("one message");
        assert_eq!(received.name(), "ReaderSample");
        assert_eq!(received.i32("count").unwrap(), 42);
        assert_eq!(received.str("label").unwrap(), "fragmented");
    }

    #[test]
    fn test_poll_survives_single_byte_fragments() {
        let message = sample_message();
        let bytes = frame(&message);
        let total = bytes.len();
        let mut channel = MockChannel::new(bytes, 1);
        let mut reader = MessageReader::new();

        let mut received = None;
        for _ in 0..total + 4 {
            if let Some(message) = reader.poll(&mut channel).unwrap() {
                received = Some(message);
                break;
            }
        }

        let received = received.expect("message after fragments");
        assert_eq!(received.i32("count").unwrap(), 42);
        assert_eq!(received.str("label").unwrap(), "fragmented");

        // Nothing left on the stream.
        assert!(reader.poll(&mut channel).unwrap().is_none());
    }

    #[test]
    fn test_poll_survives_random_fragmentation() {
        use rand::Rng;

        let message = sample_message();
        let bytes = frame(&message);
        let total = bytes.len();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let chunk = rng.gen_range(1..=total);
            let mut channel = MockChannel::new(bytes.clone(), chunk);
            let mut reader = MessageReader::new();

            let mut received = None;
            for _ in 0..total + 4 {
                if let Some(message) = reader.poll(&mut channel).unwrap() {
                    received = Some(message);
                    break;
                }
            }

            let received = received.expect("message after fragments");
            assert_eq!(received.i32("count").unwrap(), 42);
            assert_eq!(received.str("label").unwrap(), "fragmented");
        }
    }

    #[test]
    fn test_poll_returns_none_on_would_block() {
        let mut channel = MockChannel::new(Vec::new(), 1);
        let mut reader = MessageReader::new();

        assert!(reader.poll(&mut channel).unwrap().is_none());
    }

    #[test]
    fn test_poll_closed_on_zero_read() {
        struct ClosedChannel;

        impl Read for ClosedChannel {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }

        let mut reader = MessageReader::new();
        match reader.poll(&mut ClosedChannel) {
            Err(WireError::Closed) => {}
            _ => panic!("Expected Closed"),
        }
    }

    #[test]
    fn test_poll_closed_mid_frame() {
        let message = sample_message();
        let mut bytes = frame(&message);
        bytes.truncate(bytes.len() - 3);

        struct TruncatedChannel {
            inner: MockChannel,
        }

        impl Read for TruncatedChannel {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.inner.read(buf) {
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    result => result,
                }
            }
        }

        let mut channel = TruncatedChannel {
            inner: MockChannel::new(bytes, 4096),
        };
        let mut reader = MessageReader::new();

        assert!(reader.poll(&mut channel).unwrap().is_none());
        match reader.poll(&mut channel) {
            Err(WireError::Closed) => {}
            _ => panic!("Expected Closed after zero-byte read mid frame"),
        }
    }

    #[test]
    fn test_poll_rejects_absurd_length_prefix() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(u32::max_value()).unwrap();

        let mut channel = MockChannel::new(bytes, 4096);
        let mut reader = MessageReader::new();

        match reader.poll(&mut channel) {
            Err(WireError::Protocol(ProtocolError::BadLength(_))) => {}
            _ => panic!("Expected BadLength"),
        }
    }

    #[test]
    fn test_poll_rejects_zero_length_prefix() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(0).unwrap();

        let mut channel = MockChannel::new(bytes, 4096);
        let mut reader = MessageReader::new();

        match reader.poll(&mut channel) {
            Err(WireError::Protocol(ProtocolError::BadLength(0))) => {}
            _ => panic!("Expected BadLength"),
        }
    }

    #[test]
    fn test_poll_reads_back_to_back_frames() {
        let message = sample_message();
        let mut bytes = frame(&message);
        bytes.extend(frame(&message));

        let mut channel = MockChannel::new(bytes, 4096);
        let mut reader = MessageReader::new();

        // One frame per poll pass at most.
        assert!(reader.poll(&mut channel).unwrap().is_some());
        assert!(reader.poll(&mut channel).unwrap().is_some());
        assert!(reader.poll(&mut channel).unwrap().is_none());
    }

    #[test]
    fn test_poll_blocking_deadline_expires() {
        let mut channel = MockChannel::new(Vec::new(), 1);
        let mut reader = MessageReader::new();

        let deadline = Instant::now();
        let result = reader.poll_blocking(&mut channel, Some(deadline)).unwrap();
        assert!(result.is_none());
    }
}
