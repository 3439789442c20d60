use crate::codec::message::Message;
use crate::error::{ProtocolError, WireError};
use crate::SLEEP_HANDSHAKE;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io;
use std::io::Write;
use std::thread;

/// Emits length-prefixed frames onto a non-blocking byte stream.
///
/// `queue` frames messages into an internal buffer; `send` drains as much of
/// the buffer as the stream accepts, preserving the rest for the next call.
pub struct MessageWriter {
    buffer: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> MessageWriter {
        MessageWriter { buffer: Vec::new() }
    }

    /// Appends `[length || body]` for the message to the write buffer.
    pub fn queue(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let body = message.pack()?;
        self.buffer
            .write_u32::<LittleEndian>(body.len() as u32)
            .expect("vec write");
        self.buffer.extend_from_slice(&body);
        Ok(())
    }

    /// True when no buffered bytes are waiting to depart.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes as much buffered data as the stream accepts. Returns once the
    /// buffer is empty or the write would block.
    pub fn send<W: Write>(&mut self, conn: &mut W) -> Result<(), WireError> {
        while !self.buffer.is_empty() {
            match conn.write(&self.buffer) {
                Ok(0) => return Err(WireError::Closed),
                Ok(count) => {
                    self.buffer.drain(..count);
                }
                Err(err) => {
                    return match err.kind() {
                        io::ErrorKind::WouldBlock => Ok(()),
                        _ => Err(err.into()),
                    };
                }
            }
        }
        Ok(())
    }

    /// Sends one message immediately, sleeping through full socket buffers
    /// until the whole frame has departed. Handshake use only.
    pub fn send_blocking<W: Write>(&mut self, message: &Message, conn: &mut W) -> Result<(), WireError> {
        self.queue(message).map_err(WireError::Protocol)?;

        while !self.buffer.is_empty() {
            match conn.write(&self.buffer) {
                Ok(0) => return Err(WireError::Closed),
                Ok(count) => {
                    self.buffer.drain(..count);
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => thread::sleep(SLEEP_HANDSHAKE),
                    _ => return Err(err.into()),
                },
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.buffer, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::definition::{Kind, MessageDefinition};
    use crate::codec::reader::MessageReader;
    use byteorder::ByteOrder;
    use std::cmp::min;
    use std::io::Read;

    /// Write end of a fake socket: accepts data in fixed-size chunks up to a
    /// capacity and reports would-block beyond it.
    struct MockChannel {
        data: Vec<u8>,
        chunk: usize,
        capacity: usize,
    }

    impl MockChannel {
        fn new(chunk: usize, capacity: usize) -> MockChannel {
            MockChannel {
                data: Vec::new(),
                chunk,
                capacity,
            }
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.capacity {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.capacity - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_message() -> Message {
        MessageDefinition::register("WriterSample", &[("label", Kind::Utf8String)]).ok();

        Message::new("WriterSample").unwrap().with("label", "payload").unwrap()
    }

    #[test]
    fn test_queue_prefixes_body_length() {
        let message = sample_message();
        let body_len = message.pack().unwrap().len();

        let mut writer = MessageWriter::new();
        writer.queue(&message).unwrap();

        let buffer = writer.take_buffer();
        assert_eq!(buffer.len(), 4 + body_len);
        assert_eq!(LittleEndian::read_u32(&buffer[..4]) as usize, body_len);
    }

    #[test]
    fn test_send_drains_in_chunks() {
        let message = sample_message();
        let mut writer = MessageWriter::new();
        writer.queue(&message).unwrap();
        writer.queue(&message).unwrap();

        let mut channel = MockChannel::new(3, usize::max_value());
        writer.send(&mut channel).unwrap();

        assert!(writer.is_empty());

        // Both frames arrive intact and in order.
        let mut reader = MessageReader::new();
        let mut cursor = io::Cursor::new(channel.data);
        assert!(reader.poll(&mut cursor).unwrap().is_some());
        assert!(reader.poll(&mut cursor).unwrap().is_some());
    }

    #[test]
    fn test_send_preserves_remainder_on_would_block() {
        let message = sample_message();
        let mut writer = MessageWriter::new();
        writer.queue(&message).unwrap();

        let frame_len = 4 + message.pack().unwrap().len();
        let mut channel = MockChannel::new(64, 5);

        writer.send(&mut channel).unwrap();
        assert!(!writer.is_empty());
        assert_eq!(channel.data.len(), 5);

        // More room appears; the rest of the frame follows.
        channel.capacity = usize::max_value();
        writer.send(&mut channel).unwrap();
        assert!(writer.is_empty());
        assert_eq!(channel.data.len(), frame_len);
    }

    #[test]
    fn test_send_closed_on_zero_write() {
        struct ClosedChannel;

        impl Write for ClosedChannel {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let message = sample_message();
        let mut writer = MessageWriter::new();
        writer.queue(&message).unwrap();

        match writer.send(&mut ClosedChannel) {
            Err(WireError::Closed) => {}
            _ => panic!("Expected Closed"),
        }
    }

    #[test]
    fn test_send_blocking_writes_whole_frame() {
        let message = sample_message();
        let mut writer = MessageWriter::new();
        let mut channel = MockChannel::new(2, usize::max_value());

        writer.send_blocking(&message, &mut channel).unwrap();
        assert!(writer.is_empty());

        let mut reader = MessageReader::new();
        let mut cursor = io::Cursor::new(channel.data);
        let received = reader.poll(&mut cursor).unwrap().expect("one message");
        assert_eq!(received.str("label").unwrap(), "payload");
    }

    #[test]
    fn test_send_on_empty_buffer_is_noop() {
        let mut writer = MessageWriter::new();
        let mut channel = MockChannel::new(8, 8);

        writer.send(&mut channel).unwrap();
        assert!(channel.data.is_empty());
    }
}
