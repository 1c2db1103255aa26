//! Resumable, non-blocking reading and writing of length prefixed frames on a stream socket.
//!
//! A frame on the wire is a big-endian u32 length followed by exactly that many bytes. Reader
//!  and writer each perform at most one read / write call per step and keep partial progress
//!  between steps, so they can be driven by readiness events. A step returns `Poll::Pending`
//!  if the socket would block.

use std::io::{ErrorKind, Read, Write};
use std::task::Poll;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const LENGTH_PREFIX_LEN: usize = std::mem::size_of::<u32>();

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadState {
    /// a frame is partially read, or no frame was started yet
    Receiving,
    /// a complete frame is available via [FramedReader::take_frame]
    Idle,
    Error,
    /// the peer closed the connection between frames
    Done,
}

pub struct FramedReader {
    max_frame_len: usize,
    state: ReadState,
    len_buf: [u8; LENGTH_PREFIX_LEN],
    len_read: usize,
    frame: Vec<u8>,
    frame_read: usize,
}

impl FramedReader {
    pub fn new(max_frame_len: usize) -> FramedReader {
        FramedReader {
            max_frame_len,
            state: ReadState::Receiving,
            len_buf: [0; LENGTH_PREFIX_LEN],
            len_read: 0,
            frame: Vec::new(),
            frame_read: 0,
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    fn in_length_prefix(&self) -> bool {
        self.len_read < LENGTH_PREFIX_LEN
    }

    pub fn read_step(&mut self, stream: &mut impl Read) -> Poll<ReadState> {
        if self.state != ReadState::Receiving {
            return Poll::Ready(self.state);
        }

        let result = if self.in_length_prefix() {
            stream.read(&mut self.len_buf[self.len_read..])
        }
        else {
            stream.read(&mut self.frame[self.frame_read..])
        };

        match result {
            Ok(0) => {
                if self.len_read == 0 {
                    trace!("peer closed connection");
                    self.state = ReadState::Done;
                }
                else {
                    debug!("peer closed connection in the middle of a frame");
                    self.state = ReadState::Error;
                }
            }
            Ok(n) => {
                if self.in_length_prefix() {
                    self.len_read += n;
                    if !self.in_length_prefix() {
                        self.on_length_prefix_complete();
                    }
                }
                else {
                    self.frame_read += n;
                    if self.frame_read == self.frame.len() {
                        self.state = ReadState::Idle;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("error reading from stream: {}", e);
                self.state = ReadState::Error;
            }
        }
        Poll::Ready(self.state)
    }

    fn on_length_prefix_complete(&mut self) {
        let frame_len: usize = u32::from_be_bytes(self.len_buf).safe_cast();
        if frame_len > self.max_frame_len {
            debug!("received frame length {} exceeds the maximum of {} - closing connection", frame_len, self.max_frame_len);
            self.state = ReadState::Error;
            return;
        }

        self.frame = vec![0; frame_len];
        self.frame_read = 0;
        if frame_len == 0 {
            self.state = ReadState::Idle;
        }
    }

    /// Returns the frame that was read completely, and prepares for reading the next one
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.state != ReadState::Idle {
            return None;
        }
        self.state = ReadState::Receiving;
        self.len_read = 0;
        self.frame_read = 0;
        Some(std::mem::take(&mut self.frame))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteState {
    /// waiting for a non-blocking connect to complete
    Connecting,
    /// connected, no frame in progress
    Ready,
    Sending,
    Error,
    /// the peer does not accept any more data
    Done,
}

pub struct FramedWriter {
    state: WriteState,
    buf: Bytes,
    written: usize,
}

impl FramedWriter {
    pub fn new_connecting() -> FramedWriter {
        FramedWriter {
            state: WriteState::Connecting,
            buf: Bytes::new(),
            written: 0,
        }
    }

    pub fn new_connected() -> FramedWriter {
        FramedWriter {
            state: WriteState::Ready,
            ..Self::new_connecting()
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn on_connected(&mut self) {
        if self.state == WriteState::Connecting {
            self.state = WriteState::Ready;
        }
    }

    pub fn on_error(&mut self) {
        self.state = WriteState::Error;
    }

    pub fn start_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if self.state != WriteState::Ready {
            bail!("can not start a frame in state {:?}", self.state);
        }
        if payload.len() > u32::MAX as usize {
            bail!("frame of {} bytes does not fit the length prefix", payload.len());
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(payload.len().prechecked_cast());
        buf.put_slice(payload);

        self.buf = buf.freeze();
        self.written = 0;
        self.state = WriteState::Sending;
        Ok(())
    }

    pub fn write_step(&mut self, stream: &mut impl Write) -> Poll<WriteState> {
        if self.state != WriteState::Sending {
            return Poll::Ready(self.state);
        }

        match stream.write(&self.buf[self.written..]) {
            Ok(0) => {
                debug!("stream accepts no more data");
                self.state = WriteState::Done;
            }
            Ok(n) => {
                self.written += n;
                if self.written == self.buf.len() {
                    self.buf = Bytes::new();
                    self.written = 0;
                    self.state = WriteState::Ready;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("error writing to stream: {}", e);
                self.state = WriteState::Error;
            }
        }
        Poll::Ready(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use rstest::rstest;

    /// Hands out the scripted input chunk by chunk and then reports would-block. Writes alternate
    ///  between accepting up to `max_write` bytes and blocking.
    struct ChunkedStream {
        chunks: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        max_write: usize,
        block_next_write: bool,
    }

    impl ChunkedStream {
        fn reading(chunks: Vec<io::Result<Vec<u8>>>) -> ChunkedStream {
            ChunkedStream {
                chunks: chunks.into(),
                written: Vec::new(),
                max_write: usize::MAX,
                block_next_write: false,
            }
        }

        fn writing(max_write: usize) -> ChunkedStream {
            ChunkedStream {
                max_write,
                ..Self::reading(vec![])
            }
        }
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Err(ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ChunkedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next_write {
                self.block_next_write = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            self.block_next_write = true;
            let n = buf.len().min(self.max_write);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn read_until_blocked(reader: &mut FramedReader, stream: &mut ChunkedStream) -> ReadState {
        loop {
            match reader.read_step(stream) {
                Poll::Pending => return reader.state(),
                Poll::Ready(ReadState::Receiving) => continue,
                Poll::Ready(state) => return state,
            }
        }
    }

    #[test]
    fn test_read_in_chunks() {
        let mut stream = ChunkedStream::reading(vec![
            Ok(vec![0, 0]),
            Ok(vec![0, 5, b'a']),
            Ok(vec![b'b', b'c', b'd', b'e', 0, 0, 0, 1]),
            Ok(vec![b'x']),
        ]);
        let mut reader = FramedReader::new(100);

        assert_eq!(reader.read_step(&mut stream), Poll::Ready(ReadState::Receiving));
        assert_eq!(reader.take_frame(), None);

        assert_eq!(read_until_blocked(&mut reader, &mut stream), ReadState::Idle);
        assert_eq!(reader.take_frame().unwrap(), b"abcde");
        assert_eq!(read_until_blocked(&mut reader, &mut stream), ReadState::Idle);
        assert_eq!(reader.take_frame().unwrap(), b"x");
        assert_eq!(reader.read_step(&mut stream), Poll::Pending);
        assert_eq!(reader.state(), ReadState::Receiving);
    }

    #[test]
    fn test_read_empty_frame() {
        let mut stream = ChunkedStream::reading(vec![Ok(vec![0, 0, 0, 0])]);
        let mut reader = FramedReader::new(100);
        assert_eq!(reader.read_step(&mut stream), Poll::Ready(ReadState::Idle));
        assert_eq!(reader.take_frame().unwrap(), Vec::<u8>::new());
    }

    #[rstest]
    #[case::close_between_frames(vec![Ok(vec![0, 0, 0, 1, 9]), Ok(vec![])], ReadState::Done)]
    #[case::close_in_prefix(vec![Ok(vec![0, 0]), Ok(vec![])], ReadState::Error)]
    #[case::close_in_frame(vec![Ok(vec![0, 0, 0, 3, 1]), Ok(vec![])], ReadState::Error)]
    #[case::io_error(vec![Err(io::Error::from(ErrorKind::ConnectionReset))], ReadState::Error)]
    #[case::frame_too_long(vec![Ok(vec![0, 0, 1, 0])], ReadState::Error)]
    fn test_read_termination(#[case] chunks: Vec<io::Result<Vec<u8>>>, #[case] expected: ReadState) {
        let mut stream = ChunkedStream::reading(chunks);
        let mut reader = FramedReader::new(100);

        let mut state = read_until_blocked(&mut reader, &mut stream);
        if state == ReadState::Idle {
            reader.take_frame();
            state = read_until_blocked(&mut reader, &mut stream);
        }
        assert_eq!(state, expected);
        assert_eq!(reader.read_step(&mut stream), Poll::Ready(expected));
    }

    #[test]
    fn test_read_interrupted_is_retried() {
        let mut stream = ChunkedStream::reading(vec![
            Err(io::Error::from(ErrorKind::Interrupted)),
            Ok(vec![0, 0, 0, 1, 7]),
        ]);
        let mut reader = FramedReader::new(100);
        assert_eq!(read_until_blocked(&mut reader, &mut stream), ReadState::Idle);
        assert_eq!(reader.take_frame().unwrap(), vec![7]);
    }

    #[test]
    fn test_write_partial() {
        let mut stream = ChunkedStream::writing(3);
        let mut writer = FramedWriter::new_connected();
        writer.start_frame(b"hello").unwrap();
        assert!(writer.start_frame(b"again").is_err());

        let mut num_pending = 0;
        loop {
            match writer.write_step(&mut stream) {
                Poll::Pending => num_pending += 1,
                Poll::Ready(WriteState::Sending) => {}
                Poll::Ready(state) => {
                    assert_eq!(state, WriteState::Ready);
                    break;
                }
            }
        }
        assert_eq!(stream.written, vec![0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(num_pending, 2);
    }

    #[test]
    fn test_write_requires_connection() {
        let mut writer = FramedWriter::new_connecting();
        assert!(writer.start_frame(b"x").is_err());
        writer.on_connected();
        assert_eq!(writer.state(), WriteState::Ready);
        writer.start_frame(b"x").unwrap();
        assert_eq!(writer.state(), WriteState::Sending);
    }

    #[test]
    fn test_write_zero_is_done() {
        let mut stream = ChunkedStream::writing(0);
        let mut writer = FramedWriter::new_connected();
        writer.start_frame(b"x").unwrap();
        assert_eq!(writer.write_step(&mut stream), Poll::Ready(WriteState::Done));
    }

    #[test]
    fn test_round_trip_through_buffer() {
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();

        let mut out = ChunkedStream::writing(77);
        let mut writer = FramedWriter::new_connected();
        writer.start_frame(&payload).unwrap();
        while writer.state() == WriteState::Sending {
            let _ = writer.write_step(&mut out);
        }

        let chunks = out.written.chunks(13).map(|c| Ok(c.to_vec())).collect();
        let mut stream = ChunkedStream::reading(chunks);
        let mut reader = FramedReader::new(1000);
        assert_eq!(read_until_blocked(&mut reader, &mut stream), ReadState::Idle);
        assert_eq!(reader.take_frame().unwrap(), payload);
    }
}
