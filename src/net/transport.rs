use crate::error::{CodecError, NetworkError};
use crate::net::protocol::Message;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;
const FRAME_HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// Nothing complete arrived before the read timeout; partial data stays buffered.
    Timeout,
    /// Peer closed the stream between frames.
    Closed,
}

/// A bidirectional stream of length-prefixed frames.
pub trait FrameTransport: Send {
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), NetworkError>;
    fn read_frame(&mut self) -> Result<ReadOutcome, NetworkError>;
    fn write_frame(&mut self, body: &[u8]) -> Result<(), NetworkError>;
    fn shutdown(&mut self);

    fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        let body = message.encode()?;
        self.write_frame(&body)
    }
}

pub struct TcpFrameTransport {
    stream: TcpStream,
    recv_buffer: Vec<u8>,
    max_frame: usize,
}

impl TcpFrameTransport {
    pub fn new(stream: TcpStream, max_frame: usize) -> Result<Self, NetworkError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            recv_buffer: Vec::new(),
            max_frame: max_frame.max(1),
        })
    }

    pub fn connect(addr: SocketAddr, timeout: Duration, max_frame: usize) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| NetworkError::lost(format!("connect {} failed: {}", addr, err)))?;
        Self::new(stream, max_frame)
    }

    fn try_take_frame(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        if self.recv_buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.recv_buffer[..FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len == 0 {
            return Err(CodecError::corrupt("frame length is zero").into());
        }
        if len > self.max_frame {
            return Err(CodecError::corrupt(format!(
                "frame length {} exceeds max {}",
                len, self.max_frame
            ))
            .into());
        }
        let total = FRAME_HEADER_LEN + len;
        if self.recv_buffer.len() < total {
            return Ok(None);
        }
        let body = self.recv_buffer[FRAME_HEADER_LEN..total].to_vec();
        self.recv_buffer.drain(..total);
        Ok(Some(body))
    }
}

impl FrameTransport for TcpFrameTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), NetworkError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<ReadOutcome, NetworkError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.try_take_frame()? {
                return Ok(ReadOutcome::Frame(frame));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) if self.recv_buffer.is_empty() => return Ok(ReadOutcome::Closed),
                Ok(0) => return Err(NetworkError::lost("peer closed the stream mid-frame")),
                Ok(read) => self.recv_buffer.extend_from_slice(&chunk[..read]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadOutcome::Timeout);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(NetworkError::lost(format!("frame read failed: {}", err))),
            }
        }
    }

    fn write_frame(&mut self, body: &[u8]) -> Result<(), NetworkError> {
        if body.is_empty() {
            return Err(CodecError::corrupt("outgoing frame is empty").into());
        }
        let too_large = NetworkError::FrameTooLarge {
            len: body.len(),
            max: self.max_frame,
        };
        if body.len() > self.max_frame {
            return Err(too_large);
        }
        let len = u32::try_from(body.len()).map_err(|_| too_large)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(body);
        self.stream
            .write_all(&frame)
            .map_err(|err| NetworkError::lost(format!("frame write failed: {}", err)))?;
        self.stream
            .flush()
            .map_err(|err| NetworkError::lost(format!("frame flush failed: {}", err)))
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("stream shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair(max_frame: usize) -> (TcpFrameTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = thread::spawn(move || TcpStream::connect(addr).expect("connect"));
        let (server, _) = listener.accept().expect("accept");
        let raw = client.join().expect("join");
        let mut transport = TcpFrameTransport::new(server, max_frame).expect("transport");
        transport
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("timeout");
        (transport, raw)
    }

    #[test]
    fn frame_split_across_writes_is_reassembled() {
        let (mut transport, mut raw) = pair(DEFAULT_MAX_FRAME);
        raw.write_all(&[5, 0]).expect("write");
        assert_eq!(transport.read_frame().expect("read"), ReadOutcome::Timeout);
        raw.write_all(&[0, 0, b'h', b'e']).expect("write");
        assert_eq!(transport.read_frame().expect("read"), ReadOutcome::Timeout);
        raw.write_all(&[b'l', b'l', b'o', 1, 0, 0, 0, b'!']).expect("write");
        assert_eq!(
            transport.read_frame().expect("read"),
            ReadOutcome::Frame(b"hello".to_vec())
        );
        assert_eq!(
            transport.read_frame().expect("read"),
            ReadOutcome::Frame(b"!".to_vec())
        );
        drop(raw);
        assert_eq!(transport.read_frame().expect("read"), ReadOutcome::Closed);
    }

    #[test]
    fn zero_and_oversized_frames_are_violations() {
        let (mut transport, mut raw) = pair(8);
        raw.write_all(&[0, 0, 0, 0]).expect("write");
        assert!(matches!(
            transport.read_frame(),
            Err(NetworkError::Malformed(CodecError::Corrupt(_)))
        ));

        let (mut transport, mut raw) = pair(8);
        raw.write_all(&[9, 0, 0, 0]).expect("write");
        assert!(matches!(
            transport.read_frame(),
            Err(NetworkError::Malformed(CodecError::Corrupt(_)))
        ));
    }

    #[test]
    fn messages_cross_the_wire() {
        let (mut transport, raw) = pair(DEFAULT_MAX_FRAME);
        let mut other = TcpFrameTransport::new(raw, DEFAULT_MAX_FRAME).expect("transport");
        other.send(&Message::Ping).expect("send");
        match transport.read_frame().expect("read") {
            ReadOutcome::Frame(body) => {
                assert_eq!(Message::decode(&body).expect("decode"), Message::Ping)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(other.write_frame(&[]).is_err());
    }

    #[test]
    fn oversized_outgoing_message_names_the_limit() {
        let (mut transport, raw) = pair(DEFAULT_MAX_FRAME);
        let mut small = TcpFrameTransport::new(raw, 4).expect("transport");
        let err = small.write_frame(&[1, 2, 3, 4, 5]).expect_err("too large");
        assert!(matches!(err, NetworkError::FrameTooLarge { len: 5, max: 4 }));
        assert!(err.to_string().contains("session.max_frame_len"));

        small.write_frame(&[1, 2, 3, 4]).expect("fits");
        assert_eq!(
            transport.read_frame().expect("read"),
            ReadOutcome::Frame(vec![1, 2, 3, 4])
        );
    }

    #[test]
    fn close_mid_frame_is_connection_loss() {
        let (mut transport, mut raw) = pair(DEFAULT_MAX_FRAME);
        raw.write_all(&[10, 0, 0, 0, 1, 2]).expect("write");
        drop(raw);
        let mut outcome = transport.read_frame();
        while matches!(outcome, Ok(ReadOutcome::Timeout)) {
            outcome = transport.read_frame();
        }
        assert!(matches!(outcome, Err(NetworkError::ConnectionLost(_))));
    }
}
