//! Per-socket read/write state.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::net::codec::{encode_frame, FrameDecoder};

/// Lifecycle of a [`Connection`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by the acceptor, owned by a reader loop.
    Inbound,
    /// Opened by a client connection manager, owned by a writer loop.
    Outbound,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained, connection still usable.
    Open,
    /// The peer shut down its write half.
    PeerClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Drained,
    /// The socket stopped accepting bytes; resume on the next writable event.
    Pending,
}

/// One TCP socket registered with exactly one event loop.
pub struct Connection {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    direction: Direction,
    state: ConnectionState,
    decoder: FrameDecoder,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,
    queued_bytes: usize,
    max_queued_bytes: usize,
    max_queued_messages: usize,
    no_delay: bool,
}

impl Connection {
    pub fn inbound(
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        config: &TransportConfig,
    ) -> Self {
        Self::new(
            stream,
            token,
            peer,
            Direction::Inbound,
            ConnectionState::Established,
            config,
        )
    }

    /// Wraps a socket whose non-blocking connect is still in flight.
    pub fn outbound(
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        config: &TransportConfig,
    ) -> Self {
        Self::new(
            stream,
            token,
            peer,
            Direction::Outbound,
            ConnectionState::Connecting,
            config,
        )
    }

    fn new(
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        direction: Direction,
        state: ConnectionState,
        config: &TransportConfig,
    ) -> Self {
        Self {
            stream,
            token,
            peer,
            direction,
            state,
            decoder: FrameDecoder::new(config.max_frame_len),
            write_queue: VecDeque::new(),
            write_offset: 0,
            queued_bytes: 0,
            max_queued_bytes: config.max_queued_bytes,
            max_queued_messages: config.max_queued_messages,
            no_delay: config.no_delay,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queued_messages(&self) -> usize {
        self.write_queue.len()
    }

    /// Bytes still owed to the socket, including the unsent tail of a partial write.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = match self.direction {
            Direction::Inbound => Interest::READABLE,
            Direction::Outbound => Interest::READABLE | Interest::WRITABLE,
        };
        registry.register(&mut self.stream, self.token, interest)?;
        if self.state == ConnectionState::Established {
            self.apply_socket_options();
        }
        Ok(())
    }

    fn apply_socket_options(&self) {
        if let Err(e) = self.stream.set_nodelay(self.no_delay) {
            log::debug!("failed to set TCP_NODELAY for {}: {}", self.peer, e);
        }
    }

    /// Frames `payload` and appends it behind everything already queued.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<()> {
        if self.write_queue.len() >= self.max_queued_messages {
            return Err(NetworkError::QueueFull {
                addr: self.peer,
                reason: format!("{} messages pending", self.write_queue.len()),
            });
        }
        let frame = encode_frame(payload);
        if self.queued_bytes + frame.len() > self.max_queued_bytes {
            return Err(NetworkError::QueueFull {
                addr: self.peer,
                reason: format!("{} bytes pending", self.queued_bytes),
            });
        }
        self.queued_bytes += frame.len();
        self.write_queue.push_back(frame);
        Ok(())
    }

    /// Resolves an in-flight connect after a writable event.
    ///
    /// Returns `Ok(false)` on a spurious wakeup while the handshake is still running.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if self.state != ConnectionState::Connecting {
            return Ok(self.state == ConnectionState::Established);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = ConnectionState::Established;
                self.apply_socket_options();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes queued frames in order until the queue is empty or the socket would block.
    pub fn flush(&mut self) -> Result<FlushOutcome> {
        if self.state != ConnectionState::Established {
            return Ok(FlushOutcome::Pending);
        }

        while let Some(front) = self.write_queue.front() {
            match self.stream.write(&front[self.write_offset..]) {
                Ok(0) => {
                    return Err(NetworkError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )));
                }
                Ok(n) => {
                    self.write_offset += n;
                    self.queued_bytes -= n;
                    if self.write_offset == front.len() {
                        self.write_queue.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushOutcome::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(FlushOutcome::Drained)
    }

    /// Drains the socket into the frame decoder, handing every complete payload to `deliver`.
    ///
    /// Frames completed before an error or EOF are still delivered.
    pub fn read_frames<F>(&mut self, scratch: &mut [u8], mut deliver: F) -> Result<ReadOutcome>
    where
        F: FnMut(&[u8]),
    {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => {
                    self.decoder.extend(&scratch[..n]);
                    while let Some(payload) = self.decoder.next_frame()? {
                        deliver(&payload);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Moves through `Closing` to `Closed`, returning how many queued messages were dropped.
    pub(crate) fn close(&mut self, registry: &Registry) -> usize {
        if self.state == ConnectionState::Closed {
            return 0;
        }
        self.state = ConnectionState::Closing;
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);

        let dropped = self.write_queue.len();
        self.write_queue.clear();
        self.write_offset = 0;
        self.queued_bytes = 0;
        self.state = ConnectionState::Closed;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::HEADER_LEN;
    use mio::{Events, Poll};
    use std::net::TcpListener as StdListener;
    use std::time::{Duration, Instant};

    fn config() -> TransportConfig {
        TransportConfig::builder()
            .max_frame_len(64)
            .max_queued_bytes(256)
            .max_queued_messages(4)
            .build()
            .unwrap()
    }

    /// An established pair: (our mio side, peer's std side).
    fn pair() -> (TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client, addr)
    }

    #[test]
    fn test_enqueue_limits() {
        let (stream, _peer, addr) = pair();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());

        for _ in 0..4 {
            conn.enqueue(b"x").unwrap();
        }
        assert_eq!(conn.queued_messages(), 4);
        assert_eq!(conn.queued_bytes(), 4 * (HEADER_LEN + 1));
        assert!(matches!(
            conn.enqueue(b"x"),
            Err(NetworkError::QueueFull { .. })
        ));
    }

    #[test]
    fn test_enqueue_byte_limit() {
        let (stream, _peer, addr) = pair();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());
        conn.enqueue(&[7u8; 60]).unwrap();
        conn.enqueue(&[7u8; 60]).unwrap();
        conn.enqueue(&[7u8; 60]).unwrap();
        // 3 * 64 = 192 queued, a fourth 64-byte frame would exceed 256
        assert!(matches!(
            conn.enqueue(&[7u8; 61]),
            Err(NetworkError::QueueFull { .. })
        ));
    }

    #[test]
    fn test_flush_preserves_order() {
        let (stream, mut peer, addr) = pair();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());

        conn.enqueue(b"first").unwrap();
        conn.enqueue(b"second").unwrap();
        assert_eq!(conn.flush().unwrap(), FlushOutcome::Drained);
        assert_eq!(conn.queued_bytes(), 0);

        let mut expected = encode_frame(b"first");
        expected.extend(encode_frame(b"second"));
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_flush_resumes_partial_write() {
        let (stream, peer, addr) = pair();
        let big = TransportConfig::builder()
            .max_frame_len(4 * 1024 * 1024)
            .build()
            .unwrap();
        let mut conn = Connection::inbound(stream, Token(1), addr, &big);

        let mut expected = Vec::new();
        for i in 0..8u8 {
            let payload = vec![i; 3 * 1024 * 1024];
            expected.extend(encode_frame(&payload));
            conn.enqueue(&payload).unwrap();
        }

        // nobody reads yet, so the socket fills mid-frame
        assert_eq!(conn.flush().unwrap(), FlushOutcome::Pending);
        let remaining = conn.queued_bytes();
        assert!(remaining > 0 && remaining < expected.len());

        let total = expected.len();
        let reader = std::thread::spawn(move || {
            let mut peer = peer;
            let mut received = vec![0u8; total];
            peer.read_exact(&mut received).unwrap();
            received
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while conn.flush().unwrap() == FlushOutcome::Pending && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(conn.queued_bytes(), 0);
        assert_eq!(conn.queued_messages(), 0);
        assert!(reader.join().unwrap() == expected);
    }

    #[test]
    fn test_read_frames_and_eof() {
        let (stream, mut peer, addr) = pair();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());

        peer.write_all(&encode_frame(b"one")).unwrap();
        peer.write_all(&encode_frame(b"two")).unwrap();
        peer.shutdown(Shutdown::Write).unwrap();

        let mut scratch = [0u8; 16];
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let outcome = conn
                .read_frames(&mut scratch, |p| frames.push(p.to_vec()))
                .unwrap();
            if outcome == ReadOutcome::PeerClosed || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_read_oversized_frame_is_error() {
        let (stream, mut peer, addr) = pair();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());

        peer.write_all(&(1024u32).to_be_bytes()).unwrap();

        let mut scratch = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match conn.read_frames(&mut scratch, |_| panic!("no frame expected")) {
                Err(e) => break e,
                Ok(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Ok(outcome) => panic!("expected frame error, got {:?}", outcome),
            }
        };
        assert!(matches!(err, NetworkError::Frame(_)));
    }

    #[test]
    fn test_outbound_connect_completes() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(8);
        let stream = TcpStream::connect(addr).unwrap();
        let mut conn = Connection::outbound(stream, Token(3), addr, &config());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.register(poll.registry()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.state() == ConnectionState::Connecting && Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            if events.iter().any(|e| e.token() == Token(3) && e.is_writable()) {
                conn.finish_connect().unwrap();
            }
        }
        assert_eq!(conn.state(), ConnectionState::Established);

        assert_eq!(conn.close(poll.registry()), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_drops_queue() {
        let (stream, _peer, addr) = pair();
        let poll = Poll::new().unwrap();
        let mut conn = Connection::inbound(stream, Token(1), addr, &config());
        conn.register(poll.registry()).unwrap();
        conn.enqueue(b"a").unwrap();
        conn.enqueue(b"b").unwrap();

        assert_eq!(conn.close(poll.registry()), 2);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.queued_bytes(), 0);
        assert_eq!(conn.close(poll.registry()), 0);
    }
}
