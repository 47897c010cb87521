//! TCP connection to a debug target
//!
//! Sending is bounded by a write timeout. Receiving never waits: each poll
//! pulls whatever bytes the socket already has into a [`FrameBuffer`] and
//! hands back at most one decoded message.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::common::config::Config;
use crate::common::{Error, Result};

use super::codec::{Codec, CodecError, WireMessage, DEFAULT_MAX_MESSAGE_SIZE};
use super::types::{Command, Reply};

/// Read granularity when draining the socket
const READ_CHUNK: usize = 4096;

/// Transport settings for one connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Deadline for writing one whole frame
    pub send_timeout: Duration,
    /// Largest payload accepted in either direction
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(1000),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl From<&Config> for ConnectionOptions {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.timeouts.connect_secs),
            send_timeout: Duration::from_millis(config.timeouts.send_millis),
            max_message_size: config.protocol.max_message_bytes,
        }
    }
}

/// Reassembles frames from bytes that arrive in arbitrary pieces.
///
/// Holds only bytes that have not yet been returned as part of a message.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    codec: Codec,
}

impl FrameBuffer {
    pub fn new(codec: Codec) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec,
        }
    }

    /// Append newly received bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete message, if one is buffered.
    ///
    /// On success exactly the frame's bytes are dropped from the front; any
    /// remainder is the start of the next frame. On error nothing is dropped.
    pub fn next_message<M: WireMessage>(&mut self) -> std::result::Result<Option<M>, CodecError> {
        match self.codec.decode::<M>(&self.buf)? {
            Some((msg, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Number of buffered bytes not yet consumed
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn spare(&mut self) -> &mut BytesMut {
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }
}

/// One TCP connection carrying framed messages
pub struct Connection {
    stream: TcpStream,
    codec: Codec,
    recv: FrameBuffer,
    send_timeout: Duration,
    /// The peer shut down its write side; whatever is buffered is all we get
    peer_closed: bool,
}

impl Connection {
    /// Connect to a target at `addr` (`host:port`)
    #[tracing::instrument(skip(options))]
    pub async fn connect(addr: &str, options: &ConnectionOptions) -> Result<Self> {
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::ConnectFailed {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    addr: addr.to_string(),
                    secs: options.connect_timeout.as_secs(),
                })
            }
        };

        // Messages are tiny and latency matters more than throughput
        stream.set_nodelay(true)?;
        tracing::debug!(peer = ?stream.peer_addr().ok(), "Connected to target");

        Ok(Self::from_stream(stream, options))
    }

    /// Wrap an already established stream
    pub fn from_stream(stream: TcpStream, options: &ConnectionOptions) -> Self {
        let codec = Codec::with_max_size(options.max_message_size);
        Self {
            stream,
            recv: FrameBuffer::new(codec.clone()),
            codec,
            send_timeout: options.send_timeout,
            peer_closed: false,
        }
    }

    /// Send a command, waiting until the whole frame is written
    pub async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        tracing::debug!(?cmd, "Sending command");
        self.send_message(cmd).await
    }

    /// Poll for one reply without waiting
    pub fn poll_reply(&mut self) -> Result<Option<Reply>> {
        let reply = self.poll_message::<Reply>()?;
        if let Some(reply) = &reply {
            tracing::debug!(?reply, "Received reply");
        }
        Ok(reply)
    }

    /// Encode and write one frame.
    ///
    /// Oversized messages are rejected before anything is written. A write
    /// that does not finish within the send timeout is a transport failure.
    pub async fn send_message<M: WireMessage>(&mut self, msg: &M) -> Result<()> {
        let frame = self.codec.encode(msg)?;

        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };

        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => {
                result?;
                tracing::trace!(bytes = frame.len(), "Wrote frame");
                Ok(())
            }
            Err(_) => Err(Error::SendTimeout(self.send_timeout.as_millis() as u64)),
        }
    }

    /// Return the next buffered message, reading whatever the socket has.
    ///
    /// `Ok(None)` means no complete message yet. Once the peer has closed and
    /// every complete frame has been handed out, this returns
    /// [`Error::ConnectionClosed`].
    pub fn poll_message<M: WireMessage>(&mut self) -> Result<Option<M>> {
        self.fill_from_socket()?;

        match self.recv.next_message::<M>()? {
            Some(msg) => Ok(Some(msg)),
            None if self.peer_closed => Err(Error::ConnectionClosed),
            None => Ok(None),
        }
    }

    /// Wait until the socket has data (or EOF) to read
    pub async fn readable(&self) -> Result<()> {
        if self.peer_closed {
            return Ok(());
        }
        self.stream.readable().await?;
        Ok(())
    }

    /// Best-effort orderly shutdown of the write side
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "Error shutting down connection");
        }
    }

    /// Bytes received but not yet returned as a message
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    fn fill_from_socket(&mut self) -> Result<()> {
        while !self.peer_closed {
            match self.stream.try_read_buf(self.recv.spare()) {
                Ok(0) => {
                    tracing::debug!("Target closed its end of the connection");
                    self.peer_closed = true;
                }
                Ok(n) => tracing::trace!(bytes = n, buffered = self.recv.len(), "Read from target"),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn sample_frames() -> Vec<(Reply, Vec<u8>)> {
        let codec = Codec::new();
        let mut threads = BTreeMap::new();
        threads.insert("main".to_string(), vec![1, 2]);
        threads.insert("sub".to_string(), vec![3]);
        [
            Reply::GetThreads { threads },
            Reply::BreakpointHit { tid: 1, addr: 0x100 },
            Reply::GetGlobalFlag { flag: 12, value: true },
        ]
        .into_iter()
        .map(|r| {
            let bytes = codec.encode(&r).unwrap().to_vec();
            (r, bytes)
        })
        .collect()
    }

    #[test]
    fn test_every_split_point_yields_one_reply() {
        for (reply, frame) in sample_frames() {
            for split in 0..=frame.len() {
                let mut buf = FrameBuffer::new(Codec::new());
                buf.extend_from_slice(&frame[..split]);
                if split < frame.len() {
                    assert!(buf.next_message::<Reply>().unwrap().is_none());
                }
                buf.extend_from_slice(&frame[split..]);

                assert_eq!(buf.next_message::<Reply>().unwrap(), Some(reply.clone()));
                assert!(buf.is_empty());
                assert!(buf.next_message::<Reply>().unwrap().is_none());
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        for (reply, frame) in sample_frames() {
            let mut buf = FrameBuffer::new(Codec::new());
            let mut decoded = Vec::new();
            for byte in &frame {
                buf.extend_from_slice(std::slice::from_ref(byte));
                if let Some(r) = buf.next_message::<Reply>().unwrap() {
                    decoded.push(r);
                }
            }
            assert_eq!(decoded, vec![reply]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_backlog_drains_in_order() {
        let frames = sample_frames();
        let mut buf = FrameBuffer::new(Codec::new());
        for (_, bytes) in &frames {
            buf.extend_from_slice(bytes);
        }

        for (reply, _) in &frames {
            assert_eq!(buf.next_message::<Reply>().unwrap().as_ref(), Some(reply));
        }
        assert!(buf.next_message::<Reply>().unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_remainder_is_kept_after_frame() {
        let frames = sample_frames();
        let (first, first_bytes) = &frames[0];
        let (_, second_bytes) = &frames[1];

        let mut buf = FrameBuffer::new(Codec::new());
        buf.extend_from_slice(first_bytes);
        buf.extend_from_slice(&second_bytes[..3]);

        assert_eq!(buf.next_message::<Reply>().unwrap().as_ref(), Some(first));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_error_leaves_buffer_untouched() {
        let mut buf = FrameBuffer::new(Codec::with_max_size(4));
        buf.extend_from_slice(&100u32.to_le_bytes());
        assert!(buf.next_message::<Reply>().is_err());
        assert_eq!(buf.len(), 4);
    }

    async fn connected_pair() -> (Connection, TcpStream) {
        connected_pair_with(ConnectionOptions::default()).await
    }

    async fn connected_pair_with(options: ConnectionOptions) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (conn, accepted) = tokio::join!(Connection::connect(&addr, &options), listener.accept());
        (conn.unwrap(), accepted.unwrap().0)
    }

    async fn next_reply(conn: &mut Connection) -> Result<Reply> {
        loop {
            if let Some(reply) = conn.poll_reply()? {
                return Ok(reply);
            }
            conn.readable().await?;
        }
    }

    #[tokio::test]
    async fn test_send_command_writes_one_frame() {
        let (mut conn, mut peer) = connected_pair().await;

        conn.send_command(&Command::SetBreakpoint { tid: 1, addr: 0x100 })
            .await
            .unwrap();

        let mut frame = [0u8; 10];
        peer.read_exact(&mut frame).await.unwrap();
        let (cmd, consumed) = Codec::new().decode::<Command>(&frame).unwrap().unwrap();
        assert_eq!(cmd, Command::SetBreakpoint { tid: 1, addr: 0x100 });
        assert_eq!(consumed, frame.len());
    }

    #[tokio::test]
    async fn test_poll_without_data_is_not_an_error() {
        let (mut conn, _peer) = connected_pair().await;
        assert!(conn.poll_reply().unwrap().is_none());
        assert!(conn.poll_reply().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_split_across_writes() {
        let (mut conn, mut peer) = connected_pair().await;
        let frame = Codec::new()
            .encode(&Reply::BreakpointHit { tid: 2, addr: 0x40 })
            .unwrap();

        peer.write_all(&frame[..3]).await.unwrap();
        peer.flush().await.unwrap();
        conn.readable().await.unwrap();
        assert!(conn.poll_reply().unwrap().is_none());

        peer.write_all(&frame[3..]).await.unwrap();
        peer.flush().await.unwrap();
        assert_eq!(
            next_reply(&mut conn).await.unwrap(),
            Reply::BreakpointHit { tid: 2, addr: 0x40 }
        );
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_after_backlog() {
        let (mut conn, mut peer) = connected_pair().await;
        let codec = Codec::new();
        peer.write_all(&codec.encode(&Reply::GetIp { tid: 1, ip: 1 }).unwrap())
            .await
            .unwrap();
        peer.write_all(&codec.encode(&Reply::GetIp { tid: 1, ip: 2 }).unwrap())
            .await
            .unwrap();
        drop(peer);

        assert_eq!(next_reply(&mut conn).await.unwrap(), Reply::GetIp { tid: 1, ip: 1 });
        assert_eq!(next_reply(&mut conn).await.unwrap(), Reply::GetIp { tid: 1, ip: 2 });
        assert!(matches!(next_reply(&mut conn).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (mut conn, mut peer) = connected_pair_with(ConnectionOptions {
            max_message_size: 8,
            ..Default::default()
        })
        .await;

        let mut threads = BTreeMap::new();
        threads.insert("far_too_long_for_the_limit".to_string(), vec![1]);
        let err = conn
            .send_message(&Reply::GetThreads { threads })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { max: 8, .. }));

        conn.send_command(&Command::GetThreads).await.unwrap();
        let mut frame = [0u8; 5];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [1, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        let (mut conn, _peer) = connected_pair_with(ConnectionOptions {
            send_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .await;

        // Big frames fill both socket buffers quickly while the peer never reads
        let mut threads = BTreeMap::new();
        threads.insert("x".repeat(64 * 1024), vec![1]);
        let reply = Reply::GetThreads { threads };

        let mut err = None;
        for _ in 0..10_000 {
            if let Err(e) = conn.send_message(&reply).await {
                err = Some(e);
                break;
            }
        }

        let err = err.expect("send never timed out");
        assert!(matches!(err, Error::SendTimeout(100)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Connection::connect(&addr, &ConnectionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert!(err.is_fatal());
    }
}
