use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::SinkExt;
use serde::de::DeserializeOwned;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::NetworkError;
use crate::messaging::{Frame, HEADER_SIZE};
use crate::types::EntityId;

pub struct FrameCodec {
    max_message_size: u32,
}

impl FrameCodec {
    pub fn new(max_message_size: u32) -> Self {
        Self { max_message_size }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = u32::try_from(item.payload.len())
            .map_err(|_| NetworkError::MessageTooLarge(u32::MAX))?;
        if length > self.max_message_size {
            return Err(NetworkError::MessageTooLarge(length));
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32(item.msg_type);
        dst.put_u32(item.sender.get());
        dst.put_u32(length);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Progress of `FrameReader` through the current frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadStatus {
    Unstarted,
    HeaderInProgress,
    HeaderDone,
    BodyInProgress,
    BodyDone,
    Closed,
}

/// Incremental frame reader over a non-blocking byte source.
///
/// Each call to `pump_read` issues at most one read for the header and
/// one for the body, so a short read or a `WouldBlock` simply leaves the
/// reader in an intermediate state until the next call.
pub struct FrameReader {
    status: ReadStatus,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    body: BytesMut,
    body_filled: usize,
    msg_type: u32,
    sender: EntityId,
    completed: Option<Frame>,
    max_message_size: u32,
}

impl FrameReader {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            status: ReadStatus::Unstarted,
            header: [0; HEADER_SIZE],
            header_filled: 0,
            body: BytesMut::new(),
            body_filled: 0,
            msg_type: 0,
            sender: EntityId::default(),
            completed: None,
            max_message_size,
        }
    }

    pub fn status(&self) -> ReadStatus {
        self.status
    }

    pub fn pump_read<R: io::Read>(&mut self, src: &mut R) -> ReadStatus {
        match self.status {
            ReadStatus::Closed => return ReadStatus::Closed,
            ReadStatus::Unstarted | ReadStatus::BodyDone => self.begin_frame(),
            _ => {}
        }

        if self.status == ReadStatus::HeaderInProgress {
            match read_once(src, &mut self.header[self.header_filled..]) {
                ReadOutcome::Data(n) => {
                    self.header_filled += n;
                    if self.header_filled == HEADER_SIZE {
                        self.finish_header();
                    }
                }
                ReadOutcome::Pending => return self.status,
                ReadOutcome::Closed => return self.close(),
            }
        }

        if matches!(
            self.status,
            ReadStatus::HeaderDone | ReadStatus::BodyInProgress
        ) {
            if self.body_filled < self.body.len() {
                match read_once(src, &mut self.body[self.body_filled..]) {
                    ReadOutcome::Data(n) => self.body_filled += n,
                    ReadOutcome::Pending => return self.status,
                    ReadOutcome::Closed => return self.close(),
                }
            }
            if self.body_filled == self.body.len() {
                self.finish_body();
            } else {
                self.status = ReadStatus::BodyInProgress;
            }
        }

        self.status
    }

    /// The frame read by the last completed cycle. Does not consume it.
    pub fn frame(&self) -> Result<&Frame, NetworkError> {
        match (&self.status, &self.completed) {
            (ReadStatus::BodyDone, Some(frame)) => Ok(frame),
            _ => Err(NetworkError::FrameNotReady),
        }
    }

    pub fn decoded_payload<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        self.frame()?.decode()
    }

    fn begin_frame(&mut self) {
        self.status = ReadStatus::HeaderInProgress;
        self.header_filled = 0;
        self.body_filled = 0;
        self.completed = None;
    }

    fn finish_header(&mut self) {
        let word = |i: usize| {
            u32::from_be_bytes([
                self.header[i],
                self.header[i + 1],
                self.header[i + 2],
                self.header[i + 3],
            ])
        };
        let msg_type = word(0);
        let sender = word(4);
        let size = word(8);

        if size > self.max_message_size {
            tracing::warn!(size, max = self.max_message_size, "frame too large, closing");
            self.close();
            return;
        }

        self.msg_type = msg_type;
        self.sender = EntityId::new(sender);
        self.body = BytesMut::zeroed(size as usize);
        self.status = ReadStatus::HeaderDone;
    }

    fn finish_body(&mut self) {
        let payload: Bytes = std::mem::take(&mut self.body).freeze();
        self.completed = Some(Frame {
            msg_type: self.msg_type,
            sender: self.sender,
            payload,
        });
        self.status = ReadStatus::BodyDone;
    }

    fn close(&mut self) -> ReadStatus {
        self.status = ReadStatus::Closed;
        self.completed = None;
        self.status
    }
}

enum ReadOutcome {
    Data(usize),
    Pending,
    Closed,
}

fn read_once<R: io::Read>(src: &mut R, buf: &mut [u8]) -> ReadOutcome {
    match src.read(buf) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            ReadOutcome::Pending
        }
        Err(e) => {
            tracing::debug!(error = %e, "read error");
            ReadOutcome::Closed
        }
    }
}

/// `io::Read` view over a tokio `try_read` function.
struct TryRead<F>(F);

impl<F> io::Read for TryRead<F>
where
    F: FnMut(&mut [u8]) -> io::Result<usize>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (self.0)(buf)
    }
}

async fn read_next_frame(
    read_half: &OwnedReadHalf,
    reader: &mut FrameReader,
) -> Result<Frame, NetworkError> {
    loop {
        match reader.pump_read(&mut TryRead(|buf: &mut [u8]| read_half.try_read(buf))) {
            ReadStatus::BodyDone => return reader.frame().cloned(),
            ReadStatus::Closed => return Err(NetworkError::ConnectionClosed),
            _ => read_half.readable().await?,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum Inbound {
    Frame { conn: ConnId, frame: Frame },
    Closed { conn: ConnId },
}

/// Handle to a running connection. Cloning it shares the same send queue.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnId,
    peer_addr: SocketAddr,
    send_tx: mpsc::Sender<Frame>,
    cancel_token: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send(&self, frame: Frame) -> Result<(), NetworkError> {
        self.send_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                NetworkError::ConnectionFailed("send channel closed".into())
            }
        })
    }

    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// A connection backed by a bare channel, for exercising routing logic
    /// without sockets.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let conn = Self {
            id: ConnId::next(),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            send_tx,
            cancel_token: CancellationToken::new(),
        };
        (conn, send_rx)
    }
}

/// A connected socket whose handshake has not completed yet. Frames are
/// read and written inline until `start` hands the socket to its tasks.
pub struct PendingConnection {
    read_half: OwnedReadHalf,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    reader: FrameReader,
    peer_addr: SocketAddr,
}

impl PendingConnection {
    pub fn new(stream: TcpStream, max_message_size: u32) -> Result<Self, NetworkError> {
        configure_stream(&stream)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            read_half,
            writer: FramedWrite::new(write_half, FrameCodec::new(max_message_size)),
            reader: FrameReader::new(max_message_size),
            peer_addr,
        })
    }

    pub async fn connect(addr: &str, max_message_size: u32) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("TCP connect to {addr} failed: {e}")))?;
        Self::new(stream, max_message_size)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), NetworkError> {
        self.writer.send(frame).await
    }

    pub async fn next_frame(&mut self) -> Result<Frame, NetworkError> {
        read_next_frame(&self.read_half, &mut self.reader).await
    }

    /// Spawn the reader and writer tasks. Frames read from the socket are
    /// forwarded in arrival order to `inbound_tx`, followed by a single
    /// `Inbound::Closed` once the connection ends.
    pub fn start(
        self,
        inbound_tx: mpsc::Sender<Inbound>,
        send_queue_capacity: usize,
        parent_token: &CancellationToken,
    ) -> Connection {
        let Self {
            read_half,
            mut writer,
            mut reader,
            peer_addr,
        } = self;

        let id = ConnId::next();
        let (send_tx, mut send_rx) = mpsc::channel::<Frame>(send_queue_capacity);
        let cancel_token = parent_token.child_token();

        let write_cancel = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    msg = send_rx.recv() => {
                        match msg {
                            Some(frame) => {
                                if let Err(e) = writer.send(frame).await {
                                    tracing::warn!(conn = %id, error = %e, "write task send error");
                                    write_cancel.cancel();
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let read_cancel = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    frame = read_next_frame(&read_half, &mut reader) => {
                        match frame {
                            Ok(frame) => {
                                if inbound_tx.send(Inbound::Frame { conn: id, frame }).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(conn = %id, %peer_addr, error = %e, "connection closed");
                                break;
                            }
                        }
                    }
                }
            }
            read_cancel.cancel();
            let _ = inbound_tx.send(Inbound::Closed { conn: id }).await;
        });

        Connection {
            id,
            peer_addr,
            send_tx,
            cancel_token,
        }
    }
}

fn configure_stream(stream: &TcpStream) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));

    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);

    sock.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

/// Bind a listening socket on all interfaces with `SO_REUSEADDR` set.
pub fn bind_listener(port: u16) -> Result<TcpListener, NetworkError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let bind_err = |source: io::Error| NetworkError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}
