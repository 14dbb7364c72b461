//! Incremental-transfer stream: donor-side senders and the joiner-side
//! receiver.
//!
//! The stream is framed (length + crc32c) and carries CBOR messages:
//! a HANDSHAKE announcing the seqno range, one WRITESET per cached
//! write-set in seqno order, and a trailing EOF. The sender owns the
//! cache's seqno lock and releases it when the stream ends.

use std::convert::Infallible;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crc32c::crc32c;
use crossbeam::channel::{Receiver, SendTimeoutError, Sender, bounded};
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Seqno, WriteSet};
use crate::repl::cache::SeqnoLockGuard;

pub(crate) const FRAME_HEADER_LEN: usize = 8;
const STREAM_FORMAT_V1: u32 = 1;
const RECV_QUEUE: usize = 128;
const ACCEPT_POLL: Duration = Duration::from_millis(25);
const READ_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    FrameCrcMismatch { expected: u32, got: u32 },
}

#[derive(Debug, Error)]
pub enum IstError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("handshake rejected: {reason}")]
    Handshake { reason: String },
    #[error("write-set out of order: expected {expected} got {got}")]
    OutOfOrder { expected: Seqno, got: Seqno },
    #[error("invalid peer address: {addr}")]
    PeerAddr { addr: String },
    #[error("stream failed: {reason}")]
    Stream { reason: String },
}

// ---------------------------------------------------------------------------
// Framing

pub(crate) struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(reader: R, max_frame_bytes: usize) -> Self {
        FrameReader {
            reader,
            max_frame_bytes,
        }
    }

    /// Read one frame. Timeouts are retried until `shutdown` is set, at
    /// which point the stream is reported as cleanly ended.
    pub(crate) fn read_next(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !self.read_full(&mut header, true, shutdown)? {
            return Ok(None);
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length];
        if !self.read_full(&mut body, false, shutdown)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame body truncated").into());
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        Ok(Some(body))
    }

    fn read_full(
        &mut self,
        buf: &mut [u8],
        eof_ok_at_start: bool,
        shutdown: &AtomicBool,
    ) -> Result<bool, FrameError> {
        let mut read = 0usize;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => {
                    if read == 0 && eof_ok_at_start {
                        return Ok(false);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "frame truncated",
                    )
                    .into());
                }
                Ok(n) => read += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if shutdown.load(Ordering::Relaxed) {
                        if read == 0 && eof_ok_at_start {
                            return Ok(false);
                        }
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "shutdown during frame read",
                        )
                        .into());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

pub(crate) struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub(crate) fn new(writer: W, max_frame_bytes: usize) -> Self {
        FrameWriter {
            writer,
            max_frame_bytes,
        }
    }

    pub(crate) fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: payload.len(),
            });
        }
        let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
            reason: "frame length exceeds u32".to_string(),
        })?;
        let crc = crc32c(payload);

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(payload);
        self.writer.write_all(&buf)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Messages

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum IstMessage {
    Handshake {
        proto_ver: u8,
        first: Seqno,
        last: Seqno,
        requestor: String,
    },
    WriteSet(WriteSet),
    Eof {
        last: Seqno,
    },
}

impl IstMessage {
    fn type_str(&self) -> &'static str {
        match self {
            IstMessage::Handshake { .. } => "HANDSHAKE",
            IstMessage::WriteSet(_) => "WRITESET",
            IstMessage::Eof { .. } => "EOF",
        }
    }
}

pub(crate) fn encode_message(msg: &IstMessage) -> Result<Vec<u8>, IstError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(STREAM_FORMAT_V1)?;
    enc.str("type")?;
    enc.str(msg.type_str())?;
    enc.str("body")?;
    match msg {
        IstMessage::Handshake {
            proto_ver,
            first,
            last,
            requestor,
        } => {
            enc.map(4)?;
            enc.str("proto")?;
            enc.u8(*proto_ver)?;
            enc.str("first")?;
            enc.i64(first.get())?;
            enc.str("last")?;
            enc.i64(last.get())?;
            enc.str("requestor")?;
            enc.str(requestor)?;
        }
        IstMessage::WriteSet(ws) => {
            enc.map(5)?;
            enc.str("source")?;
            enc.bytes(ws.source_id.as_bytes())?;
            enc.str("seqno")?;
            enc.i64(ws.seqno.get())?;
            enc.str("depends")?;
            enc.i64(ws.depends_seqno.get())?;
            enc.str("checksum")?;
            enc.u32(ws.checksum)?;
            enc.str("payload")?;
            enc.bytes(&ws.payload)?;
        }
        IstMessage::Eof { last } => {
            enc.map(1)?;
            enc.str("last")?;
            enc.i64(last.get())?;
        }
    }
    Ok(buf)
}

pub(crate) fn decode_message(bytes: &[u8]) -> Result<IstMessage, IstError> {
    let mut dec = Decoder::new(bytes);
    let map_len = dec.map()?.ok_or(IstError::InvalidField {
        field: "envelope",
        reason: "indefinite-length map".to_string(),
    })?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        match dec.str()? {
            "v" => version = Some(dec.u32()?),
            "type" => message_type = Some(dec.str()?.to_string()),
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(IstError::TrailingBytes);
    }

    let version = version.ok_or(IstError::MissingField("v"))?;
    if version != STREAM_FORMAT_V1 {
        return Err(IstError::InvalidField {
            field: "v",
            reason: format!("unsupported stream format {version}"),
        });
    }
    let message_type = message_type.ok_or(IstError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(IstError::MissingField("body"))?;
    let mut body = Decoder::new(&bytes[start..end]);

    match message_type.as_str() {
        "HANDSHAKE" => decode_handshake(&mut body),
        "WRITESET" => decode_writeset(&mut body),
        "EOF" => decode_eof(&mut body),
        other => Err(IstError::UnknownMessageType(other.to_string())),
    }
}

fn decode_map(dec: &mut Decoder<'_>) -> Result<u64, IstError> {
    dec.map()?.ok_or(IstError::InvalidField {
        field: "body",
        reason: "indefinite-length map".to_string(),
    })
}

fn decode_handshake(dec: &mut Decoder<'_>) -> Result<IstMessage, IstError> {
    let mut proto_ver = None;
    let mut first = None;
    let mut last = None;
    let mut requestor = None;
    for _ in 0..decode_map(dec)? {
        match dec.str()? {
            "proto" => proto_ver = Some(dec.u8()?),
            "first" => first = Some(Seqno::new(dec.i64()?)),
            "last" => last = Some(Seqno::new(dec.i64()?)),
            "requestor" => requestor = Some(dec.str()?.to_string()),
            _ => dec.skip()?,
        }
    }
    Ok(IstMessage::Handshake {
        proto_ver: proto_ver.ok_or(IstError::MissingField("proto"))?,
        first: first.ok_or(IstError::MissingField("first"))?,
        last: last.ok_or(IstError::MissingField("last"))?,
        requestor: requestor.ok_or(IstError::MissingField("requestor"))?,
    })
}

fn decode_writeset(dec: &mut Decoder<'_>) -> Result<IstMessage, IstError> {
    let mut source = None;
    let mut seqno = None;
    let mut depends = None;
    let mut checksum = None;
    let mut payload = None;
    for _ in 0..decode_map(dec)? {
        match dec.str()? {
            "source" => {
                let raw = dec.bytes()?;
                let id = Uuid::from_slice(raw).map_err(|err| IstError::InvalidField {
                    field: "source",
                    reason: err.to_string(),
                })?;
                source = Some(id);
            }
            "seqno" => seqno = Some(Seqno::new(dec.i64()?)),
            "depends" => depends = Some(Seqno::new(dec.i64()?)),
            "checksum" => checksum = Some(dec.u32()?),
            "payload" => payload = Some(Bytes::copy_from_slice(dec.bytes()?)),
            _ => dec.skip()?,
        }
    }
    Ok(IstMessage::WriteSet(WriteSet {
        source_id: source.ok_or(IstError::MissingField("source"))?,
        seqno: seqno.ok_or(IstError::MissingField("seqno"))?,
        depends_seqno: depends.ok_or(IstError::MissingField("depends"))?,
        checksum: checksum.ok_or(IstError::MissingField("checksum"))?,
        payload: payload.ok_or(IstError::MissingField("payload"))?,
    }))
}

fn decode_eof(dec: &mut Decoder<'_>) -> Result<IstMessage, IstError> {
    let mut last = None;
    for _ in 0..decode_map(dec)? {
        match dec.str()? {
            "last" => last = Some(Seqno::new(dec.i64()?)),
            _ => dec.skip()?,
        }
    }
    Ok(IstMessage::Eof {
        last: last.ok_or(IstError::MissingField("last"))?,
    })
}

// ---------------------------------------------------------------------------
// Receiver

#[derive(Debug)]
pub(crate) enum IstEvent {
    WriteSet(WriteSet),
    Eof { last: Seqno },
    Failed(String),
}

/// Joiner-side listener for the incremental-transfer stream.
pub struct IstReceiver {
    listen_addr: SocketAddr,
    first: Seqno,
    shutdown: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    events: Receiver<IstEvent>,
    last_received: Arc<AtomicI64>,
    thread: Option<JoinHandle<()>>,
}

impl IstReceiver {
    /// Bind the listener and start the accept thread. Returns the receiver
    /// and the address the donor should connect to.
    pub fn prepare(
        bind_addr: &str,
        first: Seqno,
        last: Seqno,
        proto_ver: u8,
        max_frame_bytes: usize,
    ) -> Result<(IstReceiver, String), IstError> {
        let listener = TcpListener::bind(bind_addr)?;
        let listen_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));
        let last_received = Arc::new(AtomicI64::new(Seqno::UNDEFINED.get()));
        let (tx, rx) = bounded(RECV_QUEUE);

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            let last_received = Arc::clone(&last_received);
            thread::spawn(move || {
                run_listener(
                    listener,
                    shutdown,
                    tx,
                    first,
                    last,
                    proto_ver,
                    max_frame_bytes,
                    last_received,
                );
            })
        };

        let addr = format!("tcp://{listen_addr}");
        Ok((
            IstReceiver {
                listen_addr,
                first,
                shutdown,
                ready,
                events: rx,
                last_received,
                thread: Some(thread),
            },
            addr,
        ))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn first(&self) -> Seqno {
        self.first
    }

    /// Mark the consumer ready to pull write-sets.
    pub fn ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Blocking pull of the next write-set. `Ok(None)` signals a cleanly
    /// ended stream.
    pub fn recv(&self) -> Result<Option<WriteSet>, IstError> {
        debug_assert!(self.ready.load(Ordering::Acquire), "recv before ready");
        match self.events.recv() {
            Ok(IstEvent::WriteSet(ws)) => Ok(Some(ws)),
            Ok(IstEvent::Eof { .. }) => Ok(None),
            Ok(IstEvent::Failed(reason)) => Err(IstError::Stream { reason }),
            Err(_) => Ok(None),
        }
    }

    /// Shut the listener down and report the last contiguously received
    /// seqno (`UNDEFINED` when nothing arrived).
    pub fn finished(mut self) -> Seqno {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Seqno::new(self.last_received.load(Ordering::Acquire))
    }
}

impl Drop for IstReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_listener(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    tx: Sender<IstEvent>,
    first: Seqno,
    last: Seqno,
    proto_ver: u8,
    max_frame_bytes: usize,
    last_received: Arc<AtomicI64>,
) {
    let stream = loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("incremental transfer accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    };

    if let Err(err) = receive_stream(
        stream,
        &shutdown,
        &tx,
        first,
        last,
        proto_ver,
        max_frame_bytes,
        &last_received,
    ) {
        tracing::warn!("incremental transfer stream error: {err}");
        send_event(&tx, &shutdown, IstEvent::Failed(err.to_string()));
    }
}

/// Forward an event to the consumer, yielding to shutdown so a stalled
/// consumer can never wedge the listener thread. Returns false when the
/// stream should stop.
fn send_event(tx: &Sender<IstEvent>, shutdown: &AtomicBool, event: IstEvent) -> bool {
    let mut event = event;
    loop {
        match tx.send_timeout(event, READ_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if shutdown.load(Ordering::Relaxed) {
                    return false;
                }
                event = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_stream(
    stream: TcpStream,
    shutdown: &AtomicBool,
    tx: &Sender<IstEvent>,
    first: Seqno,
    last: Seqno,
    proto_ver: u8,
    max_frame_bytes: usize,
    last_received: &AtomicI64,
) -> Result<(), IstError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut reader = FrameReader::new(stream, max_frame_bytes);

    let Some(bytes) = reader.read_next(shutdown)? else {
        return Ok(());
    };
    match decode_message(&bytes)? {
        IstMessage::Handshake {
            proto_ver: got_ver,
            first: got_first,
            last: got_last,
            requestor,
        } => {
            if got_ver != proto_ver {
                return Err(IstError::Handshake {
                    reason: format!("protocol version {got_ver}, expected {proto_ver}"),
                });
            }
            if got_first != first {
                return Err(IstError::Handshake {
                    reason: format!("first seqno {got_first}, expected {first}"),
                });
            }
            // The stream may extend past the requested range when view
            // changes were delivered between request emission and service.
            if got_last < last {
                return Err(IstError::Handshake {
                    reason: format!("last seqno {got_last} short of requested {last}"),
                });
            }
            tracing::debug!(
                "incremental transfer stream from {requestor}: seqnos {got_first}-{got_last}"
            );
        }
        other => {
            return Err(IstError::Handshake {
                reason: format!("expected HANDSHAKE, got {}", other.type_str()),
            });
        }
    }

    let mut expected = first;
    loop {
        let Some(bytes) = reader.read_next(shutdown)? else {
            return Err(IstError::Stream {
                reason: "connection closed before EOF".to_string(),
            });
        };
        match decode_message(&bytes)? {
            IstMessage::WriteSet(ws) => {
                if ws.seqno != expected {
                    return Err(IstError::OutOfOrder {
                        expected,
                        got: ws.seqno,
                    });
                }
                expected = expected.next();
                last_received.store(ws.seqno.get(), Ordering::Release);
                if !send_event(tx, shutdown, IstEvent::WriteSet(ws)) {
                    // Consumer went away; the joiner gave up on this stream.
                    return Ok(());
                }
            }
            IstMessage::Eof { last } => {
                send_event(tx, shutdown, IstEvent::Eof { last });
                return Ok(());
            }
            IstMessage::Handshake { .. } => {
                return Err(IstError::Stream {
                    reason: "unexpected second handshake".to_string(),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sender pool

/// Donor-side pool of asynchronous incremental-transfer senders.
#[derive(Debug, Default)]
pub struct IstSenderPool {
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl IstSenderPool {
    pub fn new() -> Self {
        IstSenderPool::default()
    }

    /// Connect to the joiner and start streaming `first..=last` from the
    /// cache pinned by `guard`. Ownership of the seqno lock moves into the
    /// sender thread, which releases it at end-of-stream; on a setup error
    /// the lock is released before this call returns.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        peer: &str,
        first: Seqno,
        last: Seqno,
        proto_ver: u8,
        requestor: &str,
        guard: SeqnoLockGuard,
        max_frame_bytes: usize,
    ) -> Result<(), IstError> {
        let addr = strip_scheme(peer).ok_or_else(|| IstError::PeerAddr {
            addr: peer.to_string(),
        })?;
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let mut writer = FrameWriter::new(stream, max_frame_bytes);
        let handshake = IstMessage::Handshake {
            proto_ver,
            first,
            last,
            requestor: requestor.to_string(),
        };
        writer.write_frame(&encode_message(&handshake)?)?;

        let peer = peer.to_string();
        let handle = thread::spawn(move || {
            send_stream(writer, first, last, guard, &peer);
        });
        self.handles
            .lock()
            .expect("sender pool lock poisoned")
            .push(handle);
        Ok(())
    }

    /// Wait for every launched sender to finish.
    pub fn join_all(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("sender pool lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn send_stream(
    mut writer: FrameWriter<TcpStream>,
    first: Seqno,
    last: Seqno,
    guard: SeqnoLockGuard,
    peer: &str,
) {
    let cache = Arc::clone(guard.cache());
    let mut sent = Seqno::UNDEFINED;

    let mut seqno = first;
    while seqno <= last {
        let Some(ws) = cache.get(seqno) else {
            tracing::error!("incremental transfer to {peer}: seqno {seqno} missing from cache");
            break;
        };
        let frame = match encode_message(&IstMessage::WriteSet(ws)) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("incremental transfer to {peer}: encode failed: {err}");
                break;
            }
        };
        if let Err(err) = writer.write_frame(&frame) {
            tracing::warn!("incremental transfer to {peer} interrupted at {seqno}: {err}");
            break;
        }
        sent = seqno;
        seqno = seqno.next();
    }

    if sent == last {
        match encode_message(&IstMessage::Eof { last: sent })
            .map_err(IstError::from)
            .and_then(|frame| writer.write_frame(&frame).map_err(IstError::from))
        {
            Ok(()) => {
                tracing::info!("incremental transfer to {peer} finished: seqnos {first}-{last}")
            }
            Err(err) => tracing::warn!("incremental transfer to {peer}: eof failed: {err}"),
        }
    }

    // Lock duty ends with the stream.
    guard.release();
}

fn strip_scheme(peer: &str) -> Option<&str> {
    let addr = peer.strip_prefix("tcp://").unwrap_or(peer);
    if addr.is_empty() { None } else { Some(addr) }
}
