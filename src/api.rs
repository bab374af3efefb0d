//! Control protocol between `finixctl` and the supervisor.
//!
//! The wire format is a fixed-size frame in the shape of the legacy telinit
//! record: a magic sentinel, a command word, a runlevel word, a reserved
//! word, and a fixed data buffer. One request per connection; replies are
//! streamed back and terminated by an ACK or NACK frame. Enumeration sends
//! one record snapshot per frame; the per-connection outbox acts as the
//! server-side cursor.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use serde::Serialize;
use std::os::fd::AsRawFd;
use strum_macros::FromRepr;
use tracing::debug;

use crate::error::ControlError;

/// Frame sentinel.
pub const MAGIC: u32 = 0x0309_1969;

/// Size of the fixed data buffer.
pub const DATA_LEN: usize = 368;

/// Total frame size on the wire.
pub const FRAME_LEN: usize = 16 + DATA_LEN;

/// Command word of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Command {
    /// Change the runlevel to the frame's runlevel word.
    Runlevel = 1,
    /// Toggle debug logging.
    Debug = 2,
    /// Reconcile on-disk configuration.
    Reload = 3,
    /// Assert (`+cond`) or clear (`-cond`) a user condition.
    Event = 4,
    /// Start the service named in the data buffer.
    Start = 5,
    /// Stop the service named in the data buffer.
    Stop = 6,
    /// Restart the service named in the data buffer.
    Restart = 7,
    /// Report the unmet conditions of a service.
    Query = 8,
    /// Stream a snapshot frame for every record.
    Enumerate = 9,
    /// Stream the snapshot of one record.
    Find = 10,
    /// Report current and previous runlevel.
    GetRunlevel = 11,
    /// Report inetd connection statistics for a service.
    InetdQuery = 12,
    /// Watchdog process handover.
    WatchdogHello = 13,
    /// Positive reply.
    Ack = 14,
    /// Negative reply.
    Nack = 15,
}

/// One control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command (or ACK/NACK in replies).
    pub cmd: Command,
    /// Runlevel operand.
    pub runlevel: u8,
    /// Fixed-size payload, NUL-terminated text by convention.
    pub data: [u8; DATA_LEN],
}

impl Frame {
    /// An empty frame for `cmd`.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            runlevel: 0,
            data: [0; DATA_LEN],
        }
    }

    /// A frame carrying `text` in the data buffer (truncated to fit, always
    /// NUL-terminated).
    pub fn with_text(cmd: Command, text: &str) -> Self {
        let mut frame = Self::new(cmd);
        frame.set_text(text);
        frame
    }

    /// Replaces the data buffer with `text`.
    pub fn set_text(&mut self, text: &str) {
        self.data = [0; DATA_LEN];
        let bytes = text.as_bytes();
        let len = bytes.len().min(DATA_LEN - 1);
        self.data[..len].copy_from_slice(&bytes[..len]);
    }

    /// The data buffer up to the first NUL, as UTF-8.
    pub fn text(&self) -> &str {
        let end = self.data.iter().position(|b| *b == 0).unwrap_or(DATA_LEN);
        std::str::from_utf8(&self.data[..end]).unwrap_or("")
    }

    /// Serializes to wire bytes.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_ne_bytes());
        buf[4..8].copy_from_slice(&(self.cmd as u32).to_ne_bytes());
        buf[8..12].copy_from_slice(&(self.runlevel as u32).to_ne_bytes());
        // Bytes 12..16 are reserved.
        buf[16..].copy_from_slice(&self.data);
        buf
    }

    /// Deserializes from wire bytes, validating magic and command.
    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < FRAME_LEN {
            return Err(ControlError::BadFrame("short frame"));
        }
        let word = |at: usize| {
            u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        };
        if word(0) != MAGIC {
            return Err(ControlError::BadFrame("bad magic"));
        }
        let cmd =
            Command::from_repr(word(4)).ok_or(ControlError::BadFrame("unknown command"))?;
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&buf[16..FRAME_LEN]);
        Ok(Self {
            cmd,
            runlevel: word(8) as u8,
            data,
        })
    }
}

/// Record snapshot streamed by `Enumerate` and `Find`, one per frame as
/// tab-separated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Job id.
    pub job: u32,
    /// Instance id.
    pub instance: String,
    /// Registration name.
    pub name: String,
    /// State name.
    pub state: String,
    /// Process id, 0 when not running.
    pub pid: i32,
    /// Runlevel mask rendering.
    pub levels: String,
    /// Command line.
    pub command: String,
    /// Description.
    pub desc: String,
}

impl Snapshot {
    /// Renders into a frame data buffer.
    pub fn to_text(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.job,
            self.instance,
            self.name,
            self.state,
            self.pid,
            self.levels,
            self.command,
            self.desc
        )
    }

    /// Parses a frame data buffer rendered by [`Snapshot::to_text`].
    pub fn from_text(text: &str) -> Option<Self> {
        let mut fields = text.split('\t');
        Some(Self {
            job: fields.next()?.parse().ok()?,
            instance: fields.next()?.to_string(),
            name: fields.next()?.to_string(),
            state: fields.next()?.to_string(),
            pid: fields.next()?.parse().ok()?,
            levels: fields.next()?.to_string(),
            command: fields.next()?.to_string(),
            desc: fields.next().unwrap_or("").to_string(),
        })
    }
}

/// Write-side progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Reply fully flushed; the connection can be closed.
    Done,
    /// Kernel buffer full; wait for writability.
    NeedWrite,
}

struct Conn {
    stream: UnixStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    sent: usize,
}

/// Accepting side of the control socket.
pub struct ApiServer {
    listener: UnixListener,
    conns: HashMap<u64, Conn>,
}

impl ApiServer {
    /// Binds the control socket, replacing any stale one, restricted to
    /// mode 0600.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            conns: HashMap::new(),
        })
    }

    /// Listener descriptor for event-loop registration.
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts every pending connection, assigning tokens via `next_token`.
    /// Returns (token, fd) pairs for registration.
    pub fn accept(&mut self, mut next_token: impl FnMut() -> u64) -> Vec<(u64, RawFd)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let token = next_token();
                    let fd = stream.as_raw_fd();
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            inbuf: Vec::with_capacity(FRAME_LEN),
                            outbuf: Vec::new(),
                            sent: 0,
                        },
                    );
                    accepted.push((token, fd));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("control accept failed: {err}");
                    break;
                }
            }
        }
        accepted
    }

    /// Reads request bytes from a connection. `Ok(Some(frame))` once a full
    /// frame has arrived; errors mean the connection should be dropped.
    pub fn read_request(&mut self, token: u64) -> Result<Option<Frame>, ControlError> {
        let conn = self
            .conns
            .get_mut(&token)
            .ok_or(ControlError::NotAvailable)?;

        let mut chunk = [0u8; FRAME_LEN];
        loop {
            if conn.inbuf.len() >= FRAME_LEN {
                return Frame::decode(&conn.inbuf[..FRAME_LEN]).map(Some);
            }
            match conn.stream.read(&mut chunk) {
                Ok(0) => return Err(ControlError::BadFrame("short read")),
                Ok(n) => conn.inbuf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ControlError::Io(err)),
            }
        }
    }

    /// Queues reply frames on a connection's outbox.
    pub fn queue(&mut self, token: u64, frames: &[Frame]) {
        if let Some(conn) = self.conns.get_mut(&token) {
            for frame in frames {
                conn.outbuf.extend_from_slice(&frame.encode());
            }
        }
    }

    /// Writes as much of the outbox as the kernel accepts.
    pub fn flush(&mut self, token: u64) -> io::Result<ConnStatus> {
        let conn = self
            .conns
            .get_mut(&token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such connection"))?;

        while conn.sent < conn.outbuf.len() {
            match conn.stream.write(&conn.outbuf[conn.sent..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer gone"));
                }
                Ok(n) => conn.sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ConnStatus::NeedWrite);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(ConnStatus::Done)
    }

    /// Drops a connection, returning its descriptor for deregistration.
    pub fn close(&mut self, token: u64) -> Option<RawFd> {
        self.conns.remove(&token).map(|conn| conn.stream.as_raw_fd())
    }

    /// Raw descriptor of one connection.
    pub fn conn_fd(&self, token: u64) -> Option<RawFd> {
        self.conns.get(&token).map(|conn| conn.stream.as_raw_fd())
    }
}

/// Sends one request and collects the reply stream. Returns the non-ACK
/// payload frames; NACK maps to [`ControlError::Nack`] and connect failures
/// to [`ControlError::NotAvailable`].
pub fn send_request(socket: &Path, request: &Frame) -> Result<Vec<Frame>, ControlError> {
    let mut stream =
        UnixStream::connect(socket).map_err(|_| ControlError::NotAvailable)?;
    stream.write_all(&request.encode())?;

    let mut frames = Vec::new();
    let mut buf = [0u8; FRAME_LEN];
    loop {
        let mut got = 0;
        while got < FRAME_LEN {
            match stream.read(&mut buf[got..]) {
                Ok(0) if got == 0 && !frames.is_empty() => {
                    return Err(ControlError::BadFrame("missing ack"));
                }
                Ok(0) => return Err(ControlError::BadFrame("short read")),
                Ok(n) => got += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ControlError::Io(err)),
            }
        }
        let frame = Frame::decode(&buf)?;
        match frame.cmd {
            Command::Ack => return Ok(frames),
            Command::Nack => return Err(ControlError::Nack),
            _ => frames.push(frame),
        }
    }
}
