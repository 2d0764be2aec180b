//! Tape Server Handler
//!
//! Line protocol over TCP used by a tape-drive emulator to reach the volume
//! mounted on its drive. One connection drives one drive; replies are
//! `<code> <text>\n`, READ replies carry the record bytes right after the line.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::library::{parse_drive_key, DriveClient, SharedLibrary};
use super::tape::{LocateOutcome, TapeError, TapeEvent, VirtualTape, MAX_RECORD_LENGTH};
use crate::error::Result;

/// Longest request line accepted, newline included.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Longest client word echoed back in a `400` reply.
const MAX_ECHO_LENGTH: usize = 32;

/// A reply line. Codes 1xx are unsolicited notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    MountedReadOnly { vsn: String, drive_key: String },
    MountedWriteEnabled { vsn: String, drive_key: String },
    DismountNotice { vsn: String, drive_key: String },
    Ok(String),
    TapeMark,
    BeginningOfMedium,
    BadRequest(String),
    AlreadyRegistered(String),
    NotMounted { status: u32, vsn: String },
    NotDismounted { status: u32, vsn: String },
    NotReady(String),
    IoError(String),
    LengthMismatch(String),
    ReadOnly(String),
    LocateFailed(String),
    EndOfMedium,
}

impl Reply {
    pub fn code(&self) -> u16 {
        match self {
            Reply::MountedReadOnly { .. } => 101,
            Reply::MountedWriteEnabled { .. } => 102,
            Reply::DismountNotice { .. } => 103,
            Reply::Ok(_) => 200,
            Reply::TapeMark => 202,
            Reply::BeginningOfMedium => 203,
            Reply::BadRequest(_) => 400,
            Reply::AlreadyRegistered(_) => 401,
            Reply::NotMounted { .. } | Reply::NotDismounted { .. } => 402,
            Reply::NotReady(_) => 403,
            Reply::IoError(_) => 404,
            Reply::LengthMismatch(_) => 501,
            Reply::ReadOnly(_) => 502,
            Reply::LocateFailed(_) => 504,
            Reply::EndOfMedium => 505,
        }
    }

    pub fn to_line(&self) -> String {
        format!("{} {}\n", self.code(), self)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::MountedReadOnly { vsn, drive_key } => {
                write!(f, "{} mounted on {} read-only", vsn, drive_key)
            }
            Reply::MountedWriteEnabled { vsn, drive_key } => {
                write!(f, "{} mounted on {} write-enabled", vsn, drive_key)
            }
            Reply::DismountNotice { vsn, drive_key } => {
                write!(f, "{} dismounted from {}", vsn, drive_key)
            }
            Reply::Ok(text)
            | Reply::BadRequest(text)
            | Reply::NotReady(text)
            | Reply::IoError(text)
            | Reply::LengthMismatch(text)
            | Reply::LocateFailed(text) => f.write_str(text),
            Reply::TapeMark => f.write_str("tape mark"),
            Reply::BeginningOfMedium => f.write_str("beginning of medium"),
            Reply::EndOfMedium => f.write_str("end of medium"),
            Reply::AlreadyRegistered(key) => write!(f, "{} already registered", key),
            Reply::NotMounted { status, vsn } => write!(f, "{} {} not mounted", status, vsn),
            Reply::NotDismounted { status, vsn } => write!(f, "{} {} not dismounted", status, vsn),
            Reply::ReadOnly(vsn) => write!(f, "{} is read-only", vsn),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeCommand {
    Register(String),
    Mount(String),
    Dismount(String),
    ReadForward,
    SpaceForward,
    ReadBackward,
    SpaceBackward,
    LocateBlock(u32),
    ReadBlockId,
    Rewind,
    Write(usize),
    WriteMark,
    Quit,
}

impl TapeCommand {
    /// Parse one request line. The error is the text of a `400` reply.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut words = line.split_whitespace();
        let word = words.next().ok_or_else(|| "empty command".to_string())?;
        let verb = echo(word);
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments to {}", verb));
        }

        let required = |name: &str| -> std::result::Result<String, String> {
            arg.map(str::to_string)
                .ok_or_else(|| format!("{} requires {}", verb, name))
        };
        let no_argument = |command: TapeCommand| match arg {
            Some(_) => Err(format!("{} takes no argument", verb)),
            None => Ok(command),
        };

        match word.to_ascii_uppercase().as_str() {
            "REGISTER" => Ok(TapeCommand::Register(required("a drive key")?)),
            "MOUNT" => Ok(TapeCommand::Mount(required("a VSN")?)),
            "DISMOUNT" => Ok(TapeCommand::Dismount(required("a VSN")?)),
            "READFWD" => no_argument(TapeCommand::ReadForward),
            "SPACEFWD" => no_argument(TapeCommand::SpaceForward),
            "READBKW" => no_argument(TapeCommand::ReadBackward),
            "SPACEBKW" => no_argument(TapeCommand::SpaceBackward),
            "LOCATEBLOCK" => required("a block number")?
                .parse()
                .map(TapeCommand::LocateBlock)
                .map_err(|_| format!("invalid block number {}", echo(arg.unwrap_or_default()))),
            "READBLOCKID" => no_argument(TapeCommand::ReadBlockId),
            "REWIND" => no_argument(TapeCommand::Rewind),
            "WRITE" => {
                let length: usize = required("a length")?
                    .parse()
                    .map_err(|_| format!("invalid length {}", echo(arg.unwrap_or_default())))?;
                if length == 0 || length > MAX_RECORD_LENGTH {
                    return Err(format!("record length {} out of range", length));
                }
                Ok(TapeCommand::Write(length))
            }
            "WRITEMARK" => no_argument(TapeCommand::WriteMark),
            "QUIT" => no_argument(TapeCommand::Quit),
            _ => Err(format!("unrecognized command {}", verb)),
        }
    }
}

/// A client word shortened for use in a reply.
fn echo(word: &str) -> String {
    match word.char_indices().nth(MAX_ECHO_LENGTH) {
        Some((end, _)) => format!("{}...", &word[..end]),
        None => word.to_string(),
    }
}

/// Skip input up to and including the next newline. False at end of stream.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        let (used, found) = match buf.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (buf.len(), false),
        };
        reader.consume(used);
        if found {
            return Ok(true);
        }
    }
}

pub struct TapeServer {
    listener: TcpListener,
    library: SharedLibrary,
    next_client_id: AtomicU64,
}

impl TapeServer {
    pub async fn bind(addr: SocketAddr, library: SharedLibrary) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Tape server listening on TCP {}", listener.local_addr()?);
        Ok(Self {
            listener,
            library,
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            let library = Arc::clone(&self.library);
            info!("Tape client {} connected from {}", id, peer);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, id, library).await {
                    warn!("Tape client {} ({}): {}", id, peer, e);
                }
                info!("Tape client {} disconnected", id);
            });
        }
    }
}

async fn serve_connection(stream: TcpStream, id: u64, library: SharedLibrary) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut connection = Connection {
        client: DriveClient::new(id, tx),
        library,
        drive_key: None,
    };
    let outcome = connection.process(BufReader::new(read_half)).await;
    connection.release();
    drop(connection);

    let _ = writer.await;
    outcome
}

/// Per-connection state: the outbound channel and the drive it is bound to.
struct Connection {
    client: DriveClient,
    library: SharedLibrary,
    drive_key: Option<String>,
}

impl Connection {
    async fn process<R>(&mut self, mut reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            let limit = MAX_LINE_LENGTH as u64;
            if (&mut reader).take(limit).read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }
            if line.len() == MAX_LINE_LENGTH && line.last() != Some(&b'\n') {
                warn!("Tape client {}: request line too long", self.client.id);
                self.client.send(&Reply::BadRequest(format!(
                    "request line exceeds {} bytes",
                    MAX_LINE_LENGTH
                )));
                if !skip_line(&mut reader).await? {
                    return Ok(());
                }
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            debug!("Tape client {}: {}", self.client.id, text);

            let command = match TapeCommand::parse(text) {
                Ok(command) => command,
                Err(reason) => {
                    self.client.send(&Reply::BadRequest(reason));
                    continue;
                }
            };

            match command {
                TapeCommand::Write(length) => {
                    let mut payload = vec![0u8; length];
                    reader.read_exact(&mut payload).await?;
                    self.write(&payload);
                }
                TapeCommand::Quit => {
                    self.client.send(&Reply::Ok("goodbye".to_string()));
                    return Ok(());
                }
                other => self.execute(other),
            }
        }
    }

    fn execute(&mut self, command: TapeCommand) {
        match command {
            TapeCommand::Register(key) => self.register(key),
            TapeCommand::Mount(vsn) => self.mount(&vsn),
            TapeCommand::Dismount(vsn) => self.dismount(&vsn),
            TapeCommand::ReadForward => self.step(true, true),
            TapeCommand::SpaceForward => self.step(true, false),
            TapeCommand::ReadBackward => self.step(false, true),
            TapeCommand::SpaceBackward => self.step(false, false),
            TapeCommand::LocateBlock(block) => self.with_tape(|_, tape| match tape.locate(block)? {
                LocateOutcome::Located => Ok(Reply::Ok(block.to_string())),
                LocateOutcome::BoundaryReached => Ok(Reply::LocateFailed(format!(
                    "block {} not found, stopped at block {}",
                    block,
                    tape.block_id()
                ))),
            }),
            TapeCommand::ReadBlockId => self.with_tape(|_, tape| {
                Ok(Reply::Ok(format!("{:08X}", tape.block_id_reference()?)))
            }),
            TapeCommand::Rewind => self.with_tape(|_, tape| {
                tape.rewind();
                Ok(Reply::Ok("rewound".to_string()))
            }),
            TapeCommand::WriteMark => self.with_tape(|_, tape| {
                tape.write_mark()?;
                Ok(Reply::Ok("tape mark written".to_string()))
            }),
            TapeCommand::Write(_) | TapeCommand::Quit => {}
        }
    }

    fn register(&mut self, key: String) {
        if parse_drive_key(&key).is_none() {
            self.client.send(&Reply::BadRequest(format!("invalid drive key {}", key)));
            return;
        }
        if let Some(current) = &self.drive_key {
            if *current != key {
                self.client.send(&Reply::BadRequest(format!("already registered as {}", current)));
                return;
            }
        }

        let mut library = self.library.lock();
        if !library.register_client(&key, self.client.clone()) {
            self.client.send(&Reply::AlreadyRegistered(key));
            return;
        }
        info!("Tape client {} registered drive {}", self.client.id, key);
        self.client.send(&Reply::Ok(format!("{} registered", key)));
        if let Some(info) = library.mount_info(&key) {
            self.client.send(&info.notification());
        }
        self.drive_key = Some(key);
    }

    fn mount(&mut self, vsn: &str) {
        let Some(key) = self.registered_drive() else { return };
        let reply = match self.library.lock().mount(vsn, &key, false) {
            Ok(info) => Reply::Ok(info.notification().to_string()),
            Err(status) => Reply::NotMounted {
                status: status.code(),
                vsn: vsn.to_string(),
            },
        };
        self.client.send(&reply);
    }

    fn dismount(&mut self, vsn: &str) {
        let Some(key) = self.registered_drive() else { return };
        let reply = match self.library.lock().dismount(vsn, &key, false, false) {
            Ok(dismounted) => Reply::Ok(format!("{} dismounted from {}", dismounted, key)),
            Err(status) => Reply::NotDismounted {
                status: status.code(),
                vsn: vsn.to_string(),
            },
        };
        self.client.send(&reply);
    }

    fn write(&mut self, payload: &[u8]) {
        self.with_tape(|_, tape| {
            tape.write_record(payload)?;
            Ok(Reply::Ok(payload.len().to_string()))
        });
    }

    /// One block forward or backward; reads send the record bytes after the line.
    fn step(&mut self, forward: bool, read_data: bool) {
        let Some(key) = self.registered_drive() else { return };
        let mut library = self.library.lock();
        let Some((vsn, tape)) = library.loaded_tape(&key) else {
            self.client.send(&Reply::NotReady(format!("no volume mounted on {}", key)));
            return;
        };

        let event = if forward {
            tape.advance(read_data)
        } else {
            tape.retreat(read_data)
        };
        match event {
            Ok(TapeEvent::Record { length, data }) => {
                let mut bytes = Reply::Ok(length.to_string()).to_line().into_bytes();
                if let Some(data) = data {
                    bytes.extend_from_slice(&data);
                }
                self.client.send_bytes(bytes);
            }
            Ok(TapeEvent::ErrorRecord { length }) => {
                self.client.send(&Reply::IoError(format!("error record of {} bytes", length)))
            }
            Ok(TapeEvent::TapeMark) => self.client.send(&Reply::TapeMark),
            Ok(TapeEvent::EndOfMedium) => self.client.send(&Reply::EndOfMedium),
            Ok(TapeEvent::BeginningOfMedium) => self.client.send(&Reply::BeginningOfMedium),
            Err(e) => self.client.send(&tape_error_reply(vsn, e)),
        }
    }

    /// Run an operation on the mounted tape while holding the library lock.
    fn with_tape<F>(&mut self, op: F)
    where
        F: FnOnce(&str, &mut VirtualTape) -> std::result::Result<Reply, TapeError>,
    {
        let Some(key) = self.registered_drive() else { return };
        let mut library = self.library.lock();
        let reply = match library.loaded_tape(&key) {
            Some((vsn, tape)) => match op(vsn, tape) {
                Ok(reply) => reply,
                Err(e) => tape_error_reply(vsn, e),
            },
            None => Reply::NotReady(format!("no volume mounted on {}", key)),
        };
        self.client.send(&reply);
    }

    fn registered_drive(&self) -> Option<String> {
        if self.drive_key.is_none() {
            self.client.send(&Reply::NotReady("no drive registered".to_string()));
        }
        self.drive_key.clone()
    }

    /// Unbind the drive; whatever was mounted on it is dismounted.
    fn release(&mut self) {
        if let Some(key) = self.drive_key.take() {
            self.library.lock().release_client(&key, self.client.id);
            info!("Tape client {} released drive {}", self.client.id, key);
        }
    }
}

fn tape_error_reply(vsn: &str, error: TapeError) -> Reply {
    match error {
        TapeError::ReadOnly => Reply::ReadOnly(vsn.to_string()),
        TapeError::LengthMismatch { .. } => Reply::LengthMismatch(error.to_string()),
        TapeError::RecordTooLarge(_) => Reply::BadRequest(error.to_string()),
        TapeError::Io(_) | TapeError::Truncated { .. } => {
            warn!("Tape error on {}: {}", vsn, error);
            Reply::IoError(error.to_string())
        }
    }
}
