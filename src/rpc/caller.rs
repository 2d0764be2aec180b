//! Outbound RPC calls over UDP.
//!
//! One call binds an ephemeral socket, sends the envelope and waits for the
//! reply carrying the same xid. Used for port mapper relaying, indirect calls
//! and ACSLS response callbacks.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::{AcceptStat, MsgType, RejectStat, ReplyStat, RpcCall, MAX_DATAGRAM};
use crate::xdr::{XdrDecoder, XdrResult};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    /// Accepted with SUCCESS; the procedure's encoded results.
    Success(Vec<u8>),
    Timeout,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
    /// The reply could not be decoded.
    Malformed(String),
    /// The request could not be sent.
    Io(String),
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Success(_))
    }
}

impl fmt::Display for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallResult::Success(body) => write!(f, "success ({} bytes)", body.len()),
            CallResult::Timeout => write!(f, "timeout"),
            CallResult::ProgUnavail => write!(f, "program unavailable"),
            CallResult::ProgMismatch { low, high } => {
                write!(f, "program version mismatch (supported {}..{})", low, high)
            }
            CallResult::ProcUnavail => write!(f, "procedure unavailable"),
            CallResult::GarbageArgs => write!(f, "garbage arguments"),
            CallResult::SystemErr => write!(f, "system error"),
            CallResult::RpcMismatch { low, high } => {
                write!(f, "RPC version mismatch (supported {}..{})", low, high)
            }
            CallResult::AuthError(stat) => write!(f, "authentication error {}", stat),
            CallResult::Malformed(msg) => write!(f, "malformed reply: {}", msg),
            CallResult::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// Decode a reply datagram. `None` if it is not a reply to `xid`.
pub fn decode_reply(xid: u32, data: &[u8]) -> Option<CallResult> {
    let mut dec = XdrDecoder::new(data);
    match (dec.extract_u32(), dec.extract_u32()) {
        (Ok(reply_xid), Ok(msg_type)) if reply_xid == xid && msg_type == MsgType::Reply as u32 => {}
        _ => return None,
    }
    Some(decode_reply_body(&mut dec).unwrap_or_else(|e| CallResult::Malformed(e.to_string())))
}

fn decode_reply_body(dec: &mut XdrDecoder<'_>) -> XdrResult<CallResult> {
    let reply_stat = dec.extract_u32()?;
    if reply_stat == ReplyStat::Denied as u32 {
        let reject_stat = dec.extract_u32()?;
        return Ok(if reject_stat == RejectStat::RpcMismatch as u32 {
            CallResult::RpcMismatch {
                low: dec.extract_u32()?,
                high: dec.extract_u32()?,
            }
        } else {
            CallResult::AuthError(dec.extract_u32()?)
        });
    }

    // verifier
    dec.extract_u32()?;
    dec.extract_var_opaque()?;

    let stat = dec.extract_u32()?;
    Ok(match AcceptStat::from_u32(stat) {
        Some(AcceptStat::Success) => CallResult::Success(dec.extract_remainder()),
        Some(AcceptStat::ProgUnavail) => CallResult::ProgUnavail,
        Some(AcceptStat::ProgMismatch) => CallResult::ProgMismatch {
            low: dec.extract_u32()?,
            high: dec.extract_u32()?,
        },
        Some(AcceptStat::ProcUnavail) => CallResult::ProcUnavail,
        Some(AcceptStat::GarbageArgs) => CallResult::GarbageArgs,
        Some(AcceptStat::SystemErr) => CallResult::SystemErr,
        None => CallResult::Malformed(format!("unknown accept status {}", stat)),
    })
}

fn random_xid() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}

#[derive(Debug, Clone)]
pub struct RpcCaller {
    response_timeout: Duration,
}

impl Default for RpcCaller {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl RpcCaller {
    pub fn new(response_timeout: Duration) -> Self {
        Self { response_timeout }
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Issue one call and wait for the matching reply or the timeout.
    pub async fn call(
        &self,
        addr: SocketAddr,
        program: u32,
        version: u32,
        procedure: u32,
        args: &[u8],
    ) -> CallResult {
        let xid = random_xid();
        let request = RpcCall::new(xid, program, version, procedure, args.to_vec()).encode();

        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(s) => s,
            Err(e) => return CallResult::Io(e.to_string()),
        };
        if let Err(e) = socket.send_to(&request, addr).await {
            return CallResult::Io(e.to_string());
        }
        debug!(
            "RPC call xid={:#010x} to {} prog={} vers={} proc={}",
            xid, addr, program, version, procedure
        );

        let deadline = Instant::now() + self.response_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => return CallResult::Timeout,
                Ok(Err(e)) => return CallResult::Io(e.to_string()),
                Ok(Ok(r)) => r,
            };
            trace!("Reply datagram from {}: {}", from, hex::encode(&buf[..len]));
            if let Some(result) = decode_reply(xid, &buf[..len]) {
                return result;
            }
            debug!("Ignoring datagram from {} not matching xid {:#010x}", from, xid);
        }
    }

    /// Like [`call`](Self::call) but retries timeouts, up to `attempts` calls in total.
    pub async fn call_with_retry(
        &self,
        addr: SocketAddr,
        program: u32,
        version: u32,
        procedure: u32,
        args: &[u8],
        attempts: u32,
    ) -> CallResult {
        let mut result = CallResult::Timeout;
        for attempt in 1..=attempts.max(1) {
            result = self.call(addr, program, version, procedure, args).await;
            if result != CallResult::Timeout {
                break;
            }
            debug!(
                "Call to {} prog={} timed out (attempt {}/{})",
                addr, program, attempt, attempts
            );
        }
        result
    }
}
