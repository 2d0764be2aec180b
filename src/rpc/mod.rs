//! ONC RPC v2 (RFC 1831) message layer over UDP.
//!
//! Decodes call envelopes, resolves the target program through the
//! [`ProgramRegistry`], and frames the accepted/denied reply around whatever
//! the program's procedure produced. Concrete services implement
//! [`RpcProgram`].

pub mod caller;
pub mod portmap;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, RustStkError};
use crate::xdr::{XdrDecoder, XdrEncoder, XdrResult};

pub use self::caller::{CallResult, RpcCaller};
pub use self::registry::{Mapping, ProgramRegistry, Protocol, Registration};

/// The only RPC protocol version spoken.
pub const RPC_VERSION: u32 = 2;

pub const AUTH_NONE: u32 = 0;

/// Largest datagram accepted or sent.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Call = 0,
    Reply = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyStat {
    Accepted = 0,
    Denied = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

impl AcceptStat {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(AcceptStat::Success),
            1 => Some(AcceptStat::ProgUnavail),
            2 => Some(AcceptStat::ProgMismatch),
            3 => Some(AcceptStat::ProcUnavail),
            4 => Some(AcceptStat::GarbageArgs),
            5 => Some(AcceptStat::SystemErr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectStat {
    RpcMismatch = 0,
    AuthError = 1,
}

/// Credential or verifier: flavor plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self {
            flavor: AUTH_NONE,
            body: Vec::new(),
        }
    }

    fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let flavor = dec.extract_u32()?;
        let body = dec.extract_var_opaque()?;
        Ok(Self { flavor, body })
    }

    fn encode(&self, enc: &mut XdrEncoder) {
        enc.append_u32(self.flavor);
        enc.append_var_opaque(&self.body);
    }
}

/// A decoded RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub xid: u32,
    pub rpc_version: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: OpaqueAuth,
    pub verifier: OpaqueAuth,
    /// Procedure-specific parameters, still XDR encoded.
    pub params: Vec<u8>,
}

impl RpcCall {
    pub fn new(xid: u32, program: u32, version: u32, procedure: u32, params: Vec<u8>) -> Self {
        Self {
            xid,
            rpc_version: RPC_VERSION,
            program,
            version,
            procedure,
            credential: OpaqueAuth::none(),
            verifier: OpaqueAuth::none(),
            params,
        }
    }

    /// Decode a call envelope. Fails for truncated data or a non-CALL message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = XdrDecoder::new(data);
        let xid = dec.extract_u32()?;
        let msg_type = dec.extract_u32()?;
        if msg_type != MsgType::Call as u32 {
            return Err(RustStkError::rpc(format!(
                "xid {:#010x}: message type {} is not CALL",
                xid, msg_type
            )));
        }
        let rpc_version = dec.extract_u32()?;
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        let procedure = dec.extract_u32()?;
        let credential = OpaqueAuth::decode(&mut dec)?;
        let verifier = OpaqueAuth::decode(&mut dec)?;
        let params = dec.extract_remainder();

        Ok(Self {
            xid,
            rpc_version,
            program,
            version,
            procedure,
            credential,
            verifier,
            params,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        enc.append_u32(self.xid);
        enc.append_u32(MsgType::Call as u32);
        enc.append_u32(self.rpc_version);
        enc.append_u32(self.program);
        enc.append_u32(self.version);
        enc.append_u32(self.procedure);
        self.credential.encode(&mut enc);
        self.verifier.encode(&mut enc);
        enc.append_raw(&self.params);
        enc.into_bytes()
    }
}

/// What a procedure produced. The message layer turns it into an accept status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureResult {
    /// SUCCESS followed by these already-encoded results.
    Success(Vec<u8>),
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    /// Send nothing back (a failed indirect call).
    NoReply,
}

/// An RPC service reachable through the registry.
#[async_trait]
pub trait RpcProgram: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn program(&self) -> u32;

    fn version(&self) -> u32;

    /// Execute one procedure. Unknown procedures return `ProcUnavail`.
    async fn call_procedure(&self, call: &RpcCall) -> ProcedureResult;
}

fn reply_header(xid: u32, stat: ReplyStat) -> XdrEncoder {
    let mut enc = XdrEncoder::new();
    enc.append_u32(xid);
    enc.append_u32(MsgType::Reply as u32);
    enc.append_u32(stat as u32);
    enc
}

/// MSG_ACCEPTED reply with an AUTH_NONE verifier and the given status.
pub fn accepted_reply(xid: u32, stat: AcceptStat, results: &[u8]) -> Vec<u8> {
    let mut enc = reply_header(xid, ReplyStat::Accepted);
    OpaqueAuth::none().encode(&mut enc);
    enc.append_u32(stat as u32);
    enc.append_raw(results);
    enc.into_bytes()
}

/// MSG_DENIED / RPC_MISMATCH naming the supported version range.
pub fn rpc_mismatch_reply(xid: u32) -> Vec<u8> {
    let mut enc = reply_header(xid, ReplyStat::Denied);
    enc.append_u32(RejectStat::RpcMismatch as u32);
    enc.append_u32(RPC_VERSION);
    enc.append_u32(RPC_VERSION);
    enc.into_bytes()
}

/// Build the reply for one inbound datagram received on `local_port`.
///
/// Returns `None` when nothing should be sent back: undecodable input, or a
/// procedure that declined to reply.
pub async fn handle_call_request(
    registry: &ProgramRegistry,
    local_port: u16,
    data: &[u8],
) -> Option<Vec<u8>> {
    let call = match RpcCall::decode(data) {
        Ok(call) => call,
        Err(e) => {
            warn!("Dropping malformed RPC datagram ({} bytes): {}", data.len(), e);
            return None;
        }
    };

    debug!(
        "RPC call xid={:#010x} prog={} vers={} proc={}",
        call.xid, call.program, call.version, call.procedure
    );

    if call.rpc_version != RPC_VERSION {
        warn!(
            "RPC version {} not supported (xid {:#010x})",
            call.rpc_version, call.xid
        );
        return Some(rpc_mismatch_reply(call.xid));
    }

    let service = match registry.lookup_program(call.program, call.version) {
        Some(Registration {
            udp_port: Some(port),
            service: Some(service),
            ..
        }) if port == local_port => service,
        _ => {
            debug!(
                "Program {} version {} not available on port {}",
                call.program, call.version, local_port
            );
            return Some(accepted_reply(call.xid, AcceptStat::ProgUnavail, &[]));
        }
    };

    let reply = match service.call_procedure(&call).await {
        ProcedureResult::Success(results) => {
            accepted_reply(call.xid, AcceptStat::Success, &results)
        }
        ProcedureResult::ProcUnavail => {
            debug!(
                "{}: procedure {} unavailable",
                service.name(),
                call.procedure
            );
            accepted_reply(call.xid, AcceptStat::ProcUnavail, &[])
        }
        ProcedureResult::GarbageArgs => {
            warn!(
                "{}: garbage arguments for procedure {}",
                service.name(),
                call.procedure
            );
            accepted_reply(call.xid, AcceptStat::GarbageArgs, &[])
        }
        ProcedureResult::SystemErr => accepted_reply(call.xid, AcceptStat::SystemErr, &[]),
        ProcedureResult::NoReply => return None,
    };
    Some(reply)
}

/// UDP socket owned by one RPC program.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    registry: Arc<ProgramRegistry>,
    name: String,
    local_port: u16,
}

impl UdpServer {
    /// Bind the program's socket. On failure the port is released again.
    pub async fn bind(
        registry: Arc<ProgramRegistry>,
        name: &str,
        addr: SocketAddr,
    ) -> Result<Self> {
        if addr.port() != 0 && !registry.claim_port(Protocol::Udp, addr.port()) {
            return Err(RustStkError::config(format!(
                "UDP port {} is already in use by another program",
                addr.port()
            )));
        }

        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("{}: failed to bind UDP {}: {}", name, addr, e);
                registry.release_port(Protocol::Udp, addr.port());
                return Err(e.into());
            }
        };
        let local_port = socket.local_addr()?.port();
        if addr.port() == 0 {
            registry.claim_port(Protocol::Udp, local_port);
        }
        info!("{} listening on UDP port {}", name, local_port);

        Ok(Self {
            socket: Arc::new(socket),
            registry,
            name: name.to_string(),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Serve datagrams until the socket fails. Each call runs on its own task
    /// so a slow procedure (an indirect call) does not stall the socket.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!("{}: receive failed: {}", self.name, e);
                    self.registry.release_port(Protocol::Udp, self.local_port);
                    return Err(e.into());
                }
            };
            let data = buf[..len].to_vec();
            trace!("{}: {} bytes from {}: {}", self.name, len, peer, hex::encode(&data));

            let socket = Arc::clone(&self.socket);
            let registry = Arc::clone(&self.registry);
            let local_port = self.local_port;
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Some(reply) = handle_call_request(&registry, local_port, &data).await {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        warn!("{}: failed to send reply to {}: {}", name, peer, e);
                    }
                }
            });
        }
    }
}
