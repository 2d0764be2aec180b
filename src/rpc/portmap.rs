//! Port mapper, RPC program 100000 version 2.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::registry::{Mapping, ProgramRegistry, Protocol};
use super::{CallResult, ProcedureResult, RpcCall, RpcProgram};
use crate::xdr::{XdrDecoder, XdrEncoder, XdrResult};

/// Well-known port of the port mapper.
pub const PMAP_PORT: u16 = 111;

pub const PMAP_PROG: u32 = 100_000;
pub const PMAP_VERS: u32 = 2;

pub const PMAPPROC_NULL: u32 = 0;
pub const PMAPPROC_SET: u32 = 1;
pub const PMAPPROC_UNSET: u32 = 2;
pub const PMAPPROC_GETPORT: u32 = 3;
pub const PMAPPROC_DUMP: u32 = 4;
pub const PMAPPROC_CALLIT: u32 = 5;

pub struct PortMapper {
    registry: Arc<ProgramRegistry>,
    /// Address the local programs are bound to; CALLIT targets it.
    local_address: IpAddr,
}

impl PortMapper {
    pub fn new(registry: Arc<ProgramRegistry>) -> Self {
        Self {
            registry,
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// Forward CALLIT to programs bound to `address`. A wildcard address
    /// is reached through loopback.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.local_address = match address {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            other => other,
        };
        self
    }

    fn callit_target(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.local_address, port)
    }

    fn set(&self, args: &[u8]) -> XdrResult<Vec<u8>> {
        let mut dec = XdrDecoder::new(args);
        let accepted = match Mapping::decode(&mut dec)? {
            Some(mapping) => {
                let accepted = self.registry.set_mapping(mapping);
                if accepted {
                    info!(
                        "Port mapper SET program {} version {} {} port {}",
                        mapping.program, mapping.version, mapping.protocol, mapping.port
                    );
                }
                accepted
            }
            None => false,
        };
        Ok(encode_bool(accepted))
    }

    fn unset(&self, args: &[u8]) -> XdrResult<Vec<u8>> {
        let mut dec = XdrDecoder::new(args);
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        self.registry.unregister_program(program, version);
        Ok(encode_bool(true))
    }

    fn getport(&self, args: &[u8]) -> XdrResult<Vec<u8>> {
        let mut dec = XdrDecoder::new(args);
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        let port = Protocol::from_u32(dec.extract_u32()?)
            .map(|protocol| self.registry.get_port(program, version, protocol))
            .unwrap_or(0);
        debug!("GETPORT program {} version {} -> {}", program, version, port);

        let mut enc = XdrEncoder::new();
        enc.append_u32(port as u32);
        Ok(enc.into_bytes())
    }

    fn dump(&self) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        for mapping in self.registry.list_programs() {
            enc.append_bool(true);
            mapping.encode(&mut enc);
        }
        enc.append_bool(false);
        enc.into_bytes()
    }

    /// Relay to the target's local UDP port. Failures produce no reply.
    async fn callit(&self, args: &[u8]) -> XdrResult<ProcedureResult> {
        let mut dec = XdrDecoder::new(args);
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        let procedure = dec.extract_u32()?;
        let call_args = dec.extract_var_opaque()?;

        let port = self.registry.get_port(program, version, Protocol::Udp);
        if port == 0 {
            debug!("CALLIT: program {} version {} has no UDP port", program, version);
            return Ok(ProcedureResult::NoReply);
        }

        let target = self.callit_target(port);
        match self
            .registry
            .caller()
            .call(target, program, version, procedure, &call_args)
            .await
        {
            CallResult::Success(result) => {
                let mut enc = XdrEncoder::new();
                enc.append_u32(port as u32);
                enc.append_var_opaque(&result);
                Ok(ProcedureResult::Success(enc.into_bytes()))
            }
            other => {
                warn!(
                    "CALLIT program {} version {} procedure {} failed: {}",
                    program, version, procedure, other
                );
                Ok(ProcedureResult::NoReply)
            }
        }
    }
}

fn encode_bool(val: bool) -> Vec<u8> {
    let mut enc = XdrEncoder::new();
    enc.append_bool(val);
    enc.into_bytes()
}

fn garbage_or(result: XdrResult<Vec<u8>>) -> ProcedureResult {
    match result {
        Ok(body) => ProcedureResult::Success(body),
        Err(_) => ProcedureResult::GarbageArgs,
    }
}

#[async_trait]
impl RpcProgram for PortMapper {
    fn name(&self) -> &str {
        "portmapper"
    }

    fn program(&self) -> u32 {
        PMAP_PROG
    }

    fn version(&self) -> u32 {
        PMAP_VERS
    }

    async fn call_procedure(&self, call: &RpcCall) -> ProcedureResult {
        match call.procedure {
            PMAPPROC_NULL => ProcedureResult::Success(Vec::new()),
            PMAPPROC_SET => garbage_or(self.set(&call.params)),
            PMAPPROC_UNSET => garbage_or(self.unset(&call.params)),
            PMAPPROC_GETPORT => garbage_or(self.getport(&call.params)),
            PMAPPROC_DUMP => ProcedureResult::Success(self.dump()),
            PMAPPROC_CALLIT => self
                .callit(&call.params)
                .await
                .unwrap_or(ProcedureResult::GarbageArgs),
            _ => ProcedureResult::ProcUnavail,
        }
    }
}

/// Decode a DUMP result list.
pub fn decode_dump(body: &[u8]) -> XdrResult<Vec<Mapping>> {
    let mut dec = XdrDecoder::new(body);
    let mut mappings = Vec::new();
    while dec.extract_bool()? {
        if let Some(mapping) = Mapping::decode(&mut dec)? {
            mappings.push(mapping);
        }
    }
    Ok(mappings)
}
