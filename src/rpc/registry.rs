//! Directory of live RPC programs and the ports they are bound to.
//!
//! Constructed once at startup and shared by `Arc` with every service. When a
//! foreign port mapper is configured, local registrations are mirrored to it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::caller::{CallResult, RpcCaller};
use super::portmap::{PMAPPROC_SET, PMAPPROC_UNSET, PMAP_PORT, PMAP_PROG, PMAP_VERS};
use super::RpcProgram;
use crate::error::{Result, RustStkError};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// Attempts made when relaying to the foreign port mapper.
pub const RELAY_ATTEMPTS: u32 = 5;

/// IP protocol numbers as used by the port mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
}

impl Protocol {
    pub fn from_u32(prot: u32) -> Option<Self> {
        match prot {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One (program, version) entry.
#[derive(Clone)]
pub struct Registration {
    pub program: u32,
    pub version: u32,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    /// Present for programs served by this process.
    pub service: Option<Arc<dyn RpcProgram>>,
}

impl Registration {
    pub fn local(service: Arc<dyn RpcProgram>, udp_port: Option<u16>, tcp_port: Option<u16>) -> Self {
        Self {
            program: service.program(),
            version: service.version(),
            udp_port,
            tcp_port,
            service: Some(service),
        }
    }

    pub fn port(&self, protocol: Protocol) -> Option<u16> {
        match protocol {
            Protocol::Tcp => self.tcp_port,
            Protocol::Udp => self.udp_port,
        }
    }

    fn set_port(&mut self, protocol: Protocol, port: u16) {
        match protocol {
            Protocol::Tcp => self.tcp_port = Some(port),
            Protocol::Udp => self.udp_port = Some(port),
        }
    }

    fn mappings(&self) -> Vec<Mapping> {
        [Protocol::Udp, Protocol::Tcp]
            .into_iter()
            .filter_map(|protocol| {
                self.port(protocol).map(|port| Mapping {
                    program: self.program,
                    version: self.version,
                    protocol,
                    port,
                })
            })
            .collect()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("program", &self.program)
            .field("version", &self.version)
            .field("udp_port", &self.udp_port)
            .field("tcp_port", &self.tcp_port)
            .field("service", &self.service.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

/// A (prog, vers, prot, port) tuple as exchanged with port mappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: Protocol,
    pub port: u16,
}

impl Mapping {
    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.append_u32(self.program);
        enc.append_u32(self.version);
        enc.append_u32(self.protocol as u32);
        enc.append_u32(self.port as u32);
    }

    /// Decodes prog, vers and port; `None` for an unknown protocol number.
    pub fn decode(dec: &mut XdrDecoder<'_>) -> crate::xdr::XdrResult<Option<Self>> {
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        let prot = dec.extract_u32()?;
        let port = dec.extract_u32()?;
        Ok(Protocol::from_u32(prot).map(|protocol| Mapping {
            program,
            version,
            protocol,
            port: port as u16,
        }))
    }
}

fn program_key(program: u32, version: u32) -> String {
    format!("p{}v{}", program, version)
}

pub struct ProgramRegistry {
    programs: RwLock<BTreeMap<String, Registration>>,
    ports_in_use: Mutex<BTreeSet<(Protocol, u16)>>,
    foreign_portmapper: Option<SocketAddr>,
    caller: RpcCaller,
}

impl ProgramRegistry {
    pub fn new(foreign_portmapper: Option<SocketAddr>, caller: RpcCaller) -> Self {
        Self {
            programs: RwLock::new(BTreeMap::new()),
            ports_in_use: Mutex::new(BTreeSet::new()),
            foreign_portmapper,
            caller,
        }
    }

    /// Resolve `host[:port]`; the port defaults to 111.
    pub fn resolve_foreign_address(spec: &str) -> Result<SocketAddr> {
        let with_port = if spec.contains(':') {
            spec.to_string()
        } else {
            format!("{}:{}", spec, PMAP_PORT)
        };
        with_port
            .to_socket_addrs()
            .map_err(|e| RustStkError::config(format!("cannot resolve port mapper {}: {}", spec, e)))?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| RustStkError::config(format!("no IPv4 address for port mapper {}", spec)))
    }

    pub fn caller(&self) -> &RpcCaller {
        &self.caller
    }

    pub fn foreign_portmapper(&self) -> Option<SocketAddr> {
        self.foreign_portmapper
    }

    /// Mark a port as in use. Returns false if it already was.
    pub fn claim_port(&self, protocol: Protocol, port: u16) -> bool {
        self.ports_in_use.lock().insert((protocol, port))
    }

    pub fn release_port(&self, protocol: Protocol, port: u16) {
        self.ports_in_use.lock().remove(&(protocol, port));
    }

    pub fn is_port_in_use(&self, protocol: Protocol, port: u16) -> bool {
        self.ports_in_use.lock().contains(&(protocol, port))
    }

    /// Add or replace a registration, mirroring it to the foreign port mapper.
    pub fn register_program(&self, registration: Registration) {
        info!(
            "Registering program {} version {} (udp={:?}, tcp={:?})",
            registration.program, registration.version, registration.udp_port, registration.tcp_port
        );
        let mappings = registration.mappings();
        self.programs
            .write()
            .insert(program_key(registration.program, registration.version), registration);

        for mapping in mappings {
            self.relay(PMAPPROC_SET, mapping);
        }
    }

    /// Port mapper SET. Refuses when the protocol is already mapped.
    pub fn set_mapping(&self, mapping: Mapping) -> bool {
        let mut programs = self.programs.write();
        let key = program_key(mapping.program, mapping.version);
        match programs.get_mut(&key) {
            Some(existing) if existing.port(mapping.protocol).is_some() => {
                debug!(
                    "SET refused: {} already mapped for {}",
                    key, mapping.protocol
                );
                false
            }
            Some(existing) => {
                existing.set_port(mapping.protocol, mapping.port);
                true
            }
            None => {
                let mut registration = Registration {
                    program: mapping.program,
                    version: mapping.version,
                    udp_port: None,
                    tcp_port: None,
                    service: None,
                };
                registration.set_port(mapping.protocol, mapping.port);
                programs.insert(key, registration);
                true
            }
        }
    }

    pub fn unregister_program(&self, program: u32, version: u32) -> Option<Registration> {
        let removed = self.programs.write().remove(&program_key(program, version));
        if let Some(registration) = &removed {
            info!("Unregistered program {} version {}", program, version);
            if registration.service.is_some() {
                for mapping in registration.mappings() {
                    self.relay(PMAPPROC_UNSET, mapping);
                }
            }
        }
        removed
    }

    pub fn lookup_program(&self, program: u32, version: u32) -> Option<Registration> {
        self.programs.read().get(&program_key(program, version)).cloned()
    }

    /// Port for (prog, vers, prot), 0 when unmapped.
    pub fn get_port(&self, program: u32, version: u32, protocol: Protocol) -> u16 {
        self.lookup_program(program, version)
            .and_then(|r| r.port(protocol))
            .unwrap_or(0)
    }

    /// Every UDP and TCP binding of every program.
    pub fn list_programs(&self) -> Vec<Mapping> {
        self.programs
            .read()
            .values()
            .flat_map(Registration::mappings)
            .collect()
    }

    fn relay(&self, procedure: u32, mapping: Mapping) {
        let Some(foreign) = self.foreign_portmapper else {
            return;
        };
        let caller = self.caller.clone();
        tokio::spawn(async move {
            relay_mapping(caller, foreign, procedure, mapping).await;
        });
    }
}

async fn relay_mapping(caller: RpcCaller, foreign: SocketAddr, procedure: u32, mapping: Mapping) {
    let mut args = XdrEncoder::new();
    mapping.encode(&mut args);

    let verb = if procedure == PMAPPROC_SET { "SET" } else { "UNSET" };
    let result = caller
        .call_with_retry(
            foreign,
            PMAP_PROG,
            PMAP_VERS,
            procedure,
            args.as_bytes(),
            RELAY_ATTEMPTS,
        )
        .await;

    match result {
        CallResult::Success(body) => {
            let accepted = XdrDecoder::new(&body).extract_bool().unwrap_or(false);
            if accepted {
                info!(
                    "Foreign port mapper {} accepted {} of program {} version {} {} port {}",
                    foreign, verb, mapping.program, mapping.version, mapping.protocol, mapping.port
                );
            } else {
                warn!(
                    "Foreign port mapper {} refused {} of program {} version {} {}",
                    foreign, verb, mapping.program, mapping.version, mapping.protocol
                );
            }
        }
        other => warn!(
            "Failed to relay {} of program {} version {} to {}: {}",
            verb, mapping.program, mapping.version, foreign, other
        ),
    }
}
