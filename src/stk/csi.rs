//! CSI envelopes: header, packed callback handle, message header, and the
//! request/response bodies of the commands this library serves.

use std::net::{Ipv4Addr, SocketAddr};

use crate::xdr::{XdrDecoder, XdrEncoder, XdrError, XdrResult};

use super::constants::{
    options, Command, IdType, ServerState, Status, CSI_HANDLE_SIZE, CSI_XID_SIZE,
    REQUEST_CLASSES, RESERVED_IDENTIFIER_WORDS,
};

/// Where the deferred response for a request must be delivered.
///
/// On the wire this is 28 bytes: program, version and procedure as
/// big-endian u32, then a sockaddr_in (family u16, port u16, IPv4 address,
/// 8 bytes of zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiHandle {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub protocol: u16,
    pub port: u16,
    pub address: Ipv4Addr,
}

impl CsiHandle {
    pub fn deserialize(bytes: &[u8]) -> XdrResult<Self> {
        if bytes.len() < CSI_HANDLE_SIZE {
            return Err(XdrError::Underflow {
                offset: 0,
                needed: CSI_HANDLE_SIZE,
                available: bytes.len(),
            });
        }
        let mut dec = XdrDecoder::new(&bytes[..12]);
        let program = dec.extract_u32()?;
        let version = dec.extract_u32()?;
        let procedure = dec.extract_u32()?;
        let protocol = u16::from_be_bytes([bytes[12], bytes[13]]);
        let port = u16::from_be_bytes([bytes[14], bytes[15]]);
        let address = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);

        Ok(Self {
            program,
            version,
            procedure,
            protocol,
            port,
            address,
        })
    }

    pub fn serialize(&self) -> [u8; CSI_HANDLE_SIZE] {
        let mut out = [0u8; CSI_HANDLE_SIZE];
        out[0..4].copy_from_slice(&self.program.to_be_bytes());
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..12].copy_from_slice(&self.procedure.to_be_bytes());
        out[12..14].copy_from_slice(&self.protocol.to_be_bytes());
        out[14..16].copy_from_slice(&self.port.to_be_bytes());
        out[16..20].copy_from_slice(&self.address.octets());
        out
    }

    pub fn callback_address(&self) -> SocketAddr {
        SocketAddr::from((self.address, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiHeader {
    pub xid: Vec<u8>,
    pub ssi_identifier: u32,
    pub syntax: u32,
    pub protocol: u32,
    pub connect_type: u32,
    pub handle: CsiHandle,
    /// The handle exactly as received, echoed back in the response.
    pub raw_handle: Vec<u8>,
}

impl CsiHeader {
    pub fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let xid = dec.extract_fixed_opaque(CSI_XID_SIZE)?;
        let ssi_identifier = dec.extract_u32()?;
        let syntax = dec.extract_u32()?;
        let protocol = dec.extract_u32()?;
        let connect_type = dec.extract_u32()?;
        let raw_handle = dec.extract_fixed_opaque(CSI_HANDLE_SIZE)?;
        let handle = CsiHandle::deserialize(&raw_handle)?;
        Ok(Self {
            xid,
            ssi_identifier,
            syntax,
            protocol,
            connect_type,
            handle,
            raw_handle,
        })
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.append_fixed_opaque(&self.xid);
        enc.append_u32(self.ssi_identifier);
        enc.append_u32(self.syntax);
        enc.append_u32(self.protocol);
        enc.append_u32(self.connect_type);
        enc.append_fixed_opaque(&self.raw_handle);
    }
}

/// Fields present only when the EXTENDED option bit is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub version: u32,
    pub extended_options: u32,
    pub lock_id: u32,
    pub user_id: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub packet_id: u32,
    pub command: u32,
    pub options: u32,
    pub extended: Option<ExtendedHeader>,
}

impl MessageHeader {
    pub fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let packet_id = dec.extract_u32()?;
        let command = dec.extract_u32()?;
        let options = dec.extract_u32()?;
        let extended = if options & options::EXTENDED != 0 {
            Some(ExtendedHeader {
                version: dec.extract_u32()?,
                extended_options: dec.extract_u32()?,
                lock_id: dec.extract_u32()?,
                user_id: dec.extract_string()?,
                password: dec.extract_string()?,
            })
        } else {
            None
        };
        Ok(Self {
            packet_id,
            command,
            options,
            extended,
        })
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.append_u32(self.packet_id);
        enc.append_u32(self.command);
        enc.append_u32(self.options);
        if let Some(ext) = &self.extended {
            enc.append_u32(ext.version);
            enc.append_u32(ext.extended_options);
            enc.append_u32(ext.lock_id);
            enc.append_string(&ext.user_id);
            enc.append_string(&ext.password);
        }
    }

    pub fn has_option(&self, option: u32) -> bool {
        self.options & option != 0
    }

    /// Header for the final response: acknowledgement bits cleared.
    pub fn for_response(&self) -> Self {
        let mut header = self.clone();
        header.options &= !(options::ACKNOWLEDGE | options::INTERMEDIATE);
        header
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveId {
    pub acs: u32,
    pub lsm: u32,
    pub panel: u32,
    pub drive: u32,
}

impl DriveId {
    pub fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        Ok(Self {
            acs: dec.extract_u32()?,
            lsm: dec.extract_u32()?,
            panel: dec.extract_u32()?,
            drive: dec.extract_u32()?,
        })
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.append_u32(self.acs);
        enc.append_u32(self.lsm);
        enc.append_u32(self.panel);
        enc.append_u32(self.drive);
    }

    /// Library drive key, `M<lsm>P<panel>D<drive>`.
    pub fn drive_key(&self) -> String {
        format!("M{}P{}D{}", self.lsm, self.panel, self.drive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsiCommand {
    Query { query_type: u32, count: u32 },
    Mount { vol_id: String, drives: Vec<DriveId> },
    Dismount { vol_id: String, drive: DriveId },
    /// Any command this library does not implement.
    Unsupported(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiRequest {
    pub header: CsiHeader,
    pub message: MessageHeader,
    pub command: CsiCommand,
}

impl CsiRequest {
    pub fn decode(params: &[u8]) -> XdrResult<Self> {
        let mut dec = XdrDecoder::new(params);
        let header = CsiHeader::decode(&mut dec)?;
        let message = MessageHeader::decode(&mut dec)?;

        let command = match Command::from_u32(message.command) {
            Some(Command::Query) => {
                let query_type = dec.extract_u32()?;
                let count = dec.extract_u32()?;
                CsiCommand::Query { query_type, count }
            }
            Some(Command::Mount) => {
                let vol_id = dec.extract_string()?;
                let count = dec.extract_u32()?;
                let mut drives = Vec::new();
                for _ in 0..count {
                    drives.push(DriveId::decode(&mut dec)?);
                }
                CsiCommand::Mount { vol_id, drives }
            }
            Some(Command::Dismount) => {
                let vol_id = dec.extract_string()?;
                let drive = DriveId::decode(&mut dec)?;
                CsiCommand::Dismount { vol_id, drive }
            }
            _ => CsiCommand::Unsupported(message.command),
        };

        Ok(Self {
            header,
            message,
            command,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        self.header.encode(&mut enc);
        self.message.encode(&mut enc);
        match &self.command {
            CsiCommand::Query { query_type, count } => {
                enc.append_u32(*query_type);
                enc.append_u32(*count);
            }
            CsiCommand::Mount { vol_id, drives } => {
                enc.append_string(vol_id);
                enc.append_u32(drives.len() as u32);
                for drive in drives {
                    drive.encode(&mut enc);
                }
            }
            CsiCommand::Dismount { vol_id, drive } => {
                enc.append_string(vol_id);
                drive.encode(&mut enc);
            }
            CsiCommand::Unsupported(_) => {}
        }
        enc.into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub state: ServerState,
    pub free_cells: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Query {
        status: Status,
        query_type: u32,
        server: Option<ServerStatus>,
    },
    Volume {
        status: Status,
        vol_id: String,
        drive: DriveId,
    },
    Rejected {
        status: Status,
    },
}

impl ResponseBody {
    pub fn status(&self) -> Status {
        match self {
            ResponseBody::Query { status, .. }
            | ResponseBody::Volume { status, .. }
            | ResponseBody::Rejected { status } => *status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiResponse {
    pub header: CsiHeader,
    pub message: MessageHeader,
    pub body: ResponseBody,
}

impl CsiResponse {
    pub fn new(request: &CsiRequest, body: ResponseBody) -> Self {
        Self {
            header: request.header.clone(),
            message: request.message.for_response(),
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        self.header.encode(&mut enc);
        self.message.encode(&mut enc);

        match &self.body {
            ResponseBody::Query {
                status,
                query_type,
                server,
            } => {
                enc.append_u32(status.code());
                enc.append_u32(IdType::None as u32);
                enc.append_u32(*query_type);
                match server {
                    Some(server) => {
                        enc.append_u32(1);
                        enc.append_u32(server.state as u32);
                        enc.append_u32(server.free_cells);
                        // current and pending counts per request class
                        for _ in 0..REQUEST_CLASSES * 2 {
                            enc.append_u32(0);
                        }
                    }
                    None => enc.append_u32(0),
                }
            }
            ResponseBody::Volume {
                status,
                vol_id,
                drive,
            } => {
                enc.append_u32(status.code());
                enc.append_u32(IdType::Volume as u32);
                for _ in 0..RESERVED_IDENTIFIER_WORDS {
                    enc.append_u32(0);
                }
                enc.append_string(vol_id);
                drive.encode(&mut enc);
            }
            ResponseBody::Rejected { status } => {
                enc.append_u32(status.code());
                enc.append_u32(IdType::None as u32);
            }
        }
        enc.into_bytes()
    }

    /// Decode a response as the client library would.
    pub fn decode(data: &[u8]) -> XdrResult<Self> {
        let mut dec = XdrDecoder::new(data);
        let header = CsiHeader::decode(&mut dec)?;
        let message = MessageHeader::decode(&mut dec)?;
        let status = Status::from_u32(dec.extract_u32()?).unwrap_or(Status::InvalidMessage);
        let _id_type = dec.extract_u32()?;

        let body = match Command::from_u32(message.command) {
            Some(Command::Query) => {
                let query_type = dec.extract_u32()?;
                let count = dec.extract_u32()?;
                let server = if count > 0 {
                    let state = dec.extract_u32()?;
                    let free_cells = dec.extract_u32()?;
                    for _ in 0..REQUEST_CLASSES * 2 {
                        dec.extract_u32()?;
                    }
                    Some(ServerStatus {
                        state: if state == ServerState::Run as u32 {
                            ServerState::Run
                        } else {
                            ServerState::Offline
                        },
                        free_cells,
                    })
                } else {
                    None
                };
                ResponseBody::Query {
                    status,
                    query_type,
                    server,
                }
            }
            Some(Command::Mount) | Some(Command::Dismount) if dec.remaining() > 0 => {
                for _ in 0..RESERVED_IDENTIFIER_WORDS {
                    dec.extract_u32()?;
                }
                let vol_id = dec.extract_string()?;
                let drive = DriveId::decode(&mut dec)?;
                ResponseBody::Volume {
                    status,
                    vol_id,
                    drive,
                }
            }
            _ => ResponseBody::Rejected { status },
        };

        Ok(Self {
            header,
            message,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_header(callback_port: u16) -> CsiHeader {
        let handle = CsiHandle {
            program: 0x20000001,
            version: 1,
            procedure: 1000,
            protocol: 2,
            port: callback_port,
            address: Ipv4Addr::LOCALHOST,
        };
        CsiHeader {
            xid: (0..CSI_XID_SIZE as u8).collect(),
            ssi_identifier: 0x1234,
            syntax: 1,
            protocol: 1,
            connect_type: 1,
            raw_handle: handle.serialize().to_vec(),
            handle,
        }
    }

    pub(crate) fn request(command: Command, options: u32, body: CsiCommand) -> CsiRequest {
        CsiRequest {
            header: sample_header(5000),
            message: MessageHeader {
                packet_id: 42,
                command: command as u32,
                options,
                extended: None,
            },
            command: body,
        }
    }

    #[test]
    fn test_handle_layout() {
        let handle = sample_header(0xABCD).handle;
        let bytes = handle.serialize();
        assert_eq!(&bytes[0..4], &[0x20, 0, 0, 1]);
        assert_eq!(&bytes[14..16], &[0xAB, 0xCD]);
        assert_eq!(&bytes[16..20], &[127, 0, 0, 1]);
        assert!(bytes[20..].iter().all(|&b| b == 0));

        let decoded = CsiHandle::deserialize(&bytes).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(decoded.callback_address(), "127.0.0.1:43981".parse().unwrap());
    }

    #[test]
    fn test_short_handle_rejected() {
        assert!(CsiHandle::deserialize(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_mount_request_round_trip() {
        let req = request(
            Command::Mount,
            0,
            CsiCommand::Mount {
                vol_id: "TAPE01".to_string(),
                drives: vec![DriveId {
                    acs: 0,
                    lsm: 1,
                    panel: 2,
                    drive: 3,
                }],
            },
        );
        let decoded = CsiRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
        match decoded.command {
            CsiCommand::Mount { drives, .. } => assert_eq!(drives[0].drive_key(), "M1P2D3"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_extended_header_round_trip() {
        let mut req = request(
            Command::Dismount,
            options::EXTENDED | options::FORCE,
            CsiCommand::Dismount {
                vol_id: "VOL002".to_string(),
                drive: DriveId::default(),
            },
        );
        req.message.extended = Some(ExtendedHeader {
            version: 4,
            extended_options: 0,
            lock_id: 0,
            user_id: "operator".to_string(),
            password: String::new(),
        });
        let decoded = CsiRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.message.has_option(options::FORCE));
    }

    #[test]
    fn test_truncated_request_fails() {
        let req = request(
            Command::Query,
            0,
            CsiCommand::Query {
                query_type: IdType::Server as u32,
                count: 0,
            },
        );
        let bytes = req.encode();
        assert!(CsiRequest::decode(&bytes[..bytes.len() - 4]).is_err());
        assert!(CsiRequest::decode(&bytes[..30]).is_err());
    }

    #[test]
    fn test_volume_response_shape() {
        let req = request(
            Command::Mount,
            options::ACKNOWLEDGE,
            CsiCommand::Mount {
                vol_id: "TAPE01".to_string(),
                drives: vec![DriveId::default()],
            },
        );
        let resp = CsiResponse::new(
            &req,
            ResponseBody::Volume {
                status: Status::Success,
                vol_id: "TAPE01".to_string(),
                drive: DriveId::default(),
            },
        );
        let bytes = resp.encode();
        // header 36 + 16 + 28, message 12, status + type 8, reserved 44,
        // vol id 4 + 8, drive id 16
        assert_eq!(bytes.len(), 80 + 12 + 8 + 44 + 12 + 16);

        let decoded = CsiResponse::decode(&bytes).unwrap();
        assert_eq!(decoded.body, resp.body);
        assert!(!decoded.message.has_option(options::ACKNOWLEDGE));
    }
}
