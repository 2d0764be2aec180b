//! ACSLS command engine, RPC program CSI_ACSLM.
//!
//! A request on procedure 1000 is acknowledged with an empty RPC reply
//! right away. The actual ACSLS response is sent later as an RPC call back
//! to the program, version and procedure packed in the request's handle.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::constants::{
    options, IdType, ServerState, Status, CSI_PROC_COMMAND, CSI_PROC_NULL, CSI_PROGRAM,
    CSI_VERSION,
};
use super::csi::{CsiCommand, CsiRequest, CsiResponse, DriveId, ResponseBody, ServerStatus};
use super::library::SharedLibrary;
use crate::rpc::{CallResult, ProcedureResult, RpcCall, RpcCaller, RpcProgram};

/// Delivery attempts for one deferred response.
pub const CALLBACK_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// The request was acknowledged; the response has not reached the client yet.
    Acknowledged,
    Delivered,
    Failed,
}

/// An ACSLS response waiting to be called back to the client.
#[derive(Debug, Clone)]
pub struct DeferredResponse {
    pub target: SocketAddr,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub packet_id: u32,
    pub status: Status,
    pub payload: Vec<u8>,
    state: DeliveryState,
}

impl DeferredResponse {
    pub fn new(request: &CsiRequest, response: &CsiResponse) -> Self {
        let handle = &request.header.handle;
        Self {
            target: handle.callback_address(),
            program: handle.program,
            version: handle.version,
            procedure: handle.procedure,
            packet_id: request.message.packet_id,
            status: response.body.status(),
            payload: response.encode(),
            state: DeliveryState::Acknowledged,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Call the response back, retrying on timeouts.
    pub async fn deliver(&mut self, caller: &RpcCaller) -> CallResult {
        let result = caller
            .call_with_retry(
                self.target,
                self.program,
                self.version,
                self.procedure,
                &self.payload,
                CALLBACK_ATTEMPTS,
            )
            .await;

        if result.is_success() {
            self.state = DeliveryState::Delivered;
            debug!("Delivered {}", self);
        } else {
            self.state = DeliveryState::Failed;
            error!("Failed to deliver {}: {}", self, result);
        }
        result
    }
}

impl fmt::Display for DeferredResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "response to packet {} ({}) for {} prog={:#x} vers={} proc={}",
            self.packet_id, self.status, self.target, self.program, self.version, self.procedure
        )
    }
}

/// Drains the deferred-response queue. Each delivery runs on its own task
/// so one unreachable client does not hold up the others.
pub struct CallbackDispatcher {
    caller: RpcCaller,
    responses: UnboundedReceiver<DeferredResponse>,
}

impl CallbackDispatcher {
    pub fn new(caller: RpcCaller) -> (Self, UnboundedSender<DeferredResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                caller,
                responses: rx,
            },
            tx,
        )
    }

    pub async fn run(mut self) {
        while let Some(mut response) = self.responses.recv().await {
            let caller = self.caller.clone();
            tokio::spawn(async move {
                response.deliver(&caller).await;
            });
        }
        debug!("Callback queue closed");
    }
}

pub struct StkCsi {
    library: SharedLibrary,
    responses: UnboundedSender<DeferredResponse>,
}

impl StkCsi {
    pub fn new(library: SharedLibrary, responses: UnboundedSender<DeferredResponse>) -> Self {
        Self { library, responses }
    }

    /// Run one ACSLS command against the library.
    pub fn execute(&self, request: &CsiRequest) -> CsiResponse {
        let body = match &request.command {
            CsiCommand::Query { query_type, .. } => self.query(*query_type),
            CsiCommand::Mount { vol_id, drives } => self.mount(vol_id, drives),
            CsiCommand::Dismount { vol_id, drive } => {
                let force = request.message.has_option(options::FORCE);
                self.dismount(vol_id, *drive, force)
            }
            CsiCommand::Unsupported(code) => {
                warn!("Unsupported ACSLS command {}", code);
                ResponseBody::Rejected {
                    status: Status::InvalidCommand,
                }
            }
        };
        CsiResponse::new(request, body)
    }

    fn query(&self, query_type: u32) -> ResponseBody {
        if IdType::from_u32(query_type) != Some(IdType::Server) {
            debug!("QUERY of unsupported type {}", query_type);
            return ResponseBody::Query {
                status: Status::UnsupportedType,
                query_type,
                server: None,
            };
        }
        let free_cells = self.library.lock().free_cells();
        ResponseBody::Query {
            status: Status::Success,
            query_type,
            server: Some(ServerStatus {
                state: ServerState::Run,
                free_cells,
            }),
        }
    }

    fn mount(&self, vol_id: &str, drives: &[DriveId]) -> ResponseBody {
        let drive = drives.first().copied().unwrap_or_default();
        let status = match drives.len() {
            0 => Status::CountTooSmall,
            1 if drive.acs != 0 => Status::AcsNotInLibrary,
            1 => match self.library.lock().mount(vol_id, &drive.drive_key(), true) {
                Ok(_) => Status::Success,
                Err(status) => status,
            },
            _ => Status::CountTooLarge,
        };
        info!("MOUNT {} on {}: {}", vol_id, drive.drive_key(), status);
        ResponseBody::Volume {
            status,
            vol_id: vol_id.to_string(),
            drive,
        }
    }

    fn dismount(&self, vol_id: &str, drive: DriveId, force: bool) -> ResponseBody {
        let status = if drive.acs != 0 {
            Status::AcsNotInLibrary
        } else {
            match self
                .library
                .lock()
                .dismount(vol_id, &drive.drive_key(), force, true)
            {
                Ok(_) => Status::Success,
                Err(status) => status,
            }
        };
        info!(
            "DISMOUNT {} from {}{}: {}",
            vol_id,
            drive.drive_key(),
            if force { " (force)" } else { "" },
            status
        );
        ResponseBody::Volume {
            status,
            vol_id: vol_id.to_string(),
            drive,
        }
    }
}

#[async_trait]
impl RpcProgram for StkCsi {
    fn name(&self) -> &str {
        "CSI_ACSLM"
    }

    fn program(&self) -> u32 {
        CSI_PROGRAM
    }

    fn version(&self) -> u32 {
        CSI_VERSION
    }

    async fn call_procedure(&self, call: &RpcCall) -> ProcedureResult {
        match call.procedure {
            CSI_PROC_NULL => ProcedureResult::Success(Vec::new()),
            CSI_PROC_COMMAND => {
                let request = match CsiRequest::decode(&call.params) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Undecodable ACSLS request (xid {:#x}): {}", call.xid, e);
                        return ProcedureResult::GarbageArgs;
                    }
                };
                debug!(
                    "ACSLS request packet {} command {} options {:#x}",
                    request.message.packet_id, request.message.command, request.message.options
                );

                let response = self.execute(&request);
                if self
                    .responses
                    .send(DeferredResponse::new(&request, &response))
                    .is_err()
                {
                    error!("Callback queue is closed; response to packet {} dropped", request.message.packet_id);
                }
                ProcedureResult::Success(Vec::new())
            }
            _ => ProcedureResult::ProcUnavail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{accepted_reply, AcceptStat};
    use crate::stk::constants::Command;
    use crate::stk::csi::tests::{request, sample_header};
    use crate::stk::library::tests::sample_library;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn drive(acs: u32, drive: u32) -> DriveId {
        DriveId {
            acs,
            lsm: 0,
            panel: 0,
            drive,
        }
    }

    fn mount_request(vol_id: &str, drives: Vec<DriveId>) -> CsiRequest {
        request(
            Command::Mount,
            0,
            CsiCommand::Mount {
                vol_id: vol_id.to_string(),
                drives,
            },
        )
    }

    fn dismount_request(vol_id: &str, options: u32) -> CsiRequest {
        request(
            Command::Dismount,
            options,
            CsiCommand::Dismount {
                vol_id: vol_id.to_string(),
                drive: drive(0, 0),
            },
        )
    }

    fn engine() -> (tempfile::TempDir, StkCsi, UnboundedReceiver<DeferredResponse>) {
        let (root, library) = sample_library();
        let (tx, rx) = mpsc::unbounded_channel();
        (root, StkCsi::new(library.into_shared(), tx), rx)
    }

    fn status(engine: &StkCsi, request: &CsiRequest) -> Status {
        engine.execute(request).body.status()
    }

    #[test]
    fn test_query_server() {
        let (_root, engine, _rx) = engine();
        let req = request(
            Command::Query,
            options::ACKNOWLEDGE,
            CsiCommand::Query {
                query_type: IdType::Server as u32,
                count: 0,
            },
        );
        let response = engine.execute(&req);
        assert_eq!(
            response.body,
            ResponseBody::Query {
                status: Status::Success,
                query_type: IdType::Server as u32,
                server: Some(ServerStatus {
                    state: ServerState::Run,
                    free_cells: 97,
                }),
            }
        );
        assert!(!response.message.has_option(options::ACKNOWLEDGE));
        assert_eq!(response.header, req.header);

        let req = request(
            Command::Query,
            0,
            CsiCommand::Query {
                query_type: IdType::Volume as u32,
                count: 0,
            },
        );
        assert_eq!(status(&engine, &req), Status::UnsupportedType);
    }

    #[test]
    fn test_mount_validation() {
        let (_root, engine, _rx) = engine();
        assert_eq!(status(&engine, &mount_request("TAPE01", vec![])), Status::CountTooSmall);
        assert_eq!(
            status(&engine, &mount_request("TAPE01", vec![drive(0, 0), drive(0, 1)])),
            Status::CountTooLarge
        );
        assert_eq!(
            status(&engine, &mount_request("TAPE01", vec![drive(1, 0)])),
            Status::AcsNotInLibrary
        );
        assert_eq!(
            status(&engine, &mount_request("NOSUCH", vec![drive(0, 0)])),
            Status::VolumeNotInLibrary
        );
    }

    #[test]
    fn test_mount_then_dismount() {
        let (_root, engine, _rx) = engine();
        let response = engine.execute(&mount_request("TAPE01", vec![drive(0, 0)]));
        assert_eq!(
            response.body,
            ResponseBody::Volume {
                status: Status::Success,
                vol_id: "TAPE01".to_string(),
                drive: drive(0, 0),
            }
        );
        assert_eq!(
            status(&engine, &mount_request("TAPE01", vec![drive(0, 1)])),
            Status::VolumeInUse
        );
        assert_eq!(
            status(&engine, &mount_request("SCR001", vec![drive(0, 0)])),
            Status::DriveInUse
        );

        assert_eq!(status(&engine, &dismount_request("SCR001", 0)), Status::VolumeNotInDrive);
        assert_eq!(
            status(&engine, &dismount_request("SCR001", options::FORCE)),
            Status::Success
        );
        assert_eq!(status(&engine, &dismount_request("TAPE01", 0)), Status::DriveAvailable);
    }

    #[test]
    fn test_unsupported_command() {
        let (_root, engine, _rx) = engine();
        let req = request(Command::Audit, 0, CsiCommand::Unsupported(Command::Audit as u32));
        let response = engine.execute(&req);
        assert_eq!(
            response.body,
            ResponseBody::Rejected {
                status: Status::InvalidCommand
            }
        );
        assert_eq!(response.message.command, Command::Audit as u32);
    }

    #[tokio::test]
    async fn test_procedures() {
        let (_root, engine, mut rx) = engine();

        let null = RpcCall::new(1, CSI_PROGRAM, CSI_VERSION, CSI_PROC_NULL, Vec::new());
        assert_eq!(engine.call_procedure(&null).await, ProcedureResult::Success(Vec::new()));

        let garbage = RpcCall::new(2, CSI_PROGRAM, CSI_VERSION, CSI_PROC_COMMAND, vec![0; 12]);
        assert_eq!(engine.call_procedure(&garbage).await, ProcedureResult::GarbageArgs);
        assert!(rx.try_recv().is_err());

        let other = RpcCall::new(3, CSI_PROGRAM, CSI_VERSION, 7, Vec::new());
        assert_eq!(engine.call_procedure(&other).await, ProcedureResult::ProcUnavail);

        let req = mount_request("SCR001", vec![drive(0, 3)]);
        let call = RpcCall::new(4, CSI_PROGRAM, CSI_VERSION, CSI_PROC_COMMAND, req.encode());
        assert_eq!(engine.call_procedure(&call).await, ProcedureResult::Success(Vec::new()));

        let deferred = rx.try_recv().unwrap();
        assert_eq!(deferred.state(), DeliveryState::Acknowledged);
        assert_eq!(deferred.status, Status::Success);
        assert_eq!(deferred.target, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(deferred.program, 0x20000001);
        assert_eq!(deferred.procedure, 1000);
        let response = CsiResponse::decode(&deferred.payload).unwrap();
        assert_eq!(response.body.status(), Status::Success);
        assert_eq!(response.message.packet_id, 42);
    }

    #[tokio::test]
    async fn test_deferred_response_is_called_back() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = client.local_addr().unwrap().port();

        let mut req = mount_request("SCR002", vec![drive(0, 0)]);
        req.header = sample_header(port);
        let (_root, engine, _rx) = engine();
        let response = engine.execute(&req);
        let mut deferred = DeferredResponse::new(&req, &response);

        let expected = deferred.payload.clone();
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, peer) = client.recv_from(&mut buf).await.unwrap();
            let call = RpcCall::decode(&buf[..len]).unwrap();
            client
                .send_to(&accepted_reply(call.xid, AcceptStat::Success, &[]), peer)
                .await
                .unwrap();
            call
        });

        let caller = RpcCaller::new(Duration::from_secs(2));
        assert!(deferred.deliver(&caller).await.is_success());
        assert_eq!(deferred.state(), DeliveryState::Delivered);

        let call = server.await.unwrap();
        assert_eq!((call.program, call.version, call.procedure), (0x20000001, 1, 1000));
        assert_eq!(call.params, expected);
    }

    #[tokio::test]
    async fn test_undeliverable_response_fails() {
        let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();

        let mut req = dismount_request("TAPE01", 0);
        req.header = sample_header(port);
        let (_root, engine, _rx) = engine();
        let mut deferred = DeferredResponse::new(&req, &engine.execute(&req));

        let caller = RpcCaller::new(Duration::from_millis(20));
        assert_eq!(deferred.deliver(&caller).await, CallResult::Timeout);
        assert_eq!(deferred.state(), DeliveryState::Failed);
    }
}
