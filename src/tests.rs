#[cfg(test)]
mod tests {
    use crate::error::RustStkError;
    use crate::xdr::XdrError;

    #[test]
    fn test_error_creation() {
        let rpc_error = RustStkError::rpc("no reply");
        assert!(matches!(rpc_error, RustStkError::Rpc(_)));

        let config_error = RustStkError::config("bad port");
        assert!(matches!(config_error, RustStkError::Config(_)));

        let xdr_error: RustStkError = XdrError::BadLength(7).into();
        assert!(matches!(xdr_error, RustStkError::Xdr(_)));
        assert!(xdr_error.to_string().starts_with("XDR error"));
    }
}

#[cfg(test)]
mod integration_tests {
    use std::fs;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpStream, UdpSocket};

    use crate::rpc::portmap::{
        decode_dump, PortMapper, PMAPPROC_DUMP, PMAPPROC_GETPORT, PMAP_PROG, PMAP_VERS,
    };
    use crate::rpc::{
        accepted_reply, AcceptStat, CallResult, Mapping, ProgramRegistry, Protocol, Registration,
        RpcCall, RpcCaller, UdpServer,
    };
    use crate::stk::catalog::load_catalog;
    use crate::stk::constants::{Command, Status, CSI_PROC_COMMAND, CSI_PROGRAM, CSI_VERSION};
    use crate::stk::csi::tests::{request, sample_header};
    use crate::stk::csi::{CsiCommand, CsiResponse, DriveId};
    use crate::stk::{CallbackDispatcher, Library, StkCsi, TapeServer};
    use crate::xdr::{XdrDecoder, XdrEncoder};

    const CATALOG: &str = r#"{
        "TAPE01": { "path": "tapes/tape01.img", "writeEnabled": false, "labeled": true }
    }"#;

    struct Emulator {
        _root: TempDir,
        portmapper: SocketAddr,
        tape_server: SocketAddr,
    }

    async fn start_emulator() -> Emulator {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("tapes")).unwrap();
        fs::write(root.path().join("tapes/tape01.img"), b"").unwrap();
        fs::write(root.path().join("catalog.json"), CATALOG).unwrap();

        let mut library = Library::new(root.path(), 10);
        library.merge_catalog(load_catalog(root.path().join("catalog.json")).unwrap());
        let library = library.into_shared();

        let caller = RpcCaller::new(Duration::from_secs(2));
        let registry = Arc::new(ProgramRegistry::new(None, caller.clone()));
        let localhost: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let portmapper = UdpServer::bind(Arc::clone(&registry), "portmapper", localhost)
            .await
            .unwrap();
        let portmapper_port = portmapper.local_port();
        registry.register_program(Registration::local(
            Arc::new(PortMapper::new(Arc::clone(&registry))),
            Some(portmapper_port),
            None,
        ));
        tokio::spawn(portmapper.run());

        let (dispatcher, responses) = CallbackDispatcher::new(caller);
        let csi = UdpServer::bind(Arc::clone(&registry), "CSI_ACSLM", localhost)
            .await
            .unwrap();
        registry.register_program(Registration::local(
            Arc::new(StkCsi::new(Arc::clone(&library), responses)),
            Some(csi.local_port()),
            None,
        ));
        tokio::spawn(csi.run());
        tokio::spawn(dispatcher.run());

        let tape_server = TapeServer::bind(localhost, library).await.unwrap();
        let tape_server_addr = tape_server.local_addr().unwrap();
        tokio::spawn(tape_server.run());

        Emulator {
            _root: root,
            portmapper: SocketAddr::from(([127, 0, 0, 1], portmapper_port)),
            tape_server: tape_server_addr,
        }
    }

    async fn csi_port(caller: &RpcCaller, portmapper: SocketAddr) -> u16 {
        let mut args = XdrEncoder::new();
        Mapping {
            program: CSI_PROGRAM,
            version: CSI_VERSION,
            protocol: Protocol::Udp,
            port: 0,
        }
        .encode(&mut args);
        match caller
            .call(portmapper, PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT, args.as_bytes())
            .await
        {
            CallResult::Success(body) => XdrDecoder::new(&body).extract_u32().unwrap() as u16,
            other => panic!("GETPORT failed: {}", other),
        }
    }

    /// Receive one callback on the client socket, acknowledge it, and decode it.
    async fn receive_callback(client: &UdpSocket) -> CsiResponse {
        let mut buf = vec![0u8; 8192];
        let (len, peer) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no callback arrived")
            .unwrap();
        let call = RpcCall::decode(&buf[..len]).unwrap();
        client
            .send_to(&accepted_reply(call.xid, AcceptStat::Success, &[]), peer)
            .await
            .unwrap();
        CsiResponse::decode(&call.params).unwrap()
    }

    #[tokio::test]
    async fn test_portmapper_dump_lists_both_programs() {
        let emulator = start_emulator().await;
        let caller = RpcCaller::new(Duration::from_secs(2));

        let body = match caller
            .call(emulator.portmapper, PMAP_PROG, PMAP_VERS, PMAPPROC_DUMP, &[])
            .await
        {
            CallResult::Success(body) => body,
            other => panic!("DUMP failed: {}", other),
        };
        let mappings = decode_dump(&body).unwrap();
        assert_eq!(mappings.len(), 2);
        assert!(mappings
            .iter()
            .any(|m| m.program == PMAP_PROG && m.port == emulator.portmapper.port()));
        let csi = mappings.iter().find(|m| m.program == CSI_PROGRAM).unwrap();
        assert_eq!(csi.protocol, Protocol::Udp);
        assert_eq!(csi.port, csi_port(&caller, emulator.portmapper).await);
    }

    #[tokio::test]
    async fn test_acsls_mount_then_tape_server() {
        let emulator = start_emulator().await;
        let caller = RpcCaller::new(Duration::from_secs(2));
        let csi = SocketAddr::from(([127, 0, 0, 1], csi_port(&caller, emulator.portmapper).await));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut mount = request(
            Command::Mount,
            0,
            CsiCommand::Mount {
                vol_id: "TAPE01".to_string(),
                drives: vec![DriveId::default()],
            },
        );
        mount.header = sample_header(client.local_addr().unwrap().port());

        // The request itself is acknowledged with an empty reply
        let ack = caller
            .call(csi, CSI_PROGRAM, CSI_VERSION, CSI_PROC_COMMAND, &mount.encode())
            .await;
        assert_eq!(ack, CallResult::Success(Vec::new()));

        let response = receive_callback(&client).await;
        assert_eq!(response.body.status(), Status::Success);
        assert_eq!(response.header.xid, mount.header.xid);
        assert_eq!(response.message.packet_id, mount.message.packet_id);

        let (read_half, mut writer) = TcpStream::connect(emulator.tape_server)
            .await
            .unwrap()
            .into_split();
        let mut lines = BufReader::new(read_half).lines();

        writer.write_all(b"REGISTER M0P0D0\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "200 M0P0D0 registered");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "101 TAPE01 mounted on M0P0D0 read-only"
        );

        writer.write_all(b"MOUNT TAPE01\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            format!("402 {} TAPE01 not mounted", Status::VolumeInDrive.code())
        );

        writer.write_all(b"DISMOUNT TAPE01\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "200 TAPE01 dismounted from M0P0D0"
        );

        // A second ACSLS dismount finds the drive empty
        let mut dismount = request(
            Command::Dismount,
            0,
            CsiCommand::Dismount {
                vol_id: "TAPE01".to_string(),
                drive: DriveId::default(),
            },
        );
        dismount.header = mount.header.clone();
        caller
            .call(csi, CSI_PROGRAM, CSI_VERSION, CSI_PROC_COMMAND, &dismount.encode())
            .await;
        let response = receive_callback(&client).await;
        assert_eq!(response.body.status(), Status::DriveAvailable);
    }

    #[tokio::test]
    async fn test_garbage_csi_request() {
        let emulator = start_emulator().await;
        let caller = RpcCaller::new(Duration::from_secs(2));
        let csi = SocketAddr::from(([127, 0, 0, 1], csi_port(&caller, emulator.portmapper).await));

        let result = caller
            .call(csi, CSI_PROGRAM, CSI_VERSION, CSI_PROC_COMMAND, &[0, 0, 0, 1])
            .await;
        assert_eq!(result, CallResult::GarbageArgs);
    }
}

#[cfg(test)]
mod cli_tests {
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn test_serve_parsing() {
        let args = vec![
            "ruststk",
            "--verbose",
            "serve",
            "--library-root",
            "/srv/tapes",
            "--csi-port",
            "5400",
            "--foreign-portmapper",
            "10.0.0.1",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.verbose);

        let overrides = cli.command.overrides().unwrap();
        assert_eq!(overrides.library_root, Some(PathBuf::from("/srv/tapes")));
        assert_eq!(overrides.csi_port, Some(5400));
        assert_eq!(overrides.tape_server_port, None);
        assert_eq!(overrides.foreign_portmapper.as_deref(), Some("10.0.0.1"));
        assert!(!overrides.no_portmapper);
    }

    #[test]
    fn test_rpcinfo_parsing() {
        let cli = Cli::try_parse_from(["ruststk", "rpcinfo"]).unwrap();
        if let Commands::Rpcinfo { host, timeout } = cli.command {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(timeout, 5);
        } else {
            panic!("expected rpcinfo");
        }
        assert!(Cli::try_parse_from(["ruststk", "serve", "--csi-port", "many"]).is_err());
        assert!(Cli::try_parse_from(["ruststk"]).is_err());
    }
}
