//! End-to-end verification: SCU echo against the full SCP stack.

use std::sync::Arc;
use std::time::Duration;

use dimse_net::codec::JsonCodec;
use dimse_net::config::{DimseConfig, RemoteNode};
use dimse_net::scp::{DimseScp, InMemoryDataSource};
use dimse_net::scu::ScuBuilder;
use dimse_net::transport::loopback::{LoopbackConnector, LoopbackHub};
use dimse_net::{uids, DimseError};

/// Opt-in test logging: DIMSE_NET_TEST_LOG=debug cargo test
fn init_logging() {
    if std::env::var("DIMSE_NET_TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("DIMSE_NET_TEST_LOG"))
            .try_init();
    }
}

fn scp_config() -> DimseConfig {
    DimseConfig {
        local_aet: "ECHO_SCP".to_string(),
        read_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn start_scp(config: DimseConfig) -> (LoopbackConnector, tokio::task::JoinHandle<()>) {
    let mut hub = LoopbackHub::new();
    let connector = hub.connector();
    let acceptor = Box::new(hub.acceptor());
    let scp = DimseScp::new(config, Arc::new(InMemoryDataSource::new())).unwrap();
    let handle = tokio::spawn(async move {
        let _ = scp.run(acceptor, Arc::new(JsonCodec)).await;
    });
    (connector, handle)
}

fn node() -> RemoteNode {
    RemoteNode::new("ECHO_SCP", "localhost", 11112)
}

#[tokio::test]
async fn echo_round_trip_succeeds() {
    init_logging();
    let (connector, scp) = start_scp(scp_config());

    let scu = ScuBuilder::new()
        .local_aet("ECHO_SCU")
        .read_timeout(Duration::from_secs(2))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap();

    assert!(scu.echo(&node()).await.unwrap());
    scp.abort();
}

#[tokio::test]
async fn echo_refused_when_service_disabled() {
    let config = DimseConfig {
        enable_echo: false,
        ..scp_config()
    };
    let (connector, scp) = start_scp(config);

    let scu = ScuBuilder::new()
        .local_aet("ECHO_SCU")
        .read_timeout(Duration::from_secs(2))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap();

    let result = scu.echo(&node()).await;
    match result {
        Err(DimseError::Refused { status, .. }) => assert_eq!(status.0, 0x0122),
        other => panic!("expected a refusal, got {:?}", other.map(|_| ())),
    }
    scp.abort();
}

#[tokio::test]
async fn echo_fails_without_verification_context() {
    // The acceptor only speaks query; verification is not negotiable
    let config = DimseConfig {
        allowed_abstract_syntaxes: vec![uids::STUDY_ROOT_QR_FIND.to_string()],
        ..scp_config()
    };
    let (connector, scp) = start_scp(config);

    let scu = ScuBuilder::new()
        .local_aet("ECHO_SCU")
        .read_timeout(Duration::from_secs(2))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap();

    let result = scu.echo(&node()).await;
    assert!(matches!(result, Err(DimseError::NoCommonContext)));
    scp.abort();
}

#[tokio::test]
async fn connection_test_succeeds_against_a_live_provider() {
    let (connector, scp) = start_scp(scp_config());

    let scu = ScuBuilder::new()
        .local_aet("ECHO_SCU")
        .read_timeout(Duration::from_secs(2))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap();

    assert!(scu.test_connection(&node(), 1).await.unwrap());
    scp.abort();
}

#[tokio::test]
async fn connection_test_gives_up_on_a_dead_hub() {
    let mut hub = LoopbackHub::new();
    let connector = hub.connector();
    // Nobody is accepting
    drop(hub.acceptor());

    let scu = ScuBuilder::new()
        .local_aet("ECHO_SCU")
        .read_timeout(Duration::from_millis(300))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap();

    assert!(scu.test_connection(&node(), 0).await.is_err());
}

#[tokio::test]
async fn echo_tolerates_unexpected_attached_record() {
    use dicom_core::VR;
    use dicom_dictionary_std::tags;
    use dimse_net::association::{ClientAssociation, PresentationContext, ServerAssociation};
    use dimse_net::channel::{DimseChannel, Expected, Received, ReceiveFlags};
    use dimse_net::record::Record;
    use dimse_net::transport::loopback;
    use dimse_net::types::{CommandSet, Status};
    use dimse_net::verbs;

    let (client_link, server_link) = loopback::pair();
    let server_params = scp_config().acceptor_params().unwrap();
    let mut server = ServerAssociation::new(Box::new(server_link), server_params, Arc::new(JsonCodec));

    let server_task = tokio::spawn(async move {
        server
            .receive_proposal(Duration::from_secs(2))
            .await
            .unwrap();
        server
            .accept(
                &[uids::VERIFICATION.to_string()],
                &[uids::IMPLICIT_VR_LE.to_string()],
            )
            .await
            .unwrap();

        let received = server
            .receive_command(
                Expected::Any,
                Duration::from_secs(2),
                ReceiveFlags::default(),
            )
            .await
            .unwrap();
        let Received::Command {
            context_id,
            command,
        } = received
        else {
            panic!("expected the echo request");
        };

        // Answer success, with a record nobody asked for
        let mut stray = Record::new();
        stray.put_str(tags::PATIENT_ID, VR::LO, "NOBODY");
        let response = CommandSet::response(&command, Status::SUCCESS);
        server
            .send_command(context_id, response, Some(&stray))
            .await
            .unwrap();
    });

    let params = scp_config()
        .initiator_params(&node())
        .unwrap();
    let mut client = ClientAssociation::new(params, Arc::new(JsonCodec));
    client
        .request(
            Box::new(client_link),
            vec![PresentationContext::new(
                uids::VERIFICATION,
                vec![uids::IMPLICIT_VR_LE.to_string()],
            )],
        )
        .await
        .unwrap();

    // The stray record is logged and ignored; verification still succeeds
    verbs::echo(&mut client).await.unwrap();
    server_task.await.unwrap();
}
