//! End-to-end object creation and modification (N-CREATE / N-SET).

use std::sync::Arc;
use std::time::Duration;

use dicom_core::VR;
use dicom_dictionary_std::tags;
use dimse_net::codec::JsonCodec;
use dimse_net::config::{DimseConfig, RemoteNode};
use dimse_net::record::Record;
use dimse_net::scp::{DataSource, DimseScp, InMemoryDataSource};
use dimse_net::scu::ScuBuilder;
use dimse_net::transport::loopback::{LoopbackConnector, LoopbackHub};
use dimse_net::types::Status;
use dimse_net::{DimseError, DimseScu};

/// Modality performed procedure step, the classic N-CREATE/N-SET target
const MPPS: &str = "1.2.840.10008.3.1.2.3.3";

fn scp_config() -> DimseConfig {
    DimseConfig {
        local_aet: "OBJECT_SCP".to_string(),
        read_timeout_ms: 2_000,
        allowed_abstract_syntaxes: vec![MPPS.to_string()],
        ..Default::default()
    }
}

fn start_scp(
    source: Arc<InMemoryDataSource>,
    config: DimseConfig,
) -> (LoopbackConnector, tokio::task::JoinHandle<()>) {
    let mut hub = LoopbackHub::new();
    let connector = hub.connector();
    let acceptor = Box::new(hub.acceptor());
    let scp = DimseScp::new(config, source).unwrap();
    let handle = tokio::spawn(async move {
        let _ = scp.run(acceptor, Arc::new(JsonCodec)).await;
    });
    (connector, handle)
}

fn scu(connector: LoopbackConnector) -> DimseScu {
    ScuBuilder::new()
        .local_aet("OBJECT_SCU")
        .read_timeout(Duration::from_secs(2))
        .build(Arc::new(connector), Arc::new(JsonCodec))
        .unwrap()
}

fn node() -> RemoteNode {
    RemoteNode::new("OBJECT_SCP", "localhost", 11112)
}

fn procedure_attributes(status: &str) -> Record {
    let mut record = Record::new();
    record.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS, status);
    record.put_str(tags::PATIENT_ID, VR::LO, "PAT001");
    record
}

#[tokio::test]
async fn create_with_peer_assigned_uid() {
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source.clone(), scp_config());

    let outcome = scu(connector)
        .n_create(&node(), MPPS, None, Some(&procedure_attributes("IN PROGRESS")))
        .await
        .unwrap();

    assert_eq!(outcome.status, Status::SUCCESS);
    let uid = outcome.instance_uid.unwrap();
    assert!(uid.starts_with("2.25."), "{}", uid);

    // The response carries the server-chosen attribute record
    let attributes = outcome.attributes.unwrap();
    assert_eq!(attributes.sop_instance_uid(), Some(uid.as_str()));
    assert_eq!(
        attributes.first_str(tags::PERFORMED_PROCEDURE_STEP_STATUS),
        Some("IN PROGRESS")
    );

    assert_eq!(source.count().await.unwrap(), 1);
    assert_eq!(
        source.record_at(0).await.unwrap().sop_instance_uid(),
        Some(uid.as_str())
    );
    scp.abort();
}

#[tokio::test]
async fn create_with_requester_assigned_uid() {
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source.clone(), scp_config());

    let outcome = scu(connector)
        .n_create(
            &node(),
            MPPS,
            Some("1.2.3.77"),
            Some(&procedure_attributes("IN PROGRESS")),
        )
        .await
        .unwrap();

    assert_eq!(outcome.instance_uid.as_deref(), Some("1.2.3.77"));
    assert_eq!(
        source.record_at(0).await.unwrap().sop_instance_uid(),
        Some("1.2.3.77")
    );
    scp.abort();
}

#[tokio::test]
async fn duplicate_create_is_refused() {
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source.clone(), scp_config());
    let scu = scu(connector);

    scu.n_create(&node(), MPPS, Some("1.2.3.88"), None)
        .await
        .unwrap();
    let result = scu.n_create(&node(), MPPS, Some("1.2.3.88"), None).await;

    match result {
        Err(DimseError::Refused { status, message }) => {
            assert_eq!(status.0, 0x0111);
            assert!(message.contains("duplicate"));
        }
        other => panic!("expected a duplicate refusal, got {:?}", other.map(|_| ())),
    }
    assert_eq!(source.count().await.unwrap(), 1);
    scp.abort();
}

#[tokio::test]
async fn modify_merges_attributes() {
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source.clone(), scp_config());
    let scu = scu(connector);

    let created = scu
        .n_create(
            &node(),
            MPPS,
            None,
            Some(&procedure_attributes("IN PROGRESS")),
        )
        .await
        .unwrap();
    let uid = created.instance_uid.unwrap();

    let mut changes = Record::new();
    changes.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS, "COMPLETED");
    let outcome = scu.n_set(&node(), MPPS, &uid, &changes).await.unwrap();

    assert_eq!(outcome.status, Status::SUCCESS);
    let attributes = outcome.attributes.unwrap();
    assert_eq!(
        attributes.first_str(tags::PERFORMED_PROCEDURE_STEP_STATUS),
        Some("COMPLETED")
    );
    // Untouched attributes survive the merge
    assert_eq!(attributes.first_str(tags::PATIENT_ID), Some("PAT001"));

    let stored = source.record_at(0).await.unwrap();
    assert_eq!(
        stored.first_str(tags::PERFORMED_PROCEDURE_STEP_STATUS),
        Some("COMPLETED")
    );
    scp.abort();
}

#[tokio::test]
async fn modify_unknown_instance_is_refused() {
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source, scp_config());

    let mut changes = Record::new();
    changes.put_str(tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS, "COMPLETED");
    let result = scu(connector)
        .n_set(&node(), MPPS, "9.9.9.9", &changes)
        .await;

    match result {
        Err(DimseError::Refused { status, message }) => {
            assert_eq!(status.0, 0x0112);
            assert!(message.contains("no such SOP instance"));
        }
        other => panic!("expected a refusal, got {:?}", other.map(|_| ())),
    }
    scp.abort();
}

#[tokio::test]
async fn object_services_can_be_disabled() {
    let config = DimseConfig {
        enable_object: false,
        ..scp_config()
    };
    let source = Arc::new(InMemoryDataSource::new());
    let (connector, scp) = start_scp(source.clone(), config);

    let result = scu(connector).n_create(&node(), MPPS, None, None).await;
    match result {
        Err(DimseError::Refused { status, .. }) => assert_eq!(status.0, 0x0122),
        other => panic!("expected a refusal, got {:?}", other.map(|_| ())),
    }
    assert_eq!(source.count().await.unwrap(), 0);
    scp.abort();
}
