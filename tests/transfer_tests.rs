// Integration tests for dataset transfers against scripted hosts
mod common;

use common::{MockConnector, MockHost, dataset_listing, snapshot_listing};
use zmigrate::{Address, TransferEngine, TransferOutcome, ZmigrateConfig, ZmigrateError};

const DOMBLKLIST: &str = " Type   Device   Target   Source
------------------------------------------------
 file   disk     vda      /tank/vm/web.qcow2
 file   cdrom    sda      -
";

fn source_host() -> MockHost {
    let host = MockHost::new("hv1");
    host.respond(
        "-o name,mountpoint",
        &dataset_listing(&[("tank", "/tank"), ("tank/vm", "/tank/vm")]),
    )
    .respond("-d 1 tank/vm", &snapshot_listing("tank/vm", &["a", "b", "c"]));
    host
}

fn destination_host(labels: &[&str]) -> MockHost {
    let host = MockHost::new("hv2");
    host.respond(
        "-o name,mountpoint",
        &dataset_listing(&[("backup", "/backup"), ("backup/vm", "/backup/vm")]),
    )
    .respond("-d 1 backup/vm", &snapshot_listing("backup/vm", labels));
    host
}

fn connector(hosts: &[&MockHost]) -> MockConnector {
    let mut connector = MockConnector::new();
    for host in hosts {
        connector.add(host);
    }
    connector
}

fn endpoints() -> (Address, Address) {
    (
        Address::parse_source("hv1:tank/vm").unwrap(),
        Address::parse_destination("hv2:backup/vm").unwrap(),
    )
}

const SEND_OK: &str = "incremental\tb\ttank/vm@now\t4096
size\t4096
12:00:00\t2048\ttank/vm@now
12:00:01\t4096\ttank/vm@now
";

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, false, false).await.unwrap();

    assert_eq!(report.outcome, TransferOutcome::DryRun);
    assert!(report.success());
    let plan = report.plan.unwrap();
    assert_eq!(plan.source_dataset, "tank/vm");
    assert_eq!(plan.destination_dataset, "backup/vm");
    assert_eq!(plan.basis.as_deref(), Some("b"));
    assert!(report.snapshot.is_none());

    assert!(!hv1.ran("zfs snapshot"));
    assert!(!hv1.ran("zfs send"));
    assert!(!hv2.ran("zfs receive"));
}

#[tokio::test]
async fn test_dry_run_is_repeatable() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let first = engine.transfer(&source, &dest, false, false).await.unwrap();
    let after_first = (hv1.commands().len(), hv2.commands().len());
    let second = engine.transfer(&source, &dest, false, false).await.unwrap();

    assert_eq!(first.plan, second.plan);
    assert_eq!(hv1.commands().len(), after_first.0 * 2);
    assert_eq!(hv2.commands().len(), after_first.1 * 2);
}

#[tokio::test]
async fn test_incremental_from_newest_common_snapshot() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.stream("zfs send", SEND_OK, 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    assert_eq!(report.outcome, TransferOutcome::Completed);
    assert_eq!(report.bytes_total, Some(4096));
    assert_eq!(report.bytes_sent, 4096);

    let snapshot = report.snapshot.unwrap();
    assert!(snapshot.starts_with("tank/vm@zmigrate-"));
    assert!(hv1.ran(&format!("zfs snapshot {}", snapshot)));

    let pipeline = hv1.command_containing("zfs send").unwrap();
    assert!(pipeline.starts_with("bash -o pipefail -c "));
    assert!(pipeline.contains(&format!("zfs send -v -P -i @b {}", snapshot)));
    assert!(pipeline.contains("-- hv2 "));
    assert!(pipeline.contains("zfs receive backup/vm"));
    assert!(!pipeline.contains("receive -F"));

    // The pipeline runs on the source; the destination only plans.
    assert!(!hv2.ran("zfs receive"));
}

#[tokio::test]
async fn test_destination_without_common_snapshot_is_refused() {
    let (hv1, hv2) = (source_host(), destination_host(&["unrelated"]));
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    assert_eq!(report.outcome, TransferOutcome::DestinationConflict);
    assert!(!report.success());
    assert!(report.plan.unwrap().conflicts());
    assert!(!hv1.ran("zfs snapshot"));
    assert!(!hv1.ran("zfs send"));
}

#[tokio::test]
async fn test_force_replaces_unrelated_destination() {
    let (hv1, hv2) = (source_host(), destination_host(&["unrelated"]));
    hv1.stream("zfs send", "full\ttank/vm@now\t10\nsize\t10\n", 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, true, true).await.unwrap();

    assert_eq!(report.outcome, TransferOutcome::Completed);
    let pipeline = hv1.command_containing("zfs send").unwrap();
    assert!(!pipeline.contains(" -i "));
    assert!(pipeline.contains("zfs receive -F backup/vm"));
}

#[tokio::test]
async fn test_missing_destination_gets_full_stream() {
    let hv1 = source_host();
    let hv2 = MockHost::new("hv2");
    hv2.respond("-o name,mountpoint", &dataset_listing(&[("backup", "/backup")]));
    hv1.stream("zfs send", "full\ttank/vm@now\t10\nsize\t10\n", 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:tank/vm").unwrap();
    let dest = Address::parse_destination("hv2:backup/new").unwrap();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    let plan = report.plan.clone().unwrap();
    assert!(!plan.destination_exists);
    assert_eq!(plan.parent_exists, Some(true));
    assert_eq!(plan.basis, None);
    assert_eq!(report.outcome, TransferOutcome::Completed);
    assert!(
        hv1.command_containing("zfs send")
            .unwrap()
            .contains("zfs receive backup/new")
    );
    // Source history is only consulted when the destination exists.
    assert!(!hv1.ran("-t snapshot"));
}

#[tokio::test]
async fn test_failed_pipeline_reports_detail_and_keeps_snapshot() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.stream(
        "zfs send",
        "incremental\tb\ttank/vm@now\t4096\nsize\t4096\ncannot receive incremental stream: destination backup/vm has been modified\n",
        1,
    );
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    match &report.outcome {
        TransferOutcome::Failed { exit_code, detail } => {
            assert_eq!(*exit_code, 1);
            assert!(detail.contains("has been modified"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(report.snapshot.is_some());
    assert!(!hv1.ran("zfs destroy"));
}

#[tokio::test]
async fn test_broken_pipeline_channel_keeps_snapshot_name() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.break_spawn("zfs send");
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    match &report.outcome {
        TransferOutcome::Failed { exit_code, detail } => {
            assert_eq!(*exit_code, -1);
            assert!(detail.contains("control connection lost"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    let snapshot = report.snapshot.clone().unwrap();
    assert!(hv1.ran(&format!("zfs snapshot {}", snapshot)));
    assert!(!report.success());
    assert_eq!(hv1.opened(), hv1.closed());
}

#[tokio::test]
async fn test_back_to_back_transfers_take_distinct_snapshots() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.stream("zfs send", SEND_OK, 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let first = engine.transfer(&source, &dest, true, true).await.unwrap();
    let second = engine.transfer(&source, &dest, true, true).await.unwrap();

    assert_eq!(first.outcome, TransferOutcome::Completed);
    assert_eq!(second.outcome, TransferOutcome::Completed);
    assert_ne!(first.snapshot, second.snapshot);

    let created: Vec<String> = hv1
        .commands()
        .into_iter()
        .filter(|command| command.starts_with("zfs snapshot"))
        .collect();
    assert_eq!(created.len(), 2);
    assert_ne!(created[0], created[1]);
}

#[tokio::test]
async fn test_omitted_destination_name_uses_full_dataset_name() {
    let hv1 = MockHost::new("hv1");
    hv1.respond(
        "-o name,mountpoint",
        &dataset_listing(&[
            ("tank", "/tank"),
            ("tank/vm", "/tank/vm"),
            ("tank/vm/web", "/tank/vm/web"),
        ]),
    );
    let hv2 = MockHost::new("hv2");
    hv2.respond(
        "-o name,mountpoint",
        &dataset_listing(&[("tank", "/tank"), ("tank/vm", "/tank/vm")]),
    );
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:web").unwrap();
    let dest = Address::parse_destination("hv2").unwrap();

    let report = engine.transfer(&source, &dest, false, false).await.unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.source_dataset, "tank/vm/web");
    assert_eq!(plan.destination_dataset, "tank/vm/web");
    assert!(!plan.destination_exists);
    assert_eq!(plan.parent_exists, Some(true));
}

#[tokio::test]
async fn test_workload_without_file_disk_is_source_missing() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.respond(
        "domblklist",
        " Type   Device   Target   Source\n-----------------\n file   cdrom    sda      -\n",
    );
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:web").unwrap();
    let dest = Address::parse_destination("hv2:backup/vm").unwrap();

    let report = engine
        .transfer_workload(&source, &dest, true, false)
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        TransferOutcome::SourceMissing {
            name: "web".to_string()
        }
    );
    assert!(!hv1.ran("zfs snapshot"));
    assert_eq!(hv2.opened(), 0);
}

#[tokio::test]
async fn test_source_missing_is_an_outcome() {
    let (hv1, hv2) = (source_host(), destination_host(&[]));
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:nothere").unwrap();
    let dest = Address::parse_destination("hv2:backup/vm").unwrap();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    assert_eq!(
        report.outcome,
        TransferOutcome::SourceMissing {
            name: "nothere".to_string()
        }
    );
    assert_eq!(hv2.opened(), 0);
}

#[tokio::test]
async fn test_alternate_host_carries_data() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.stream("zfs send", SEND_OK, 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:tank/vm").unwrap();
    let dest = Address::parse_destination("hv2(192.168.1.5):backup/vm").unwrap();

    let report = engine.transfer(&source, &dest, true, false).await.unwrap();

    assert!(report.success());
    // Control commands still go to hv2.
    assert!(hv2.ran("-d 1 backup/vm"));
    let pipeline = hv1.command_containing("zfs send").unwrap();
    assert!(pipeline.contains("-- 192.168.1.5 "));
    assert!(!pipeline.contains("-- hv2 "));
}

#[tokio::test]
async fn test_transfer_workload_resolves_disk_dataset() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.respond("domblklist", DOMBLKLIST);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let source = Address::parse_source("hv1:web").unwrap();
    let dest = Address::parse_destination("hv2:backup/vm").unwrap();

    let report = engine
        .transfer_workload(&source, &dest, false, false)
        .await
        .unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.source_dataset, "tank/vm");
    assert_eq!(plan.basis.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_contexts_closed_on_every_path() {
    let (hv1, hv2) = (source_host(), destination_host(&["a", "b"]));
    hv1.stream("zfs send", SEND_OK, 0);
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    engine.transfer(&source, &dest, true, false).await.unwrap();
    assert!(hv1.opened() > 0);
    assert_eq!(hv1.opened(), hv1.closed());
    assert_eq!(hv2.opened(), hv2.closed());

    hv2.fail("-d 1 backup/vm", 1, "dataset is busy");
    let err = engine.transfer(&source, &dest, false, false).await.unwrap_err();
    assert!(matches!(err, ZmigrateError::CommandFailed { .. }));
    assert_eq!(hv1.opened(), hv1.closed());
    assert_eq!(hv2.opened(), hv2.closed());
}

#[tokio::test]
async fn test_unreachable_destination_is_transport_error() {
    let (hv1, hv2) = (source_host(), destination_host(&[]));
    hv2.refuse_connections();
    let connector = connector(&[&hv1, &hv2]);
    let config = ZmigrateConfig::default();
    let engine = TransferEngine::new(&connector, &config);
    let (source, dest) = endpoints();

    let err = engine.transfer(&source, &dest, false, false).await.unwrap_err();
    assert!(matches!(err, ZmigrateError::Transport { .. }));
    assert_eq!(hv1.opened(), hv1.closed());
}
