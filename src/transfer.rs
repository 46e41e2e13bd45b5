use crate::{
    Result, ZmigrateError,
    address::Address,
    config::ZmigrateConfig,
    dataset::{DatasetId, DatasetResolver},
    exec::{
        Connector, DiagnosticLines, ExecutionContext, OutputStream, SpawnedCommand, close_after,
        shell_quote, ssh_prefix,
    },
    log_debug, log_info, log_warn,
    progress::{ProgressParser, SendLine},
    report::{TransferOutcome, TransferPlan, TransferReport},
    snapshot::SnapshotHistory,
    virsh::WorkloadControl,
    zfs::{Zfs, parent_dataset},
};
use chrono::{DateTime, Utc};

/// Label for the snapshot taken at the start of an executed transfer.
///
/// `tag` distinguishes labels created within the same second.
pub fn snapshot_label(prefix: &str, now: DateTime<Utc>, tag: &str) -> String {
    format!("{}-{}-{}", prefix, now.format("%Y%m%d-%H%M%S"), tag)
}

fn fresh_label(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    snapshot_label(prefix, Utc::now(), &id[..8])
}

/// One streamed send/receive between two hosts.
///
/// Contexts are opened from the connector per step: source resolution,
/// destination planning, then the send pipeline on the source.
pub struct TransferEngine<'a> {
    connector: &'a dyn Connector,
    config: &'a ZmigrateConfig,
    zfs: Zfs,
    resolver: DatasetResolver,
    history: SnapshotHistory,
    control: WorkloadControl,
}

impl<'a> TransferEngine<'a> {
    pub fn new(connector: &'a dyn Connector, config: &'a ZmigrateConfig) -> Self {
        let zfs = Zfs::new(&config.zfs);
        Self {
            connector,
            config,
            resolver: DatasetResolver::new(zfs.clone()),
            history: SnapshotHistory::new(zfs.clone()),
            control: WorkloadControl::new(&config.virsh),
            zfs,
        }
    }

    pub fn resolver(&self) -> &DatasetResolver {
        &self.resolver
    }

    /// Transfer the dataset named by `source`'s attribute.
    pub async fn transfer(
        &self,
        source: &Address,
        destination: &Address,
        execute: bool,
        force: bool,
    ) -> Result<TransferReport> {
        check_endpoints(source, destination)?;
        let name = required_attribute(source)?;
        log_info!("Resolving source dataset '{}' on {}", name, source.host_label());

        let ctx = self.connector.open(source).await?;
        let found = self.resolver.by_name(&*ctx, name).await;
        let entry = close_after(ctx, found).await?;

        match entry {
            Some(entry) => {
                let dataset_source = source.with_attribute(entry.id.as_str());
                self.transfer_dataset(&dataset_source, &entry.id, destination, execute, force)
                    .await
            }
            None => Ok(missing_source(source, destination, name)),
        }
    }

    /// Transfer the dataset holding `source` domain's primary disk.
    pub async fn transfer_workload(
        &self,
        source: &Address,
        destination: &Address,
        execute: bool,
        force: bool,
    ) -> Result<TransferReport> {
        check_endpoints(source, destination)?;
        let domain = required_attribute(source)?;
        log_info!("Resolving storage of workload '{}' on {}", domain, source.host_label());

        let ctx = self.connector.open(source).await?;
        let found = self
            .resolver
            .by_workload_disk(&*ctx, &self.control, domain)
            .await;
        let entry = close_after(ctx, found).await?;

        match entry {
            Some(entry) => {
                let dataset_source = source.with_attribute(entry.id.as_str());
                self.transfer_dataset(&dataset_source, &entry.id, destination, execute, force)
                    .await
            }
            None => Ok(missing_source(source, destination, domain)),
        }
    }

    /// Transfer an already-resolved source dataset.
    ///
    /// The destination name falls back to the source dataset's full name.
    pub async fn transfer_dataset(
        &self,
        source: &Address,
        source_dataset: &DatasetId,
        destination: &Address,
        execute: bool,
        force: bool,
    ) -> Result<TransferReport> {
        check_endpoints(source, destination)?;

        let dest_name = destination.attribute().unwrap_or(source_dataset.as_str());

        let ctx = self.connector.open(destination).await?;
        let planned = self
            .plan(&*ctx, source, source_dataset, dest_name, force)
            .await;
        let plan = close_after(ctx, planned).await?;

        log_plan(&plan, destination);

        let mut report = TransferReport {
            source: source.to_string(),
            destination: destination.to_string(),
            plan: Some(plan.clone()),
            snapshot: None,
            bytes_total: None,
            bytes_sent: 0,
            outcome: TransferOutcome::DryRun,
        };

        if !execute {
            return Ok(report);
        }

        if plan.conflicts() {
            log_warn!(
                "Refusing to overwrite {} without a common snapshot",
                plan.destination_dataset
            );
            report.outcome = TransferOutcome::DestinationConflict;
            return Ok(report);
        }

        let ctx = self.connector.open(source).await?;
        let streamed = self.stream(&*ctx, destination, &plan, &mut report).await;
        close_after(ctx, streamed).await?;

        Ok(report)
    }

    async fn plan(
        &self,
        dest_ctx: &dyn ExecutionContext,
        source: &Address,
        source_dataset: &DatasetId,
        dest_name: &str,
        force: bool,
    ) -> Result<TransferPlan> {
        match self.resolver.by_name(dest_ctx, dest_name).await? {
            Some(entry) => {
                let basis = self
                    .history
                    .latest_common(dest_ctx, self.connector, source, source_dataset, &entry.id)
                    .await?;
                Ok(TransferPlan {
                    source_dataset: source_dataset.to_string(),
                    destination_dataset: entry.id.to_string(),
                    destination_exists: true,
                    parent_exists: None,
                    basis,
                    force,
                })
            }
            None => {
                let parent_exists = match parent_dataset(dest_name) {
                    Some(parent) => self.resolver.by_exact_name(dest_ctx, parent).await?.is_some(),
                    None => false,
                };
                Ok(TransferPlan {
                    source_dataset: source_dataset.to_string(),
                    destination_dataset: dest_name.to_string(),
                    destination_exists: false,
                    parent_exists: Some(parent_exists),
                    basis: None,
                    force,
                })
            }
        }
    }

    async fn stream(
        &self,
        ctx: &dyn ExecutionContext,
        destination: &Address,
        plan: &TransferPlan,
        report: &mut TransferReport,
    ) -> Result<()> {
        let mut parser = ProgressParser::new()?;
        let label = fresh_label(&self.config.zfs.snapshot_prefix);
        ctx.checked(&self.zfs.snapshot(&plan.source_dataset, &label))
            .await?;
        let snapshot = format!("{}@{}", plan.source_dataset, label);
        log_info!("Created snapshot {} on {}", snapshot, ctx.host());
        report.snapshot = Some(snapshot);

        let command = self.pipeline_command(plan, &label, destination);
        log_debug!("[{}] $ {}", ctx.host(), command);

        // Past this point the snapshot exists, so failures become outcomes.
        let piped = run_pipeline(ctx, &command, &mut parser).await;
        report.bytes_total = parser.total_bytes();
        report.bytes_sent = parser.bytes_sent();
        report.outcome = match piped {
            Ok(0) => {
                log_info!(
                    "Transfer to {} completed ({} bytes)",
                    plan.destination_dataset,
                    parser.bytes_sent()
                );
                TransferOutcome::Completed
            }
            Ok(exit_code) => {
                let detail = parser.failure_detail().unwrap_or_default();
                log_warn!("Transfer pipeline exited with {}: {}", exit_code, detail);
                TransferOutcome::Failed { exit_code, detail }
            }
            Err(e) => {
                let detail = ZmigrateError::transport(ctx.host(), e).to_string();
                log_warn!("Transfer pipeline broke off: {}", detail);
                TransferOutcome::Failed {
                    exit_code: -1,
                    detail,
                }
            }
        };
        Ok(())
    }

    /// Shell pipeline run on the source host: send piped into receive,
    /// over ssh to the destination's data host when it is remote.
    pub fn pipeline_command(&self, plan: &TransferPlan, label: &str, destination: &Address) -> String {
        let send = self
            .zfs
            .send(&plan.source_dataset, plan.basis.as_deref(), label);
        let receive = self.zfs.receive(&plan.destination_dataset, plan.force);
        let receive = match destination.data_host() {
            Some(host) => format!(
                "{} {}",
                ssh_prefix(&self.config.ssh, host, destination.port),
                shell_quote(&receive)
            ),
            None => receive,
        };
        format!(
            "bash -o pipefail -c {}",
            shell_quote(&format!("{} | {}", send, receive))
        )
    }
}

/// The pipeline runs on the source host, so it cannot reach a destination
/// that is only "local" to this machine.
fn check_endpoints(source: &Address, destination: &Address) -> Result<()> {
    if destination.is_local() && !source.is_local() {
        return Err(ZmigrateError::InvalidAddress {
            input: destination.to_string(),
            reason: "a local destination requires a local source".to_string(),
        });
    }
    Ok(())
}

fn required_attribute(address: &Address) -> Result<&str> {
    address.attribute().ok_or_else(|| ZmigrateError::InvalidAddress {
        input: address.to_string(),
        reason: "missing attribute".to_string(),
    })
}

fn missing_source(source: &Address, destination: &Address, name: &str) -> TransferReport {
    log_warn!("No dataset found for '{}' on {}", name, source.host_label());
    TransferReport {
        source: source.to_string(),
        destination: destination.to_string(),
        plan: None,
        snapshot: None,
        bytes_total: None,
        bytes_sent: 0,
        outcome: TransferOutcome::SourceMissing {
            name: name.to_string(),
        },
    }
}

fn log_plan(plan: &TransferPlan, destination: &Address) {
    if plan.destination_exists {
        match &plan.basis {
            Some(basis) => log_info!(
                "{} exists on {}, incremental from @{}",
                plan.destination_dataset,
                destination.host_label(),
                basis
            ),
            None => log_info!(
                "{} exists on {} with no common snapshot",
                plan.destination_dataset,
                destination.host_label()
            ),
        }
    } else {
        log_info!(
            "{} does not exist on {}; parent {}",
            plan.destination_dataset,
            destination.host_label(),
            if plan.parent_exists == Some(true) { "exists" } else { "is missing" }
        );
    }
}

async fn run_pipeline(
    ctx: &dyn ExecutionContext,
    command: &str,
    parser: &mut ProgressParser,
) -> std::io::Result<i32> {
    let SpawnedCommand {
        stdout,
        stderr,
        mut exit,
    } = ctx.spawn(command).await?;
    let (watched, drained) = tokio::join!(watch_progress(stderr, parser), drain(stdout));
    let exit_code = exit.wait().await?;
    watched?;
    drained?;
    Ok(exit_code)
}

async fn watch_progress(stream: OutputStream, parser: &mut ProgressParser) -> std::io::Result<()> {
    let mut lines = DiagnosticLines::new(stream);
    let mut last_percent = None;
    while let Some(line) = lines.next_line().await? {
        match parser.feed(&line) {
            SendLine::TotalSize(bytes) => log_info!("Estimated stream size: {} bytes", bytes),
            SendLine::Progress(_) => {
                let percent = parser.percent();
                if percent.is_some() && percent != last_percent {
                    log_info!(
                        "Progress: {}% ({} bytes)",
                        percent.unwrap_or_default(),
                        parser.bytes_sent()
                    );
                    last_percent = percent;
                }
            }
            SendLine::Candidate(line) => log_debug!("send: {}", line),
            SendLine::Header => {}
        }
    }
    Ok(())
}

/// The receive side prints nothing useful, but an unread pipe would stall it.
async fn drain(mut stream: OutputStream) -> std::io::Result<u64> {
    tokio::io::copy(&mut stream, &mut tokio::io::sink()).await
}
