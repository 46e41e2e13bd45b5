use crate::{
    Result, ZmigrateError,
    address::Address,
    config::ZmigrateConfig,
    dataset::DatasetEntry,
    exec::{Connector, ExecutionContext, close_after},
    log_debug, log_error, log_info, log_warn,
    report::TransferReport,
    transfer::TransferEngine,
    virsh::{RelocationResult, WorkloadControl, rewrite_disk_path},
    workload::{Ownership, WorkloadState},
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationPhase {
    ValidateRunning,
    PreCopy,
    CaptureOwnership,
    DisableAutostart,
    RewriteDefinitionIfAsymmetric,
    SuspendAndRelocate,
    FinalDelta,
    FixDestinationOwnership,
    Resume,
    EnableAutostart,
}

impl MigrationPhase {
    /// Phases from here on run after the point of no return.
    pub fn is_post_relocation(&self) -> bool {
        matches!(
            self,
            MigrationPhase::FinalDelta
                | MigrationPhase::FixDestinationOwnership
                | MigrationPhase::Resume
                | MigrationPhase::EnableAutostart
        )
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::ValidateRunning => "validate-running",
            MigrationPhase::PreCopy => "pre-copy",
            MigrationPhase::CaptureOwnership => "capture-ownership",
            MigrationPhase::DisableAutostart => "disable-autostart",
            MigrationPhase::RewriteDefinitionIfAsymmetric => "rewrite-definition",
            MigrationPhase::SuspendAndRelocate => "suspend-and-relocate",
            MigrationPhase::FinalDelta => "final-delta",
            MigrationPhase::FixDestinationOwnership => "fix-destination-ownership",
            MigrationPhase::Resume => "resume",
            MigrationPhase::EnableAutostart => "enable-autostart",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationStatus {
    InProgress,
    /// Dry run finished; nothing was mutated.
    Planned,
    Completed,
    Aborted { phase: MigrationPhase, reason: String },
}

/// In-memory record of one relocation, also the report returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationJob {
    pub job_id: String,
    pub domain: String,
    pub source_host: String,
    pub destination_host: String,
    pub execute: bool,
    pub phases: Vec<MigrationPhase>,
    pub status: MigrationStatus,
    pub source_disk: Option<PathBuf>,
    pub source_dataset: Option<String>,
    pub destination_disk: Option<PathBuf>,
    pub definition_rewritten: bool,
    pub ownership: Option<Ownership>,
    pub pre_copy: Option<TransferReport>,
    pub final_delta: Option<TransferReport>,
    /// Best-effort failures after relocation.
    pub warnings: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MigrationJob {
    fn new(domain: &str, source: &Address, destination: &Address, execute: bool) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            source_host: source.host_label().to_string(),
            destination_host: destination.host_label().to_string(),
            execute,
            phases: Vec::new(),
            status: MigrationStatus::InProgress,
            source_disk: None,
            source_dataset: None,
            destination_disk: None,
            definition_rewritten: false,
            ownership: None,
            pre_copy: None,
            final_delta: None,
            warnings: Vec::new(),
            started_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Completed | MigrationStatus::Planned
        )
    }

    pub fn reached(&self, phase: MigrationPhase) -> bool {
        self.phases.contains(&phase)
    }

    fn enter(&mut self, phase: MigrationPhase) {
        log_info!("[{}] {} -> {}", self.domain, self.job_id, phase);
        self.phases.push(phase);
    }

    fn current_phase(&self) -> MigrationPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(MigrationPhase::ValidateRunning)
    }

    fn abort(mut self, reason: impl Into<String>) -> Self {
        let phase = self.current_phase();
        let reason = reason.into();
        log_error!("Migration of '{}' aborted in {}: {}", self.domain, phase, reason);
        self.status = MigrationStatus::Aborted { phase, reason };
        self.completed_at = Some(chrono::Utc::now());
        self
    }

    fn warn(&mut self, error: impl fmt::Display) {
        let message = format!("{}: {}", self.current_phase(), error);
        log_warn!("{}", message);
        self.warnings.push(message);
    }

    fn finish(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self.completed_at = Some(chrono::Utc::now());
        self
    }
}

impl fmt::Display for MigrationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration {} of '{}': {} -> {}{}",
            self.job_id,
            self.domain,
            self.source_host,
            self.destination_host,
            if self.execute { "" } else { " (dry run)" }
        )?;
        if let Some(dataset) = &self.source_dataset {
            writeln!(f, "  source dataset:   {}", dataset)?;
        }
        if let Some(disk) = &self.source_disk {
            writeln!(f, "  source disk:      {}", disk.display())?;
        }
        match &self.destination_disk {
            Some(disk) => writeln!(f, "  destination disk: {}", disk.display())?,
            None if self.source_disk.is_some() => {
                writeln!(f, "  destination disk: known once the dataset exists")?
            }
            None => {}
        }
        if self.definition_rewritten {
            writeln!(f, "  definition:       storage path rewritten")?;
        }
        if let Some(owner) = &self.ownership {
            writeln!(f, "  disk owner:       {}", owner)?;
        }
        if let Some(report) = &self.pre_copy {
            writeln!(f, "  pre-copy:         {}", report.outcome)?;
        }
        if let Some(report) = &self.final_delta {
            writeln!(f, "  final delta:      {}", report.outcome)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning:          {}", warning)?;
        }
        match &self.status {
            MigrationStatus::InProgress => write!(f, "  result:           in progress"),
            MigrationStatus::Planned => write!(f, "  result:           planned, nothing changed"),
            MigrationStatus::Completed => write!(f, "  result:           completed"),
            MigrationStatus::Aborted { phase, reason } => {
                write!(f, "  result:           aborted in {}: {}", phase, reason)
            }
        }
    }
}

/// Sequences a live relocation: pre-copy, suspend and relocate, final
/// delta, resume. Nothing on either host is mutated until the pre-copy has
/// succeeded; nothing after relocation can undo it. Every step opens and
/// closes its own context.
pub struct MigrationCoordinator<'a> {
    connector: &'a dyn Connector,
    engine: TransferEngine<'a>,
    control: WorkloadControl,
}

impl<'a> MigrationCoordinator<'a> {
    pub fn new(connector: &'a dyn Connector, config: &'a ZmigrateConfig) -> Self {
        Self {
            connector,
            engine: TransferEngine::new(connector, config),
            control: WorkloadControl::new(&config.virsh),
        }
    }

    /// `source` names the domain; `destination`'s attribute, if any, names the receiving dataset.
    pub async fn migrate(
        &self,
        source: &Address,
        destination: &Address,
        execute: bool,
        force: bool,
    ) -> Result<MigrationJob> {
        let domain = source.attribute().ok_or_else(|| ZmigrateError::InvalidAddress {
            input: source.to_string(),
            reason: "missing domain name".to_string(),
        })?;
        if destination.is_local() {
            return Err(ZmigrateError::InvalidAddress {
                input: destination.to_string(),
                reason: "migration needs a destination host".to_string(),
            });
        }

        log_info!(
            "Starting migration of '{}' from {} to {}",
            domain,
            source.host_label(),
            destination.host_label()
        );
        let mut job = MigrationJob::new(domain, source, destination, execute);

        job.enter(MigrationPhase::ValidateRunning);
        match self.workload_state(source, domain).await {
            Ok(state) if state.is_running() => {}
            Ok(state) => return Ok(job.abort(format!("workload is {}, not running", state))),
            Err(e) => return Ok(job.abort(e.to_string())),
        }

        job.enter(MigrationPhase::PreCopy);
        let (disk, source_entry) = match self.locate_storage(source, domain).await {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(job.abort("no dataset holds the workload's primary disk")),
            Err(e) => return Ok(job.abort(e.to_string())),
        };
        job.source_disk = Some(disk.clone());
        job.source_dataset = Some(source_entry.id.to_string());

        let dataset_source = source.with_attribute(source_entry.id.as_str());
        match self
            .engine
            .transfer_dataset(&dataset_source, &source_entry.id, destination, execute, force)
            .await
        {
            Ok(report) if report.success() => job.pre_copy = Some(report),
            Ok(report) => {
                let reason = format!("pre-copy: {}", report.outcome);
                job.pre_copy = Some(report);
                return Ok(job.abort(reason));
            }
            Err(e) => return Ok(job.abort(format!("pre-copy: {}", e))),
        }

        job.enter(MigrationPhase::CaptureOwnership);
        match self.disk_owner(source, &disk).await {
            Ok(owner) => job.ownership = Some(owner),
            Err(e) => return Ok(job.abort(e.to_string())),
        }

        let destination_dataset = job
            .pre_copy
            .as_ref()
            .and_then(|report| report.plan.as_ref())
            .map(|plan| plan.destination_dataset.clone())
            .unwrap_or_else(|| source_entry.id.to_string());
        match self
            .destination_disk(destination, &destination_dataset, &disk)
            .await
        {
            Ok(found) => job.destination_disk = found,
            Err(e) => return Ok(job.abort(e.to_string())),
        }

        if !execute {
            job.definition_rewritten = job
                .destination_disk
                .as_ref()
                .is_some_and(|dest_disk| dest_disk != &disk);
            log_info!("Dry run for '{}' complete, no workload changes made", domain);
            return Ok(job.finish(MigrationStatus::Planned));
        }

        let Some(destination_disk) = job.destination_disk.clone() else {
            return Ok(job.abort(format!(
                "destination dataset {} has no mount point",
                destination_dataset
            )));
        };

        job.enter(MigrationPhase::DisableAutostart);
        if let Err(e) = self.set_autostart(source, domain, false).await {
            return Ok(job.abort(e.to_string()));
        }

        let staged = if destination_disk != disk {
            job.enter(MigrationPhase::RewriteDefinitionIfAsymmetric);
            match self
                .stage_rewritten(source, domain, &disk, &destination_disk)
                .await
            {
                Ok(path) => {
                    job.definition_rewritten = true;
                    Some(path)
                }
                Err(e) => return Ok(job.abort(e.to_string())),
            }
        } else {
            None
        };

        job.enter(MigrationPhase::SuspendAndRelocate);
        match self
            .relocate(source, domain, destination, staged.as_deref())
            .await
        {
            Ok(result) if result.success() => {}
            Ok(result) => {
                let detail = result.diagnostics.last().cloned().unwrap_or_default();
                return Ok(job.abort(format!(
                    "relocation exited with {}{}{}",
                    result.exit_code,
                    if detail.is_empty() { "" } else { ": " },
                    detail
                )));
            }
            Err(e) => return Ok(job.abort(e.to_string())),
        }

        // Point of no return: the workload now lives on the destination.
        job.enter(MigrationPhase::FinalDelta);
        match self
            .engine
            .transfer_dataset(&dataset_source, &source_entry.id, destination, true, true)
            .await
        {
            Ok(report) => {
                if !report.success() {
                    job.warn(&report.outcome);
                }
                job.final_delta = Some(report);
            }
            Err(e) => job.warn(e),
        }

        job.enter(MigrationPhase::FixDestinationOwnership);
        if let Some(owner) = job.ownership {
            if let Err(e) = self.set_disk_owner(destination, &destination_disk, owner).await {
                job.warn(e);
            }
        }

        job.enter(MigrationPhase::Resume);
        if let Err(e) = self.resume(destination, domain).await {
            log_error!(
                "'{}' did not resume on {}: {}",
                domain,
                destination.host_label(),
                e
            );
            return Ok(job.finish(MigrationStatus::Aborted {
                phase: MigrationPhase::Resume,
                reason: format!("resume failed: {}", e),
            }));
        }

        job.enter(MigrationPhase::EnableAutostart);
        if let Err(e) = self.set_autostart(destination, domain, true).await {
            job.warn(e);
        }

        log_info!(
            "Migration of '{}' to {} completed",
            domain,
            destination.host_label()
        );
        Ok(job.finish(MigrationStatus::Completed))
    }

    async fn workload_state(&self, address: &Address, domain: &str) -> Result<WorkloadState> {
        let ctx = self.connector.open(address).await?;
        let state = self.control.state(&*ctx, domain).await;
        close_after(ctx, state).await
    }

    async fn locate_storage(
        &self,
        source: &Address,
        domain: &str,
    ) -> Result<Option<(PathBuf, DatasetEntry)>> {
        let ctx = self.connector.open(source).await?;
        let located = self.find_storage(&*ctx, domain).await;
        close_after(ctx, located).await
    }

    async fn find_storage(
        &self,
        ctx: &dyn ExecutionContext,
        domain: &str,
    ) -> Result<Option<(PathBuf, DatasetEntry)>> {
        let Some(disk) = self.control.primary_disk(ctx, domain).await? else {
            return Ok(None);
        };
        let entry = self.engine.resolver().by_mount_point(ctx, &disk).await?;
        Ok(entry.map(|entry| (disk, entry)))
    }

    async fn disk_owner(&self, address: &Address, disk: &Path) -> Result<Ownership> {
        let ctx = self.connector.open(address).await?;
        let owner = self.control.disk_owner(&*ctx, disk).await;
        close_after(ctx, owner).await
    }

    /// Where the disk will live on the destination, if the dataset is mounted there yet.
    async fn destination_disk(
        &self,
        destination: &Address,
        dataset: &str,
        source_disk: &Path,
    ) -> Result<Option<PathBuf>> {
        let ctx = self.connector.open(destination).await?;
        let found = self.engine.resolver().by_exact_name(&*ctx, dataset).await;
        let entry = close_after(ctx, found).await?;

        Ok(entry
            .and_then(|entry| entry.mount_point)
            .zip(source_disk.file_name())
            .map(|(mount_point, file_name)| mount_point.join(file_name)))
    }

    async fn set_autostart(&self, address: &Address, domain: &str, enabled: bool) -> Result<()> {
        let ctx = self.connector.open(address).await?;
        let set = self.control.set_autostart(&*ctx, domain, enabled).await;
        close_after(ctx, set).await
    }

    /// Stage a copy of the definition pointing at the destination disk path.
    async fn stage_rewritten(
        &self,
        source: &Address,
        domain: &str,
        from: &Path,
        to: &Path,
    ) -> Result<String> {
        log_info!("Rewriting storage path {} -> {}", from.display(), to.display());
        let ctx = self.connector.open(source).await?;
        let staged = self.rewrite_definition(&*ctx, domain, from, to).await;
        close_after(ctx, staged).await
    }

    async fn rewrite_definition(
        &self,
        ctx: &dyn ExecutionContext,
        domain: &str,
        from: &Path,
        to: &Path,
    ) -> Result<String> {
        let definition = self.control.dump_definition(ctx, domain).await?;
        let rewritten = rewrite_disk_path(&definition, from, to);
        self.control.stage_definition(ctx, &rewritten).await
    }

    async fn relocate(
        &self,
        source: &Address,
        domain: &str,
        destination: &Address,
        staged: Option<&str>,
    ) -> Result<RelocationResult> {
        let ctx = self.connector.open(source).await?;
        let result = self
            .control
            .relocate(&*ctx, domain, destination, staged)
            .await;
        if let Some(path) = staged {
            if let Err(e) = self.control.discard_definition(&*ctx, path).await {
                log_debug!("Could not remove staged definition {}: {}", path, e);
            }
        }
        close_after(ctx, result).await
    }

    async fn set_disk_owner(&self, address: &Address, disk: &Path, owner: Ownership) -> Result<()> {
        let ctx = self.connector.open(address).await?;
        let set = self.control.set_disk_owner(&*ctx, disk, owner).await;
        close_after(ctx, set).await
    }

    async fn resume(&self, address: &Address, domain: &str) -> Result<()> {
        let ctx = self.connector.open(address).await?;
        let resumed = self.control.resume(&*ctx, domain).await;
        close_after(ctx, resumed).await
    }
}
