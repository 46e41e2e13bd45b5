use crate::{
    Result,
    exec::ExecutionContext,
    log_debug,
    virsh::WorkloadControl,
    zfs::Zfs,
};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Canonical dataset name on one host. Only comparable with identifiers
/// resolved against the same host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetEntry {
    pub id: DatasetId,
    /// `None` for volumes and for `legacy`/`none` mount points.
    pub mount_point: Option<PathBuf>,
}

impl DatasetEntry {
    fn parse(line: &str) -> Option<Self> {
        let (name, mount_point) = line.split_once('\t')?;
        if name.is_empty() {
            return None;
        }
        let mount_point = mount_point.trim_end();
        Some(Self {
            id: DatasetId(name.to_string()),
            mount_point: mount_point
                .starts_with('/')
                .then(|| PathBuf::from(mount_point)),
        })
    }
}

/// Maps names, file paths and workloads to datasets.
pub struct DatasetResolver {
    zfs: Zfs,
}

impl DatasetResolver {
    pub fn new(zfs: Zfs) -> Self {
        Self { zfs }
    }

    /// Last dataset whose listing line matches `pattern`.
    pub async fn find_by_pattern(
        &self,
        ctx: &dyn ExecutionContext,
        pattern: &Regex,
    ) -> Result<Option<DatasetEntry>> {
        let listing = ctx.checked(&self.zfs.list_datasets()).await?;
        let found = last_match(&listing.stdout, pattern);
        log_debug!(
            "[{}] pattern {} -> {:?}",
            ctx.host(),
            pattern.as_str(),
            found.as_ref().map(|entry| entry.id.as_str())
        );
        Ok(found)
    }

    pub async fn by_name(
        &self,
        ctx: &dyn ExecutionContext,
        name: &str,
    ) -> Result<Option<DatasetEntry>> {
        self.find_by_pattern(ctx, &name_pattern(name)?).await
    }

    /// Exactly `name`, no segment matching.
    pub async fn by_exact_name(
        &self,
        ctx: &dyn ExecutionContext,
        name: &str,
    ) -> Result<Option<DatasetEntry>> {
        let pattern = Regex::new(&format!("^{}\t", regex::escape(name)))?;
        self.find_by_pattern(ctx, &pattern).await
    }

    /// Dataset mounted at the directory containing `path`.
    pub async fn by_mount_point(
        &self,
        ctx: &dyn ExecutionContext,
        path: &Path,
    ) -> Result<Option<DatasetEntry>> {
        let Some(pattern) = mount_point_pattern(path)? else {
            return Ok(None);
        };
        self.find_by_pattern(ctx, &pattern).await
    }

    pub async fn by_workload_disk(
        &self,
        ctx: &dyn ExecutionContext,
        control: &WorkloadControl,
        domain: &str,
    ) -> Result<Option<DatasetEntry>> {
        match control.primary_disk(ctx, domain).await? {
            Some(disk) => self.by_mount_point(ctx, &disk).await,
            None => Ok(None),
        }
    }
}

/// `name` at a path-segment boundary, ending the name column.
pub fn name_pattern(name: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("(^|/){}\t", regex::escape(name)))?)
}

/// Mount point equal to the parent directory of `path`, ending the line.
pub fn mount_point_pattern(path: &Path) -> Result<Option<Regex>> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(None);
    };
    let pattern = format!("\t{}$", regex::escape(&parent.to_string_lossy()));
    Ok(Some(Regex::new(&pattern)?))
}

fn last_match(listing: &str, pattern: &Regex) -> Option<DatasetEntry> {
    listing
        .lines()
        .filter(|line| pattern.is_match(line))
        .filter_map(DatasetEntry::parse)
        .last()
}
