use crate::{
    Result,
    address::Address,
    dataset::DatasetId,
    exec::{Connector, ExecutionContext, close_after},
    log_debug,
    zfs::Zfs,
};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub dataset: String,
    pub label: String,
    /// Position in the engine's creation-ordered listing.
    pub ordinal: usize,
}

impl Snapshot {
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.label)
    }
}

/// Parse `zfs list -t snapshot -o name` output for `dataset`.
///
/// Lines naming another dataset are dropped.
pub fn parse_listing(dataset: &str, stdout: &str) -> Vec<Snapshot> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once('@'))
        .filter(|(name, label)| *name == dataset && !label.is_empty())
        .enumerate()
        .map(|(ordinal, (name, label))| Snapshot {
            dataset: name.to_string(),
            label: label.to_string(),
            ordinal,
        })
        .collect()
}

/// Newest destination label that also exists anywhere in the source history.
pub fn newest_common_label(source: &[Snapshot], destination: &[Snapshot]) -> Option<String> {
    let source_labels: HashSet<&str> = source.iter().map(|s| s.label.as_str()).collect();
    destination
        .iter()
        .rev()
        .find(|snapshot| source_labels.contains(snapshot.label.as_str()))
        .map(|snapshot| snapshot.label.clone())
}

pub struct SnapshotHistory {
    zfs: Zfs,
}

impl SnapshotHistory {
    pub fn new(zfs: Zfs) -> Self {
        Self { zfs }
    }

    /// Oldest to newest.
    pub async fn list(&self, ctx: &dyn ExecutionContext, dataset: &DatasetId) -> Result<Vec<Snapshot>> {
        let output = ctx
            .checked(&self.zfs.list_snapshots(dataset.as_str()))
            .await?;
        Ok(parse_listing(dataset.as_str(), &output.stdout))
    }

    pub async fn latest(
        &self,
        ctx: &dyn ExecutionContext,
        dataset: &DatasetId,
    ) -> Result<Option<Snapshot>> {
        Ok(self.list(ctx, dataset).await?.pop())
    }

    /// Latest snapshot label shared by both histories, the incremental basis.
    ///
    /// The source host is connected only for its listing and released before
    /// returning.
    pub async fn latest_common(
        &self,
        dest_ctx: &dyn ExecutionContext,
        connector: &dyn Connector,
        source: &Address,
        source_dataset: &DatasetId,
        dest_dataset: &DatasetId,
    ) -> Result<Option<String>> {
        let source_ctx = connector.open(source).await?;
        let listed = self.list(&*source_ctx, source_dataset).await;
        let source_history = close_after(source_ctx, listed).await?;

        let dest_history = self.list(dest_ctx, dest_dataset).await?;

        let common = newest_common_label(&source_history, &dest_history);
        log_debug!(
            "{} source / {} destination snapshots, common: {:?}",
            source_history.len(),
            dest_history.len(),
            common
        );
        Ok(common)
    }
}
