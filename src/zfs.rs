use crate::config::ZfsConfig;
use crate::exec::shell_quote;

/// Command lines for the dataset engine. Nothing here executes.
#[derive(Debug, Clone)]
pub struct Zfs {
    program: String,
}

impl Zfs {
    pub fn new(config: &ZfsConfig) -> Self {
        Self {
            program: shell_quote(&config.program),
        }
    }

    /// Tab-separated `name\tmountpoint`, one dataset per line.
    pub fn list_datasets(&self) -> String {
        format!(
            "{} list -H -o name,mountpoint -t filesystem,volume",
            self.program
        )
    }

    /// Full snapshot names of one dataset, oldest first.
    pub fn list_snapshots(&self, dataset: &str) -> String {
        format!(
            "{} list -H -t snapshot -o name -s creation -d 1 {}",
            self.program,
            shell_quote(dataset)
        )
    }

    pub fn snapshot(&self, dataset: &str, label: &str) -> String {
        format!(
            "{} snapshot {}",
            self.program,
            shell_quote(&format!("{}@{}", dataset, label))
        )
    }

    /// Parsable verbose send; incremental from `basis` when given.
    pub fn send(&self, dataset: &str, basis: Option<&str>, label: &str) -> String {
        let mut cmd = format!("{} send -v -P", self.program);
        if let Some(basis) = basis {
            cmd.push_str(" -i ");
            cmd.push_str(&shell_quote(&format!("@{}", basis)));
        }
        cmd.push(' ');
        cmd.push_str(&shell_quote(&format!("{}@{}", dataset, label)));
        cmd
    }

    /// `-F` rolls the destination back to the basis, or replaces it entirely for a full stream.
    pub fn receive(&self, dataset: &str, force: bool) -> String {
        let flag = if force { " -F" } else { "" };
        format!("{} receive{} {}", self.program, flag, shell_quote(dataset))
    }
}

/// Parent dataset name, `None` for a pool root.
pub fn parent_dataset(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(parent, _)| parent)
}
