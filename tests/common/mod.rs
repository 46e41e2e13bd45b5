// Scripted hosts for driving the engine without ssh, zfs or virsh
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::{Arc, Mutex};
use zmigrate::{
    Address, Result, ZmigrateError,
    exec::{CommandOutput, Connector, ExecutionContext, ProcessExit, SpawnedCommand},
};

struct Rule {
    pattern: String,
    output: CommandOutput,
}

struct StreamRule {
    pattern: String,
    stdout: String,
    stderr: String,
    exit_code: i32,
}

#[derive(Default)]
struct HostState {
    rules: Vec<Rule>,
    streams: Vec<StreamRule>,
    broken_spawns: Vec<String>,
    commands: Vec<String>,
    opened: usize,
    closed: usize,
    refuse_connections: bool,
}

/// One scripted machine. The most recently added rule whose pattern occurs
/// in a command answers it; unmatched commands succeed with no output.
#[derive(Clone)]
pub struct MockHost {
    name: String,
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    pub fn respond(&self, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(pattern, 0, stdout, "")
    }

    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push_rule(pattern, exit_code, "", stderr)
    }

    /// Script a spawned command's stderr lines and exit code.
    pub fn stream(&self, pattern: &str, stderr: &str, exit_code: i32) -> &Self {
        self.state.lock().unwrap().streams.push(StreamRule {
            pattern: pattern.to_string(),
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        });
        self
    }

    /// Spawned commands containing `pattern` fail as if the channel dropped.
    pub fn break_spawn(&self, pattern: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .broken_spawns
            .push(pattern.to_string());
        self
    }

    pub fn refuse_connections(&self) -> &Self {
        self.state.lock().unwrap().refuse_connections = true;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of recorded commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    pub fn command_containing(&self, pattern: &str) -> Option<String> {
        self.commands()
            .into_iter()
            .find(|command| command.contains(pattern))
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    fn push_rule(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            output: CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        });
        self
    }
}

struct MockContext {
    host: MockHost,
}

struct FixedExit(i32);

#[async_trait]
impl ProcessExit for FixedExit {
    async fn wait(&mut self) -> io::Result<i32> {
        Ok(self.0)
    }
}

#[async_trait]
impl ExecutionContext for MockContext {
    fn host(&self) -> &str {
        &self.host.name
    }

    async fn run(&self, command: &str) -> io::Result<CommandOutput> {
        let mut state = self.host.state.lock().unwrap();
        state.commands.push(command.to_string());
        let output = state
            .rules
            .iter()
            .rev()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| rule.output.clone())
            .unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        Ok(output)
    }

    async fn spawn(&self, command: &str) -> io::Result<SpawnedCommand> {
        let mut state = self.host.state.lock().unwrap();
        state.commands.push(command.to_string());
        if state
            .broken_spawns
            .iter()
            .any(|pattern| command.contains(pattern))
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control connection lost",
            ));
        }
        let (stdout, stderr, exit_code) = state
            .streams
            .iter()
            .rev()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| (rule.stdout.clone(), rule.stderr.clone(), rule.exit_code))
            .unwrap_or_default();
        Ok(SpawnedCommand::new(
            Box::new(Cursor::new(stdout.into_bytes())),
            Box::new(Cursor::new(stderr.into_bytes())),
            Box::new(FixedExit(exit_code)),
        ))
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        self.host.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Hands out contexts on scripted hosts, keyed by host label
/// (`localhost` for local addresses).
#[derive(Default)]
pub struct MockConnector {
    hosts: HashMap<String, MockHost>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host: &MockHost) -> &mut Self {
        self.hosts.insert(host.name.clone(), host.clone());
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, address: &Address) -> Result<Box<dyn ExecutionContext>> {
        let label = address.host_label();
        let host = self
            .hosts
            .get(label)
            .ok_or_else(|| ZmigrateError::transport(label, "unknown host"))?;
        {
            let mut state = host.state.lock().unwrap();
            if state.refuse_connections {
                return Err(ZmigrateError::transport(label, "connection refused"));
            }
            state.opened += 1;
        }
        Ok(Box::new(MockContext { host: host.clone() }))
    }
}

/// `name\tmountpoint` listing as printed by `zfs list -H`.
pub fn dataset_listing(entries: &[(&str, &str)]) -> String {
    entries
        .iter()
        .map(|(name, mount_point)| format!("{}\t{}\n", name, mount_point))
        .collect()
}

/// Full snapshot names, oldest first.
pub fn snapshot_listing(dataset: &str, labels: &[&str]) -> String {
    labels
        .iter()
        .map(|label| format!("{}@{}\n", dataset, label))
        .collect()
}
