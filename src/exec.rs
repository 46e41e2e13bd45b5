//! Local and remote command execution.
//!
//! Every operation opens an [`ExecutionContext`] through a [`Connector`] for
//! one logical step and closes it straight after. Remote contexts hold an
//! OpenSSH control master for their lifetime; local contexts hold nothing.

use crate::{Result, ZmigrateError, address::Address, config::SshConfig, log_debug, log_warn};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Buffered result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Source of a streaming command's exit code.
#[async_trait]
pub trait ProcessExit: Send {
    async fn wait(&mut self) -> io::Result<i32>;
}

#[async_trait]
impl ProcessExit for Child {
    async fn wait(&mut self) -> io::Result<i32> {
        let status = Child::wait(self).await?;
        // Killed by a signal: no code, report as failure.
        Ok(status.code().unwrap_or(-1))
    }
}

/// A running command whose output arrives live.
///
/// Both streams must be consumed; an unread pipe stalls the process.
pub struct SpawnedCommand {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub exit: Box<dyn ProcessExit>,
}

impl SpawnedCommand {
    pub fn new(stdout: OutputStream, stderr: OutputStream, exit: Box<dyn ProcessExit>) -> Self {
        Self {
            stdout,
            stderr,
            exit,
        }
    }

    fn from_child(mut child: Child) -> io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not piped"))?;
        Ok(Self::new(Box::new(stdout), Box::new(stderr), Box::new(child)))
    }
}

#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Host name used in logs and errors.
    fn host(&self) -> &str;

    async fn run(&self, command: &str) -> io::Result<CommandOutput>;

    async fn spawn(&self, command: &str) -> io::Result<SpawnedCommand>;

    /// Release the transport. Consumes the context so it closes once.
    async fn close(self: Box<Self>) -> io::Result<()>;

    /// `run`, with transport failures mapped into the crate error.
    async fn output(&self, command: &str) -> Result<CommandOutput> {
        log_debug!("[{}] $ {}", self.host(), command);
        self.run(command)
            .await
            .map_err(|e| ZmigrateError::transport(self.host(), e))
    }

    /// `output`, additionally failing on a non-zero exit.
    async fn checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.output(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ZmigrateError::CommandFailed {
                host: self.host().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Close `ctx` and hand back `result`. The work's own error wins over a close error.
pub async fn close_after<T>(ctx: Box<dyn ExecutionContext>, result: Result<T>) -> Result<T> {
    let host = ctx.host().to_string();
    let closed = ctx.close().await;
    let value = result?;
    closed.map_err(|e| ZmigrateError::transport(&host, e))?;
    Ok(value)
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, address: &Address) -> Result<Box<dyn ExecutionContext>>;
}

/// Runs commands through `sh -c` on this machine.
pub struct LocalContext;

#[async_trait]
impl ExecutionContext for LocalContext {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str) -> io::Result<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput::from_process(output))
    }

    async fn spawn(&self, command: &str) -> io::Result<SpawnedCommand> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        SpawnedCommand::from_child(child)
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Runs commands on a remote host over one multiplexed ssh connection.
pub struct SshContext {
    host: String,
    port: Option<u16>,
    program: String,
    options: Vec<String>,
    control_path: PathBuf,
}

impl SshContext {
    pub async fn connect(config: &SshConfig, host: &str, port: Option<u16>) -> Result<Self> {
        let control_path = config
            .control_dir()
            .join(format!("zmigrate-{}.sock", uuid::Uuid::new_v4().simple()));

        let context = Self {
            host: host.to_string(),
            port,
            program: config.program.clone(),
            options: config.options.clone(),
            control_path,
        };

        log_debug!("Opening control channel to {}", host);

        // The backgrounded master keeps inherited pipes open, so only the exit status is read.
        let status = Command::new(&context.program)
            .args(context.base_args())
            .args(["-M", "-f", "-N"])
            .arg("--")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ZmigrateError::transport(host, e))?;

        if !status.success() {
            return Err(ZmigrateError::transport(
                host,
                format!(
                    "ssh control master exited with {}",
                    status.code().unwrap_or(-1)
                ),
            ));
        }

        Ok(context)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = self.options.clone();
        args.push("-S".to_string());
        args.push(self.control_path.to_string_lossy().into_owned());
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.base_args())
            .arg("--")
            .arg(&self.host)
            .arg(remote)
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ExecutionContext for SshContext {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> io::Result<CommandOutput> {
        let output = self.command(command).output().await?;
        Ok(CommandOutput::from_process(output))
    }

    async fn spawn(&self, command: &str) -> io::Result<SpawnedCommand> {
        let child = self
            .command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        SpawnedCommand::from_child(child)
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        log_debug!("Closing control channel to {}", self.host);
        let output = Command::new(&self.program)
            .args(self.base_args())
            .args(["-O", "exit"])
            .arg("--")
            .arg(&self.host)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log_warn!("Control channel to {} did not exit cleanly: {}", self.host, stderr.trim());
            Err(io::Error::other(format!(
                "ssh -O exit failed for {}: {}",
                self.host,
                stderr.trim()
            )))
        }
    }
}

/// Production connector: local for host-less addresses, ssh otherwise.
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, address: &Address) -> Result<Box<dyn ExecutionContext>> {
        match &address.host {
            None => Ok(Box::new(LocalContext)),
            Some(host) => Ok(Box::new(
                SshContext::connect(&self.config, host, address.port).await?,
            )),
        }
    }
}

/// Line reader for tool diagnostics.
///
/// Splits on `\n` as well as bare `\r`, since progress output redraws a line
/// in place, and decodes lossily so a stray non-UTF-8 byte cannot end the read.
/// Blank segments are skipped.
pub struct DiagnosticLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(self.take_pending());
            }
            match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    self.pending.extend_from_slice(&buf[..end]);
                    self.reader.consume(end + 1);
                    if let Some(line) = self.take_pending() {
                        return Ok(Some(line));
                    }
                }
                None => {
                    let len = buf.len();
                    self.pending.extend_from_slice(buf);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&bytes);
        if line.trim().is_empty() {
            None
        } else {
            Some(line.into_owned())
        }
    }
}

/// Shell prefix that runs the following (quoted) command on `host`.
///
/// Used inside transfer pipelines, which execute on the sending host rather
/// than through a control channel.
pub fn ssh_prefix(config: &SshConfig, host: &str, port: Option<u16>) -> String {
    let mut parts = vec![shell_quote(&config.program)];
    parts.extend(config.options.iter().map(|o| shell_quote(o)));
    if let Some(port) = port {
        parts.push("-p".to_string());
        parts.push(port.to_string());
    }
    parts.push("--".to_string());
    parts.push(shell_quote(host));
    parts.join(" ")
}

/// POSIX single-quote escaping; plain words pass through unchanged.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
