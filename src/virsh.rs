use crate::{
    Result, ZmigrateError,
    address::Address,
    config::VirshConfig,
    exec::{DiagnosticLines, ExecutionContext, shell_quote},
    log_info,
    workload::{Ownership, WorkloadState},
};
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// Outcome of the hypervisor's suspend-and-relocate call.
#[derive(Debug, Clone)]
pub struct RelocationResult {
    pub exit_code: i32,
    pub diagnostics: Vec<String>,
}

impl RelocationResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Workload-control collaborator: wraps `virsh` invocations on a context.
#[derive(Debug, Clone)]
pub struct WorkloadControl {
    program: String,
    uri: String,
}

impl WorkloadControl {
    pub fn new(config: &VirshConfig) -> Self {
        Self {
            program: shell_quote(&config.program),
            uri: config.uri.clone(),
        }
    }

    fn virsh(&self, args: &str) -> String {
        format!("{} -c {} {}", self.program, shell_quote(&self.uri), args)
    }

    /// Connection URI that reaches the same hypervisor driver on `destination`.
    pub fn remote_uri(&self, destination: &Address) -> String {
        let (scheme, path) = self
            .uri
            .split_once("://")
            .map(|(scheme, rest)| (scheme, rest.find('/').map_or("/system", |i| &rest[i..])))
            .unwrap_or(("qemu", "/system"));
        let scheme = scheme.split('+').next().unwrap_or(scheme);

        let mut uri = format!("{}+ssh://{}", scheme, destination.host_label());
        if let Some(port) = destination.port {
            uri.push_str(&format!(":{}", port));
        }
        uri.push_str(path);
        uri
    }

    pub async fn state(&self, ctx: &dyn ExecutionContext, domain: &str) -> Result<WorkloadState> {
        let output = ctx
            .checked(&self.virsh(&format!("domstate {}", shell_quote(domain))))
            .await?;
        Ok(WorkloadState::parse(&output.stdout))
    }

    /// Path of the first file-backed disk device.
    pub async fn primary_disk(
        &self,
        ctx: &dyn ExecutionContext,
        domain: &str,
    ) -> Result<Option<PathBuf>> {
        let output = ctx
            .checked(&self.virsh(&format!("domblklist --details {}", shell_quote(domain))))
            .await?;
        Ok(parse_primary_disk(&output.stdout))
    }

    pub async fn dump_definition(&self, ctx: &dyn ExecutionContext, domain: &str) -> Result<String> {
        let output = ctx
            .checked(&self.virsh(&format!("dumpxml --migratable {}", shell_quote(domain))))
            .await?;
        Ok(output.stdout)
    }

    pub async fn set_autostart(
        &self,
        ctx: &dyn ExecutionContext,
        domain: &str,
        enabled: bool,
    ) -> Result<()> {
        let flag = if enabled { "" } else { "--disable " };
        ctx.checked(&self.virsh(&format!("autostart {}{}", flag, shell_quote(domain))))
            .await?;
        Ok(())
    }

    pub async fn resume(&self, ctx: &dyn ExecutionContext, domain: &str) -> Result<()> {
        ctx.checked(&self.virsh(&format!("resume {}", shell_quote(domain))))
            .await?;
        Ok(())
    }

    pub fn relocate_command(
        &self,
        domain: &str,
        destination: &Address,
        definition: Option<&str>,
    ) -> String {
        let mut args = String::from(
            "migrate --live --persistent --undefinesource --suspend --unsafe --verbose",
        );
        if let Some(path) = definition {
            args.push_str(" --xml ");
            args.push_str(&shell_quote(path));
        }
        args.push(' ');
        args.push_str(&shell_quote(domain));
        args.push(' ');
        args.push_str(&shell_quote(&self.remote_uri(destination)));
        self.virsh(&args)
    }

    /// Live-migrate `domain` and leave it paused on `destination`, logging virsh output as it arrives.
    ///
    /// Storage is not shared between the hosts; the disk has already been
    /// replicated, so libvirt's shared-storage check is bypassed with `--unsafe`.
    pub async fn relocate(
        &self,
        ctx: &dyn ExecutionContext,
        domain: &str,
        destination: &Address,
        definition: Option<&str>,
    ) -> Result<RelocationResult> {
        let command = self.relocate_command(domain, destination, definition);
        let spawned = ctx
            .spawn(&command)
            .await
            .map_err(|e| ZmigrateError::transport(ctx.host(), e))?;

        let mut exit = spawned.exit;
        let (stdout, stderr) = tokio::join!(
            relay_lines(spawned.stdout),
            relay_lines(spawned.stderr)
        );
        let exit_code = exit
            .wait()
            .await
            .map_err(|e| ZmigrateError::transport(ctx.host(), e))?;

        let mut diagnostics = stdout.map_err(|e| ZmigrateError::transport(ctx.host(), e))?;
        diagnostics.extend(stderr.map_err(|e| ZmigrateError::transport(ctx.host(), e))?);

        Ok(RelocationResult {
            exit_code,
            diagnostics,
        })
    }

    pub async fn disk_owner(&self, ctx: &dyn ExecutionContext, path: &Path) -> Result<Ownership> {
        let command = format!("stat -c %u:%g {}", shell_quote(&path.to_string_lossy()));
        let output = ctx.checked(&command).await?;
        Ownership::parse(&output.stdout).ok_or_else(|| ZmigrateError::UnexpectedOutput {
            command,
            detail: output.stdout.trim().to_string(),
        })
    }

    pub async fn set_disk_owner(
        &self,
        ctx: &dyn ExecutionContext,
        path: &Path,
        owner: Ownership,
    ) -> Result<()> {
        ctx.checked(&format!(
            "chown {} {}",
            owner,
            shell_quote(&path.to_string_lossy())
        ))
        .await?;
        Ok(())
    }

    /// Write a domain definition to a private temp file on the context's host.
    pub async fn stage_definition(&self, ctx: &dyn ExecutionContext, xml: &str) -> Result<String> {
        let path = format!("/tmp/zmigrate-{}.xml", uuid::Uuid::new_v4().simple());
        ctx.checked(&format!(
            "umask 077 && printf '%s' {} > {}",
            shell_quote(xml),
            shell_quote(&path)
        ))
        .await?;
        Ok(path)
    }

    pub async fn discard_definition(&self, ctx: &dyn ExecutionContext, path: &str) -> Result<()> {
        ctx.checked(&format!("rm -f {}", shell_quote(path))).await?;
        Ok(())
    }
}

/// Replace every occurrence of the disk path in a domain definition.
pub fn rewrite_disk_path(definition: &str, from: &Path, to: &Path) -> String {
    definition.replace(&*from.to_string_lossy(), &to.to_string_lossy())
}

fn parse_primary_disk(listing: &str) -> Option<PathBuf> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('-'))
        .skip(1)
        .find_map(|line| {
            let mut columns = line.split_whitespace();
            let kind = columns.next()?;
            let device = columns.next()?;
            let _target = columns.next()?;
            let source = columns.collect::<Vec<_>>().join(" ");
            (kind == "file" && device == "disk" && source.starts_with('/'))
                .then(|| PathBuf::from(source))
        })
}

async fn relay_lines<R: AsyncRead + Unpin>(stream: R) -> std::io::Result<Vec<String>> {
    let mut lines = DiagnosticLines::new(stream);
    let mut collected = Vec::new();
    while let Some(line) = lines.next_line().await? {
        log_info!("virsh: {}", line);
        collected.push(line);
    }
    Ok(collected)
}
