//! Child process spawning and log capture.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use fabric_primitives::{AgentName, EndpointAddress, MachineId};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::manifest::AgentDescriptor;

/// Machine-level settings forwarded to every spawned agent.
#[derive(Clone, Debug)]
pub struct SpawnContext {
    /// Directory receiving one `<agent>.log` per child.
    pub logs_dir: PathBuf,
    /// Machine identifier forwarded as `FABRIC_MACHINE_ID`.
    pub machine: MachineId,
    /// Group name forwarded as `FABRIC_GROUP`.
    pub group: String,
    /// Host agents bind, forwarded as `FABRIC_BIND_HOST`.
    pub bind_host: String,
    /// Registry endpoint, forwarded when configured.
    pub registry: Option<EndpointAddress>,
    /// Error-bus frontend, forwarded when configured.
    pub error_bus: Option<EndpointAddress>,
}

/// Spawns one agent process with its descriptor's environment and ports.
///
/// stdout and stderr are piped into `logs/<agent>.log` by background copy
/// tasks, which also mirror each line into the supervisor's own log at
/// debug level (the combined tail).
///
/// # Errors
///
/// Returns the spawn error from the OS, e.g. a missing executable.
pub async fn spawn_agent(
    name: &AgentName,
    descriptor: &AgentDescriptor,
    ctx: &SpawnContext,
) -> std::io::Result<Child> {
    let mut command = Command::new(&descriptor.executable);
    command
        .args(&descriptor.args)
        .envs(&descriptor.env)
        .env("FABRIC_AGENT_NAME", name.as_str())
        .env("FABRIC_GROUP", &ctx.group)
        .env("FABRIC_MACHINE_ID", ctx.machine.as_str())
        .env("FABRIC_BIND_HOST", &ctx.bind_host)
        .env("FABRIC_REQUEST_PORT", descriptor.request_port.to_string())
        .env("FABRIC_HEALTH_PORT", descriptor.health_port().to_string())
        .env("FABRIC_REENTRANT", descriptor.reentrant.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !descriptor.capabilities.is_empty() {
        command.env("FABRIC_CAPABILITIES", descriptor.capabilities.join(","));
    }
    if let Some(registry) = &ctx.registry {
        command.env("FABRIC_REGISTRY__ENDPOINT", registry.to_string());
    }
    if let Some(bus) = &ctx.error_bus {
        command.env("FABRIC_ERROR_BUS__FRONTEND", bus.to_string());
    }

    let mut child = command.spawn()?;
    let log_path = ctx.logs_dir.join(format!("{name}.log"));
    if let Some(stdout) = child.stdout.take() {
        tail_stream(name.clone(), "stdout", stdout, log_path.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        tail_stream(name.clone(), "stderr", stderr, log_path);
    }
    Ok(child)
}

/// Copies one child stream into the agent's log file line by line.
fn tail_stream<R>(name: AgentName, stream_name: &'static str, stream: R, path: impl AsRef<Path>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let path = path.as_ref().to_path_buf();
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(agent = %name, path = %path.display(), error = %err, "cannot open agent log");
                None
            }
        };

        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(agent = %name, stream = stream_name, line = %line, "child output");
            if let Some(file) = file.as_mut() {
                let framed = format!("{line}\n");
                if file.write_all(framed.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn descriptor(executable: &str, args: &[&str]) -> AgentDescriptor {
        let args = args
            .iter()
            .map(|a| format!("\"{a}\""))
            .collect::<Vec<_>>()
            .join(", ");
        toml::from_str(&format!(
            "executable = \"{executable}\"\nargs = [{args}]\nrequest_port = 5570\n"
        ))
        .expect("descriptor")
    }

    fn context(logs_dir: PathBuf) -> SpawnContext {
        SpawnContext {
            logs_dir,
            machine: MachineId::new("testmachine").unwrap(),
            group: "core".into(),
            bind_host: "127.0.0.1".into(),
            registry: None,
            error_bus: None,
        }
    }

    #[tokio::test]
    async fn captures_child_output_into_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = AgentName::new("echo-test").unwrap();
        let descriptor = descriptor("/bin/sh", &["-c", "echo line-from-child"]);
        let mut child = spawn_agent(&name, &descriptor, &context(dir.path().to_path_buf()))
            .await
            .expect("spawn");
        let status = child.wait().await.expect("wait");
        assert!(status.success());

        // The copy task finishes shortly after the child exits.
        let log_path = dir.path().join("echo-test.log");
        let mut contents = String::new();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            contents = tokio::fs::read_to_string(&log_path)
                .await
                .unwrap_or_default();
            if contents.contains("line-from-child") {
                break;
            }
        }
        assert!(contents.contains("line-from-child"), "log: {contents}");
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = AgentName::new("ghost").unwrap();
        let descriptor = descriptor("/nonexistent/fabric-agent", &[]);
        let result = spawn_agent(&name, &descriptor, &context(dir.path().to_path_buf())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn environment_reaches_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = AgentName::new("env-test").unwrap();
        let mut descriptor = descriptor("/bin/sh", &["-c", "echo port=$FABRIC_REQUEST_PORT extra=$EXTRA"]);
        descriptor.env = BTreeMap::from([("EXTRA".to_string(), "42".to_string())]);
        let mut child = spawn_agent(&name, &descriptor, &context(dir.path().to_path_buf()))
            .await
            .expect("spawn");
        child.wait().await.expect("wait");

        let log_path = dir.path().join("env-test.log");
        let mut contents = String::new();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            contents = tokio::fs::read_to_string(&log_path)
                .await
                .unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
        }
        assert!(contents.contains("port=5570"), "log: {contents}");
        assert!(contents.contains("extra=42"), "log: {contents}");
    }
}
