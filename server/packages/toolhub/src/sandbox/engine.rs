use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::SandboxError;

const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout and stderr, in that order, for build logs.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// The container engine CLI. Its argv and exit codes are the whole contract.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Name of the CLI binary, for rendering equivalent shell commands.
    fn program(&self) -> &str;

    /// Runs one engine command. A command still running at `timeout` is
    /// killed and reported with `timed_out` set. Only a failure to invoke the
    /// engine at all is an error.
    async fn exec(&self, args: &[String], timeout: Option<Duration>)
        -> Result<EngineOutput, SandboxError>;

    /// Current network addresses of the named containers. Containers without
    /// an address (not started yet, or no network) are absent.
    async fn container_addresses(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, IpAddr>, SandboxError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Name}} {{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}".to_string(),
        ];
        args.extend(names.iter().cloned());
        // Exits non-zero when some names are gone; whatever was printed still counts.
        let output = self.exec(&args, Some(Duration::from_secs(10))).await?;
        Ok(parse_inspect_addresses(&output.stdout))
    }
}

fn parse_inspect_addresses(stdout: &str) -> HashMap<String, IpAddr> {
    let mut addresses = HashMap::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            continue;
        };
        let name = name.trim_start_matches('/').to_string();
        if let Some(address) = parts.find_map(|part| part.parse::<IpAddr>().ok()) {
            addresses.insert(name, address);
        }
    }
    addresses
}

/// Shells out to the `docker` (or compatible) CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn program(&self) -> &str {
        &self.program
    }

    async fn exec(
        &self,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<EngineOutput, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::EngineUnavailable(format!("{}: {err}", self.program)))?;

        let stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let (status, timed_out) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (Some(status), false),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (None, true)
                }
            },
            None => (Some(child.wait().await), false),
        };
        let status = status
            .transpose()
            .map_err(|err| SandboxError::EngineUnavailable(format!("{}: {err}", self.program)))?;

        Ok(EngineOutput {
            exit_code: status.and_then(|status| status.code()),
            stdout: collect(stdout_task).await,
            stderr: collect(stderr_task).await,
            timed_out,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buffer).await;
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Output readers can outlive a killed client when a grandchild holds the pipe.
async fn collect(task: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN, task).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_output_is_parsed_per_container() {
        let stdout = "/sbx-a 172.17.0.3 \n/sbx-b \n/sbx-c 10.0.0.7 172.18.0.2 \n";
        let addresses = parse_inspect_addresses(stdout);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses["sbx-a"], "172.17.0.3".parse::<IpAddr>().unwrap());
        assert_eq!(addresses["sbx-c"], "10.0.0.7".parse::<IpAddr>().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_past_its_timeout_is_killed() {
        let engine = DockerCli::new("sleep");
        let started = std::time::Instant::now();
        let output = engine
            .exec(&["30".to_string()], Some(Duration::from_secs(1)))
            .await
            .expect("sleep runs");
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(10));

        let output = engine
            .exec(&["0".to_string()], Some(Duration::from_secs(5)))
            .await
            .expect("sleep runs");
        assert!(output.success());
    }

    #[tokio::test]
    async fn missing_engine_binary_is_unavailable() {
        let engine = DockerCli::new("/nonexistent/toolhub-engine");
        let err = engine
            .exec(&["version".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::EngineUnavailable(_)));
    }
}
