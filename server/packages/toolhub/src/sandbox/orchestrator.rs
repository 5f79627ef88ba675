use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use toolhub_stdio_transport::format_command_for_display;

use super::{ContainerEngine, ContainerRegistry, ContainerSession, SandboxError, SandboxSettings};

const DOCKERFILE: &str = "Dockerfile";
const TIMED_OUT_EXIT_CODE: i32 = -1;
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    Bridge,
    Host,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

/// Creates a docker container from the given files, runs it once and returns
/// its output. Useful for bulk data processing, analysis and ETL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateContainerParams {
    /// Files to copy into the build context, keyed by relative path. Must include a Dockerfile.
    pub files: BTreeMap<String, String>,
    /// Maximum time in milliseconds the container may run. Defaults to 30000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Network mode for the container. Defaults to `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<NetworkMode>,
    /// Environment variables to set in the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    /// Memory limit (e.g. `512m`, `1g`). Defaults to 512m.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU limit (e.g. `0.5`, `1`). Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerState {
    Finished,
    BuildError,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRunResult {
    pub name: String,
    pub state: ContainerState,
    /// Equivalent shell command of the run step.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub build_log: String,
    /// `-1` when the run timed out; absent when the run never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub build_duration_ms: u64,
    pub run_duration_ms: u64,
    pub duration_ms: u64,
}

/// Builds caller-supplied sources into an image and runs it exactly once
/// under fixed resource and privilege limits.
#[derive(Clone)]
pub struct SandboxOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    registry: ContainerRegistry,
    settings: SandboxSettings,
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("engine", &self.engine.program())
            .field("registry", &self.registry)
            .finish()
    }
}

struct RunPlan {
    name: String,
    tag: String,
    network: NetworkMode,
    memory: String,
    cpus: String,
    timeout: Duration,
    environment: BTreeMap<String, String>,
}

impl SandboxOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: ContainerRegistry,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Runs one sandbox. Build and run failures come back as results; only
    /// invalid requests and an unusable engine are errors. The image and the
    /// build directory are removed in every case.
    pub async fn create_container(
        &self,
        params: CreateContainerParams,
        session: ContainerSession,
    ) -> Result<ContainerRunResult, SandboxError> {
        let plan = self.plan(&params)?;
        let started = Instant::now();

        let mut builder = tempfile::Builder::new();
        builder.prefix("toolhub-sandbox-");
        let workdir = match &self.settings.work_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        tracing::info!(
            container = %plan.name,
            chat_id = %session.chat_id,
            network = plan.network.as_str(),
            timeout_ms = plan.timeout.as_millis() as u64,
            "starting sandbox"
        );

        let mut cleanup = RunCleanup::new(self, &plan);
        let outcome = self
            .build_and_run(&plan, &params.files, workdir.path(), session, &mut cleanup)
            .await;

        match self.engine.exec(&remove_image_args(&plan.tag), None).await {
            Ok(output) if !output.success() && outcome.is_ok() => {
                tracing::debug!(image = %plan.tag, stderr = %output.stderr.trim(), "image removal reported failure");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(image = %plan.tag, error = %err, "failed to remove sandbox image"),
        }
        let workdir_path = workdir.path().to_path_buf();
        if let Err(err) = workdir.close() {
            tracing::warn!(path = %workdir_path.display(), error = %err, "failed to remove sandbox build dir");
        }
        cleanup.disarm();

        let mut result = outcome?;
        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            container = %result.name,
            state = ?result.state,
            exit_code = result.exit_code,
            elapsed_ms = result.duration_ms,
            "sandbox finished"
        );
        Ok(result)
    }

    fn plan(&self, params: &CreateContainerParams) -> Result<RunPlan, SandboxError> {
        for path in params.files.keys() {
            validate_relative_path(path)?;
        }
        let dockerfile = params.files.get(DOCKERFILE).ok_or_else(|| {
            SandboxError::InvalidRequest("files must include a Dockerfile".to_string())
        })?;
        if declares_expose(dockerfile) {
            return Err(SandboxError::InvalidRequest(
                "Dockerfile must not contain EXPOSE; sandboxes cannot open ports".to_string(),
            ));
        }

        let network = params.network_mode.unwrap_or(NetworkMode::None);
        match network {
            NetworkMode::None => {}
            NetworkMode::Bridge if self.settings.allow_bridge => {}
            NetworkMode::Bridge => {
                return Err(SandboxError::InvalidRequest(
                    "bridge networking is not enabled for this host".to_string(),
                ))
            }
            NetworkMode::Host => {
                return Err(SandboxError::InvalidRequest(
                    "host networking is not allowed".to_string(),
                ))
            }
        }

        let memory = params
            .memory
            .clone()
            .unwrap_or_else(|| self.settings.default_memory.clone());
        if !is_memory_limit(&memory) {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid memory limit: {memory}"
            )));
        }
        let cpus = params
            .cpus
            .clone()
            .unwrap_or_else(|| self.settings.default_cpus.clone());
        if !cpus.parse::<f64>().map(|value| value > 0.0).unwrap_or(false) {
            return Err(SandboxError::InvalidRequest(format!("invalid cpu limit: {cpus}")));
        }

        let timeout_ms = params
            .timeout
            .unwrap_or(self.settings.default_timeout_ms)
            .clamp(1, self.settings.max_timeout_ms.max(1));

        let environment = params.environment.clone().unwrap_or_default();
        for key in environment.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(SandboxError::InvalidRequest(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
        }

        let name = unique_name();
        Ok(RunPlan {
            tag: name.clone(),
            name,
            network,
            memory,
            cpus,
            timeout: Duration::from_millis(timeout_ms),
            environment,
        })
    }

    async fn build_and_run(
        &self,
        plan: &RunPlan,
        files: &BTreeMap<String, String>,
        dir: &Path,
        session: ContainerSession,
        cleanup: &mut RunCleanup,
    ) -> Result<ContainerRunResult, SandboxError> {
        for (relative, contents) in files {
            let path = dir.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, contents).await?;
        }

        let run_args = self.run_args(plan);
        let command = format_command_for_display(self.engine.program(), &run_args);
        let mut result = ContainerRunResult {
            name: plan.name.clone(),
            state: ContainerState::Error,
            command,
            stdout: String::new(),
            stderr: String::new(),
            build_log: String::new(),
            exit_code: None,
            build_duration_ms: 0,
            run_duration_ms: 0,
            duration_ms: 0,
        };

        let build_started = Instant::now();
        let build_args = vec![
            "build".to_string(),
            "-t".to_string(),
            plan.tag.clone(),
            dir.to_string_lossy().into_owned(),
        ];
        let build = self
            .engine
            .exec(
                &build_args,
                Some(Duration::from_millis(self.settings.build_timeout_ms)),
            )
            .await?;
        result.build_duration_ms = build_started.elapsed().as_millis() as u64;
        result.build_log = build.combined();
        if !build.success() {
            tracing::warn!(container = %plan.name, exit_code = build.exit_code, timed_out = build.timed_out, "sandbox build failed");
            result.state = ContainerState::BuildError;
            result.exit_code = build.exit_code;
            return Ok(result);
        }

        // Registered before start and removed after stop: the only window in
        // which the proxy will answer this container.
        cleanup.register(session, plan.network);
        let run_started = Instant::now();
        let run = self.engine.exec(&run_args, Some(plan.timeout)).await;
        if matches!(&run, Ok(output) if output.timed_out) {
            if let Err(err) = self.engine.exec(&kill_args(&plan.name), Some(KILL_TIMEOUT)).await {
                tracing::warn!(container = %plan.name, error = %err, "failed to kill timed out sandbox");
            }
        }
        cleanup.deregister();
        let run = run?;

        result.run_duration_ms = run_started.elapsed().as_millis() as u64;
        result.stdout = run.stdout;
        result.stderr = run.stderr;
        if run.timed_out {
            result.state = ContainerState::TimedOut;
            result.exit_code = Some(TIMED_OUT_EXIT_CODE);
        } else {
            result.exit_code = run.exit_code;
            result.state = if run.exit_code == Some(0) {
                ContainerState::Finished
            } else {
                ContainerState::Error
            };
        }
        Ok(result)
    }

    fn run_args(&self, plan: &RunPlan) -> Vec<String> {
        let mut args: Vec<String> = [
            "run",
            "--rm",
            "--name",
            plan.name.as_str(),
            "--memory",
            plan.memory.as_str(),
            "--cpus",
            plan.cpus.as_str(),
            "--network",
            plan.network.as_str(),
            "--user",
            self.settings.user.as_str(),
            "--read-only",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,size=64m",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        for (key, value) in &plan.environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(plan.tag.clone());
        args
    }
}

/// Cleanup owed by an in-flight sandbox run. If the run future is dropped
/// before `disarm`, the container is deregistered at once and its kill and
/// image removal are spawned onto the runtime.
struct RunCleanup {
    engine: Arc<dyn ContainerEngine>,
    registry: ContainerRegistry,
    name: String,
    tag: String,
    running: bool,
    armed: bool,
}

impl RunCleanup {
    fn new(orchestrator: &SandboxOrchestrator, plan: &RunPlan) -> Self {
        Self {
            engine: orchestrator.engine.clone(),
            registry: orchestrator.registry.clone(),
            name: plan.name.clone(),
            tag: plan.tag.clone(),
            running: false,
            armed: true,
        }
    }

    fn register(&mut self, session: ContainerSession, network: NetworkMode) {
        match network {
            NetworkMode::None => self.registry.set_offline(&self.name, session),
            _ => self.registry.set(&self.name, session),
        }
        self.running = true;
    }

    fn deregister(&mut self) {
        self.registry.delete(&self.name);
        self.running = false;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.delete(&self.name);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(container = %self.name, image = %self.tag, "sandbox run dropped outside a runtime; container and image left behind");
            return;
        };
        tracing::warn!(container = %self.name, "sandbox run cancelled; cleaning up");
        let engine = self.engine.clone();
        let name = std::mem::take(&mut self.name);
        let tag = std::mem::take(&mut self.tag);
        let running = self.running;
        runtime.spawn(async move {
            if running {
                if let Err(err) = engine.exec(&kill_args(&name), Some(KILL_TIMEOUT)).await {
                    tracing::warn!(container = %name, error = %err, "failed to kill cancelled sandbox");
                }
            }
            if let Err(err) = engine.exec(&remove_image_args(&tag), None).await {
                tracing::warn!(image = %tag, error = %err, "failed to remove sandbox image");
            }
        });
    }
}

fn kill_args(name: &str) -> Vec<String> {
    vec!["kill".to_string(), name.to_string()]
}

fn remove_image_args(tag: &str) -> Vec<String> {
    vec!["rmi".to_string(), "-f".to_string(), tag.to_string()]
}

fn validate_relative_path(path: &str) -> Result<(), SandboxError> {
    let candidate = Path::new(path);
    let valid = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidRequest(format!(
            "file path must be relative and stay inside the build context: {path}"
        )))
    }
}

fn declares_expose(dockerfile: &str) -> bool {
    dockerfile.lines().any(|line| {
        line.split_whitespace()
            .next()
            .map(|instruction| instruction.eq_ignore_ascii_case("EXPOSE"))
            .unwrap_or(false)
    })
}

fn is_memory_limit(value: &str) -> bool {
    let digits = value.trim_end_matches(|c: char| matches!(c, 'b' | 'k' | 'm' | 'g' | 'B' | 'K' | 'M' | 'G'));
    value.len() - digits.len() <= 1 && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn unique_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let suffix: u32 = rand::thread_rng().gen();
    format!("toolhub-sandbox-{millis}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_is_detected_case_insensitively() {
        assert!(declares_expose("FROM alpine\n  expose 8080\nCMD [\"true\"]"));
        assert!(!declares_expose("FROM alpine\nRUN echo EXPOSE\n"));
    }

    #[test]
    fn paths_must_stay_inside_context() {
        assert!(validate_relative_path("src/main.py").is_ok());
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("./a").is_err());
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn memory_limits() {
        assert!(is_memory_limit("512m"));
        assert!(is_memory_limit("1g"));
        assert!(is_memory_limit("1048576"));
        assert!(!is_memory_limit("1gg"));
        assert!(!is_memory_limit("m"));
        assert!(!is_memory_limit("-1m"));
    }

    #[test]
    fn names_are_unique() {
        assert_ne!(unique_name(), unique_name());
        assert!(unique_name().starts_with("toolhub-sandbox-"));
    }
}
