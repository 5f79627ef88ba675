//! Declarative configuration: tool server definitions, their per-instance
//! configuration records, and the settings of the sandbox, proxy and
//! database collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use toolhub_error::HubError;
use toolhub_stdio_transport::LaunchSpec;

use crate::db::DatabaseSettings;
use crate::proxy::ProxySettings;
use crate::sandbox::SandboxSettings;
use crate::tools::TOOL_NAME_SEPARATOR;

const DEFAULT_SERVER_LOG_LINES: usize = 500;

/// How one tool server is launched, before per-instance configuration is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ConfigSchema>,
    #[serde(default)]
    pub disabled: bool,
}

/// Which arguments (`${key}` placeholders) and env vars an end user may set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSchema {
    #[serde(default)]
    pub args: BTreeMap<String, ConfigField>,
    #[serde(default)]
    pub env: BTreeMap<String, ConfigField>,
}

impl ConfigSchema {
    fn has_required_fields(&self) -> bool {
        self.args.values().chain(self.env.values()).any(|field| !field.optional)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// One configured instance of a server definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigInstance {
    pub server_name: String,
    pub config_id: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The fully resolved configuration a connection is launched with. Two
/// launch configs compare equal exactly when a running connection can be kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLaunchConfig {
    pub launch: LaunchSpec,
    #[serde(default)]
    pub disabled: bool,
}

/// Desired connections keyed by connection name.
pub type ServersConfig = BTreeMap<String, ServerLaunchConfig>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSettings {
    /// Deadline for tool calls and discovery requests; the handshake is never bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_server_log_lines")]
    pub log_lines: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            log_lines: DEFAULT_SERVER_LOG_LINES,
        }
    }
}

fn default_server_log_lines() -> usize {
    DEFAULT_SERVER_LOG_LINES
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolhubConfig {
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
    #[serde(default)]
    pub server_configs: Vec<ServerConfigInstance>,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

impl ToolhubConfig {
    pub fn from_json(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text)
            .map_err(|err| HubError::configuration(format!("invalid config json: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self, HubError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            HubError::configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn servers_config(&self) -> Result<ServersConfig, HubError> {
        resolve_servers(&self.servers, &self.server_configs)
    }
}

/// Supplies the authoritative desired server set for one reconciliation pass.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn servers_config(&self) -> Result<ServersConfig, HubError>;
}

#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn servers_config(&self) -> Result<ServersConfig, HubError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            HubError::configuration(format!("failed to read {}: {err}", self.path.display()))
        })?;
        ToolhubConfig::from_json(&text)?.servers_config()
    }
}

/// Expands definitions and their instances into launchable connections.
///
/// A definition without instances runs once under its own name, unless its
/// config schema has required fields, in which case it waits for an instance.
/// Each instance runs under `<name>_<configId>`.
pub fn resolve_servers(
    definitions: &[ServerDefinition],
    instances: &[ServerConfigInstance],
) -> Result<ServersConfig, HubError> {
    let mut by_name = BTreeMap::new();
    for definition in definitions {
        validate_definition(definition)?;
        if by_name.insert(definition.name.as_str(), definition).is_some() {
            return Err(HubError::configuration(format!(
                "duplicate server definition: {}",
                definition.name
            )));
        }
    }

    let mut instances_by_server: BTreeMap<&str, Vec<&ServerConfigInstance>> = BTreeMap::new();
    for instance in instances {
        if !by_name.contains_key(instance.server_name.as_str()) {
            return Err(HubError::configuration(format!(
                "server config {} references unknown server {}",
                instance.config_id, instance.server_name
            )));
        }
        instances_by_server
            .entry(instance.server_name.as_str())
            .or_default()
            .push(instance);
    }

    let mut resolved = ServersConfig::new();
    for (name, definition) in by_name {
        match instances_by_server.get(name) {
            Some(instances) => {
                for instance in instances {
                    let key = format!("{}_{}", definition.name, instance.config_id);
                    if key.contains(TOOL_NAME_SEPARATOR) {
                        return Err(HubError::configuration(format!(
                            "connection name {key} must not contain {TOOL_NAME_SEPARATOR}"
                        )));
                    }
                    let config = resolve_instance(definition, Some(instance))?;
                    if resolved.insert(key.clone(), config).is_some() {
                        return Err(HubError::configuration(format!(
                            "duplicate connection name: {key}"
                        )));
                    }
                }
            }
            None => {
                let needs_instance = definition
                    .config_schema
                    .as_ref()
                    .map(ConfigSchema::has_required_fields)
                    .unwrap_or(false);
                if needs_instance {
                    tracing::debug!(server = %name, "server requires configuration; not launching");
                    continue;
                }
                let config = resolve_instance(definition, None)?;
                if resolved.insert(name.to_string(), config).is_some() {
                    return Err(HubError::configuration(format!(
                        "duplicate connection name: {name}"
                    )));
                }
            }
        }
    }
    Ok(resolved)
}

fn validate_definition(definition: &ServerDefinition) -> Result<(), HubError> {
    if definition.name.trim().is_empty() {
        return Err(HubError::configuration("server name cannot be empty"));
    }
    if definition.name.contains(TOOL_NAME_SEPARATOR) {
        return Err(HubError::configuration(format!(
            "server name {} must not contain {TOOL_NAME_SEPARATOR}",
            definition.name
        )));
    }
    if definition.command.trim().is_empty() {
        return Err(HubError::configuration(format!(
            "server {} has an empty command",
            definition.name
        )));
    }
    Ok(())
}

fn resolve_instance(
    definition: &ServerDefinition,
    instance: Option<&ServerConfigInstance>,
) -> Result<ServerLaunchConfig, HubError> {
    let schema = definition.config_schema.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let arg_values = instance.map(|i| &i.args).unwrap_or(&empty);
    let env_values = instance.map(|i| &i.env).unwrap_or(&empty);
    let label = instance
        .map(|i| format!("{}/{}", definition.name, i.config_id))
        .unwrap_or_else(|| definition.name.clone());

    check_fields(&label, "argument", &schema.args, arg_values)?;
    check_fields(&label, "env var", &schema.env, env_values)?;

    let mut args = Vec::with_capacity(definition.args.len());
    for arg in &definition.args {
        let substituted = substitute_placeholders(arg, arg_values);
        let pure_placeholder = placeholder_keys(arg).len() == 1
            && arg.trim().starts_with("${")
            && arg.trim().ends_with('}');
        if substituted.is_empty() && pure_placeholder {
            continue;
        }
        args.push(substituted);
    }

    let mut env = definition.env.clone();
    for (key, value) in env_values {
        env.insert(key.clone(), value.clone());
    }

    Ok(ServerLaunchConfig {
        launch: LaunchSpec {
            program: PathBuf::from(&definition.command),
            args,
            env,
            cwd: definition.cwd.clone(),
        },
        disabled: definition.disabled,
    })
}

fn check_fields(
    label: &str,
    kind: &str,
    fields: &BTreeMap<String, ConfigField>,
    values: &BTreeMap<String, String>,
) -> Result<(), HubError> {
    for key in values.keys() {
        if !fields.contains_key(key) {
            return Err(HubError::configuration(format!(
                "{label}: {kind} {key} is not configurable"
            )));
        }
    }
    for (key, field) in fields {
        if !field.optional && !values.contains_key(key) {
            return Err(HubError::configuration(format!(
                "{label}: required {kind} {key} is missing"
            )));
        }
    }
    Ok(())
}

fn placeholder_keys(text: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        keys.insert(after[..end].to_string());
        rest = &after[end + 1..];
    }
    keys
}

fn substitute_placeholders(text: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        if let Some(value) = values.get(&after[..end]) {
            out.push_str(value);
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> ServerDefinition {
        ServerDefinition {
            name: name.to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), format!("@example/{name}")],
            env: BTreeMap::new(),
            cwd: None,
            config_schema: None,
            disabled: false,
        }
    }

    fn instance(server: &str, id: &str) -> ServerConfigInstance {
        ServerConfigInstance {
            server_name: server.to_string(),
            config_id: id.to_string(),
            args: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn definition_without_instances_runs_under_its_name() {
        let resolved = resolve_servers(&[definition("fetch")], &[]).unwrap();
        let config = &resolved["fetch"];
        assert_eq!(config.launch.program, PathBuf::from("npx"));
        assert_eq!(config.launch.args, vec!["-y", "@example/fetch"]);
    }

    #[test]
    fn instances_expand_into_separate_connections() {
        let mut postgres = definition("postgres");
        postgres.args.push("${url}".to_string());
        postgres.config_schema = Some(ConfigSchema {
            args: BTreeMap::from([("url".to_string(), ConfigField::default())]),
            env: BTreeMap::from([(
                "PGPASSWORD".to_string(),
                ConfigField {
                    description: None,
                    optional: true,
                },
            )]),
        });

        let mut first = instance("postgres", "1");
        first.args.insert("url".to_string(), "postgres://a".to_string());
        first.env.insert("PGPASSWORD".to_string(), "secret".to_string());
        let mut second = instance("postgres", "2");
        second.args.insert("url".to_string(), "postgres://b".to_string());

        let resolved = resolve_servers(&[postgres], &[first, second]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["postgres_1"].launch.args.last().unwrap(), "postgres://a");
        assert_eq!(resolved["postgres_1"].launch.env["PGPASSWORD"], "secret");
        assert_eq!(resolved["postgres_2"].launch.args.last().unwrap(), "postgres://b");
        assert!(!resolved["postgres_2"].launch.env.contains_key("PGPASSWORD"));
    }

    #[test]
    fn missing_required_field_is_a_configuration_error() {
        let mut github = definition("github");
        github.config_schema = Some(ConfigSchema {
            args: BTreeMap::new(),
            env: BTreeMap::from([("GITHUB_TOKEN".to_string(), ConfigField::default())]),
        });

        let resolved = resolve_servers(&[github.clone()], &[]).unwrap();
        assert!(resolved.is_empty());

        let err = resolve_servers(&[github], &[instance("github", "main")]).unwrap_err();
        assert!(matches!(err, HubError::Configuration { .. }));
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn optional_pure_placeholder_is_dropped() {
        let mut def = definition("fs");
        def.args.push("${root}".to_string());
        def.config_schema = Some(ConfigSchema {
            args: BTreeMap::from([(
                "root".to_string(),
                ConfigField {
                    description: None,
                    optional: true,
                },
            )]),
            env: BTreeMap::new(),
        });
        let resolved = resolve_servers(&[def], &[]).unwrap();
        assert_eq!(resolved["fs"].launch.args, vec!["-y", "@example/fs"]);
    }

    #[test]
    fn separator_in_server_name_is_rejected() {
        let err = resolve_servers(&[definition("web--search")], &[]).unwrap_err();
        assert!(matches!(err, HubError::Configuration { .. }));
    }

    #[test]
    fn instance_for_unknown_server_is_rejected() {
        let err = resolve_servers(&[definition("fetch")], &[instance("nope", "1")]).unwrap_err();
        assert!(err.to_string().contains("unknown server nope"));
    }

    #[test]
    fn config_document_parses_with_defaults() {
        let config = ToolhubConfig::from_json(
            r#"{
                "servers": [{"name": "fetch", "command": "uvx", "args": ["mcp-server-fetch"], "disabled": true}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.hub.log_lines, DEFAULT_SERVER_LOG_LINES);
        let servers = config.servers_config().unwrap();
        assert!(servers["fetch"].disabled);
    }
}
