// # fabricctl - Fabric Reconciliation Runner
//
// Thin integration layer: reads configuration, registers clients, runs one
// engine command and reports the outcome. All reconciliation logic lives in
// fabric-core.
//
// ## Usage
//
// ```bash
// fabricctl apply     # converge the fabric to the desired-state file
// fabricctl refresh   # re-read tracked objects, forget vanished ones
// fabricctl destroy   # delete everything tracked
// ```
//
// ## Configuration
//
// Connection settings come from environment variables; the resources to
// manage come from a JSON desired-state file.
//
// ### Client
// - `FABRIC_CLIENT_TYPE`: apstra (default) or memory
// - `FABRIC_APSTRA_URL`: Controller base URL
// - `FABRIC_APSTRA_USERNAME` / `FABRIC_APSTRA_PASSWORD`: Login credentials
// - `FABRIC_APSTRA_TLS_VALIDATION_DISABLED`: true to skip certificate checks
// - `FABRIC_APSTRA_TIMEOUT_SECS`: Per-request timeout (default 30)
// - `FABRIC_LOCK_TIMEOUT_SECS`: Blueprint mutex wait (default 120)
// - `FABRIC_LOCK_POLL_INTERVAL_MS`: Delay between mutex attempts (default 500)
//
// ### Desired State
// - `FABRIC_RESOURCES_FILE`: Path to the JSON desired-state file
//
// ### State Store
// - `FABRIC_STATE_STORE_TYPE`: file (default) or memory
// - `FABRIC_STATE_STORE_PATH`: Path to the state file (for file store)
//
// ### Engine
// - `FABRIC_BLUEPRINT_MUTEX_DISABLED`: true to skip the blueprint mutex
// - `FABRIC_LOG_LEVEL`: trace, debug, info (default), warn, error
//
// ## Desired-State File
//
// ```json
// {
//   "resources": [
//     {
//       "address": "generic_system.web",
//       "type": "generic_system",
//       "blueprint_id": "bp-1",
//       "links": [
//         { "target_switch_id": "leaf1", "target_switch_if_name": "xe-0/0/1" }
//       ]
//     }
//   ]
// }
// ```
//
// With the memory client, a `memory_blueprints` list seeds the in-memory
// fabric.

use anyhow::{Context, Result};
use fabric_core::config::{ClientConfig, EngineConfig, FabricConfig, MemorySeed, ResourceConfig, StateStoreConfig};
use fabric_core::{ClientRegistry, EngineEvent, Error, FabricEngine, RunSummary};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for different termination scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FabricExitCode {
    /// Every address converged
    Success = 0,
    /// Configuration or startup error
    ConfigError = 1,
    /// Runtime error before any address was processed
    RuntimeError = 2,
    /// At least one address failed
    PartialFailure = 3,
    /// Interrupted by SIGINT
    Cancelled = 130,
}

impl From<FabricExitCode> for ExitCode {
    fn from(code: FabricExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Engine command selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Apply,
    Refresh,
    Destroy,
}

impl Command {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            Some("apply") => Ok(Command::Apply),
            Some("refresh") => Ok(Command::Refresh),
            Some("destroy") => Ok(Command::Destroy),
            Some(other) => anyhow::bail!("Unknown command '{}'. Valid commands: apply, refresh, destroy", other),
            None => anyhow::bail!("Missing command. Usage: fabricctl <apply|refresh|destroy>"),
        }
    }
}

/// Contents of the desired-state file
#[derive(Debug, Default, Deserialize)]
struct DesiredState {
    #[serde(default)]
    resources: Vec<ResourceConfig>,
    #[serde(default)]
    memory_blueprints: Vec<MemorySeed>,
}

impl DesiredState {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read desired-state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse desired-state file {}", path.display()))
    }
}

/// Application configuration
struct Config {
    fabric: FabricConfig,
    log_level: Level,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup` (environment or test map)
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let desired = match var("FABRIC_RESOURCES_FILE") {
            Some(path) => DesiredState::load(Path::new(&path))?,
            None => anyhow::bail!(
                "FABRIC_RESOURCES_FILE is required. \
                Set it via: export FABRIC_RESOURCES_FILE=/etc/fabric/desired.json"
            ),
        };

        let client = match var("FABRIC_CLIENT_TYPE").as_deref().unwrap_or("apstra") {
            "apstra" => ClientConfig::Apstra {
                url: var("FABRIC_APSTRA_URL").context("FABRIC_APSTRA_URL is required for the apstra client")?,
                username: var("FABRIC_APSTRA_USERNAME")
                    .context("FABRIC_APSTRA_USERNAME is required for the apstra client")?,
                password: var("FABRIC_APSTRA_PASSWORD")
                    .context("FABRIC_APSTRA_PASSWORD is required for the apstra client")?,
                tls_validation_disabled: parse_var(&var, "FABRIC_APSTRA_TLS_VALIDATION_DISABLED", false)?,
                timeout_secs: parse_var(&var, "FABRIC_APSTRA_TIMEOUT_SECS", 30)?,
                lock_timeout_secs: parse_var(&var, "FABRIC_LOCK_TIMEOUT_SECS", 120)?,
                lock_poll_interval_ms: parse_var(&var, "FABRIC_LOCK_POLL_INTERVAL_MS", 500)?,
            },
            "memory" => ClientConfig::Memory {
                blueprints: desired.memory_blueprints,
            },
            other => anyhow::bail!(
                "FABRIC_CLIENT_TYPE '{}' is not supported. Supported types: apstra, memory",
                other
            ),
        };

        let state_store = match var("FABRIC_STATE_STORE_TYPE").as_deref().unwrap_or("file") {
            "file" => {
                let path = var("FABRIC_STATE_STORE_PATH").context(
                    "FABRIC_STATE_STORE_PATH is required when FABRIC_STATE_STORE_TYPE=file. \
                    Set it via: export FABRIC_STATE_STORE_PATH=/var/lib/fabric/state.json",
                )?;
                if let Some(parent) = Path::new(&path).parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    anyhow::bail!(
                        "FABRIC_STATE_STORE_PATH parent directory does not exist: {}",
                        parent.display()
                    );
                }
                StateStoreConfig::File { path }
            }
            "memory" => StateStoreConfig::Memory,
            other => anyhow::bail!(
                "FABRIC_STATE_STORE_TYPE '{}' is not supported. Supported types: file, memory",
                other
            ),
        };

        let log_level = match var("FABRIC_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string())
            .to_lowercase()
            .as_str()
        {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            other => anyhow::bail!(
                "FABRIC_LOG_LEVEL '{}' is not valid. Valid levels: trace, debug, info, warn, error",
                other
            ),
        };

        let fabric = FabricConfig {
            client,
            state_store,
            resources: desired.resources,
            engine: EngineConfig {
                blueprint_mutex_disabled: parse_var(&var, "FABRIC_BLUEPRINT_MUTEX_DISABLED", false)?,
                ..EngineConfig::default()
            },
        };
        fabric.validate()?;

        Ok(Self { fabric, log_level })
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{raw}': {e}")),
        None => Ok(default),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let command = match Command::parse(args.get(1).map(String::as_str)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}");
            return FabricExitCode::ConfigError.into();
        }
    };

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            return FabricExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(config.log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return FabricExitCode::ConfigError.into();
    }

    info!(command = ?command, resources = config.fabric.resources.len(), "Starting fabricctl");

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return FabricExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run(command, config.fabric)).into()
}

/// Build the engine and run one command until it finishes or SIGINT arrives
async fn run(command: Command, config: FabricConfig) -> FabricExitCode {
    let registry = ClientRegistry::with_defaults();
    #[cfg(feature = "apstra")]
    fabric_client_apstra::register(&registry);

    let client = match registry.create_client(&config.client) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create {} client: {}", config.client.type_name(), e);
            return FabricExitCode::ConfigError;
        }
    };
    let state_store = match registry.create_state_store(&config.state_store) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to create {} state store: {}", config.state_store.type_name(), e);
            return FabricExitCode::ConfigError;
        }
    };
    let (engine, events) = match FabricEngine::new(client, state_store, &config.engine) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to create engine: {}", e);
            return FabricExitCode::ConfigError;
        }
    };
    info!(client = engine.client_name(), "Engine ready");

    let logger = tokio::spawn(log_events(events));
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let result = match command {
        Command::Apply => engine.apply(&config.resources, &cancel).await,
        Command::Refresh => engine.refresh(&cancel).await,
        Command::Destroy => engine.destroy(&cancel).await,
    };

    interrupt.abort();
    drop(engine);
    if let Err(e) = logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    exit_code(&result)
}

fn exit_code(result: &fabric_core::Result<RunSummary>) -> FabricExitCode {
    match result {
        Ok(summary) => {
            info!(
                created = summary.created,
                updated = summary.updated,
                unchanged = summary.unchanged,
                deleted = summary.deleted,
                removed = summary.removed,
                failed = summary.failed.len(),
                "Run finished"
            );
            for warning in &summary.warnings {
                warn!("{}", warning);
            }
            for (address, message) in &summary.failed {
                error!(address = %address, "{}", message);
            }
            if summary.is_success() {
                FabricExitCode::Success
            } else {
                FabricExitCode::PartialFailure
            }
        }
        Err(Error::Cancelled) => {
            warn!("Run cancelled; tracked state was saved");
            FabricExitCode::Cancelled
        }
        Err(e) => {
            error!("Run failed: {}", e);
            FabricExitCode::RuntimeError
        }
    }
}

/// Log engine events until the engine is dropped
async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Started { resources_count } => info!(resources_count, "Run started"),
            EngineEvent::PlanComputed { address, action } => info!(address = %address, action = ?action, "Planned"),
            EngineEvent::ResourceCreated { address } => info!(address = %address, "Created"),
            EngineEvent::ResourceUpdated { address, changes } => info!(address = %address, changes, "Updated"),
            EngineEvent::ResourceUnchanged { address } => info!(address = %address, "Unchanged"),
            EngineEvent::ResourceRemoved { address } => warn!(address = %address, "Missing on controller"),
            EngineEvent::ResourceDeleted { address } => info!(address = %address, "Deleted"),
            EngineEvent::ResourceFailed { address, error } => error!(address = %address, "Failed: {}", error),
            EngineEvent::Stopped { reason } => info!(reason = %reason, "Run stopped"),
        }
    }
}

/// Cancel `token` on SIGINT
async fn cancel_on_interrupt(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Received SIGINT, stopping after the current call");
            token.cancel();
        }
        Err(e) => error!("Failed to wait for CTRL-C: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn desired_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    const DESIRED: &str = r#"{
        "memory_blueprints": [
            { "id": "bp", "switches": { "leaf1": ["xe-0/0/1"] } }
        ],
        "resources": [
            {
                "address": "generic_system.web",
                "type": "generic_system",
                "blueprint_id": "bp",
                "links": [
                    { "target_switch_id": "leaf1", "target_switch_if_name": "xe-0/0/1" }
                ]
            }
        ]
    }"#;

    #[test]
    fn command_parsing() {
        assert_eq!(Command::parse(Some("apply")).unwrap(), Command::Apply);
        assert_eq!(Command::parse(Some("destroy")).unwrap(), Command::Destroy);
        assert!(Command::parse(Some("plan")).is_err());
        assert!(Command::parse(None).is_err());
    }

    #[test]
    fn memory_config_loads_seeds_and_resources() {
        let file = desired_file(DESIRED);
        let path = file.path().to_string_lossy().to_string();
        let config = Config::from_lookup(lookup(&[
            ("FABRIC_RESOURCES_FILE", path.as_str()),
            ("FABRIC_CLIENT_TYPE", "memory"),
            ("FABRIC_STATE_STORE_TYPE", "memory"),
            ("FABRIC_LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();

        assert_eq!(config.fabric.resources.len(), 1);
        assert_eq!(config.log_level, Level::DEBUG);
        match &config.fabric.client {
            ClientConfig::Memory { blueprints } => assert_eq!(blueprints[0].id, "bp"),
            other => panic!("unexpected client {other:?}"),
        }
    }

    #[test]
    fn apstra_requires_credentials() {
        let file = desired_file(DESIRED);
        let path = file.path().to_string_lossy().to_string();
        let result = Config::from_lookup(lookup(&[
            ("FABRIC_RESOURCES_FILE", path.as_str()),
            ("FABRIC_APSTRA_URL", "https://apstra.example.com"),
            ("FABRIC_STATE_STORE_TYPE", "memory"),
        ]));
        let message = format!("{:#}", result.err().unwrap());
        assert!(message.contains("FABRIC_APSTRA_USERNAME"), "{message}");
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let file = desired_file(DESIRED);
        let path = file.path().to_string_lossy().to_string();
        let result = Config::from_lookup(lookup(&[
            ("FABRIC_RESOURCES_FILE", path.as_str()),
            ("FABRIC_APSTRA_URL", "https://apstra.example.com"),
            ("FABRIC_APSTRA_USERNAME", "admin"),
            ("FABRIC_APSTRA_PASSWORD", "pw"),
            ("FABRIC_APSTRA_TIMEOUT_SECS", "soon"),
            ("FABRIC_STATE_STORE_TYPE", "memory"),
        ]));
        let message = format!("{:#}", result.err().unwrap());
        assert!(message.contains("FABRIC_APSTRA_TIMEOUT_SECS"), "{message}");
    }

    #[test]
    fn file_store_requires_path() {
        let file = desired_file(DESIRED);
        let path = file.path().to_string_lossy().to_string();
        let result = Config::from_lookup(lookup(&[
            ("FABRIC_RESOURCES_FILE", path.as_str()),
            ("FABRIC_CLIENT_TYPE", "memory"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn missing_resources_file_is_reported() {
        let result = Config::from_lookup(lookup(&[("FABRIC_CLIENT_TYPE", "memory")]));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn apply_against_memory_fabric_succeeds() {
        let file = desired_file(DESIRED);
        let path = file.path().to_string_lossy().to_string();
        let config = Config::from_lookup(lookup(&[
            ("FABRIC_RESOURCES_FILE", path.as_str()),
            ("FABRIC_CLIENT_TYPE", "memory"),
            ("FABRIC_STATE_STORE_TYPE", "memory"),
        ]))
        .unwrap();

        assert_eq!(run(Command::Apply, config.fabric).await, FabricExitCode::Success);
    }

    #[test]
    fn exit_codes_follow_summary() {
        assert_eq!(exit_code(&Ok(RunSummary::default())), FabricExitCode::Success);

        let failed = RunSummary {
            failed: vec![("web".into(), "boom".into())],
            ..RunSummary::default()
        };
        assert_eq!(exit_code(&Ok(failed)), FabricExitCode::PartialFailure);
        assert_eq!(exit_code(&Err(Error::Cancelled)), FabricExitCode::Cancelled);
        assert_eq!(exit_code(&Err(Error::config("bad"))), FabricExitCode::RuntimeError);
    }
}
