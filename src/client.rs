//! Per-client configuration and the loaded client table.
//!
//! Each client lives in `<clients.root>/<name>/` with a `config.json`:
//!
//! ```json
//! {
//!   "workflow": "demo",
//!   "steps": {
//!     "rephrase": { "input": ["input"], "mode": "async" }
//!   },
//!   "options": { "with_translation": false, "with_sentiment": false }
//! }
//! ```
//!
//! `workflow` defaults to the client's directory name. Clients are resolved
//! once at startup; [`ClientRegistry::reload`] re-reads one on request.
//! Names that collide with fixed server routes ([`RESERVED_CLIENT_NAMES`])
//! or could escape the clients root are rejected.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::prototypes::Services;
use crate::workflow::{OptionValue, Workflow, WorkflowCatalog};

pub const CLIENT_CONFIG_FILE: &str = "config.json";

/// First path segments already taken by server routes.
pub const RESERVED_CLIENT_NAMES: &[&str] = &["health", "admin"];

/// A client name must be a single plain directory name that no fixed route
/// shadows.
pub fn validate_client_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        bail!("Invalid client name '{}'", name);
    }
    if name.contains(['/', '\\']) || name.contains("..") {
        bail!("Invalid client name '{}': must not contain path separators or '..'", name);
    }
    if RESERVED_CLIENT_NAMES.contains(&name) {
        bail!(
            "Client name '{}' is reserved for a server route ({})",
            name,
            RESERVED_CLIENT_NAMES.join(", ")
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Run inline, answer 200 with the result.
    Sync,
    /// Answer 202 with a task id, run after the response is sent.
    #[default]
    Async,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub mode: StepMode,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepConfig>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse client config: {}", path.display()))
    }
}

/// A client bound to its workflow.
pub struct Client {
    pub name: String,
    pub config: ClientConfig,
    pub workflow: Arc<Workflow>,
}

impl Client {
    /// Fails when a configured step has no handler in `workflow`.
    pub fn new(name: impl Into<String>, config: ClientConfig, workflow: Arc<Workflow>) -> Result<Self> {
        let name = name.into();
        let missing: Vec<&str> = config
            .steps
            .keys()
            .map(String::as_str)
            .filter(|step| workflow.find(step).is_none())
            .collect();
        if !missing.is_empty() {
            bail!(
                "Client '{}' declares steps not provided by workflow '{}': {}",
                name,
                workflow.name(),
                missing.join(", ")
            );
        }
        Ok(Self {
            name,
            config,
            workflow,
        })
    }

    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.config.steps.get(name)
    }
}

/// Builds a client from `<clients.root>/<name>/config.json`.
pub fn load_client(config: &Config, catalog: &WorkflowCatalog, name: &str) -> Result<Client> {
    validate_client_name(name)?;
    let client_config = ClientConfig::from_file(&config.client_dir(name).join(CLIENT_CONFIG_FILE))?;
    let workflow_name = client_config
        .workflow
        .clone()
        .unwrap_or_else(|| name.to_string());
    let services = Services::from_config(config, name)?;
    let workflow = catalog.build(&workflow_name, &services).with_context(|| {
        format!(
            "Client '{}' uses unknown workflow '{}'. Available: {}",
            name,
            workflow_name,
            catalog.names().collect::<Vec<_>>().join(", ")
        )
    })?;
    Client::new(name, client_config, Arc::new(workflow))
}

/// Loaded clients by name.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Client>>>,
    loader: Option<(Config, WorkflowCatalog)>,
}

impl ClientRegistry {
    fn read_clients(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_clients(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registry without a backing directory; clients are added with
    /// [`insert`](Self::insert) and cannot be reloaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `<clients.root>/*/config.json`. Any invalid client,
    /// including one with a reserved name, fails the whole load.
    pub fn load_all(config: &Config, catalog: WorkflowCatalog) -> Result<Self> {
        let root = &config.clients.root;
        let mut clients = HashMap::new();
        if root.is_dir() {
            let mut names: Vec<String> = std::fs::read_dir(root)
                .with_context(|| format!("Failed to list clients in {}", root.display()))?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().join(CLIENT_CONFIG_FILE).is_file())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect();
            names.sort();
            for name in names {
                let client = load_client(config, &catalog, &name)?;
                info!(client = %name, workflow = client.workflow.name(), steps = client.config.steps.len(), "Loaded client");
                clients.insert(name, Arc::new(client));
            }
        }
        Ok(Self {
            clients: RwLock::new(clients),
            loader: Some((config.clone(), catalog)),
        })
    }

    pub fn insert(&self, client: Client) {
        self.write_clients()
            .insert(client.name.clone(), Arc::new(client));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Client>> {
        self.read_clients().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_clients().keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-reads one client's configuration. The old client stays in place
    /// if the new configuration is invalid.
    pub fn reload(&self, name: &str) -> Result<Arc<Client>> {
        validate_client_name(name)?;
        let Some((config, catalog)) = &self.loader else {
            bail!("Client registry has no configuration directory to reload from");
        };
        let client = Arc::new(load_client(config, catalog, name)?);
        self.write_clients().insert(name.to_string(), client.clone());
        info!(client = %name, "Reloaded client");
        Ok(client)
    }
}
