//! In-memory fleet and collaborator doubles shared by the integration
//! suites. `MockChannel` emulates enough of a managed host (file reads,
//! `systemctl`, `stat`, `find`) for the collector, backup and rollback
//! paths to run unmodified.

use async_trait::async_trait;
use drift_common::config::{AuditConfig, ClassifyConfig, RemediationConfig};
use drift_common::hash::{normalized_sha256_hex, sha256_hex};
use drift_common::manifest::{FileExpectation, FleetManifest, RoleManifest};
use drift_common::types::{ServiceState, Severity};
use drift_common::EngineError;
use driftd::audit::AuditLogger;
use driftd::backup::BackupManager;
use driftd::classify::Classifier;
use driftd::collector::StateCollector;
use driftd::detect::DetectionRunner;
use driftd::invoker::{ApplyReport, ConvergenceInvoker};
use driftd::lease::NodeLeases;
use driftd::notify::Notifier;
use driftd::orchestrator::{cancel_channel, Orchestrator};
use driftd::registry::ManifestRegistry;
use driftd::report::ReportEmitter;
use driftd::rollback::RollbackManager;
use driftd::transport::{CommandOutput, RemoteChannel};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::watch;

pub const GOOD_CONF: &str = "worker_processes 4;\nuser nginx;\n";
pub const GOOD_INDEX: &str = "<html>fleet home</html>\n";
pub const CONF_PATH: &str = "/etc/nginx/nginx.conf";
pub const INDEX_PATH: &str = "/var/www/html/index.html";
pub const WEB_ROOT: &str = "/var/www/html";
pub const SERVICE: &str = "nginx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub bytes: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockNode {
    pub files: BTreeMap<String, MockFile>,
    pub services: BTreeMap<String, ServiceState>,
    pub reachable: bool,
}

/// The simulated fleet. Interior mutability so tests can corrupt nodes
/// mid-scenario and assert on final machine state.
#[derive(Default)]
pub struct MockFleet {
    nodes: Mutex<HashMap<String, MockNode>>,
    /// Nodes whose `write_file` calls fail, for exercising restore errors.
    failing_writes: Mutex<Vec<String>>,
    /// Nodes whose `stat` calls fail, for exercising backup capture errors.
    failing_stats: Mutex<Vec<String>>,
}

impl MockFleet {
    pub fn add_node(&self, name: &str) {
        self.nodes.lock().unwrap().insert(
            name.to_string(),
            MockNode {
                reachable: true,
                ..MockNode::default()
            },
        );
    }

    pub fn set_file(&self, node: &str, path: &str, bytes: &[u8], mode: u32) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.get_mut(node).unwrap().files.insert(
            path.to_string(),
            MockFile {
                bytes: bytes.to_vec(),
                mode,
            },
        );
    }

    pub fn remove_file(&self, node: &str, path: &str) {
        self.nodes.lock().unwrap().get_mut(node).unwrap().files.remove(path);
    }

    pub fn set_service(&self, node: &str, service: &str, state: ServiceState) {
        self.nodes
            .lock()
            .unwrap()
            .get_mut(node)
            .unwrap()
            .services
            .insert(service.to_string(), state);
    }

    pub fn fail_writes(&self, node: &str) {
        self.failing_writes.lock().unwrap().push(node.to_string());
    }

    pub fn fail_stats(&self, node: &str) {
        self.failing_stats.lock().unwrap().push(node.to_string());
    }

    pub fn set_reachable(&self, node: &str, reachable: bool) {
        self.nodes.lock().unwrap().get_mut(node).unwrap().reachable = reachable;
    }

    pub fn file_bytes(&self, node: &str, path: &str) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .and_then(|n| n.files.get(path))
            .map(|f| f.bytes.clone())
    }

    pub fn service_state(&self, node: &str, service: &str) -> ServiceState {
        self.nodes.lock().unwrap()[node]
            .services
            .get(service)
            .copied()
            .unwrap_or(ServiceState::Unknown)
    }

    /// Full snapshot of one node, for before/after comparisons.
    pub fn snapshot(&self, node: &str) -> MockNode {
        self.nodes.lock().unwrap()[node].clone()
    }

    fn check_reachable(&self, node: &str) -> Result<(), EngineError> {
        let reachable = self
            .nodes
            .lock()
            .unwrap()
            .get(node)
            .map(|n| n.reachable)
            .unwrap_or(false);
        if reachable {
            Ok(())
        } else {
            Err(EngineError::Transport(format!("{}: connection refused", node)))
        }
    }
}

/// Channel backed by the in-memory fleet.
pub struct MockChannel {
    pub fleet: Arc<MockFleet>,
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into_bytes(),
        stderr: Vec::new(),
    }
}

fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn execute(&self, node: &str, command: &str) -> Result<CommandOutput, EngineError> {
        self.fleet.check_reachable(node)?;
        let mut nodes = self.fleet.nodes.lock().unwrap();
        let state = nodes.get_mut(node).unwrap();

        if let Some(service) = command.strip_prefix("systemctl is-active ") {
            let current = state
                .services
                .get(service)
                .copied()
                .unwrap_or(ServiceState::Unknown);
            let code = if current == ServiceState::Active { 0 } else { 3 };
            return Ok(CommandOutput {
                exit_code: code,
                stdout: format!("{}\n", current).into_bytes(),
                stderr: Vec::new(),
            });
        }
        if let Some(service) = command.strip_prefix("systemctl start ") {
            state
                .services
                .insert(service.to_string(), ServiceState::Active);
            return Ok(ok(String::new()));
        }
        if let Some(service) = command.strip_prefix("systemctl stop ") {
            state
                .services
                .insert(service.to_string(), ServiceState::Inactive);
            return Ok(ok(String::new()));
        }
        if let Some(rest) = command.strip_prefix("stat -c %a '") {
            if self
                .fleet
                .failing_stats
                .lock()
                .unwrap()
                .iter()
                .any(|n| n == node)
            {
                return Err(EngineError::Transport(format!("{}: broken pipe", node)));
            }
            let path = rest.trim_end_matches('\'');
            return Ok(match state.files.get(path) {
                Some(file) => ok(format!("{:o}\n", file.mode)),
                None => failed(1, "stat: no such file"),
            });
        }
        if let Some(rest) = command.strip_prefix("find '") {
            let dir = rest.trim_end_matches("' -type f");
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let listing: String = state
                .files
                .keys()
                .filter(|p| p.starts_with(&prefix))
                .map(|p| format!("{}\n", p))
                .collect();
            return Ok(ok(listing));
        }

        Ok(failed(127, "command not found"))
    }

    async fn read_file(&self, node: &str, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.fleet.check_reachable(node)?;
        Ok(self.fleet.file_bytes(node, path))
    }

    async fn write_file(
        &self,
        node: &str,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        self.fleet.check_reachable(node)?;
        if self
            .fleet
            .failing_writes
            .lock()
            .unwrap()
            .iter()
            .any(|n| n == node)
        {
            return Err(EngineError::Transport(format!("{}: disk full", node)));
        }
        let mut nodes = self.fleet.nodes.lock().unwrap();
        let state = nodes.get_mut(node).unwrap();
        let mode = mode
            .or_else(|| state.files.get(path).map(|f| f.mode))
            .unwrap_or(0o644);
        state.files.insert(
            path.to_string(),
            MockFile {
                bytes: contents.to_vec(),
                mode,
            },
        );
        Ok(())
    }
}

/// What the invoker does when asked to converge a node.
#[derive(Debug, Clone, Copy)]
pub enum InvokerBehavior {
    /// Write the desired state (the honest convergence action).
    Converge,
    /// Report success while leaving drift behind.
    Corrupt,
    /// Fail the first N calls, then converge.
    FailTransient(u32),
    /// Fail every call.
    AlwaysFail,
}

#[derive(Debug, Clone, Default)]
pub struct DesiredNode {
    pub files: BTreeMap<String, (Vec<u8>, u32)>,
    pub services: BTreeMap<String, ServiceState>,
    pub managed_dirs: Vec<String>,
}

/// Convergence double: rewrites the in-memory node instead of running a
/// playbook. Behavior is configurable per node.
pub struct MockInvoker {
    fleet: Arc<MockFleet>,
    desired: HashMap<String, DesiredNode>,
    behavior: Mutex<HashMap<String, InvokerBehavior>>,
    calls: Mutex<HashMap<String, u32>>,
    cancel_hook: Mutex<Option<watch::Sender<bool>>>,
}

impl MockInvoker {
    pub fn new(fleet: Arc<MockFleet>, desired: HashMap<String, DesiredNode>) -> Self {
        Self {
            fleet,
            desired,
            behavior: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            cancel_hook: Mutex::new(None),
        }
    }

    /// Flip the plan's cancellation flag once the first apply call has
    /// landed, for exercising cancellation while a node is mid-attempt.
    pub fn cancel_after_first_call(&self, tx: watch::Sender<bool>) {
        *self.cancel_hook.lock().unwrap() = Some(tx);
    }

    pub fn set_behavior(&self, node: &str, behavior: InvokerBehavior) {
        self.behavior
            .lock()
            .unwrap()
            .insert(node.to_string(), behavior);
    }

    pub fn calls_for(&self, node: &str) -> u32 {
        self.calls.lock().unwrap().get(node).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn converge(&self, node: &str) {
        let desired = &self.desired[node];
        for (path, (bytes, mode)) in &desired.files {
            self.fleet.set_file(node, path, bytes, *mode);
        }
        for dir in &desired.managed_dirs {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let extras: Vec<String> = self
                .fleet
                .snapshot(node)
                .files
                .keys()
                .filter(|p| p.starts_with(&prefix) && !desired.files.contains_key(*p))
                .cloned()
                .collect();
            for path in extras {
                self.fleet.remove_file(node, &path);
            }
        }
        for (service, state) in &desired.services {
            self.fleet.set_service(node, service, *state);
        }
    }
}

#[async_trait]
impl ConvergenceInvoker for MockInvoker {
    async fn apply(&self, node: &str, scope: &str) -> Result<ApplyReport, EngineError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(node.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if let Some(tx) = self.cancel_hook.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .get(node)
            .copied()
            .unwrap_or(InvokerBehavior::Converge);

        match behavior {
            InvokerBehavior::Converge => {
                self.converge(node);
                Ok(ApplyReport {
                    changed: true,
                    detail: format!("converged {}", scope),
                })
            }
            InvokerBehavior::Corrupt => {
                self.fleet
                    .set_file(node, CONF_PATH, b"# mangled by broken role\n", 0o644);
                Ok(ApplyReport {
                    changed: true,
                    detail: format!("converged {}", scope),
                })
            }
            InvokerBehavior::FailTransient(n) => {
                if call <= n {
                    Err(EngineError::Apply(format!("{}: connection reset", node)))
                } else {
                    self.converge(node);
                    Ok(ApplyReport {
                        changed: true,
                        detail: format!("converged {}", scope),
                    })
                }
            }
            InvokerBehavior::AlwaysFail => {
                Err(EngineError::Apply(format!("{}: playbook failed", node)))
            }
        }
    }
}

/// Captures notifications for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String, Severity)>>,
}

impl RecordingNotifier {
    pub fn events(&self, event_type: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == event_type)
            .map(|(_, m, _)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event_type: &str, message: &str, severity: Severity, _source: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((event_type.to_string(), message.to_string(), severity));
    }
}

/// A web-role fleet where every node starts fully converged.
pub struct Harness {
    pub fleet: Arc<MockFleet>,
    pub registry: Arc<ManifestRegistry>,
    pub runner: DetectionRunner,
    pub orchestrator: Orchestrator,
    pub invoker: Arc<MockInvoker>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<AuditLogger>,
    pub emitter: ReportEmitter,
    pub cancel_tx: watch::Sender<bool>,
    pub backup_dir: std::path::PathBuf,
    _tmp: TempDir,
}

pub async fn web_fleet(node_names: &[&str]) -> Harness {
    let fleet = Arc::new(MockFleet::default());
    let mut desired = HashMap::new();
    let mut nodes = BTreeMap::new();

    for name in node_names {
        fleet.add_node(name);
        fleet.set_file(name, CONF_PATH, GOOD_CONF.as_bytes(), 0o644);
        fleet.set_file(name, INDEX_PATH, GOOD_INDEX.as_bytes(), 0o644);
        fleet.set_service(name, SERVICE, ServiceState::Active);
        nodes.insert(name.to_string(), "webserver".to_string());

        let mut files = BTreeMap::new();
        files.insert(
            CONF_PATH.to_string(),
            (GOOD_CONF.as_bytes().to_vec(), 0o644),
        );
        files.insert(
            INDEX_PATH.to_string(),
            (GOOD_INDEX.as_bytes().to_vec(), 0o644),
        );
        desired.insert(
            name.to_string(),
            DesiredNode {
                files,
                services: [(SERVICE.to_string(), ServiceState::Active)].into(),
                managed_dirs: vec![WEB_ROOT.to_string()],
            },
        );
    }

    let mut files = BTreeMap::new();
    files.insert(
        CONF_PATH.to_string(),
        FileExpectation {
            sha256: sha256_hex(GOOD_CONF.as_bytes()),
            normalized_sha256: Some(normalized_sha256_hex(GOOD_CONF.as_bytes())),
        },
    );
    files.insert(
        INDEX_PATH.to_string(),
        FileExpectation {
            sha256: sha256_hex(GOOD_INDEX.as_bytes()),
            normalized_sha256: Some(normalized_sha256_hex(GOOD_INDEX.as_bytes())),
        },
    );
    let role = RoleManifest {
        files,
        services: [(SERVICE.to_string(), ServiceState::Active)].into(),
        managed_dirs: vec![WEB_ROOT.to_string()],
    };
    let manifest = FleetManifest {
        roles: [("webserver".to_string(), role)].into(),
        nodes,
    };
    let registry = Arc::new(ManifestRegistry::from_manifest(manifest).unwrap());

    let tmp = TempDir::new().unwrap();
    let audit_config = AuditConfig {
        dir: tmp.path().join("audit").to_string_lossy().to_string(),
        max_write_retries: 2,
        backoff_ms: 1,
    };
    let remediation = RemediationConfig {
        canary_fraction: 0.25,
        apply_max_retries: 2,
        apply_backoff_ms: 1,
        backup_dir: tmp.path().join("backups").to_string_lossy().to_string(),
        playbook: "site.yml".to_string(),
        inventory: "hosts.ini".to_string(),
    };

    let channel: Arc<dyn RemoteChannel> = Arc::new(MockChannel {
        fleet: fleet.clone(),
    });
    let collector = Arc::new(StateCollector::new(channel.clone()));
    let classifier = Arc::new(Classifier::new(ClassifyConfig::default()));
    let audit = Arc::new(AuditLogger::open(&audit_config).await.unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let leases = NodeLeases::new();
    let report_dir = tmp.path().join("reports");

    let runner = DetectionRunner::new(
        collector.clone(),
        classifier.clone(),
        ReportEmitter::new(&report_dir),
        audit.clone(),
        notifier.clone(),
        leases.clone(),
        4,
    );

    let invoker = Arc::new(MockInvoker::new(fleet.clone(), desired));
    let backups = Arc::new(BackupManager::new(channel.clone(), tmp.path().join("backups")));
    let rollback = Arc::new(RollbackManager::new(channel));
    let (cancel_tx, cancel_rx) = cancel_channel();

    let orchestrator = Orchestrator::new(
        collector,
        classifier,
        backups,
        rollback,
        invoker.clone(),
        audit.clone(),
        notifier.clone(),
        leases,
        remediation,
        4,
        cancel_rx,
    );

    Harness {
        fleet,
        registry,
        runner,
        orchestrator,
        invoker,
        notifier,
        audit,
        emitter: ReportEmitter::new(&report_dir),
        cancel_tx,
        backup_dir: tmp.path().join("backups"),
        _tmp: tmp,
    }
}
