//! In-memory collaborators for unit tests

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::publisher::ResultSink;
use super::resolver::ResourceSourceClient;
use super::scan::{ExitStatus, ScanInvocation, ScanProcess};
use super::ssh_key::{GeneratedKeyPair, KeyAlgorithm, KeyGenerator, RemoteExecutor, RemoteSession};
use super::tasks::BackgroundTasks;
use super::tunnel::TunnelBroker;

/// Object, parameter and secret stores keyed by `kind:locator`
#[derive(Default)]
pub(crate) struct FakeSources {
    items: HashMap<String, Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, bucket: &str, key: &str, body: &str) -> Self {
        self.items
            .insert(format!("object:{bucket}/{key}"), body.as_bytes().to_vec());
        self
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.items
            .insert(format!("parameter:{name}"), value.as_bytes().to_vec());
        self
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.with_secret_bytes(name, value.as_bytes().to_vec())
    }

    pub fn with_secret_bytes(mut self, name: &str, value: Vec<u8>) -> Self {
        self.items.insert(format!("secret:{name}"), value);
        self
    }

    /// Password data for `instance_id`, readable only with `launch_key`.
    pub fn with_password_data(mut self, instance_id: &str, launch_key: &str, password: &str) -> Self {
        self.items.insert(
            format!("password:{instance_id}:{launch_key}"),
            password.as_bytes().to_vec(),
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn lookup(&self, id: String) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(id.clone());
        self.items
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("{id} not found"))
    }
}

#[async_trait]
impl ResourceSourceClient for FakeSources {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.lookup(format!("object:{bucket}/{key}"))
    }

    async fn get_parameter(&self, name: &str) -> Result<Vec<u8>> {
        self.lookup(format!("parameter:{name}"))
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        self.lookup(format!("secret:{name}"))
    }

    async fn get_password_data(&self, instance_id: &str, launch_key: &[u8]) -> Result<Vec<u8>> {
        self.lookup(format!(
            "password:{instance_id}:{}",
            String::from_utf8_lossy(launch_key)
        ))
    }
}

pub(crate) struct FailingKeyGenerator;

impl KeyGenerator for FailingKeyGenerator {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ed25519
    }

    fn generate(&self, _comment: &str) -> Result<GeneratedKeyPair> {
        bail!("entropy source unavailable")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCommand {
    pub command: String,
    pub user: Option<String>,
}

#[derive(Default)]
struct RemoteState {
    home: String,
    failing_on: Option<String>,
    commands: Mutex<Vec<RecordedCommand>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Records commands and answers the home directory lookup
#[derive(Clone)]
pub(crate) struct FakeRemote {
    state: Arc<RemoteState>,
}

impl FakeRemote {
    pub fn new(home: &str) -> Self {
        Self {
            state: Arc::new(RemoteState {
                home: home.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Fail any command containing `pattern`.
    pub fn failing_on(self, pattern: &str) -> Self {
        Self {
            state: Arc::new(RemoteState {
                home: self.state.home.clone(),
                failing_on: Some(pattern.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    host: String,
    state: Arc<RemoteState>,
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            host: host.to_string(),
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, user: Option<&str>) -> Result<String> {
        self.state.commands.lock().unwrap().push(RecordedCommand {
            command: command.to_string(),
            user: user.map(str::to_string),
        });

        if let Some(pattern) = &self.state.failing_on {
            if command.contains(pattern.as_str()) {
                bail!("command failed on {}", self.host);
            }
        }

        if command == super::ssh_key::remote::HOME_COMMAND {
            return Ok(self.state.home.clone());
        }
        Ok(String::new())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Runs commands with the local `sh`, with `HOME` pointed at a temp dir
#[cfg(unix)]
pub(crate) struct LocalShell {
    home: PathBuf,
}

#[cfg(unix)]
impl LocalShell {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }
}

#[cfg(unix)]
struct LocalSession {
    home: PathBuf,
}

#[cfg(unix)]
#[async_trait]
impl RemoteExecutor for LocalShell {
    async fn open_session(&self, _host: &str) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(LocalSession {
            home: self.home.clone(),
        }))
    }
}

#[cfg(unix)]
#[async_trait]
impl RemoteSession for LocalSession {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str, _user: Option<&str>) -> Result<String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("HOME", &self.home)
            .current_dir(&self.home)
            .output()
            .await
            .context("Failed to spawn sh")?;

        if !output.status.success() {
            bail!(
                "sh exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    failing: HashSet<u16>,
    started: Mutex<Vec<u16>>,
    attempts: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_port(mut self, port: u16) -> Self {
        self.failing.insert(port);
        self
    }

    pub fn started(&self) -> Vec<u16> {
        let mut started = self.started.lock().unwrap().clone();
        started.sort_unstable();
        started
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelBroker for FakeBroker {
    async fn start_session(&self, host: &str, port: u16, _sessions: &BackgroundTasks) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&port) {
            bail!("TargetNotConnected: {host} is not connected");
        }
        self.started.lock().unwrap().push(port);
        Ok(())
    }
}

enum ScanBehavior {
    Exit { code: i32, report: String },
    Error(String),
}

/// Writes a canned report and returns a fixed status
pub(crate) struct FakeScan {
    behavior: ScanBehavior,
    invocations: Mutex<Vec<ScanInvocation>>,
}

impl FakeScan {
    pub fn exiting(code: i32, report: &str) -> Self {
        Self {
            behavior: ScanBehavior::Exit {
                code,
                report: report.to_string(),
            },
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Fails to launch; no report is written.
    pub fn erroring(message: &str) -> Self {
        Self {
            behavior: ScanBehavior::Error(message.to_string()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<ScanInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanProcess for FakeScan {
    async fn run(&self, invocation: &ScanInvocation) -> Result<ExitStatus> {
        self.invocations.lock().unwrap().push(invocation.clone());
        match &self.behavior {
            ScanBehavior::Exit { code, report } => {
                std::fs::write(&invocation.report_path, report)?;
                Ok(ExitStatus::from_code(Some(*code)))
            }
            ScanBehavior::Error(message) => Err(anyhow!("{message}")),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedPut {
    pub sink: String,
    pub key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct FakeSink {
    failing: HashSet<String>,
    puts: Mutex<Vec<RecordedPut>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, sink: &str) -> Self {
        self.failing.insert(sink.to_string());
        self
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for FakeSink {
    async fn put(&self, sink: &str, key: &str, body: Vec<u8>) -> Result<()> {
        if self.failing.contains(sink) {
            bail!("AccessDenied: {sink}");
        }
        self.puts.lock().unwrap().push(RecordedPut {
            sink: sink.to_string(),
            key: key.to_string(),
            body,
        });
        Ok(())
    }
}
