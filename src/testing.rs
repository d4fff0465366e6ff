// Scripted collaborators for unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::api::{RequestState, RequestTracker, RequestUpdate};
use crate::command::{CommandOutput, CommandSpec, ServiceProcess, ToolRunner};
use crate::error::{IibError, Result};
use crate::settings::WorkerSettings;
use crate::state::WorkerState;
use crate::tasks::containerized::gitlab::{MergeRequest, MergeRequestProvider};
use crate::greenwave::{GatingCheck, GreenwaveConfig};
use crate::tasks::containerized::konflux::PipelineMonitor;
use crate::tasks::regenerate_bundle::BundleRewriter;

/// Log output of the current thread, captured at `debug` and above
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Capture until the returned guard is dropped
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let logs = Self::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// HTTP/1.1 server on localhost answering each connection with the next canned response
///
/// Records the request line and body of every request it answered.
pub struct FakeHttpServer {
    pub url: String,
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeHttpServer {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_http_request(&mut stream).await;
                seen.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_http_request(stream: &mut tokio::net::TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + length {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let body_end = buf.len().min(end + 4 + length);
            let request_line = head.lines().next().unwrap_or_default().to_string();
            return (request_line, String::from_utf8_lossy(&buf[end + 4..body_end]).into_owned());
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return (String::new(), String::new()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

type ExecHandler = Arc<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;
type SpawnHandler = Arc<dyn Fn(&CommandSpec) -> Result<FakeProcess> + Send + Sync>;

/// Runner that answers commands from registered rules and records every call
///
/// A rule matches when its pattern is a substring of the command line. The
/// most recently registered matching rule wins; unmatched commands succeed
/// with empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(String, ExecHandler)>>,
    spawn_rules: Mutex<Vec<(String, SpawnHandler)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::new(handler)));
    }

    pub fn on_spawn<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&CommandSpec) -> Result<FakeProcess> + Send + Sync + 'static,
    {
        self.spawn_rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Arc::new(handler)));
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Command lines of every call, spawns included, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn record(&self, spec: &CommandSpec) -> String {
        self.calls.lock().unwrap().push(spec.clone());
        spec.command_line()
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = self.record(spec);
        let handler = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, h)| h.clone());
        match handler {
            Some(handler) => handler(spec),
            None => Ok(FakeRunner::ok("")),
        }
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ServiceProcess>> {
        let line = self.record(spec);
        let handler = self
            .spawn_rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, h)| h.clone());
        match handler {
            Some(handler) => Ok(Box::new(handler(spec)?)),
            None => Ok(Box::new(FakeProcess::running())),
        }
    }
}

/// A served process that either keeps running or has already exited
#[derive(Clone)]
pub struct FakeProcess {
    exit_code: Option<i32>,
    stderr: String,
    pub terminated: Arc<AtomicBool>,
}

impl FakeProcess {
    pub fn running() -> Self {
        Self {
            exit_code: None,
            stderr: String::new(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn exited(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.to_string(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ServiceProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(Some(-9));
        }
        Ok(self.exit_code)
    }

    async fn read_stderr(&mut self) -> Result<String> {
        Ok(std::mem::take(&mut self.stderr))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TrackedRequest {
    state: RequestState,
    state_reason: String,
    fields: serde_json::Map<String, Value>,
    updates: Vec<RequestUpdate>,
}

/// Request tracker that enforces terminal states like the real API
#[derive(Default)]
pub struct InMemoryTracker {
    requests: Mutex<BTreeMap<u64, TrackedRequest>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, request_id: u64) {
        self.create_with(request_id, json!({}));
    }

    /// Register a request with extra fields returned by `get_request`
    pub fn create_with(&self, request_id: u64, fields: Value) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.requests.lock().unwrap().insert(
            request_id,
            TrackedRequest {
                state: RequestState::InProgress,
                state_reason: "The request was initiated".to_string(),
                fields,
                updates: Vec::new(),
            },
        );
    }

    pub fn state(&self, request_id: u64) -> Option<RequestState> {
        self.requests.lock().unwrap().get(&request_id).map(|r| r.state)
    }

    pub fn state_reason(&self, request_id: u64) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .get(&request_id)
            .map(|r| r.state_reason.clone())
    }

    pub fn updates(&self, request_id: u64) -> Vec<RequestUpdate> {
        self.requests
            .lock()
            .unwrap()
            .get(&request_id)
            .map(|r| r.updates.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self, request_id: u64) -> Vec<String> {
        self.updates(request_id)
            .into_iter()
            .filter_map(|u| u.state_reason)
            .collect()
    }

    /// Current value of a request field
    pub fn field(&self, request_id: u64, name: &str) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .get(&request_id)
            .and_then(|r| r.fields.get(name).cloned())
    }
}

#[async_trait]
impl RequestTracker for InMemoryTracker {
    async fn get_request(&self, request_id: u64) -> Result<Value> {
        let requests = self.requests.lock().unwrap();
        let request = requests.get(&request_id).ok_or_else(|| {
            IibError::iib(format!("The worker failed to get the request {}", request_id))
        })?;
        let mut body = request.fields.clone();
        body.insert("id".to_string(), json!(request_id));
        body.insert("state".to_string(), json!(request.state));
        body.insert("state_reason".to_string(), json!(request.state_reason));
        Ok(Value::Object(body))
    }

    async fn update_request(
        &self,
        request_id: u64,
        payload: &RequestUpdate,
        _exc_msg: Option<&str>,
    ) -> Result<Value> {
        {
            let mut requests = self.requests.lock().unwrap();
            let request = requests.get_mut(&request_id).ok_or_else(|| {
                IibError::iib(format!(
                    "The worker failed to update the request {}",
                    request_id
                ))
            })?;
            if let Some(state) = payload.state {
                if request.state.is_terminal() {
                    return Err(IibError::FinalStateOverwrite(format!(
                        "A {} request cannot change states",
                        request.state.as_str()
                    )));
                }
                request.state = state;
            }
            if let Some(reason) = &payload.state_reason {
                request.state_reason = reason.clone();
            }
            if let Value::Object(map) = serde_json::to_value(payload)? {
                for (k, v) in map {
                    if k != "state" && k != "state_reason" {
                        request.fields.insert(k, v);
                    }
                }
            }
            request.updates.push(payload.clone());
        }
        self.get_request(request_id).await
    }
}

/// Records merge requests instead of calling GitLab
#[derive(Default)]
pub struct FakeMergeRequests {
    next_iid: AtomicU64,
    pub opened: Mutex<Vec<MergeRequest>>,
    pub closed: Mutex<Vec<u64>>,
}

#[async_trait]
impl MergeRequestProvider for FakeMergeRequests {
    async fn create_merge_request(
        &self,
        repo_url: &str,
        _token: &str,
        source_branch: &str,
        _target_branch: &str,
        _request_id: u64,
    ) -> Result<MergeRequest> {
        let iid = self.next_iid.fetch_add(1, Ordering::SeqCst) + 1;
        let mr = MergeRequest {
            iid,
            web_url: format!("{}/-/merge_requests/{}", repo_url.trim_end_matches(".git"), iid),
            repo_url: repo_url.to_string(),
            source_branch: source_branch.to_string(),
        };
        self.opened.lock().unwrap().push(mr.clone());
        Ok(mr)
    }

    async fn close_merge_request(&self, mr: &MergeRequest, _token: &str) -> Result<()> {
        self.closed.lock().unwrap().push(mr.iid);
        Ok(())
    }
}

/// Pipeline runs answered from a queue of status documents
#[derive(Default)]
pub struct FakePipelines {
    pub runs: Mutex<Vec<Value>>,
    pub statuses: Mutex<VecDeque<Value>>,
}

impl FakePipelines {
    pub fn with_run(name: &str, statuses: Vec<Value>) -> Self {
        Self {
            runs: Mutex::new(vec![json!({"metadata": {"name": name}})]),
            statuses: Mutex::new(statuses.into()),
        }
    }
}

#[async_trait]
impl PipelineMonitor for FakePipelines {
    async fn list_pipelineruns(&self, _commit_sha: &str) -> Result<Vec<Value>> {
        Ok(self.runs.lock().unwrap().clone())
    }

    async fn get_pipelinerun(&self, name: &str) -> Result<Value> {
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        Ok(json!({"metadata": {"name": name}, "status": status.unwrap_or(Value::Null)}))
    }
}

/// Gating that fails the listed bundles and passes everything else
#[derive(Default)]
pub struct FakeGating {
    pub failing: Mutex<Vec<String>>,
    pub checked: Mutex<Vec<String>>,
}

#[async_trait]
impl GatingCheck for FakeGating {
    async fn gate_bundles(&self, _state: &WorkerState, bundles: &[String], config: &GreenwaveConfig) -> Result<()> {
        self.checked.lock().unwrap().extend(bundles.iter().cloned());
        let failing = self.failing.lock().unwrap();
        let unsatisfied: Vec<&String> = bundles.iter().filter(|b| failing.contains(b)).collect();
        if unsatisfied.is_empty() {
            return Ok(());
        }
        Err(IibError::iib(format!(
            "Unsatisfied Greenwave policy for {} with decision_context: {}",
            unsatisfied.iter().map(|b| b.as_str()).collect::<Vec<_>>().join(", "),
            config.decision_context
        )))
    }
}

/// Rewriter that leaves the bundle alone and returns fixed labels
#[derive(Default)]
pub struct FakeRewriter {
    pub labels: Mutex<BTreeMap<String, String>>,
    pub calls: Mutex<Vec<(Option<String>, bool)>>,
}

#[async_trait]
impl BundleRewriter for FakeRewriter {
    async fn adjust_bundle(
        &self,
        _manifests_path: &Path,
        _metadata_path: &Path,
        organization: Option<&str>,
        pinned_by_iib: bool,
    ) -> Result<BTreeMap<String, String>> {
        self.calls
            .lock()
            .unwrap()
            .push((organization.map(str::to_string), pinned_by_iib));
        Ok(self.labels.lock().unwrap().clone())
    }
}

/// Collaborators behind a `WorkerState` built for tests
pub struct TestHarness {
    pub state: WorkerState,
    pub runner: Arc<FakeRunner>,
    pub tracker: Arc<InMemoryTracker>,
    pub merge_requests: Arc<FakeMergeRequests>,
    pub pipelines: Arc<FakePipelines>,
    pub gating: Arc<FakeGating>,
    pub rewriter: Arc<FakeRewriter>,
}

impl TestHarness {
    pub fn new(scratch: &Path) -> Self {
        Self::with_settings(WorkerSettings::for_tests(scratch))
    }

    pub fn with_settings(settings: WorkerSettings) -> Self {
        Self::with_pipelines(settings, FakePipelines::default())
    }

    pub fn with_pipelines(settings: WorkerSettings, pipelines: FakePipelines) -> Self {
        let runner = Arc::new(FakeRunner::new());
        let tracker = Arc::new(InMemoryTracker::new());
        let merge_requests = Arc::new(FakeMergeRequests::default());
        let pipelines = Arc::new(pipelines);
        let gating = Arc::new(FakeGating::default());
        let rewriter = Arc::new(FakeRewriter::default());
        let state = WorkerState {
            settings: Arc::new(settings),
            runner: runner.clone(),
            tracker: tracker.clone(),
            merge_requests: merge_requests.clone(),
            pipelines: pipelines.clone(),
            gating: gating.clone(),
            bundle_rewriter: rewriter.clone(),
        };
        Self {
            state,
            runner,
            tracker,
            merge_requests,
            pipelines,
            gating,
            rewriter,
        }
    }

    /// Answer `skopeo inspect` for a single-arch image, by tag or by digest
    ///
    /// `--raw` gives a schema 2 manifest, `--config` the arch and labels, and a plain
    /// inspect the labels and a digest derived from the image name.
    pub fn fake_image(&self, pull_spec: &str, arch: &str, labels: Value) {
        let name = crate::registry::image_name(pull_spec).to_string();
        let arch = arch.to_string();
        let digest = format!("sha256:{:0>64}", name.len());
        self.runner.on(&format!("docker://{}", name), move |spec| {
            let body = if spec.args.iter().any(|a| a == "--raw") {
                json!({
                    "schemaVersion": 2,
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                })
            } else if spec.args.iter().any(|a| a == "--config") {
                json!({"architecture": arch, "config": {"Labels": labels}})
            } else {
                json!({"Labels": labels, "Digest": digest})
            };
            Ok(FakeRunner::ok(&body.to_string()))
        });
    }

    /// Let index builds run end to end: `opm index` writes `index.Dockerfile` into
    /// its working directory and pushed images verify as schema 2
    pub fn fake_index_build(&self) {
        self.runner.on("opm index", |spec| {
            if let Some(cwd) = &spec.cwd {
                std::fs::write(cwd.join("index.Dockerfile"), "FROM quay.io/ns/opm:latest\n")?;
            }
            Ok(FakeRunner::ok(""))
        });
        let registry = self.state.settings.iib_registry.clone();
        self.fake_image(&format!("{}/iib-build:1", registry), "amd64", json!({}));
    }
}
