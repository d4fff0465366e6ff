use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{run_cmd, CommandSpec, ServiceProcess};
use crate::error::{IibError, Result};
use crate::opm::ports::{with_leased_ports, LeasedPorts, OPM_PORT, OPM_PPROF_PORT};
use crate::opm::OpmContext;
use crate::retry::{on_iib_error, with_retry, RetryPolicy};
use crate::state::WorkerState;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running `opm serve` / `opm registry serve` answering on `port`
///
/// The caller owns the process and stops it when done querying.
pub struct ServedCatalog {
    pub port: u16,
    pub process: Box<dyn ServiceProcess>,
}

impl ServedCatalog {
    pub async fn stop(mut self) -> Result<()> {
        debug!("Stopping the opm service on port {}", self.port);
        self.process.terminate().await
    }
}

/// Lifecycle of one supervised serve attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServePhase {
    Starting,
    Probing,
    Ready,
    Failed,
    TimedOut,
}

pub fn is_terminal(phase: ServePhase) -> bool {
    matches!(phase, ServePhase::Ready | ServePhase::Failed)
}

pub fn is_valid_transition(from: ServePhase, to: ServePhase) -> bool {
    use ServePhase::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,
        (Starting, Probing) => true,
        (Starting, Failed) => true,
        (Probing, Ready | Failed | TimedOut) => true,
        // Next try after the wait time ran out
        (TimedOut, Starting) => true,
        _ => false,
    }
}

struct ServeSupervisor<'a> {
    state: &'a WorkerState,
    spec: &'a CommandSpec,
    port: u16,
    max_tries: u32,
    wait_time: Duration,
    poll_interval: Duration,
    phase: ServePhase,
}

impl<'a> ServeSupervisor<'a> {
    fn new(state: &'a WorkerState, spec: &'a CommandSpec, port: u16) -> Self {
        let settings = &state.settings;
        Self {
            state,
            spec,
            port,
            max_tries: settings.iib_grpc_max_tries,
            wait_time: Duration::from_secs(settings.iib_grpc_init_wait_time),
            poll_interval: Duration::from_secs(settings.iib_grpc_poll_interval).max(MIN_POLL_INTERVAL),
            phase: ServePhase::Starting,
        }
    }

    fn transition(&mut self, to: ServePhase) {
        debug_assert!(
            is_valid_transition(self.phase, to),
            "invalid serve transition {:?} -> {:?}",
            self.phase,
            to
        );
        self.phase = to;
    }

    async fn run(&mut self) -> Result<Box<dyn ServiceProcess>> {
        debug!(
            "Run command {} with up to {} retries",
            self.spec.command_line(),
            self.max_tries
        );
        for _ in 0..self.max_tries {
            if self.phase == ServePhase::TimedOut {
                self.transition(ServePhase::Starting);
            }
            let mut process = match self.state.runner().spawn(self.spec).await {
                Ok(process) => process,
                Err(e) => {
                    self.transition(ServePhase::Failed);
                    return Err(e);
                }
            };
            self.transition(ServePhase::Probing);

            let started = Instant::now();
            while started.elapsed() < self.wait_time {
                tokio::time::sleep(self.poll_interval).await;

                if process.try_wait()?.is_some() {
                    self.transition(ServePhase::Failed);
                    let stderr = process.read_stderr().await?;
                    if stderr.contains("address already in use") {
                        return Err(IibError::AddressAlreadyInUse(format!(
                            "Port {} is already used by a different service",
                            self.port
                        )));
                    }
                    return Err(IibError::iib(format!(
                        "Command \"{}\" has failed with error \"{}\"",
                        self.spec.command_line(),
                        stderr
                    )));
                }

                if self.is_ready().await {
                    self.transition(ServePhase::Ready);
                    debug!(
                        "Started the command \"{}\"; pid: {:?}",
                        self.spec.command_line(),
                        process.id()
                    );
                    info!("Index registry service has been initialized.");
                    return Ok(process);
                }
            }

            self.transition(ServePhase::TimedOut);
            warn!(
                "The opm service on port {} did not answer within {:?}",
                self.port, self.wait_time
            );
            process.terminate().await?;
        }

        Err(IibError::iib(format!(
            "Index registry has not been initialized after {} tries",
            self.max_tries
        )))
    }

    /// gRPC reflection lists the registry methods once the service is up
    async fn is_ready(&self) -> bool {
        let list_methods = CommandSpec::new("grpcurl").args([
            "-plaintext".to_string(),
            format!("localhost:{}", self.port),
            "list".to_string(),
            "api.Registry".to_string(),
        ]);
        let output = run_cmd(self.state.runner(), &list_methods, None)
            .await
            .unwrap_or_default();
        output.contains("api.Registry.ListBundles") || output.contains("api.Registry.ListPackages")
    }
}

/// Start `spec` and wait until it serves the registry API on `port`
///
/// A process that exits reporting "address already in use" yields
/// `AddressAlreadyInUse` so the caller can lease another port. Other failures
/// are retried once.
pub async fn serve_at_port(
    state: &WorkerState,
    spec: &CommandSpec,
    port: u16,
) -> Result<Box<dyn ServiceProcess>> {
    let policy = RetryPolicy::immediate(2);
    with_retry(&policy, "serve_at_port", on_iib_error, || async {
        ServeSupervisor::new(state, spec, port).run().await
    })
    .await
}

fn with_pprof(spec: CommandSpec, ports: &LeasedPorts) -> CommandSpec {
    match ports.pprof_port() {
        // opm defaults to 127.0.0.1:6060 otherwise
        Some(pprof) => spec.args(["--pprof-addr".to_string(), format!("127.0.0.1:{}", pprof)]),
        None => spec,
    }
}

/// Serve a file-based catalog directory
pub async fn opm_serve(
    state: &WorkerState,
    opm: &OpmContext,
    catalog_dir: &Path,
) -> Result<ServedCatalog> {
    info!("Serving data from file-based catalog {}", catalog_dir.display());
    let catalog_dir = std::path::absolute(catalog_dir)?;
    let cwd = catalog_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| catalog_dir.clone());

    with_leased_ports(state, opm, &[OPM_PORT, OPM_PPROF_PORT], |ports| {
        let catalog_dir = catalog_dir.clone();
        let cwd = cwd.clone();
        async move {
            let port = ports.opm_port()?;
            let spec = opm
                .command()
                .arg("serve")
                .arg(catalog_dir.to_string_lossy())
                .args(["-p".to_string(), port.to_string(), "-t".to_string(), "/dev/null".to_string()]);
            let spec = with_pprof(spec, &ports).cwd(&cwd);
            let process = serve_at_port(state, &spec, port).await?;
            Ok(ServedCatalog { port, process })
        }
    })
    .await
}

/// Serve a SQLite `index.db`
pub async fn opm_registry_serve(
    state: &WorkerState,
    opm: &OpmContext,
    db_path: &Path,
) -> Result<ServedCatalog> {
    info!("Serving data from index.db {}", db_path.display());
    let cwd = db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    with_leased_ports(state, opm, &[OPM_PORT, OPM_PPROF_PORT], |ports| {
        let cwd = cwd.clone();
        async move {
            let port = ports.opm_port()?;
            let spec = opm
                .command()
                .args(["registry", "serve", "-p"])
                .arg(port.to_string())
                .arg("-d")
                .arg(db_path.to_string_lossy())
                .args(["-t", "/dev/null"]);
            let spec = with_pprof(spec, &ports).cwd(&cwd);
            let process = serve_at_port(state, &spec, port).await?;
            Ok(ServedCatalog { port, process })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::WorkerSettings;
    use crate::testing::{FakeProcess, FakeRunner, TestHarness};
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn serve_spec(port: u16) -> CommandSpec {
        CommandSpec::new("opm")
            .args(["registry", "serve", "-p"])
            .arg(port.to_string())
            .args(["-d", "index.db", "-t", "/dev/null"])
    }

    async fn serve_failure(harness: &TestHarness, port: u16) -> IibError {
        match serve_at_port(&harness.state, &serve_spec(port), port).await {
            Err(err) => err,
            Ok(_) => panic!("the service on port {} was expected to fail", port),
        }
    }

    #[test]
    fn test_transitions() {
        use ServePhase::*;
        assert!(is_valid_transition(Starting, Probing));
        assert!(is_valid_transition(Probing, Ready));
        assert!(is_valid_transition(Probing, TimedOut));
        assert!(is_valid_transition(TimedOut, Starting));
        assert!(!is_valid_transition(Ready, Probing));
        assert!(!is_valid_transition(Failed, Starting));
        assert!(!is_valid_transition(Starting, Ready));
    }

    #[tokio::test]
    async fn test_address_in_use_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.runner.on_spawn("opm registry serve", |_| {
            Ok(FakeProcess::exited(
                1,
                "level=fatal msg=\"listen tcp :50051: bind: address already in use\"",
            ))
        });

        let err = serve_failure(&harness, 50051).await;
        assert!(err.is_address_in_use());
        assert_eq!(err.to_string(), "Port 50051 is already used by a different service");
        assert_eq!(harness.runner.count("opm registry serve"), 1);
        assert_eq!(harness.runner.count("grpcurl"), 0);
    }

    #[tokio::test]
    async fn test_command_failure_includes_stderr_and_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.runner.on_spawn("opm registry serve", |_| {
            Ok(FakeProcess::exited(1, "unable to open database"))
        });

        let err = serve_failure(&harness, 50051).await;
        assert_eq!(
            err.to_string(),
            "Command \"opm registry serve -p 50051 -d index.db -t /dev/null\" has failed with error \"unable to open database\""
        );
        assert_eq!(harness.runner.count("opm registry serve"), 2);
    }

    #[tokio::test]
    async fn test_ready_process_is_returned_alive() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        let terminated = Arc::new(Mutex::new(None));
        let handle = terminated.clone();
        harness.runner.on_spawn("opm registry serve", move |_| {
            let process = FakeProcess::running();
            *handle.lock().unwrap() = Some(process.terminated.clone());
            Ok(process)
        });
        harness.runner.on("grpcurl -plaintext localhost:50051 list api.Registry", |_| {
            Ok(FakeRunner::ok("api.Registry.GetBundle\napi.Registry.ListBundles\n"))
        });

        let mut process = serve_at_port(&harness.state, &serve_spec(50051), 50051)
            .await
            .unwrap();
        assert_eq!(process.try_wait().unwrap(), None);
        let flag = terminated.lock().unwrap().clone().unwrap();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_tries() {
        let dir = TempDir::new().unwrap();
        let mut settings = WorkerSettings::for_tests(dir.path());
        settings.iib_grpc_max_tries = 2;
        settings.iib_grpc_init_wait_time = 3;
        settings.iib_grpc_poll_interval = 1;
        let harness = TestHarness::with_settings(settings);
        harness
            .runner
            .on("grpcurl", |_| Ok(FakeRunner::fail(1, "connection refused")));

        let err = serve_failure(&harness, 50051).await;
        assert_eq!(
            err.to_string(),
            "Index registry has not been initialized after 2 tries"
        );
        // Two tries per supervisor run, and the run itself is retried once
        assert_eq!(harness.runner.count("opm registry serve"), 4);
    }

    #[tokio::test]
    async fn test_opm_serve_leases_ports_and_sets_cwd() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.runner.on("opm version", |_| {
            Ok(FakeRunner::ok(r#"Version: version.Version{OpmVersion:"v1.30.0"}"#))
        });
        harness.runner.on("grpcurl", |_| Ok(FakeRunner::ok("api.Registry.ListPackages\n")));
        let catalog = dir.path().join("catalog");
        std::fs::create_dir_all(&catalog).unwrap();
        let opm = OpmContext::default_for(&harness.state.settings);

        let served = opm_serve(&harness.state, &opm, &catalog).await.unwrap();
        assert!((50051..50151).contains(&served.port));

        let spawned = harness
            .runner
            .specs()
            .into_iter()
            .find(|s| s.args.first().map(String::as_str) == Some("serve"))
            .unwrap();
        assert_eq!(spawned.cwd.as_deref(), Some(dir.path()));
        let line = spawned.command_line();
        assert!(line.contains(&format!("-p {} -t /dev/null --pprof-addr 127.0.0.1:{}", served.port, served.port + 100)));

        // Lock files are released once the service answers
        let locks = std::fs::read_dir(harness.state.settings.lock_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(locks, 0);
        served.stop().await.unwrap();
    }
}
