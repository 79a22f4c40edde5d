//! End-to-end worker lifecycle against fake processes and fake HTTP
//! listeners.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use kiln_core::capability::Capability;
use kiln_core::catalog::{
    InstallSpec, Interpreter, LaunchSpec, OutputDir, Protocol, WorkerCatalog, WorkerDescriptor,
};
use kiln_core::error::CoreError;
use kiln_core::status::WorkerStatus;
use kiln_supervisor::{
    CommandRunner, CommandSpec, Fleet, FleetConfig, ProbeConfig, RunError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accept connections on a local port, closing the first `failures` of them
/// without a reply and answering `200 OK` after that. Returns the port and
/// the connection counter.
async fn flaky_listener(failures: usize) -> (u16, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                if seen >= failures {
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                }
            });
        }
    });
    (port, hits)
}

async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A worker whose "process" is `program args...`.
fn fake_worker(name: &str, port: u16, program: &str, args: &[&str]) -> WorkerDescriptor {
    WorkerDescriptor {
        name: name.to_string(),
        capability: Capability::Speech,
        port,
        repository_url: format!("https://example.invalid/{name}.git"),
        install: InstallSpec::default(),
        launch: LaunchSpec {
            interpreter: Interpreter::System(program.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
        },
        protocol: Protocol::Sync {
            endpoint: "/tts".to_string(),
        },
        output_dir: OutputDir::Shared,
    }
}

fn make_fleet(root: &std::path::Path, workers: Vec<WorkerDescriptor>, max_attempts: u32) -> Fleet {
    let mut config = FleetConfig::new(root);
    config.catalog = WorkerCatalog::new(workers);
    config.probe = ProbeConfig {
        interval: Duration::from_millis(20),
        max_attempts,
        request_timeout: Duration::from_millis(500),
    };
    config.stop_grace = Duration::from_secs(2);
    Fleet::new(config)
}

/// Lay down what a finished install leaves on disk.
fn simulate_install(fleet: &Fleet, worker: &str) {
    std::fs::create_dir_all(fleet.layout().repo_dir(worker).join(".git")).unwrap();
    std::fs::create_dir_all(fleet.layout().env_dir(worker)).unwrap();
}

fn status_of<R: CommandRunner + 'static>(fleet: &Fleet<R>, worker: &str) -> WorkerStatus {
    fleet.supervisor().status(worker).unwrap()
}

// ---------------------------------------------------------------------------
// Cold start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_worker_is_installed_then_started_and_stopped() {
    let dir = tempfile::tempdir().unwrap();
    // The refused attempt's probe, the cheap probe and two polls fail; the
    // third poll answers.
    let (port, hits) = flaky_listener(4).await;
    let fleet = make_fleet(dir.path(), vec![fake_worker("w", port, "sleep", &["30"])], 10);

    assert_eq!(status_of(&fleet, "w"), WorkerStatus::Idle);
    assert_matches!(fleet.start("w").await, Err(CoreError::NotInstalled { .. }));
    assert!(fleet.supervisor().registry().lookup("w").is_none());

    simulate_install(&fleet, "w");
    assert_eq!(status_of(&fleet, "w"), WorkerStatus::Ready);

    let state = fleet.start("w").await.expect("worker should come up");
    assert_eq!(state.status, WorkerStatus::Running);
    assert!(state.pid.is_some_and(|pid| pid > 0));
    assert_eq!(hits.load(Ordering::SeqCst), 5);

    fleet.stop("w").await.unwrap();
    assert_ne!(status_of(&fleet, "w"), WorkerStatus::Running);
    assert_matches!(fleet.stop("w").await, Err(CoreError::NotRunning(_)));
}

#[tokio::test]
async fn answering_port_skips_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _) = flaky_listener(0).await;
    // No environment on disk: a start attempt would fail.
    let fleet = make_fleet(dir.path(), vec![fake_worker("w", port, "sleep", &["30"])], 3);

    fleet.start("w").await.expect("cheap path should succeed");
    assert!(fleet.supervisor().registry().running().is_empty());
}

#[tokio::test]
async fn silent_worker_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let port = unused_port().await;
    let fleet = make_fleet(dir.path(), vec![fake_worker("w", port, "sleep", &["30"])], 3);
    simulate_install(&fleet, "w");

    assert_matches!(
        fleet.start("w").await,
        Err(CoreError::StartupTimeout { attempts: 3, .. })
    );
    // The process is still registered; the caller decides whether to stop it.
    assert_eq!(status_of(&fleet, "w"), WorkerStatus::Running);
    fleet.stop_all().await;
}

#[tokio::test]
async fn worker_dying_during_boot_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let port = unused_port().await;
    let fleet = make_fleet(
        dir.path(),
        vec![fake_worker("w", port, "sh", &["-c", "echo boom 1>&2; exit 1"])],
        500,
    );
    simulate_install(&fleet, "w");

    let started = std::time::Instant::now();
    assert_matches!(fleet.start("w").await, Err(CoreError::StartupTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Let the stderr forwarder drain.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages: Vec<_> = fleet.logs(Some("w")).into_iter().map(|e| e.message).collect();
    assert!(messages.iter().any(|m| m == "boom"), "{messages:?}");
}

#[tokio::test]
async fn concurrent_starts_launch_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let (port, _) = flaky_listener(4).await;
    let fleet = make_fleet(dir.path(), vec![fake_worker("w", port, "sleep", &["30"])], 20);
    simulate_install(&fleet, "w");

    let (a, b) = tokio::join!(fleet.start("w"), fleet.start("w"));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.pid, b.pid);
    assert_eq!(fleet.supervisor().registry().running().len(), 1);
    fleet.stop_all().await;
}

#[tokio::test]
async fn shutdown_cancels_readiness_wait_and_stops_workers() {
    let dir = tempfile::tempdir().unwrap();
    let port = unused_port().await;
    let fleet = Arc::new(make_fleet(
        dir.path(),
        vec![fake_worker("w", port, "sleep", &["30"])],
        1_000,
    ));
    simulate_install(&fleet, "w");

    let starter = {
        let fleet = Arc::clone(&fleet);
        tokio::spawn(async move { fleet.start("w").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    fleet.shutdown(Duration::from_secs(1)).await;

    let result = starter.await.unwrap();
    assert_matches!(result, Err(CoreError::Cancelled));
    assert!(fleet.supervisor().registry().running().is_empty());
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

/// Records commands and fakes the on-disk effects of clone and venv.
#[derive(Clone, Default)]
struct ScriptedRunner {
    calls: Arc<Mutex<Vec<String>>>,
    fail_repo: Option<&'static str>,
}

impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        _worker: &str,
        spec: &CommandSpec,
        _cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let line = spec.to_string();
        self.calls.lock().unwrap().push(line.clone());
        if self.fail_repo.is_some_and(|repo| line.contains(repo)) {
            return Err(RunError::Exit(128));
        }
        let target = spec.args.last().map(PathBuf::from);
        match (spec.args.first(), target) {
            (Some(first), Some(target)) if first == "clone" => {
                std::fs::create_dir_all(target.join(".git")).unwrap();
            }
            (_, Some(target)) if spec.args.iter().any(|a| a == "venv") => {
                std::fs::create_dir_all(target).unwrap();
            }
            _ => {}
        }
        Ok(())
    }
}

#[tokio::test]
async fn deploy_installs_every_worker_and_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner {
        fail_repo: Some("broken.git"),
        ..Default::default()
    };
    let calls = Arc::clone(&runner.calls);

    let mut config = FleetConfig::new(dir.path());
    config.catalog = WorkerCatalog::new(vec![
        fake_worker("first", 1, "sleep", &[]),
        fake_worker("broken", 2, "sleep", &[]),
        fake_worker("last", 3, "sleep", &[]),
    ]);
    let fleet = Fleet::with_runner(config, |_| runner);

    assert!(fleet.deploy());
    fleet.wait_background().await;

    assert_eq!(status_of(&fleet, "first"), WorkerStatus::Ready);
    assert_eq!(status_of(&fleet, "broken"), WorkerStatus::Failed);
    assert_eq!(status_of(&fleet, "last"), WorkerStatus::Ready);

    let broken = fleet
        .supervisor()
        .worker_state(fleet.catalog().get("broken").unwrap());
    assert_eq!(broken.install_step, Some(kiln_core::install::InstallStep::Clone));

    // Sequential policy: "first" finishes before "last" starts cloning.
    let calls = calls.lock().unwrap().clone();
    let first_clone = calls.iter().position(|c| c.contains("first.git")).unwrap();
    let last_clone = calls.iter().position(|c| c.contains("last.git")).unwrap();
    assert!(first_clone < last_clone);

    let system: Vec<_> = fleet
        .logs(Some("first"))
        .into_iter()
        .filter(|e| e.worker == "system")
        .map(|e| e.message)
        .collect();
    assert!(system.contains(&"Deploy finished: 2 installed, 1 failed".to_string()));

}

#[tokio::test]
async fn redeploy_skips_finished_steps() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::default();
    let calls = Arc::clone(&runner.calls);

    let mut config = FleetConfig::new(dir.path());
    config.catalog = WorkerCatalog::new(vec![fake_worker("w", 1, "sleep", &[])]);
    let fleet = Fleet::with_runner(config, |_| runner);

    let install_calls = || {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.ends_with("--version"))
            .count()
    };

    assert!(fleet.deploy());
    fleet.wait_background().await;
    let after_first = install_calls();
    assert_eq!(after_first, 3, "clone, venv and tool upgrade");

    assert!(fleet.deploy());
    fleet.wait_background().await;
    assert_eq!(install_calls(), after_first);
    assert_eq!(status_of(&fleet, "w"), WorkerStatus::Ready);
}

#[tokio::test]
async fn deploy_checks_host_tools_first() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::default();
    let calls = Arc::clone(&runner.calls);

    let mut config = FleetConfig::new(dir.path());
    config.python = "python3.11".to_string();
    config.catalog = WorkerCatalog::new(vec![fake_worker("w", 1, "sleep", &[])]);
    let fleet = Fleet::with_runner(config, |_| runner);

    assert!(fleet.deploy());
    fleet.wait_background().await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls[0], "git --version");
    assert_eq!(calls[1], "python3.11 --version");
    assert!(calls[2].starts_with("git clone"));
}

#[tokio::test]
async fn deploy_aborts_when_host_tools_are_missing() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner {
        fail_repo: Some("git --version"),
        ..Default::default()
    };
    let calls = Arc::clone(&runner.calls);

    let mut config = FleetConfig::new(dir.path());
    config.catalog = WorkerCatalog::new(vec![fake_worker("w", 1, "sleep", &[])]);
    let fleet = Fleet::with_runner(config, |_| runner);

    assert!(fleet.deploy());
    fleet.wait_background().await;

    let calls = calls.lock().unwrap().clone();
    assert!(calls.iter().all(|c| c.ends_with("--version")), "{calls:?}");
    assert_eq!(status_of(&fleet, "w"), WorkerStatus::Idle);

    let system: Vec<_> = fleet
        .logs(None)
        .into_iter()
        .filter(|e| e.worker == "system")
        .map(|e| e.message)
        .collect();
    assert!(system.contains(&"Deploy aborted, missing: git".to_string()), "{system:?}");
    assert!(!system.iter().any(|m| m.starts_with("Deploy finished")));
}

#[tokio::test]
async fn deploy_creates_every_output_folder() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FleetConfig::new(dir.path());
    config.catalog = WorkerCatalog::new(vec![fake_worker("w", 1, "sleep", &[])]);
    let fleet = Fleet::with_runner(config, |_| ScriptedRunner::default());

    assert!(fleet.deploy());
    fleet.wait_background().await;

    for capability in Capability::ALL {
        assert!(
            fleet.layout().shared_output_dir(capability).is_dir(),
            "missing output folder for {capability}"
        );
    }
}

#[tokio::test]
async fn install_of_running_worker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FleetConfig::new(dir.path());
    config.catalog = WorkerCatalog::new(vec![fake_worker("w", 1, "sleep", &["30"])]);
    let fleet = Fleet::with_runner(config, |_| ScriptedRunner::default());
    std::fs::create_dir_all(fleet.layout().env_dir("w")).unwrap();

    fleet.supervisor().start("w").unwrap();
    assert_matches!(fleet.install("w").await, Err(CoreError::AlreadyRunning(_)));
    fleet.stop_all().await;
}
