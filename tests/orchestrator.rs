use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use agent_fleet::config::{InstanceConfig, Settings};
use agent_fleet::instance::{InstanceEvent, InstanceEventKind, InstanceStatus, Orchestrator};
use agent_fleet::paths::Paths;
use agent_fleet::process::{AppDriver, BrowserDriver, LockCleanup, Timeouts};
use agent_fleet::{AppError, ErrorKind, Result};

/// Shared switches and call counters for the fake drivers.
#[derive(Default)]
struct Harness {
    browser_launches: AtomicUsize,
    browser_stops: AtomicUsize,
    app_launches: AtomicUsize,
    app_stops: AtomicUsize,
    browser_healthy: AtomicBool,
    app_healthy: AtomicBool,
    app_fails: AtomicBool,
}

struct FakeBrowser {
    harness: Arc<Harness>,
    launch_delay: Duration,
}

struct FakeApp {
    harness: Arc<Harness>,
}

impl BrowserDriver for FakeBrowser {
    async fn launch(&self, cfg: &InstanceConfig, _settings: &Settings) -> Result<u32> {
        tokio::time::sleep(self.launch_delay).await;
        self.harness.browser_launches.fetch_add(1, Ordering::SeqCst);
        self.harness.browser_healthy.store(true, Ordering::SeqCst);
        Ok(u32::from(cfg.control_port))
    }

    async fn stop(
        &self,
        _instance_id: &str,
        _control_port: u16,
        _profile_dir: &Path,
        _known_pid: Option<u32>,
    ) -> Result<()> {
        self.harness.browser_stops.fetch_add(1, Ordering::SeqCst);
        self.harness.browser_healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self, _control_port: u16) -> bool {
        self.harness.browser_healthy.load(Ordering::SeqCst)
    }

    fn cleanup_profile_locks(&self, _profile_dir: &Path) -> Result<LockCleanup> {
        Ok(LockCleanup::Removed { files: Vec::new() })
    }
}

impl AppDriver for FakeApp {
    async fn launch(
        &self,
        cfg: &InstanceConfig,
        runtime_dir: &Path,
        settings: &Settings,
    ) -> Result<u32> {
        self.harness.app_launches.fetch_add(1, Ordering::SeqCst);
        assert!(runtime_dir.join(&settings.app_entrypoint).is_file());
        if self.harness.app_fails.load(Ordering::SeqCst) {
            return Err(AppError::startup_timeout("app", 1));
        }
        self.harness.app_healthy.store(true, Ordering::SeqCst);
        Ok(u32::from(cfg.app_port))
    }

    async fn stop(
        &self,
        _instance_id: &str,
        _app_port: u16,
        _known_pid: Option<u32>,
    ) -> Result<()> {
        self.harness.app_stops.fetch_add(1, Ordering::SeqCst);
        self.harness.app_healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self, _app_port: u16, _health_path: &str) -> bool {
        self.harness.app_healthy.load(Ordering::SeqCst)
    }
}

struct Fleet {
    dir: TempDir,
    harness: Arc<Harness>,
    orchestrator: Orchestrator<FakeBrowser, FakeApp>,
}

fn timeouts() -> Timeouts {
    Timeouts {
        browser_startup: Duration::from_secs(1),
        app_startup: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        graceful_shutdown: Duration::from_millis(200),
        page_flush_delay: Duration::ZERO,
        lock_release_delay: Duration::ZERO,
        restart_settle: Duration::from_millis(10),
        probe: Duration::from_millis(200),
        port_release: Duration::from_millis(500),
    }
}

fn open_fleet(dir: TempDir, launch_delay: Duration) -> Fleet {
    let harness = Arc::new(Harness::default());
    let orchestrator = Orchestrator::with_drivers(
        Paths::new(dir.path()),
        timeouts(),
        FakeBrowser {
            harness: Arc::clone(&harness),
            launch_delay,
        },
        FakeApp {
            harness: Arc::clone(&harness),
        },
    )
    .unwrap();
    Fleet {
        dir,
        harness,
        orchestrator,
    }
}

/// Fleet over a fresh data dir with the default bundle in place.
fn fleet() -> Fleet {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("bundle");
    fs::create_dir_all(bundle.join("lib")).unwrap();
    fs::write(bundle.join("index.js"), "console.log('hi')").unwrap();
    fs::write(bundle.join("lib").join("util.js"), "module.exports = {}").unwrap();
    open_fleet(dir, Duration::ZERO)
}

fn add_one(fleet: &Fleet) -> InstanceConfig {
    let mut created = fleet.orchestrator.add_instances("default", 1, None).unwrap();
    created.remove(0)
}

fn drain(events: &mut broadcast::Receiver<InstanceEvent>) -> Vec<InstanceEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn start_then_stop() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    let orch = &fleet.orchestrator;
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Stopped);

    let mut events = orch.subscribe();
    orch.start_instance(&inst.id).await.unwrap();
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Running);
    assert_eq!(
        drain(&mut events),
        vec![InstanceEventKind::Starting, InstanceEventKind::Running]
    );
    assert!(fleet
        .dir
        .path()
        .join("runtime")
        .join(&inst.id)
        .join("lib")
        .join("util.js")
        .is_file());

    let summary = orch.list_instances().remove(0);
    assert_eq!(summary.runtime.browser_pid, Some(u32::from(inst.control_port)));
    assert_eq!(summary.runtime.app_pid, Some(u32::from(inst.app_port)));

    // Starting a running instance does not launch anything again.
    orch.start_instance(&inst.id).await.unwrap();
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 1);

    orch.stop_instance(&inst.id).await.unwrap();
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Stopped);
    assert_eq!(
        drain(&mut events),
        vec![InstanceEventKind::Stopping, InstanceEventKind::Stopped]
    );
    assert_eq!(fleet.harness.app_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fleet.harness.browser_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_app_rolls_back_browser() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    fleet.harness.app_fails.store(true, Ordering::SeqCst);

    let mut events = fleet.orchestrator.subscribe();
    let err = fleet.orchestrator.start_instance(&inst.id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialStartFailure);
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 1);
    assert_eq!(fleet.harness.browser_stops.load(Ordering::SeqCst), 1);
    assert!(!fleet.harness.browser_healthy.load(Ordering::SeqCst));
    assert_eq!(
        fleet.orchestrator.get_status(&inst.id).unwrap(),
        InstanceStatus::Error
    );
    assert_eq!(
        drain(&mut events),
        vec![InstanceEventKind::Starting, InstanceEventKind::Error]
    );

    let summary = fleet.orchestrator.list_instances().remove(0);
    assert!(summary.runtime.last_error.is_some());
}

#[tokio::test]
async fn missing_bundle_fails_before_launch() {
    let fleet = open_fleet(tempfile::tempdir().unwrap(), Duration::ZERO);
    let inst = add_one(&fleet);

    let err = fleet.orchestrator.start_instance(&inst.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeMissing);
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 0);
    assert!(!fleet.orchestrator.runtime_bundle_present());
}

#[tokio::test]
async fn concurrent_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("bundle")).unwrap();
    fs::write(dir.path().join("bundle").join("index.js"), "").unwrap();
    let fleet = open_fleet(dir, Duration::from_millis(200));
    let inst = add_one(&fleet);

    let (first, second) = tokio::join!(
        fleet.orchestrator.start_instance(&inst.id),
        fleet.orchestrator.start_instance(&inst.id)
    );

    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().kind(), ErrorKind::OperationInProgress);
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 1);
    assert_eq!(
        fleet.orchestrator.get_status(&inst.id).unwrap(),
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn stopping_a_stopped_instance_is_a_no_op() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    let mut events = fleet.orchestrator.subscribe();

    fleet.orchestrator.stop_instance(&inst.id).await.unwrap();

    assert_eq!(fleet.harness.app_stops.load(Ordering::SeqCst), 0);
    assert_eq!(fleet.harness.browser_stops.load(Ordering::SeqCst), 0);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn occupied_port_blocks_start() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    let _holder = std::net::TcpListener::bind(("127.0.0.1", inst.control_port)).unwrap();

    let err = fleet.orchestrator.start_instance(&inst.id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PortConflict);
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 0);
    assert_eq!(fleet.harness.app_launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn half_alive_instance_reports_stopped() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    fleet.harness.browser_healthy.store(true, Ordering::SeqCst);

    fleet.orchestrator.probe_all().await;

    assert_eq!(
        fleet.orchestrator.get_status(&inst.id).unwrap(),
        InstanceStatus::Stopped
    );
    let summary = fleet.orchestrator.list_instances().remove(0);
    assert!(summary.runtime.control_healthy);
    assert!(!summary.runtime.app_healthy);

    fleet.harness.app_healthy.store(true, Ordering::SeqCst);
    fleet.orchestrator.probe_all().await;
    assert_eq!(
        fleet.orchestrator.get_status(&inst.id).unwrap(),
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn instances_get_distinct_ports_that_persist() {
    let fleet = fleet();
    let created = fleet.orchestrator.add_instances("default", 3, None).unwrap();
    assert_eq!(created.len(), 3);

    let mut ports: Vec<u16> = created
        .iter()
        .flat_map(|inst| [inst.app_port, inst.control_port])
        .collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 6);

    let profiles: std::collections::HashSet<&str> =
        created.iter().map(|inst| inst.profile_dir.as_str()).collect();
    assert_eq!(profiles.len(), 3);

    let Fleet { dir, .. } = fleet;
    let reopened = open_fleet(dir, Duration::ZERO);
    let listed: Vec<InstanceConfig> = reopened
        .orchestrator
        .list_instances()
        .into_iter()
        .map(|summary| summary.config)
        .collect();
    assert_eq!(listed, created);
}

#[tokio::test]
async fn explicit_ids_and_unknown_templates() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;

    let created = orch.add_instances("default", 1, Some("alpha")).unwrap();
    assert_eq!(created[0].id, "alpha");

    let dup = orch.add_instances("default", 1, Some("alpha")).unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::ConfigValidation);
    let bad = orch.add_instances("default", 1, Some("../etc")).unwrap_err();
    assert_eq!(bad.kind(), ErrorKind::ConfigValidation);
    let missing = orch.add_instances("no-such-type", 1, None).unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::TemplateNotFound);
    assert_eq!(orch.list_instances().len(), 1);
}

#[tokio::test]
async fn remove_deletes_instance_and_runtime() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    fleet.orchestrator.start_instance(&inst.id).await.unwrap();
    let runtime_dir = fleet.dir.path().join("runtime").join(&inst.id);
    assert!(runtime_dir.is_dir());

    let mut events = fleet.orchestrator.subscribe();
    fleet.orchestrator.remove_instance(&inst.id).await.unwrap();

    assert_eq!(drain(&mut events), vec![InstanceEventKind::Removed]);
    assert_eq!(fleet.harness.app_stops.load(Ordering::SeqCst), 1);
    assert!(!runtime_dir.exists());
    assert!(fleet.orchestrator.list_instances().is_empty());
    assert_eq!(
        fleet.orchestrator.get_status(&inst.id).unwrap_err().kind(),
        ErrorKind::InstanceNotFound
    );
}

#[tokio::test]
async fn bulk_operations_report_each_instance() {
    let fleet = fleet();
    fleet.orchestrator.add_instances("default", 2, None).unwrap();

    let started = fleet.orchestrator.start_all().await;
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|outcome| outcome.ok));

    let restarted = fleet.orchestrator.restart_all().await;
    assert!(restarted.iter().all(|outcome| outcome.ok));
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 4);

    let stopped = fleet.orchestrator.stop_all().await;
    assert!(stopped.iter().all(|outcome| outcome.ok));
    assert!(fleet
        .orchestrator
        .list_instances()
        .iter()
        .all(|summary| summary.status == InstanceStatus::Stopped));
}

#[tokio::test]
async fn monitor_flags_lost_health() {
    let fleet = fleet();
    let inst = add_one(&fleet);
    fleet.orchestrator.start_instance(&inst.id).await.unwrap();

    let Fleet {
        dir: _dir,
        harness,
        orchestrator,
    } = fleet;
    let orchestrator = Arc::new(orchestrator);
    let mut events = orchestrator.subscribe();
    let handle = Arc::clone(&orchestrator).spawn_monitor(Duration::from_millis(50));

    harness.app_healthy.store(false, Ordering::SeqCst);
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    handle.abort();

    assert_eq!(event.instance_id, inst.id);
    assert_eq!(event.kind, InstanceEventKind::Error);
    assert_eq!(orchestrator.get_status(&inst.id).unwrap(), InstanceStatus::Error);
    let summary = orchestrator.list_instances().remove(0);
    assert!(summary.runtime.last_error.unwrap().contains("health check lost"));
}

/// Start of a run of `len` free loopback ports.
fn free_run(len: u16) -> u16 {
    loop {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        if base < 60_000
            && (0..len).all(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).is_ok())
        {
            return base;
        }
    }
}

#[tokio::test]
async fn each_port_kind_advances_from_its_own_highest() {
    let fleet = fleet();
    let base = free_run(20);
    let settings = Settings {
        start_app_port: base,
        start_control_port: base + 10,
        ..fleet.orchestrator.get_settings()
    };
    fleet.orchestrator.update_settings(settings).unwrap();

    let created = fleet.orchestrator.add_instances("default", 3, None).unwrap();
    let pairs: Vec<(u16, u16)> = created
        .iter()
        .map(|inst| (inst.app_port, inst.control_port))
        .collect();
    assert_eq!(
        pairs,
        vec![(base, base + 10), (base + 1, base + 11), (base + 2, base + 12)]
    );

    let next = fleet.orchestrator.add_instances("default", 1, None).unwrap();
    assert_eq!((next[0].app_port, next[0].control_port), (base + 3, base + 13));
}

#[tokio::test]
async fn remove_waits_for_in_flight_start() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("bundle")).unwrap();
    fs::write(dir.path().join("bundle").join("index.js"), "").unwrap();
    let fleet = open_fleet(dir, Duration::from_millis(300));
    let inst = add_one(&fleet);

    let (started, removed) = tokio::join!(fleet.orchestrator.start_instance(&inst.id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fleet.orchestrator.remove_instance(&inst.id).await
    });

    started.unwrap();
    removed.unwrap();
    assert_eq!(fleet.harness.browser_launches.load(Ordering::SeqCst), 1);
    assert_eq!(fleet.harness.app_stops.load(Ordering::SeqCst), 1);
    assert_eq!(fleet.harness.browser_stops.load(Ordering::SeqCst), 1);
    assert!(fleet.orchestrator.list_instances().is_empty());
    assert!(!fleet.dir.path().join("pids").join(format!("{}.lock", inst.id)).exists());
}
