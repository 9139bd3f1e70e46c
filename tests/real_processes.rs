//! Lifecycle against real child processes: a shell launcher standing in for the browser
//! and `sh` as the app runtime, both serving HTTP through `python3 -m http.server`.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_fleet::config::Settings;
use agent_fleet::instance::{InstanceStatus, Orchestrator};
use agent_fleet::paths::Paths;
use agent_fleet::process::{platform_inspector, PortAllocator, Timeouts};
use agent_fleet::ErrorKind;

fn timeouts() -> Timeouts {
    Timeouts {
        browser_startup: Duration::from_secs(15),
        app_startup: Duration::from_secs(15),
        poll_interval: Duration::from_millis(100),
        graceful_shutdown: Duration::from_secs(3),
        page_flush_delay: Duration::from_millis(10),
        lock_release_delay: Duration::from_millis(10),
        restart_settle: Duration::from_millis(10),
        probe: Duration::from_millis(500),
        port_release: Duration::from_secs(5),
    }
}

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

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Browser stand-in: serves `/json/version` on the requested debugging port.
fn fake_browser(root: &Path, python: &Path) -> PathBuf {
    let site = root.join("devtools");
    fs::create_dir_all(site.join("json")).unwrap();
    fs::write(site.join("json").join("version"), r#"{"Browser":"Fake/1.0"}"#).unwrap();

    let exe = root.join("fake-browser.sh");
    write_executable(
        &exe,
        &format!(
            "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    --remote-debugging-port=*) port=\"${{arg#*=}}\" ;;\n  esac\ndone\nexec {} -m http.server \"$port\" --bind 127.0.0.1 --directory '{}'\n",
            python.display(),
            site.display()
        ),
    );
    exe
}

/// Bundle with a healthy app (`index.sh`) and one that dies at startup (`crash.sh`).
fn write_bundle(root: &Path, python: &Path) {
    let bundle = root.join("bundle");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("health"), "ok").unwrap();
    fs::write(
        bundle.join("index.sh"),
        format!(
            "exec {} -m http.server \"$PORT\" --bind 127.0.0.1 --directory .\n",
            python.display()
        ),
    )
    .unwrap();
    fs::write(bundle.join("crash.sh"), "echo cannot start\nexit 1\n").unwrap();
}

#[tokio::test]
async fn ports_and_profile_are_released_after_stop_and_rollback() {
    let Ok(python) = which::which("python3") else {
        eprintln!("python3 not available, skipping");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let browser = fake_browser(dir.path(), &python);
    write_bundle(dir.path(), &python);

    let orch = Orchestrator::open_with(Paths::new(dir.path()), timeouts()).unwrap();
    let base = free_run(20);
    let settings = Settings {
        browser_path: Some(browser.to_string_lossy().into_owned()),
        app_runtime_path: Some("sh".to_string()),
        app_entrypoint: "index.sh".to_string(),
        start_app_port: base,
        start_control_port: base + 10,
        ..orch.get_settings()
    };
    orch.update_settings(settings.clone()).unwrap();
    let inst = orch.add_instances("default", 1, None).unwrap().remove(0);
    let inspector = platform_inspector();

    orch.start_instance(&inst.id).await.unwrap();
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Running);
    assert!(PortAllocator::is_in_use(inst.app_port));
    assert!(PortAllocator::is_in_use(inst.control_port));

    orch.stop_instance(&inst.id).await.unwrap();
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Stopped);
    for port in [inst.app_port, inst.control_port] {
        assert!(PortAllocator::wait_for_release(port, Duration::from_secs(5)).await);
    }
    let profile_arg = format!("--user-data-dir={}", inst.profile_dir);
    assert!(inspector.pids_with_arg(&profile_arg).is_empty());

    orch.update_settings(Settings {
        app_entrypoint: "crash.sh".to_string(),
        ..settings
    })
    .unwrap();
    let err = orch.start_instance(&inst.id).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialStartFailure);
    assert_eq!(orch.get_status(&inst.id).unwrap(), InstanceStatus::Error);
    for port in [inst.app_port, inst.control_port] {
        assert!(PortAllocator::wait_for_release(port, Duration::from_secs(5)).await);
    }
    assert!(inspector.pid_for_port(inst.control_port).is_none());
}
