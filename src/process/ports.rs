//! Port probing and per-instance port allocation.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::inspect::ProcessInspector;
use crate::config::{InstanceConfig, Settings};
use crate::error::{AppError, Result};

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct PortAllocator {
    inspector: Arc<dyn ProcessInspector>,
}

impl PortAllocator {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    /// Whether something is bound to `port` on loopback.
    pub fn is_in_use(port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::AddrInUse => true,
            Err(e) => {
                log::debug!("Probe bind on port {} failed: {}", port, e);
                true
            }
        }
    }

    pub fn pid_for_port(&self, port: u16) -> Option<u32> {
        self.inspector.pid_for_port(port)
    }

    /// Pick `(app_port, control_port)` for a new instance.
    ///
    /// The app search starts at `start_app_port` or one past the highest recorded app port,
    /// whichever is larger; the control search does the same with control ports. Both skip
    /// every recorded port of either kind and anything live-bound.
    pub fn allocate_pair(existing: &[InstanceConfig], settings: &Settings) -> Result<(u16, u16)> {
        let mut taken: HashSet<u16> = existing
            .iter()
            .flat_map(|inst| [inst.app_port, inst.control_port])
            .collect();

        let app_start = search_start(
            existing.iter().map(|inst| inst.app_port),
            settings.start_app_port,
        );
        let app_port = next_free(app_start, &taken)?;
        taken.insert(app_port);

        let control_start = search_start(
            existing.iter().map(|inst| inst.control_port),
            settings.start_control_port,
        );
        let control_port = next_free(control_start, &taken)?;

        Ok((app_port, control_port))
    }

    /// Poll until `port` is free or `timeout` elapses. Returns `true` once free.
    pub async fn wait_for_release(port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !Self::is_in_use(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RELEASE_POLL_INTERVAL).await;
        }
    }
}

fn search_start(recorded: impl Iterator<Item = u16>, configured: u16) -> u16 {
    recorded
        .max()
        .map_or(configured, |highest| highest.saturating_add(1).max(configured))
}

fn next_free(start: u16, taken: &HashSet<u16>) -> Result<u16> {
    (start.max(1)..=u16::MAX)
        .find(|port| !taken.contains(port) && !PortAllocator::is_in_use(*port))
        .ok_or_else(|| AppError::ports_exhausted(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, app_port: u16, control_port: u16) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            kind: "default".to_string(),
            name: id.to_string(),
            description: String::new(),
            app_port,
            control_port,
            profile_dir: format!("/tmp/{id}"),
            launch_args: Vec::new(),
            created_at: String::new(),
            env: Default::default(),
        }
    }

    /// A free port with a free neighbour above it, found by binding ephemeral listeners.
    fn free_base() -> u16 {
        loop {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            if port < 60_000 && (1..8).all(|i| !PortAllocator::is_in_use(port + i)) {
                return port;
            }
        }
    }

    #[test]
    fn bound_port_is_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(PortAllocator::is_in_use(port));
        drop(listener);
        assert!(!PortAllocator::is_in_use(port));
    }

    #[test]
    fn allocation_skips_recorded_ports() {
        let base = free_base();
        let settings = Settings {
            start_app_port: base,
            start_control_port: base,
            ..Settings::default()
        };
        let existing = vec![instance("a", base, base + 1)];

        let (app, control) = PortAllocator::allocate_pair(&existing, &settings).unwrap();

        for port in [app, control] {
            assert!(port != base && port != base + 1);
        }
        assert_ne!(app, control);
    }

    #[test]
    fn allocation_skips_live_unrecorded_ports() {
        let base = free_base();
        let orphan = TcpListener::bind(("127.0.0.1", base)).unwrap();
        let settings = Settings {
            start_app_port: base,
            start_control_port: base + 4,
            ..Settings::default()
        };

        let (app, control) = PortAllocator::allocate_pair(&[], &settings).unwrap();

        assert_ne!(app, base);
        assert!(app > base);
        assert_eq!(control, base + 4);
        drop(orphan);
    }

    #[test]
    fn allocation_is_deterministic() {
        let base = free_base();
        let settings = Settings {
            start_app_port: base,
            start_control_port: base + 3,
            ..Settings::default()
        };

        let first = PortAllocator::allocate_pair(&[], &settings).unwrap();
        let second = PortAllocator::allocate_pair(&[], &settings).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, (base, base + 3));
    }

    #[test]
    fn app_and_control_ranges_advance_independently() {
        let base = free_base();
        let settings = Settings {
            start_app_port: base,
            start_control_port: base + 4,
            ..Settings::default()
        };
        let existing = vec![instance("a", base, base + 4)];

        let pair = PortAllocator::allocate_pair(&existing, &settings).unwrap();
        assert_eq!(pair, (base + 1, base + 5));
    }

    #[test]
    fn search_starts_past_highest_port_of_its_kind() {
        assert_eq!(search_start([].into_iter(), 3100), 3100);
        assert_eq!(search_start([3100, 3102].into_iter(), 3100), 3103);
        assert_eq!(search_start([3000].into_iter(), 3100), 3100);
        assert_eq!(search_start([9300, 9301].into_iter(), 9300), 9302);
    }

    #[tokio::test]
    async fn release_is_observed_after_close() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!PortAllocator::wait_for_release(port, Duration::from_millis(300)).await);
        drop(listener);
        assert!(PortAllocator::wait_for_release(port, Duration::from_secs(2)).await);
    }
}
