//! Platform process introspection behind a single trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub args: Vec<String>,
}

/// Read-only view of the OS process table and listening sockets.
pub trait ProcessInspector: Send + Sync {
    /// Pid of the process listening on `port`, if any.
    fn pid_for_port(&self, port: u16) -> Option<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Snapshot of all visible processes.
    fn processes(&self) -> Vec<ProcessEntry>;

    /// All descendants of `pid`, deepest first.
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in self.processes() {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }

        let mut order = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            for &child in children.get(&current).map(Vec::as_slice).unwrap_or_default() {
                if child != pid && !order.contains(&child) {
                    order.push(child);
                    queue.push_back(child);
                }
            }
        }
        order.reverse();
        order
    }

    /// Pids (other than our own) with an argument exactly equal to `arg`.
    fn pids_with_arg(&self, arg: &str) -> Vec<u32> {
        let own = std::process::id();
        self.processes()
            .into_iter()
            .filter(|entry| entry.pid != own && entry.args.iter().any(|a| a == arg))
            .map(|entry| entry.pid)
            .collect()
    }
}

/// The inspector for the current platform, chosen once.
pub fn platform_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(super::win_api::WindowsInspector)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(UnixInspector)
    }
}

#[cfg(not(target_os = "windows"))]
pub struct UnixInspector;

#[cfg(not(target_os = "windows"))]
impl ProcessInspector for UnixInspector {
    fn pid_for_port(&self, port: u16) -> Option<u32> {
        #[cfg(target_os = "linux")]
        {
            linux::pid_for_port(port)
        }
        #[cfg(not(target_os = "linux"))]
        {
            ps::pid_for_port(port)
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if kill(Pid::from_raw(raw), None).is_err() {
            return false;
        }
        #[cfg(target_os = "linux")]
        {
            !linux::is_zombie(pid)
        }
        #[cfg(not(target_os = "linux"))]
        {
            true
        }
    }

    fn processes(&self) -> Vec<ProcessEntry> {
        #[cfg(target_os = "linux")]
        {
            linux::processes()
        }
        #[cfg(not(target_os = "linux"))]
        {
            ps::processes()
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashSet;
    use std::fs;

    use super::ProcessEntry;

    /// TCP state code for LISTEN in /proc/net/tcp*.
    const TCP_LISTEN: &str = "0A";

    fn numeric_proc_dirs() -> impl Iterator<Item = u32> {
        fs::read_dir("/proc")
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
    }

    /// Parse `/proc/<pid>/stat`, returning (state, ppid).
    fn read_stat(pid: u32) -> Option<(char, u32)> {
        let s = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let end = s.rfind(')')?;
        let mut rest = s.get((end + 2)..)?.split_whitespace();
        let state = rest.next()?.chars().next()?;
        let ppid = rest.next()?.parse().ok()?;
        Some((state, ppid))
    }

    pub(super) fn is_zombie(pid: u32) -> bool {
        matches!(read_stat(pid), Some(('Z', _)))
    }

    pub(super) fn processes() -> Vec<ProcessEntry> {
        numeric_proc_dirs()
            .filter_map(|pid| {
                let (state, ppid) = read_stat(pid)?;
                if state == 'Z' {
                    return None;
                }
                let raw = fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
                let args = raw
                    .split(|b| *b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect();
                Some(ProcessEntry { pid, ppid, args })
            })
            .collect()
    }

    /// Socket inodes listening on `port` from one /proc/net table.
    fn listening_inodes(table: &str, port: u16, out: &mut HashSet<u64>) {
        let Ok(content) = fs::read_to_string(table) else {
            return;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(local), Some(state), Some(inode)) =
                (fields.get(1), fields.get(3), fields.get(9))
            else {
                continue;
            };
            if *state != TCP_LISTEN {
                continue;
            }
            let local_port = local
                .rsplit(':')
                .next()
                .and_then(|hex| u16::from_str_radix(hex, 16).ok());
            if local_port == Some(port) {
                if let Ok(inode) = inode.parse::<u64>() {
                    if inode != 0 {
                        out.insert(inode);
                    }
                }
            }
        }
    }

    pub(super) fn pid_for_port(port: u16) -> Option<u32> {
        let mut inodes = HashSet::new();
        listening_inodes("/proc/net/tcp", port, &mut inodes);
        listening_inodes("/proc/net/tcp6", port, &mut inodes);
        if inodes.is_empty() {
            return None;
        }

        let mut pids: Vec<u32> = numeric_proc_dirs().collect();
        pids.sort_unstable();
        pids.into_iter().find(|pid| {
            let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
                return false;
            };
            fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| {
                        let target = target.to_string_lossy().into_owned();
                        target
                            .strip_prefix("socket:[")?
                            .strip_suffix(']')?
                            .parse::<u64>()
                            .ok()
                    })
                    .is_some_and(|inode| inodes.contains(&inode))
            })
        })
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod ps {
    use std::process::Command;

    use super::ProcessEntry;

    pub(super) fn processes() -> Vec<ProcessEntry> {
        let Ok(output) = Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()
        else {
            return Vec::new();
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let args = parts.map(str::to_string).collect();
                Some(ProcessEntry { pid, ppid, args })
            })
            .collect()
    }

    pub(super) fn pid_for_port(port: u16) -> Option<u32> {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.trim().parse().ok())
    }
}
