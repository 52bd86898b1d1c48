// Linux process enumeration using procfs

use super::ProcessProvider;
use crate::error::SnapshotError;
use crate::process::{LocalPort, ProcessAttribute, ProcessRecord, ProcessSnapshot, Transport};
use nix::unistd::{Uid, User};
use procfs::process::{FDTarget, Process, all_processes};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// The kernel truncates `comm` to this many bytes
const COMM_LEN: usize = 15;

/// Reads `/proc` and resolves user names through the passwd database
#[derive(Default)]
pub struct LinuxProcessProvider {
    usernames: HashMap<u32, Option<String>>,
}

impl LinuxProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn username(&mut self, uid: u32) -> Option<String> {
        self.usernames
            .entry(uid)
            .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                Ok(user) => user.map(|user| user.name),
                Err(e) => {
                    log::trace!("Failed to look up uid {}: {}", uid, e);
                    None
                }
            })
            .clone()
    }

    /// `None` when the process vanished or its stat line is unreadable
    fn read_process(
        &mut self,
        process: &Process,
        sockets: &HashMap<u64, LocalPort>,
    ) -> Option<ProcessRecord> {
        let stat = match process.stat() {
            Ok(stat) => stat,
            Err(e) => {
                log::trace!("Skipping PID {}: {}", process.pid(), e);
                return None;
            }
        };

        let mut record = ProcessRecord::new(stat.pid, stat.ppid, stat.starttime)
            .with(ProcessAttribute::Status, status_name(stat.state))
            .with(ProcessAttribute::Nice, stat.nice)
            .with(ProcessAttribute::NumThreads, stat.num_threads);

        // Attributes below are best effort: kernel threads have no cmdline or
        // exe, and other users' processes deny access to exe/cwd
        let cmdline = process.cmdline().ok().filter(|args| !args.is_empty());
        record.set(
            ProcessAttribute::Name,
            resolve_name(&stat.comm, cmdline.as_deref()),
        );
        if let Some(cmdline) = cmdline {
            record.set(ProcessAttribute::Cmdline, cmdline);
        }
        if let Ok(exe) = process.exe() {
            record.set(ProcessAttribute::Exe, exe.to_string_lossy().into_owned());
        }
        if let Ok(cwd) = process.cwd() {
            record.set(ProcessAttribute::Cwd, cwd.to_string_lossy().into_owned());
        }
        if let Ok(uid) = process.uid() {
            record.set(ProcessAttribute::Uid, i64::from(uid));
            if let Some(name) = self.username(uid) {
                record.set(ProcessAttribute::Username, name);
            }
        }

        if let Ok(fds) = process.fd() {
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    if let Some(port) = sockets.get(&inode) {
                        record.add_port(*port);
                    }
                }
            }
        }

        Some(record)
    }
}

impl ProcessProvider for LinuxProcessProvider {
    fn snapshot(&mut self) -> Result<ProcessSnapshot, SnapshotError> {
        let processes =
            all_processes().map_err(|e| SnapshotError(format!("failed to read /proc: {e}")))?;

        let sockets = socket_ports();
        let mut records = Vec::new();
        for process in processes {
            let Ok(process) = process else {
                continue;
            };
            if let Some(record) = self.read_process(&process, &sockets) {
                records.push(record);
            }
        }

        log::trace!("Snapshot contains {} processes", records.len());
        Ok(ProcessSnapshot::new(records))
    }
}

/// Socket inode to local port, from /proc/net/{tcp,tcp6,udp,udp6}
fn socket_ports() -> HashMap<u64, LocalPort> {
    fn insert(
        sockets: &mut HashMap<u64, LocalPort>,
        transport: Transport,
        entries: impl IntoIterator<Item = (u64, SocketAddr)>,
    ) {
        for (inode, local_address) in entries {
            // Inode 0 belongs to no process (e.g. TIME_WAIT), port 0 is unbound
            if inode != 0 && local_address.port() != 0 {
                sockets.insert(inode, LocalPort::new(transport, local_address.port()));
            }
        }
    }

    let mut sockets = HashMap::new();
    for table in [procfs::net::tcp(), procfs::net::tcp6()] {
        match table {
            Ok(entries) => insert(
                &mut sockets,
                Transport::Tcp,
                entries.into_iter().map(|e| (e.inode, e.local_address)),
            ),
            Err(e) => log::trace!("Failed to read TCP socket table: {}", e),
        }
    }
    for table in [procfs::net::udp(), procfs::net::udp6()] {
        match table {
            Ok(entries) => insert(
                &mut sockets,
                Transport::Udp,
                entries.into_iter().map(|e| (e.inode, e.local_address)),
            ),
            Err(e) => log::trace!("Failed to read UDP socket table: {}", e),
        }
    }
    sockets
}

/// Human-readable process state, as `ps` tools report it
fn status_name(state: char) -> String {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk-sleep",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing-stop",
        'X' | 'x' => "dead",
        'K' => "wake-kill",
        'W' => "waking",
        'P' => "parked",
        'I' => "idle",
        other => return other.to_string(),
    }
    .to_string()
}

/// `comm` is truncated by the kernel; recover the full name from the first
/// argument when it extends the truncated one
fn resolve_name(comm: &str, cmdline: Option<&[String]>) -> String {
    if comm.len() >= COMM_LEN {
        let full = cmdline
            .and_then(|args| args.first())
            .and_then(|arg0| Path::new(arg0).file_name())
            .map(|name| name.to_string_lossy());
        if let Some(full) = full {
            if full.starts_with(comm) {
                return full.into_owned();
            }
        }
    }
    comm.to_string()
}
