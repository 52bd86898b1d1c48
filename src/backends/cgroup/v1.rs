//! Cgroup v1 `net_cls` groups, one per rule leaf
//!
//! # Layout
//!
//! ```text
//! /sys/fs/cgroup/net_cls/tollgate/<interface>/class-<minor>/
//!     net_cls.classid   0x0001MMMM, the leaf's class id
//!     cgroup.procs      processes bound to the rule
//! ```
//!
//! Every socket opened by a member process carries the classid, which the
//! `tc` cgroup filter on the egress qdisc uses to pick the HTB leaf.
//! Unbinding a process moves it back to the hierarchy root. Children forked
//! by a member start in the same group.

use crate::plan::ClassId;
use anyhow::{Context, Result};
use nix::errno::Errno;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Mount point of the net_cls controller
pub const NET_CLS_ROOT: &str = "/sys/fs/cgroup/net_cls";
const TOLLGATE_CGROUP: &str = "tollgate";

/// Result of moving a process between groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Moved,
    /// The process exited before it could be moved
    Vanished,
}

/// The net_cls groups owned by one shaped interface
#[derive(Debug, Clone)]
pub struct NetClsGroups {
    root: PathBuf,
    namespace: PathBuf,
}

impl NetClsGroups {
    pub fn new(interface: &str) -> Self {
        Self::with_root(NET_CLS_ROOT, interface)
    }

    /// Use a different hierarchy root, e.g. a scratch directory in tests
    pub fn with_root(root: impl Into<PathBuf>, interface: &str) -> Self {
        let root = root.into();
        let namespace = root.join(TOLLGATE_CGROUP).join(interface);
        Self { root, namespace }
    }

    pub fn namespace(&self) -> &Path {
        &self.namespace
    }

    pub fn group_path(&self, class_id: ClassId) -> PathBuf {
        self.namespace.join(format!("class-{:x}", class_id.minor))
    }

    /// Create the group for `class_id` if needed and tag it with the classid
    pub fn ensure_group(&self, class_id: ClassId) -> Result<PathBuf> {
        let path = self.group_path(class_id);
        fs::create_dir_all(&path).context(format!("Failed to create cgroup at {:?}", path))?;

        let classid_file = path.join("net_cls.classid");
        fs::write(&classid_file, class_id.net_cls_value().to_string())
            .context(format!("Failed to write classid to {:?}", classid_file))?;

        log::debug!("Cgroup {:?} tagged with classid {}", path, class_id);
        Ok(path)
    }

    /// Move `pid` into the group of `class_id`
    pub fn attach(&self, class_id: ClassId, pid: i32) -> Result<Membership> {
        let path = self.ensure_group(class_id)?;
        move_pid(&path, pid)
    }

    /// Move `pid` back to the hierarchy root
    pub fn detach(&self, pid: i32) -> Result<Membership> {
        move_pid(&self.root, pid)
    }

    /// Whether `pid` is currently a member of the group of `class_id`
    pub fn contains(&self, class_id: ClassId, pid: i32) -> Result<bool> {
        Ok(self.members(class_id)?.contains(&pid))
    }

    /// Pids in the group of `class_id`; empty when the group does not exist
    pub fn members(&self, class_id: ClassId) -> Result<Vec<i32>> {
        read_members(&self.group_path(class_id))
    }

    /// Move any remaining members to the root and remove the group
    ///
    /// Removal is best effort: a group that cannot be removed only costs an
    /// empty directory.
    pub fn release_group(&self, class_id: ClassId) -> Result<()> {
        self.release_path(&self.group_path(class_id))
    }

    fn release_path(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        for pid in read_members(path)? {
            if let Membership::Vanished = self.detach(pid)? {
                log::trace!("PID {} exited while leaving {:?}", pid, path);
            }
        }

        match fs::remove_dir(path) {
            Ok(()) => log::debug!("Removed cgroup {:?}", path),
            Err(e) => log::warn!("Failed to remove cgroup directory {:?}: {}", path, e),
        }
        Ok(())
    }

    /// Release every group left in this interface's namespace and remove the
    /// namespace, e.g. after a crashed run or once shaping ends. Returns the
    /// number of groups found.
    pub fn clear_namespace(&self) -> Result<usize> {
        if !self.namespace.exists() {
            return Ok(0);
        }

        let entries = fs::read_dir(&self.namespace).context(format!(
            "Failed to read cgroup directory {:?}",
            self.namespace
        ))?;

        let mut cleared = 0;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.release_path(&path)?;
                cleared += 1;
            }
        }

        // Siblings for other interfaces keep the parent alive
        let parent = self.root.join(TOLLGATE_CGROUP);
        for dir in [self.namespace.as_path(), parent.as_path()] {
            if let Err(e) = fs::remove_dir(dir) {
                log::debug!("Keeping cgroup directory {:?}: {}", dir, e);
                break;
            }
        }
        Ok(cleared)
    }
}

fn move_pid(group: &Path, pid: i32) -> Result<Membership> {
    let procs_file = group.join("cgroup.procs");
    match fs::write(&procs_file, pid.to_string()) {
        Ok(()) => Ok(Membership::Moved),
        Err(e) if is_missing_process(&e) => Ok(Membership::Vanished),
        Err(e) => Err(e).context(format!("Failed to move PID {} to {:?}", pid, group)),
    }
}

fn is_missing_process(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::ESRCH as i32)
}

fn read_members(group: &Path) -> Result<Vec<i32>> {
    let procs_file = group.join("cgroup.procs");
    let contents = match fs::read_to_string(&procs_file) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(format!("Failed to read {:?}", procs_file)),
    };

    Ok(contents
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_group_writes_classid() {
        let root = tempfile::tempdir().unwrap();
        let groups = NetClsGroups::with_root(root.path(), "eth0");

        let path = groups.ensure_group(ClassId::new(1, 0x1002)).unwrap();
        assert_eq!(path, root.path().join("tollgate/eth0/class-1002"));

        let classid = fs::read_to_string(path.join("net_cls.classid")).unwrap();
        assert_eq!(classid, (0x0001_1002u32).to_string());
    }

    #[test]
    fn test_attach_and_detach() {
        let root = tempfile::tempdir().unwrap();
        let groups = NetClsGroups::with_root(root.path(), "eth0");
        let class_id = ClassId::new(1, 0x1000);

        assert_eq!(groups.attach(class_id, 4242).unwrap(), Membership::Moved);
        let members = fs::read_to_string(groups.group_path(class_id).join("cgroup.procs")).unwrap();
        assert_eq!(members, "4242");
        assert!(groups.contains(class_id, 4242).unwrap());
        assert!(!groups.contains(ClassId::new(1, 0x1001), 4242).unwrap());

        assert_eq!(groups.detach(4242).unwrap(), Membership::Moved);
        let root_members = fs::read_to_string(root.path().join("cgroup.procs")).unwrap();
        assert_eq!(root_members, "4242");
    }

    #[test]
    fn test_release_moves_members_to_root() {
        let root = tempfile::tempdir().unwrap();
        let groups = NetClsGroups::with_root(root.path(), "wlan0");
        let class_id = ClassId::new(1, 0x1001);

        groups.attach(class_id, 77).unwrap();
        groups.release_group(class_id).unwrap();

        let root_members = fs::read_to_string(root.path().join("cgroup.procs")).unwrap();
        assert_eq!(root_members, "77");

        // Releasing a group that never existed is a no-op
        groups.release_group(ClassId::new(1, 0x1fff)).unwrap();
    }

    #[test]
    fn test_clear_namespace_counts_stale_groups() {
        let root = tempfile::tempdir().unwrap();
        let groups = NetClsGroups::with_root(root.path(), "eth0");
        assert_eq!(groups.clear_namespace().unwrap(), 0);

        groups.attach(ClassId::new(1, 0x1000), 12).unwrap();
        groups.ensure_group(ClassId::new(1, 0x1001)).unwrap();
        assert_eq!(groups.clear_namespace().unwrap(), 2);
        assert_eq!(fs::read_to_string(root.path().join("cgroup.procs")).unwrap(), "12");
    }

    #[test]
    fn test_clear_namespace_removes_empty_directories() {
        let root = tempfile::tempdir().unwrap();
        let eth0 = NetClsGroups::with_root(root.path(), "eth0");
        let eth1 = NetClsGroups::with_root(root.path(), "eth1");
        fs::create_dir_all(eth0.namespace()).unwrap();
        fs::create_dir_all(eth1.namespace()).unwrap();

        // eth1 still holds the shared parent
        eth0.clear_namespace().unwrap();
        assert!(!eth0.namespace().exists());
        assert!(eth1.namespace().exists());

        eth1.clear_namespace().unwrap();
        assert!(!root.path().join("tollgate").exists());
    }

    #[test]
    fn test_members_of_missing_group() {
        let root = tempfile::tempdir().unwrap();
        let groups = NetClsGroups::with_root(root.path(), "eth0");
        assert!(groups.members(ClassId::new(1, 0x1000)).unwrap().is_empty());

        groups.attach(ClassId::new(1, 0x1000), 12).unwrap();
        assert_eq!(groups.members(ClassId::new(1, 0x1000)).unwrap(), [12]);
    }
}
