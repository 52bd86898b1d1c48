//! Cgroup support for per-process packet classification
//!
//! Only cgroup v1 `net_cls` is supported: the `tc` cgroup classifier reads
//! `net_cls.classid` from the sending socket's cgroup, which has no
//! equivalent in the unified v2 hierarchy.

pub mod v1;

pub use v1::{Membership, NET_CLS_ROOT, NetClsGroups};

use std::path::Path;

/// Whether a cgroup v1 `net_cls` hierarchy is mounted
pub fn is_cgroup_v1_available() -> bool {
    Path::new(NET_CLS_ROOT).join("cgroup.procs").exists()
}
