// Platform backends: process enumeration, cgroup marking and traffic shaping

#[cfg(target_os = "linux")]
pub mod cgroup;
pub mod process;
pub mod shaping;
