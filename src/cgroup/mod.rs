use std::fs;
use std::process;

use log::warn;
use nix::unistd::Pid;

use crate::error::RunguardError;
use crate::options::RunguardOptions;

mod v1;
mod v2;

pub use v1::CgroupV1;
pub use v2::CgroupV2;

/// Which cgroup filesystem flavour is mounted. Detected once at startup;
/// the two drivers are never interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
  V1,
  V2,
}

/// Resource usage read back from the control group after the run.
#[derive(Debug, Clone, Copy)]
pub struct CgroupStats {
  /// Peak ram+swap use in bytes.
  pub memory_bytes: u64,
  /// Total CPU time consumed by the whole group, in seconds.
  pub cpu_seconds: f64,
}

pub enum CgroupManager {
  V1(CgroupV1),
  V2(CgroupV2),
}

impl CgroupManager {
  pub fn create(
    version: CgroupVersion,
    name: &str,
    opts: &RunguardOptions,
  ) -> Result<Self, RunguardError> {
    match version {
      CgroupVersion::V1 => Ok(CgroupManager::V1(CgroupV1::create(name, opts)?)),
      CgroupVersion::V2 => Ok(CgroupManager::V2(CgroupV2::create(name, opts)?)),
    }
  }

  /// Move `pid` into the memory controller of the group. Called from the
  /// child before exec so every descendant inherits membership.
  pub fn attach(&self, pid: Pid) -> Result<(), RunguardError> {
    match self {
      CgroupManager::V1(cg) => cg.attach(pid),
      CgroupManager::V2(cg) => cg.attach(pid),
    }
  }

  pub fn sample(&self) -> Result<CgroupStats, RunguardError> {
    match self {
      CgroupManager::V1(cg) => cg.sample(),
      CgroupManager::V2(cg) => cg.sample(),
    }
  }

  /// SIGKILL every process still in the group until none remain.
  pub fn kill_all(&self) -> Result<(), RunguardError> {
    match self {
      CgroupManager::V1(cg) => cg.kill_all(),
      CgroupManager::V2(cg) => cg.kill_all(),
    }
  }

  pub fn delete(&self) -> Result<(), RunguardError> {
    match self {
      CgroupManager::V1(cg) => cg.delete(),
      CgroupManager::V2(cg) => cg.delete(),
    }
  }

  /// Assert that no process survived the run. A non-empty group after the
  /// child was reaped means grandchildren escaped the process group.
  pub fn check_empty(&self) -> Result<(), RunguardError> {
    match self {
      CgroupManager::V1(cg) => cg.check_empty(),
      CgroupManager::V2(cg) => cg.check_empty(),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      CgroupManager::V1(cg) => cg.name(),
      CgroupManager::V2(cg) => cg.name(),
    }
  }
}

/// Look at what is mounted on /sys/fs/cgroup.
pub fn detect_version() -> CgroupVersion {
  match fs::read_to_string("/proc/mounts") {
    Ok(mounts) => version_from_mounts(&mounts),
    Err(err) => {
      warn!("cannot read /proc/mounts: {}", err);
      CgroupVersion::V1
    }
  }
}

fn version_from_mounts(mounts: &str) -> CgroupVersion {
  for line in mounts.lines() {
    let mut fields = line.split_whitespace();
    let _device = fields.next();
    if fields.next() == Some("/sys/fs/cgroup") {
      if fields.next() == Some("cgroup2") {
        return CgroupVersion::V2;
      }
      break;
    }
  }
  CgroupVersion::V1
}

/// Unique slash-delimited group name: supervisor pid, a cpuset prefix
/// capped at 16 characters, and the start time with microseconds.
pub fn unique_name(cpuset: Option<&str>) -> String {
  let now = chrono::Local::now();
  let prefix: String = cpuset.unwrap_or("").chars().take(16).collect();
  format!(
    "domjudge/dj_cgroup_{}_{}_{}.{:06}",
    process::id(),
    prefix,
    now.timestamp(),
    now.timestamp_subsec_micros()
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detects_cgroup2_mount() {
    let mounts = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid,nodev,noexec,relatime,nsdelegate 0 0
";
    assert_eq!(version_from_mounts(mounts), CgroupVersion::V2);
  }

  #[test]
  fn detects_legacy_mount() {
    let mounts = "\
tmpfs /sys/fs/cgroup tmpfs ro,nosuid,nodev,noexec,mode=755 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,nodev,noexec,relatime,memory 0 0
";
    assert_eq!(version_from_mounts(mounts), CgroupVersion::V1);
  }

  #[test]
  fn missing_mount_defaults_to_legacy() {
    assert_eq!(version_from_mounts(""), CgroupVersion::V1);
  }

  #[test]
  fn unique_name_embeds_pid_and_cpuset_prefix() {
    let name = unique_name(Some("0,2-3"));
    assert!(name.starts_with("domjudge/dj_cgroup_"));
    assert!(name.contains(&format!("_{}_", process::id())));
    assert!(name.contains("0,2-3"));
  }

  #[test]
  fn unique_name_caps_cpuset_prefix() {
    let long = "0".repeat(40);
    let name = unique_name(Some(&long));
    assert!(!name.contains(&"0".repeat(17)));
  }
}
