use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cgroup::CgroupStats;
use crate::error::RunguardError;
use crate::options::RunguardOptions;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Unified-hierarchy driver working directly on the cgroupfs files.
pub struct CgroupV2 {
  name: String,
  path: PathBuf,
}

impl CgroupV2 {
  pub fn create(name: &str, opts: &RunguardOptions) -> Result<Self, RunguardError> {
    let path = PathBuf::from(CGROUP_ROOT).join(name);

    // The parent group must delegate the controllers we use. Failure is
    // tolerated here: a prepared judgehost has this set up already, and a
    // real problem surfaces as a hard error on the limit files below.
    if let Some(parent) = path.parent() {
      if let Err(err) = fs::create_dir_all(parent) {
        return Err(RunguardError::cgroup(format!(
          "creating cgroup parent `{}': {}",
          parent.display(),
          err
        )));
      }
      let mut controllers = String::from("+memory");
      if opts.cpuset.is_some() {
        controllers.push_str(" +cpuset");
      }
      if let Err(err) = fs::write(parent.join("cgroup.subtree_control"), &controllers) {
        warn!(
          "cannot delegate controllers in `{}': {}",
          parent.display(),
          err
        );
      }
    }

    fs::create_dir_all(&path)
      .map_err(|err| RunguardError::cgroup(format!("creating cgroup `{}': {}", name, err)))?;

    let cgroup = CgroupV2 {
      name: name.to_string(),
      path,
    };

    // Ram and ram+swap limits are chosen so no swapping can occur.
    match opts.memory_bytes {
      Some(bytes) => {
        cgroup.write_control("memory.max", bytes)?;
        cgroup.write_control("memory.swap.max", 0)?;
      }
      None => {
        cgroup.write_control("memory.max", "max")?;
        cgroup.write_control("memory.swap.max", "max")?;
      }
    }

    match &opts.cpuset {
      Some(cpuset) => {
        cgroup.write_control("cpuset.mems", "0")?;
        cgroup.write_control("cpuset.cpus", cpuset)?;
      }
      None => debug!("cpuset undefined"),
    }

    debug!("created cgroup '{}'", name);
    Ok(cgroup)
  }

  pub fn attach(&self, pid: Pid) -> Result<(), RunguardError> {
    self.write_control("cgroup.procs", pid.as_raw())
  }

  pub fn sample(&self) -> Result<CgroupStats, RunguardError> {
    let peak = self.path.join("memory.peak");
    if !peak.exists() {
      return Err(RunguardError::cgroup(
        "kernel too old and does not support memory.peak",
      ));
    }
    let memory_bytes = self
      .read_control("memory.peak")?
      .trim()
      .parse::<u64>()
      .map_err(|err| RunguardError::cgroup(format!("parsing memory.peak: {}", err)))?;
    // No need to look at swap usage, it is limited to 0.
    debug!("total memory used: {} kB", memory_bytes / 1024);

    let stat = self.read_control("cpu.stat")?;
    let mut cpu_seconds = None;
    for line in stat.lines() {
      let mut parts = line.split_whitespace();
      if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        debug!("cpu.stat: {} = {}", key, value);
        if key == "usage_usec" {
          let usec = value
            .parse::<u64>()
            .map_err(|err| RunguardError::cgroup(format!("parsing cpu.stat: {}", err)))?;
          cpu_seconds = Some(usec as f64 / 1e6);
        }
      }
    }
    let cpu_seconds = cpu_seconds
      .ok_or_else(|| RunguardError::cgroup("cpu.stat is missing usage_usec"))?;

    Ok(CgroupStats {
      memory_bytes,
      cpu_seconds,
    })
  }

  pub fn kill_all(&self) -> Result<(), RunguardError> {
    loop {
      let procs = self.read_control("cgroup.procs")?;
      let pids: Vec<i32> = procs
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
      if pids.is_empty() {
        return Ok(());
      }
      for pid in pids {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
      }
    }
  }

  pub fn delete(&self) -> Result<(), RunguardError> {
    // Give the kernel a moment to notice the group emptied out; a failure
    // after that is a migration race, not worth aborting over.
    thread::sleep(Duration::from_millis(10));
    if let Err(err) = fs::remove_dir(&self.path) {
      warn!("deleting cgroup '{}': {}", self.name, err);
    } else {
      debug!("deleted cgroup '{}'", self.name);
    }
    Ok(())
  }

  pub fn check_empty(&self) -> Result<(), RunguardError> {
    let procs = self.read_control("cgroup.procs")?;
    if !procs.trim().is_empty() {
      return Err(RunguardError::cgroup(
        "found left-over processes in cgroup controller, please check!",
      ));
    }
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  fn write_control<V: ToString>(&self, file: &str, value: V) -> Result<(), RunguardError> {
    fs::write(self.path.join(file), value.to_string()).map_err(|err| {
      RunguardError::cgroup(format!("set cgroup value {}: {}", file, err))
    })
  }

  fn read_control(&self, file: &str) -> Result<String, RunguardError> {
    fs::read_to_string(self.path.join(file)).map_err(|err| {
      RunguardError::cgroup(format!("get cgroup value {}: {}", file, err))
    })
  }
}
