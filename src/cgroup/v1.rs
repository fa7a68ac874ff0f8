use std::thread;
use std::time::Duration;

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::cpuacct::CpuAcctController;
use cgroups_rs::cpuset::CpuSetController;
use cgroups_rs::memory::MemController;
use cgroups_rs::{Cgroup, CgroupPid, Controller};
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cgroup::CgroupStats;
use crate::error::RunguardError;
use crate::options::RunguardOptions;

/// Legacy per-controller hierarchy driver, built on cgroups-rs.
pub struct CgroupV1 {
  name: String,
  cgroup: Cgroup,
}

impl CgroupV1 {
  pub fn create(name: &str, opts: &RunguardOptions) -> Result<Self, RunguardError> {
    let mut builder = CgroupBuilder::new(name);
    if let Some(bytes) = opts.memory_bytes {
      // Equal ram and ram+swap limits so no swapping can occur.
      builder = builder
        .memory()
        .memory_hard_limit(bytes as i64)
        .memory_swap_limit(bytes as i64)
        .done();
    }

    let mut controllers = vec![
      "memory".to_string(),
      "cpu".to_string(),
      "cpuacct".to_string(),
    ];
    if opts.cpuset.is_some() {
      controllers.push("cpuset".to_string());
    }
    let builder = builder.set_specified_controllers(controllers);

    let cgroup = builder
      .build(Box::new(cgroups_rs::hierarchies::V1::new()))
      .map_err(|err| RunguardError::cgroup(format!("creating cgroup `{}': {}", name, err)))?;

    if let Some(cpuset) = &opts.cpuset {
      let controller: &CpuSetController = cgroup
        .controller_of()
        .ok_or_else(|| RunguardError::cgroup("cgroup_add_controller cpuset"))?;
      controller
        .set_mems("0")
        .map_err(|err| RunguardError::cgroup(format!("set cgroup value cpuset.mems: {}", err)))?;
      controller
        .set_cpus(cpuset)
        .map_err(|err| RunguardError::cgroup(format!("set cgroup value cpuset.cpus: {}", err)))?;
    } else {
      debug!("cpuset undefined");
    }

    debug!("created cgroup '{}'", name);
    Ok(CgroupV1 {
      name: name.to_string(),
      cgroup,
    })
  }

  fn memory(&self) -> Result<&MemController, RunguardError> {
    self
      .cgroup
      .controller_of()
      .ok_or_else(|| RunguardError::cgroup("cgroup_add_controller memory"))
  }

  pub fn attach(&self, pid: Pid) -> Result<(), RunguardError> {
    let memory = self.memory()?;
    memory
      .add_task(&CgroupPid::from(pid.as_raw() as u64))
      .map_err(|err| RunguardError::cgroup(format!("attach task to cgroup: {}", err)))
  }

  pub fn sample(&self) -> Result<CgroupStats, RunguardError> {
    let memory_bytes = self.memory()?.memswap().max_usage_in_bytes;
    debug!("total memory used: {} kB", memory_bytes / 1024);

    let cpuacct: &CpuAcctController = self
      .cgroup
      .controller_of()
      .ok_or_else(|| RunguardError::cgroup("cgroup_add_controller cpuacct"))?;
    let cpu_seconds = cpuacct.cpuacct().usage as f64 / 1e9;

    Ok(CgroupStats {
      memory_bytes,
      cpu_seconds,
    })
  }

  pub fn kill_all(&self) -> Result<(), RunguardError> {
    loop {
      let tasks = self.memory()?.tasks();
      if tasks.is_empty() {
        return Ok(());
      }
      for task in tasks {
        let _ = kill(Pid::from_raw(task.pid as i32), Signal::SIGKILL);
      }
    }
  }

  pub fn delete(&self) -> Result<(), RunguardError> {
    thread::sleep(Duration::from_millis(10));
    if let Err(err) = self.cgroup.delete() {
      warn!("deleting cgroup '{}': {}", self.name, err);
    } else {
      debug!("deleted cgroup '{}'", self.name);
    }
    Ok(())
  }

  pub fn check_empty(&self) -> Result<(), RunguardError> {
    if !self.memory()?.tasks().is_empty() {
      return Err(RunguardError::cgroup(
        "found left-over processes in cgroup controller, please check!",
      ));
    }
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}
