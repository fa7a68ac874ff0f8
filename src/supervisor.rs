use std::fs;
use std::path::Path;
use std::time::Instant;

use log::debug;
use nix::errno::Errno;
use nix::libc;
use nix::sched::{unshare, CloneFlags};
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::SigSet;
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{fork, getuid, setuid, sysconf, ForkResult, Pid, SysconfVar};

use crate::cgroup::{self, CgroupManager, CgroupVersion};
use crate::error::{RunguardError, EXIT_INTERNAL_ERROR};
use crate::meta::MetaFile;
use crate::options::RunguardOptions;
use crate::pipe::{self, ChildStreams};
use crate::pump::StreamPump;
use crate::report;
use crate::restrict;
use crate::signals;

/// Run the command under the configured restrictions and return its
/// effective exit code. On a supervisor failure the child group is killed,
/// a single `internal-error` record is written, and the error is returned.
pub fn execute(opts: RunguardOptions) -> Result<i32, RunguardError> {
  let mut supervisor = Supervisor::new(opts)?;
  match supervisor.run() {
    Ok(exitcode) => Ok(exitcode),
    Err(err) => {
      supervisor.fail(&err);
      Err(err)
    }
  }
}

/// All supervisor-owned state, scoped to one run.
struct Supervisor {
  opts: RunguardOptions,
  version: CgroupVersion,
  meta: MetaFile,
  cgroup: Option<CgroupManager>,
}

impl Supervisor {
  fn new(opts: RunguardOptions) -> Result<Self, RunguardError> {
    let version = cgroup::detect_version();
    debug!("control groups version: {:?}", version);
    let meta = MetaFile::open(opts.metadata_file.as_deref())?;
    Ok(Supervisor {
      opts,
      version,
      meta,
      cgroup: None,
    })
  }

  fn run(&mut self) -> Result<i32, RunguardError> {
    self.opts.validate()?;
    signals::set_quiet(self.opts.quiet);
    if let Some(pid) = self.opts.runpipe_pid {
      signals::set_runpipe_pid(pid);
    }

    let pipes = ChildStreams::new()?;

    // SIGCHLD stays blocked in steady state and is only let through while
    // the event loop sits in pselect.
    signals::install_sigchld_handler()?;
    signals::block_sigchld()?;

    let name = cgroup::unique_name(self.opts.cpuset.as_deref());
    self.cgroup = Some(CgroupManager::create(self.version, &name, &self.opts)?);

    unshare_namespaces()?;
    reset_oom_score()?;

    match unsafe { fork() } {
      Err(err) => Err(RunguardError::sys("cannot fork", err)),
      Ok(ForkResult::Child) => {
        let err = match self.cgroup.as_ref() {
          Some(cgroup) => child_main(&self.opts, cgroup, pipes),
          None => RunguardError::system("cgroup not initialised"),
        };
        eprintln!("runguard: {}", err);
        unsafe { libc::_exit(EXIT_INTERNAL_ERROR as libc::c_int) }
      }
      Ok(ForkResult::Parent { child }) => self.supervise(child, pipes),
    }
  }

  /// Parent side: pump the pipes, watch the clocks, reap, reconcile.
  fn supervise(&mut self, child: Pid, pipes: ChildStreams) -> Result<i32, RunguardError> {
    signals::set_child_pid(child);
    debug!("child pid = {}", child);

    // Shed privileges; root is only kept when a separate run user means we
    // may need it to kill the child later.
    if self.opts.run_user.is_none() {
      setuid(getuid()).map_err(|err| RunguardError::sys("setting watchdog uid", err))?;
      debug!("watchdog using user ID `{}'", getuid());
    }

    let start = Instant::now();

    let read_ends = pipes.into_parent()?;
    let stdout_sink = pipe::open_sink(self.opts.stdout_file.as_deref(), libc::STDOUT_FILENO)?;
    let stderr_sink = pipe::open_sink(self.opts.stderr_file.as_deref(), libc::STDERR_FILENO)?;
    let mut pump = StreamPump::new(
      read_ends,
      [stdout_sink, stderr_sink],
      self.opts.stream_cap_bytes,
    );
    debug!("redirection done in parent");

    signals::install_terminate_handler(self.opts.walltime.is_some())?;
    if let Some(walltime) = self.opts.walltime {
      signals::arm_wall_timer(walltime.hard)?;
      debug!("setting hard wall-time limit to {:.3} seconds", walltime.hard);
    }

    let start_ticks = child_ticks()?;

    let status = event_loop(child, &mut pump)?;

    // All in-flight output is captured before the books are closed.
    pump.drain()?;
    pump.close_sinks()?;

    let end_ticks = child_ticks()?;
    let wall_seconds = start.elapsed().as_secs_f64();

    let mut cpu_flags = 0u8;
    let exitcode = report::derive_exit_code(&status, &mut cpu_flags)?;
    debug!("child exited with exit code {}", exitcode);

    if self.opts.walltime.is_some() {
      // Slow cleanup below must not be mistaken for a wall-time timeout.
      signals::disarm_wall_timer()?;
    }

    let Some(cgroup) = self.cgroup.as_ref() else {
      return Err(RunguardError::system("cgroup not initialised"));
    };
    cgroup.check_empty()?;
    let stats = cgroup.sample()?;
    cgroup.kill_all()?;
    cgroup.delete()?;

    // Drop root before writing to the output files.
    setuid(getuid()).map_err(|err| RunguardError::sys("dropping root privileges", err))?;

    let (user_seconds, sys_seconds) = tick_diff(&start_ticks, &end_ticks)?;
    let mut totals = report::RunTotals {
      exitcode,
      signal: signals::received_signal(),
      wall_seconds,
      user_seconds,
      sys_seconds,
      cpu_seconds: stats.cpu_seconds,
      memory_bytes: stats.memory_bytes,
      wall_flags: signals::wall_limit_flags(),
      cpu_flags,
    };
    report::write_outcome(&mut self.meta, &self.opts, &mut totals)?;

    if self.opts.stream_cap_bytes.is_some() {
      self
        .meta
        .write_pair("output-truncated", pump.truncated_label())?;
    }
    self.meta.write_pair("stdin-bytes", pump.bytes_read(0))?;
    self.meta.write_pair("stdout-bytes", pump.bytes_read(1))?;
    self.meta.write_pair("stderr-bytes", pump.bytes_read(2))?;
    self.meta.close()?;

    Ok(exitcode)
  }

  /// Fatal path. Errors raised from here are swallowed: one
  /// `internal-error` line is the authoritative record, and a secondary
  /// failure must not corrupt it or double-kill.
  fn fail(&mut self, err: &RunguardError) {
    signals::block_terminate_signals();
    self.meta.write_quiet("internal-error", err);
    self.meta.close_quiet();
    signals::kill_child_group();
  }
}

/// Child side: restrictions, pipe wiring, exec. Only returns on failure.
fn child_main(opts: &RunguardOptions, cgroup: &CgroupManager, pipes: ChildStreams) -> RunguardError {
  let env = match restrict::apply(opts, cgroup) {
    Ok(env) => env,
    Err(err) => return err,
  };
  debug!("restrictions applied in child");

  // Wire the pipes after the restrictions, so any messages above do not
  // end up in the command's stderr stream.
  if let Err(err) = pipes.attach_child() {
    return err;
  }

  restrict::exec(opts, &env)
}

/// Multiplexed wait for child data or child exit. SIGCHLD is unblocked only
/// inside pselect, so an exit is always observed on the next iteration.
fn event_loop(child: Pid, pump: &mut StreamPump) -> Result<WaitStatus, RunguardError> {
  let run_mask = SigSet::empty();
  loop {
    let mut readfds = FdSet::new();
    pump.fill_fds(&mut readfds);

    match pselect(None, &mut readfds, None, None, None, &run_mask) {
      Ok(_) => {}
      Err(Errno::EINTR) => {}
      Err(err) => return Err(RunguardError::sys("waiting for child data", err)),
    }

    if signals::error_in_handler() {
      return Err(RunguardError::system("error in signal handler, exiting"));
    }

    if signals::received_sigchld() || signals::received_signal() == Some(libc::SIGALRM) {
      let status = wait().map_err(|err| RunguardError::sys("waiting on child", err))?;
      if status.pid() == Some(child) {
        return Ok(status);
      }
    }

    pump.pump(&readfds)?;
  }
}

/// Isolate the child's view of the system. Files, filesystem attributes,
/// IPC, network, mounts, UTS and SysV semaphores are all unshared before
/// fork, so the whole child tree lives in the detached namespaces.
fn unshare_namespaces() -> Result<(), RunguardError> {
  let flags = CloneFlags::CLONE_FILES
    | CloneFlags::CLONE_FS
    | CloneFlags::CLONE_NEWIPC
    | CloneFlags::CLONE_NEWNET
    | CloneFlags::CLONE_NEWNS
    | CloneFlags::CLONE_NEWUTS
    | CloneFlags::CLONE_SYSVSEM;
  unshare(flags).map_err(|err| RunguardError::sys("calling unshare", err))
}

const OOM_PATH_NEW: &str = "/proc/self/oom_score_adj";
const OOM_PATH_OLD: &str = "/proc/self/oom_adj";
const OOM_RESET_VALUE: i32 = 0;

/// A negative OOM-score adjustment is inherited by the child and would turn
/// a memory-exceeded run into a time-out; at least older sshd versions set
/// one. Reset it to neutral.
fn reset_oom_score() -> Result<(), RunguardError> {
  let path = [OOM_PATH_NEW, OOM_PATH_OLD]
    .into_iter()
    .find(|path| Path::new(path).exists());
  let Some(path) = path else {
    return Ok(());
  };

  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(_) => return Ok(()),
  };
  let value: i32 = content
    .trim()
    .parse()
    .map_err(|_| RunguardError::system(format!("cannot read from `{}'", path)))?;

  if value < 0 {
    debug!("resetting `{}' from {} to {}", path, value, OOM_RESET_VALUE);
    fs::write(path, format!("{}\n", OOM_RESET_VALUE))
      .map_err(|err| RunguardError::system(format!("cannot write to `{}': {}", path, err)))?;
  }
  Ok(())
}

fn child_ticks() -> Result<libc::tms, RunguardError> {
  let mut ticks = libc::tms {
    tms_utime: 0,
    tms_stime: 0,
    tms_cutime: 0,
    tms_cstime: 0,
  };
  if unsafe { libc::times(&mut ticks) } == -1 {
    return Err(RunguardError::sys("getting clock ticks", Errno::last()));
  }
  Ok(ticks)
}

/// Cumulative user and system seconds of reaped children between the two
/// snapshots.
fn tick_diff(start: &libc::tms, end: &libc::tms) -> Result<(f64, f64), RunguardError> {
  let ticks_per_second = match sysconf(SysconfVar::CLK_TCK) {
    Ok(Some(ticks)) if ticks > 0 => ticks as f64,
    _ => return Err(RunguardError::system("cannot determine clock ticks per second")),
  };
  let user = (end.tms_cutime - start.tms_cutime) as f64 / ticks_per_second;
  let sys = (end.tms_cstime - start.tms_cstime) as f64 / ticks_per_second;
  Ok((user, sys))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tick_diff_uses_child_times() {
    let start = libc::tms {
      tms_utime: 0,
      tms_stime: 0,
      tms_cutime: 100,
      tms_cstime: 50,
    };
    let mut end = start;
    end.tms_cutime += 200;
    end.tms_cstime += 100;
    let (user, sys) = tick_diff(&start, &end).unwrap();
    assert!(user > 0.0 && sys > 0.0);
    assert!((user / sys - 2.0).abs() < 1e-9);
  }

  #[test]
  fn child_ticks_snapshot_succeeds() {
    child_ticks().unwrap();
  }
}
