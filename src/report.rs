use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

use crate::error::RunguardError;
use crate::meta::MetaFile;
use crate::options::RunguardOptions;

/// Bitmask of the soft/hard time limits.
pub const SOFT_TIMELIMIT: u8 = 1;
pub const HARD_TIMELIMIT: u8 = 2;

/// Strings written when exceeding no/soft/hard/both limits.
const TIMELIMIT_LABEL: [&str; 4] = ["", "soft-timelimit", "hard-timelimit", "hard-timelimit"];

/// Which clock is authoritative for `time-result`: the last of `-t`/`-C`
/// given on the command line, defaulting to CPU time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUsed {
  Wall,
  Cpu,
}

/// Everything the outcome record is derived from.
#[derive(Debug, Clone, Copy)]
pub struct RunTotals {
  pub exitcode: i32,
  /// Terminating signal observed by the parent's handler, if any.
  pub signal: Option<i32>,
  pub wall_seconds: f64,
  pub user_seconds: f64,
  pub sys_seconds: f64,
  pub cpu_seconds: f64,
  pub memory_bytes: u64,
  pub wall_flags: u8,
  pub cpu_flags: u8,
}

/// Map the child's wait status onto the exit code runguard itself returns.
/// A SIGXCPU kill marks the hard CPU limit as reached.
pub fn derive_exit_code(status: &WaitStatus, cpu_flags: &mut u8) -> Result<i32, RunguardError> {
  match status {
    WaitStatus::Exited(_, code) => Ok(*code),
    WaitStatus::Signaled(_, signal, _) => {
      if *signal == Signal::SIGXCPU {
        *cpu_flags |= HARD_TIMELIMIT;
        warn!("timelimit exceeded (hard cpu time)");
      } else {
        warn!("command terminated with signal {}", *signal as i32);
      }
      Ok(128 + *signal as i32)
    }
    WaitStatus::Stopped(_, signal) => {
      warn!("command stopped with signal {}", *signal as i32);
      Ok(128 + *signal as i32)
    }
    other => Err(RunguardError::system(format!(
      "command exit status unknown: {:?}",
      other
    ))),
  }
}

/// The `time-result` value. A hard limit on either clock always has
/// precedence, whichever clock was selected for reporting.
pub fn time_result(wall_flags: u8, cpu_flags: u8, time_used: TimeUsed) -> &'static str {
  let mut reached = match time_used {
    TimeUsed::Wall => wall_flags,
    TimeUsed::Cpu => cpu_flags,
  };
  if (wall_flags | cpu_flags) & HARD_TIMELIMIT != 0 {
    reached |= HARD_TIMELIMIT;
  }
  TIMELIMIT_LABEL[(reached & 3) as usize]
}

/// Write the outcome record. Detects the soft limits from the measured
/// times, so the flag bits in `totals` are updated in place.
pub fn write_outcome(
  meta: &mut MetaFile,
  opts: &RunguardOptions,
  totals: &mut RunTotals,
) -> Result<(), RunguardError> {
  debug!("command exited with exitcode {}", totals.exitcode);
  meta.write_pair("exitcode", totals.exitcode)?;

  if let Some(signal) = totals.signal {
    meta.write_pair("signal", signal)?;
  }

  meta.write_pair("wall-time", format!("{:.3}", totals.wall_seconds))?;
  meta.write_pair("user-time", format!("{:.3}", totals.user_seconds))?;
  meta.write_pair("sys-time", format!("{:.3}", totals.sys_seconds))?;
  meta.write_pair("cpu-time", format!("{:.3}", totals.cpu_seconds))?;
  meta.write_pair("memory-bytes", totals.memory_bytes)?;

  debug!(
    "runtime is {:.3} seconds real, {:.3} user, {:.3} sys",
    totals.wall_seconds, totals.user_seconds, totals.sys_seconds
  );

  if let Some(wall) = opts.walltime {
    if totals.wall_seconds > wall.soft {
      totals.wall_flags |= SOFT_TIMELIMIT;
      warn!("timelimit exceeded (soft wall time)");
    }
  }
  if let Some(cpu) = opts.cputime {
    if totals.cpu_seconds > cpu.soft {
      totals.cpu_flags |= SOFT_TIMELIMIT;
      warn!("timelimit exceeded (soft cpu time)");
    }
  }

  meta.write_pair(
    "time-used",
    match opts.time_used {
      TimeUsed::Wall => "wall-time",
      TimeUsed::Cpu => "cpu-time",
    },
  )?;
  meta.write_pair(
    "time-result",
    time_result(totals.wall_flags, totals.cpu_flags, opts.time_used),
  )?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use nix::unistd::Pid;
  use std::fs;

  fn totals() -> RunTotals {
    RunTotals {
      exitcode: 0,
      signal: None,
      wall_seconds: 0.5,
      user_seconds: 0.2,
      sys_seconds: 0.1,
      cpu_seconds: 0.3,
      memory_bytes: 4096,
      wall_flags: 0,
      cpu_flags: 0,
    }
  }

  #[test]
  fn normal_exit_keeps_child_code() {
    let mut flags = 0;
    let status = WaitStatus::Exited(Pid::from_raw(1), 42);
    assert_eq!(derive_exit_code(&status, &mut flags).unwrap(), 42);
    assert_eq!(flags, 0);
  }

  #[test]
  fn signal_kill_maps_to_128_plus_signal() {
    let mut flags = 0;
    let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
    assert_eq!(derive_exit_code(&status, &mut flags).unwrap(), 128 + 9);
    assert_eq!(flags, 0);
  }

  #[test]
  fn sigxcpu_sets_hard_cpu_limit() {
    let mut flags = 0;
    let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGXCPU, false);
    assert_eq!(
      derive_exit_code(&status, &mut flags).unwrap(),
      128 + Signal::SIGXCPU as i32
    );
    assert_eq!(flags, HARD_TIMELIMIT);
  }

  #[test]
  fn stopped_child_maps_to_stop_signal() {
    let mut flags = 0;
    let status = WaitStatus::Stopped(Pid::from_raw(1), Signal::SIGSTOP);
    assert_eq!(
      derive_exit_code(&status, &mut flags).unwrap(),
      128 + Signal::SIGSTOP as i32
    );
  }

  #[test]
  fn hard_limit_has_precedence_over_selected_clock() {
    // CPU clock selected, but the wall clock hit its hard limit.
    assert_eq!(time_result(HARD_TIMELIMIT, 0, TimeUsed::Cpu), "hard-timelimit");
    // And the other way around.
    assert_eq!(time_result(0, HARD_TIMELIMIT, TimeUsed::Wall), "hard-timelimit");
  }

  #[test]
  fn soft_limit_only_counts_on_selected_clock() {
    assert_eq!(time_result(SOFT_TIMELIMIT, 0, TimeUsed::Cpu), "");
    assert_eq!(time_result(SOFT_TIMELIMIT, 0, TimeUsed::Wall), "soft-timelimit");
    assert_eq!(time_result(0, 0, TimeUsed::Cpu), "");
  }

  #[test]
  fn soft_and_hard_reads_as_hard() {
    assert_eq!(
      time_result(SOFT_TIMELIMIT | HARD_TIMELIMIT, 0, TimeUsed::Wall),
      "hard-timelimit"
    );
  }

  #[test]
  fn outcome_record_detects_soft_wall_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta");
    let mut meta = MetaFile::open(Some(&path)).unwrap();

    let mut opts = RunguardOptions::new("true", Vec::<String>::new());
    opts.walltime = Some(crate::options::TimePair { soft: 0.25, hard: 10.0 });
    opts.time_used = TimeUsed::Wall;

    let mut totals = totals();
    write_outcome(&mut meta, &opts, &mut totals).unwrap();
    meta.close().unwrap();

    assert_eq!(totals.wall_flags, SOFT_TIMELIMIT);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("exitcode: 0\n"));
    assert!(text.contains("wall-time: 0.500\n"));
    assert!(text.contains("time-used: wall-time\n"));
    assert!(text.contains("time-result: soft-timelimit\n"));
    assert!(!text.contains("signal:"));
  }

  #[test]
  fn outcome_record_reports_signal_and_times() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta");
    let mut meta = MetaFile::open(Some(&path)).unwrap();

    let opts = RunguardOptions::new("true", Vec::<String>::new());
    let mut totals = totals();
    totals.exitcode = 128 + 15;
    totals.signal = Some(15);
    totals.wall_flags = HARD_TIMELIMIT;

    write_outcome(&mut meta, &opts, &mut totals).unwrap();
    meta.close().unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("exitcode: 143\n"));
    assert!(text.contains("signal: 15\n"));
    assert!(text.contains("memory-bytes: 4096\n"));
    assert!(text.contains("time-used: cpu-time\n"));
    assert!(text.contains("time-result: hard-timelimit\n"));
  }
}
