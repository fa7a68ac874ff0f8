use std::path::PathBuf;

use log::debug;
use nix::libc;
use nix::unistd::{Gid, Uid, User};

use crate::error::RunguardError;
use crate::report::TimeUsed;

/// Users `-u` may select, compile-time policy: comma-separated entries,
/// each a numeric uid, a username, or a `*`/`?` wildcard pattern.
pub fn valid_users() -> &'static str {
  option_env!("RUNGUARD_VALID_USERS").unwrap_or("domjudge-run-*")
}

/// All chroot targets must resolve below this directory.
pub fn chroot_prefix() -> &'static str {
  option_env!("RUNGUARD_CHROOT_PREFIX").unwrap_or("/chroot/domjudge")
}

/// Soft and hard limit of one clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePair {
  pub soft: f64,
  pub hard: f64,
}

/// The user selected with `-u`: resolved uid plus the raw argument,
/// which the allow-list patterns match against.
#[derive(Debug, Clone)]
pub struct RunUser {
  pub uid: Uid,
  pub raw: String,
}

/// Everything the supervisor needs to know, immutable after parsing.
#[derive(Debug, Clone)]
pub struct RunguardOptions {
  pub command: String,
  pub arguments: Vec<String>,

  pub walltime: Option<TimePair>,
  pub cputime: Option<TimePair>,
  pub time_used: TimeUsed,

  pub memory_bytes: Option<u64>,
  pub file_bytes: Option<u64>,
  pub nproc: Option<u64>,
  pub cpuset: Option<String>,
  pub stream_cap_bytes: Option<u64>,
  pub no_coredump: bool,

  pub run_user: Option<RunUser>,
  pub run_gid: Option<Gid>,
  pub root_dir: Option<PathBuf>,
  pub root_chdir: Option<PathBuf>,

  pub stdout_file: Option<PathBuf>,
  pub stderr_file: Option<PathBuf>,
  pub metadata_file: Option<PathBuf>,

  pub preserve_env: bool,
  pub env_vars: Vec<String>,

  pub runpipe_pid: Option<i32>,
  pub quiet: bool,
}

impl RunguardOptions {
  pub fn new<PS: Into<String>, AS: Into<String>>(command: PS, arguments: Vec<AS>) -> Self {
    RunguardOptions {
      command: command.into(),
      arguments: arguments.into_iter().map(|a| a.into()).collect(),
      walltime: None,
      cputime: None,
      time_used: TimeUsed::Cpu,
      memory_bytes: None,
      file_bytes: None,
      nproc: None,
      cpuset: None,
      stream_cap_bytes: None,
      no_coredump: false,
      run_user: None,
      run_gid: None,
      root_dir: None,
      root_chdir: None,
      stdout_file: None,
      stderr_file: None,
      metadata_file: None,
      preserve_env: false,
      env_vars: vec![],
      runpipe_pid: None,
      quiet: false,
    }
  }

  /// Policy checks that need the resolved identity and the running system.
  pub fn validate(&self) -> Result<(), RunguardError> {
    if let Some(user) = &self.run_user {
      check_valid_user(user)?;
    }
    if let Some(cpuset) = &self.cpuset {
      check_cpuset(cpuset)?;
    }
    Ok(())
  }
}

/// Parse `soft` or `soft:hard` seconds; both must be finite and positive,
/// and the hard limit must not undercut the soft one.
pub fn parse_time_pair(desc: &str, text: &str) -> Result<TimePair, RunguardError> {
  let bad = || RunguardError::cli(format!("invalid {} specified: `{}'", desc, text));

  let (soft_text, hard_text) = match text.split_once(':') {
    Some((soft, hard)) => (soft, Some(hard)),
    None => (text, None),
  };

  let soft: f64 = soft_text.parse().map_err(|_| bad())?;
  if !soft.is_finite() || soft <= 0.0 {
    return Err(bad());
  }

  let hard = match hard_text {
    Some(hard_text) => {
      let hard: f64 = hard_text.parse().map_err(|_| bad())?;
      if !hard.is_finite() || hard <= 0.0 {
        return Err(bad());
      }
      hard
    }
    None => soft,
  };

  if hard < soft {
    return Err(RunguardError::cli(format!(
      "invalid {} specified: hard limit is lower than soft limit",
      desc
    )));
  }

  Ok(TimePair { soft, hard })
}

/// Parse a size given in kilobytes into bytes. Overflow saturates to
/// "unlimited" (`None`).
pub fn parse_size_kb(desc: &str, text: &str, minval: i64) -> Result<Option<u64>, RunguardError> {
  let value: i64 = text
    .parse()
    .map_err(|_| RunguardError::cli(format!("invalid {} specified: `{}'", desc, text)))?;
  if value < minval {
    return Err(RunguardError::cli(format!(
      "invalid {} specified: `{}'",
      desc, text
    )));
  }
  Ok((value as u64).checked_mul(1024))
}

pub fn parse_count(desc: &str, text: &str) -> Result<u64, RunguardError> {
  let value: i64 = text
    .parse()
    .map_err(|_| RunguardError::cli(format!("invalid {} specified: `{}'", desc, text)))?;
  if value < 1 {
    return Err(RunguardError::cli(format!(
      "invalid {} specified: `{}'",
      desc, text
    )));
  }
  Ok(value as u64)
}

/// Resolve `-u`: a numeric uid, or a username looked up in the passwd
/// database. Non-numeric names must satisfy the POSIX username syntax.
pub fn resolve_user(text: &str) -> Result<RunUser, RunguardError> {
  let uid = match text.parse::<libc::uid_t>() {
    Ok(uid) => Uid::from_raw(uid),
    Err(_) => {
      if !is_posix_username(text) {
        return Err(RunguardError::cli(format!(
          "username `{}' does not match POSIX pattern",
          text
        )));
      }
      User::from_name(text)
        .map_err(|err| RunguardError::sys("looking up user", err))?
        .ok_or_else(|| {
          RunguardError::cli(format!("invalid username or ID specified: `{}'", text))
        })?
        .uid
    }
  };
  Ok(RunUser {
    uid,
    raw: text.to_string(),
  })
}

/// Resolve `-g`: a numeric gid or a group name.
pub fn resolve_group(text: &str) -> Result<Gid, RunguardError> {
  match text.parse::<libc::gid_t>() {
    Ok(gid) => Ok(Gid::from_raw(gid)),
    Err(_) => Ok(
      nix::unistd::Group::from_name(text)
        .map_err(|err| RunguardError::sys("looking up group", err))?
        .ok_or_else(|| {
          RunguardError::cli(format!("invalid groupname or ID specified: `{}'", text))
        })?
        .gid,
    ),
  }
}

/// The primary group of a uid, used when `-u` is given without `-g` so the
/// command never keeps the invoker's group.
pub fn primary_group(uid: Uid) -> Result<Gid, RunguardError> {
  Ok(
    User::from_uid(uid)
      .map_err(|err| RunguardError::sys("looking up user", err))?
      .ok_or_else(|| {
        RunguardError::cli(format!("cannot resolve primary group of uid {}", uid))
      })?
      .gid,
  )
}

fn check_valid_user(user: &RunUser) -> Result<(), RunguardError> {
  let mut allowed = false;
  for entry in valid_users().split(',') {
    let entry = entry.trim();
    if entry.is_empty() {
      continue;
    }
    if let Ok(Some(pwd)) = User::from_name(entry) {
      if pwd.uid == user.uid {
        allowed = true;
        break;
      }
    }
    if wildcard_match(entry, &user.raw) {
      allowed = true;
      break;
    }
  }
  if !allowed || user.uid.as_raw() == 0 {
    return Err(RunguardError::cli(format!(
      "illegal user specified: {}",
      user.raw
    )));
  }
  debug!("run user `{}' accepted (uid {})", user.raw, user.uid);
  Ok(())
}

/// A bare integer cpuset must name an existing processor; list syntax like
/// "0,2-3" is validated by the kernel when the cgroup is created.
fn check_cpuset(cpuset: &str) -> Result<(), RunguardError> {
  if let Ok(cpu) = cpuset.parse::<i64>() {
    let nprocs = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if cpu < 0 || nprocs < 1 || cpu >= nprocs {
      return Err(RunguardError::cli(format!(
        "processor ID {} given as cpuset, but only {} cores configured",
        cpu, nprocs
      )));
    }
  }
  Ok(())
}

/// `fnmatch`-style matching with `*` and `?` only, which is all the
/// allow-list patterns use.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
  fn matches(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
      (None, None) => true,
      (Some(b'*'), _) => {
        matches(&pattern[1..], name) || (!name.is_empty() && matches(pattern, &name[1..]))
      }
      (Some(b'?'), Some(_)) => matches(&pattern[1..], &name[1..]),
      (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
      _ => false,
    }
  }
  matches(pattern.as_bytes(), name.as_bytes())
}

pub fn is_posix_username(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(first) if first.is_ascii_alphabetic() => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn time_pair_single_value_sets_both() {
    let pair = parse_time_pair("walltime", "1.5").unwrap();
    assert_eq!(pair, TimePair { soft: 1.5, hard: 1.5 });
  }

  #[test]
  fn time_pair_soft_and_hard() {
    let pair = parse_time_pair("walltime", "1:2.5").unwrap();
    assert_eq!(pair, TimePair { soft: 1.0, hard: 2.5 });
  }

  #[test]
  fn time_pair_rejects_garbage() {
    assert!(parse_time_pair("walltime", "abc").is_err());
    assert!(parse_time_pair("walltime", "0").is_err());
    assert!(parse_time_pair("walltime", "-1").is_err());
    assert!(parse_time_pair("walltime", "inf").is_err());
    assert!(parse_time_pair("walltime", "1:").is_err());
    assert!(parse_time_pair("walltime", "nan:1").is_err());
  }

  #[test]
  fn time_pair_rejects_hard_below_soft() {
    assert!(parse_time_pair("cputime", "2:1").is_err());
  }

  #[test]
  fn size_kb_scales_to_bytes() {
    assert_eq!(parse_size_kb("memory limit", "16384", 1).unwrap(), Some(16384 * 1024));
  }

  #[test]
  fn size_kb_overflow_saturates_to_unlimited() {
    let huge = format!("{}", i64::MAX);
    assert_eq!(parse_size_kb("memory limit", &huge, 1).unwrap(), None);
  }

  #[test]
  fn size_kb_respects_minimum() {
    assert!(parse_size_kb("memory limit", "0", 1).is_err());
    assert_eq!(parse_size_kb("streamsize limit", "0", 0).unwrap(), Some(0));
  }

  #[test]
  fn wildcard_patterns() {
    assert!(wildcard_match("domjudge-run-*", "domjudge-run-0"));
    assert!(wildcard_match("domjudge-run-*", "domjudge-run-"));
    assert!(!wildcard_match("domjudge-run-*", "domjudge"));
    assert!(wildcard_match("run?", "run0"));
    assert!(!wildcard_match("run?", "run"));
    assert!(wildcard_match("exact", "exact"));
    assert!(!wildcard_match("exact", "exactly"));
  }

  #[test]
  fn posix_username_syntax() {
    assert!(is_posix_username("domjudge-run-0"));
    assert!(is_posix_username("a.b_c-d"));
    assert!(!is_posix_username("0abc"));
    assert!(!is_posix_username(""));
    assert!(!is_posix_username("bad name"));
  }

  #[test]
  fn cpuset_list_syntax_passes_through() {
    assert!(check_cpuset("0,2-3").is_ok());
  }

  #[test]
  fn cpuset_out_of_range_is_rejected() {
    assert!(check_cpuset("100000").is_err());
    assert!(check_cpuset("-1").is_err());
    assert!(check_cpuset("0").is_ok());
  }
}
