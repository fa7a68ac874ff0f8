use std::env;
use std::ffi::CString;
use std::fs;

use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{
  chdir, chroot, execvpe, getcwd, geteuid, getpid, getuid, setgid, setgroups, setsid, setuid,
};

use crate::cgroup::CgroupManager;
use crate::error::RunguardError;
use crate::options::{chroot_prefix, RunguardOptions};
use crate::utils::into_c_string;

/// Apply all restrictions in the child, in order: environment, resource
/// limits, cgroup membership, new session, chroot, privilege drop. Returns
/// the environment vector for the exec. Any failure aborts the child.
pub fn apply(
  opts: &RunguardOptions,
  cgroup: &CgroupManager,
) -> Result<Vec<CString>, RunguardError> {
  let env = build_env(opts);

  apply_rlimits(opts)?;

  // Join the cgroup before exec and before losing privileges, so every
  // descendant inherits membership.
  cgroup.attach(getpid())?;

  // Run the command in a separate process group so that the command and
  // all its children can be killed off with one signal.
  setsid().map_err(|err| RunguardError::sys("setsid failed", err))?;

  if let Some(root_dir) = &opts.root_dir {
    enter_root(opts)?;
    debug!("using root-directory `{}'", root_dir.display());
  }

  drop_privileges(opts)?;

  Ok(env)
}

/// Exec the command; only returns on failure.
pub fn exec(opts: &RunguardOptions, env: &[CString]) -> RunguardError {
  let program = into_c_string(&opts.command);
  let mut argv = vec![program.clone()];
  argv.extend(opts.arguments.iter().map(|arg| into_c_string(arg)));

  match execvpe(&program, &argv, env) {
    Err(err) => RunguardError::exec(format!("cannot start `{}': {}", opts.command, err.desc())),
    Ok(never) => match never {},
  }
}

/// The child environment: only PATH survives unless preservation is on,
/// plus any user-supplied KEY=VALUE;KEY2=VALUE2 additions.
fn build_env(opts: &RunguardOptions) -> Vec<CString> {
  let mut entries: Vec<String> = vec![];
  if opts.preserve_env {
    entries.extend(env::vars().map(|(key, value)| format!("{}={}", key, value)));
  } else if let Ok(path) = env::var("PATH") {
    entries.push(format!("PATH={}", path));
  }
  for vars in &opts.env_vars {
    for token in vars.split(';').filter(|token| !token.is_empty()) {
      debug!("setting environment variable: {}", token);
      entries.push(token.to_string());
    }
  }
  entries.iter().map(|entry| into_c_string(entry)).collect()
}

/// setrlimit where hard limits may legitimately be unraisable: without
/// root we keep the system default and warn instead of failing.
fn setlim(
  resource: Resource,
  name: &str,
  soft: libc::rlim_t,
  hard: libc::rlim_t,
) -> Result<(), RunguardError> {
  match setrlimit(resource, soft, hard) {
    Ok(()) => Ok(()),
    Err(Errno::EPERM) => {
      warn!("no permission to set resource RLIMIT_{}", name);
      Ok(())
    }
    Err(err) => Err(RunguardError::sys(
      format!("setting resource RLIMIT_{}", name),
      err,
    )),
  }
}

fn apply_rlimits(opts: &RunguardOptions) -> Result<(), RunguardError> {
  if let Some(cputime) = opts.cputime {
    // The CPU-time limit only has second granularity, so round up; actual
    // use is measured more precisely through the cgroup. The kernel sends
    // SIGXCPU at the soft limit and SIGKILL at the hard limit, so keeping
    // them one second apart leaves a catchable signal.
    let limit = cputime.hard.ceil() as libc::rlim_t;
    debug!("setting hard CPU-time limit to {}(+1) seconds", limit);
    setlim(Resource::RLIMIT_CPU, "CPU", limit, limit + 1)?;
  }

  // Memory is enforced by the cgroup, so the address space and data
  // segment stay unlimited, as does the stack.
  setlim(Resource::RLIMIT_AS, "AS", libc::RLIM_INFINITY, libc::RLIM_INFINITY)?;
  setlim(Resource::RLIMIT_DATA, "DATA", libc::RLIM_INFINITY, libc::RLIM_INFINITY)?;
  setlim(Resource::RLIMIT_STACK, "STACK", libc::RLIM_INFINITY, libc::RLIM_INFINITY)?;

  if let Some(bytes) = opts.file_bytes {
    debug!("setting filesize limit to {} bytes", bytes);
    setlim(Resource::RLIMIT_FSIZE, "FSIZE", bytes, bytes)?;
  }

  if let Some(nproc) = opts.nproc {
    debug!("setting process limit to {}", nproc);
    setlim(Resource::RLIMIT_NPROC, "NPROC", nproc, nproc)?;
  }

  if opts.no_coredump {
    debug!("disabling core dumps");
    setrlimit(Resource::RLIMIT_CORE, 0, 0)
      .map_err(|err| RunguardError::sys("disabling core dumps", err))?;
  }

  Ok(())
}

/// Change root and working directory. The resolved root must stay within
/// the configured chroot prefix; anything else is an attempted escape.
fn enter_root(opts: &RunguardOptions) -> Result<(), RunguardError> {
  let Some(root_dir) = &opts.root_dir else {
    return Ok(());
  };

  chdir(root_dir.as_path())
    .map_err(|err| RunguardError::sys(format!("cannot chdir to `{}'", root_dir.display()), err))?;
  let cwd = getcwd().map_err(|err| RunguardError::sys("cannot get directory", err))?;

  let prefix = fs::canonicalize(chroot_prefix()).map_err(|err| {
    RunguardError::restrict(format!(
      "cannot canonicalize path '{}': {}",
      chroot_prefix(),
      err
    ))
  })?;
  if !cwd.starts_with(&prefix) {
    return Err(RunguardError::restrict(format!(
      "invalid root: must be within `{}'",
      prefix.display()
    )));
  }

  chroot(".").map_err(|err| {
    RunguardError::sys(format!("cannot change root to `{}'", cwd.display()), err)
  })?;
  chdir("/").map_err(|err| RunguardError::sys("cannot chdir to `/' in chroot", err))?;
  if let Some(dir) = &opts.root_chdir {
    chdir(dir.as_path()).map_err(|err| {
      RunguardError::sys(format!("cannot chdir to `{}' in chroot", dir.display()), err)
    })?;
  }

  Ok(())
}

/// Drop group and user privileges. Afterwards neither the effective nor
/// the real uid may be root.
fn drop_privileges(opts: &RunguardOptions) -> Result<(), RunguardError> {
  if let Some(gid) = opts.run_gid {
    setgid(gid)
      .map_err(|err| RunguardError::sys(format!("cannot set group ID to `{}'", gid), err))?;
    setgroups(&[]).map_err(|err| RunguardError::sys("cannot clear auxiliary groups", err))?;
    debug!("using group ID `{}'", gid);
  }

  match &opts.run_user {
    Some(user) => {
      setuid(user.uid)
        .map_err(|err| RunguardError::sys(format!("cannot set user ID to `{}'", user.uid), err))?;
      debug!("using user ID `{}' for command", user.uid);
    }
    None => {
      // Permanently reset the effective uid to the real uid, so the
      // command cannot regain the watchdog's privileges. The command then
      // runs as the same user as the watchdog and can manipulate it, e.g.
      // with SIGSTOP/SIGCONT.
      setuid(getuid()).map_err(|err| RunguardError::sys("cannot reset real user ID", err))?;
      debug!("reset user ID to `{}' for command", getuid());
    }
  }

  if geteuid().is_root() || getuid().is_root() {
    return Err(RunguardError::restrict(
      "root privileges not dropped, refusing to run the command as root",
    ));
  }

  Ok(())
}
