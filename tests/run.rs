use std::fs;
use std::path::Path;
use std::process::Command;

use nix::unistd::{Uid, User};
use tempfile::tempdir;

const RUNGUARD: &str = env!("CARGO_BIN_EXE_runguard");

/// The run user the sandbox scenarios need, part of a judgehost setup.
const RUN_USER: &str = "domjudge-run-0";

/// The full sandbox needs root (for namespaces, cgroups and setuid) plus a
/// configured run user. Anywhere else the scenarios are skipped.
fn sandbox_available() -> bool {
  Uid::effective().is_root()
    && Path::new("/sys/fs/cgroup").exists()
    && User::from_name(RUN_USER).unwrap_or(None).is_some()
}

fn meta_line<'a>(meta: &'a str, key: &str) -> Option<&'a str> {
  meta
    .lines()
    .find_map(|line| line.strip_prefix(&format!("{}: ", key)))
}

#[test]
fn it_should_show_usage() {
  let output = Command::new(RUNGUARD).arg("--help").output().unwrap();
  assert!(output.status.success());
  let text = String::from_utf8_lossy(&output.stdout);
  assert!(text.contains("--walltime"));
  assert!(text.contains("--outmeta"));
}

#[test]
fn it_should_show_version() {
  let output = Command::new(RUNGUARD).arg("--version").output().unwrap();
  assert!(output.status.success());
  assert!(String::from_utf8_lossy(&output.stdout).contains("runguard"));
}

#[test]
fn it_should_require_a_command() {
  let output = Command::new(RUNGUARD).output().unwrap();
  assert!(!output.status.success());
}

#[test]
fn it_should_reject_bad_walltime() {
  let output = Command::new(RUNGUARD)
    .args(["-t", "abc", "/bin/true"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(255));
  assert!(String::from_utf8_lossy(&output.stderr).contains("invalid walltime"));
}

#[test]
fn it_should_reject_hard_limit_below_soft() {
  let output = Command::new(RUNGUARD)
    .args(["-C", "2:1", "/bin/true"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(255));
  assert!(String::from_utf8_lossy(&output.stderr).contains("hard limit is lower"));
}

#[test]
fn it_should_reject_unknown_user() {
  let output = Command::new(RUNGUARD)
    .args(["-u", "no-such-runguard-user", "/bin/true"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(255));
}

#[test]
fn it_should_reject_out_of_range_cpuset() {
  let output = Command::new(RUNGUARD)
    .args(["-P", "100000", "/bin/true"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(255));
  assert!(String::from_utf8_lossy(&output.stderr).contains("cpuset"));
}

#[test]
fn it_should_run_echo() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");
  let out_path = dir.path().join("stdout");

  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-M", meta_path.to_str().unwrap()])
    .args(["-o", out_path.to_str().unwrap()])
    .args(["/bin/echo", "hello"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(0));

  assert_eq!(fs::read_to_string(&out_path).unwrap(), "hello\n");
  let meta = fs::read_to_string(&meta_path).unwrap();
  assert_eq!(meta_line(&meta, "exitcode"), Some("0"));
  assert_eq!(meta_line(&meta, "time-used"), Some("cpu-time"));
  assert_eq!(meta_line(&meta, "time-result"), Some(""));
  assert_eq!(meta_line(&meta, "stdout-bytes"), Some("6"));
}

#[test]
fn it_should_kill_on_hard_walltime() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");

  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-t", "0.5:0.5"])
    .args(["-M", meta_path.to_str().unwrap()])
    .args(["/bin/sleep", "10"])
    .output()
    .unwrap();
  // SIGTERM if the command honoured it, SIGKILL if not.
  let code = output.status.code().unwrap();
  assert!(code == 128 + 15 || code == 128 + 9, "exit code {}", code);

  let meta = fs::read_to_string(&meta_path).unwrap();
  assert_eq!(meta_line(&meta, "time-used"), Some("wall-time"));
  assert_eq!(meta_line(&meta, "time-result"), Some("hard-timelimit"));
  let wall: f64 = meta_line(&meta, "wall-time").unwrap().parse().unwrap();
  assert!((wall - 0.5).abs() < 0.2, "wall-time {}", wall);
}

#[test]
fn it_should_kill_on_hard_cputime() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");

  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-C", "1"])
    .args(["-M", meta_path.to_str().unwrap()])
    .args(["/bin/sh", "-c", "while : ; do : ; done"])
    .output()
    .unwrap();
  // SIGXCPU at the soft rlimit, SIGKILL if the hard one fired first.
  let code = output.status.code().unwrap();
  assert!(code == 128 + 24 || code == 128 + 9, "exit code {}", code);

  let meta = fs::read_to_string(&meta_path).unwrap();
  assert_eq!(meta_line(&meta, "time-used"), Some("cpu-time"));
  assert_eq!(meta_line(&meta, "time-result"), Some("hard-timelimit"));
  let cpu: f64 = meta_line(&meta, "cpu-time").unwrap().parse().unwrap();
  assert!(cpu >= 0.9, "cpu-time {}", cpu);
}

#[test]
fn it_should_oom_kill_on_memory_limit() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");

  // The shell buffers the command substitution, far past the 16 MB cgroup
  // limit, and is taken out by the kernel OOM killer.
  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-m", "16384"])
    .args(["-t", "10"])
    .args(["-M", meta_path.to_str().unwrap()])
    .args(["/bin/sh", "-c", "x=$(head -c 50000000 /dev/zero | tr '\\0' a)"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(128 + 9));

  let meta = fs::read_to_string(&meta_path).unwrap();
  let memory: u64 = meta_line(&meta, "memory-bytes").unwrap().parse().unwrap();
  assert!(memory > 8 * 1024 * 1024, "memory-bytes {}", memory);
  assert!(memory <= 32 * 1024 * 1024, "memory-bytes {}", memory);
}

#[test]
fn it_should_cap_created_files() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");
  // The run user must be able to write the target, so it cannot live in
  // the root-owned tempdir.
  let file_path = format!("/tmp/runguard-fsize-{}", std::process::id());

  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-f", "1"])
    .args(["-M", meta_path.to_str().unwrap()])
    .args([
      "/bin/sh",
      "-c",
      &format!("exec head -c 2048 /dev/zero > {}", file_path),
    ])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(128 + 25));

  let written = fs::metadata(&file_path).unwrap().len();
  let _ = fs::remove_file(&file_path);
  assert!(written <= 1024, "file size {}", written);
}

#[test]
fn it_should_truncate_streams() {
  if !sandbox_available() {
    eprintln!("skipping: sandbox scenarios need root and a run user");
    return;
  }

  let dir = tempdir().unwrap();
  let meta_path = dir.path().join("meta");
  let out_path = dir.path().join("stdout");

  let output = Command::new(RUNGUARD)
    .args(["-u", RUN_USER])
    .args(["-s", "1"])
    .args(["-M", meta_path.to_str().unwrap()])
    .args(["-o", out_path.to_str().unwrap()])
    .args(["/bin/sh", "-c", "head -c 2048 /dev/zero"])
    .output()
    .unwrap();
  assert_eq!(output.status.code(), Some(0));

  assert_eq!(fs::metadata(&out_path).unwrap().len(), 1024);
  let meta = fs::read_to_string(&meta_path).unwrap();
  assert_eq!(meta_line(&meta, "stdout-bytes"), Some("2048"));
  assert_eq!(meta_line(&meta, "output-truncated"), Some("stdout"));
}
