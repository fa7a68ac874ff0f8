use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

use crate::error::RunguardError;
use crate::report::HARD_TIMELIMIT;

/// Grace period between SIGTERM and SIGKILL, and after the final kill.
const KILL_DELAY: libc::timespec = libc::timespec {
  tv_sec: 0,
  tv_nsec: 100_000_000,
};

// State shared with the signal handlers. Handlers only set flags and send
// kills; the supervisor loop interprets the flags.
static RECEIVED_SIGCHLD: AtomicBool = AtomicBool::new(false);
static RECEIVED_SIGNAL: AtomicI32 = AtomicI32::new(-1);
static ERROR_IN_HANDLER: AtomicBool = AtomicBool::new(false);
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);
static RUNPIPE_PID: AtomicI32 = AtomicI32::new(-1);
static WALL_LIMIT: AtomicU8 = AtomicU8::new(0);
static QUIET: AtomicBool = AtomicBool::new(false);

pub fn set_child_pid(pid: Pid) {
  CHILD_PID.store(pid.as_raw(), Ordering::SeqCst);
}

pub fn set_runpipe_pid(pid: i32) {
  RUNPIPE_PID.store(pid, Ordering::SeqCst);
}

pub fn set_quiet(quiet: bool) {
  QUIET.store(quiet, Ordering::SeqCst);
}

pub fn received_sigchld() -> bool {
  RECEIVED_SIGCHLD.load(Ordering::SeqCst)
}

/// The terminating signal observed by `terminate`, if any.
pub fn received_signal() -> Option<i32> {
  match RECEIVED_SIGNAL.load(Ordering::SeqCst) {
    -1 => None,
    sig => Some(sig),
  }
}

pub fn error_in_handler() -> bool {
  ERROR_IN_HANDLER.load(Ordering::SeqCst)
}

/// Wall-clock limit bits set so far (the handler contributes the hard bit).
pub fn wall_limit_flags() -> u8 {
  WALL_LIMIT.load(Ordering::SeqCst)
}

extern "C" fn child_handler(_sig: libc::c_int) {
  RECEIVED_SIGCHLD.store(true, Ordering::SeqCst);
}

// Only async-signal-safe calls from here on: raw write, kill, nanosleep,
// signal disposition resets. No formatted I/O, no allocation, no logging.
fn write_raw(msg: &[u8]) {
  if !QUIET.load(Ordering::SeqCst) {
    unsafe {
      libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    }
  }
}

fn kill_delay() {
  unsafe {
    libc::nanosleep(&KILL_DELAY, std::ptr::null_mut());
  }
}

/// One-shot handler for SIGTERM and SIGALRM: record what happened, then
/// take the whole child process group down, first politely, then hard.
extern "C" fn terminate(sig: libc::c_int) {
  unsafe {
    libc::signal(libc::SIGTERM, libc::SIG_DFL);
    libc::signal(libc::SIGALRM, libc::SIG_DFL);
  }

  if sig == libc::SIGALRM {
    let runpipe = RUNPIPE_PID.load(Ordering::SeqCst);
    if runpipe > 0 {
      write_raw(b"runguard: warning: sending SIGUSR1 to runpipe\n");
      unsafe {
        libc::kill(runpipe, libc::SIGUSR1);
      }
    }
    WALL_LIMIT.fetch_or(HARD_TIMELIMIT, Ordering::SeqCst);
    write_raw(b"runguard: warning: timelimit exceeded (hard wall time): aborting command\n");
  } else {
    write_raw(b"runguard: warning: received signal: aborting command\n");
  }

  RECEIVED_SIGNAL.store(sig, Ordering::SeqCst);

  let child = CHILD_PID.load(Ordering::SeqCst);
  if unsafe { libc::kill(-child, libc::SIGTERM) } != 0 && Errno::last() != Errno::ESRCH {
    write_raw(b"runguard: warning: error sending SIGTERM to command\n");
    ERROR_IN_HANDLER.store(true, Ordering::SeqCst);
    return;
  }
  kill_delay();

  if unsafe { libc::kill(-child, libc::SIGKILL) } != 0 && Errno::last() != Errno::ESRCH {
    write_raw(b"runguard: warning: error sending SIGKILL to command\n");
    ERROR_IN_HANDLER.store(true, Ordering::SeqCst);
    return;
  }
  // Wait another while to make sure the group is gone by now.
  kill_delay();
}

/// SIGCHLD only sets a flag; it is detected when pselect swaps the mask.
pub fn install_sigchld_handler() -> Result<(), RunguardError> {
  let action = SigAction::new(
    SigHandler::Handler(child_handler),
    SaFlags::empty(),
    SigSet::empty(),
  );
  unsafe { sigaction(Signal::SIGCHLD, &action) }
    .map_err(|err| RunguardError::sys("installing signal handler", err))?;
  Ok(())
}

/// Steady-state mask: everything open except SIGCHLD.
pub fn block_sigchld() -> Result<(), RunguardError> {
  let mut mask = SigSet::empty();
  mask.add(Signal::SIGCHLD);
  sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
    .map_err(|err| RunguardError::sys("unmasking signals", err))
}

/// Arm `terminate` for SIGTERM, and for SIGALRM when a wall-clock limit is
/// in force. The handler is one-shot; both signals are masked while it runs.
pub fn install_terminate_handler(with_alarm: bool) -> Result<(), RunguardError> {
  let mut mask = SigSet::empty();
  mask.add(Signal::SIGALRM);
  mask.add(Signal::SIGTERM);
  let action = SigAction::new(
    SigHandler::Handler(terminate),
    SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
    mask,
  );
  unsafe { sigaction(Signal::SIGTERM, &action) }
    .map_err(|err| RunguardError::sys("installing signal handler", err))?;
  if with_alarm {
    unsafe { sigaction(Signal::SIGALRM, &action) }
      .map_err(|err| RunguardError::sys("installing signal handler", err))?;
  }
  Ok(())
}

/// Single-shot real-time timer delivering SIGALRM after the hard wall limit.
pub fn arm_wall_timer(hard_seconds: f64) -> Result<(), RunguardError> {
  set_itimer(hard_seconds).map_err(|err| RunguardError::sys("setting timer", err))
}

/// Disarm after reap so slow cleanup is not mistaken for a timeout.
pub fn disarm_wall_timer() -> Result<(), RunguardError> {
  set_itimer(0.0).map_err(|err| RunguardError::sys("disarming timer", err))
}

fn set_itimer(seconds: f64) -> Result<(), Errno> {
  let timer = libc::itimerval {
    it_interval: libc::timeval {
      tv_sec: 0,
      tv_usec: 0,
    },
    it_value: libc::timeval {
      tv_sec: seconds as libc::time_t,
      tv_usec: (seconds.fract() * 1e6) as libc::suseconds_t,
    },
  };
  let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
  if ret != 0 {
    return Err(Errno::last());
  }
  Ok(())
}

/// Fatal-path cleanup: make sure no child survives the supervisor.
pub fn kill_child_group() {
  let child = CHILD_PID.load(Ordering::SeqCst);
  if child <= 0 {
    return;
  }
  if unsafe { libc::kill(-child, libc::SIGKILL) } != 0 && Errno::last() != Errno::ESRCH {
    write_raw(b"runguard: unable to send SIGKILL to children while terminating\n");
    return;
  }
  kill_delay();
}

/// Block the termination signals; used once the supervisor is exiting anyway.
pub fn block_terminate_signals() {
  let mut mask = SigSet::empty();
  mask.add(Signal::SIGALRM);
  mask.add(Signal::SIGTERM);
  let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None);
}
