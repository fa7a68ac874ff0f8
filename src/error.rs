use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::errno::Errno;

/// Exit status used when the supervisor itself fails.
pub const EXIT_INTERNAL_ERROR: i32 = 255;

pub enum RunguardError {
  Cli(String),
  Cgroup(String),
  Exec(String),
  Restrict(String),
  System(String),
  Meta(String),
  Nix(Errno),
  Fs(String),
  Logger(FlexiLoggerError),
}

/// Process outcome: the supervised command's exit code, or a supervisor failure.
pub enum RunguardExit {
  Code(i32),
  Err(RunguardError),
}

impl RunguardError {
  pub fn cli<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::Cli(msg.into())
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::Cgroup(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::Exec(msg.into())
  }

  pub fn restrict<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::Restrict(msg.into())
  }

  pub fn system<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::System(msg.into())
  }

  pub fn meta<MS: Into<String>>(msg: MS) -> RunguardError {
    RunguardError::Meta(msg.into())
  }

  /// Attach syscall context to an errno value.
  pub fn sys<MS: Into<String>>(msg: MS, errno: Errno) -> RunguardError {
    RunguardError::System(format!("{}: {}", msg.into(), errno))
  }
}

impl Debug for RunguardError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for RunguardError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      RunguardError::Cli(msg) => f.write_fmt(format_args!("invalid arguments: {}", msg)),
      RunguardError::Cgroup(msg) => f.write_fmt(format_args!("cgroup error: {}", msg)),
      RunguardError::Exec(msg) => f.write_fmt(format_args!("exec error: {}", msg)),
      RunguardError::Restrict(msg) => f.write_fmt(format_args!("restriction error: {}", msg)),
      RunguardError::System(msg) => f.write_fmt(format_args!("system error: {}", msg)),
      RunguardError::Meta(msg) => f.write_fmt(format_args!("metadata error: {}", msg)),
      RunguardError::Nix(errno) => f.write_fmt(format_args!("system error: {}", errno)),
      RunguardError::Fs(msg) => f.write_fmt(format_args!("file system error: {}", msg)),
      RunguardError::Logger(err) => f.write_fmt(format_args!("logger error: {}", err)),
    }
  }
}

impl From<Errno> for RunguardError {
  fn from(errno: Errno) -> Self {
    RunguardError::Nix(errno)
  }
}

impl From<std::io::Error> for RunguardError {
  fn from(err: std::io::Error) -> Self {
    RunguardError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for RunguardError {
  fn from(err: FlexiLoggerError) -> Self {
    RunguardError::Logger(err)
  }
}

impl Error for RunguardError {}

impl Termination for RunguardExit {
  fn report(self) -> ExitCode {
    match self {
      RunguardExit::Code(code) => ExitCode::from((code & 0xff) as u8),
      RunguardExit::Err(err) => {
        eprintln!("runguard: {}", err);
        eprintln!("Try `runguard --help' for more information.");
        ExitCode::from((EXIT_INTERNAL_ERROR & 0xff) as u8)
      }
    }
  }
}
