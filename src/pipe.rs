use std::os::unix::prelude::RawFd;
use std::path::Path;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, pipe};

use crate::error::RunguardError;

/// The pipe pairs connecting the child's stdout and stderr to the
/// supervisor. Stdin is passed through untouched.
///
/// Created before fork; after fork each end has exactly one owner. The
/// child dup's the write ends onto fd 1/2 and closes both originals, the
/// parent closes the write ends and keeps the read ends for the pump.
pub struct ChildStreams {
  /// (read end, write end) for child fd 1 and fd 2.
  pairs: [(RawFd, RawFd); 2],
}

impl ChildStreams {
  pub fn new() -> Result<Self, RunguardError> {
    let mut pairs = [(0, 0); 2];
    for (i, pair) in pairs.iter_mut().enumerate() {
      *pair = pipe()
        .map_err(|err| RunguardError::sys(format!("creating pipe for fd {}", i + 1), err))?;
    }
    Ok(ChildStreams { pairs })
  }

  /// Child side: wire the write ends onto stdout/stderr, then close every
  /// pipe fd so only fd 1 and 2 remain.
  pub fn attach_child(self) -> Result<(), RunguardError> {
    for (i, (read_fd, write_fd)) in self.pairs.into_iter().enumerate() {
      let target = (i + 1) as RawFd;
      dup2(write_fd, target)
        .map_err(|err| RunguardError::sys(format!("redirecting child fd {}", target), err))?;
      close(write_fd)
        .and_then(|_| close(read_fd))
        .map_err(|err| RunguardError::sys(format!("closing pipe for fd {}", target), err))?;
    }
    Ok(())
  }

  /// Parent side: close the write ends and hand the read ends to the pump.
  pub fn into_parent(self) -> Result<[RawFd; 2], RunguardError> {
    let mut read_ends = [0; 2];
    for (i, (read_fd, write_fd)) in self.pairs.into_iter().enumerate() {
      close(write_fd)
        .map_err(|err| RunguardError::sys(format!("closing pipe for fd {}", i + 1), err))?;
      read_ends[i] = read_fd;
    }
    Ok(read_ends)
  }
}

/// Open a redirect target with owner-only permissions, truncated, or fall
/// back to the parent's own descriptor.
pub fn open_sink(path: Option<&Path>, fallback: RawFd) -> Result<RawFd, RunguardError> {
  match path {
    Some(path) => open(
      path,
      OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
      Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|err| RunguardError::sys(format!("opening file '{}'", path.display()), err)),
    None => Ok(fallback),
  }
}
