use std::os::unix::prelude::RawFd;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, splice, FcntlArg, OFlag, SpliceFFlags};
use nix::sys::select::FdSet;
use nix::unistd::{close, read, write};

use crate::error::RunguardError;

const BUF_SIZE: usize = 4 * 1024;

/// Copies child stdout/stderr from the pipes to their sinks while counting
/// bytes and enforcing the stream cap.
///
/// Counter indices follow the child fd numbers: 0 is stdin (always zero
/// here), 1 and 2 are the pumped streams. The cap is sticky: once
/// `bytes_passed` reaches it, further data is still read off the pipe so
/// the child never blocks, but it is discarded.
pub struct StreamPump {
  /// Pipe read ends for child fd 1 and 2; -1 once EOF was seen.
  source: [RawFd; 2],
  /// Destination fds: a redirect file or the parent's own fd 1/2.
  sink: [RawFd; 2],
  bytes_read: [u64; 3],
  bytes_passed: [u64; 3],
  cap: Option<u64>,
  use_splice: bool,
}

impl StreamPump {
  pub fn new(source: [RawFd; 2], sink: [RawFd; 2], cap: Option<u64>) -> Self {
    StreamPump {
      source,
      sink,
      bytes_read: [0; 3],
      bytes_passed: [0; 3],
      cap,
      use_splice: true,
    }
  }

  /// Register the still-open pipe ends for the select call.
  pub fn fill_fds(&self, set: &mut FdSet) {
    for fd in self.source {
      if fd >= 0 {
        set.insert(fd);
      }
    }
  }

  /// Move data for every descriptor the select call marked ready.
  pub fn pump(&mut self, ready: &FdSet) -> Result<(), RunguardError> {
    for i in 0..2 {
      if self.source[i] >= 0 && ready.contains(self.source[i]) {
        self.pump_one(i)?;
      }
    }
    Ok(())
  }

  /// One transfer attempt on stream `i` (0 = child stdout, 1 = child stderr).
  fn pump_one(&mut self, i: usize) -> Result<(), RunguardError> {
    let idx = i + 1;
    let source = self.source[i];
    let mut buf = [0u8; BUF_SIZE];

    let nread = if self.cap == Some(self.bytes_passed[idx]) {
      // At the output limit: throw the data away, but still count how
      // much the child produced.
      match read(source, &mut buf) {
        Ok(n) => n,
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(()),
        Err(err) => return Err(RunguardError::sys(format!("copying data fd {}", idx), err)),
      }
    } else {
      let to_read = match self.cap {
        Some(cap) => (cap - self.bytes_passed[idx]).min(BUF_SIZE as u64) as usize,
        None => BUF_SIZE,
      };

      let n = if self.use_splice {
        match splice(
          source,
          None,
          self.sink[i],
          None,
          to_read,
          SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK,
        ) {
          Ok(n) => n,
          Err(Errno::EINVAL) => {
            // The sink does not support splice; fall back permanently.
            debug!("splice failed, switching to read/write");
            self.use_splice = false;
            return self.pump_one(i);
          }
          // The child already exited and closed the pipe.
          Err(Errno::EPIPE) => 0,
          Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(()),
          Err(err) => return Err(RunguardError::sys(format!("copying data fd {}", idx), err)),
        }
      } else {
        match read(source, &mut buf[..to_read]) {
          Ok(n) => {
            self.write_sink(i, &buf[..n])?;
            n
          }
          Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(()),
          Err(err) => return Err(RunguardError::sys(format!("copying data fd {}", idx), err)),
        }
      };

      if n > 0 {
        self.bytes_passed[idx] += n as u64;
        if self.cap == Some(self.bytes_passed[idx]) {
          debug!("child fd {} limit reached", idx);
        }
      }
      n
    };

    if nread == 0 {
      // EOF: close the pipe end and stop selecting on it.
      close(source)
        .map_err(|err| RunguardError::sys(format!("closing pipe for fd {}", idx), err))?;
      self.source[i] = -1;
      return Ok(());
    }
    self.bytes_read[idx] += nread as u64;
    Ok(())
  }

  fn write_sink(&self, i: usize, mut data: &[u8]) -> Result<(), RunguardError> {
    while !data.is_empty() {
      match write(self.sink[i], data) {
        Ok(n) => data = &data[n..],
        Err(Errno::EINTR) => continue,
        Err(err) => {
          return Err(RunguardError::sys(format!("copying data fd {}", i + 1), err));
        }
      }
    }
    Ok(())
  }

  /// Post-reap drain: switch the remaining pipe ends to non-blocking and
  /// pump until a full pass moves no bytes.
  pub fn drain(&mut self) -> Result<(), RunguardError> {
    for fd in self.source {
      if fd >= 0 {
        let flags = fcntl(fd, FcntlArg::F_GETFL)
          .map_err(|err| RunguardError::sys("fcntl, getting flags", err))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))
          .map_err(|err| RunguardError::sys("fcntl, setting flags", err))?;
      }
    }

    loop {
      let total = self.bytes_passed[1] + self.bytes_passed[2];
      for i in 0..2 {
        if self.source[i] >= 0 {
          self.pump_one(i)?;
        }
      }
      if self.bytes_passed[1] + self.bytes_passed[2] == total {
        return Ok(());
      }
    }
  }

  /// Close the sink descriptors once everything in flight is written out.
  pub fn close_sinks(&mut self) -> Result<(), RunguardError> {
    for (i, fd) in self.sink.into_iter().enumerate() {
      close(fd).map_err(|err| RunguardError::sys(format!("closing output fd {}", i + 1), err))?;
    }
    Ok(())
  }

  pub fn bytes_read(&self, idx: usize) -> u64 {
    self.bytes_read[idx]
  }

  pub fn bytes_passed(&self, idx: usize) -> u64 {
    self.bytes_passed[idx]
  }

  /// Which streams lost data to the cap: "", "stdout", "stderr" or
  /// "stdout,stderr".
  pub fn truncated_label(&self) -> String {
    let mut label = String::new();
    if self.bytes_passed[1] < self.bytes_read[1] {
      label.push_str("stdout");
    }
    if self.bytes_passed[2] < self.bytes_read[2] {
      if !label.is_empty() {
        label.push(',');
      }
      label.push_str("stderr");
    }
    label
  }
}
