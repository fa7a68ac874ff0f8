use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::RunguardError;

/// Sink for the machine-readable metadata record.
///
/// Lines have the form `key: value`, UTF-8, no escaping. A write error
/// disables the sink permanently; the failed write is the last one reported.
pub struct MetaFile {
  file: Option<File>,
  path: PathBuf,
}

impl MetaFile {
  /// Open the metadata file for writing, truncating any previous record.
  /// With no path configured the sink accepts and discards everything.
  pub fn open(path: Option<&Path>) -> Result<Self, RunguardError> {
    match path {
      Some(path) => {
        let file = File::create(path).map_err(|err| {
          RunguardError::meta(format!("cannot open `{}': {}", path.display(), err))
        })?;
        Ok(MetaFile {
          file: Some(file),
          path: path.to_path_buf(),
        })
      }
      None => Ok(MetaFile {
        file: None,
        path: PathBuf::new(),
      }),
    }
  }

  pub fn is_active(&self) -> bool {
    self.file.is_some()
  }

  /// Append one `key: value` line.
  pub fn write_pair<V: Display>(&mut self, key: &str, value: V) -> Result<(), RunguardError> {
    let Some(file) = self.file.as_mut() else {
      return Ok(());
    };
    if let Err(err) = writeln!(file, "{}: {}", key, value) {
      self.file = None;
      return Err(RunguardError::meta(format!(
        "cannot write to file `{}': {}",
        self.path.display(),
        err
      )));
    }
    Ok(())
  }

  /// Best-effort write used on the fatal path, where further errors
  /// must not cascade.
  pub fn write_quiet<V: Display>(&mut self, key: &str, value: V) {
    let _ = self.write_pair(key, value);
  }

  pub fn close(&mut self) -> Result<(), RunguardError> {
    if let Some(file) = self.file.take() {
      if let Err(err) = file.sync_all() {
        return Err(RunguardError::meta(format!(
          "cannot close file `{}': {}",
          self.path.display(),
          err
        )));
      }
    }
    Ok(())
  }

  pub fn close_quiet(&mut self) {
    let _ = self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  #[test]
  fn writes_key_value_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta");
    let mut meta = MetaFile::open(Some(&path)).unwrap();
    meta.write_pair("exitcode", 0).unwrap();
    meta.write_pair("wall-time", format!("{:.3}", 1.5)).unwrap();
    meta.close().unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text, "exitcode: 0\nwall-time: 1.500\n");
  }

  #[test]
  fn inert_without_path() {
    let mut meta = MetaFile::open(None).unwrap();
    assert!(!meta.is_active());
    meta.write_pair("exitcode", 1).unwrap();
    meta.close().unwrap();
  }

  #[test]
  fn write_error_disables_sink() {
    // /dev/full accepts the open but fails every write with ENOSPC.
    let path = Path::new("/dev/full");
    let mut meta = MetaFile::open(Some(path)).unwrap();
    assert!(meta.write_pair("exitcode", 0).is_err());
    assert!(!meta.is_active());
    // Latched: further writes are discarded, not errors.
    meta.write_pair("signal", 9).unwrap();
  }

  #[test]
  fn truncates_previous_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta");
    fs::write(&path, "stale: contents\n").unwrap();
    let mut meta = MetaFile::open(Some(&path)).unwrap();
    meta.write_pair("exitcode", 0).unwrap();
    meta.close().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "exitcode: 0\n");
  }
}
