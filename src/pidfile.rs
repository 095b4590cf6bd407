//! PID-file management, the thin collaborator that the supervisor glue
//! still needs to invoke directly. Ported in spirit from the original
//! `pidfile.c`, minus its `flock`-based staleness detection, which the
//! supervisor's own single-instance-per-bind-address assumption makes
//! unnecessary here.

use std::fs;
use std::io;
use std::path::Path;

/// Write the current process id to `path`, truncating any existing file.
pub fn write_pid(path: &str) -> io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the pid file at `path`. Missing-file is not an error: `destroy`
/// may run this twice, idempotently, or after an operator has already
/// cleaned up by hand.
pub fn remove_pid(path: &str) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read back the pid written at `path`, if any. Used only by tests and by
/// operators inspecting a running instance; the core never reads its own
/// pid file back.
pub fn read_pid(path: &str) -> Option<u32> {
    let contents = fs::read_to_string(Path::new(path)).ok()?;
    contents.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_round_trips() {
        let tf = NamedTempFile::new().unwrap();
        let path = tf.path().to_str().unwrap();
        write_pid(path).unwrap();
        assert_eq!(read_pid(path), Some(std::process::id()));
    }

    #[test]
    fn remove_is_idempotent() {
        let tf = NamedTempFile::new().unwrap();
        let path = tf.path().to_str().unwrap().to_string();
        write_pid(&path).unwrap();
        remove_pid(&path).unwrap();
        remove_pid(&path).unwrap();
        assert!(read_pid(&path).is_none());
    }
}
