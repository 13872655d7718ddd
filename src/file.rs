//! Re-openable handles to mapped binaries.
//!
//! A mapping discovered through procfs may outlive its path: files get
//! deleted, containers exit, mounts disappear. A [`SealedFile`] records
//! every way we know to open the binary again later; [`SealedFile::unseal`]
//! tries them in order and hands back an open file. The inode and mtime
//! check on the procfs-root variant is best-effort hardening against the
//! path being reused for a different file between discovery and analysis,
//! not a guarantee.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::Pid;

#[derive(Debug, Error)]
pub enum UnsealError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("mismatched file {path}: expected inode {expected_inode} mtime {expected_mtime:?}, found inode {found_inode} mtime {found_mtime:?}")]
    Modified {
        path: PathBuf,
        expected_inode: u64,
        expected_mtime: SystemTime,
        found_inode: u64,
        found_mtime: SystemTime,
    },
    #[error("failed to dump vdso of process {pid}: {source}")]
    VdsoDump {
        pid: Pid,
        #[source]
        source: io::Error,
    },
    #[error("no file handles")]
    NoHandles,
    #[error("every handle failed: {0}")]
    Exhausted(String),
}

/// One way to reopen a binary later, or a fallback chain of them.
#[derive(Debug, Clone)]
pub enum SealedFile {
    /// Plain filesystem path.
    Path(PathBuf),
    /// The mapping's entry under `/proc/<pid>/map_files`. Survives deletion
    /// of the original path while the process lives.
    MapFiles { pid: Pid, begin: u64, end: u64 },
    /// Path resolved through `/proc/<pid>/root`, verified against the inode
    /// and mtime captured at discovery time.
    ProcRoot {
        pid: Pid,
        path: PathBuf,
        inode: u64,
        mtime: SystemTime,
    },
    /// The vdso pseudo-mapping; reopened by dumping the process memory it
    /// occupies.
    Vdso { pid: Pid, begin: u64, end: u64 },
    /// Try each handle in order, first success wins.
    Multi(Vec<SealedFile>),
}

impl SealedFile {
    pub fn unseal(&self) -> Result<File, UnsealError> {
        match self {
            SealedFile::Path(path) => open(path.clone()),
            SealedFile::MapFiles { pid, begin, end } => {
                open(PathBuf::from(format!("/proc/{pid}/map_files/{begin:x}-{end:x}")))
            }
            SealedFile::ProcRoot {
                pid,
                path,
                inode,
                mtime,
            } => {
                let full = PathBuf::from(format!("/proc/{pid}/root{}", path.display()));
                let file = open(full.clone())?;
                let metadata = file.metadata().map_err(|source| UnsealError::Open {
                    path: full.clone(),
                    source,
                })?;
                let found_mtime = UNIX_EPOCH
                    + Duration::new(metadata.mtime() as u64, metadata.mtime_nsec() as u32);
                if metadata.ino() != *inode || found_mtime != *mtime {
                    return Err(UnsealError::Modified {
                        path: full,
                        expected_inode: *inode,
                        expected_mtime: *mtime,
                        found_inode: metadata.ino(),
                        found_mtime,
                    });
                }
                Ok(file)
            }
            SealedFile::Vdso { pid, begin, end } => dump_vdso(*pid, *begin, *end),
            SealedFile::Multi(handles) => {
                if handles.is_empty() {
                    return Err(UnsealError::NoHandles);
                }
                let mut errors = Vec::with_capacity(handles.len());
                for handle in handles {
                    match handle.unseal() {
                        Ok(file) => return Ok(file),
                        Err(err) => {
                            debug!("handle {} failed to unseal: {}", handle.id(), err);
                            errors.push(err.to_string());
                        }
                    }
                }
                Err(UnsealError::Exhausted(errors.join("; ")))
            }
        }
    }

    /// Stable identifier used to deduplicate handles pointing at the same
    /// way of reopening the same file.
    pub fn id(&self) -> String {
        match self {
            SealedFile::Path(path) => format!("path {}", path.display()),
            SealedFile::MapFiles { pid, begin, end } => {
                format!("map_files {pid} {begin:x}-{end:x}")
            }
            SealedFile::ProcRoot {
                pid, path, inode, ..
            } => format!("procroot {pid} {} inode {inode}", path.display()),
            SealedFile::Vdso { pid, .. } => format!("vdso {pid}"),
            SealedFile::Multi(handles) => {
                let mut ids: Vec<String> = handles.iter().map(|h| h.id()).collect();
                ids.sort_unstable();
                format!("multihandle {{{}}}", ids.join(";"))
            }
        }
    }
}

fn open(path: PathBuf) -> Result<File, UnsealError> {
    File::open(&path).map_err(|source| UnsealError::Open { path, source })
}

/// The vdso has no backing file; copy it out of the process's memory into a
/// scratch file the object parser can read.
fn dump_vdso(pid: Pid, begin: u64, end: u64) -> Result<File, UnsealError> {
    let wrap = |source: io::Error| UnsealError::VdsoDump { pid, source };

    let mem = File::open(format!("/proc/{pid}/mem")).map_err(wrap)?;
    let mut buf = vec![0; (end - begin) as usize];
    mem.read_exact_at(&mut buf, begin).map_err(wrap)?;

    let dumped = PathBuf::from(format!("/tmp/switchboard-vdso-{pid}"));
    fs::write(&dumped, &buf).map_err(wrap)?;
    File::open(&dumped).map_err(wrap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_path_unseal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), b"payload").unwrap();

        let sealed = SealedFile::Path(file.path().to_path_buf());
        let mut opened = sealed.unseal().unwrap();
        let mut content = String::new();
        opened.read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn test_missing_path_fails() {
        let sealed = SealedFile::Path(PathBuf::from("/does/not/exist"));
        assert!(matches!(sealed.unseal(), Err(UnsealError::Open { .. })));
    }

    #[test]
    fn test_multi_falls_back_in_order() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), b"fallback").unwrap();

        let sealed = SealedFile::Multi(vec![
            SealedFile::Path(PathBuf::from("/does/not/exist")),
            SealedFile::Path(file.path().to_path_buf()),
        ]);
        let mut opened = sealed.unseal().unwrap();
        let mut content = String::new();
        opened.read_to_string(&mut content).unwrap();
        assert_eq!(content, "fallback");
    }

    #[test]
    fn test_multi_with_no_handles() {
        assert!(matches!(
            SealedFile::Multi(Vec::new()).unseal(),
            Err(UnsealError::NoHandles)
        ));
    }

    #[test]
    fn test_multi_reports_every_failure() {
        let sealed = SealedFile::Multi(vec![
            SealedFile::Path(PathBuf::from("/missing/one")),
            SealedFile::Path(PathBuf::from("/missing/two")),
        ]);
        let Err(UnsealError::Exhausted(message)) = sealed.unseal() else {
            panic!("expected exhausted error");
        };
        assert!(message.contains("/missing/one"));
        assert!(message.contains("/missing/two"));
    }

    #[test]
    fn test_proc_root_detects_replacement() {
        // Use our own procfs root so the path resolves, but claim an inode
        // from a different file.
        let file = tempfile::NamedTempFile::new().unwrap();
        let metadata = fs::metadata(file.path()).unwrap();

        let pid = std::process::id() as Pid;
        let sealed = SealedFile::ProcRoot {
            pid,
            path: file.path().to_path_buf(),
            inode: metadata.ino() + 1,
            mtime: UNIX_EPOCH,
        };
        assert!(matches!(sealed.unseal(), Err(UnsealError::Modified { .. })));

        let mtime =
            UNIX_EPOCH + Duration::new(metadata.mtime() as u64, metadata.mtime_nsec() as u32);
        let sealed = SealedFile::ProcRoot {
            pid,
            path: file.path().to_path_buf(),
            inode: metadata.ino(),
            mtime,
        };
        assert!(sealed.unseal().is_ok());
    }

    #[test]
    fn test_ids_are_stable_and_distinct() {
        let a = SealedFile::Path(PathBuf::from("/bin/true"));
        let b = SealedFile::MapFiles {
            pid: 1,
            begin: 0x1000,
            end: 0x2000,
        };
        assert_ne!(a.id(), b.id());

        let multi_ab = SealedFile::Multi(vec![a.clone(), b.clone()]);
        let multi_ba = SealedFile::Multi(vec![b, a]);
        // Order inside a multi-handle does not change its identity.
        assert_eq!(multi_ab.id(), multi_ba.id());
    }
}
