// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! [`Host`] implementation backed by the live `/proc` filesystem.

pub mod fd;
pub mod status;

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{trace, warn};
use nix::fcntl::{AtFlags, OFlag, openat};
use nix::sys::stat::{FileStat, Mode, fstatat};

use crate::errors::Error;
use crate::host::{ContainerIds, Host, NsId, Pid, Process, TaskFields};
use crate::procfs::fd::ProcfsFiles;
use crate::procfs::status::Status;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }

        if env::var("NSFD_CONTAINERIZED").is_ok() && Path::new("/host").exists() {
            return "/host/proc".into();
        }

        "/proc".into()
    })
}

fn open_dir(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)
}

/// Reads `name` relative to a pinned process directory.
fn read_at(dir: &File, name: &str) -> io::Result<String> {
    let fd = openat(dir, name, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    let mut content = String::new();
    File::from(fd).read_to_string(&mut content)?;
    Ok(content)
}

/// Stats the target of `name`, following symlinks.
fn stat_at(dir: &File, name: &str) -> nix::Result<FileStat> {
    fstatat(dir, name, AtFlags::empty())
}

fn pid_ns_for_children(dir: &File) -> nix::Result<NsId> {
    stat_at(dir, "ns/pid_for_children").map(|st| NsId(u64::from(st.st_ino)))
}

#[derive(Debug, Clone)]
pub struct ProcfsHost {
    root: PathBuf,
}

impl Default for ProcfsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsHost {
    pub fn new() -> Self {
        Self::with_root(root_path())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        ProcfsHost { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn process(&self, pid: Pid) -> io::Result<ProcfsProcess> {
        ProcfsProcess::open(&self.root, pid)
    }
}

impl Host for ProcfsHost {
    type Process = ProcfsProcess;

    fn root_pid_namespace(&self) -> Result<NsId, Error> {
        let init = open_dir(&self.root.join("1")).map_err(|source| Error::RootNamespace { source })?;
        pid_ns_for_children(&init).map_err(|e| Error::RootNamespace { source: e.into() })
    }

    fn for_each_process<F>(&self, mut f: F)
    where
        F: FnMut(&ProcfsProcess) -> ControlFlow<()>,
    {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to list processes in {}: {e}", self.root.display());
                return;
            }
        };

        let mut pids: Vec<Pid> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();

        for pid in pids {
            // Processes that exited since the listing are not part of the walk.
            let Ok(process) = ProcfsProcess::open(&self.root, pid) else {
                continue;
            };
            if f(&process).is_break() {
                break;
            }
        }
    }
}

/// A process pinned by an open descriptor on its `/proc/<pid>` directory.
///
/// Once the process is gone, reads through the pinned directory fail instead
/// of reaching whatever process reuses the pid.
#[derive(Clone, Debug)]
pub struct ProcfsProcess {
    pid: Pid,
    dir: Arc<File>,
    root: Arc<Path>,
}

impl ProcfsProcess {
    fn open(root: &Path, pid: Pid) -> io::Result<Self> {
        let path = root.join(pid.to_string());
        Ok(ProcfsProcess {
            pid,
            dir: Arc::new(open_dir(&path)?),
            root: Arc::from(root),
        })
    }

    fn status(&self) -> io::Result<Status> {
        let content = read_at(&self.dir, "status")?;
        Status::parse(&content)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed status"))
    }

    fn ids_in(&self, ns: NsId) -> io::Result<ContainerIds> {
        // A process that unshared its pid namespace is not itself a member of
        // the namespace its children go to.
        if u64::from(stat_at(&self.dir, "ns/pid")?.st_ino) != ns.0 {
            return Ok(ContainerIds::default());
        }

        let status = self.status()?;
        Ok(ContainerIds {
            pid: status.nspid.last().copied().unwrap_or(0),
            ppid: self.parent_pid_in(ns, status.ppid, status.nspid.len()),
            pgid: status.nspgid.last().copied().unwrap_or(0),
        })
    }

    /// The parent as seen from `ns`, or 0 when it lives outside of it.
    fn parent_pid_in(&self, ns: NsId, ppid: Pid, depth: usize) -> Pid {
        if ppid <= 0 {
            return 0;
        }

        let parent = self.root.join(ppid.to_string());
        match fs::metadata(parent.join("ns/pid")) {
            Ok(meta) if meta.ino() == ns.0 => {}
            _ => return 0,
        }
        let Ok(content) = fs::read_to_string(parent.join("status")) else {
            return 0;
        };
        Status::parse(&content)
            .filter(|status| status.nspid.len() == depth)
            .and_then(|status| status.nspid.last().copied())
            .unwrap_or(0)
    }
}

impl Process for ProcfsProcess {
    type Files = ProcfsFiles;

    fn pid(&self) -> Pid {
        self.pid
    }

    fn pid_ns_for_children(&self) -> Option<NsId> {
        pid_ns_for_children(&self.dir).ok()
    }

    fn fields(&self) -> Option<TaskFields> {
        let status = self.status().ok()?;
        Some(TaskFields {
            comm: status.name,
            state: status.state,
        })
    }

    fn translate(&self, ns: NsId) -> ContainerIds {
        self.ids_in(ns).unwrap_or_else(|e| {
            trace!("failed to translate pid {} into {ns:?}: {e}", self.pid);
            ContainerIds::default()
        })
    }

    fn files(&self) -> Option<ProcfsFiles> {
        ProcfsFiles::open(self.dir.clone())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn self_process() -> ProcfsProcess {
        let pid = Pid::try_from(std::process::id()).unwrap_or_else(|e| panic!("{e}"));
        ProcfsHost::with_root("/proc")
            .process(pid)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_self_fields() {
        let process = self_process();
        let fields = process.fields().unwrap_or_else(|| panic!("no fields"));
        assert!(!fields.comm.is_empty());
        // The main test thread is usually asleep waiting for the workers.
        assert!(fields.state.is_ascii_uppercase());
    }

    #[test]
    fn test_self_has_a_namespace() {
        let process = self_process();
        assert!(process.pid_ns_for_children().is_some());
    }

    #[test]
    fn test_translate_into_unrelated_namespace() {
        let process = self_process();
        assert_eq!(process.translate(NsId(0)), ContainerIds::default());
    }

    #[test]
    fn test_translate_into_own_namespace() {
        let process = self_process();
        let st = stat_at(&process.dir, "ns/pid").unwrap_or_else(|e| panic!("{e}"));
        let ns = NsId(u64::from(st.st_ino));
        let ids = process.translate(ns);
        let status = process.status().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(Some(&ids.pid), status.nspid.last());
        assert_ne!(ids.pid, 0);
    }

    #[test]
    fn test_walk_visits_self() {
        let me = Pid::try_from(std::process::id()).unwrap_or_else(|e| panic!("{e}"));
        let mut seen = false;
        let mut last = 0;
        ProcfsHost::with_root("/proc").for_each_process(|process| {
            assert!(process.pid() > last);
            last = process.pid();
            seen |= process.pid() == me;
            ControlFlow::Continue(())
        });
        assert!(seen);
    }

    #[test]
    fn test_walk_stops_early() {
        let mut visited = 0;
        ProcfsHost::with_root("/proc").for_each_process(|_| {
            visited += 1;
            ControlFlow::Break(())
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_missing_root_is_root_namespace_error() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let host = ProcfsHost::with_root(dir.path());
        assert!(matches!(
            host.root_pid_namespace(),
            Err(Error::RootNamespace { .. })
        ));
    }
}
