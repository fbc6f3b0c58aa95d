// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! The fd module exposes /proc/<pid>/fd and /proc/<pid>/fdinfo as an
//! open-file table.

use std::fs::File;
use std::sync::Arc;

use log::trace;
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{OFlag, openat, readlinkat};
use nix::sys::stat::Mode;

use crate::errors::PathError;
use crate::fds::O_CLOEXEC;
use crate::host::{FileTable, LockedFileTable, OpenFile, RawHandle};
use crate::procfs::{read_at, stat_at};

const PATH_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdInfo {
    pos: i64,
    flags: u32,
}

fn parse_fdinfo(content: &str) -> Option<FdInfo> {
    let mut pos = 0;
    let mut flags = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("pos:") => pos = parts.next()?.parse().ok()?,
            Some("flags:") => flags = Some(u32::from_str_radix(parts.next()?, 8).ok()?),
            _ => {}
        }
    }

    Some(FdInfo { pos, flags: flags? })
}

fn read_fdinfo(dir: &File, fd: usize) -> Option<FdInfo> {
    let content = read_at(dir, &format!("fdinfo/{fd}")).ok()?;
    parse_fdinfo(&content)
}

/// Identity of the object behind descriptor `fd`.
fn identity(dir: &File, fd: usize) -> Option<RawHandle> {
    let st = stat_at(dir, &format!("fd/{fd}")).ok()?;
    Some((RawHandle::from(st.st_dev) << 64) | RawHandle::from(st.st_ino))
}

fn path_error(errno: Errno) -> PathError {
    match errno {
        Errno::ENOENT | Errno::ESRCH => PathError::Gone,
        Errno::ENAMETOOLONG => PathError::NameTooLong,
        errno => PathError::Os(errno as i32),
    }
}

/// Lists the descriptor slots of a pinned process directory.
fn list_fds(dir: &File) -> nix::Result<Vec<usize>> {
    let fd_dir = openat(
        dir,
        "fd",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let mut listing = Dir::from_fd(fd_dir)?;
    let mut fds: Vec<usize> = listing
        .iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().ok()?.parse().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

/// Open-file table of a pinned process.
///
/// The slots are listed once, through the pinned directory, when the table
/// is opened. Each lock only re-checks a listed slot through its `fdinfo`.
#[derive(Debug)]
pub struct ProcfsFiles {
    dir: Arc<File>,
    fds: Vec<usize>,
}

impl ProcfsFiles {
    pub(super) fn open(dir: Arc<File>) -> Option<Self> {
        match list_fds(&dir) {
            Ok(fds) => Some(ProcfsFiles { dir, fds }),
            Err(e) => {
                trace!("failed to list open files: {e}");
                None
            }
        }
    }
}

impl FileTable for ProcfsFiles {
    type File = ProcfsFile;
    type Locked<'a> = FdListing<'a>;

    /// procfs has no table lock to take: the guard borrows the listing made
    /// when the table was opened.
    fn lock(&self) -> FdListing<'_> {
        FdListing {
            dir: &self.dir,
            fds: &self.fds,
        }
    }
}

#[derive(Debug)]
pub struct FdListing<'a> {
    dir: &'a Arc<File>,
    fds: &'a [usize],
}

impl LockedFileTable for FdListing<'_> {
    type File = ProcfsFile;

    fn max_fds(&self) -> usize {
        self.fds.last().map_or(0, |fd| fd + 1)
    }

    fn get_file(&self, fd: usize) -> Option<ProcfsFile> {
        self.fds.binary_search(&fd).ok()?;
        // Reads go through the pinned directory, so a descriptor listed under
        // a recycled pid is not found here.
        let info = read_fdinfo(self.dir, fd)?;
        Some(ProcfsFile {
            dir: Arc::clone(self.dir),
            fd,
            handle: identity(self.dir, fd),
            info,
        })
    }

    fn close_on_exec(&self, fd: usize) -> bool {
        read_fdinfo(self.dir, fd).is_some_and(|info| info.flags & O_CLOEXEC != 0)
    }
}

#[derive(Debug)]
pub struct ProcfsFile {
    dir: Arc<File>,
    fd: usize,
    handle: Option<RawHandle>,
    info: FdInfo,
}

impl OpenFile for ProcfsFile {
    /// Device and inode of the descriptor target. Descriptors share it when
    /// they refer to the same inode, so separate `open()`s of one file get
    /// the same token even though they have separate offsets.
    fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    fn offset(&self) -> i64 {
        self.info.pos
    }

    fn flags(&self) -> u32 {
        self.info.flags
    }

    fn path(&self) -> Result<String, PathError> {
        let target = readlinkat(&*self.dir, format!("fd/{}", self.fd).as_str())
            .map_err(path_error)?;
        let target = target.to_string_lossy().into_owned();

        // Pipes, sockets and anonymous inodes link to a pseudo name.
        if !target.starts_with('/') {
            return Err(PathError::NoPath);
        }
        if target.len() >= PATH_MAX {
            return Err(PathError::NameTooLong);
        }
        // The slot was reused for another object since it was read.
        if self.handle.is_some() && identity(&self.dir, self.fd) != self.handle {
            return Err(PathError::Gone);
        }
        Ok(target)
    }
}
