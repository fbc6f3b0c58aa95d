// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Narrow accessors for the host's process and open-file tables.
//!
//! The report engine never reaches into host state directly. Every live
//! object it touches is a reference-counted handle: cloning a handle acquires
//! a reference and dropping it releases that reference, so every return path
//! (including an early stop on sink overflow) gives back what it took.

use std::ops::ControlFlow;

use crate::errors::{Error, PathError};

pub type Pid = i32;

/// Raw identity of a host object. Kernel pointers fit in the low 64 bits; the
/// procfs host packs `(st_dev, st_ino)`.
pub type RawHandle = u128;

/// Opaque identity of a PID namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NsId(pub u64);

impl NsId {
    pub fn raw_handle(self) -> RawHandle {
        RawHandle::from(self.0)
    }
}

/// Process ids as seen from inside a namespace. Ids that are not visible
/// from that namespace are `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerIds {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
}

/// Fields read from a process under its own short-lived lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFields {
    pub comm: String,
    pub state: char,
}

pub trait Host {
    type Process: Process;

    /// Reads the pid-namespace-for-children of the root task.
    fn root_pid_namespace(&self) -> Result<NsId, Error>;

    /// Walks every live process in table order.
    ///
    /// The walk runs in a read-side critical section: `f` must not block or
    /// sleep. Returning `ControlFlow::Break` ends the walk early.
    fn for_each_process<F>(&self, f: F)
    where
        F: FnMut(&Self::Process) -> ControlFlow<()>;
}

/// A counted process handle. `clone` acquires a reference, `drop` releases it.
pub trait Process: Clone {
    type Files: FileTable;

    fn pid(&self) -> Pid;

    /// Takes the task lock just long enough to read the namespace proxy.
    /// `None` once the proxy is gone (zombie or exiting task).
    fn pid_ns_for_children(&self) -> Option<NsId>;

    /// `None` when the process was torn down after it was collected.
    fn fields(&self) -> Option<TaskFields>;

    fn translate(&self, ns: NsId) -> ContainerIds;

    /// Acquires the process's open-file table, if it still has one.
    fn files(&self) -> Option<Self::Files>;
}

pub trait FileTable {
    type File: OpenFile;
    type Locked<'a>: LockedFileTable<File = Self::File>
    where
        Self: 'a;

    /// Takes the table lock. It is released when the guard is dropped.
    fn lock(&self) -> Self::Locked<'_>;
}

/// View of an open-file table while its lock is held.
pub trait LockedFileTable {
    type File: OpenFile;

    fn max_fds(&self) -> usize;

    /// Acquires a reference to the file in slot `fd`, if the slot is live.
    fn get_file(&self, fd: usize) -> Option<Self::File>;

    fn close_on_exec(&self, fd: usize) -> bool;
}

/// A counted open-file reference. Dropping it releases the reference.
pub trait OpenFile {
    /// `None` if the identity of the underlying object cannot be read.
    fn handle(&self) -> Option<RawHandle>;

    fn offset(&self) -> i64;

    fn flags(&self) -> u32;

    /// May block or take other locks: never call it with a table lock held.
    fn path(&self) -> Result<String, PathError>;
}
