// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! In-memory host with instrumented reference counts and locks.
//!
//! Every reference the engine acquires and releases on a process, an
//! open-file table or an open file is counted, as are table locks and path
//! resolutions, so tests can check that a pass gives back everything it took
//! and never resolves a path with a table lock held.
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]
#![allow(clippy::cast_possible_wrap)]

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::errors::{Error, PathError};
use crate::host::{
    ContainerIds, FileTable, Host, LockedFileTable, NsId, OpenFile, Pid, Process, RawHandle,
    TaskFields,
};

type ResolveHook = Arc<dyn Fn() + Send + Sync>;
type WalkHook = Arc<dyn Fn(Pid) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn get(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Debug, Default)]
pub struct RefCounts {
    task_gets: AtomicUsize,
    task_puts: AtomicUsize,
    table_gets: AtomicUsize,
    table_puts: AtomicUsize,
    file_gets: AtomicUsize,
    file_puts: AtomicUsize,
    table_locks_held: AtomicUsize,
    paths_resolved: AtomicUsize,
    resolved_under_lock: AtomicUsize,
    root_queries: AtomicUsize,
}

impl RefCounts {
    pub fn task_gets(&self) -> usize {
        get(&self.task_gets)
    }

    pub fn task_puts(&self) -> usize {
        get(&self.task_puts)
    }

    pub fn file_gets(&self) -> usize {
        get(&self.file_gets)
    }

    pub fn file_puts(&self) -> usize {
        get(&self.file_puts)
    }

    /// Negative values mean a reference was released twice.
    pub fn outstanding_tasks(&self) -> isize {
        get(&self.task_gets) as isize - get(&self.task_puts) as isize
    }

    pub fn outstanding_tables(&self) -> isize {
        get(&self.table_gets) as isize - get(&self.table_puts) as isize
    }

    pub fn outstanding_files(&self) -> isize {
        get(&self.file_gets) as isize - get(&self.file_puts) as isize
    }

    pub fn table_locks_held(&self) -> usize {
        get(&self.table_locks_held)
    }

    pub fn paths_resolved(&self) -> usize {
        get(&self.paths_resolved)
    }

    pub fn resolved_under_lock(&self) -> usize {
        get(&self.resolved_under_lock)
    }

    pub fn root_queries(&self) -> usize {
        get(&self.root_queries)
    }

    /// True when every acquired reference has been released.
    pub fn balanced(&self) -> bool {
        self.outstanding_tasks() == 0
            && self.outstanding_tables() == 0
            && self.outstanding_files() == 0
    }
}

/// Description of a process to add with [`FakeHost::spawn`].
pub struct FakeTask {
    pid: Pid,
    comm: String,
    state: char,
    ns: Option<NsId>,
    ids: HashMap<NsId, ContainerIds>,
    has_files: bool,
}

impl FakeTask {
    /// A running process in the host's root namespace.
    pub fn new(pid: Pid, comm: &str) -> Self {
        FakeTask {
            pid,
            comm: comm.to_string(),
            state: 'R',
            ns: None,
            ids: HashMap::new(),
            has_files: true,
        }
    }

    /// Moves the process's children to `ns`, where the process itself is
    /// known as `pid` with parent `ppid` and process group `pgid`.
    pub fn namespace(mut self, ns: NsId, pid: Pid, ppid: Pid, pgid: Pid) -> Self {
        self.ns = Some(ns);
        self.ids.insert(ns, ContainerIds { pid, ppid, pgid });
        self
    }

    pub fn state(mut self, state: char) -> Self {
        self.state = state;
        self
    }

    pub fn without_files(mut self) -> Self {
        self.has_files = false;
        self
    }
}

/// Description of an open file to add with [`FakeHost::open`].
pub struct FakeFile {
    handle: Option<RawHandle>,
    offset: i64,
    flags: u32,
    path: Result<String, PathError>,
    on_resolve: Option<ResolveHook>,
}

impl FakeFile {
    /// A file without a path, like a pipe or a socket.
    pub fn new(handle: RawHandle) -> Self {
        FakeFile {
            handle: Some(handle),
            offset: 0,
            flags: 0,
            path: Err(PathError::NoPath),
            on_resolve: None,
        }
    }

    pub fn without_handle() -> Self {
        FakeFile {
            handle: None,
            ..FakeFile::new(0)
        }
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Ok(path.to_string());
        self
    }

    /// Makes every path resolution fail with `error`.
    pub fn path_error(mut self, error: PathError) -> Self {
        self.path = Err(error);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Runs `hook` each time the path is resolved without a table lock held,
    /// to mutate the host while the engine is between two slots.
    pub fn on_resolve(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_resolve = Some(Arc::new(hook));
        self
    }
}

struct FileObj {
    handle: Option<RawHandle>,
    offset: i64,
    flags: u32,
    path: Result<String, PathError>,
    on_resolve: Option<ResolveHook>,
}

#[derive(Default)]
struct Slots {
    files: Vec<Option<Arc<FileObj>>>,
    close_on_exec: Vec<bool>,
}

#[derive(Default)]
struct Table {
    slots: Mutex<Slots>,
}

struct Task {
    pid: Pid,
    comm: String,
    state: char,
    alive: AtomicBool,
    // Stands in for the task lock guarding the namespace proxy.
    ns: Mutex<Option<NsId>>,
    ids: HashMap<NsId, ContainerIds>,
    files: Mutex<Option<Arc<Table>>>,
}

struct State {
    root: Mutex<Option<NsId>>,
    tasks: RwLock<Vec<Arc<Task>>>,
    counts: Arc<RefCounts>,
    walk_hook: Mutex<Option<WalkHook>>,
}

/// Cloning a `FakeHost` shares the same host state.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<State>,
}

impl FakeHost {
    pub fn new(root: NsId) -> Self {
        FakeHost {
            state: Arc::new(State {
                root: Mutex::new(Some(root)),
                tasks: RwLock::new(Vec::new()),
                counts: Arc::new(RefCounts::default()),
                walk_hook: Mutex::new(None),
            }),
        }
    }

    pub fn counts(&self) -> &RefCounts {
        &self.state.counts
    }

    pub fn spawn(&self, spec: FakeTask) {
        let ns = spec.ns.or(*lock(&self.state.root));
        let task = Task {
            pid: spec.pid,
            comm: spec.comm,
            state: spec.state,
            alive: AtomicBool::new(true),
            ns: Mutex::new(ns),
            ids: spec.ids,
            files: Mutex::new(spec.has_files.then(|| Arc::new(Table::default()))),
        };
        self.state
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(task));
    }

    /// Acquires a counted handle on `pid`.
    pub fn process(&self, pid: Pid) -> Option<FakeProcess> {
        self.task(pid)
            .map(|task| FakeProcess::acquire(task, self.state.counts.clone()))
    }

    /// Tears the process down: it keeps its table entry as a zombie but loses
    /// its namespace proxy and its open files.
    pub fn exit(&self, pid: Pid) {
        let task = self.expect_task(pid);
        task.alive.store(false, Ordering::SeqCst);
        *lock(&task.ns) = None;
        *lock(&task.files) = None;
    }

    /// Removes the process from the process table.
    pub fn reap(&self, pid: Pid) {
        self.state
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|task| task.pid != pid);
    }

    pub fn open(&self, pid: Pid, fd: usize, file: FakeFile) {
        let table = self.expect_table(pid);
        let mut slots = lock(&table.slots);
        if slots.files.len() <= fd {
            slots.files.resize_with(fd + 1, || None);
            slots.close_on_exec.resize(fd + 1, false);
        }
        let obj = Arc::new(FileObj {
            handle: file.handle,
            offset: file.offset,
            flags: file.flags,
            path: file.path,
            on_resolve: file.on_resolve,
        });
        if let Some(slot) = slots.files.get_mut(fd) {
            *slot = Some(obj);
        }
    }

    pub fn close(&self, pid: Pid, fd: usize) {
        let table = self.expect_table(pid);
        let mut slots = lock(&table.slots);
        if let Some(slot) = slots.files.get_mut(fd) {
            *slot = None;
        }
        if let Some(flag) = slots.close_on_exec.get_mut(fd) {
            *flag = false;
        }
    }

    pub fn set_close_on_exec(&self, pid: Pid, fd: usize, close_on_exec: bool) {
        let table = self.expect_table(pid);
        let mut slots = lock(&table.slots);
        match slots.close_on_exec.get_mut(fd) {
            Some(flag) => *flag = close_on_exec,
            None => panic!("fd {fd} of pid {pid} is not open"),
        }
    }

    pub fn set_root_namespace(&self, ns: NsId) {
        *lock(&self.state.root) = Some(ns);
    }

    /// Makes reading the root namespace fail, as when pid 1 is not readable.
    pub fn fail_root_namespace(&self) {
        *lock(&self.state.root) = None;
    }

    /// Runs `hook` after each process visited by a walk. The hook must not
    /// spawn or reap processes: the process table is locked during the walk.
    pub fn on_walk(&self, hook: impl Fn(Pid) + Send + Sync + 'static) {
        *lock(&self.state.walk_hook) = Some(Arc::new(hook));
    }

    fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|task| task.pid == pid)
            .cloned()
    }

    fn expect_task(&self, pid: Pid) -> Arc<Task> {
        self.task(pid)
            .unwrap_or_else(|| panic!("pid {pid} is not in the fake host"))
    }

    fn expect_table(&self, pid: Pid) -> Arc<Table> {
        lock(&self.expect_task(pid).files)
            .clone()
            .unwrap_or_else(|| panic!("pid {pid} has no open-file table"))
    }
}

impl Host for FakeHost {
    type Process = FakeProcess;

    fn root_pid_namespace(&self) -> Result<NsId, Error> {
        bump(&self.state.counts.root_queries);
        lock(&self.state.root).ok_or_else(|| Error::RootNamespace {
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        })
    }

    fn for_each_process<F>(&self, mut f: F)
    where
        F: FnMut(&FakeProcess) -> ControlFlow<()>,
    {
        let hook = lock(&self.state.walk_hook).clone();
        let tasks = self
            .state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for task in tasks.iter() {
            let view = FakeProcess::borrowed(task.clone(), self.state.counts.clone());
            let flow = f(&view);
            drop(view);
            if let Some(hook) = &hook {
                hook(task.pid);
            }
            if flow.is_break() {
                break;
            }
        }
    }
}

/// Process handle. Handles passed to a walk callback are borrowed from the
/// process table; clones are counted references.
pub struct FakeProcess {
    task: Arc<Task>,
    counts: Arc<RefCounts>,
    counted: bool,
}

impl FakeProcess {
    fn acquire(task: Arc<Task>, counts: Arc<RefCounts>) -> Self {
        bump(&counts.task_gets);
        FakeProcess {
            task,
            counts,
            counted: true,
        }
    }

    fn borrowed(task: Arc<Task>, counts: Arc<RefCounts>) -> Self {
        FakeProcess {
            task,
            counts,
            counted: false,
        }
    }
}

impl Clone for FakeProcess {
    fn clone(&self) -> Self {
        FakeProcess::acquire(self.task.clone(), self.counts.clone())
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        if self.counted {
            bump(&self.counts.task_puts);
        }
    }
}

impl std::fmt::Debug for FakeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcess")
            .field("pid", &self.task.pid)
            .field("counted", &self.counted)
            .finish()
    }
}

impl Process for FakeProcess {
    type Files = FakeFiles;

    fn pid(&self) -> Pid {
        self.task.pid
    }

    fn pid_ns_for_children(&self) -> Option<NsId> {
        *lock(&self.task.ns)
    }

    fn fields(&self) -> Option<TaskFields> {
        if !self.task.alive.load(Ordering::SeqCst) {
            return None;
        }
        Some(TaskFields {
            comm: self.task.comm.clone(),
            state: self.task.state,
        })
    }

    fn translate(&self, ns: NsId) -> ContainerIds {
        self.task.ids.get(&ns).copied().unwrap_or_default()
    }

    fn files(&self) -> Option<FakeFiles> {
        let table = lock(&self.task.files).clone()?;
        bump(&self.counts.table_gets);
        Some(FakeFiles {
            table,
            counts: self.counts.clone(),
        })
    }
}

/// Counted reference to an open-file table.
pub struct FakeFiles {
    table: Arc<Table>,
    counts: Arc<RefCounts>,
}

impl Drop for FakeFiles {
    fn drop(&mut self) {
        bump(&self.counts.table_puts);
    }
}

impl FileTable for FakeFiles {
    type File = FakeFileRef;
    type Locked<'a> = FakeLockedFiles<'a>;

    fn lock(&self) -> FakeLockedFiles<'_> {
        let guard = lock(&self.table.slots);
        bump(&self.counts.table_locks_held);
        FakeLockedFiles {
            guard,
            counts: &self.counts,
        }
    }
}

pub struct FakeLockedFiles<'a> {
    guard: MutexGuard<'a, Slots>,
    counts: &'a Arc<RefCounts>,
}

impl Drop for FakeLockedFiles<'_> {
    fn drop(&mut self) {
        self.counts.table_locks_held.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LockedFileTable for FakeLockedFiles<'_> {
    type File = FakeFileRef;

    fn max_fds(&self) -> usize {
        self.guard.files.len()
    }

    fn get_file(&self, fd: usize) -> Option<FakeFileRef> {
        let obj = self.guard.files.get(fd)?.as_ref()?.clone();
        bump(&self.counts.file_gets);
        Some(FakeFileRef {
            obj,
            counts: self.counts.clone(),
        })
    }

    fn close_on_exec(&self, fd: usize) -> bool {
        self.guard.close_on_exec.get(fd).copied().unwrap_or(false)
    }
}

/// Counted reference to an open file.
pub struct FakeFileRef {
    obj: Arc<FileObj>,
    counts: Arc<RefCounts>,
}

impl Drop for FakeFileRef {
    fn drop(&mut self) {
        bump(&self.counts.file_puts);
    }
}

impl OpenFile for FakeFileRef {
    fn handle(&self) -> Option<RawHandle> {
        self.obj.handle
    }

    fn offset(&self) -> i64 {
        self.obj.offset
    }

    fn flags(&self) -> u32 {
        self.obj.flags
    }

    fn path(&self) -> Result<String, PathError> {
        bump(&self.counts.paths_resolved);
        if self.counts.table_locks_held() > 0 {
            // Running the hook here could deadlock on the table lock.
            bump(&self.counts.resolved_under_lock);
        } else if let Some(hook) = &self.obj.on_resolve {
            hook();
        }
        self.obj.path.clone()
    }
}
