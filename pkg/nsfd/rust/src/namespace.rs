// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use log::trace;

use crate::errors::Error;
use crate::host::{ContainerIds, Host, NsId, Process};

/// Where a process sits relative to the root pid namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    Container(NsId),
    /// No namespace proxy left: the process is a zombie or is exiting.
    Detached,
}

/// Classifies processes against a root namespace read once per pass.
///
/// The root namespace is never re-read while a pass is running, so every
/// process of the pass is compared against the same value even if the root
/// task's own namespace changes mid-walk.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    root: NsId,
}

impl Classifier {
    pub fn new(root: NsId) -> Self {
        Classifier { root }
    }

    pub fn capture<H: Host>(host: &H) -> Result<Self, Error> {
        let root = host.root_pid_namespace()?;
        trace!("root pid namespace is {root:?}");
        Ok(Classifier { root })
    }

    pub fn root(&self) -> NsId {
        self.root
    }

    pub fn classify<P: Process>(&self, process: &P) -> Scope {
        match process.pid_ns_for_children() {
            None => Scope::Detached,
            Some(ns) if ns == self.root => Scope::Root,
            Some(ns) => Scope::Container(ns),
        }
    }

    pub fn is_root<P: Process>(&self, process: &P) -> bool {
        self.classify(process) == Scope::Root
    }
}

/// Resolves the pid, parent pid and process group of `process` as seen from
/// `ns`. Ids that are not visible from `ns` come back as `0`.
pub fn translate<P: Process>(process: &P, ns: NsId) -> ContainerIds {
    let ids = process.translate(ns);
    if ids.pid == 0 {
        trace!("pid {} is not visible from {ns:?}", process.pid());
    }
    ids
}
