// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::ops::ControlFlow;

use log::{debug, warn};

use crate::errors::Error;
use crate::host::{Host, NsId};
use crate::namespace::{Classifier, Scope};

/// A containerized process collected by [`collect`], with the namespace it
/// was classified under.
#[derive(Debug)]
pub struct Collected<P> {
    pub process: P,
    pub ns: NsId,
}

#[derive(Debug)]
pub struct Snapshot<P> {
    pub entries: Vec<Collected<P>>,
    /// More containerized processes were running than the capacity allows.
    pub truncated: bool,
}

impl<P> Snapshot<P> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Takes a reference on every containerized process, in process table order,
/// keeping at most `capacity` of them.
///
/// The snapshot buffer is reserved before the walk starts so the walk itself
/// never allocates. Failing to reserve it fails the whole request.
pub fn collect<H: Host>(
    host: &H,
    classifier: &Classifier,
    capacity: usize,
) -> Result<Snapshot<H::Process>, Error> {
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(capacity)
        .map_err(|_| Error::SnapshotAlloc { capacity })?;

    let mut truncated = false;
    let mut zombies = 0usize;

    host.for_each_process(|task| {
        let ns = match classifier.classify(task) {
            Scope::Root => return ControlFlow::Continue(()),
            Scope::Detached => {
                zombies += 1;
                return ControlFlow::Continue(());
            }
            Scope::Container(ns) => ns,
        };

        if entries.len() >= capacity {
            truncated = true;
            return ControlFlow::Break(());
        }

        // The task lock taken by classify() is already released here.
        entries.push(Collected {
            process: task.clone(),
            ns,
        });
        ControlFlow::Continue(())
    });

    // Logging may block, so it waits until the walk is over.
    if truncated {
        warn!("more than {capacity} containerized processes are running, report is truncated");
    }
    debug!(
        "collected {} containerized processes ({} zombies skipped)",
        entries.len(),
        zombies
    );

    Ok(Snapshot { entries, truncated })
}
