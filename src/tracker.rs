// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Process-wide set of opt-in namespaces with change notifications.

use std::collections::HashSet;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceChange {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEvent {
    pub namespace: String,
    pub change: NamespaceChange,
}

/// Tracks opted-in namespaces and notifies subscribers on membership changes.
///
/// Notifications are sent without blocking: a subscriber whose channel is full
/// misses the event. A missed `Added` heals on the next cache resync and a
/// missed `Removed` only delays skipping a namespace until its objects are
/// reconciled again, so the tracker never stalls on a slow subscriber.
#[derive(Debug, Default)]
pub struct NamespaceTracker {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashSet<String>,
    subscribers: Vec<mpsc::Sender<NamespaceEvent>>,
}

impl NamespaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a namespace. Idempotent; notifies subscribers on first insertion.
    pub fn add(&self, namespace: &str) {
        let mut inner = self.write();
        if inner.namespaces.insert(namespace.to_string()) {
            notify(
                &inner.subscribers,
                NamespaceEvent {
                    namespace: namespace.to_string(),
                    change: NamespaceChange::Added,
                },
            );
        }
    }

    /// Remove a namespace. Idempotent; notifies subscribers on real removal.
    pub fn remove(&self, namespace: &str) {
        let mut inner = self.write();
        if inner.namespaces.remove(namespace) {
            notify(
                &inner.subscribers,
                NamespaceEvent {
                    namespace: namespace.to_string(),
                    change: NamespaceChange::Removed,
                },
            );
        }
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.read().namespaces.contains(namespace)
    }

    /// Snapshot of the tracked namespaces.
    pub fn list(&self) -> Vec<String> {
        self.read().namespaces.iter().cloned().collect()
    }

    /// Register a bounded channel for change notifications.
    pub fn subscribe(&self, sender: mpsc::Sender<NamespaceEvent>) {
        self.write().subscribers.push(sender);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn notify(subscribers: &[mpsc::Sender<NamespaceEvent>], event: NamespaceEvent) {
    for sender in subscribers {
        match sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                "Dropped {:?} event for namespace {}: subscriber channel full",
                dropped.change, dropped.namespace
            ),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
