// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Cooperative shutdown for long-running actors.
//!
//! A [`Shutdown`] owns the trigger. Any number of cloneable [`ShutdownSignal`]s
//! can be handed to spawned tasks; each resolves once the trigger fires (or the
//! `Shutdown` is dropped), after which `is_triggered` keeps returning `true`.

use tokio::sync::watch;

/// Owner side of the shutdown channel. Dropping it is equivalent to
/// triggering it.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            signal: ShutdownSignal { rx: Some(rx) },
        }
    }

    /// Trigger the shutdown. Idempotent.
    pub fn trigger(&mut self) {
        // Failure means every signal has been dropped, which is fine.
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never triggers. Useful for tests and tools that manage
    /// task lifetimes some other way.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Resolves when the shutdown is triggered or the trigger is dropped.
    /// Resolves immediately if that already happened.
    pub async fn wait(&mut self) {
        match self.rx {
            Some(ref mut rx) => {
                // changed() errs when the sender is dropped, which also
                // counts as a shutdown.
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            },
            None => std::future::pending().await,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}
