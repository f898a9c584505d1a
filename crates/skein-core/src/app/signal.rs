//! Wake and shutdown signaling.
//!
//! `WakeSignal` is a coalescing "there may be new work" pulse fanned out to every
//! subscriber. Each [`WakeListener`] holds at most one pending wake: pulses it has not
//! seen yet collapse into one, because the worker drains every due task before it waits
//! again. Pools filter by task type, so a pulse must reach all of them; a single permit
//! taken by a pool that cannot claim the new row would leave the right pool asleep
//! until its poll timer fires. `ShutdownSignal` is a broadcast latch; once raised it
//! stays raised.

use std::sync::Arc;

use tokio::sync::watch;

/// Generation counter; every pulse bumps it.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wakes every subscriber, or leaves one pending wake for those not waiting yet.
    pub fn pulse(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// A listener that sees pulses sent from now on.
    pub fn subscribe(&self) -> WakeListener {
        WakeListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct WakeListener {
    rx: watch::Receiver<u64>,
}

impl WakeListener {
    /// Resolves on the first pulse this listener has not seen yet.
    pub async fn wait(&mut self) {
        if self.rx.changed().await.is_err() {
            // Every WakeSignal is gone: no pulse can come, only the poll timer is left.
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        // send_replace: there may be no listener yet, and the latch must still hold.
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested, or when the signal itself is gone.
    pub async fn wait(&mut self) {
        // wait_for errs only when the sender was dropped; treat that as shutdown too.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
