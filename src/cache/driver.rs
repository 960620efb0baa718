//! The coordinator task.
//!
//! One task per engine generation. It waits for a wake-up, a store event, a
//! change notification or the next timer, feeds the input to the engine under
//! the lock, runs one dispatch step and delivers the queued callbacks once
//! the lock is released.

use std::sync::{Arc, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::engine::Notice;
use super::{deliver, Shared};
use crate::store::{ChangeNotification, StoreMessage};

enum Input {
    Wake,
    Store(StoreMessage),
    Change(ChangeNotification),
    Lagged(u64),
}

pub(crate) struct Driver {
    shared: Weak<Shared>,
    wake: Arc<Notify>,
    generation: u64,
    events: mpsc::UnboundedReceiver<StoreMessage>,
    changes: Option<broadcast::Receiver<ChangeNotification>>,
}

impl Driver {
    pub fn new(
        shared: Weak<Shared>,
        wake: Arc<Notify>,
        generation: u64,
        events: mpsc::UnboundedReceiver<StoreMessage>,
        changes: broadcast::Receiver<ChangeNotification>,
    ) -> Self {
        Self {
            shared,
            wake,
            generation,
            events,
            changes: Some(changes),
        }
    }

    pub async fn run(mut self) {
        debug!(generation = self.generation, "cache coordinator started");
        loop {
            let Some(deadline) = self.deadline() else {
                break;
            };

            let input = tokio::select! {
                _ = self.wake.notified() => Input::Wake,
                message = self.events.recv() => match message {
                    Some(message) => Input::Store(message),
                    None => break,
                },
                change = next_change(&mut self.changes) => change,
                _ = sleep_until(deadline) => Input::Wake,
            };

            let Some(notices) = self.process(input) else {
                break;
            };
            deliver(notices);
        }
        debug!(generation = self.generation, "cache coordinator stopped");
    }

    /// Next timer of the engine, or `None` once this generation is gone.
    fn deadline(&self) -> Option<Option<Instant>> {
        let shared = self.shared.upgrade()?;
        let guard = shared.engine.lock();
        guard
            .as_ref()
            .filter(|engine| engine.generation() == self.generation)
            .map(|engine| engine.next_deadline())
    }

    fn process(&self, input: Input) -> Option<Vec<Notice>> {
        let shared = self.shared.upgrade()?;
        let mut guard = shared.engine.lock();
        let engine = guard
            .as_mut()
            .filter(|engine| engine.generation() == self.generation)?;

        match input {
            Input::Wake => {}
            Input::Store(message) => engine.handle_store_message(message),
            Input::Change(notification) => engine.handle_change(notification),
            Input::Lagged(skipped) => engine.handle_lagged(skipped),
        }

        if engine.on_timer() {
            debug!(generation = self.generation, "cache expired; dropping state");
            let notices = engine.take_outbox();
            *guard = None;
            drop(guard);
            deliver(notices);
            return None;
        }

        engine.step();
        Some(engine.take_outbox())
    }
}

async fn next_change(changes: &mut Option<broadcast::Receiver<ChangeNotification>>) -> Input {
    let Some(rx) = changes.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(notification) => Input::Change(notification),
        Err(RecvError::Lagged(skipped)) => Input::Lagged(skipped),
        Err(RecvError::Closed) => {
            warn!("store change stream closed");
            *changes = None;
            Input::Wake
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
