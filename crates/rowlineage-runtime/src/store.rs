//! Buffered-row store for one run
//!
//! One slot per model, each behind its own watch channel so writers and
//! waiters of different models never contend. A slot moves forward only:
//!
//! ```text
//! Pending -> Ready(rows) -> Released
//!        \-> Missing
//! any     -> Cancelled
//! ```
//!
//! Rows are kept until every downstream consumer has released them.

use crate::error::LineageError;
use rowlineage_core::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// State of one model's slot
#[derive(Debug, Clone)]
pub enum SlotState {
    /// Not executed yet
    Pending,

    /// Executed; rows are available to consumers
    Ready(Arc<Vec<Row>>),

    /// Every consumer is done; rows were dropped
    Released,

    /// Finished without a capture
    Missing,

    Cancelled,
}

impl SlotState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SlotState::Pending)
    }
}

struct Slot {
    state: watch::Sender<SlotState>,

    /// Downstream models that still need the rows
    consumers: AtomicUsize,
}

/// Keyed store of executed result sets
pub struct RunStore {
    slots: HashMap<String, Slot>,
}

impl RunStore {
    /// Create a store with one slot per `(model, consumer count)`
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let slots = models
            .into_iter()
            .map(|(model, consumers)| {
                let (state, _) = watch::channel(SlotState::Pending);
                (
                    model.into(),
                    Slot {
                        state,
                        consumers: AtomicUsize::new(consumers),
                    },
                )
            })
            .collect();

        Self { slots }
    }

    fn slot(&self, model: &str) -> Result<&Slot, LineageError> {
        self.slots
            .get(model)
            .ok_or_else(|| LineageError::UnknownModel(model.to_string()))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.slots.contains_key(model)
    }

    /// Current state of a slot
    pub fn state(&self, model: &str) -> Option<SlotState> {
        self.slots.get(model).map(|slot| slot.state.borrow().clone())
    }

    /// Store a model's rows
    ///
    /// Rows of a model nobody consumes are not kept.
    pub fn put(&self, model: &str, rows: Arc<Vec<Row>>) -> Result<(), LineageError> {
        let slot = self.slot(model)?;
        let consumers = slot.consumers.load(Ordering::SeqCst);

        let mut outcome = Ok(());
        slot.state.send_if_modified(|state| match state {
            SlotState::Pending => {
                *state = if consumers == 0 {
                    SlotState::Released
                } else {
                    SlotState::Ready(rows)
                };
                true
            }
            SlotState::Cancelled => {
                outcome = Err(LineageError::Cancelled(model.to_string()));
                false
            }
            _ => {
                outcome = Err(LineageError::AlreadyExecuted(model.to_string()));
                false
            }
        });
        outcome
    }

    /// Mark a model as finished without a capture
    ///
    /// No effect once the model has rows.
    pub fn mark_missing(&self, model: &str) -> Result<(), LineageError> {
        let slot = self.slot(model)?;
        slot.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = SlotState::Missing;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Wait until `upstream` has rows, bounded by `timeout`
    pub async fn wait(
        &self,
        model: &str,
        upstream: &str,
        timeout: Duration,
    ) -> Result<Arc<Vec<Row>>, LineageError> {
        let mut receiver = self.slot(upstream)?.state.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|state| !state.is_pending())
                .await
                .map(|state| (*state).clone())
        })
        .await;

        match waited {
            Ok(Ok(SlotState::Ready(rows))) => Ok(rows),
            Ok(Ok(SlotState::Cancelled)) => Err(LineageError::Cancelled(upstream.to_string())),
            // The sender lives as long as the store, so a closed channel only
            // happens while the store is being torn down
            Ok(Ok(_)) | Ok(Err(_)) => Err(LineageError::MissingUpstreamCapture {
                model: model.to_string(),
                upstream: upstream.to_string(),
            }),
            Err(_) => Err(LineageError::UpstreamTimeout {
                model: model.to_string(),
                upstream: upstream.to_string(),
                waited: timeout,
            }),
        }
    }

    /// One consumer is done with `upstream`; the last one drops the rows
    pub fn release(&self, upstream: &str) -> Result<(), LineageError> {
        let slot = self.slot(upstream)?;

        let previous = slot
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);

        if previous == 1 {
            slot.state.send_if_modified(|state| {
                if matches!(state, SlotState::Ready(_)) {
                    *state = SlotState::Released;
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    /// Drop every buffered row and wake all waiters
    pub fn cancel(&self) {
        for slot in self.slots.values() {
            slot.state.send_replace(SlotState::Cancelled);
        }
    }

    /// Number of slots still holding rows
    pub fn buffered(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(*slot.state.borrow(), SlotState::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i64) -> Arc<Vec<Row>> {
        Arc::new((0..n).map(|i| Row::new().with("id", i)).collect())
    }

    #[tokio::test]
    async fn ready_rows_are_shared_until_released() {
        let store = RunStore::new([("stg", 2), ("a", 0), ("b", 0)]);
        store.put("stg", rows(3)).unwrap();

        let first = store.wait("a", "stg", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.len(), 3);
        store.release("stg").unwrap();
        assert_eq!(store.buffered(), 1);

        let second = store.wait("b", "stg", Duration::from_secs(1)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        store.release("stg").unwrap();
        assert_eq!(store.buffered(), 0);
        assert!(matches!(store.state("stg"), Some(SlotState::Released)));
    }

    #[tokio::test]
    async fn waiter_wakes_when_rows_arrive() {
        let store = Arc::new(RunStore::new([("up", 1), ("down", 0)]));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait("down", "up", Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        store.put("up", rows(2)).unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn missing_upstream_fails_fast() {
        let store = RunStore::new([("up", 1), ("down", 0)]);
        store.mark_missing("up").unwrap();

        let err = store.wait("down", "up", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, LineageError::MissingUpstreamCapture { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded() {
        let store = RunStore::new([("up", 1), ("down", 0)]);

        let err = store.wait("down", "up", Duration::from_secs(300)).await.unwrap_err();
        assert!(matches!(err, LineageError::UpstreamTimeout { .. }));
        assert!(err.is_missing_upstream());
    }

    #[tokio::test]
    async fn cancel_drops_rows_and_wakes_waiters() {
        let store = Arc::new(RunStore::new([("up", 1), ("other", 1), ("down", 0)]));
        store.put("other", rows(5)).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait("down", "up", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        store.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(LineageError::Cancelled(_))));
        assert_eq!(store.buffered(), 0);
        assert!(matches!(store.put("up", rows(1)), Err(LineageError::Cancelled(_))));
    }

    #[test]
    fn second_put_is_rejected() {
        let store = RunStore::new([("m", 1)]);
        store.put("m", rows(1)).unwrap();
        assert!(matches!(store.put("m", rows(1)), Err(LineageError::AlreadyExecuted(_))));
        assert!(matches!(store.put("x", rows(1)), Err(LineageError::UnknownModel(_))));
    }

    #[test]
    fn unconsumed_rows_are_not_kept() {
        let store = RunStore::new([("leaf", 0)]);
        store.put("leaf", rows(10)).unwrap();
        assert_eq!(store.buffered(), 0);
    }
}
