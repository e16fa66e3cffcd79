//! Delivery-thread side of the loader.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::entities::{ImageId, LoadedImage, SlotId};
use crate::domain::errors::{LoadError, LoadResult};
use crate::domain::ports::ImageConsumer;

use super::registry::ConsumerRegistry;

/// Message sent by a worker when a fetch task finishes.
#[derive(Debug)]
pub struct Completion {
    /// Key the task was fetching.
    pub id: ImageId,
    /// Slots still expecting `id` when the worker finished.
    pub slots: Vec<SlotId>,
    /// Decoded image or failure.
    pub result: LoadResult<LoadedImage>,
}

/// What happened to one slot when a completion was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The consumer received the image.
    Delivered,
    /// The consumer was told the load failed.
    Failed,
    /// The slot moved on, or the request was cancelled; nothing was surfaced.
    Discarded,
}

/// Receives worker completions and applies them on the delivery thread.
///
/// The owner of this queue is the only place consumer callbacks run from.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Completion>,
    registry: Arc<ConsumerRegistry>,
    outstanding: Arc<AtomicUsize>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("queued", &self.rx.len())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Completion>,
        registry: Arc<ConsumerRegistry>,
        outstanding: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            rx,
            registry,
            outstanding,
        }
    }

    /// Number of enqueued fetch tasks whose completion has not been dispatched.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Applies every completion already queued without waiting.
    pub fn dispatch_pending(
        &mut self,
        consumer: &mut dyn ImageConsumer,
    ) -> Vec<(SlotId, DispatchOutcome)> {
        let mut outcomes = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            outcomes.extend(self.dispatch(completion, consumer));
        }
        outcomes
    }

    /// Waits for the next completion and applies it.
    ///
    /// Returns `None` once the loader and all of its workers are gone.
    pub async fn dispatch_next(
        &mut self,
        consumer: &mut dyn ImageConsumer,
    ) -> Option<Vec<(SlotId, DispatchOutcome)>> {
        let completion = self.rx.recv().await?;
        Some(self.dispatch(completion, consumer))
    }

    /// Dispatches completions until every enqueued task has reported.
    pub async fn dispatch_until_idle(
        &mut self,
        consumer: &mut dyn ImageConsumer,
    ) -> Vec<(SlotId, DispatchOutcome)> {
        let mut outcomes = Vec::new();
        while self.outstanding() > 0 {
            match self.dispatch_next(consumer).await {
                Some(batch) => outcomes.extend(batch),
                None => break,
            }
        }
        outcomes
    }

    fn dispatch(
        &self,
        completion: Completion,
        consumer: &mut dyn ImageConsumer,
    ) -> Vec<(SlotId, DispatchOutcome)> {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        let Completion { id, slots, result } = completion;
        slots
            .into_iter()
            .map(|slot| {
                // The slot may have been reassigned after the worker checked it.
                if self.registry.is_stale(slot, &id) {
                    trace!(%slot, id = %id, "Discarding stale delivery");
                    return (slot, DispatchOutcome::Discarded);
                }
                let outcome = match &result {
                    Ok(image) => {
                        consumer.on_delivered(slot, image.clone());
                        DispatchOutcome::Delivered
                    }
                    Err(LoadError::Cancelled) => DispatchOutcome::Discarded,
                    Err(e) => {
                        consumer.on_failed(slot, e);
                        DispatchOutcome::Failed
                    }
                };
                (slot, outcome)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageSource;
    use crate::domain::ports::mocks::MockImageConsumer;
    use mockall::predicate::eq;

    fn queue() -> (mpsc::UnboundedSender<Completion>, DeliveryQueue, Arc<ConsumerRegistry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConsumerRegistry::new());
        let queue = DeliveryQueue::new(rx, registry.clone(), Arc::new(AtomicUsize::new(0)));
        (tx, queue, registry)
    }

    fn loaded(id: &ImageId) -> LoadedImage {
        LoadedImage {
            id: id.clone(),
            image: Arc::new(image::DynamicImage::new_rgb8(4, 4)),
            source: ImageSource::Network,
        }
    }

    #[test]
    fn test_delivers_to_current_slots_only() {
        let (tx, mut queue, registry) = queue();
        let id = ImageId::new("k1");
        registry.expect(SlotId::new(1), id.clone());
        registry.expect(SlotId::new(2), id.clone());
        // Slot 2 is recycled between the worker's check and delivery.
        registry.expect(SlotId::new(2), ImageId::new("k2"));

        tx.send(Completion {
            id: id.clone(),
            slots: vec![SlotId::new(1), SlotId::new(2)],
            result: Ok(loaded(&id)),
        })
        .unwrap();

        let mut consumer = MockImageConsumer::new();
        consumer
            .expect_on_delivered()
            .with(eq(SlotId::new(1)), mockall::predicate::always())
            .times(1)
            .return_const(());
        consumer.expect_on_failed().never();

        let outcomes = queue.dispatch_pending(&mut consumer);
        assert_eq!(
            outcomes,
            vec![
                (SlotId::new(1), DispatchOutcome::Delivered),
                (SlotId::new(2), DispatchOutcome::Discarded),
            ]
        );
    }

    #[test]
    fn test_failure_surfaces_once() {
        let (tx, mut queue, registry) = queue();
        let id = ImageId::new("k1");
        registry.expect(SlotId::new(5), id.clone());

        tx.send(Completion {
            id,
            slots: vec![SlotId::new(5)],
            result: Err(LoadError::NetworkTimeout),
        })
        .unwrap();

        let mut consumer = MockImageConsumer::new();
        consumer.expect_on_delivered().never();
        consumer
            .expect_on_failed()
            .withf(|slot, error| *slot == SlotId::new(5) && *error == LoadError::NetworkTimeout)
            .times(1)
            .return_const(());

        let outcomes = queue.dispatch_pending(&mut consumer);
        assert_eq!(outcomes, vec![(SlotId::new(5), DispatchOutcome::Failed)]);
    }

    #[test]
    fn test_cancelled_is_silent() {
        let (tx, mut queue, registry) = queue();
        let id = ImageId::new("k1");
        registry.expect(SlotId::new(1), id.clone());

        tx.send(Completion {
            id,
            slots: vec![SlotId::new(1)],
            result: Err(LoadError::Cancelled),
        })
        .unwrap();

        let mut consumer = MockImageConsumer::new();
        consumer.expect_on_delivered().never();
        consumer.expect_on_failed().never();

        assert_eq!(
            queue.dispatch_pending(&mut consumer),
            vec![(SlotId::new(1), DispatchOutcome::Discarded)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_next_ends_when_senders_dropped() {
        let (tx, mut queue, _registry) = queue();
        drop(tx);
        let mut consumer = MockImageConsumer::new();
        assert!(queue.dispatch_next(&mut consumer).await.is_none());
    }

    #[test]
    fn test_dispatch_next_waits_for_work() {
        let (_tx, mut queue, _registry) = queue();
        let mut consumer = MockImageConsumer::new();
        assert!(queue.dispatch_pending(&mut consumer).is_empty());

        let mut next = tokio_test::task::spawn(queue.dispatch_next(&mut consumer));
        tokio_test::assert_pending!(next.poll());
    }
}
