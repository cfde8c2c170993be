//! Debounces bursts of inbound fragments into one batch per conversational
//! turn.
//!
//! Each conversation owns a slot behind its own async mutex. The slot map is
//! only locked to find, insert or release a slot, so conversations never
//! contend with each other. A quiet-window timer task is spawned per slot and
//! replaced on every new fragment; the generation stamped on the slot makes a
//! timer that already woke up a no-op. Slots left empty by a flush are
//! removed from the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pacer_core::config::BufferConfig;
use pacer_core::domain::message::{MessageBatch, MessageFragment};
use pacer_core::domain::prospect::ConversationId;
use pacer_core::pause::{PauseDetector, PauseVerdict};

const FLUSH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("flush channel closed; batch for conversation `{0}` was dropped")]
    ChannelClosed(ConversationId),
}

#[derive(Default)]
struct Slot {
    fragments: Vec<MessageFragment>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    detector: PauseDetector,
    quiet_window: Duration,
    slots: Mutex<HashMap<ConversationId, Arc<Mutex<Slot>>>>,
    generations: AtomicU64,
    flushes: mpsc::Sender<MessageBatch>,
}

#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<Inner>,
}

impl MessageBuffer {
    pub fn new(config: &BufferConfig) -> (Self, mpsc::Receiver<MessageBatch>) {
        let (sender, receiver) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
        let buffer = Self {
            inner: Arc::new(Inner {
                detector: PauseDetector::from_config(config),
                quiet_window: Duration::from_millis(config.quiet_window_ms),
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                flushes: sender,
            }),
        };
        (buffer, receiver)
    }

    pub async fn ingest(&self, fragment: MessageFragment) -> Result<(), BufferError> {
        let conversation_id = fragment.conversation_id.clone();
        let slot = self.inner.slot_for(&conversation_id).await;
        let mut guard = slot.lock().await;

        let mut previous = guard.fragments.last().map(|last| last.received_at);
        if let Some(previous_at) = previous {
            if self.inner.detector.gap_exceeds_quiet_window(previous_at, fragment.received_at) {
                // The timer has not fired yet but the gap already closed the turn.
                self.inner.flush_locked(&conversation_id, &mut guard).await?;
                previous = None;
            }
        }

        let received_at = fragment.received_at;
        guard.fragments.push(fragment);
        let burst_count = guard.fragments.len();

        match self.inner.detector.classify(previous, received_at, burst_count) {
            PauseVerdict::TurnComplete => {
                debug!(
                    event_name = "buffer.burst_ceiling",
                    conversation_id = %conversation_id,
                    burst_count,
                    "burst ceiling reached; flushing immediately"
                );
                let flushed = self.inner.flush_locked(&conversation_id, &mut guard).await;
                drop(guard);
                drop(slot);
                self.inner.release_if_idle(&conversation_id).await;
                flushed
            }
            PauseVerdict::StillComposing => {
                self.restart_timer(conversation_id, &mut guard);
                Ok(())
            }
        }
    }

    /// Flushes every open batch. Used on shutdown; returns the number of
    /// batches emitted.
    pub async fn flush_all(&self) -> Result<usize, BufferError> {
        let slots: Vec<(ConversationId, Arc<Mutex<Slot>>)> = {
            let map = self.inner.slots.lock().await;
            map.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect()
        };

        let mut flushed = 0;
        for (conversation_id, slot) in slots {
            let mut guard = slot.lock().await;
            let had_fragments = !guard.fragments.is_empty();
            let result = if had_fragments {
                self.inner.flush_locked(&conversation_id, &mut guard).await
            } else {
                Ok(())
            };
            drop(guard);
            drop(slot);
            self.inner.release_if_idle(&conversation_id).await;
            result?;
            if had_fragments {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Conversations with fragments waiting for their quiet window.
    pub async fn open_conversations(&self) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> = {
            let map = self.inner.slots.lock().await;
            map.values().cloned().collect()
        };

        let mut open = 0;
        for slot in slots {
            if !slot.lock().await.fragments.is_empty() {
                open += 1;
            }
        }
        open
    }

    fn restart_timer(&self, conversation_id: ConversationId, guard: &mut Slot) {
        guard.generation = self.inner.next_generation();
        if let Some(previous) = guard.timer.take() {
            previous.abort();
        }

        let generation = guard.generation;
        let inner = Arc::clone(&self.inner);
        let quiet_window = self.inner.quiet_window;

        // The timer looks its slot up again on wake-up and holds no reference
        // while sleeping, so an idle slot can always be released.
        guard.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet_window).await;

            let Some(slot) = inner.existing_slot(&conversation_id).await else {
                return;
            };
            let mut guard = slot.lock().await;
            if guard.generation != generation {
                return;
            }
            // Detach our own handle so the flush does not abort this task.
            guard.timer = None;
            let flushed = inner.flush_locked(&conversation_id, &mut guard).await;
            drop(guard);
            drop(slot);
            if let Err(error) = flushed {
                warn!(
                    event_name = "buffer.flush_failed",
                    conversation_id = %conversation_id,
                    error = %error,
                    "quiet window elapsed but batch could not be delivered"
                );
            }
            inner.release_if_idle(&conversation_id).await;
        }));
    }
}

impl Inner {
    async fn slot_for(&self, conversation_id: &ConversationId) -> Arc<Mutex<Slot>> {
        let mut map = self.slots.lock().await;
        Arc::clone(map.entry(conversation_id.clone()).or_default())
    }

    async fn existing_slot(&self, conversation_id: &ConversationId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.lock().await.get(conversation_id).cloned()
    }

    /// Drops the slot when it holds nothing and nobody else references it.
    /// References are only taken under the map lock, so the check cannot race
    /// with a new fragment.
    async fn release_if_idle(&self, conversation_id: &ConversationId) {
        let mut map = self.slots.lock().await;
        let idle = map.get(conversation_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|slot| slot.fragments.is_empty() && slot.timer.is_none())
                    .unwrap_or(false)
        });
        if idle {
            map.remove(conversation_id);
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn flush_locked(
        &self,
        conversation_id: &ConversationId,
        slot: &mut Slot,
    ) -> Result<(), BufferError> {
        slot.generation = self.next_generation();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        let fragments = std::mem::take(&mut slot.fragments);
        let Some(batch) = MessageBatch::from_fragments(conversation_id.clone(), fragments) else {
            return Ok(());
        };

        info!(
            event_name = "buffer.flush",
            conversation_id = %conversation_id,
            fragments = batch.len(),
            "conversation turn complete"
        );

        self.flushes
            .send(batch)
            .await
            .map_err(|_| BufferError::ChannelClosed(conversation_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::mpsc;

    use pacer_core::config::BufferConfig;
    use pacer_core::domain::message::{MessageBatch, MessageFragment};
    use pacer_core::domain::prospect::ConversationId;

    use super::MessageBuffer;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn fragment(conversation: &str, text: &str, offset_ms: i64) -> MessageFragment {
        MessageFragment::new(
            ConversationId(conversation.to_string()),
            text,
            start() + chrono::Duration::milliseconds(offset_ms),
        )
    }

    fn buffer(burst_ceiling: usize) -> (MessageBuffer, mpsc::Receiver<MessageBatch>) {
        MessageBuffer::new(&BufferConfig { quiet_window_ms: 3_000, burst_ceiling })
    }

    async fn assert_no_more_batches(receiver: &mut mpsc::Receiver<MessageBatch>) {
        let next = tokio::time::timeout(Duration::from_secs(30), receiver.recv()).await;
        assert!(next.is_err(), "unexpected extra batch: {next:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_three_fragments_flushes_once_in_order() {
        let (buffer, mut receiver) = buffer(8);

        buffer.ingest(fragment("conv-1", "hey", 0)).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(300)).await;
        buffer.ingest(fragment("conv-1", "quick question", 300)).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(300)).await;
        buffer.ingest(fragment("conv-1", "what does it cost?", 600)).await.expect("ingest");

        assert_eq!(buffer.open_conversations().await, 1);

        let batch = receiver.recv().await.expect("one flush");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.text(), "hey\nquick question\nwhat does it cost?");
        assert_eq!(batch.first_received_at(), start());

        assert_no_more_batches(&mut receiver).await;
        assert_eq!(buffer.open_conversations().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_is_measured_from_the_last_fragment() {
        let (buffer, mut receiver) = buffer(8);

        buffer.ingest(fragment("conv-1", "one", 0)).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        buffer.ingest(fragment("conv-1", "two", 2_500)).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(receiver.try_recv().is_err(), "window restarted by second fragment");

        let batch = receiver.recv().await.expect("flush");
        assert_eq!(batch.text(), "one\ntwo");
        assert_no_more_batches(&mut receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fragments_further_apart_than_quiet_window_flush_separately() {
        let (buffer, mut receiver) = buffer(8);

        buffer.ingest(fragment("conv-1", "first", 0)).await.expect("ingest");
        tokio::time::sleep(Duration::from_secs(4)).await;
        buffer.ingest(fragment("conv-1", "second", 4_000)).await.expect("ingest");

        let first = receiver.recv().await.expect("first flush");
        let second = receiver.recv().await.expect("second flush");
        assert_eq!(first.text(), "first");
        assert_eq!(second.text(), "second");
        assert_no_more_batches(&mut receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_gap_flushes_previous_batch_before_timer_fires() {
        let (buffer, mut receiver) = buffer(8);

        // Delivered late by the channel: timestamps are 5 s apart.
        buffer.ingest(fragment("conv-1", "earlier", 0)).await.expect("ingest");
        buffer.ingest(fragment("conv-1", "later", 5_000)).await.expect("ingest");

        let first = receiver.try_recv().expect("earlier batch flushed on arrival");
        assert_eq!(first.text(), "earlier");

        let second = receiver.recv().await.expect("later batch flushed by timer");
        assert_eq!(second.text(), "later");
        assert_no_more_batches(&mut receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_ceiling_flushes_without_waiting() {
        let (buffer, mut receiver) = buffer(3);

        for (index, text) in ["a", "b", "c"].into_iter().enumerate() {
            buffer.ingest(fragment("conv-1", text, index as i64 * 10)).await.expect("ingest");
        }

        let batch = receiver.try_recv().expect("flushed at ceiling");
        assert_eq!(batch.text(), "a\nb\nc");
        assert_no_more_batches(&mut receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_are_debounced_independently() {
        let (buffer, mut receiver) = buffer(8);

        buffer.ingest(fragment("conv-a", "a1", 0)).await.expect("ingest");
        buffer.ingest(fragment("conv-b", "b1", 0)).await.expect("ingest");
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        buffer.ingest(fragment("conv-a", "a2", 1_000)).await.expect("ingest");

        let first = receiver.recv().await.expect("flush");
        let second = receiver.recv().await.expect("flush");
        assert_eq!(first.conversation_id(), &ConversationId("conv-b".to_string()));
        assert_eq!(first.text(), "b1");
        assert_eq!(second.conversation_id(), &ConversationId("conv-a".to_string()));
        assert_eq!(second.text(), "a1\na2");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_open_batches() {
        let (buffer, mut receiver) = buffer(8);

        buffer.ingest(fragment("conv-a", "pending a", 0)).await.expect("ingest");
        buffer.ingest(fragment("conv-b", "pending b", 0)).await.expect("ingest");

        assert_eq!(buffer.flush_all().await.expect("flush all"), 2);
        let mut texts = vec![
            receiver.try_recv().expect("batch").text(),
            receiver.try_recv().expect("batch").text(),
        ];
        texts.sort();
        assert_eq!(texts, vec!["pending a".to_string(), "pending b".to_string()]);

        assert_no_more_batches(&mut receiver).await;
        assert_eq!(buffer.flush_all().await.expect("nothing left"), 0);
    }

    async fn tracked_slots(buffer: &MessageBuffer) -> usize {
        buffer.inner.slots.lock().await.len()
    }

    #[tokio::test(start_paused = true)]
    async fn flushed_conversations_release_their_slots() {
        let (buffer, mut receiver) = buffer(3);

        buffer.ingest(fragment("conv-timer", "waiting", 0)).await.expect("ingest");
        for (index, text) in ["a", "b", "c"].into_iter().enumerate() {
            buffer.ingest(fragment("conv-burst", text, index as i64 * 10)).await.expect("ingest");
        }
        assert_eq!(tracked_slots(&buffer).await, 1, "burst slot released on flush");

        assert_eq!(receiver.recv().await.expect("burst").text(), "a\nb\nc");
        assert_eq!(receiver.recv().await.expect("timer").text(), "waiting");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracked_slots(&buffer).await, 0, "timer slot released on flush");

        // A released conversation starts over with a fresh slot.
        buffer.ingest(fragment("conv-timer", "bye", 60_000)).await.expect("ingest");
        assert_eq!(tracked_slots(&buffer).await, 1);
        assert_eq!(buffer.flush_all().await.expect("flush all"), 1);
        assert_eq!(receiver.recv().await.expect("shutdown").text(), "bye");
        assert_eq!(buffer.open_conversations().await, 0);
        assert_eq!(tracked_slots(&buffer).await, 0);
        assert_no_more_batches(&mut receiver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_is_reported() {
        let (buffer, receiver) = buffer(1);
        drop(receiver);

        let error = buffer.ingest(fragment("conv-1", "hello", 0)).await.expect_err("closed");
        assert_eq!(error, super::BufferError::ChannelClosed(ConversationId("conv-1".to_string())));
    }
}
