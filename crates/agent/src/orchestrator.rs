//! Conversation glue: turns flushed batches into timed replies, keeps the
//! prospect lifecycle current, and executes scheduled follow-ups, reminders
//! and pre-meeting nudges.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use pacer_core::config::ConversationConfig;
use pacer_core::domain::action::{ActionPayload, ScheduledAction, ScheduledActionId};
use pacer_core::domain::message::MessageBatch;
use pacer_core::domain::prospect::{ConversationId, Prospect, ProspectStatus};
use pacer_core::errors::{ApplicationError, DomainError};
use pacer_core::scheduling::NewScheduledAction;
use pacer_core::timing::{as_duration, NaturalTiming};
use pacer_db::repositories::{ProspectRepository, RepositoryError, ScheduledActionStore};

use crate::llm::{
    ConversationContext, ConversationTurn, ReplyPurpose, Responder, ResponderError, TurnDirection,
};
use crate::scheduler::{ActionExecutor, ExecutionFailure};
use crate::transport::{DeliveryTiming, MessageTransport, SendReceipt, TransportError};

pub const REASON_PROSPECT_REPLIED: &str = "prospect_replied";
pub const REASON_MEETING_BOOKED: &str = "meeting_booked";
pub const REASON_PROSPECT_CONVERTED: &str = "prospect_converted";
pub const REASON_PROSPECT_ARCHIVED: &str = "prospect_archived";

/// Conversations whose recent turns are kept in memory at once.
pub const DEFAULT_HISTORY_CONVERSATIONS: usize = 10_000;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("no prospect is registered for conversation `{0}`")]
    UnknownProspect(ConversationId),
    #[error("prospect `{0}` is closed")]
    ProspectClosed(ConversationId),
}

impl From<OrchestratorError> for ApplicationError {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::Repository(RepositoryError::Validation(error)) => error.into(),
            OrchestratorError::Repository(error) => Self::Persistence(error.to_string()),
            OrchestratorError::Responder(error) => Self::Integration(error.to_string()),
            OrchestratorError::Transport(error) => Self::Integration(error.to_string()),
            OrchestratorError::Domain(error) => error.into(),
            OrchestratorError::UnknownProspect(id) => {
                DomainError::InvariantViolation(format!("unknown prospect `{id}`")).into()
            }
            OrchestratorError::ProspectClosed(id) => {
                DomainError::InvariantViolation(format!("prospect `{id}` is closed")).into()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Replied { receipt: SendReceipt, follow_up: Option<ScheduledActionId> },
    /// Converted or archived prospects get no automatic reply.
    Ignored { status: ProspectStatus },
}

pub struct ConversationOrchestrator {
    prospects: Arc<dyn ProspectRepository>,
    actions: Arc<dyn ScheduledActionStore>,
    responder: Arc<dyn Responder>,
    transport: Arc<dyn MessageTransport>,
    timing: NaturalTiming,
    settings: ConversationConfig,
    rng: std::sync::Mutex<StdRng>,
    history: Mutex<HashMap<ConversationId, VecDeque<ConversationTurn>>>,
    history_conversations: usize,
    locks: std::sync::Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

/// Exclusive access to one conversation. Dropping it releases the lock entry
/// once no other task is waiting on it.
struct ConversationGuard<'a> {
    owner: &'a ConversationOrchestrator,
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.release_lock(&self.conversation_id);
    }
}

impl ConversationOrchestrator {
    pub fn new(
        prospects: Arc<dyn ProspectRepository>,
        actions: Arc<dyn ScheduledActionStore>,
        responder: Arc<dyn Responder>,
        transport: Arc<dyn MessageTransport>,
        timing: NaturalTiming,
        settings: ConversationConfig,
    ) -> Self {
        Self {
            prospects,
            actions,
            responder,
            transport,
            timing,
            settings,
            rng: std::sync::Mutex::new(StdRng::from_entropy()),
            history: Mutex::new(HashMap::new()),
            history_conversations: DEFAULT_HISTORY_CONVERSATIONS,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the random source, e.g. with a seeded one.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = std::sync::Mutex::new(rng);
        self
    }

    /// Caps how many conversations keep history; the stalest is evicted.
    pub fn with_history_conversations(mut self, limit: usize) -> Self {
        self.history_conversations = limit.max(1);
        self
    }

    pub async fn handle_batch(&self, batch: MessageBatch) -> Result<BatchOutcome, OrchestratorError> {
        let conversation_id = batch.conversation_id().clone();
        let _guard = self.lock_conversation(&conversation_id).await;

        let received_at = batch.last_received_at();
        let text = batch.text();

        let mut prospect = match self.prospects.find_by_id(&conversation_id).await? {
            Some(prospect) => prospect,
            None => {
                info!(
                    event_name = "orchestrator.prospect_created",
                    conversation_id = %conversation_id,
                    "first message from unknown conversation"
                );
                Prospect::new(
                    conversation_id.clone(),
                    conversation_id.0.clone(),
                    conversation_id.0.clone(),
                    received_at,
                )
            }
        };

        prospect.record_inbound(received_at);
        self.prospects.save(prospect.clone()).await?;
        // The responder gets the batch separately, so history stops short of it.
        let context = self.context(&prospect, ReplyPurpose::Reply).await;
        self.remember(&conversation_id, TurnDirection::Inbound, &text, received_at).await;

        // A booked meeting keeps its reminders; follow-ups were dropped at booking.
        let cancelled = if prospect.status == ProspectStatus::MeetingScheduled {
            0
        } else {
            self.actions
                .cancel_pending(&conversation_id, REASON_PROSPECT_REPLIED, Utc::now())
                .await?
        };
        if cancelled > 0 {
            info!(
                event_name = "orchestrator.follow_ups_cancelled",
                conversation_id = %conversation_id,
                cancelled,
                "prospect replied; pending actions cancelled"
            );
        }

        if prospect.status.is_closed() {
            debug!(
                event_name = "orchestrator.batch_ignored",
                conversation_id = %conversation_id,
                status = prospect.status.as_str(),
                "closed prospect; no reply sent"
            );
            return Ok(BatchOutcome::Ignored { status: prospect.status });
        }

        let reading_delay = {
            let mut rng = self.lock_rng();
            self.timing.reading_delay(&text, self.timing.mode(), &mut *rng)
        };
        tokio::time::sleep(as_duration(reading_delay)).await;

        let answered = match self.responder.respond(&text, &context).await {
            Ok(reply) => match self.deliver(&prospect, &text, &reply).await {
                Ok(receipt) => Ok((reply, receipt)),
                Err(error) => Err(OrchestratorError::from(error)),
            },
            Err(error) => Err(OrchestratorError::from(error)),
        };
        let (reply, receipt) = match answered {
            Ok(answered) => answered,
            Err(error) => {
                self.chase_unanswered(&prospect, &error).await;
                return Err(error);
            }
        };
        prospect.record_outbound(receipt.delivered_at);
        self.prospects.save(prospect.clone()).await?;
        self.remember(&conversation_id, TurnDirection::Outbound, &reply, receipt.delivered_at)
            .await;

        let follow_up = if prospect.status.accepts_follow_ups() {
            Some(self.schedule_follow_up(&conversation_id, 1, receipt.delivered_at).await?)
        } else {
            None
        };

        Ok(BatchOutcome::Replied { receipt, follow_up })
    }

    /// Sends the opening message to a new prospect and schedules the first
    /// follow-up.
    pub async fn start_conversation(
        &self,
        prospect: Prospect,
        opening_text: &str,
    ) -> Result<SendReceipt, OrchestratorError> {
        let conversation_id = prospect.id.clone();
        let _guard = self.lock_conversation(&conversation_id).await;

        let mut prospect = match self.prospects.find_by_id(&conversation_id).await? {
            Some(existing) => existing,
            None => prospect,
        };
        if prospect.status.is_closed() {
            return Err(OrchestratorError::ProspectClosed(conversation_id));
        }
        self.prospects.save(prospect.clone()).await?;

        let receipt = self.deliver(&prospect, "", opening_text).await?;
        prospect.record_outbound(receipt.delivered_at);
        self.prospects.save(prospect.clone()).await?;
        self.remember(&conversation_id, TurnDirection::Outbound, opening_text, receipt.delivered_at)
            .await;

        if prospect.status.accepts_follow_ups() {
            self.schedule_follow_up(&conversation_id, 1, receipt.delivered_at).await?;
        }

        info!(
            event_name = "orchestrator.conversation_started",
            conversation_id = %conversation_id,
            "opening message delivered"
        );
        Ok(receipt)
    }

    /// Moves the prospect to meeting_scheduled, drops pending follow-ups and
    /// schedules the reminder and pre-meeting nudge that are still ahead.
    pub async fn record_meeting_booked(
        &self,
        conversation_id: &ConversationId,
        meeting_at: DateTime<Utc>,
        meeting_link: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActionId>, OrchestratorError> {
        let _guard = self.lock_conversation(conversation_id).await;

        let mut prospect = self
            .prospects
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownProspect(conversation_id.clone()))?;

        if prospect.status != ProspectStatus::MeetingScheduled {
            prospect.transition_to(ProspectStatus::MeetingScheduled, now)?;
        }
        prospect.meeting_at = Some(meeting_at);
        prospect.updated_at = now;
        self.prospects.save(prospect).await?;

        self.actions.cancel_pending(conversation_id, REASON_MEETING_BOOKED, now).await?;

        let reminder_at = meeting_at - hours(self.settings.reminder_lead_hours);
        let pre_meeting_at = meeting_at - minutes(self.settings.pre_meeting_lead_minutes);
        let planned = [
            (
                reminder_at,
                ActionPayload::Reminder { meeting_at, meeting_link: meeting_link.clone() },
            ),
            (pre_meeting_at, ActionPayload::PreMeeting { meeting_at, meeting_link }),
        ];

        let mut scheduled = Vec::new();
        for (at, payload) in planned {
            if at <= now {
                debug!(
                    event_name = "orchestrator.nudge_skipped",
                    conversation_id = %conversation_id,
                    action_type = payload.action_type().as_str(),
                    "nudge time already passed"
                );
                continue;
            }
            let id = self
                .actions
                .create(NewScheduledAction::new(conversation_id.clone(), at, payload), now)
                .await?;
            scheduled.push(id);
        }

        info!(
            event_name = "orchestrator.meeting_booked",
            conversation_id = %conversation_id,
            meeting_at = %meeting_at,
            scheduled = scheduled.len(),
            "meeting booked"
        );
        Ok(scheduled)
    }

    pub async fn mark_converted(
        &self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<u64, OrchestratorError> {
        self.close(conversation_id, ProspectStatus::Converted, REASON_PROSPECT_CONVERTED, now).await
    }

    pub async fn archive(
        &self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<u64, OrchestratorError> {
        self.close(conversation_id, ProspectStatus::Archived, REASON_PROSPECT_ARCHIVED, now).await
    }

    /// Consumes flushed batches until shutdown. Conversations are answered
    /// concurrently; batches of one conversation run one at a time in the
    /// order they were flushed.
    pub async fn run(
        self: Arc<Self>,
        mut batches: mpsc::Receiver<MessageBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();
        // A key means a batch of that conversation is in flight; the queue
        // holds the ones flushed behind it.
        let mut queued: HashMap<ConversationId, VecDeque<MessageBatch>> = HashMap::new();

        loop {
            tokio::select! {
                maybe_batch = batches.recv() => {
                    let Some(batch) = maybe_batch else { break };
                    self.dispatch(batch, &mut queued, &mut in_flight);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.advance(finished, &mut queued, &mut in_flight);
                }
            }
        }

        // Batches flushed during shutdown are still answered.
        while let Ok(batch) = batches.try_recv() {
            self.dispatch(batch, &mut queued, &mut in_flight);
        }
        while let Some(finished) = in_flight.join_next().await {
            self.advance(finished, &mut queued, &mut in_flight);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        batch: MessageBatch,
        queued: &mut HashMap<ConversationId, VecDeque<MessageBatch>>,
        in_flight: &mut JoinSet<ConversationId>,
    ) {
        match queued.get_mut(batch.conversation_id()) {
            Some(waiting) => waiting.push_back(batch),
            None => {
                queued.insert(batch.conversation_id().clone(), VecDeque::new());
                self.spawn_batch(batch, in_flight);
            }
        }
    }

    fn advance(
        self: &Arc<Self>,
        finished: Result<ConversationId, JoinError>,
        queued: &mut HashMap<ConversationId, VecDeque<MessageBatch>>,
        in_flight: &mut JoinSet<ConversationId>,
    ) {
        let conversation_id = match finished {
            Ok(conversation_id) => conversation_id,
            Err(error) => {
                warn!(event_name = "orchestrator.batch_task_lost", error = %error, "batch task ended abnormally");
                return;
            }
        };
        match queued.get_mut(&conversation_id).and_then(VecDeque::pop_front) {
            Some(next) => self.spawn_batch(next, in_flight),
            None => {
                queued.remove(&conversation_id);
            }
        }
    }

    fn spawn_batch(self: &Arc<Self>, batch: MessageBatch, in_flight: &mut JoinSet<ConversationId>) {
        let orchestrator = Arc::clone(self);
        in_flight.spawn(async move {
            let conversation_id = batch.conversation_id().clone();
            // A panicking turn must still hand the conversation back to `run`.
            let turn = tokio::spawn(async move { orchestrator.handle_batch(batch).await });
            match turn.await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => warn!(
                    event_name = "orchestrator.batch_failed",
                    conversation_id = %conversation_id,
                    error = %error,
                    "could not answer conversation turn"
                ),
                Err(error) => warn!(
                    event_name = "orchestrator.batch_panicked",
                    conversation_id = %conversation_id,
                    error = %error,
                    "conversation turn aborted"
                ),
            }
            conversation_id
        });
    }

    async fn close(
        &self,
        conversation_id: &ConversationId,
        status: ProspectStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, OrchestratorError> {
        let _guard = self.lock_conversation(conversation_id).await;

        let mut prospect = self
            .prospects
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownProspect(conversation_id.clone()))?;
        prospect.transition_to(status, now)?;
        self.prospects.save(prospect).await?;

        let cancelled = self.actions.cancel_pending(conversation_id, reason, now).await?;
        self.history.lock().await.remove(conversation_id);
        info!(
            event_name = "orchestrator.prospect_closed",
            conversation_id = %conversation_id,
            status = status.as_str(),
            cancelled,
            "prospect closed"
        );
        Ok(cancelled)
    }

    async fn execute_action(&self, action: &ScheduledAction) -> Result<(), ExecutionFailure> {
        let _guard = self.lock_conversation(&action.conversation_id).await;

        let mut prospect = self
            .prospects
            .find_by_id(&action.conversation_id)
            .await
            .map_err(retryable)?
            .ok_or_else(|| ExecutionFailure::Permanent("prospect_missing".to_string()))?;
        if prospect.status.is_closed() {
            return Err(ExecutionFailure::Permanent("prospect_closed".to_string()));
        }

        let (text, next_follow_up) = match &action.payload {
            ActionPayload::FollowUp { attempt, note } => {
                if !prospect.status.accepts_follow_ups() {
                    return Err(ExecutionFailure::Permanent(format!(
                        "prospect_{}",
                        prospect.status.as_str()
                    )));
                }
                let text = match note {
                    Some(note) if !note.trim().is_empty() => note.clone(),
                    _ => {
                        let context = self
                            .context(&prospect, ReplyPurpose::FollowUp { attempt: *attempt })
                            .await;
                        self.responder.respond("", &context).await.map_err(retryable)?
                    }
                };
                let next = (*attempt < self.settings.max_follow_ups).then_some(*attempt + 1);
                (text, next)
            }
            ActionPayload::Reminder { meeting_at, meeting_link } => {
                self.ensure_meeting_current(&prospect, *meeting_at)?;
                (reminder_text(&prospect, *meeting_at, meeting_link.as_deref()), None)
            }
            ActionPayload::PreMeeting { meeting_at, meeting_link } => {
                self.ensure_meeting_current(&prospect, *meeting_at)?;
                (pre_meeting_text(&prospect, *meeting_at, meeting_link.as_deref()), None)
            }
        };

        let receipt = self.deliver(&prospect, "", &text).await.map_err(retryable)?;
        prospect.record_outbound(receipt.delivered_at);
        self.prospects.save(prospect.clone()).await.map_err(retryable)?;
        self.remember(&prospect.id, TurnDirection::Outbound, &text, receipt.delivered_at).await;

        if let Some(attempt) = next_follow_up {
            // The message is out; a failed chain must not trigger a resend.
            if let Err(error) =
                self.schedule_follow_up(&prospect.id, attempt, receipt.delivered_at).await
            {
                warn!(
                    event_name = "orchestrator.follow_up_chain_failed",
                    conversation_id = %prospect.id,
                    action_id = %action.id,
                    error = %error,
                    "could not schedule the next follow-up"
                );
            }
        }

        Ok(())
    }

    /// Keeps an unanswered turn on the schedule after the pending follow-up
    /// was already cancelled for it.
    async fn chase_unanswered(&self, prospect: &Prospect, error: &OrchestratorError) {
        if !prospect.status.accepts_follow_ups() {
            return;
        }
        match self.schedule_follow_up(&prospect.id, 1, Utc::now()).await {
            Ok(action_id) => warn!(
                event_name = "orchestrator.reply_failed",
                conversation_id = %prospect.id,
                action_id = %action_id,
                error = %error,
                "reply failed; follow-up scheduled in its place"
            ),
            Err(schedule_error) => warn!(
                event_name = "orchestrator.reply_failed",
                conversation_id = %prospect.id,
                error = %error,
                schedule_error = %schedule_error,
                "reply failed and no follow-up could be scheduled"
            ),
        }
    }

    fn ensure_meeting_current(
        &self,
        prospect: &Prospect,
        meeting_at: DateTime<Utc>,
    ) -> Result<(), ExecutionFailure> {
        if prospect.status != ProspectStatus::MeetingScheduled {
            return Err(ExecutionFailure::Permanent("meeting_not_scheduled".to_string()));
        }
        if prospect.meeting_at != Some(meeting_at) {
            return Err(ExecutionFailure::Permanent("meeting_rescheduled".to_string()));
        }
        Ok(())
    }

    async fn deliver(
        &self,
        prospect: &Prospect,
        incoming_text: &str,
        reply: &str,
    ) -> Result<SendReceipt, TransportError> {
        let timing = {
            let mut rng = self.lock_rng();
            let profile = self.timing.classify(incoming_text, reply);
            let delay = self.timing.sample_delay(profile, self.timing.mode(), &mut *rng);
            DeliveryTiming {
                delay: as_duration(delay),
                typing: as_duration(self.timing.typing_duration(reply.chars().count())),
            }
        };

        debug!(
            event_name = "orchestrator.delivery_planned",
            conversation_id = %prospect.id,
            delay_ms = timing.delay.as_millis() as u64,
            typing_ms = timing.typing.as_millis() as u64,
            "reply timing sampled"
        );
        self.transport.send(&prospect.recipient, reply, timing).await
    }

    async fn schedule_follow_up(
        &self,
        conversation_id: &ConversationId,
        attempt: u32,
        from: DateTime<Utc>,
    ) -> Result<ScheduledActionId, RepositoryError> {
        let at = from + hours(self.settings.follow_up_after_hours);
        let id = self
            .actions
            .create(
                NewScheduledAction::new(
                    conversation_id.clone(),
                    at,
                    ActionPayload::FollowUp { attempt, note: None },
                ),
                Utc::now(),
            )
            .await?;
        debug!(
            event_name = "orchestrator.follow_up_scheduled",
            conversation_id = %conversation_id,
            action_id = %id,
            attempt,
            scheduled_for = %at,
            "follow-up scheduled"
        );
        Ok(id)
    }

    async fn context(&self, prospect: &Prospect, purpose: ReplyPurpose) -> ConversationContext {
        let history = self.history.lock().await;
        let recent_turns = history
            .get(&prospect.id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default();
        ConversationContext { prospect: prospect.clone(), recent_turns, purpose }
    }

    async fn remember(
        &self,
        conversation_id: &ConversationId,
        direction: TurnDirection,
        text: &str,
        at: DateTime<Utc>,
    ) {
        let mut history = self.history.lock().await;
        if !history.contains_key(conversation_id) && history.len() >= self.history_conversations {
            let stalest = history
                .iter()
                .min_by_key(|(_, turns)| turns.back().map(|turn| turn.at))
                .map(|(id, _)| id.clone());
            if let Some(stalest) = stalest {
                history.remove(&stalest);
            }
        }
        let turns = history.entry(conversation_id.clone()).or_default();
        turns.push_back(ConversationTurn { direction, text: text.to_string(), at });
        while turns.len() > self.settings.history_turns.max(1) {
            turns.pop_front();
        }
    }

    async fn lock_conversation(&self, conversation_id: &ConversationId) -> ConversationGuard<'_> {
        let lock = {
            let mut locks = self.lock_table();
            Arc::clone(locks.entry(conversation_id.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        ConversationGuard { owner: self, conversation_id: conversation_id.clone(), guard: Some(guard) }
    }

    /// Entries are only cloned under the table lock, so a count of one means
    /// nobody holds or awaits the conversation.
    fn release_lock(&self, conversation_id: &ConversationId) {
        let mut locks = self.lock_table();
        if locks.get(conversation_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(conversation_id);
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ActionExecutor for ConversationOrchestrator {
    async fn execute(&self, action: &ScheduledAction) -> Result<(), ExecutionFailure> {
        self.execute_action(action).await
    }
}

fn retryable(error: impl std::fmt::Display) -> ExecutionFailure {
    ExecutionFailure::Retryable(error.to_string())
}

fn hours(value: u64) -> Duration {
    Duration::hours(value.min(24 * 365 * 100) as i64)
}

fn minutes(value: u64) -> Duration {
    Duration::minutes(value.min(60 * 24 * 365 * 100) as i64)
}

fn reminder_text(prospect: &Prospect, meeting_at: DateTime<Utc>, link: Option<&str>) -> String {
    let mut text = format!(
        "Hi {}, a quick reminder about our call on {} (UTC).",
        prospect.display_name,
        meeting_at.format("%A %B %-d at %H:%M")
    );
    if let Some(link) = link {
        text.push_str(&format!(" Here's the link: {link}"));
    }
    text
}

fn pre_meeting_text(prospect: &Prospect, meeting_at: DateTime<Utc>, link: Option<&str>) -> String {
    let mut text = format!(
        "Hi {}, we're on at {} UTC, talk soon!",
        prospect.display_name,
        meeting_at.format("%H:%M")
    );
    if let Some(link) = link {
        text.push_str(&format!(" Join here: {link}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::{mpsc, watch, Mutex};

    use pacer_core::config::{ConversationConfig, DelayRange, TimingConfig};
    use pacer_core::domain::action::{ActionPayload, ActionStatus, ActionType};
    use pacer_core::domain::message::{MessageBatch, MessageFragment};
    use pacer_core::domain::prospect::{ConversationId, Prospect, ProspectStatus};
    use pacer_core::errors::{ApplicationError, InterfaceError};
    use pacer_core::scheduling::NewScheduledAction;
    use pacer_core::timing::{DelayMode, NaturalTiming};
    use pacer_db::repositories::{
        InMemoryProspectRepository, InMemoryScheduledActionStore, ProspectRepository,
        ScheduledActionStore,
    };

    use super::{BatchOutcome, ConversationOrchestrator, OrchestratorError, REASON_PROSPECT_REPLIED};
    use crate::llm::{ConversationContext, ReplyPurpose, Responder, ResponderError, TurnDirection};
    use crate::scheduler::{ActionExecutor, ExecutionFailure};
    use crate::transport::{DeliveryTiming, MessageTransport, SendReceipt, TransportError};

    #[derive(Default)]
    struct ScriptedResponder {
        prompts: Mutex<Vec<(String, ReplyPurpose, usize)>>,
        fail: bool,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Responder for ScriptedResponder {
        async fn respond(
            &self,
            batched_text: &str,
            context: &ConversationContext,
        ) -> Result<String, ResponderError> {
            self.prompts.lock().await.push((
                batched_text.to_string(),
                context.purpose,
                context.recent_turns.len(),
            ));
            if self.fail || self.fail_on.is_some_and(|text| text == batched_text) {
                return Err(ResponderError::Request("model offline".to_string()));
            }
            Ok(match context.purpose {
                ReplyPurpose::Reply => "Happy to walk you through pricing.".to_string(),
                ReplyPurpose::FollowUp { attempt } => format!("Checking in ({attempt})"),
            })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, DeliveryTiming)>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn send(
            &self,
            recipient: &str,
            text: &str,
            timing: DeliveryTiming,
        ) -> Result<SendReceipt, TransportError> {
            let mut sent = self.sent.lock().await;
            sent.push((recipient.to_string(), text.to_string(), timing));
            Ok(SendReceipt { message_id: format!("msg-{}", sent.len()), delivered_at: Utc::now() })
        }
    }

    struct Harness {
        orchestrator: Arc<ConversationOrchestrator>,
        prospects: Arc<InMemoryProspectRepository>,
        actions: Arc<InMemoryScheduledActionStore>,
        responder: Arc<ScriptedResponder>,
        transport: Arc<RecordingTransport>,
    }

    fn harness_with(responder: ScriptedResponder) -> Harness {
        harness_with_timing(responder, TimingConfig::default())
    }

    fn harness_with_timing(responder: ScriptedResponder, timing: TimingConfig) -> Harness {
        let prospects = Arc::new(InMemoryProspectRepository::default());
        let actions = Arc::new(InMemoryScheduledActionStore::default());
        let responder = Arc::new(responder);
        let transport = Arc::new(RecordingTransport::default());
        let orchestrator = ConversationOrchestrator::new(
            prospects.clone(),
            actions.clone(),
            responder.clone(),
            transport.clone(),
            NaturalTiming::new(timing),
            ConversationConfig::default(),
        )
        .with_rng(StdRng::seed_from_u64(9));

        Harness { orchestrator: Arc::new(orchestrator), prospects, actions, responder, transport }
    }

    fn harness() -> Harness {
        harness_with(ScriptedResponder::default())
    }

    fn conversation() -> ConversationId {
        ConversationId("conv-1".to_string())
    }

    fn batch(texts: &[&str]) -> MessageBatch {
        let at = Utc::now();
        let fragments = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                MessageFragment::new(conversation(), *text, at + Duration::milliseconds(index as i64))
            })
            .collect();
        MessageBatch::from_fragments(conversation(), fragments).expect("non-empty batch")
    }

    async fn save_prospect(harness: &Harness, status: ProspectStatus) -> Prospect {
        let mut prospect = Prospect::new(conversation(), "Dana", "+15550100", Utc::now());
        prospect.status = status;
        harness.prospects.save(prospect.clone()).await.expect("save prospect");
        prospect
    }

    async fn actions_of(harness: &Harness, status: Option<ActionStatus>) -> Vec<pacer_core::ScheduledAction> {
        harness.actions.list_for_conversation(&conversation(), status).await.expect("list")
    }

    #[tokio::test(start_paused = true)]
    async fn batch_reply_cancels_pending_follow_up_and_schedules_next() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::Contacted).await;
        let stale_follow_up = harness
            .actions
            .create(
                NewScheduledAction::new(
                    conversation(),
                    Utc::now() + Duration::hours(2),
                    ActionPayload::FollowUp { attempt: 1, note: None },
                ),
                Utc::now(),
            )
            .await
            .expect("seed follow-up");

        let outcome = harness
            .orchestrator
            .handle_batch(batch(&["hi", "what does it cost?"]))
            .await
            .expect("handle batch");

        let BatchOutcome::Replied { follow_up: Some(next_id), .. } = outcome else {
            panic!("expected a reply with a follow-up, got {outcome:?}");
        };

        let cancelled =
            harness.actions.find_by_id(&stale_follow_up).await.expect("find").expect("exists");
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some(REASON_PROSPECT_REPLIED));

        let next = harness.actions.find_by_id(&next_id).await.expect("find").expect("exists");
        assert_eq!(next.status, ActionStatus::Pending);
        assert!(matches!(next.payload, ActionPayload::FollowUp { attempt: 1, .. }));
        assert!(next.scheduled_for > Utc::now() + Duration::hours(23));

        let prospect =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("exists");
        assert_eq!(prospect.status, ProspectStatus::InConversation);
        assert!(prospect.last_inbound_at.is_some());
        assert!(prospect.last_outbound_at.is_some());

        let sent = harness.transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+15550100");
        assert_eq!(sent[0].1, "Happy to walk you through pricing.");
        let timing = sent[0].2;
        assert!(timing.delay >= std::time::Duration::from_secs(1));
        assert!(timing.typing >= std::time::Duration::from_secs(1));

        let prompts = harness.responder.prompts.lock().await;
        assert_eq!(prompts[0].0, "hi\nwhat does it cost?");
        assert_eq!(prompts[0].2, 0, "the batch is not repeated in the history");
    }

    #[tokio::test(start_paused = true)]
    async fn reply_before_a_meeting_keeps_the_reminders() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::InConversation).await;
        let now = Utc::now();
        harness
            .orchestrator
            .record_meeting_booked(&conversation(), now + Duration::days(2), None, now)
            .await
            .expect("book meeting");

        let outcome =
            harness.orchestrator.handle_batch(batch(&["see you then"])).await.expect("handle");

        assert!(matches!(outcome, BatchOutcome::Replied { follow_up: None, .. }));
        assert_eq!(actions_of(&harness, Some(ActionStatus::Pending)).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_conversation_creates_prospect() {
        let harness = harness();

        harness.orchestrator.handle_batch(batch(&["hello?"])).await.expect("handle batch");

        let prospect =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("created");
        assert_eq!(prospect.recipient, "conv-1");
        assert_eq!(prospect.status, ProspectStatus::InConversation);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_prospect_is_recorded_but_not_answered() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::Converted).await;

        let outcome =
            harness.orchestrator.handle_batch(batch(&["one more thing"])).await.expect("handle");

        assert_eq!(outcome, BatchOutcome::Ignored { status: ProspectStatus::Converted });
        assert!(harness.transport.sent.lock().await.is_empty());
        let prospect =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("exists");
        assert!(prospect.last_inbound_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_is_chased_by_a_new_follow_up() {
        let harness = harness_with(ScriptedResponder { fail: true, ..ScriptedResponder::default() });
        save_prospect(&harness, ProspectStatus::Contacted).await;
        let earlier = harness
            .actions
            .create(
                NewScheduledAction::new(
                    conversation(),
                    Utc::now() + Duration::hours(2),
                    ActionPayload::FollowUp { attempt: 2, note: None },
                ),
                Utc::now(),
            )
            .await
            .expect("seed follow-up");

        let error = harness.orchestrator.handle_batch(batch(&["hi"])).await.expect_err("fails");
        assert!(matches!(error, OrchestratorError::Responder(_)));

        let prospect =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("exists");
        assert_eq!(prospect.status, ProspectStatus::InConversation);
        assert!(harness.transport.sent.lock().await.is_empty());

        let cancelled = harness.actions.find_by_id(&earlier).await.expect("find").expect("exists");
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].payload, ActionPayload::FollowUp { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_conversation_forgets_its_history_and_lock() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::Contacted).await;

        harness.orchestrator.handle_batch(batch(&["hi"])).await.expect("handle");
        assert_eq!(harness.orchestrator.history.lock().await.len(), 1);
        assert!(harness.orchestrator.lock_table().is_empty());

        harness.orchestrator.archive(&conversation(), Utc::now()).await.expect("archive");
        assert!(harness.orchestrator.history.lock().await.is_empty());
        assert!(harness.orchestrator.lock_table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_keeps_only_the_most_recent_conversations() {
        let prospects = Arc::new(InMemoryProspectRepository::default());
        let orchestrator = ConversationOrchestrator::new(
            prospects,
            Arc::new(InMemoryScheduledActionStore::default()),
            Arc::new(ScriptedResponder::default()),
            Arc::new(RecordingTransport::default()),
            NaturalTiming::new(TimingConfig::default()),
            ConversationConfig::default(),
        )
        .with_history_conversations(2);

        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        for (index, id) in ["conv-a", "conv-b", "conv-c"].into_iter().enumerate() {
            let conversation_id = ConversationId(id.to_string());
            orchestrator
                .remember(&conversation_id, TurnDirection::Inbound, "hi", at + Duration::minutes(index as i64))
                .await;
        }

        let history = orchestrator.history.lock().await;
        assert_eq!(history.len(), 2);
        assert!(!history.contains_key(&ConversationId("conv-a".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn start_conversation_contacts_and_schedules_first_follow_up() {
        let harness = harness();
        let prospect = Prospect::new(conversation(), "Dana", "+15550100", Utc::now());

        harness
            .orchestrator
            .start_conversation(prospect, "Hi Dana, saw you were looking at our plans!")
            .await
            .expect("start");

        let stored =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("exists");
        assert_eq!(stored.status, ProspectStatus::Contacted);

        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::FollowUp);
    }

    #[tokio::test]
    async fn meeting_booking_replaces_follow_ups_with_reminders() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::InConversation).await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        harness
            .actions
            .create(
                NewScheduledAction::new(
                    conversation(),
                    now + Duration::hours(24),
                    ActionPayload::FollowUp { attempt: 1, note: None },
                ),
                now,
            )
            .await
            .expect("seed follow-up");

        let meeting_at = now + Duration::days(3);
        let scheduled = harness
            .orchestrator
            .record_meeting_booked(&conversation(), meeting_at, Some("https://meet.example/x".into()), now)
            .await
            .expect("book meeting");
        assert_eq!(scheduled.len(), 2);

        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        let kinds: Vec<_> = pending.iter().map(|action| (action.action_type, action.scheduled_for)).collect();
        assert_eq!(
            kinds,
            vec![
                (ActionType::Reminder, meeting_at - Duration::hours(24)),
                (ActionType::PreMeeting, meeting_at - Duration::minutes(15)),
            ]
        );
        assert_eq!(actions_of(&harness, Some(ActionStatus::Cancelled)).await.len(), 1);

        let prospect =
            harness.prospects.find_by_id(&conversation()).await.expect("find").expect("exists");
        assert_eq!(prospect.status, ProspectStatus::MeetingScheduled);
        assert_eq!(prospect.meeting_at, Some(meeting_at));
    }

    #[tokio::test]
    async fn imminent_meeting_skips_reminders_already_in_the_past() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::InConversation).await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let scheduled = harness
            .orchestrator
            .record_meeting_booked(&conversation(), now + Duration::hours(2), None, now)
            .await
            .expect("book meeting");

        assert_eq!(scheduled.len(), 1);
        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        assert_eq!(pending[0].action_type, ActionType::PreMeeting);
    }

    #[tokio::test]
    async fn converting_cancels_everything_pending() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::MeetingScheduled).await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        for hours_ahead in [1, 2] {
            harness
                .actions
                .create(
                    NewScheduledAction::new(
                        conversation(),
                        now + Duration::hours(hours_ahead),
                        ActionPayload::FollowUp { attempt: 1, note: None },
                    ),
                    now,
                )
                .await
                .expect("seed");
        }

        let cancelled =
            harness.orchestrator.mark_converted(&conversation(), now).await.expect("convert");
        assert_eq!(cancelled, 2);

        let error = harness
            .orchestrator
            .record_meeting_booked(&conversation(), now + Duration::days(1), None, now)
            .await
            .expect_err("converted prospect cannot book again");
        assert!(matches!(error, OrchestratorError::Domain(_)));

        assert_eq!(harness.orchestrator.archive(&conversation(), now).await.expect("archive"), 0);
    }

    fn due_action(payload: ActionPayload) -> pacer_core::ScheduledAction {
        let now = Utc::now();
        pacer_core::ScheduledAction {
            id: pacer_core::ScheduledActionId("act-1".to_string()),
            conversation_id: conversation(),
            action_type: payload.action_type(),
            scheduled_for: now,
            status: ActionStatus::Processing,
            payload,
            attempts: 1,
            started_processing_at: Some(now),
            created_at: now,
            updated_at: now,
            executed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_execution_sends_and_chains_until_the_limit() {
        let harness = harness();
        save_prospect(&harness, ProspectStatus::Contacted).await;

        harness
            .orchestrator
            .execute(&due_action(ActionPayload::FollowUp { attempt: 1, note: None }))
            .await
            .expect("first follow-up");
        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].payload, ActionPayload::FollowUp { attempt: 2, .. }));
        assert_eq!(harness.transport.sent.lock().await[0].1, "Checking in (1)");

        let max = ConversationConfig::default().max_follow_ups;
        harness
            .orchestrator
            .execute(&due_action(ActionPayload::FollowUp {
                attempt: max,
                note: Some("Last note from us!".to_string()),
            }))
            .await
            .expect("final follow-up");
        assert_eq!(actions_of(&harness, Some(ActionStatus::Pending)).await.len(), 1);
        assert_eq!(harness.transport.sent.lock().await[1].1, "Last note from us!");
    }

    #[tokio::test]
    async fn closed_or_missing_prospects_fail_permanently() {
        let harness = harness();
        let action = due_action(ActionPayload::FollowUp { attempt: 1, note: None });

        let missing = harness.orchestrator.execute(&action).await.expect_err("missing");
        assert_eq!(missing, ExecutionFailure::Permanent("prospect_missing".to_string()));

        save_prospect(&harness, ProspectStatus::Archived).await;
        let closed = harness.orchestrator.execute(&action).await.expect_err("archived");
        assert_eq!(closed, ExecutionFailure::Permanent("prospect_closed".to_string()));
        assert!(harness.transport.sent.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn responder_errors_during_follow_up_are_retryable() {
        let harness = harness_with(ScriptedResponder { fail: true, ..ScriptedResponder::default() });
        save_prospect(&harness, ProspectStatus::InConversation).await;

        let failure = harness
            .orchestrator
            .execute(&due_action(ActionPayload::FollowUp { attempt: 1, note: None }))
            .await
            .expect_err("responder down");
        assert!(matches!(failure, ExecutionFailure::Retryable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reminder_for_a_moved_meeting_is_dropped() {
        let harness = harness();
        let mut prospect = save_prospect(&harness, ProspectStatus::MeetingScheduled).await;
        let meeting_at = Utc::now() + Duration::days(1);
        prospect.meeting_at = Some(meeting_at);
        harness.prospects.save(prospect).await.expect("save");

        harness
            .orchestrator
            .execute(&due_action(ActionPayload::Reminder {
                meeting_at,
                meeting_link: Some("https://meet.example/x".to_string()),
            }))
            .await
            .expect("reminder sent");
        assert!(harness.transport.sent.lock().await[0].1.contains("https://meet.example/x"));

        let moved = harness
            .orchestrator
            .execute(&due_action(ActionPayload::PreMeeting {
                meeting_at: meeting_at + Duration::hours(1),
                meeting_link: None,
            }))
            .await
            .expect_err("meeting moved");
        assert_eq!(moved, ExecutionFailure::Permanent("meeting_rescheduled".to_string()));
    }

    #[tokio::test]
    async fn unknown_prospect_maps_to_bad_request() {
        let harness = harness();

        let error = harness
            .orchestrator
            .archive(&conversation(), Utc::now())
            .await
            .expect_err("nothing to archive");
        assert!(matches!(error, OrchestratorError::UnknownProspect(_)));

        let interface = ApplicationError::from(error).into_interface("req-9");
        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_answers_flushed_batches_until_shutdown() {
        let harness = harness();
        let (batch_tx, batch_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&harness.orchestrator).run(batch_rx, shutdown_rx));

        batch_tx.send(batch(&["hello"])).await.expect("send batch");
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert_eq!(harness.transport.sent.lock().await.len(), 1);

        shutdown_tx.send(true).expect("shutdown");
        runner.await.expect("runner exits");
    }

    fn conversation_batch(text: &str) -> MessageBatch {
        let fragment = MessageFragment::new(conversation(), text, Utc::now());
        MessageBatch::from_fragments(conversation(), vec![fragment]).expect("non-empty batch")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn run_answers_one_conversation_in_flush_order() {
        let one_second = DelayRange { base_secs: 1.0, max_secs: 1.0 };
        let timing = TimingConfig {
            mode: DelayMode::Uniform,
            quick_ack: one_second,
            normal: one_second,
            thoughtful: one_second,
            long_read: one_second,
            ..TimingConfig::default()
        };
        let harness = harness_with_timing(ScriptedResponder::default(), timing);
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&harness.orchestrator).run(batch_rx, shutdown_rx));

        let texts: Vec<String> = (0..8).map(|index| index.to_string()).collect();
        for text in &texts {
            batch_tx.send(conversation_batch(text)).await.expect("send batch");
        }
        // Shutdown drains everything already flushed before returning.
        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(std::time::Duration::from_secs(60), runner)
            .await
            .expect("runner drains in time")
            .expect("runner exits");

        let answered: Vec<String> =
            harness.responder.prompts.lock().await.iter().map(|(text, _, _)| text.clone()).collect();
        assert_eq!(answered, texts);
        assert_eq!(harness.transport.sent.lock().await.len(), texts.len());
        assert!(harness.orchestrator.lock_table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_answering_after_a_failed_turn() {
        let harness =
            harness_with(ScriptedResponder { fail_on: Some("boom"), ..ScriptedResponder::default() });
        save_prospect(&harness, ProspectStatus::Contacted).await;
        let (batch_tx, batch_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&harness.orchestrator).run(batch_rx, shutdown_rx));

        batch_tx.send(conversation_batch("boom")).await.expect("send batch");
        batch_tx.send(conversation_batch("are you there?")).await.expect("send batch");
        tokio::time::sleep(std::time::Duration::from_secs(300)).await;

        let answered: Vec<String> =
            harness.responder.prompts.lock().await.iter().map(|(text, _, _)| text.clone()).collect();
        assert_eq!(answered, vec!["boom".to_string(), "are you there?".to_string()]);
        let sent = harness.transport.sent.lock().await.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Happy to walk you through pricing.");

        // The follow-up from the failed turn gave way to the one after the reply.
        let pending = actions_of(&harness, Some(ActionStatus::Pending)).await;
        assert_eq!(pending.len(), 1);

        shutdown_tx.send(true).expect("shutdown");
        runner.await.expect("runner exits");
    }
}
