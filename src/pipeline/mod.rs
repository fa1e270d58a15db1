//! Worker-side processing pipeline.
//!
//! One inbound task flows: dedupe → session → abuse guard → FSM → decision
//! stages (1 ‖ 2, then 3, then the master decider) → outbound request →
//! enqueue → persist → audit. Stage failures never escape: every path ends
//! in a valid `MessagePlan` or a persisted terminal outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::abuse::AbuseGuard;
use crate::audit::{AuditActor, AuditRecorder};
use crate::config::Settings;
use crate::dedupe::InboundDedupe;
use crate::domain::plan::{MessagePlan, PlanKind};
use crate::domain::{
    ActionTag, ConversationEvent, ConversationState, InboundMessage, Outcome, dispatch,
};
use crate::error::GatewayError;
use crate::ids::derive_user_key;
use crate::llm::{
    LlmClient, MasterDecisionInput, MasterDecisionOutput, ResponseGeneration, StateSelectorInput,
    StateSelectorOutput, SelectorStatus, choose_message_plan, decide_master, detect_event,
    generate_response,
};
use crate::normalizer::extract_messages;
use crate::pii::{mask_history, mask_text};
use crate::queue::{QueuedTask, TaskQueue};
use crate::session::{IntentEntry, SessionManager, SessionState};
use crate::whatsapp::{ButtonSpec, OutboundMessageRequest};

/// Hard ceiling for one message's processing; on expiry partial progress is
/// persisted as FAILED_INTERNAL and the task errors so the queue retries.
const MESSAGE_DEADLINE: Duration = Duration::from_secs(60);

/// Masked history entries handed to Stage 1.
const HISTORY_CONTEXT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct InboundSummary {
    pub inbound_event_id: String,
    pub processed: usize,
    pub deduped: usize,
    pub skipped: usize,
    pub outbound_tasks: Vec<String>,
}

pub struct Pipeline {
    settings: Arc<Settings>,
    inbound_dedupe: Arc<dyn InboundDedupe>,
    sessions: Arc<SessionManager>,
    abuse: AbuseGuard,
    llm: Option<Arc<dyn LlmClient>>,
    queue: Arc<dyn TaskQueue>,
    audit: Arc<AuditRecorder>,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        inbound_dedupe: Arc<dyn InboundDedupe>,
        sessions: Arc<SessionManager>,
        abuse: AbuseGuard,
        llm: Option<Arc<dyn LlmClient>>,
        queue: Arc<dyn TaskQueue>,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Pipeline {
            settings,
            inbound_dedupe,
            sessions,
            abuse,
            llm,
            queue,
            audit,
        }
    }

    /// Process one inbound webhook payload that already passed admission.
    pub async fn process_inbound(
        &self,
        payload: &Value,
        inbound_event_id: &str,
        correlation_id: &str,
    ) -> Result<InboundSummary, GatewayError> {
        let messages = extract_messages(payload);
        let mut summary = InboundSummary {
            inbound_event_id: inbound_event_id.to_string(),
            processed: 0,
            deduped: 0,
            skipped: 0,
            outbound_tasks: Vec::new(),
        };

        for message in &messages {
            if message.from_number.is_empty() {
                summary.skipped += 1;
                continue;
            }

            // worker-side dedupe: the admission mark covers the payload,
            // this one covers each message id
            let key = self.settings.dedupe_key(&message.message_id);
            let mark = self
                .inbound_dedupe
                .mark_if_new(&key, self.settings.dedupe_ttl_seconds)
                .await
                .map_err(GatewayError::Dedupe)?;
            if !mark.is_new() {
                info!(message_id = %message.message_id, "message_deduplicated");
                summary.deduped += 1;
                continue;
            }

            match tokio::time::timeout(
                MESSAGE_DEADLINE,
                self.process_message(message, correlation_id),
            )
            .await
            {
                Ok(Ok(task_id)) => {
                    summary.processed += 1;
                    if let Some(task_id) = task_id {
                        summary.outbound_tasks.push(task_id);
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.persist_failed(message, correlation_id).await;
                    return Err(GatewayError::Other(anyhow::anyhow!(
                        "message processing deadline exceeded"
                    )));
                }
            }
        }

        Ok(summary)
    }

    /// Process one message end-to-end. Returns the enqueued outbound task
    /// id, or None when the message was absorbed (abuse, terminal).
    async fn process_message(
        &self,
        message: &InboundMessage,
        correlation_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let _guard = self.sessions.lock_session(&message.chat_id).await;

        let mut session = self
            .sessions
            .get_or_create(&message.chat_id)
            .await
            .map_err(GatewayError::Session)?;
        let mut state = self
            .sessions
            .normalize_current_state(&mut session, Some(correlation_id));

        // A terminal session getting new input starts over.
        if state.is_terminal() {
            state = ConversationState::Initial;
            session.set_state(state);
            session.outcome = None;
        }

        let first_of_day = self.sessions.append_user_message(
            &mut session,
            &message.message_id,
            message.timestamp,
            Some(correlation_id),
        );

        if !message.is_actionable() {
            info!(
                correlation_id,
                message_type = %message.message_type,
                "unsupported_message_absorbed"
            );
            session.outcome = Some(Outcome::Unsupported);
            self.persist(&mut session).await;
            self.record_audit(
                &message.from_number,
                "UNSUPPORTED_MESSAGE",
                &message.message_type.to_string(),
                correlation_id,
            )
            .await;
            return Ok(None);
        }

        let verdict = self.abuse.check(&session, message.text()).await;
        if verdict.is_abusive() {
            // flood/spam land in the SPAM terminal; a saturated intent queue
            // keeps its state and is scheduled for follow-up instead
            if verdict.outcome() == Some(Outcome::DuplicateOrSpam) {
                if let Some(next) = dispatch(state, ConversationEvent::AbuseDetected).next_state {
                    session.set_state(next);
                }
            }
            session.outcome = verdict.outcome();
            self.persist(&mut session).await;
            self.record_audit(
                &message.from_number,
                "ABUSE_BLOCKED",
                &format!("{verdict:?}"),
                correlation_id,
            )
            .await;
            return Ok(None);
        }

        let mut admit = dispatch(state, ConversationEvent::UserSentText);
        if !admit.valid {
            // unexpected mid-flight state left by a crashed worker
            warn!(
                state = %state,
                error = admit.error.as_deref().unwrap_or(""),
                "unexpected_state_for_user_input"
            );
            state = ConversationState::Initial;
            session.set_state(state);
            admit = dispatch(state, ConversationEvent::UserSentText);
        }
        debug_assert!(admit.actions.contains(&ActionTag::DetectEvent));
        let triage = admit.next_state.unwrap_or(ConversationState::Triage);

        let (selector, response) = self.run_decision_stages(message, &session, triage, correlation_id).await;

        // Queue the detected intent while capacity allows.
        if let Some(request) = selector.detected_requests.first() {
            session.push_intent(
                IntentEntry {
                    intent: request.clone(),
                    confidence: selector.confidence,
                    arrived_at: chrono::Utc::now(),
                },
                self.sessions.max_intents(),
            );
        }

        let triage_event = if selector.accepted {
            ConversationEvent::EventDetected
        } else {
            ConversationEvent::ClarificationNeeded
        };
        let mut current = dispatch(triage, triage_event)
            .next_state
            .unwrap_or(ConversationState::GeneratingResponse);
        current = dispatch(current, ConversationEvent::ResponseGenerated)
            .next_state
            .unwrap_or(ConversationState::SelectingMessageType);

        let plan = self
            .run_plan_stage(&selector, &response, correlation_id)
            .await;

        let decision = self
            .run_master_decider(&selector, &response, state, &plan, message, correlation_id)
            .await;
        let decision_reason = decision
            .as_ref()
            .map_or_else(|| "llm disabled".to_string(), |d| d.reason.clone());

        // The decider consolidates Stages 1-3 into the executable plan;
        // without it (LLM disabled) Stage 3's plan stands as-is.
        let final_plan = decision
            .as_ref()
            .map_or_else(|| plan.clone(), |d| Self::plan_from_decision(d, &response, &plan));

        let wants_handoff = final_plan.safety.require_handoff
            || decision.as_ref().is_some_and(|d| {
                d.apply_state
                    && matches!(
                        d.final_state,
                        ConversationState::Escalating | ConversationState::HandoffHuman
                    )
            });

        let (final_state, outcome) = if wants_handoff {
            let escalating = dispatch(current, ConversationEvent::HandoffRequested)
                .next_state
                .unwrap_or(ConversationState::Escalating);
            let handoff = dispatch(escalating, ConversationEvent::HandoffCompleted)
                .next_state
                .unwrap_or(ConversationState::HandoffHuman);
            (handoff, Outcome::HandoffHuman)
        } else {
            let awaiting = dispatch(current, ConversationEvent::MessageTypeSelected)
                .next_state
                .unwrap_or(ConversationState::AwaitingUser);
            match decision.as_ref() {
                // decider closed the conversation: walk on to COMPLETED
                Some(d) if d.apply_state && d.final_state == ConversationState::Completed => {
                    let completed = dispatch(awaiting, ConversationEvent::ConversationClosed)
                        .next_state
                        .unwrap_or(ConversationState::Completed);
                    (completed, Outcome::SelfServeInfo)
                }
                _ => (awaiting, Outcome::AwaitingUser),
            }
        };

        session.set_state(final_state);
        session.outcome = Some(outcome);

        let request = self.build_outbound_request(message, &final_plan);
        let task_id = self
            .queue
            .enqueue(QueuedTask::Outbound { request })
            .await
            .map_err(GatewayError::Queue)?;

        self.persist(&mut session).await;
        self.record_audit(
            &message.from_number,
            "DECISION_EXECUTED",
            &decision_reason,
            correlation_id,
        )
        .await;

        info!(
            correlation_id,
            session_id = %&session.session_id[..8],
            final_state = %final_state,
            outcome = %outcome,
            plan_kind = %final_plan.kind,
            first_of_day,
            "message_processed"
        );
        Ok(Some(task_id))
    }

    /// Stages 1 and 2 run concurrently. Both inputs are fully constructed
    /// before either call, so neither depends on the other's output.
    async fn run_decision_stages(
        &self,
        message: &InboundMessage,
        session: &SessionState,
        triage: ConversationState,
        correlation_id: &str,
    ) -> (StateSelectorOutput, ResponseGeneration) {
        let masked_text = mask_text(message.text().unwrap_or_default());
        let history: Vec<String> = session
            .message_history
            .iter()
            .map(|entry| {
                format!(
                    "received_at={} correlation={}",
                    entry.received_at.timestamp(),
                    entry.correlation_id.as_deref().unwrap_or("-")
                )
            })
            .collect();
        let masked_history = mask_history(&history, HISTORY_CONTEXT_LIMIT);

        let open_items: Vec<String> = session
            .intent_queue
            .iter()
            .map(|entry| entry.intent.clone())
            .collect();

        let selector_input = StateSelectorInput {
            message_text: masked_text.clone(),
            current_state: triage,
            possible_next_states: vec![
                ConversationState::GeneratingResponse,
                ConversationState::CollectingInfo,
            ],
            history_summary: masked_history.clone(),
            open_items,
            fulfilled_items: Vec::new(),
            detected_requests: Vec::new(),
        };

        match &self.llm {
            Some(client) => {
                let llm = &self.settings.llm;
                tokio::join!(
                    detect_event(
                        client.as_ref(),
                        &llm.detector,
                        &selector_input,
                        correlation_id,
                        llm.confidence_threshold,
                    ),
                    generate_response(
                        client.as_ref(),
                        &llm.responder,
                        &masked_text,
                        "UNCLASSIFIED",
                        triage,
                        ConversationState::GeneratingResponse,
                        &masked_history,
                        correlation_id,
                        llm.min_responses,
                    )
                )
            }
            None => {
                info!(correlation_id, "llm_disabled_using_fallback");
                (
                    StateSelectorOutput {
                        selected_state: triage,
                        confidence: 0.0,
                        accepted: false,
                        next_state: triage,
                        response_hint: None,
                        status: SelectorStatus::InProgress,
                        open_items: selector_input.open_items,
                        fulfilled_items: Vec::new(),
                        detected_requests: Vec::new(),
                    },
                    ResponseGeneration::fallback(),
                )
            }
        }
    }

    async fn run_plan_stage(
        &self,
        selector: &StateSelectorOutput,
        response: &ResponseGeneration,
        correlation_id: &str,
    ) -> MessagePlan {
        match &self.llm {
            Some(client) => {
                choose_message_plan(
                    client.as_ref(),
                    &self.settings.llm.selector,
                    &selector.status.to_string(),
                    response,
                    correlation_id,
                )
                .await
            }
            None => {
                if !response.options.is_empty() && response.options.len() <= 3 {
                    MessagePlan::buttons(
                        response.text_content.clone(),
                        response.options.clone(),
                        0.5,
                        "llm disabled: options map to buttons",
                    )
                } else {
                    MessagePlan::text(response.text_content.clone(), 0.4, "llm disabled")
                }
            }
        }
    }

    async fn run_master_decider(
        &self,
        selector: &StateSelectorOutput,
        response: &ResponseGeneration,
        state: ConversationState,
        plan: &MessagePlan,
        message: &InboundMessage,
        correlation_id: &str,
    ) -> Option<MasterDecisionOutput> {
        let client = self.llm.as_ref()?;
        let input = MasterDecisionInput {
            current_state: state,
            state_decision: selector.clone(),
            response: response.clone(),
            chosen_index: Self::stage_chosen_index(plan, response),
            last_user_message: mask_text(message.text().unwrap_or_default()),
        };
        Some(
            decide_master(
                client.as_ref(),
                &self.settings.llm.decider,
                &input,
                correlation_id,
            )
            .await,
        )
    }

    /// Index of Stage 3's pick within Stage 2's response set: the plan's
    /// leading option when interactive, the body text otherwise.
    fn stage_chosen_index(plan: &MessagePlan, response: &ResponseGeneration) -> usize {
        plan.options
            .first()
            .and_then(|opt| response.options.iter().position(|o| o.id == opt.id))
            .unwrap_or(0)
    }

    /// Materialize the decider's consolidated choice as the executable plan.
    /// Interactive kinds keep Stage 2's option set; reaction and sticker
    /// kinds need Stage 3's media fields and degrade to text without them.
    fn plan_from_decision(
        decision: &MasterDecisionOutput,
        response: &ResponseGeneration,
        plan: &MessagePlan,
    ) -> MessagePlan {
        let merged = match decision.message_type {
            PlanKind::InteractiveButton | PlanKind::InteractiveList
                if !response.options.is_empty() =>
            {
                MessagePlan {
                    kind: decision.message_type,
                    ..MessagePlan::buttons(
                        response.text_content.clone(),
                        response.options.clone(),
                        decision.overall_confidence,
                        decision.reason.clone(),
                    )
                }
            }
            PlanKind::Reaction if plan.reaction_emoji.is_some() => plan.clone(),
            PlanKind::Sticker if plan.sticker_id.is_some() => plan.clone(),
            _ => MessagePlan::text(
                decision.selected_response_text.clone(),
                decision.overall_confidence,
                decision.reason.clone(),
            ),
        };
        merged.with_safety(plan.safety)
    }

    fn build_outbound_request(
        &self,
        message: &InboundMessage,
        plan: &MessagePlan,
    ) -> OutboundMessageRequest {
        let to = if message.from_number.starts_with('+') {
            message.from_number.clone()
        } else {
            format!("+{}", message.from_number)
        };

        match plan.kind {
            PlanKind::InteractiveButton => OutboundMessageRequest::interactive_buttons(
                &to,
                &plan.text,
                plan.options
                    .iter()
                    .map(|opt| ButtonSpec {
                        id: opt.id.clone(),
                        title: opt.title.clone(),
                    })
                    .collect(),
                &message.message_id,
            ),
            PlanKind::Reaction => {
                let mut request = OutboundMessageRequest::text(&to, "", &message.message_id);
                request.message_type = crate::whatsapp::OutboundMessageType::Reaction;
                request.text = None;
                request.reaction_message_id = Some(message.message_id.clone());
                request.reaction_emoji = plan.reaction_emoji.clone();
                request
            }
            PlanKind::Sticker => {
                let mut request = OutboundMessageRequest::text(&to, "", &message.message_id);
                request.message_type = crate::whatsapp::OutboundMessageType::Sticker;
                request.text = None;
                request.sticker_id = plan.sticker_id.clone();
                request
            }
            // INTERACTIVE_LIST without curated sections degrades to text
            PlanKind::InteractiveList | PlanKind::Text => {
                OutboundMessageRequest::text(&to, &plan.text, &message.message_id)
            }
        }
    }

    async fn persist(&self, session: &mut SessionState) {
        if let Err(e) = self.sessions.persist(session).await {
            error!(
                session_id = %&session.session_id[..8],
                error = %e,
                "session_persist_failed"
            );
        }
    }

    async fn persist_failed(&self, message: &InboundMessage, correlation_id: &str) {
        let _guard = self.sessions.lock_session(&message.chat_id).await;
        if let Ok(mut session) = self.sessions.get_or_create(&message.chat_id).await {
            let state = self
                .sessions
                .normalize_current_state(&mut session, Some(correlation_id));
            if let Some(next) = dispatch(state, ConversationEvent::InternalError).next_state {
                session.set_state(next);
            }
            session.outcome = Some(Outcome::FailedInternal);
            self.persist(&mut session).await;
        }
    }

    async fn record_audit(
        &self,
        from_number: &str,
        action: &str,
        reason: &str,
        correlation_id: &str,
    ) {
        let user_key = derive_user_key(
            self.settings.user_key_pepper.as_deref(),
            from_number,
        );
        if let Err(e) = self
            .audit
            .record(&user_key, AuditActor::System, action, reason, Some(correlation_id))
            .await
        {
            error!(error = %e, action, "audit_append_failed");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::InMemoryFloodDetector;
    use crate::audit::{AuditStore, InMemoryAuditStore};
    use crate::dedupe::InMemoryInboundDedupe;
    use crate::queue::InMemoryQueue;
    use crate::session::InMemorySessionStore;
    use serde_json::json;

    fn webhook_payload(message_id: &str, from: &str, text: &str) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"field": "messages", "value": {"messages": [{
                "id": message_id,
                "from": from,
                "timestamp": "1700000000",
                "type": "text",
                "text": {"body": text}
            }]}}]}]
        })
    }

    struct Fixture {
        pipeline: Pipeline,
        receiver: tokio::sync::mpsc::UnboundedReceiver<(String, QueuedTask)>,
        sessions: Arc<SessionManager>,
        audit_store: Arc<InMemoryAuditStore>,
    }

    fn fixture(flood_threshold: u32) -> Fixture {
        let settings = Arc::new(Settings::for_development());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            chrono::Duration::minutes(30),
            settings.session_max_intents,
            settings.session_history_max_entries,
        ));
        let (queue, receiver) = InMemoryQueue::channel();
        let audit_store = Arc::new(InMemoryAuditStore::new());
        let pipeline = Pipeline::new(
            settings.clone(),
            Arc::new(InMemoryInboundDedupe::new()),
            sessions.clone(),
            AbuseGuard::new(
                Arc::new(InMemoryFloodDetector::new(flood_threshold, 60)),
                settings.session_max_intents,
            ),
            None, // llm disabled: deterministic path
            Arc::new(queue),
            Arc::new(AuditRecorder::new(audit_store.clone())),
        );
        Fixture {
            pipeline,
            receiver,
            sessions,
            audit_store,
        }
    }

    #[tokio::test]
    async fn happy_path_enqueues_outbound_and_persists_awaiting_user() {
        let mut fx = fixture(10);
        let payload = webhook_payload("wamid.1", "5511999999999", "Olá");

        let summary = fx
            .pipeline
            .process_inbound(&payload, "wamid.1", "corr-1")
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.deduped, 0);
        assert_eq!(summary.outbound_tasks.len(), 1);

        let (_, task) = fx.receiver.recv().await.unwrap();
        match task {
            QueuedTask::Outbound { request } => {
                assert_eq!(request.to, "+5511999999999");
                assert_eq!(request.idempotency_key.as_deref(), Some("wamid.1"));
            }
            other => panic!("expected outbound task, got {other:?}"),
        }

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::AwaitingUser));
        assert_eq!(session.message_history.len(), 1);

        let user_key = derive_user_key(None, "5511999999999");
        let events = fx.audit_store.list_events(&user_key, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "DECISION_EXECUTED");
    }

    #[tokio::test]
    async fn replayed_message_is_deduplicated() {
        let mut fx = fixture(10);
        let payload = webhook_payload("wamid.1", "5511999999999", "Olá");

        let first = fx
            .pipeline
            .process_inbound(&payload, "wamid.1", "corr-1")
            .await
            .unwrap();
        let second = fx
            .pipeline
            .process_inbound(&payload, "wamid.1", "corr-2")
            .await
            .unwrap();

        assert_eq!(first.processed, 1);
        assert_eq!(second.processed, 0);
        assert_eq!(second.deduped, 1);

        // exactly one outbound task total
        assert!(fx.receiver.recv().await.is_some());
        assert!(fx.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn flood_classifies_spam_and_skips_llm_path() {
        let mut fx = fixture(3);
        for i in 1..=3 {
            let payload =
                webhook_payload(&format!("wamid.{i}"), "5511999999999", &format!("msg {i}"));
            fx.pipeline
                .process_inbound(&payload, &format!("wamid.{i}"), "corr")
                .await
                .unwrap();
        }

        let payload = webhook_payload("wamid.4", "5511999999999", "msg 4");
        let summary = fx
            .pipeline
            .process_inbound(&payload, "wamid.4", "corr")
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::DuplicateOrSpam));
        assert_eq!(session.current_state, "SPAM");

        // outbound tasks for the first three messages only
        for _ in 0..3 {
            assert!(fx.receiver.recv().await.is_some());
        }
        assert!(fx.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn spam_content_short_circuits() {
        let mut fx = fixture(10);
        let payload = webhook_payload("wamid.1", "5511999999999", "aaaaaaaaaaaaaaaaaaaaaa");
        fx.pipeline
            .process_inbound(&payload, "wamid.1", "corr")
            .await
            .unwrap();

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::DuplicateOrSpam));
        assert!(fx.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_without_sender_is_skipped() {
        let fx = fixture(10);
        let payload = json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "id": "wamid.1", "type": "text", "text": {"body": "oi"}
            }]}}]}]
        });
        let summary = fx
            .pipeline
            .process_inbound(&payload, "wamid.1", "corr")
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn terminal_session_restarts_on_new_input() {
        let mut fx = fixture(10);
        let payload = webhook_payload("wamid.1", "5511999999999", "aaaaaaaaaaaaaaaaaaaaaa");
        fx.pipeline
            .process_inbound(&payload, "wamid.1", "corr")
            .await
            .unwrap();
        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.current_state, "SPAM");

        let payload = webhook_payload("wamid.2", "5511999999999", "Olá de novo");
        fx.pipeline
            .process_inbound(&payload, "wamid.2", "corr")
            .await
            .unwrap();
        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.current_state, "AWAITING_USER");
        assert_eq!(session.outcome, Some(Outcome::AwaitingUser));
        let _ = fx.receiver.try_recv();
    }

    #[tokio::test]
    async fn unsupported_message_type_is_absorbed_with_outcome() {
        let mut fx = fixture(10);
        let payload = json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "id": "wamid.sys1",
                "from": "5511999999999",
                "timestamp": "1700000000",
                "type": "system"
            }]}}]}]
        });
        let summary = fx
            .pipeline
            .process_inbound(&payload, "wamid.sys1", "corr")
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert!(summary.outbound_tasks.is_empty());
        assert!(fx.receiver.try_recv().is_err());

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.outcome, Some(Outcome::Unsupported));
    }

    #[tokio::test]
    async fn interactive_button_reply_is_processed_as_input() {
        let mut fx = fixture(10);
        let payload = json!({
            "entry": [{"changes": [{"value": {"messages": [{
                "id": "wamid.btn1",
                "from": "5511999999999",
                "timestamp": "1700000000",
                "type": "interactive",
                "interactive": {"type": "button_reply", "button_reply": {"id": "opt_confirm", "title": "Sim"}}
            }]}}]}]
        });
        let summary = fx
            .pipeline
            .process_inbound(&payload, "wamid.btn1", "corr")
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.outbound_tasks.len(), 1);
        assert!(fx.receiver.recv().await.is_some());
    }

    /// Fixed client: every stage parses the same superset payload.
    struct FixedClient(String);

    #[async_trait::async_trait]
    impl LlmClient for FixedClient {
        async fn complete(
            &self,
            _system: Option<&str>,
            _prompt: &str,
            _model: &str,
        ) -> Result<String, crate::error::LlmError> {
            Ok(self.0.clone())
        }
    }

    fn fixture_with_llm(content: &Value) -> Fixture {
        let settings = Arc::new(Settings::for_development());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            chrono::Duration::minutes(30),
            settings.session_max_intents,
            settings.session_history_max_entries,
        ));
        let (queue, receiver) = InMemoryQueue::channel();
        let audit_store = Arc::new(InMemoryAuditStore::new());
        let pipeline = Pipeline::new(
            settings.clone(),
            Arc::new(InMemoryInboundDedupe::new()),
            sessions.clone(),
            AbuseGuard::new(
                Arc::new(InMemoryFloodDetector::new(100, 60)),
                settings.session_max_intents,
            ),
            Some(Arc::new(FixedClient(content.to_string())) as Arc<dyn LlmClient>),
            Arc::new(queue),
            Arc::new(AuditRecorder::new(audit_store.clone())),
        );
        Fixture {
            pipeline,
            receiver,
            sessions,
            audit_store,
        }
    }

    #[tokio::test]
    async fn decider_closes_the_conversation_when_applied() {
        let content = json!({
            "selected_state": "GENERATING_RESPONSE",
            "confidence": 0.9,
            "status": "in_progress",
            "text_content": "Fechado! Qualquer coisa é só chamar.",
            "message_type": "TEXT",
            "final_state": "COMPLETED",
            "apply_state": true,
            "selected_response_index": 0,
            "overall_confidence": 0.9,
            "reason": "user closed"
        });
        let mut fx = fixture_with_llm(&content);

        let payload = webhook_payload(
            "wamid.close1",
            "5511999999999",
            "Era só isso mesmo, pode finalizar",
        );
        fx.pipeline
            .process_inbound(&payload, "wamid.close1", "corr")
            .await
            .unwrap();

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.current_state, "COMPLETED");
        assert_eq!(session.outcome, Some(Outcome::SelfServeInfo));

        // the reply carries the decider's selected response text
        let (_, task) = fx.receiver.recv().await.unwrap();
        match task {
            QueuedTask::Outbound { request } => {
                assert_eq!(
                    request.text.as_deref(),
                    Some("Fechado! Qualquer coisa é só chamar.")
                );
            }
            other => panic!("expected outbound task, got {other:?}"),
        }

        // the decider's reason lands on the audit chain
        let user_key = derive_user_key(None, "5511999999999");
        let events = fx.audit_store.list_events(&user_key, 10).await.unwrap();
        assert_eq!(events[0].reason, "user closed");
    }

    #[tokio::test]
    async fn decider_message_type_drives_the_outbound_payload() {
        let content = json!({
            "selected_state": "GENERATING_RESPONSE",
            "confidence": 0.9,
            "status": "in_progress",
            "text_content": "Qual opção prefere?",
            "options": [
                {"id": "a", "title": "Plano A"},
                {"id": "b", "title": "Plano B"},
                {"id": "c", "title": "Plano C"}
            ],
            "message_type": "INTERACTIVE_BUTTON",
            "final_state": "AWAITING_USER",
            "apply_state": true,
            "selected_response_index": 1,
            "overall_confidence": 0.85,
            "reason": "options fit"
        });
        let mut fx = fixture_with_llm(&content);

        let payload = webhook_payload("wamid.plan1", "5511999999999", "Quero contratar um plano");
        fx.pipeline
            .process_inbound(&payload, "wamid.plan1", "corr")
            .await
            .unwrap();

        let session = fx.sessions.get_or_create("5511999999999").await.unwrap();
        assert_eq!(session.current_state, "AWAITING_USER");
        assert_eq!(session.outcome, Some(Outcome::AwaitingUser));

        let (_, task) = fx.receiver.recv().await.unwrap();
        match task {
            QueuedTask::Outbound { request } => {
                assert_eq!(
                    request.message_type,
                    crate::whatsapp::OutboundMessageType::Interactive
                );
                assert_eq!(request.text.as_deref(), Some("Qual opção prefere?"));
                assert_eq!(request.buttons.as_ref().unwrap().len(), 3);
            }
            other => panic!("expected outbound task, got {other:?}"),
        }
    }

    #[test]
    fn stage_chosen_index_locates_the_plan_leading_option() {
        use crate::domain::plan::PlanOption;

        let options: Vec<PlanOption> = ["a", "b", "c"]
            .iter()
            .map(|id| PlanOption {
                id: (*id).to_string(),
                title: format!("Opção {id}"),
            })
            .collect();
        let mut response = ResponseGeneration::fallback();
        response.options = options.clone();

        // Stage 3 kept only the tail of Stage 2's options
        let plan = crate::domain::plan::MessagePlan::buttons(
            "escolha",
            options[1..].to_vec(),
            0.8,
            "r",
        );
        assert_eq!(Pipeline::stage_chosen_index(&plan, &response), 1);

        // a text plan points at the body text
        let text_plan = crate::domain::plan::MessagePlan::text("oi", 0.8, "r");
        assert_eq!(Pipeline::stage_chosen_index(&text_plan, &response), 0);
    }

    /// Recording client: captures every prompt any stage sends out.
    struct RecordingClient {
        prompts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LlmClient for RecordingClient {
        async fn complete(
            &self,
            _system: Option<&str>,
            prompt: &str,
            _model: &str,
        ) -> Result<String, crate::error::LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            // unparseable on purpose: every stage falls back deterministically
            Ok("{}".into())
        }
    }

    #[tokio::test]
    async fn no_pii_reaches_any_llm_stage() {
        let settings = Arc::new(Settings::for_development());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            chrono::Duration::minutes(30),
            3,
            200,
        ));
        let (queue, mut receiver) = InMemoryQueue::channel();
        let client = Arc::new(RecordingClient {
            prompts: std::sync::Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(
            settings,
            Arc::new(InMemoryInboundDedupe::new()),
            sessions,
            AbuseGuard::new(Arc::new(InMemoryFloodDetector::new(100, 60)), 3),
            Some(client.clone() as Arc<dyn LlmClient>),
            Arc::new(queue),
            Arc::new(AuditRecorder::new(Arc::new(InMemoryAuditStore::new()))),
        );

        let payload = webhook_payload(
            "wamid.pii1",
            "5511999999999",
            "meu cpf é 123.456.789-01, email ana@example.com, tel (11) 99999-9999",
        );
        pipeline
            .process_inbound(&payload, "wamid.pii1", "corr")
            .await
            .unwrap();
        let _ = receiver.try_recv();

        let prompts = client.prompts.lock().unwrap();
        assert!(!prompts.is_empty(), "stages should have been called");
        for prompt in prompts.iter() {
            assert!(!crate::pii::contains_pii(prompt), "pii leaked: {prompt}");
            assert!(!prompt.contains("123.456.789-01"));
            assert!(!prompt.contains("ana@example.com"));
        }
    }

    #[tokio::test]
    async fn status_only_payload_processes_nothing() {
        let fx = fixture(10);
        let payload = json!({
            "entry": [{"changes": [{"value": {"statuses": [{"id": "wamid.s", "status": "read"}]}}]}]
        });
        let summary = fx
            .pipeline
            .process_inbound(&payload, "payload:abc", "corr")
            .await
            .unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.deduped, 0);
        assert_eq!(summary.skipped, 0);
    }
}
