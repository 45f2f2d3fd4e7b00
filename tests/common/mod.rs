//! Shared helpers for session integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley::adapters::OutputAdapter;
use parley::adapters::SessionComponents;
use parley::adapters::scripted::{ChannelInput, InputHandle, PassthroughTts, ScriptedChat};
use parley::conversation::context::ConversationContext;
use parley::metrics::MetricsCollector;
use parley::pipeline::latency::TurnTimingSummary;
use parley::runtime::TransitionRecord;
use parley::{
    ConversationConfig, ConversationSession, ConversationState, ParticipantInfo, RuntimeEvent,
    SessionId,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn user() -> ParticipantInfo {
    ParticipantInfo::human("user", "User")
}

/// Fail the test instead of hanging.
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

pub struct Harness {
    pub session: Arc<ConversationSession>,
    pub input: InputHandle,
    pub events: broadcast::Receiver<RuntimeEvent>,
    pub run: JoinHandle<parley::Result<()>>,
}

impl Harness {
    /// Build a session around the given collaborators and start running it.
    pub async fn start(
        config: ConversationConfig,
        chat: Arc<ScriptedChat>,
        output: Arc<dyn OutputAdapter>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self::start_with_input(config, ChannelInput::new(user()), chat, output, metrics).await
    }

    pub async fn start_with_input(
        config: ConversationConfig,
        input: ChannelInput,
        chat: Arc<ScriptedChat>,
        output: Arc<dyn OutputAdapter>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let handle = input.handle();
        let id = SessionId::new();
        let context = ConversationContext::new(config.context.clone(), &config.conversation);
        let components = SessionComponents {
            inputs: vec![Arc::new(input)],
            output,
            chat,
            tts: Arc::new(PassthroughTts::new()),
        };
        let session = Arc::new(ConversationSession::new(
            id,
            context,
            components,
            &config,
            metrics,
            CancellationToken::new(),
        ));
        let events = session.subscribe_events();
        let run = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.run().await }
        });
        Self {
            session,
            input: handle,
            events,
            run,
        }
    }

    /// Wait until the session is `Idle` with its input listening, consuming
    /// the transition that got it there.
    pub async fn ready(&mut self) {
        within("input to start listening", self.input.wait_listening()).await;
        self.transition_to(ConversationState::Idle).await;
    }

    pub async fn wait_state(&self, state: ConversationState) {
        let mut rx = self.session.subscribe_state();
        within(&format!("state {state:?}"), rx.wait_for(|s| *s == state))
            .await
            .unwrap();
    }

    /// Next transition into `to`.
    pub async fn transition_to(&mut self, to: ConversationState) -> TransitionRecord {
        let events = &mut self.events;
        within(&format!("transition to {to:?}"), async {
            loop {
                if let RuntimeEvent::Transition(record) = events.recv().await.unwrap() {
                    if record.to == to {
                        return record;
                    }
                }
            }
        })
        .await
    }

    pub async fn turn_finished(&mut self) -> TurnTimingSummary {
        let events = &mut self.events;
        within("a turn to finish", async {
            loop {
                if let RuntimeEvent::TurnFinished { summary, .. } = events.recv().await.unwrap() {
                    return summary;
                }
            }
        })
        .await
    }

    pub async fn next_event<T>(&mut self, what: &str, pick: impl Fn(RuntimeEvent) -> Option<T>) -> T {
        let events = &mut self.events;
        within(what, async {
            loop {
                if let Some(found) = pick(events.recv().await.unwrap()) {
                    return found;
                }
            }
        })
        .await
    }

    /// Stop the session and wait for `run` to return.
    pub async fn stop(self) -> Arc<ConversationSession> {
        self.session.stop();
        within("run to return", self.run).await.unwrap().unwrap();
        self.session
    }
}
