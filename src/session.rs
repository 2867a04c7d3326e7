//! Per-connection session state and the controller that drives a chat turn.
//!
//! `SessionState::apply` is the pure part: it folds one client event into the state
//! and says whether a turn should run. `SessionController::handle_event` wraps it with
//! the completion call and reports everything through a `ServerEvent` channel, so the
//! logic never touches a socket or a renderer directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::completion::{CompletionClient, CompletionRequest};
use crate::config::{Credential, Model, RequestConfig};
use crate::constants::{CREDENTIAL_NOTICE, EMOTION_NOTICE, FOLLOW_UP_TIP};
use crate::conversation::{ConversationHistory, Message, Role};
use crate::emotion::EmotionState;
use crate::prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingCredential,
    AwaitingEmotion,
    Ready,
}

impl Phase {
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            Phase::AwaitingCredential => Some(CREDENTIAL_NOTICE),
            Phase::AwaitingEmotion => Some(EMOTION_NOTICE),
            Phase::Ready => None,
        }
    }
}

/// Events sent by the page.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Refresh,
    SetCredential { api_key: Credential },
    SelectEmotion {
        preset: String,
        #[serde(default)]
        custom: String,
    },
    SetModel { model: String },
    SetTemperature { temperature: f32 },
    Submit { text: String },
}

/// Events sent to the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Snapshot { view: SessionView },
    AssistantStarted,
    Fragment { text: String },
    AssistantFinished { tip: String },
    Error { message: String },
}

/// Everything the page needs to redraw itself. The API key is reduced to a flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub phase: Phase,
    pub notice: Option<String>,
    pub emotion: String,
    pub model: Model,
    pub temperature: f32,
    pub has_credential: bool,
    pub history: Vec<Message>,
}

/// What `SessionState::apply` decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// State updated (or nothing to do); just redraw.
    Render,
    /// The user turn has been appended; run the completion for it.
    RunTurn,
    /// The event was refused; show the message and redraw.
    Rejected(String),
}

#[derive(Debug, Default)]
pub struct SessionState {
    credential: Credential,
    emotion: EmotionState,
    history: ConversationHistory,
    config: RequestConfig,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.credential.is_empty() {
            Phase::AwaitingCredential
        } else if !self.emotion.is_set() {
            Phase::AwaitingEmotion
        } else {
            Phase::Ready
        }
    }

    pub fn emotion(&self) -> &EmotionState {
        &self.emotion
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Fold one event into the state.
    pub fn apply(&mut self, event: ClientEvent) -> Step {
        match event {
            ClientEvent::Refresh => Step::Render,
            ClientEvent::SetCredential { api_key } => {
                self.credential = api_key;
                Step::Render
            }
            ClientEvent::SelectEmotion { preset, custom } => {
                if self.emotion.select(&preset, &custom) {
                    debug!(emotion = self.emotion.label(), "Emotion updated");
                }
                Step::Render
            }
            ClientEvent::SetModel { model } => match self.config.set_model(&model) {
                Ok(()) => Step::Render,
                Err(e) => Step::Rejected(e.to_string()),
            },
            ClientEvent::SetTemperature { temperature } => {
                match self.config.set_temperature(temperature) {
                    Ok(()) => Step::Render,
                    Err(e) => Step::Rejected(e.to_string()),
                }
            }
            ClientEvent::Submit { text } => {
                if self.phase() != Phase::Ready || text.trim().is_empty() {
                    return Step::Render;
                }
                self.history.append(Role::User, text);
                Step::RunTurn
            }
        }
    }

    /// Messages for the completion request of the current turn.
    pub fn outbound_messages(&self) -> Vec<Message> {
        prompt::build(self.emotion.label(), &self.history)
    }

    pub fn view(&self) -> SessionView {
        let phase = self.phase();
        SessionView {
            phase,
            notice: phase.notice().map(str::to_string),
            emotion: self.emotion.label().to_string(),
            model: self.config.model(),
            temperature: self.config.temperature(),
            has_credential: !self.credential.is_empty(),
            history: self.history.all().to_vec(),
        }
    }

    fn record_reply(&mut self, reply: String) {
        self.history.append(Role::Assistant, reply);
    }
}

/// Owns one session and the client used for its turns.
pub struct SessionController {
    state: SessionState,
    client: Arc<dyn CompletionClient>,
}

impl SessionController {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            state: SessionState::new(),
            client,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run one interaction cycle. Always ends with a snapshot of the full state.
    ///
    /// The only error returned is a closed channel; completion failures become
    /// `ServerEvent::Error` and leave the session usable.
    pub async fn handle_event(
        &mut self,
        event: ClientEvent,
        tx: &mpsc::Sender<ServerEvent>,
    ) -> Result<()> {
        match self.state.apply(event) {
            Step::Render => {}
            Step::Rejected(message) => {
                warn!(%message, "Event rejected");
                send(tx, ServerEvent::Error { message }).await?;
            }
            Step::RunTurn => {
                // Redraw first so the new user turn shows while the reply streams.
                send(tx, ServerEvent::Snapshot { view: self.state.view() }).await?;
                self.run_turn(tx).await?;
            }
        }
        send(tx, ServerEvent::Snapshot { view: self.state.view() }).await
    }

    #[instrument(skip_all, fields(turn = self.state.history.len()))]
    async fn run_turn(&mut self, tx: &mpsc::Sender<ServerEvent>) -> Result<()> {
        let request = CompletionRequest {
            messages: self.state.outbound_messages(),
            model: self.state.config.model(),
            temperature: self.state.config.temperature(),
        };
        debug!(messages = request.messages.len(), "Prompt assembled");

        let mut stream = match self.client.complete(&self.state.credential, request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Completion request failed");
                return send(tx, ServerEvent::Error { message: e.to_string() }).await;
            }
        };

        send(tx, ServerEvent::AssistantStarted).await?;
        let mut reply = String::new();
        let mut fragments = 0usize;
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(text) => {
                    fragments += 1;
                    reply.push_str(&text);
                    send(tx, ServerEvent::Fragment { text }).await?;
                }
                Err(e) => {
                    // The partial reply is dropped; only the user turn stays recorded.
                    warn!(error = %e, fragments, "Completion stream failed");
                    return send(tx, ServerEvent::Error { message: e.to_string() }).await;
                }
            }
        }

        info!(fragments, chars = reply.chars().count(), "Assistant reply complete");
        self.state.record_reply(reply);
        send(
            tx,
            ServerEvent::AssistantFinished {
                tip: FOLLOW_UP_TIP.to_string(),
            },
        )
        .await
    }
}

async fn send(tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> Result<()> {
    tx.send(event).await.context("Session event channel closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionError, FragmentStream};
    use crate::constants::NONE_SELECTED;
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Script {
        Reply(Vec<&'static str>),
        FailUpfront,
        FailMidStream,
    }

    struct ScriptedClient {
        script: Script,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            _credential: &Credential,
            request: CompletionRequest,
        ) -> Result<FragmentStream, CompletionError> {
            self.seen.lock().unwrap().push(request);
            match &self.script {
                Script::Reply(parts) => {
                    let items: Vec<Result<String, CompletionError>> =
                        parts.iter().map(|p| Ok(p.to_string())).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Script::FailUpfront => Err(CompletionError::Unauthorized("bad key".into())),
                Script::FailMidStream => {
                    let items: Vec<Result<String, CompletionError>> = vec![
                        Ok("partial".to_string()),
                        Err(CompletionError::MalformedStream("cut off".into())),
                    ];
                    Ok(Box::pin(futures::stream::iter(items)))
                }
            }
        }
    }

    fn ready_state() -> SessionState {
        let mut state = SessionState::new();
        state.apply(ClientEvent::SetCredential {
            api_key: Credential::new("sk-test"),
        });
        state.apply(ClientEvent::SelectEmotion {
            preset: "sadness".into(),
            custom: String::new(),
        });
        state
    }

    async fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_phase_derivation() {
        let mut state = SessionState::new();
        assert_eq!(state.phase(), Phase::AwaitingCredential);

        // Emotion alone does not unlock chat.
        state.apply(ClientEvent::SelectEmotion {
            preset: "joy".into(),
            custom: String::new(),
        });
        assert_eq!(state.phase(), Phase::AwaitingCredential);

        state.apply(ClientEvent::SetCredential {
            api_key: Credential::new("sk-test"),
        });
        assert_eq!(state.phase(), Phase::Ready);

        state.apply(ClientEvent::SetCredential {
            api_key: Credential::new(""),
        });
        assert_eq!(state.phase(), Phase::AwaitingCredential);
    }

    #[test]
    fn test_awaiting_emotion_notice() {
        let mut state = SessionState::new();
        state.apply(ClientEvent::SetCredential {
            api_key: Credential::new("sk-test"),
        });
        let view = state.view();
        assert_eq!(view.phase, Phase::AwaitingEmotion);
        assert_eq!(view.notice.as_deref(), Some(EMOTION_NOTICE));
        assert!(view.has_credential);
    }

    #[test]
    fn test_emotion_sticky_across_cycles() {
        let mut state = ready_state();
        state.apply(ClientEvent::SelectEmotion {
            preset: NONE_SELECTED.into(),
            custom: "  ".into(),
        });
        assert_eq!(state.emotion().label(), "sadness");
        assert_eq!(state.phase(), Phase::Ready);
    }

    #[test]
    fn test_submit_gated_outside_ready() {
        let mut state = SessionState::new();
        let step = state.apply(ClientEvent::Submit { text: "hello".into() });
        assert_eq!(step, Step::Render);
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_blank_submit_ignored() {
        let mut state = ready_state();
        assert_eq!(state.apply(ClientEvent::Submit { text: "  \n".into() }), Step::Render);
        assert!(state.history().is_empty());
    }

    #[test]
    fn test_submit_appends_user_turn_verbatim() {
        let mut state = ready_state();
        let step = state.apply(ClientEvent::Submit { text: " hi ".into() });
        assert_eq!(step, Step::RunTurn);
        assert_eq!(state.history().all(), &[Message::user(" hi ")]);
    }

    #[test]
    fn test_config_events() {
        let mut state = SessionState::new();
        assert_eq!(
            state.apply(ClientEvent::SetModel { model: "gpt-3.5-turbo".into() }),
            Step::Render
        );
        assert_eq!(state.config().model(), Model::Gpt35Turbo);
        assert!(matches!(
            state.apply(ClientEvent::SetTemperature { temperature: 2.0 }),
            Step::Rejected(_)
        ));
        assert_eq!(state.config().temperature(), 0.8);
        assert!(matches!(
            state.apply(ClientEvent::SetModel { model: "gpt-2".into() }),
            Step::Rejected(_)
        ));
        assert_eq!(state.config().model(), Model::Gpt35Turbo);
    }

    #[test]
    fn test_view_never_contains_key() {
        let state = ready_state();
        let json = serde_json::to_string(&state.view()).unwrap();
        assert!(!json.contains("sk-test"));
        assert!(json.contains("\"has_credential\":true"));
        assert!(json.contains("\"phase\":\"ready\""));
    }

    #[test]
    fn test_client_event_parsing() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"select_emotion","preset":"worry"}"#).unwrap();
        assert!(matches!(
            event,
            ClientEvent::SelectEmotion { ref preset, ref custom }
                if preset == "worry" && custom.is_empty()
        ));

        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"set_credential","api_key":"sk-abc"}"#).unwrap();
        assert!(!format!("{:?}", event).contains("sk-abc"));

        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"set_temperature","temperature":0.5}"#).unwrap();
        assert!(matches!(event, ClientEvent::SetTemperature { temperature } if temperature == 0.5));
    }

    #[tokio::test]
    async fn test_successful_turn_appends_two_messages() {
        let client = ScriptedClient::new(Script::Reply(vec!["It sounds ", "heavy today."]));
        let mut controller = SessionController::new(client.clone());
        controller.state = ready_state();
        let (tx, mut rx) = mpsc::channel(64);

        controller
            .handle_event(ClientEvent::Submit { text: "오늘 너무 지쳤어요".into() }, &tx)
            .await
            .unwrap();

        let history = controller.state().history().all();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], Message::user("오늘 너무 지쳤어요"));
        assert_eq!(history[1], Message::assistant("It sounds heavy today."));

        let seen = client.seen.lock().unwrap();
        let messages = &seen[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role(), Role::System);
        assert!(messages[0].content().contains("\"sadness\""));
        assert_eq!(messages[1], Message::user("[current emotion: sadness]"));
        assert_eq!(messages[2], Message::user("오늘 너무 지쳤어요"));
        assert_eq!(seen[0].model, Model::Gpt4oMini);
        assert_eq!(seen[0].temperature, 0.8);
        drop(seen);

        let events = drain(&mut rx).await;
        let fragments: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Fragment { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec!["It sounds ", "heavy today."]);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::AssistantFinished { .. })));
        match events.last() {
            Some(ServerEvent::Snapshot { view }) => assert_eq!(view.history.len(), 2),
            other => panic!("expected final snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_request_keeps_only_user_turn() {
        let client = ScriptedClient::new(Script::FailUpfront);
        let mut controller = SessionController::new(client);
        controller.state = ready_state();
        let (tx, mut rx) = mpsc::channel(64);

        controller
            .handle_event(ClientEvent::Submit { text: "hello".into() }, &tx)
            .await
            .unwrap();

        assert_eq!(controller.state().history().all(), &[Message::user("hello")]);
        assert_eq!(controller.state().emotion().label(), "sadness");
        let events = drain(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { message } if message.contains("bad key"))));
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::AssistantFinished { .. })));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_drops_partial_reply() {
        let client = ScriptedClient::new(Script::FailMidStream);
        let mut controller = SessionController::new(client);
        controller.state = ready_state();
        let (tx, mut rx) = mpsc::channel(64);

        controller
            .handle_event(ClientEvent::Submit { text: "hello".into() }, &tx)
            .await
            .unwrap();

        assert_eq!(controller.state().history().len(), 1);
        let events = drain(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Fragment { text } if text == "partial")));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_next_turn_after_failure_needs_fresh_input() {
        let client = ScriptedClient::new(Script::FailUpfront);
        let mut controller = SessionController::new(client.clone());
        controller.state = ready_state();
        let (tx, _rx) = mpsc::channel(64);

        controller
            .handle_event(ClientEvent::Submit { text: "first".into() }, &tx)
            .await
            .unwrap();
        controller.handle_event(ClientEvent::Refresh, &tx).await.unwrap();
        assert_eq!(client.seen.lock().unwrap().len(), 1);

        controller
            .handle_event(ClientEvent::Submit { text: "second".into() }, &tx)
            .await
            .unwrap();
        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let tail: Vec<&str> = seen[1].messages[2..].iter().map(Message::content).collect();
        assert_eq!(tail, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_every_cycle_ends_with_snapshot() {
        let client = ScriptedClient::new(Script::Reply(vec![]));
        let mut controller = SessionController::new(client);
        let (tx, mut rx) = mpsc::channel(64);

        controller
            .handle_event(ClientEvent::SetModel { model: "nope".into() }, &tx)
            .await
            .unwrap();
        let events = drain(&mut rx).await;
        assert!(matches!(events[0], ServerEvent::Error { .. }));
        match &events[1] {
            ServerEvent::Snapshot { view } => {
                assert_eq!(view.phase, Phase::AwaitingCredential);
                assert_eq!(view.notice.as_deref(), Some(CREDENTIAL_NOTICE));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}
