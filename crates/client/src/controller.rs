//! Chat controller — owns the view state and processes commands
//! sequentially.
//!
//! The controller runs as a tokio task. External callers communicate
//! via [`ChatHandle`], which sends [`Command`] messages over an mpsc
//! channel; lock-free state reads go through `ArcSwap`. Every command
//! becomes one or more [`Input`]s to the pure transition function, and
//! every returned effect is executed to completion (its outcome fed
//! back as another input) before the next command is taken. That
//! serialization is what makes "single request in flight" hold.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use kheti_protocol::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::audio::{AudioPipeline, Transcriber};
use crate::backend::{BackendError, ChatBackend};
use crate::transition::{transition, Effect, Input, LoadError, ViewState};

/// Commands accepted by the controller.
#[derive(Debug)]
pub enum Command {
    /// A navigation event: the route now shows this session id.
    Navigate { session_id: Option<String> },
    /// Submit typed text.
    Send { text: String },
    StartRecording,
    StopRecording,
    /// Toggle the current session's public visibility.
    SetVisibility { is_public: bool },
    /// Snapshot query, answered after all queued work settles.
    GetState { reply: oneshot::Sender<ViewState> },
    Shutdown,
}

/// Events the controller emits for the surrounding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Notice { text: String, error: bool },
    /// The collaborator callback: session list should refresh, and
    /// navigate if asked.
    SessionListChanged { session_id: String, navigate: bool },
    /// The visible route was replaced in place (no load will follow).
    RouteReplaced { session_id: String },
    MessageAppended(Message),
}

/// Handle to a running chat controller (cheap to Clone).
#[derive(Clone)]
pub struct ChatHandle {
    command_tx: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<ViewState>>,
}

impl ChatHandle {
    /// Send a command to the controller (fire-and-forget).
    pub async fn send(&self, cmd: Command) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(component = "controller", "controller channel closed, command dropped");
        }
    }

    /// Lock-free snapshot read. May lag in-flight commands; use
    /// [`ChatHandle::state`] to observe settled state.
    pub fn snapshot(&self) -> Arc<ViewState> {
        self.snapshot.load_full()
    }

    /// State after every previously sent command has been processed.
    pub async fn state(&self) -> Option<ViewState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetState { reply }).await;
        rx.await.ok()
    }
}

/// Spawn the controller task and return its handle.
pub fn spawn<B: ChatBackend>(
    backend: B,
    audio: AudioPipeline,
    viewer_id: Option<String>,
    events_tx: mpsc::Sender<UiEvent>,
) -> ChatHandle {
    let (command_tx, command_rx) = mpsc::channel(256);
    let state = ViewState::new(viewer_id);
    let snapshot = Arc::new(ArcSwap::from_pointee(state.clone()));

    tokio::spawn(controller_loop(
        backend,
        audio,
        state,
        Arc::clone(&snapshot),
        command_rx,
        events_tx,
    ));

    ChatHandle {
        command_tx,
        snapshot,
    }
}

async fn controller_loop<B: ChatBackend>(
    backend: B,
    mut audio: AudioPipeline,
    mut state: ViewState,
    snapshot: Arc<ArcSwap<ViewState>>,
    mut command_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<UiEvent>,
) {
    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            Command::Navigate { session_id } => {
                debug!(component = "controller", ?session_id, "navigate");
                apply(
                    Input::RouteChanged { session_id },
                    &backend,
                    &mut audio,
                    &mut state,
                    &snapshot,
                    &events_tx,
                )
                .await;
            }
            Command::Send { text } => {
                apply(
                    Input::SendRequested { text },
                    &backend,
                    &mut audio,
                    &mut state,
                    &snapshot,
                    &events_tx,
                )
                .await;
            }
            Command::StartRecording => {
                // Acquire the device only when the machine will accept
                // the recording.
                let input = if state.thinking() {
                    None
                } else {
                    match audio.start() {
                        Ok(()) => Some(Input::RecordingStarted),
                        Err(err) => Some(Input::RecordingFailed {
                            error: err.to_string(),
                        }),
                    }
                };
                if let Some(input) = input {
                    apply(input, &backend, &mut audio, &mut state, &snapshot, &events_tx).await;
                }
            }
            Command::StopRecording => {
                if audio.is_recording() {
                    apply(
                        Input::RecordingStopped,
                        &backend,
                        &mut audio,
                        &mut state,
                        &snapshot,
                        &events_tx,
                    )
                    .await;
                }
            }
            Command::SetVisibility { is_public } => {
                // Only a durable session the viewer controls can change
                // visibility.
                let target = state
                    .session_id
                    .clone()
                    .filter(|id| !kheti_protocol::is_local_only(id));
                let Some(session_id) = target else {
                    let _ = events_tx
                        .send(UiEvent::Notice {
                            text: "No saved chat to share.".to_string(),
                            error: true,
                        })
                        .await;
                    continue;
                };
                let event = match backend.set_visibility(&session_id, is_public).await {
                    Ok(()) => UiEvent::Notice {
                        text: if is_public {
                            "Chat is now public.".to_string()
                        } else {
                            "Chat is now private.".to_string()
                        },
                        error: false,
                    },
                    Err(err) => {
                        warn!(component = "controller", session_id = %session_id, error = %err, "visibility update failed");
                        UiEvent::Notice {
                            text: "Failed to update sharing. Please try again.".to_string(),
                            error: true,
                        }
                    }
                };
                let _ = events_tx.send(event).await;
            }
            Command::GetState { reply } => {
                let _ = reply.send(state.clone());
            }
            Command::Shutdown => break,
        }
    }

    audio.abort();
    info!(component = "controller", "controller stopped");
}

/// Run one input through the transition function, then execute the
/// resulting effects, feeding their outcomes back in as further inputs
/// until the queue drains.
async fn apply<B: ChatBackend>(
    input: Input,
    backend: &B,
    audio: &mut AudioPipeline,
    state: &mut ViewState,
    snapshot: &Arc<ArcSwap<ViewState>>,
    events_tx: &mpsc::Sender<UiEvent>,
) {
    let mut queue = VecDeque::from([input]);

    while let Some(input) = queue.pop_front() {
        let before = state.transcript.len();
        let (next, effects) = transition(state.clone(), input, &now_timestamp());
        *state = next;

        if state.transcript.len() > before {
            for message in &state.transcript[before..] {
                let _ = events_tx
                    .send(UiEvent::MessageAppended(message.clone()))
                    .await;
            }
        }
        snapshot.store(Arc::new(state.clone()));

        for effect in effects {
            if let Some(followup) = execute(effect, backend, audio, events_tx).await {
                queue.push_back(followup);
            }
        }
    }
}

/// Execute one effect. IO outcomes come back as inputs; UI effects
/// are forwarded as events.
async fn execute<B: ChatBackend>(
    effect: Effect,
    backend: &B,
    audio: &mut AudioPipeline,
    events_tx: &mpsc::Sender<UiEvent>,
) -> Option<Input> {
    match effect {
        Effect::FetchSession { session_id } => {
            match backend.fetch_session(&session_id).await {
                Ok(envelope) => Some(Input::LoadSucceeded {
                    session: envelope.session,
                    messages: envelope.messages,
                }),
                Err(err) => {
                    warn!(component = "controller", session_id = %session_id, error = %err, "session load failed");
                    Some(Input::LoadFailed(load_error(err)))
                }
            }
        }
        Effect::Fork { session_id } => match backend.fork_session(&session_id).await {
            Ok(new_id) => {
                info!(component = "controller", from = %session_id, to = %new_id, "session forked");
                Some(Input::ForkSucceeded { session_id: new_id })
            }
            Err(err) => {
                warn!(component = "controller", session_id = %session_id, error = %err, "fork failed");
                Some(Input::ForkFailed {
                    error: err.to_string(),
                })
            }
        },
        Effect::PostChat { text, session_id } => {
            match backend.send_chat(&text, session_id.as_deref()).await {
                Ok(resp) => Some(Input::ChatSucceeded {
                    session_id: resp.session_id,
                    output: resp.output,
                }),
                Err(err) => {
                    warn!(component = "controller", error = %err, "chat send failed");
                    Some(Input::ChatFailed {
                        error: err.to_string(),
                    })
                }
            }
        }
        Effect::Transcribe => Some(run_transcription(backend, audio).await),
        Effect::ReplaceRoute { session_id } => {
            let _ = events_tx.send(UiEvent::RouteReplaced { session_id }).await;
            None
        }
        Effect::NotifySessionList {
            session_id,
            navigate,
        } => {
            let _ = events_tx
                .send(UiEvent::SessionListChanged {
                    session_id,
                    navigate,
                })
                .await;
            None
        }
        Effect::Notice(notice) => {
            let _ = events_tx
                .send(UiEvent::Notice {
                    text: notice.text().to_string(),
                    error: notice.is_error(),
                })
                .await;
            None
        }
    }
}

async fn run_transcription<B: ChatBackend>(backend: &B, audio: &mut AudioPipeline) -> Input {
    let recorded = match audio.stop() {
        Ok(bytes) => bytes,
        Err(err) => {
            return Input::TranscriptionFailed {
                error: err.to_string(),
            }
        }
    };

    match &mut audio.transcriber {
        Transcriber::Server => match backend.transcribe(recorded).await {
            Ok(text) => Input::TranscriptionSucceeded { text },
            Err(err) => Input::TranscriptionFailed {
                error: err.to_string(),
            },
        },
        Transcriber::Local(recognizer) => match recognizer.recognize(&recorded) {
            Ok(text) => Input::TranscriptionSucceeded { text },
            Err(err) => Input::TranscriptionFailed {
                error: err.to_string(),
            },
        },
        Transcriber::Unavailable => Input::TranscriptionFailed {
            error: "no transcriber configured".to_string(),
        },
    }
}

fn load_error(err: BackendError) -> LoadError {
    match err {
        BackendError::Forbidden => LoadError::Forbidden,
        BackendError::NotFound => LoadError::NotFound,
        BackendError::Transport(detail) => LoadError::Transport(detail),
    }
}

fn now_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{secs}Z")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use kheti_protocol::api::{ChatResponse, SessionEnvelope, TranscriptEntry};
    use kheti_protocol::{MessageRole, Session};

    use crate::transition::{Access, Phase};

    #[derive(Default)]
    struct MockBackend {
        sessions: Mutex<Vec<(String, SessionEnvelope)>>,
        fork_to: Option<String>,
        fork_calls: Arc<AtomicUsize>,
        chat_fails: bool,
        chat_session_ids: Arc<Mutex<Vec<Option<String>>>>,
        transcript_text: Option<String>,
    }

    impl ChatBackend for MockBackend {
        async fn fetch_session(&self, session_id: &str) -> Result<SessionEnvelope, BackendError> {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions
                .iter()
                .find(|(id, _)| id == session_id)
                .map(|(_, envelope)| envelope.clone())
                .ok_or(BackendError::NotFound)
        }

        async fn fork_session(&self, _session_id: &str) -> Result<String, BackendError> {
            self.fork_calls.fetch_add(1, Ordering::SeqCst);
            self.fork_to
                .clone()
                .ok_or(BackendError::Transport("fork disabled".to_string()))
        }

        async fn send_chat(
            &self,
            _text: &str,
            session_id: Option<&str>,
        ) -> Result<ChatResponse, BackendError> {
            self.chat_session_ids
                .lock()
                .expect("chat lock")
                .push(session_id.map(str::to_string));
            if self.chat_fails {
                return Err(BackendError::Transport("connection refused".to_string()));
            }
            Ok(ChatResponse {
                output: Some("ok".to_string()),
                session_id: session_id.map(str::to_string),
            })
        }

        async fn transcribe(&self, _audio: bytes::Bytes) -> Result<String, BackendError> {
            self.transcript_text
                .clone()
                .ok_or(BackendError::Transport("asr disabled".to_string()))
        }

        async fn set_visibility(
            &self,
            _session_id: &str,
            _is_public: bool,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn envelope(id: &str, owner: Option<&str>, is_public: bool) -> SessionEnvelope {
        SessionEnvelope {
            session: Session {
                id: id.to_string(),
                user_id: owner.map(str::to_string),
                title: None,
                is_public,
                created_at: None,
                updated_at: None,
            },
            messages: vec![TranscriptEntry {
                role: MessageRole::User,
                content: "earlier".to_string(),
                created_at: None,
            }],
        }
    }

    fn spawn_mock(backend: MockBackend, viewer: Option<&str>) -> (ChatHandle, mpsc::Receiver<UiEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = spawn(
            backend,
            AudioPipeline::unavailable(),
            viewer.map(str::to_string),
            events_tx,
        );
        (handle, events_rx)
    }

    #[tokio::test]
    async fn navigate_loads_session() {
        let backend = MockBackend {
            sessions: Mutex::new(vec![("abc123".to_string(), envelope("abc123", Some("viewer-1"), false))]),
            ..Default::default()
        };
        let (handle, _events) = spawn_mock(backend, Some("viewer-1"));

        handle
            .send(Command::Navigate {
                session_id: Some("abc123".to_string()),
            })
            .await;

        let state = handle.state().await.expect("state");
        assert_eq!(state.phase, Phase::Ready);
        assert_eq!(state.session_id.as_deref(), Some("abc123"));
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.access, Access::Owned);
    }

    #[tokio::test]
    async fn foreign_public_send_forks_exactly_once() {
        let backend = MockBackend {
            sessions: Mutex::new(vec![("pub1".to_string(), envelope("pub1", Some("owner-1"), true))]),
            fork_to: Some("priv2".to_string()),
            ..Default::default()
        };
        let fork_calls = Arc::clone(&backend.fork_calls);
        let chat_session_ids = Arc::clone(&backend.chat_session_ids);
        let (handle, mut events) = spawn_mock(backend, Some("viewer-1"));

        handle
            .send(Command::Navigate {
                session_id: Some("pub1".to_string()),
            })
            .await;
        handle
            .send(Command::Send {
                text: "first".to_string(),
            })
            .await;
        handle
            .send(Command::Send {
                text: "second".to_string(),
            })
            .await;

        let state = handle.state().await.expect("state");
        assert_eq!(state.session_id.as_deref(), Some("priv2"));
        assert_eq!(state.access, Access::Forked);
        // loaded 1 + (user, assistant) x 2
        assert_eq!(state.transcript.len(), 5);

        // One fork, both chats posted into the forked session.
        assert_eq!(fork_calls.load(Ordering::SeqCst), 1);
        let posted = chat_session_ids.lock().expect("chat lock").clone();
        assert_eq!(
            posted,
            vec![Some("priv2".to_string()), Some("priv2".to_string())]
        );

        let mut route_replaced = false;
        let mut list_changed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                UiEvent::RouteReplaced { session_id } => {
                    assert_eq!(session_id, "priv2");
                    route_replaced = true;
                }
                UiEvent::SessionListChanged { navigate, .. } => {
                    assert!(!navigate);
                    list_changed += 1;
                }
                _ => {}
            }
        }
        assert!(route_replaced);
        assert!(list_changed >= 1);
    }

    #[tokio::test]
    async fn missing_session_resets_with_notice() {
        let (handle, mut events) = spawn_mock(MockBackend::default(), None);

        handle
            .send(Command::Navigate {
                session_id: Some("gone".to_string()),
            })
            .await;

        let state = handle.state().await.expect("state");
        assert!(state.session_id.is_none());
        assert!(state.transcript.is_empty());
        assert!(state.suggestions);

        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Notice { text, error } = event {
                assert_eq!(text, "Chat not found.");
                assert!(error);
                saw_notice = true;
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn failed_send_appends_apology_and_recovers() {
        let backend = MockBackend {
            chat_fails: true,
            ..Default::default()
        };
        let (handle, mut events) = spawn_mock(backend, None);

        handle
            .send(Command::Send {
                text: "hello".to_string(),
            })
            .await;

        let state = handle.state().await.expect("state");
        assert_eq!(state.phase, Phase::Ready);
        assert_eq!(state.transcript.len(), 2);
        assert_eq!(state.transcript[0].content, "hello");
        assert_eq!(
            state.transcript[1].content,
            crate::transition::SEND_FAILURE_MESSAGE
        );

        let mut appended = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UiEvent::MessageAppended(_)) {
                appended += 1;
            }
        }
        assert_eq!(appended, 2);
    }

    #[tokio::test]
    async fn get_state_observes_settled_state() {
        let (handle, _events) = spawn_mock(MockBackend::default(), None);

        handle
            .send(Command::Send {
                text: "hi".to_string(),
            })
            .await;

        // The reply only arrives after the send fully resolved.
        let state = handle.state().await.expect("state");
        assert_eq!(state.phase, Phase::Ready);

        // Snapshot agrees once settled.
        assert_eq!(handle.snapshot().transcript.len(), state.transcript.len());
    }

    #[tokio::test]
    async fn visibility_requires_a_durable_session() {
        let backend = MockBackend {
            sessions: Mutex::new(vec![("abc123".to_string(), envelope("abc123", Some("viewer-1"), false))]),
            ..Default::default()
        };
        let (handle, mut events) = spawn_mock(backend, Some("viewer-1"));

        // Nothing loaded yet: rejected.
        handle.send(Command::SetVisibility { is_public: true }).await;
        let _ = handle.state().await;
        let rejected = drain_notices(&mut events);
        assert_eq!(rejected, vec!["No saved chat to share.".to_string()]);

        // With a durable session the update goes through.
        handle
            .send(Command::Navigate {
                session_id: Some("abc123".to_string()),
            })
            .await;
        handle.send(Command::SetVisibility { is_public: true }).await;
        let _ = handle.state().await;
        let accepted = drain_notices(&mut events);
        assert_eq!(accepted, vec!["Chat is now public.".to_string()]);
    }

    fn drain_notices(events: &mut mpsc::Receiver<UiEvent>) -> Vec<String> {
        let mut notices = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Notice { text, .. } = event {
                notices.push(text);
            }
        }
        notices
    }

    #[tokio::test]
    async fn recording_without_device_reports_mic_failure() {
        let (handle, mut events) = spawn_mock(MockBackend::default(), None);

        handle.send(Command::StartRecording).await;
        let state = handle.state().await.expect("state");
        assert_eq!(state.audio, crate::transition::AudioPhase::Idle);

        let mut saw_mic_notice = false;
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Notice { text, .. } = event {
                if text == "Failed to access microphone" {
                    saw_mic_notice = true;
                }
            }
        }
        assert!(saw_mic_notice);
    }
}
