//! Pure state transition function for the chat view.
//!
//! All session-identity and dispatch logic lives here as a pure,
//! synchronous function: `transition(state, input) -> (state, effects)`.
//! No IO, no async, no locking — fully unit-testable. The controller
//! actor executes the returned effects and feeds their outcomes back in
//! as further inputs.

use kheti_protocol::{is_local_only, Message, MessageRole, Session, TranscriptEntry};

/// Assistant text used when a chat response carries no output.
pub const EMPTY_OUTPUT_FALLBACK: &str = "I'm sorry, I couldn't process your request.";

/// Synthetic transcript entry appended when a send fails.
pub const SEND_FAILURE_MESSAGE: &str =
    "I'm sorry, I'm having trouble connecting right now. Please try again later.";

/// Synthetic transcript entry appended when a fork fails and the send
/// is blocked.
pub const FORK_FAILURE_MESSAGE: &str =
    "I'm sorry, I couldn't create your copy of this chat. Your message was not sent.";

// ---------------------------------------------------------------------------
// Phase — what the controller is doing right now
// ---------------------------------------------------------------------------

/// One explicit machine instead of independent `loading`/`thinking`
/// flags. `Forking` and `Sending` together form the "thinking" gate;
/// `Loading` additionally gates sends so the two writers of session
/// identity never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No request in flight; input enabled.
    Ready,
    /// Session fetch in flight for the routed id.
    Loading,
    /// Fork request in flight; the triggering text is parked until the
    /// new id is known.
    Forking,
    /// Chat request in flight.
    Sending,
}

/// How the viewer relates to the loaded session instance. Reset on
/// every resolved id change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Owned, private, or local-only: mutate in place.
    Owned,
    /// Public and not ours: must be forked before the first send.
    ForeignPublic,
    /// Was foreign, already forked during this loaded instance.
    Forked,
}

/// Audio pipeline sub-state: idle → recording → transcribing → idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPhase {
    Idle,
    Recording,
    Transcribing,
}

// ---------------------------------------------------------------------------
// LoadGuard — one-shot reload suppression
// ---------------------------------------------------------------------------

/// Armed by any local mutation that already knows the destination
/// content before it updates the visible route (post-fork, post
/// anonymous-session-mint). The next route event consumes it,
/// regardless of cause. If armed twice before consumption, only the
/// latest arming matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadGuard {
    armed: bool,
}

impl LoadGuard {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Read-and-clear.
    pub fn consume(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

// ---------------------------------------------------------------------------
// ViewState — the controller's whole world
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ViewState {
    pub phase: Phase,
    pub audio: AudioPhase,
    pub guard: LoadGuard,
    /// Viewer identity from the auth token, if signed in.
    pub viewer_id: Option<String>,
    pub session_id: Option<String>,
    pub access: Access,
    /// Append-only except on full reset or a fresh load.
    pub transcript: Vec<Message>,
    /// Whether the suggestion prompts are shown.
    pub suggestions: bool,
    /// Text parked while a fork is in flight.
    pending_text: Option<String>,
    /// Client-local message id counter.
    msg_seq: u64,
}

impl ViewState {
    pub fn new(viewer_id: Option<String>) -> Self {
        Self {
            phase: Phase::Ready,
            audio: AudioPhase::Idle,
            guard: LoadGuard::default(),
            viewer_id,
            session_id: None,
            access: Access::Owned,
            transcript: Vec::new(),
            suggestions: true,
            pending_text: None,
            msg_seq: 0,
        }
    }

    /// The send-concurrency gate: true while a fork or chat request is
    /// in flight.
    pub fn thinking(&self) -> bool {
        matches!(self.phase, Phase::Forking | Phase::Sending)
    }

    fn push_message(&mut self, role: MessageRole, content: String, now: &str) {
        self.msg_seq += 1;
        self.transcript.push(Message {
            id: format!("msg-{}", self.msg_seq),
            role,
            content,
            timestamp: now.to_string(),
        });
    }

    /// The Reset path: empty transcript, suggestions back, identity and
    /// per-instance classification cleared.
    fn reset_view(&mut self) {
        self.transcript.clear();
        self.suggestions = true;
        self.session_id = None;
        self.access = Access::Owned;
        self.pending_text = None;
        self.phase = Phase::Ready;
    }
}

// ---------------------------------------------------------------------------
// Input — one variant per externally observable event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// Navigation event carrying the routed session id, if any.
    RouteChanged { session_id: Option<String> },
    LoadSucceeded {
        session: Session,
        messages: Vec<TranscriptEntry>,
    },
    LoadFailed(LoadError),
    /// Typed text entering the dispatch pipeline.
    SendRequested { text: String },
    ForkSucceeded { session_id: String },
    ForkFailed { error: String },
    ChatSucceeded {
        session_id: Option<String>,
        output: Option<String>,
    },
    ChatFailed { error: String },
    RecordingStarted,
    RecordingFailed { error: String },
    RecordingStopped,
    /// One finalized transcript from the capture pipeline; enters the
    /// dispatch pipeline exactly as if typed.
    TranscriptionSucceeded { text: String },
    TranscriptionFailed { error: String },
}

/// Load failure classification. Only server-confirmed absence of
/// access (`Forbidden`, `NotFound`) resets the view; `Transport`
/// preserves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    Forbidden,
    NotFound,
    Transport(String),
}

// ---------------------------------------------------------------------------
// Effects — describe IO to be executed by the controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch transcript and metadata for a durable session id.
    FetchSession { session_id: String },
    /// Clone a foreign public session before the first send.
    Fork { session_id: String },
    /// Post a message to the chat endpoint.
    PostChat {
        text: String,
        session_id: Option<String>,
    },
    /// Submit the captured audio for transcription.
    Transcribe,
    /// Update the visible route in place; no navigation event is
    /// expected to follow from us (the guard is already armed).
    ReplaceRoute { session_id: String },
    /// `onSessionChange(session_id, navigate)` collaborator callback.
    NotifySessionList {
        session_id: String,
        navigate: bool,
    },
    /// User-visible transient notice.
    Notice(Notice),
}

/// Transient user-visible notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    PrivateSession,
    SessionNotFound,
    LoadFailed,
    SendFailed,
    ForkFailed,
    MicrophoneUnavailable,
    Recording,
    Transcribing,
    Transcribed,
    TranscriptionFailed,
}

impl Notice {
    pub fn text(&self) -> &'static str {
        match self {
            Notice::PrivateSession => "This chat is private. Please sign in to view.",
            Notice::SessionNotFound => "Chat not found.",
            Notice::LoadFailed => "Failed to load chat. Please check your connection.",
            Notice::SendFailed => "Failed to send message. Please check your connection.",
            Notice::ForkFailed => "Couldn't create your copy of this chat. Message not sent.",
            Notice::MicrophoneUnavailable => "Failed to access microphone",
            Notice::Recording => "Recording... stop to send",
            Notice::Transcribing => "Transcribing audio...",
            Notice::Transcribed => "Audio transcribed!",
            Notice::TranscriptionFailed => "Failed to transcribe audio",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            Notice::Recording | Notice::Transcribing | Notice::Transcribed
        )
    }
}

// ---------------------------------------------------------------------------
// transition() — the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input event, returns the new state
/// and a list of effects (backend calls, collaborator callbacks,
/// notices) to execute.
pub fn transition(mut state: ViewState, input: Input, now: &str) -> (ViewState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Identity resolution ---------------------------------------------
        Input::RouteChanged { session_id } => {
            // Skip path: a prior local mutation already produced this
            // navigation, so the visible state is correct as-is.
            if state.guard.consume() {
                return (state, effects);
            }

            match session_id {
                Some(id) if is_local_only(&id) => {
                    // Local-only ids are terminal: nothing to fetch.
                    state.transcript.clear();
                    state.suggestions = true;
                    state.session_id = Some(id);
                    state.access = Access::Owned;
                    state.phase = Phase::Ready;
                }
                Some(id) => {
                    state.session_id = Some(id.clone());
                    state.suggestions = false;
                    state.phase = Phase::Loading;
                    effects.push(Effect::FetchSession { session_id: id });
                }
                None => state.reset_view(),
            }
        }

        Input::LoadSucceeded { session, messages } => {
            if state.phase != Phase::Loading {
                return (state, effects);
            }
            let owned = match (&state.viewer_id, &session.user_id) {
                (Some(viewer), Some(owner)) => viewer == owner,
                // An absent viewer id never counts as the owner.
                _ => false,
            };
            state.access = if session.is_public && !owned {
                Access::ForeignPublic
            } else {
                Access::Owned
            };
            let sid = session.id.clone();
            state.session_id = Some(session.id);
            state.transcript = messages
                .into_iter()
                .enumerate()
                .map(|(index, entry)| Message {
                    id: format!("{sid}-{index}"),
                    role: entry.role,
                    content: entry.content,
                    timestamp: entry.created_at.unwrap_or_else(|| now.to_string()),
                })
                .collect();
            state.suggestions = state.transcript.is_empty();
            state.phase = Phase::Ready;
        }

        Input::LoadFailed(error) => {
            if state.phase != Phase::Loading {
                return (state, effects);
            }
            match error {
                LoadError::Forbidden => {
                    state.reset_view();
                    effects.push(Effect::Notice(Notice::PrivateSession));
                }
                LoadError::NotFound => {
                    state.reset_view();
                    effects.push(Effect::Notice(Notice::SessionNotFound));
                }
                // Deliberate asymmetry: only server-confirmed absence
                // of access resets the view. Transport failure keeps it.
                LoadError::Transport(_) => {
                    state.phase = Phase::Ready;
                    effects.push(Effect::Notice(Notice::LoadFailed));
                }
            }
        }

        // -- Dispatch --------------------------------------------------------
        Input::SendRequested { text } => {
            dispatch_send(&mut state, text, now, &mut effects);
        }

        Input::ForkSucceeded { session_id } => {
            if state.phase != Phase::Forking {
                return (state, effects);
            }
            // Adopt the new id before the send request is constructed.
            state.session_id = Some(session_id.clone());
            state.access = Access::Forked;
            state.guard.arm();
            state.phase = Phase::Sending;
            effects.push(Effect::ReplaceRoute {
                session_id: session_id.clone(),
            });
            effects.push(Effect::NotifySessionList {
                session_id: session_id.clone(),
                navigate: false,
            });
            let text = state.pending_text.take().unwrap_or_default();
            effects.push(Effect::PostChat {
                text,
                session_id: Some(session_id),
            });
        }

        Input::ForkFailed { .. } => {
            if state.phase != Phase::Forking {
                return (state, effects);
            }
            // The viewer never posts into a session they don't control:
            // drop the pending send, keep the foreign classification so
            // the next send retries the fork.
            state.pending_text = None;
            state.phase = Phase::Ready;
            state.push_message(MessageRole::Assistant, FORK_FAILURE_MESSAGE.to_string(), now);
            effects.push(Effect::Notice(Notice::ForkFailed));
        }

        Input::ChatSucceeded { session_id, output } => {
            if state.phase != Phase::Sending {
                return (state, effects);
            }
            if let Some(new_id) = session_id {
                if state.session_id.as_deref() != Some(new_id.as_str()) {
                    state.session_id = Some(new_id.clone());
                    if is_local_only(&new_id) {
                        // The route must show the minted id, but it can
                        // never be fetched — suppress the reload.
                        state.guard.arm();
                        effects.push(Effect::ReplaceRoute { session_id: new_id });
                    } else {
                        effects.push(Effect::NotifySessionList {
                            session_id: new_id,
                            navigate: false,
                        });
                    }
                } else if !is_local_only(&new_id) {
                    // Same durable id: the title may have changed
                    // server-side, refresh the list in place.
                    effects.push(Effect::NotifySessionList {
                        session_id: new_id,
                        navigate: false,
                    });
                }
            }
            let content = output
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| EMPTY_OUTPUT_FALLBACK.to_string());
            state.push_message(MessageRole::Assistant, content, now);
            state.phase = Phase::Ready;
        }

        Input::ChatFailed { .. } => {
            if state.phase != Phase::Sending {
                return (state, effects);
            }
            // Failures are additive: the optimistic user message stays.
            state.push_message(MessageRole::Assistant, SEND_FAILURE_MESSAGE.to_string(), now);
            state.phase = Phase::Ready;
            effects.push(Effect::Notice(Notice::SendFailed));
        }

        // -- Audio pipeline --------------------------------------------------
        Input::RecordingStarted => {
            if state.audio == AudioPhase::Idle && !state.thinking() {
                state.audio = AudioPhase::Recording;
                effects.push(Effect::Notice(Notice::Recording));
            }
        }

        Input::RecordingFailed { .. } => {
            state.audio = AudioPhase::Idle;
            effects.push(Effect::Notice(Notice::MicrophoneUnavailable));
        }

        Input::RecordingStopped => {
            if state.audio == AudioPhase::Recording {
                state.audio = AudioPhase::Transcribing;
                effects.push(Effect::Notice(Notice::Transcribing));
                effects.push(Effect::Transcribe);
            }
        }

        Input::TranscriptionSucceeded { text } => {
            state.audio = AudioPhase::Idle;
            effects.push(Effect::Notice(Notice::Transcribed));
            // No divergent handling downstream: transcribed text takes
            // the same path as typed text.
            dispatch_send(&mut state, text, now, &mut effects);
        }

        Input::TranscriptionFailed { .. } => {
            state.audio = AudioPhase::Idle;
            effects.push(Effect::Notice(Notice::TranscriptionFailed));
        }
    }

    (state, effects)
}

/// Shared entry point for typed and transcribed text. Appends the
/// optimistic user message before any network call, then either forks
/// first or posts directly.
fn dispatch_send(state: &mut ViewState, text: String, now: &str, effects: &mut Vec<Effect>) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }
    // Sole concurrency gate: one load/fork/send in flight per instance.
    if state.phase != Phase::Ready {
        return;
    }

    state.push_message(MessageRole::User, text.clone(), now);
    state.suggestions = false;

    match (state.access, &state.session_id) {
        (Access::ForeignPublic, Some(id)) => {
            state.pending_text = Some(text);
            state.phase = Phase::Forking;
            effects.push(Effect::Fork {
                session_id: id.clone(),
            });
        }
        _ => {
            state.phase = Phase::Sending;
            effects.push(Effect::PostChat {
                text,
                session_id: state.session_id.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
