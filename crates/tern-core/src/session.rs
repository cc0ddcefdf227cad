//! Conversation driver.
//!
//! A session owns the message history, the tool registry and the model
//! client, and drives the agentic loop: stream a turn, execute the tool calls
//! it requested, fold the paired function responses into the next request,
//! and repeat until the model stops asking for tools. The loop is bounded by
//! `MAX_TURNS` per user message. A quota failure (HTTP 429) switches the
//! session to the configured fallback model for the rest of its lifetime.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ApprovalMode, SessionConfig};
use crate::confirmation::{ConfirmationHandler, ConfirmationOutcome, PendingConfirmation};
use crate::core_types::{Message, Part, Role, ToolCallRequest, ToolResult};
use crate::errors::CoreError;
use crate::llm::ModelClient;
use crate::tools::dispatch::{dispatch_tool_call, execute_resolved_call, DispatchOutcome};
use crate::tools::{
    discover_mcp_tools, ReadFileTool, ShellTool, ToolRegistry, WebFetchTool, WriteFileTool,
};
use crate::trace::{LogTraceHandler, TraceHandler};
use crate::turn::{Turn, TurnEvent};

/// Hard bound on model turns driven by one user message.
pub const MAX_TURNS: usize = 100;

const NEXT_SPEAKER_PROMPT: &str = "Considering the conversation so far, decide who should speak \
     next. Answer ONLY with JSON of the form {\"next_speaker\": \"user\"} or \
     {\"next_speaker\": \"model\"}. Answer \"model\" only if your last message clearly states an \
     action you are about to take.";

/// Event emitted by the session while it drives the loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk of visible model text.
    Content(String),
    /// A chunk of model reasoning.
    Thought(String),
    /// The model requested a tool invocation.
    ToolCallRequest(ToolCallRequest),
    /// A tool call resolved to a result.
    ToolResult { call_id: String, result: ToolResult },
    /// A tool call is parked awaiting an external confirmation; the loop has
    /// stopped and resumes through `resolve_confirmation`.
    AwaitingConfirmation(PendingConfirmation),
    /// Out-of-band information: a model fallback, the turn bound, etc.
    Notice(String),
    /// The loop finished for this user message.
    Finished,
}

pub struct Session {
    client: Arc<dyn ModelClient>,
    config: SessionConfig,
    registry: ToolRegistry,
    history: Vec<Message>,
    active_model: String,
    started: bool,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    trace: Arc<dyn TraceHandler>,
    pending_confirmation: Option<PendingConfirmation>,
    /// Requests from the parked call's batch that have not been dispatched
    /// yet; every one of them still owes the model a response.
    deferred_requests: Vec<ToolCallRequest>,
    /// Function responses waiting to be folded into the next model request,
    /// e.g. after a parked call was resolved.
    buffered_responses: Vec<Part>,
}

impl Session {
    pub fn new(client: Arc<dyn ModelClient>, config: SessionConfig) -> Self {
        let active_model = config.model.clone();
        Self {
            client,
            config,
            registry: ToolRegistry::new(),
            history: Vec::new(),
            active_model,
            started: false,
            confirmation_handler: None,
            trace: Arc::new(LogTraceHandler),
            pending_confirmation: None,
            deferred_requests: Vec::new(),
            buffered_responses: Vec::new(),
        }
    }

    /// Resolve confirmations inline through this handler instead of parking
    /// the call on the session.
    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn with_trace_handler(mut self, trace: Arc<dyn TraceHandler>) -> Self {
        self.trace = trace;
        self
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Model currently used for requests; changes once on quota fallback.
    pub fn active_model(&self) -> &str {
        &self.active_model
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn pending_confirmation(&self) -> Option<&PendingConfirmation> {
        self.pending_confirmation.as_ref()
    }

    /// Initialize the session: register built-in tools, connect configured
    /// MCP servers, and seed the history with the environment preamble.
    /// Must be called exactly once, before the first `send_message`.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        if self.started {
            return Err(CoreError::Initialization(
                "session already started".to_string(),
            ));
        }

        let root = self.config.workspace_root.clone();
        self.registry.register_tool(Arc::new(ReadFileTool::new(&root)));
        self.registry.register_tool(Arc::new(WriteFileTool::new(&root)));
        self.registry.register_tool(Arc::new(ShellTool::new(&root)));
        self.registry.register_tool(Arc::new(WebFetchTool::new()));

        if !self.config.mcp_servers.is_empty() {
            let discovered =
                discover_mcp_tools(&mut self.registry, &self.config.mcp_servers).await;
            log::info!("discovered {} remote tools", discovered);
        }

        self.history.push(Message::user_text(self.environment_preamble()));
        self.history
            .push(Message::model_text("Got it. Thanks for the context!"));
        self.started = true;
        Ok(())
    }

    fn environment_preamble(&self) -> String {
        let mut preamble = format!(
            "This is the start of our session. Context for this environment:\n\
             Today's date is {}.\n\
             Operating system: {}\n\
             Working directory: {}\n",
            chrono::Local::now().format("%A, %B %e, %Y"),
            std::env::consts::OS,
            self.config.workspace_root.display(),
        );
        if let Some(extra) = &self.config.extra_context {
            preamble.push('\n');
            preamble.push_str(extra);
        }
        preamble
    }

    /// Drive the loop for one user message. Events stream to `events`; the
    /// call returns when the model yields, a confirmation parks the loop, the
    /// turn bound is hit, or an unrecoverable error occurs.
    pub async fn send_message(
        &mut self,
        text: &str,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        if !self.started {
            return Err(CoreError::Initialization(
                "send_message called before start".to_string(),
            ));
        }
        if self.pending_confirmation.is_some() {
            return Err(CoreError::Validation(
                "a tool call is awaiting confirmation".to_string(),
            ));
        }

        let mut parts = std::mem::take(&mut self.buffered_responses);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        if parts.is_empty() {
            return Err(CoreError::Validation("empty message".to_string()));
        }
        self.history.push(Message {
            role: Role::User,
            parts,
        });

        let prompt_id = Uuid::new_v4().to_string();
        for turn_index in 0..MAX_TURNS {
            let turn = self
                .run_turn(&format!("{}#{}", prompt_id, turn_index), events, cancel)
                .await?;
            self.trace.on_turn_complete(turn_index);

            if let Some(message) = turn.model_message() {
                self.history.push(message);
            }

            let requests = turn.pending_tool_calls().to_vec();
            if requests.is_empty() {
                if self.next_speaker_is_model(cancel).await {
                    self.history.push(Message::user_text("Please continue."));
                    continue;
                }
                let _ = events.send(SessionEvent::Finished).await;
                return Ok(());
            }

            let Some(responses) = self
                .dispatch_batch(requests, Vec::new(), events, cancel)
                .await
            else {
                return Ok(());
            };

            self.history.push(Message {
                role: Role::User,
                parts: responses,
            });
        }

        log::warn!("stopping after {} turns for one user message", MAX_TURNS);
        let _ = events
            .send(SessionEvent::Notice(format!(
                "Stopped after reaching the limit of {} turns.",
                MAX_TURNS
            )))
            .await;
        let _ = events.send(SessionEvent::Finished).await;
        Ok(())
    }

    /// Resolve the parked confirmation, dispatch the rest of its batch, and
    /// resume the loop. Every request from the parked turn still gets exactly
    /// one response before the next model call.
    pub async fn resolve_confirmation(
        &mut self,
        outcome: ConfirmationOutcome,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let Some(pending) = self.pending_confirmation.take() else {
            return Err(CoreError::Validation(
                "no confirmation is pending".to_string(),
            ));
        };

        let result = execute_resolved_call(&self.registry, &pending, outcome, cancel).await;
        self.trace.on_tool_result(&pending.request.call_id, &result);
        let _ = events
            .send(SessionEvent::ToolResult {
                call_id: pending.request.call_id.clone(),
                result: result.clone(),
            })
            .await;
        let mut responses = std::mem::take(&mut self.buffered_responses);
        responses
            .push(result.into_function_response(&pending.request.call_id, &pending.request.name));

        // A later request in the batch may park again; the remainder stays
        // queued with it.
        let deferred = std::mem::take(&mut self.deferred_requests);
        let Some(responses) = self.dispatch_batch(deferred, responses, events, cancel).await
        else {
            return Ok(());
        };
        self.buffered_responses = responses;

        self.send_message("", events, cancel).await
    }

    /// Dispatch a batch of tool requests in order, collecting the paired
    /// function responses. Returns `None` when a call parked for
    /// confirmation: the responses gathered so far and the undispatched
    /// remainder are stored on the session until the resolve call.
    async fn dispatch_batch(
        &mut self,
        requests: Vec<ToolCallRequest>,
        mut responses: Vec<Part>,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> Option<Vec<Part>> {
        let mut queue = requests.into_iter();
        while let Some(request) = queue.next() {
            self.trace.on_tool_call(&request);
            let outcome = dispatch_tool_call(
                &self.registry,
                &request,
                self.config.approval_mode,
                self.confirmation_handler.as_ref(),
                cancel,
            )
            .await;
            match outcome {
                DispatchOutcome::Completed(result) => {
                    self.trace.on_tool_result(&request.call_id, &result);
                    let _ = events
                        .send(SessionEvent::ToolResult {
                            call_id: request.call_id.clone(),
                            result: result.clone(),
                        })
                        .await;
                    responses
                        .push(result.into_function_response(&request.call_id, &request.name));
                }
                DispatchOutcome::AwaitingConfirmation(pending) => {
                    self.buffered_responses = responses;
                    self.deferred_requests = queue.collect();
                    self.pending_confirmation = Some(pending.clone());
                    let _ = events.send(SessionEvent::AwaitingConfirmation(pending)).await;
                    return None;
                }
            }
        }
        Some(responses)
    }

    /// Run one turn, retrying once on a quota failure with the fallback
    /// model. The fallback sticks for the rest of the session.
    async fn run_turn(
        &mut self,
        prompt_id: &str,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> Result<Turn, CoreError> {
        let declarations = self.registry.function_declarations();
        loop {
            let (turn_tx, turn_rx) = mpsc::channel(64);
            let forwarder = spawn_event_forwarder(turn_rx, events.clone());

            let mut turn = Turn::new(prompt_id);
            let outcome = turn
                .run(
                    self.client.as_ref(),
                    &self.active_model,
                    &self.history,
                    &declarations,
                    &turn_tx,
                    cancel,
                )
                .await;
            drop(turn_tx);
            let _ = forwarder.await;

            match outcome {
                Ok(()) => return Ok(turn),
                Err(e) if e.api_status() == Some(429) => {
                    self.trace.on_api_error(&e);
                    match &self.config.fallback_model {
                        Some(fallback) if self.active_model != *fallback => {
                            log::warn!(
                                "model '{}' is over quota, switching to '{}'",
                                self.active_model,
                                fallback
                            );
                            self.active_model = fallback.clone();
                            let _ = events
                                .send(SessionEvent::Notice(format!(
                                    "Quota exceeded, switching to {} for the rest of this session.",
                                    self.active_model
                                )))
                                .await;
                        }
                        _ => return Err(e),
                    }
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        self.trace.on_api_error(&e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// After a turn with no tool calls, ask the model whether it intended to
    /// keep going. Any failure of the check stops the loop.
    async fn next_speaker_is_model(&self, cancel: &CancellationToken) -> bool {
        let mut messages = self.history.clone();
        messages.push(Message::user_text(NEXT_SPEAKER_PROMPT));
        let response = match self
            .client
            .generate(&self.active_model, &messages, &[], cancel)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log::warn!("next-speaker check failed, stopping: {}", e);
                return false;
            }
        };
        let text = response
            .text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => value.get("next_speaker").and_then(|v| v.as_str()) == Some("model"),
            Err(_) => {
                log::warn!("next-speaker check returned non-JSON, stopping");
                false
            }
        }
    }
}

/// Forward turn events onto the session event stream.
fn spawn_event_forwarder(
    mut turn_rx: mpsc::Receiver<TurnEvent>,
    events: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = turn_rx.recv().await {
            let mapped = match event {
                TurnEvent::Content(text) => SessionEvent::Content(text),
                TurnEvent::Thought(text) => SessionEvent::Thought(text),
                TurnEvent::ToolCallRequest(request) => SessionEvent::ToolCallRequest(request),
                // The session signals completion itself, once the whole loop
                // is done rather than per turn.
                TurnEvent::Finished(_) => continue,
            };
            if events.send(mapped).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::ToolCallConfirmationDetails;
    use crate::core_types::FunctionDeclaration;
    use crate::llm::StreamDelta;
    use crate::tools::test_support::StubTool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Script {
        Stream(Vec<StreamDelta>),
        Fail(u16),
    }

    struct ScriptedModel {
        scripts: Mutex<VecDeque<Script>>,
        /// Replayed when the scripts run out, for unbounded-loop tests.
        repeat: Option<Vec<StreamDelta>>,
        models_used: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                repeat: None,
                models_used: Mutex::new(Vec::new()),
            }
        }

        fn repeating(deltas: Vec<StreamDelta>) -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                repeat: Some(deltas),
                models_used: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate_stream(
            &self,
            model: &str,
            _messages: &[Message],
            _tools: &[FunctionDeclaration],
            _cancel: &CancellationToken,
        ) -> Result<mpsc::Receiver<Result<StreamDelta, CoreError>>, CoreError> {
            self.models_used.lock().unwrap().push(model.to_string());
            let script = self.scripts.lock().unwrap().pop_front();
            let deltas = match script {
                Some(Script::Stream(deltas)) => deltas,
                Some(Script::Fail(status)) => {
                    return Err(CoreError::Api {
                        status,
                        message: "quota exceeded".to_string(),
                        model: model.to_string(),
                        duration_ms: 5,
                    });
                }
                None => self.repeat.clone().expect("script exhausted"),
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for delta in deltas {
                    if tx.send(Ok(delta)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn call(name: &str, id: &str) -> StreamDelta {
        StreamDelta::FunctionCall {
            id: Some(id.to_string()),
            name: name.to_string(),
            args: json!({}),
        }
    }

    fn stop_check() -> Script {
        Script::Stream(vec![StreamDelta::Text(
            "{\"next_speaker\": \"user\"}".to_string(),
        )])
    }

    fn config() -> SessionConfig {
        SessionConfig::new("tern-default", "/tmp/ws").with_approval_mode(ApprovalMode::Allow)
    }

    async fn drain(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_tool_loop_pairs_call_ids_with_responses() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![
                StreamDelta::Text("Checking.".to_string()),
                call("probe", "c-1"),
            ]),
            Script::Stream(vec![StreamDelta::Text("All done.".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(client, config());
        session.start().await.unwrap();
        session
            .registry_mut()
            .register_tool(Arc::new(StubTool::named("probe")));

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("run the probe", &tx, &cancel).await.unwrap();
        drop(tx);

        // The function response message must echo call_id c-1 back.
        let paired = session.history().iter().any(|m| {
            m.role == Role::User
                && m.parts.iter().any(|p| {
                    matches!(p, Part::FunctionResponse { id, name, .. }
                        if id.as_deref() == Some("c-1") && name == "probe")
                })
        });
        assert!(paired, "history: {:?}", session.history());

        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ToolResult { call_id, .. } if call_id == "c-1")));
        assert!(matches!(events.last(), Some(SessionEvent::Finished)));
    }

    #[tokio::test]
    async fn test_quota_failure_switches_to_fallback_model() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Fail(429),
            Script::Stream(vec![StreamDelta::Text("hello".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(
            client.clone(),
            config().with_fallback_model("tern-lite"),
        );
        session.start().await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("hi", &tx, &cancel).await.unwrap();
        drop(tx);

        assert_eq!(session.active_model(), "tern-lite");
        let models = client.models_used.lock().unwrap().clone();
        assert_eq!(models[0], "tern-default");
        assert_eq!(models[1], "tern-lite");
        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Notice(text) if text.contains("tern-lite"))));
    }

    #[tokio::test]
    async fn test_quota_failure_without_fallback_is_fatal() {
        let client = Arc::new(ScriptedModel::new(vec![Script::Fail(429)]));
        let mut session = Session::new(client, config());
        session.start().await.unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let err = session.send_message("hi", &tx, &cancel).await.unwrap_err();
        assert_eq!(err.api_status(), Some(429));
    }

    #[tokio::test]
    async fn test_loop_stops_at_turn_bound() {
        // A model that asks for a tool on every turn would loop forever.
        let client = Arc::new(ScriptedModel::repeating(vec![call("probe", "again")]));
        let mut session = Session::new(client, config());
        session.start().await.unwrap();
        session
            .registry_mut()
            .register_tool(Arc::new(StubTool::named("probe")));

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(async move {
            session.send_message("go", &tx, &cancel).await.unwrap();
        });
        let events = drain(rx).await;
        driver.await.unwrap();

        let turns = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ToolCallRequest(_)))
            .count();
        assert_eq!(turns, MAX_TURNS);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Notice(text) if text.contains("limit"))));
    }

    #[tokio::test]
    async fn test_confirmation_parks_loop_and_resolve_resumes_it() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![call("guarded", "c-9")]),
            Script::Stream(vec![StreamDelta::Text("done".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(
            client,
            SessionConfig::new("tern-default", "/tmp/ws"),
        );
        session.start().await.unwrap();
        let mut tool = StubTool::named("guarded");
        tool.confirmation = Some(ToolCallConfirmationDetails::Execute {
            command: "rm -rf build".to_string(),
            root_command: "rm".to_string(),
        });
        session.registry_mut().register_tool(Arc::new(tool));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("clean up", &tx, &cancel).await.unwrap();

        let pending = session.pending_confirmation().expect("parked call");
        assert_eq!(pending.request.call_id, "c-9");
        // The loop is parked: further messages are rejected until resolved.
        assert!(session.send_message("more", &tx, &cancel).await.is_err());

        session
            .resolve_confirmation(ConfirmationOutcome::ProceedOnce, &tx, &cancel)
            .await
            .unwrap();
        assert!(session.pending_confirmation().is_none());
        drop(tx);

        let mut saw_result = false;
        let mut saw_finished = false;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::ToolResult { call_id, result } if call_id == "c-9" => {
                    assert!(!result.is_error());
                    saw_result = true;
                }
                SessionEvent::Finished => saw_finished = true,
                _ => {}
            }
        }
        assert!(saw_result && saw_finished);
    }

    #[tokio::test]
    async fn test_park_mid_batch_still_answers_every_call() {
        // One turn, two requests: the first parks, the second must not be
        // dropped — both call ids get exactly one response.
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![call("guarded", "c-guarded"), call("probe", "c-plain")]),
            Script::Stream(vec![StreamDelta::Text("done".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(client, SessionConfig::new("tern-default", "/tmp/ws"));
        session.start().await.unwrap();
        let mut guarded = StubTool::named("guarded");
        guarded.confirmation = Some(ToolCallConfirmationDetails::Execute {
            command: "make".to_string(),
            root_command: "make".to_string(),
        });
        session.registry_mut().register_tool(Arc::new(guarded));
        session
            .registry_mut()
            .register_tool(Arc::new(StubTool::named("probe")));

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("both", &tx, &cancel).await.unwrap();
        assert_eq!(
            session.pending_confirmation().unwrap().request.call_id,
            "c-guarded"
        );
        session
            .resolve_confirmation(ConfirmationOutcome::ProceedOnce, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);

        let answered = |id: &str| {
            session.history().iter().any(|m| {
                m.parts.iter().any(|p| {
                    matches!(p, Part::FunctionResponse { id: got, .. }
                        if got.as_deref() == Some(id))
                })
            })
        };
        assert!(answered("c-guarded"));
        assert!(answered("c-plain"));

        let events = drain(rx).await;
        for id in ["c-guarded", "c-plain"] {
            let count = events
                .iter()
                .filter(|e| matches!(e, SessionEvent::ToolResult { call_id, .. } if call_id == id))
                .count();
            assert_eq!(count, 1, "call {} answered {} times", id, count);
        }
    }

    #[tokio::test]
    async fn test_second_park_in_same_batch_is_queued() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![call("guarded", "c-1"), call("guarded", "c-2")]),
            Script::Stream(vec![StreamDelta::Text("done".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(client, SessionConfig::new("tern-default", "/tmp/ws"));
        session.start().await.unwrap();
        let mut guarded = StubTool::named("guarded");
        guarded.confirmation = Some(ToolCallConfirmationDetails::Execute {
            command: "make".to_string(),
            root_command: "make".to_string(),
        });
        session.registry_mut().register_tool(Arc::new(guarded));

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("twice", &tx, &cancel).await.unwrap();
        assert_eq!(session.pending_confirmation().unwrap().request.call_id, "c-1");
        session
            .resolve_confirmation(ConfirmationOutcome::ProceedOnce, &tx, &cancel)
            .await
            .unwrap();
        // The second request parked in turn.
        assert_eq!(session.pending_confirmation().unwrap().request.call_id, "c-2");
        session
            .resolve_confirmation(ConfirmationOutcome::Cancel, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);

        // Both answered: one executed, one cancelled, in a single message.
        let batch = session
            .history()
            .iter()
            .find(|m| {
                m.parts.iter().any(|p| {
                    matches!(p, Part::FunctionResponse { id, .. } if id.as_deref() == Some("c-1"))
                })
            })
            .expect("response message");
        assert_eq!(batch.parts.len(), 2);
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(SessionEvent::Finished)));
    }

    #[tokio::test]
    async fn test_inline_handler_resolves_without_parking() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![call("guarded", "c-2")]),
            Script::Stream(vec![StreamDelta::Text("done".to_string())]),
            stop_check(),
        ]));
        let handler: Arc<dyn ConfirmationHandler> = Arc::new(
            crate::confirmation::SequenceConfirmationHandler::new(vec![
                ConfirmationOutcome::ProceedOnce,
            ]),
        );
        let mut session = Session::new(client, SessionConfig::new("tern-default", "/tmp/ws"))
            .with_confirmation_handler(handler);
        session.start().await.unwrap();
        let mut tool = StubTool::named("guarded");
        tool.confirmation = Some(ToolCallConfirmationDetails::Execute {
            command: "make".to_string(),
            root_command: "make".to_string(),
        });
        session.registry_mut().register_tool(Arc::new(tool));

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("build it", &tx, &cancel).await.unwrap();
        drop(tx);

        assert!(session.pending_confirmation().is_none());
        let events = drain(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ToolResult { call_id, .. } if call_id == "c-2")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::AwaitingConfirmation(_))));
    }

    #[tokio::test]
    async fn test_next_speaker_model_continues_the_loop() {
        let client = Arc::new(ScriptedModel::new(vec![
            Script::Stream(vec![StreamDelta::Text("First I will check.".to_string())]),
            Script::Stream(vec![StreamDelta::Text(
                "{\"next_speaker\": \"model\"}".to_string(),
            )]),
            Script::Stream(vec![StreamDelta::Text("Checked.".to_string())]),
            stop_check(),
        ]));
        let mut session = Session::new(client, config());
        session.start().await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        session.send_message("check it", &tx, &cancel).await.unwrap();
        drop(tx);

        assert!(session
            .history()
            .iter()
            .any(|m| matches!(m.parts.first(), Some(Part::Text { text }) if text == "Please continue.")));
        let events = drain(rx).await;
        let chunks: Vec<&SessionEvent> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Content(_)))
            .collect();
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_send_message_before_start_fails() {
        let client = Arc::new(ScriptedModel::new(Vec::new()));
        let mut session = Session::new(client, config());
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let err = session.send_message("hi", &tx, &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::Initialization(_)));
    }

    #[tokio::test]
    async fn test_start_is_single_shot_and_seeds_history() {
        let client = Arc::new(ScriptedModel::new(Vec::new()));
        let mut session = Session::new(client, config());
        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        // Preamble plus acknowledgement.
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].role, Role::Model);
    }
}
