//! Behavior tests for the session engine, driven through a scripted mock
//! model client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use colloquy_providers::{ChatRequest, ClientError, EventStream, ModelClient, StreamEvent, TransportKind};
use colloquy_types::{
    AgentProfile, BranchDescriptor, ChatMessage, ConfigSnapshot, Connection, HistorySnapshot,
    TurnId,
};

use crate::{
    AddTurnOptions, EngineError, EngineEvent, EngineOptions, GenerationConfig, GenerationOptions,
    GenerationOutcome, SEND_FAILED_BADGE, STOPPED_BADGE, SessionEngine,
};

// ----------------------------------------------------------------------
// Scripted mock client
// ----------------------------------------------------------------------

enum Script {
    /// Accept the request and stream these events.
    Stream(Vec<StreamEvent>),
    /// Refuse the request before any stream exists.
    CreateError(ClientError),
    /// Accept, stream some events, then fail mid-stream.
    FailMidStream {
        before: Vec<StreamEvent>,
        error: ClientError,
    },
    /// Accept, stream some events, then pend until cancelled.
    HangAfter(Vec<StreamEvent>),
}

struct MockClient {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl MockClient {
    fn scripted(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn always_done() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    async fn create(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or(Script::Stream(vec![StreamEvent::Done])) {
            Script::Stream(events) => {
                let items: Vec<Result<StreamEvent, ClientError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Script::CreateError(error) => Err(error),
            Script::FailMidStream { before, error } => {
                let items: Vec<Result<StreamEvent, ClientError>> = before
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(error)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Script::HangAfter(events) => {
                let items: Vec<Result<StreamEvent, ClientError>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            }
        }
    }
}

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

fn test_config() -> ConfigSnapshot {
    ConfigSnapshot {
        agents: vec![AgentProfile {
            id: "helper".to_string(),
            connection_id: "default".to_string(),
            model_id: "mock-small".to_string(),
            system_prompt: Some("You are helpful.".to_string()),
        }],
        connections: vec![Connection {
            id: "default".to_string(),
            base_url: "http://127.0.0.1:9000".to_string(),
            api_key: None,
        }],
    }
}

fn fast_options() -> EngineOptions {
    EngineOptions {
        generation: GenerationConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        },
        ..EngineOptions::default()
    }
}

fn engine_with(client: Arc<MockClient>) -> SessionEngine {
    SessionEngine::with_options(client, Arc::new(test_config()), fast_options())
}

fn collect_events(engine: &SessionEngine) -> Arc<Mutex<Vec<EngineEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn event_names(events: &Arc<Mutex<Vec<EngineEvent>>>) -> Vec<&'static str> {
    events.lock().unwrap().iter().map(EngineEvent::name).collect()
}

fn unavailable() -> ClientError {
    ClientError::status(503, "unavailable")
}

async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached before polling gave up");
}

// ----------------------------------------------------------------------
// Structural operations
// ----------------------------------------------------------------------

#[tokio::test]
async fn add_turn_appends_and_announces() {
    let engine = engine_with(MockClient::always_done());
    let events = collect_events(&engine);

    let turn = engine
        .add_turn("hello", "", AddTurnOptions::for_agent("helper"))
        .unwrap();

    assert_eq!(engine.len(), 1);
    assert_eq!(engine.turn(&turn.id).unwrap().user.content, "hello");
    assert_eq!(event_names(&events), vec!["turnAdded"]);
}

#[tokio::test]
async fn delete_turn_reports_whether_it_existed() {
    let engine = engine_with(MockClient::always_done());
    let turn = engine
        .add_turn("hello", "", AddTurnOptions::for_agent("helper"))
        .unwrap();
    let events = collect_events(&engine);

    assert!(engine.delete_turn(&turn.id).unwrap());
    assert!(!engine.delete_turn(&turn.id).unwrap());
    assert!(engine.is_empty());
    assert_eq!(event_names(&events), vec!["turnDeleted"]);
}

#[tokio::test]
async fn clear_assistant_content_resets_in_place() {
    let engine = engine_with(MockClient::scripted(vec![Script::Stream(vec![
        StreamEvent::ContentDelta("answer".to_string()),
        StreamEvent::Done,
    ])]));
    let turn = engine
        .add_turn("question", "", AddTurnOptions::for_agent("helper"))
        .unwrap();
    engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.turn(&turn.id).unwrap().assistant.content, "answer");

    assert!(engine.clear_assistant_content(&turn.id).unwrap());
    let cleared = engine.turn(&turn.id).unwrap();
    assert!(cleared.assistant.content.is_empty());
    assert!(cleared.assistant.thinking.is_none());
    assert!(!cleared.assistant.has_error);
    // The turn itself survives.
    assert_eq!(cleared.user.content, "question");
}

#[tokio::test]
async fn edit_and_resend_truncates_and_preserves_the_origin() {
    let client = MockClient::scripted(vec![Script::Stream(vec![
        StreamEvent::ContentDelta("new answer".to_string()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(client);
    let t1 = engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t2 = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t3 = engine.add_turn("q3", "", AddTurnOptions::for_agent("helper")).unwrap();
    let events = collect_events(&engine);

    let edited = engine.edit_and_resend(&t2.id, "x", None).await.unwrap();

    let turns = engine.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].id, t1.id);
    assert_eq!(turns[1].id, edited.id);
    assert_eq!(turns[1].user.content, "x");
    assert!(engine.turn(&t2.id).is_none());
    assert!(engine.turn(&t3.id).is_none());

    let descriptors = engine.branch_descriptors(&t2.id);
    assert_eq!(descriptors.len(), 2);
    assert!(descriptors[0].is_original);
    assert_eq!(descriptors[0].user_content, "q2");
    assert_eq!(descriptors[0].id, t2.id);
    assert!(engine.has_branches(&t2.id));

    let branch_ref = edited.metadata.branch_ref.as_ref().unwrap();
    assert_eq!(branch_ref.parent_turn_id, t2.id);
    assert_eq!(branch_ref.branch_index, 1);
    assert_eq!(edited.assistant.content, "new answer");

    let names = event_names(&events);
    assert_eq!(names[0], "messageResent");
    assert!(names.contains(&"generationComplete"));
}

#[tokio::test]
async fn edit_and_resend_can_retarget_the_agent() {
    let mut config = test_config();
    config.agents.push(AgentProfile {
        id: "expert".to_string(),
        connection_id: "default".to_string(),
        model_id: "mock-large".to_string(),
        system_prompt: None,
    });
    let client = MockClient::always_done();
    let engine = SessionEngine::with_options(
        Arc::clone(&client) as Arc<dyn ModelClient>,
        Arc::new(config),
        fast_options(),
    );
    let turn = engine.add_turn("q", "", AddTurnOptions::for_agent("helper")).unwrap();

    let edited = engine
        .edit_and_resend(&turn.id, "again", Some("expert".to_string()))
        .await
        .unwrap();

    assert_eq!(edited.user.agent_id, "expert");
    assert_eq!(client.requests()[0].model, "mock-large");
}

#[tokio::test]
async fn switch_to_branch_restores_the_original_path() {
    let engine = engine_with(MockClient::always_done());
    let t1 = engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t2 = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    let edited = engine.edit_and_resend(&t2.id, "edited", None).await.unwrap();
    let events = collect_events(&engine);

    let descriptors = engine.branch_descriptors(&t2.id);
    let original = descriptors[0].clone();
    assert!(original.is_original);

    let restored = engine.switch_to_branch(&t2.id, &original).await.unwrap();

    let turns = engine.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].id, t1.id);
    // The checked-out turn takes the original's id back.
    assert_eq!(restored.id, t2.id);
    assert_eq!(turns[1].id, t2.id);
    assert_eq!(restored.user.content, "q2");
    // The original path carries no branch ref.
    assert!(restored.metadata.branch_ref.is_none());
    assert!(engine.turn(&edited.id).is_none());
    assert_eq!(event_names(&events)[0], "branchSwitched");
}

#[tokio::test]
async fn switch_to_branch_marks_non_original_variants() {
    let engine = engine_with(MockClient::always_done());
    engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t2 = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.edit_and_resend(&t2.id, "edited", None).await.unwrap();

    // Back to the original, then forward to the edited variant again.
    let original = engine.branch_descriptors(&t2.id)[0].clone();
    engine.switch_to_branch(&t2.id, &original).await.unwrap();
    let variant = engine.branch_descriptors(&t2.id)[1].clone();
    let switched = engine.switch_to_branch(&t2.id, &variant).await.unwrap();

    assert_eq!(switched.user.content, "edited");
    assert_eq!(switched.id, variant.id);
    let branch_ref = switched.metadata.branch_ref.unwrap();
    assert_eq!(branch_ref.parent_turn_id, t2.id);
    assert_eq!(branch_ref.branch_index, 1);
}

#[tokio::test]
async fn switch_to_branch_rejects_foreign_descriptors() {
    let engine = engine_with(MockClient::always_done());
    let t1 = engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t2 = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.edit_and_resend(&t2.id, "edited", None).await.unwrap();

    let bogus = BranchDescriptor {
        id: TurnId::new("not-recorded"),
        user_content: "ghost".to_string(),
        agent_id: "helper".to_string(),
        created_at: SystemTime::UNIX_EPOCH,
        is_original: false,
    };
    let err = engine.switch_to_branch(&t2.id, &bogus).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownBranch(_)));
    // Never-branched turns have no descriptors to switch to.
    let err = engine.switch_to_branch(&t1.id, &bogus).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownBranch(_)));
}

// ----------------------------------------------------------------------
// Locking
// ----------------------------------------------------------------------

#[tokio::test]
async fn structural_operations_fail_fast_while_locked() {
    let client = MockClient::scripted(vec![Script::HangAfter(vec![StreamEvent::ContentDelta(
        "partial".to_string(),
    )])]);
    let engine = engine_with(client);
    let t1 = engine.add_turn("first", "", AddTurnOptions::for_agent("helper")).unwrap();
    let t2 = engine.add_turn("second", "", AddTurnOptions::for_agent("helper")).unwrap();

    let runner = engine.clone();
    let target = t2.id.clone();
    let generation = tokio::spawn(async move {
        runner
            .enqueue_generation(&target, GenerationOptions::default())
            .await
    });
    wait_until(|| engine.is_locked()).await;

    assert!(matches!(
        engine.add_turn("third", "", AddTurnOptions::for_agent("helper")),
        Err(EngineError::Locked)
    ));
    assert!(matches!(engine.delete_turn(&t1.id), Err(EngineError::Locked)));
    assert!(matches!(
        engine.clear_assistant_content(&t1.id),
        Err(EngineError::Locked)
    ));
    assert!(matches!(
        engine.edit_and_resend(&t1.id, "x", None).await,
        Err(EngineError::Locked)
    ));
    let descriptor = BranchDescriptor {
        id: t1.id.clone(),
        user_content: "first".to_string(),
        agent_id: "helper".to_string(),
        created_at: SystemTime::UNIX_EPOCH,
        is_original: true,
    };
    assert!(matches!(
        engine.switch_to_branch(&t1.id, &descriptor).await,
        Err(EngineError::Locked)
    ));
    assert!(matches!(
        engine.import_history(HistorySnapshot::default()),
        Err(EngineError::Locked)
    ));
    assert!(matches!(engine.clear_history(), Err(EngineError::Locked)));

    // Nothing was mutated by the rejected calls.
    assert_eq!(engine.len(), 2);

    // Reads remain valid while locked.
    assert_eq!(engine.search("first"), vec![t1.id.clone()]);
    assert_eq!(engine.export_history().turns.len(), 2);

    engine.stop_generation();
    let outcome = generation.await.unwrap().unwrap();
    assert_eq!(outcome, GenerationOutcome::Stopped);
    assert!(!engine.is_locked());
}

// ----------------------------------------------------------------------
// Generation: streaming, retry, cancellation
// ----------------------------------------------------------------------

#[tokio::test]
async fn generation_streams_deltas_into_the_turn() {
    let client = MockClient::scripted(vec![Script::Stream(vec![
        StreamEvent::ThinkingDelta("let me see".to_string()),
        StreamEvent::ContentDelta("Hel".to_string()),
        StreamEvent::ContentDelta("lo".to_string()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(client);
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Complete);
    let settled = engine.turn(&turn.id).unwrap();
    assert_eq!(settled.assistant.content, "Hello");
    assert_eq!(settled.assistant.thinking.as_deref(), Some("let me see"));
    assert!(!settled.assistant.is_streaming);
    assert!(!settled.assistant.has_error);

    let names = event_names(&events);
    assert_eq!(
        names,
        vec!["turnAdded", "locked", "thinkingUpdated", "generationComplete", "unlocked"]
    );
}

#[tokio::test]
async fn generation_builds_context_from_the_live_list() {
    let client = MockClient::scripted(vec![Script::Stream(vec![
        StreamEvent::ContentDelta("a1".to_string()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(Arc::clone(&client));
    let first = engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine
        .enqueue_generation(&first.id, GenerationOptions::default())
        .await
        .unwrap();
    let trailing = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine
        .enqueue_generation(&trailing.id, GenerationOptions::default())
        .await
        .unwrap();

    let requests = client.requests();
    let request = requests.last().unwrap();
    assert_eq!(request.model, "mock-small");
    assert_eq!(
        request.messages,
        vec![
            ChatMessage::system("You are helpful."),
            ChatMessage::user("q1", Vec::new()),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q2", Vec::new()),
        ]
    );
}

#[tokio::test]
async fn context_override_bypasses_the_builder() {
    let client = MockClient::scripted(vec![Script::Stream(vec![StreamEvent::Done])]);
    let engine = engine_with(Arc::clone(&client));
    let turn = engine.add_turn("ignored", "", AddTurnOptions::for_agent("helper")).unwrap();

    let override_messages = vec![ChatMessage::user("custom window", Vec::new())];
    engine
        .enqueue_generation(
            &turn.id,
            GenerationOptions {
                context_override: Some(override_messages.clone()),
                ..GenerationOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(client.requests()[0].messages, override_messages);
}

#[tokio::test]
async fn retryable_failures_back_off_then_recover() {
    let client = MockClient::scripted(vec![
        Script::CreateError(unavailable()),
        Script::CreateError(unavailable()),
        Script::Stream(vec![
            StreamEvent::ContentDelta("recovered".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let engine = engine_with(Arc::clone(&client));
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Complete);
    assert_eq!(client.call_count(), 3);
    let settled = engine.turn(&turn.id).unwrap();
    assert_eq!(settled.assistant.content, "recovered");
    assert!(!settled.assistant.has_error);

    // The externally observed locked span covers the whole retry sequence.
    let names = event_names(&events);
    assert_eq!(names.iter().filter(|name| **name == "locked").count(), 1);
    assert_eq!(names.iter().filter(|name| **name == "unlocked").count(), 1);
    assert!(!names.contains(&"sendError"));
}

#[tokio::test(start_paused = true)]
async fn default_backoff_waits_one_then_two_seconds() {
    let client = MockClient::scripted(vec![
        Script::CreateError(unavailable()),
        Script::CreateError(unavailable()),
        Script::Stream(vec![StreamEvent::Done]),
    ]);
    // Default generation config: 3 retries, 1000ms base delay.
    let engine = SessionEngine::new(Arc::clone(&client) as Arc<dyn ModelClient>, Arc::new(test_config()));
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let start = tokio::time::Instant::now();
    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, GenerationOutcome::Complete);
    assert_eq!(client.call_count(), 3);
    assert!(elapsed >= Duration::from_millis(3000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn retries_clear_partial_output() {
    let client = MockClient::scripted(vec![
        Script::FailMidStream {
            before: vec![
                StreamEvent::ThinkingDelta("half a thought".to_string()),
                StreamEvent::ContentDelta("half an answer".to_string()),
            ],
            error: ClientError::transport(TransportKind::Network, "connection reset"),
        },
        Script::Stream(vec![
            StreamEvent::ContentDelta("clean".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let engine = engine_with(client);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Complete);
    let settled = engine.turn(&turn.id).unwrap();
    assert_eq!(settled.assistant.content, "clean");
    assert!(settled.assistant.thinking.is_none());
}

#[tokio::test]
async fn non_retryable_errors_short_circuit() {
    let client = MockClient::scripted(vec![Script::CreateError(ClientError::status(
        401,
        "unauthorized",
    ))]);
    let engine = engine_with(Arc::clone(&client));
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Failed);
    assert_eq!(client.call_count(), 1);

    let settled = engine.turn(&turn.id).unwrap();
    assert!(settled.assistant.has_error);
    assert!(settled.assistant.content.starts_with(SEND_FAILED_BADGE));
    assert!(settled.assistant.content.contains("401"));
    assert!(!settled.assistant.content.contains("retries"));

    let recorded = events.lock().unwrap();
    let send_error = recorded
        .iter()
        .find_map(|event| match event {
            EngineEvent::SendError { attempt, error, .. } => Some((*attempt, error.clone())),
            _ => None,
        })
        .expect("sendError emitted");
    assert_eq!(send_error.0, 0);
    assert!(send_error.1.contains("401"));
}

#[tokio::test]
async fn exhausted_retries_surface_the_count() {
    let client = MockClient::scripted(vec![
        Script::CreateError(unavailable()),
        Script::CreateError(unavailable()),
        Script::CreateError(unavailable()),
        Script::CreateError(unavailable()),
    ]);
    let engine = engine_with(Arc::clone(&client));
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Failed);
    // Initial attempt + 3 retries.
    assert_eq!(client.call_count(), 4);

    let settled = engine.turn(&turn.id).unwrap();
    assert!(settled.assistant.has_error);
    assert!(settled.assistant.content.contains("(after 3 retries)"));

    let recorded = events.lock().unwrap();
    let attempt = recorded
        .iter()
        .find_map(|event| match event {
            EngineEvent::SendError { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .expect("sendError emitted");
    assert_eq!(attempt, 3);
}

#[tokio::test]
async fn unresolved_agent_fails_before_any_network_call() {
    let client = MockClient::always_done();
    let engine = engine_with(Arc::clone(&client));
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("ghost")).unwrap();

    let outcome = engine
        .enqueue_generation(&turn.id, GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Failed);
    assert_eq!(client.call_count(), 0);

    let settled = engine.turn(&turn.id).unwrap();
    assert!(settled.assistant.has_error);
    assert!(settled.assistant.content.starts_with(SEND_FAILED_BADGE));
    assert!(settled.assistant.content.contains("ghost"));
    assert!(event_names(&events).contains(&"sendError"));
}

#[tokio::test]
async fn unknown_turn_is_rejected_at_enqueue_time() {
    let engine = engine_with(MockClient::always_done());
    let err = engine
        .enqueue_generation(&TurnId::new("missing"), GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TurnNotFound(_)));
}

#[tokio::test]
async fn cancelling_mid_stream_appends_the_stop_marker() {
    let client = MockClient::scripted(vec![Script::HangAfter(vec![StreamEvent::ContentDelta(
        "partial".to_string(),
    )])]);
    let engine = engine_with(client);
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let runner = engine.clone();
    let target = turn.id.clone();
    let generation = tokio::spawn(async move {
        runner
            .enqueue_generation(&target, GenerationOptions::default())
            .await
    });
    wait_until(|| {
        engine
            .turn(&turn.id)
            .is_some_and(|turn| turn.assistant.content == "partial")
    })
    .await;

    engine.stop_generation();
    let outcome = generation.await.unwrap().unwrap();

    assert_eq!(outcome, GenerationOutcome::Stopped);
    let settled = engine.turn(&turn.id).unwrap();
    assert!(!settled.assistant.is_streaming);
    assert_eq!(settled.assistant.content, format!("partial\n\n{STOPPED_BADGE}"));
    assert!(!settled.assistant.has_error);

    let names = event_names(&events);
    assert!(names.contains(&"generationStopped"));
    assert!(!names.contains(&"sendError"));
}

#[tokio::test]
async fn cancelling_before_the_stream_head_leaves_no_marker() {
    let client = MockClient::always_done();
    let engine = engine_with(client);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = engine
        .enqueue_generation(
            &turn.id,
            GenerationOptions {
                cancellation: Some(cancel),
                ..GenerationOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, GenerationOutcome::Stopped);
    let settled = engine.turn(&turn.id).unwrap();
    assert!(settled.assistant.content.is_empty());
}

#[tokio::test]
async fn stop_generation_without_an_active_run_is_a_no_op() {
    let engine = engine_with(MockClient::always_done());
    engine.stop_generation();
    assert!(!engine.is_locked());
}

#[tokio::test]
async fn concurrent_enqueues_run_single_flight_in_fifo_order() {
    let client = MockClient::always_done();
    let engine = engine_with(Arc::clone(&client));
    let events = collect_events(&engine);
    let turn = engine.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();

    let with_window = |label: &str| GenerationOptions {
        context_override: Some(vec![ChatMessage::user(label, Vec::new())]),
        ..GenerationOptions::default()
    };

    let (first, second, third) = tokio::join!(
        engine.enqueue_generation(&turn.id, with_window("one")),
        engine.enqueue_generation(&turn.id, with_window("two")),
        engine.enqueue_generation(&turn.id, with_window("three")),
    );
    assert_eq!(first.unwrap(), GenerationOutcome::Complete);
    assert_eq!(second.unwrap(), GenerationOutcome::Complete);
    assert_eq!(third.unwrap(), GenerationOutcome::Complete);

    let order: Vec<String> = client
        .requests()
        .iter()
        .map(|request| request.messages[0].content.clone())
        .collect();
    assert_eq!(order, vec!["one", "two", "three"]);

    // Locked/unlocked strictly alternate: runs never overlap.
    let names: Vec<&str> = event_names(&events)
        .into_iter()
        .filter(|name| *name == "locked" || *name == "unlocked")
        .collect();
    assert_eq!(
        names,
        vec!["locked", "unlocked", "locked", "unlocked", "locked", "unlocked"]
    );
}

// ----------------------------------------------------------------------
// Export / import / search
// ----------------------------------------------------------------------

#[tokio::test]
async fn history_round_trips_through_export_and_import() {
    let engine = engine_with(MockClient::scripted(vec![
        Script::Stream(vec![StreamEvent::ContentDelta("a1".to_string()), StreamEvent::Done]),
        Script::Stream(vec![StreamEvent::ContentDelta("a2".to_string()), StreamEvent::Done]),
    ]));
    let t1 = engine.add_turn("q1", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.enqueue_generation(&t1.id, GenerationOptions::default()).await.unwrap();
    let t2 = engine.add_turn("q2", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.edit_and_resend(&t2.id, "q2 edited", None).await.unwrap();

    let exported = engine.export_history();
    assert_eq!(exported.turns.len(), 2);
    assert!(!exported.branches.is_empty());

    // Serialize through JSON the way a persisting host would.
    let json = serde_json::to_string(&exported).unwrap();
    let parsed: HistorySnapshot = serde_json::from_str(&json).unwrap();

    let fresh = engine_with(MockClient::always_done());
    let events = collect_events(&fresh);
    let count = fresh.import_history(parsed).unwrap();

    assert_eq!(count, 2);
    assert_eq!(fresh.export_history(), exported);
    assert_eq!(fresh.branch_descriptors(&t2.id).len(), 2);
    assert_eq!(event_names(&events), vec!["historyLoaded"]);
}

#[tokio::test]
async fn import_replaces_existing_history() {
    let engine = engine_with(MockClient::always_done());
    engine.add_turn("stale", "", AddTurnOptions::for_agent("helper")).unwrap();

    engine.import_history(HistorySnapshot::default()).unwrap();

    assert!(engine.is_empty());
    assert!(engine.export_history().branches.is_empty());
}

#[tokio::test]
async fn clear_history_empties_everything() {
    let engine = engine_with(MockClient::always_done());
    let turn = engine.add_turn("q", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.edit_and_resend(&turn.id, "edited", None).await.unwrap();
    let events = collect_events(&engine);

    engine.clear_history().unwrap();

    assert!(engine.is_empty());
    assert!(engine.branch_descriptors(&turn.id).is_empty());
    assert_eq!(event_names(&events), vec!["historyCleared"]);
}

#[tokio::test]
async fn search_is_case_insensitive_over_both_sides() {
    let engine = engine_with(MockClient::scripted(vec![Script::Stream(vec![
        StreamEvent::ContentDelta("the ANSWER".to_string()),
        StreamEvent::Done,
    ])]));
    let noise = engine.add_turn("unrelated", "", AddTurnOptions::for_agent("helper")).unwrap();
    let hit = engine
        .add_turn("this has FOO in it", "", AddTurnOptions::for_agent("helper"))
        .unwrap();
    engine.enqueue_generation(&hit.id, GenerationOptions::default()).await.unwrap();

    assert_eq!(engine.search("foo"), vec![hit.id.clone()]);
    assert_eq!(engine.search("answer"), vec![hit.id.clone()]);
    assert_eq!(engine.search_matches(), vec![hit.id.clone()]);
    assert!(engine.search("nothing matches this").is_empty());
    let _ = noise;
}

#[tokio::test]
async fn empty_search_clears_stored_matches() {
    let engine = engine_with(MockClient::always_done());
    engine.add_turn("findable", "", AddTurnOptions::for_agent("helper")).unwrap();

    assert_eq!(engine.search("findable").len(), 1);
    assert_eq!(engine.search_matches().len(), 1);

    assert!(engine.search("").is_empty());
    assert!(engine.search_matches().is_empty());
}

#[tokio::test]
async fn deleting_a_turn_prunes_its_search_match() {
    let engine = engine_with(MockClient::always_done());
    let turn = engine.add_turn("findable", "", AddTurnOptions::for_agent("helper")).unwrap();
    engine.search("findable");

    engine.delete_turn(&turn.id).unwrap();
    assert!(engine.search_matches().is_empty());
}

// ----------------------------------------------------------------------
// Isolation
// ----------------------------------------------------------------------

#[tokio::test]
async fn engines_are_fully_isolated() {
    let busy_client = MockClient::scripted(vec![Script::HangAfter(Vec::new())]);
    let busy = engine_with(busy_client);
    let idle = engine_with(MockClient::always_done());

    let turn = busy.add_turn("hi", "", AddTurnOptions::for_agent("helper")).unwrap();
    let runner = busy.clone();
    let target = turn.id.clone();
    let generation = tokio::spawn(async move {
        runner
            .enqueue_generation(&target, GenerationOptions::default())
            .await
    });
    wait_until(|| busy.is_locked()).await;

    // A locked sibling engine does not affect this one.
    assert!(!idle.is_locked());
    let other = idle.add_turn("free", "", AddTurnOptions::for_agent("helper")).unwrap();
    let outcome = idle
        .enqueue_generation(&other.id, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, GenerationOutcome::Complete);

    busy.stop_generation();
    generation.await.unwrap().unwrap();
}
