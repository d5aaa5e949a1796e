//! End-to-end question turns through the QA manager

mod common;

use common::{answer_steps, paper_chunks, FakeEngine, InMemoryStore, Step, StubSummarizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use docqa_context::config::Config;
use docqa_context::context::models::{ChatMessage, UseCase};
use docqa_context::engine::SessionInput;
use docqa_context::error::ContextError;
use docqa_context::qa::{
    parse_request, AskRequest, QaManager, QaResponse, StreamEvent, TurnOutcome,
};

fn manager_with(fake: &FakeEngine, config: Config) -> (QaManager, Arc<StubSummarizer>) {
    let store = InMemoryStore::default().with_document("paper", paper_chunks(10));
    let summarizer = Arc::new(StubSummarizer::default());
    let manager = QaManager::new(
        config,
        fake.clone().into_engine(),
        Arc::new(store),
        summarizer.clone(),
    )
    .unwrap();
    (manager, summarizer)
}

fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn streamed_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_chat_turn_streams_and_cites() {
    let fake = FakeEngine::new(4096);
    fake.push_response(answer_steps(
        &["Attention", "weights", "are", "softmax", "normalized."],
        &["2", "chunk-0"],
    ));
    let (manager, _) = manager_with(&fake, Config::default());
    let (tx, mut rx) = mpsc::channel(64);

    let request = AskRequest::new("ctx", "paper", "How are weights computed?").with_title("Paper");
    let outcome = manager.ask(request, tx).await.unwrap();
    let result = outcome.into_result().unwrap();

    let events = drain(&mut rx);
    let Some(StreamEvent::End {
        answer,
        citations,
        trim,
        parsed,
    }) = events.last()
    else {
        panic!("last event should be End: {:?}", events);
    };

    assert!(*parsed);
    assert_eq!(answer, "Attention weights are softmax normalized. ");
    assert_eq!(&streamed_text(&events), answer);
    assert_eq!(citations.len(), 2);
    assert_eq!(citations[0].chunk_id, "chunk-1");
    assert_eq!(citations[1].chunk_id, "chunk-0");
    assert!(trim.floor_met);
    assert!(!trim.tight);
    assert_eq!(trim.total_candidates, 10);

    assert!(!result.rebased);
    assert_eq!(result.state.recent_messages.len(), 2);
    assert_eq!(result.state.recent_messages[0].content, "How are weights computed?");
    assert_eq!(
        result.assistant_message.sources,
        Some(vec!["chunk-1".to_string(), "chunk-0".to_string()])
    );

    // the evidence block reached the engine with its labels
    let prompt = fake.prompts().pop().unwrap();
    assert!(prompt.contains("[1] (Section: Section 1) (Page 1)"));
    assert!(prompt.ends_with("Request: How are weights computed?"));
    assert_eq!(manager.registry().len(), 1);
    assert!(!manager.registry().has_request_in_flight("ctx"));
}

#[tokio::test]
async fn test_one_shot_use_case_discards_session() {
    let fake = FakeEngine::new(4096);
    fake.push_response(answer_steps(&["A", "summary."], &["1"]));
    let (manager, summarizer) = manager_with(&fake, Config::default());
    let (tx, _rx) = mpsc::channel(64);

    let request = AskRequest::new("summary-ctx", "paper", "Summarize the paper")
        .with_use_case(UseCase::Summary);
    let result = manager.ask(request, tx).await.unwrap().into_result().unwrap();

    assert_eq!(result.answer, "A summary. ");
    assert!(result.state.recent_messages.is_empty());
    assert!(manager.registry().is_empty());
    assert_eq!(summarizer.calls(), 0);
}

#[tokio::test]
async fn test_tight_budget_rebases_after_turn() {
    // 2000-token quota: the ten passages nearly exhaust the evidence budget
    let fake = FakeEngine::new(2000);
    fake.push_response(answer_steps(&["Short", "answer."], &["1"]));
    let (manager, _) = manager_with(&fake, Config::default());
    let (tx, _rx) = mpsc::channel(64);

    let request = AskRequest::new("ctx", "paper", "What is shown?");
    let result = manager.ask(request, tx).await.unwrap().into_result().unwrap();

    assert!(result.trim.tight);
    assert!(result.rebased);

    // the prompted session was replaced by one seeded with the turn
    let sessions = fake.sessions();
    let prompted = &sessions[sessions.len() - 2];
    let fresh = sessions.last().unwrap();
    assert!(prompted.is_destroyed());
    assert!(!fresh.is_destroyed());
    assert_eq!(fresh.initial_turns.len(), 3);
    assert_eq!(fresh.initial_turns[1].content, "What is shown?");
    assert_eq!(manager.registry().len(), 1);
}

#[tokio::test]
async fn test_long_history_is_summarized_before_prompting() {
    let fake = FakeEngine::new(8192);
    fake.push_response(answer_steps(&["Yes."], &[]));
    let (manager, summarizer) = manager_with(&fake, Config::default());
    let (tx, _rx) = mpsc::channel(64);

    let long = "x".repeat(4800);
    let history: Vec<ChatMessage> = (0..10)
        .map(|i| {
            if i % 2 == 0 {
                ChatMessage::user(long.clone())
            } else {
                ChatMessage::assistant(long.clone())
            }
        })
        .collect();

    let request = AskRequest::new("ctx", "paper", "Anything else?")
        .with_history(history, Default::default());
    let result = manager.ask(request, tx).await.unwrap().into_result().unwrap();

    assert_eq!(summarizer.calls(), 1);
    assert!(result.rebased);
    assert_eq!(result.state.summary.as_deref(), Some(StubSummarizer::BRIEF));
    assert_eq!(result.state.last_summarized_index, Some(3));
    assert_eq!(result.state.summary_count, 1);
    assert_eq!(result.state.recent_messages.len(), 6);
    assert_eq!(result.state.recent_messages.last().unwrap().content, "Yes. ");

    // history was narrowed to make room for evidence
    assert!(result.trim.history_window < 6);
    assert!(result.trim.floor_met);
    let session = fake.last_session().unwrap();
    assert!(session.initial_turns[0].content.contains(StubSummarizer::BRIEF));
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let fake = FakeEngine::new(4096);
    fake.set_fragment_delay(Duration::from_millis(20));
    let words: Vec<String> = (0..40).map(|i| format!("word{}", i)).collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    fake.push_response(answer_steps(&words, &["1"]));
    let (manager, _) = manager_with(&fake, Config::default());
    let manager = Arc::new(manager);
    let (tx, mut rx) = mpsc::channel(64);

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("ctx", "paper", "q"), tx).await })
    };

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, StreamEvent::Chunk { .. }));
    assert!(manager.cancel("ctx"));

    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Cancelled));

    let mut rest = Vec::new();
    while let Some(event) = rx.recv().await {
        rest.push(event);
    }
    assert_eq!(rest.last(), Some(&StreamEvent::Cancelled));
    assert!(!rest.iter().any(|e| matches!(e, StreamEvent::End { .. })));
}

#[tokio::test]
async fn test_newer_request_supersedes_running_one() {
    let fake = FakeEngine::new(4096);
    fake.set_fragment_delay(Duration::from_millis(20));
    let words: Vec<String> = (0..30).map(|i| format!("slow{}", i)).collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    fake.push_response(answer_steps(&words, &[]));
    fake.push_response(answer_steps(&["Second."], &[]));
    let (manager, _) = manager_with(&fake, Config::default());
    let manager = Arc::new(manager);

    let (tx1, mut rx1) = mpsc::channel(64);
    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ask(AskRequest::new("ctx", "paper", "one"), tx1).await })
    };
    assert!(matches!(rx1.recv().await, Some(StreamEvent::Chunk { .. })));

    let (tx2, _rx2) = mpsc::channel(64);
    let second = manager
        .ask(AskRequest::new("ctx", "paper", "two"), tx2)
        .await
        .unwrap();

    assert!(matches!(first.await.unwrap().unwrap(), TurnOutcome::Cancelled));
    assert_eq!(second.into_result().unwrap().answer, "Second. ");
}

#[tokio::test]
async fn test_broken_stream_keeps_partial_answer() {
    let fake = FakeEngine::new(4096);
    let mut steps = answer_steps(&["Partial", "answer", "that", "keeps", "going"], &[]);
    steps.pop();
    steps.push(Step::Fail);
    fake.push_response(steps);
    let (manager, _) = manager_with(&fake, Config::default());
    let (tx, mut rx) = mpsc::channel(64);

    let result = manager
        .ask(AskRequest::new("ctx", "paper", "q"), tx)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(!result.parsed);
    assert!(result.answer.starts_with("Partial answer"));
    assert!(result.citations.is_empty());
    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(StreamEvent::End { parsed: false, .. })));
}

#[tokio::test]
async fn test_floor_refusal_when_configured() {
    let fake = FakeEngine::new(1024);
    let mut config = Config::default();
    config.qa.refuse_when_floor_unmet = true;
    let (manager, _) = manager_with(&fake, config);
    let (tx, mut rx) = mpsc::channel(64);

    let result = manager.ask(AskRequest::new("ctx", "paper", "q"), tx).await;

    assert!(matches!(result, Err(ContextError::Budget(_))));
    assert!(fake.prompts().is_empty());
    assert!(matches!(drain(&mut rx).last(), Some(StreamEvent::Error { .. })));
}

#[tokio::test]
async fn test_unknown_document_reports_error() {
    let fake = FakeEngine::new(4096);
    let (manager, _) = manager_with(&fake, Config::default());
    let (tx, _rx) = mpsc::channel(64);

    let result = manager.ask(AskRequest::new("ctx", "missing", "q"), tx).await;
    assert!(matches!(result, Err(ContextError::Store(_))));
    assert!(!manager.registry().has_request_in_flight("ctx"));
}

#[tokio::test]
async fn test_handle_dispatches_boundary_requests() {
    let fake = FakeEngine::new(4096);
    fake.push_response(answer_steps(&["Fine."], &[]));
    let (manager, _) = manager_with(&fake, Config::default());
    let (tx, _rx) = mpsc::channel(64);

    let ask = parse_request(
        r#"{"type": "ask", "context_id": "ctx", "doc_id": "paper", "question": "Ok?"}"#,
    )
    .unwrap();
    let response = manager.handle(ask, tx.clone()).await.unwrap();
    assert!(matches!(response, QaResponse::Answered(ref r) if r.answer == "Fine. "));

    let cancel = parse_request(r#"{"type": "cancel", "context_id": "ctx"}"#).unwrap();
    let response = manager.handle(cancel, tx.clone()).await.unwrap();
    assert!(matches!(response, QaResponse::CancelRequested { found: false, .. }));

    let reset = parse_request(r#"{"type": "reset"}"#).unwrap();
    manager.handle(reset, tx).await.unwrap();
    assert!(manager.registry().is_empty());
    assert_eq!(fake.destroyed(), fake.created());
}

#[tokio::test]
async fn test_attach_appends_to_context_session() {
    let fake = FakeEngine::new(4096);
    let (manager, _) = manager_with(&fake, Config::default());

    manager
        .attach(
            "ctx",
            SessionInput::Image {
                mime_type: "image/png".to_string(),
                data: vec![0x89, 0x50, 0x4e, 0x47],
            },
        )
        .await
        .unwrap();

    assert_eq!(fake.last_session().unwrap().appended(), 1);
}

#[tokio::test]
async fn test_engine_backed_summaries_from_config() {
    let fake = FakeEngine::new(8192);
    fake.set_prompt_reply("Engine brief.");
    fake.push_response(answer_steps(&["Done."], &[]));
    let store = InMemoryStore::default().with_document("paper", paper_chunks(10));
    let manager =
        QaManager::from_config(Config::default(), fake.clone().into_engine(), Arc::new(store))
            .unwrap();
    let (tx, _rx) = mpsc::channel(64);

    let long = "y".repeat(4800);
    let history: Vec<ChatMessage> = (0..8)
        .map(|i| {
            if i % 2 == 0 {
                ChatMessage::user(long.clone())
            } else {
                ChatMessage::assistant(long.clone())
            }
        })
        .collect();

    let request =
        AskRequest::new("ctx", "paper", "And then?").with_history(history, Default::default());
    let result = manager.ask(request, tx).await.unwrap().into_result().unwrap();

    assert_eq!(result.state.summary.as_deref(), Some("Engine brief."));
    assert_eq!(result.state.last_summarized_index, Some(1));
    // the summarizer's own context is gone once it answered
    assert_eq!(manager.registry().len(), 1);
    assert!(fake.prompts()[0].contains("Keep the summary under 300 tokens"));
}

#[tokio::test]
async fn test_concurrent_contexts_summarize_independently() {
    let fake = FakeEngine::new(8192);
    fake.set_prompt_reply("Engine brief.");
    fake.set_prompt_delay(Duration::from_millis(50));
    fake.push_response(answer_steps(&["First."], &[]));
    fake.push_response(answer_steps(&["Second."], &[]));
    let store = InMemoryStore::default().with_document("paper", paper_chunks(10));
    let manager =
        QaManager::from_config(Config::default(), fake.clone().into_engine(), Arc::new(store))
            .unwrap();

    let long = "y".repeat(4800);
    let history: Vec<ChatMessage> = (0..8)
        .map(|i| {
            if i % 2 == 0 {
                ChatMessage::user(long.clone())
            } else {
                ChatMessage::assistant(long.clone())
            }
        })
        .collect();

    let (tx_a, _rx_a) = mpsc::channel(64);
    let (tx_b, _rx_b) = mpsc::channel(64);
    let alice = AskRequest::new("alice", "paper", "And then?")
        .with_history(history.clone(), Default::default());
    let bob = AskRequest::new("bob", "paper", "What next?")
        .with_history(history, Default::default());

    let (a, b) = tokio::join!(manager.ask(alice, tx_a), manager.ask(bob, tx_b));
    let a = a.unwrap().into_result().unwrap();
    let b = b.unwrap().into_result().unwrap();

    for result in [&a, &b] {
        assert_eq!(result.state.summary.as_deref(), Some("Engine brief."));
        assert_eq!(result.state.last_summarized_index, Some(1));
    }
    let mut answers = vec![a.answer.clone(), b.answer.clone()];
    answers.sort();
    assert_eq!(answers, vec!["First. ".to_string(), "Second. ".to_string()]);
    // only the two chat sessions remain
    assert_eq!(manager.registry().len(), 2);
}
