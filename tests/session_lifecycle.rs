//! Session registry, cancellation and retry behavior

mod common;

use common::FakeEngine;
use std::time::Duration;

use docqa_context::context::models::{ChatMessage, ConversationState, Role};
use docqa_context::context::summarizer::{EngineSummarizer, Summarizer};
use docqa_context::engine::{PromptOptions, SessionOptions};
use docqa_context::error::ContextError;
use docqa_context::session::{prompt_with_retry, RetryPolicy, SessionRegistry};

fn fast_policy(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        timeout_ms: 50,
        max_attempts,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

#[tokio::test]
async fn test_one_session_per_context() {
    let fake = FakeEngine::new(4096);
    let registry = SessionRegistry::new(fake.clone().into_engine());
    let options = SessionOptions::with_system_prompt("sys");

    let a1 = registry.get_or_create("a", &options).await.unwrap();
    let a2 = registry.get_or_create("a", &options).await.unwrap();
    registry.get_or_create("b", &options).await.unwrap();

    assert!(std::sync::Arc::ptr_eq(&a1, &a2));
    assert_eq!(registry.len(), 2);
    assert_eq!(fake.created(), 2);
}

#[tokio::test]
async fn test_new_request_supersedes_previous() {
    let fake = FakeEngine::new(4096);
    let registry = SessionRegistry::new(fake.into_engine());

    let first = registry.begin_request("ctx");
    let second = registry.begin_request("ctx");
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());

    // the stale guard must not release the newer request
    registry.finish_request(&first);
    assert!(registry.has_request_in_flight("ctx"));

    registry.finish_request(&second);
    assert!(!registry.has_request_in_flight("ctx"));
    assert!(!registry.cancel("ctx"));
}

#[tokio::test]
async fn test_requests_on_other_contexts_unaffected() {
    let fake = FakeEngine::new(4096);
    let registry = SessionRegistry::new(fake.into_engine());

    let a = registry.begin_request("a");
    let b = registry.begin_request("b");
    assert!(registry.cancel("a"));
    assert!(a.is_cancelled());
    assert!(!b.is_cancelled());
}

#[tokio::test]
async fn test_clone_session_rebases_onto_state() {
    let fake = FakeEngine::new(4096);
    let registry = SessionRegistry::new(fake.clone().into_engine());
    registry
        .get_or_create("ctx", &SessionOptions::with_system_prompt("sys"))
        .await
        .unwrap();
    let old = fake.last_session().unwrap();

    let mut state = ConversationState::new();
    state.summary = Some("They discussed the abstract.".to_string());
    state.recent_messages = vec![ChatMessage::user("q1"), ChatMessage::assistant("a1")];

    registry.clone_session("ctx", &state, "sys").await.unwrap();

    assert!(old.is_destroyed());
    assert_eq!(registry.len(), 1);
    let fresh = fake.last_session().unwrap();
    assert!(!fresh.is_destroyed());
    assert_eq!(fresh.initial_turns.len(), 3);
    assert_eq!(fresh.initial_turns[0].role, Role::System);
    assert!(fresh.initial_turns[0]
        .content
        .contains("They discussed the abstract."));
    assert_eq!(fresh.initial_turns[2].content, "a1");
}

#[tokio::test]
async fn test_reset_destroys_everything() {
    let fake = FakeEngine::new(4096);
    let registry = SessionRegistry::new(fake.clone().into_engine());
    let options = SessionOptions::with_system_prompt("sys");
    registry.get_or_create("a", &options).await.unwrap();
    registry.get_or_create("b", &options).await.unwrap();
    let guard = registry.begin_request("a");

    registry.reset().await;

    assert!(registry.is_empty());
    assert!(guard.is_cancelled());
    assert_eq!(fake.destroyed(), 2);
}

#[tokio::test]
async fn test_timeout_recreates_session_and_retries() {
    let fake = FakeEngine::new(4096);
    fake.set_prompt_reply("done");
    fake.stall_next(1);
    let registry = SessionRegistry::new(fake.clone().into_engine());
    let guard = registry.begin_request("ctx");

    let reply = prompt_with_retry(
        &registry,
        "ctx",
        &SessionOptions::with_system_prompt("sys"),
        "hello",
        &PromptOptions::default(),
        &fast_policy(3),
        guard.token(),
    )
    .await
    .unwrap();

    assert_eq!(reply, "done");
    assert_eq!(fake.created(), 2);
    assert!(fake.sessions()[0].is_destroyed());
    assert!(!fake.sessions()[1].is_destroyed());
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let fake = FakeEngine::new(4096);
    fake.stall_next(5);
    let registry = SessionRegistry::new(fake.clone().into_engine());
    let guard = registry.begin_request("ctx");

    let result = prompt_with_retry(
        &registry,
        "ctx",
        &SessionOptions::with_system_prompt("sys"),
        "hello",
        &PromptOptions::default(),
        &fast_policy(2),
        guard.token(),
    )
    .await;

    assert!(matches!(result, Err(ContextError::Timeout { attempts: 2 })));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_cancellation_is_not_retried() {
    let fake = FakeEngine::new(4096);
    fake.stall_next(1);
    let registry = std::sync::Arc::new(SessionRegistry::new(fake.clone().into_engine()));
    let guard = registry.begin_request("ctx");

    let canceller = {
        let registry = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.cancel("ctx")
        })
    };

    let policy = RetryPolicy {
        timeout_ms: 5_000,
        ..fast_policy(3)
    };
    let result = prompt_with_retry(
        &registry,
        "ctx",
        &SessionOptions::with_system_prompt("sys"),
        "hello",
        &PromptOptions::default(),
        &policy,
        guard.token(),
    )
    .await;

    assert!(canceller.await.unwrap());
    assert!(matches!(result, Err(ContextError::Cancelled)));
    assert_eq!(fake.created(), 1);
}

#[tokio::test]
async fn test_overlapping_engine_summaries_are_independent() {
    let fake = FakeEngine::new(4096);
    fake.set_prompt_reply("brief");
    fake.set_prompt_delay(Duration::from_millis(100));
    let registry = std::sync::Arc::new(SessionRegistry::new(fake.clone().into_engine()));
    let summarizer = EngineSummarizer::new(
        registry.clone(),
        RetryPolicy {
            timeout_ms: 5_000,
            ..fast_policy(1)
        },
    );

    let first_texts = vec!["user: first conversation".to_string()];
    let second_texts = vec!["user: second conversation".to_string()];
    let first = summarizer.summarize(&first_texts, 100);
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        summarizer.summarize(&second_texts, 100).await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), "brief");
    assert_eq!(second.unwrap(), "brief");
    assert_eq!(fake.created(), 2);
    assert_eq!(fake.destroyed(), 2);
    assert!(registry.is_empty());
}
