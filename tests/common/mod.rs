//! In-memory fakes of the generation engine, chunk store and summarizer

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docqa_context::context::models::ContentChunk;
use docqa_context::context::summarizer::{Summarizer, SummarizerError};
use docqa_context::engine::{
    Availability, EngineError, EngineResult, GenerationEngine, GenerationSession, InitialTurn,
    PromptOptions, SessionInput, SessionOptions, TextStream,
};
use docqa_context::store::{ChunkStore, StoreError};

fn tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// One streamed item of a scripted response
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Fail,
}

/// Fragments of a well-formed `{"answer", "sources"}` response
pub fn answer_steps(words: &[&str], sources: &[&str]) -> Vec<Step> {
    let mut steps = vec![Step::Text("{\"answer\": \"".to_string())];
    steps.extend(words.iter().map(|w| Step::Text(format!("{} ", w))));
    let sources: Vec<String> = sources.iter().map(|s| format!("\"{}\"", s)).collect();
    steps.push(Step::Text(format!("\", \"sources\": [{}]}}", sources.join(", "))));
    steps
}

struct Shared {
    quota: usize,
    availability: Mutex<Availability>,
    responses: Mutex<VecDeque<Vec<Step>>>,
    prompt_reply: Mutex<String>,
    /// Calls that hang forever before any output
    stalls: AtomicUsize,
    fragment_delay: Mutex<Option<Duration>>,
    prompt_delay: Mutex<Option<Duration>>,
    measure_fails: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

/// Scriptable generation engine
#[derive(Clone)]
pub struct FakeEngine {
    shared: Arc<Shared>,
}

impl FakeEngine {
    pub fn new(quota: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                quota,
                availability: Mutex::new(Availability::Available),
                responses: Mutex::new(VecDeque::new()),
                prompt_reply: Mutex::new("summary".to_string()),
                stalls: AtomicUsize::new(0),
                fragment_delay: Mutex::new(None),
                prompt_delay: Mutex::new(None),
                measure_fails: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_availability(&self, availability: Availability) {
        *self.shared.availability.lock().unwrap() = availability;
    }

    pub fn push_response(&self, steps: Vec<Step>) {
        self.shared.responses.lock().unwrap().push_back(steps);
    }

    pub fn set_prompt_reply(&self, reply: &str) {
        *self.shared.prompt_reply.lock().unwrap() = reply.to_string();
    }

    pub fn stall_next(&self, calls: usize) {
        self.shared.stalls.store(calls, Ordering::SeqCst);
    }

    pub fn set_fragment_delay(&self, delay: Duration) {
        *self.shared.fragment_delay.lock().unwrap() = Some(delay);
    }

    /// Delay before every non-streaming reply
    pub fn set_prompt_delay(&self, delay: Duration) {
        *self.shared.prompt_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_measurements(&self) {
        self.shared.measure_fails.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.shared.prompts.lock().unwrap().clone()
    }

    /// Every session handed out, oldest first
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.shared.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.shared.sessions.lock().unwrap().last().cloned()
    }

    pub fn into_engine(self) -> Arc<dyn GenerationEngine> {
        Arc::new(self)
    }
}

#[async_trait]
impl GenerationEngine for FakeEngine {
    fn id(&self) -> &str {
        "fake-engine"
    }

    async fn availability(&self) -> Availability {
        *self.shared.availability.lock().unwrap()
    }

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> EngineResult<Arc<dyn GenerationSession>> {
        if *self.shared.availability.lock().unwrap() != Availability::Available {
            return Err(EngineError::Unavailable("not downloaded".to_string()));
        }
        let usage = options
            .initial_turns
            .iter()
            .map(|t| tokens(&t.content))
            .sum();
        let session = Arc::new(FakeSession {
            shared: self.shared.clone(),
            initial_turns: options.initial_turns,
            usage: AtomicUsize::new(usage),
            destroyed: AtomicBool::new(false),
            appended: Mutex::new(Vec::new()),
        });
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    shared: Arc<Shared>,
    pub initial_turns: Vec<InitialTurn>,
    usage: AtomicUsize,
    destroyed: AtomicBool,
    appended: Mutex<Vec<SessionInput>>,
}

impl FakeSession {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn appended(&self) -> usize {
        self.appended.lock().unwrap().len()
    }

    fn check_live(&self) -> EngineResult<()> {
        if self.is_destroyed() {
            Err(EngineError::SessionDestroyed)
        } else {
            Ok(())
        }
    }

    async fn maybe_stall(&self) {
        let stalled = self
            .shared
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl GenerationSession for FakeSession {
    async fn prompt(&self, input: &str, _options: &PromptOptions) -> EngineResult<String> {
        self.check_live()?;
        self.maybe_stall().await;
        let delay = *self.shared.prompt_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_live()?;
        self.shared.prompts.lock().unwrap().push(input.to_string());
        let reply = self.shared.prompt_reply.lock().unwrap().clone();
        self.usage
            .fetch_add(tokens(input) + tokens(&reply), Ordering::SeqCst);
        Ok(reply)
    }

    async fn prompt_streaming(
        &self,
        input: &str,
        _options: &PromptOptions,
    ) -> EngineResult<TextStream> {
        self.check_live()?;
        self.maybe_stall().await;
        self.shared.prompts.lock().unwrap().push(input.to_string());

        let steps = self
            .shared
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| answer_steps(&["ok"], &[]));
        let output: usize = steps
            .iter()
            .map(|s| match s {
                Step::Text(t) => tokens(t),
                Step::Fail => 0,
            })
            .sum();
        self.usage.fetch_add(tokens(input) + output, Ordering::SeqCst);

        let delay = *self.shared.fragment_delay.lock().unwrap();
        let stream = futures::stream::iter(steps).then(move |step| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match step {
                Step::Text(text) => Ok(text),
                Step::Fail => Err(EngineError::Prompt("stream broke".to_string())),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn measure_input_usage(&self, input: &str) -> EngineResult<usize> {
        if self.shared.measure_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Measurement("unsupported".to_string()));
        }
        Ok(tokens(input))
    }

    fn input_usage(&self) -> usize {
        self.usage.load(Ordering::SeqCst)
    }

    fn input_quota(&self) -> usize {
        self.shared.quota
    }

    async fn append(&self, input: SessionInput) -> EngineResult<()> {
        self.check_live()?;
        self.appended.lock().unwrap().push(input);
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Chunk store over fixed per-document chunk lists
#[derive(Default)]
pub struct InMemoryStore {
    documents: HashMap<String, Vec<ContentChunk>>,
    last_limit: Mutex<Option<usize>>,
}

impl InMemoryStore {
    pub fn with_document(mut self, doc_id: &str, chunks: Vec<ContentChunk>) -> Self {
        self.documents.insert(doc_id.to_string(), chunks);
        self
    }

    pub fn last_limit(&self) -> Option<usize> {
        *self.last_limit.lock().unwrap()
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn get_relevant_chunks(
        &self,
        doc_id: &str,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<ContentChunk>, StoreError> {
        *self.last_limit.lock().unwrap() = Some(limit);
        let chunks = self
            .documents
            .get(doc_id)
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        Ok(chunks.iter().take(limit).cloned().collect())
    }

    async fn average_chunk_chars(&self, doc_id: &str) -> Result<Option<usize>, StoreError> {
        let chunks = self
            .documents
            .get(doc_id)
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        if chunks.is_empty() {
            return Ok(None);
        }
        let total: usize = chunks.iter().map(|c| c.content.chars().count()).sum();
        Ok(Some(total / chunks.len()))
    }
}

/// `n` chunks of 400 characters (100 tokens) each
pub fn paper_chunks(n: usize) -> Vec<ContentChunk> {
    (0..n)
        .map(|i| {
            let body = format!("Passage {:02} ", i);
            let content: String = body.chars().cycle().take(400).collect();
            ContentChunk::new(format!("chunk-{}", i), content, 100)
                .with_section(format!("Section {}", i / 3 + 1))
                .with_order(i)
                .with_page(i as u32 / 4 + 1)
        })
        .collect()
}

/// Summarizer returning a fixed brief and counting calls
#[derive(Default)]
pub struct StubSummarizer {
    pub calls: AtomicUsize,
}

impl StubSummarizer {
    pub const BRIEF: &'static str = "Earlier the user asked about the method section.";

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, _texts: &[String], _max_tokens: usize) -> Result<String, SummarizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::BRIEF.to_string())
    }
}
