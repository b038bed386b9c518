//! In-memory generation provider for tests.
//!
//! `ScriptedProvider` answers from a closure or a fixed script and records
//! every request it receives, so tests can assert on exactly what a judge
//! or generator saw.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{Generation, GenerationProvider, GenerationRequest, ProviderFailure};
use crate::domain::Dimension;

type Responder = dyn Fn(&GenerationRequest) -> Result<Generation, ProviderFailure> + Send + Sync;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ScriptedProvider {
    responder: Box<Responder>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<Generation, ProviderFailure> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Reply with `text` to every request.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(Generation::text(text.clone())))
    }

    /// Reply from `script` in order; once exhausted every call is transient.
    pub fn sequence(script: Vec<Result<Generation, ProviderFailure>>) -> Self {
        let script = Mutex::new(VecDeque::from(script));
        Self::new(move |_| {
            lock(&script)
                .pop_front()
                .unwrap_or_else(|| Err(ProviderFailure::Transient("script exhausted".into())))
        })
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, ProviderFailure> {
        lock(&self.requests).push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = (self.responder)(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// What a provider request is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    /// Output generation for a rendered case prompt.
    Output,
    /// Judge call for one dimension.
    Judge(Dimension),
    /// Candidate template generation.
    Candidates,
}

pub fn classify(request: &GenerationRequest) -> CallKind {
    match request.system.as_deref() {
        None => CallKind::Output,
        Some(system) if system.starts_with("You are an impartial evaluator") => {
            let dimension = request
                .prompt
                .lines()
                .rev()
                .find_map(|l| l.strip_prefix("Dimension: "))
                .unwrap_or_default();
            CallKind::Judge(Dimension::from(dimension.trim()))
        }
        Some(_) => CallKind::Candidates,
    }
}

/// Judge reply with `score`.
pub fn verdict(score: f64) -> String {
    let weaknesses: Vec<&str> = if score < 0.7 {
        vec!["falls short"]
    } else {
        Vec::new()
    };
    serde_json::json!({
        "score": score,
        "explanation": format!("scored {score}"),
        "strengths": [],
        "weaknesses": weaknesses,
    })
    .to_string()
}

/// Generator reply proposing `templates`.
pub fn candidates_reply(templates: &[&str]) -> String {
    let items: Vec<serde_json::Value> = templates
        .iter()
        .map(|t| serde_json::json!({"template": t, "rationale": "targets the failure clusters"}))
        .collect();
    serde_json::json!({ "candidates": items }).to_string()
}
