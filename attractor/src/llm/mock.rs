//! Mock LLM client for tests.
//!
//! Scripted one-shot responses and session event lists; records every
//! request so tests can assert routing, failover order and retry counts.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{
    ApiResponse, LlmClient, LlmError, LlmSession, OneShotRequest, SessionEvent, SessionOptions,
};

/// One scripted reply: a response or an error to return.
pub enum MockReply {
    Text(String),
    Error(LlmError),
}

/// Mock client: pops scripted replies in order; repeats the last text reply
/// when the script runs dry. Thread-safe so the router can share it.
#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    session_events: Mutex<VecDeque<Vec<SessionEvent>>>,
    requests: Mutex<Vec<OneShotRequest>>,
    sessions_opened: Mutex<Vec<SessionOptions>>,
    providers: Vec<String>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        MockLlmClient {
            providers: vec!["openai".into(), "anthropic".into(), "google".into()],
            ..Default::default()
        }
    }

    pub fn with_providers(mut self, providers: &[&str]) -> Self {
        self.providers = providers.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(MockReply::Text(text.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(MockReply::Error(err));
    }

    /// Queues one session's scripted event list.
    pub fn push_session(&self, events: Vec<SessionEvent>) {
        self.session_events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(events);
    }

    pub fn requests(&self) -> Vec<OneShotRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider_names(&self) -> Vec<String> {
        self.providers.clone()
    }

    async fn one_shot(&self, req: &OneShotRequest) -> Result<ApiResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req.clone());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match reply {
            Some(MockReply::Text(text)) => Ok(ApiResponse {
                raw: serde_json::json!({ "mock": true, "text": text }),
                text,
            }),
            Some(MockReply::Error(err)) => Err(err),
            None => Ok(ApiResponse {
                text: "mock reply".to_string(),
                raw: serde_json::json!({ "mock": true }),
            }),
        }
    }

    async fn open_session(&self, opts: &SessionOptions) -> Result<Box<dyn LlmSession>, LlmError> {
        self.sessions_opened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(opts.clone());
        let events = self
            .session_events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    SessionEvent::SessionStart { session_id: "mock-session".into() },
                    SessionEvent::SessionEnd { final_text: Some("mock reply".into()) },
                ]
            });
        Ok(Box::new(MockSession {
            events: events.into(),
        }))
    }
}

struct MockSession {
    events: VecDeque<SessionEvent>,
}

#[async_trait]
impl LlmSession for MockSession {
    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }
}
