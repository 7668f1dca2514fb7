//! Scripted model client for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use loresmith_shared::{ChatMessage, LoresmithError, Result};

use crate::client::ModelClient;

/// Returns a fixed queue of canned responses/failures in order, recording
/// every request it receives. When the queue is exhausted, the fallback
/// response (if any) answers all further requests.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A client that answers every request with the same text.
    pub fn always(text: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(text.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Message lists received so far, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("calls poisoned").clone()
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls poisoned").len()
    }
}

impl ModelClient for ScriptedClient {
    async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<String> {
        self.calls.lock().expect("calls poisoned").push(messages);
        match self.responses.lock().expect("responses poisoned").pop_front() {
            Some(result) => result,
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(LoresmithError::provider("scripted responses exhausted")),
            },
        }
    }
}
