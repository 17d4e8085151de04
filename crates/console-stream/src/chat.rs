use serde_json::json;

use crate::transcript::{ChatSnapshot, ChatTurn, Role};

/// Body of an OpenAI-compatible streaming chat completion request.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    /// Replays every completed turn of `history` as the request messages.
    pub fn from_history(model: impl Into<String>, history: &ChatSnapshot) -> Self {
        let mut request = Self::new(model);
        request.messages = history.turns.clone();
        request
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(
            0,
            ChatTurn {
                role: Role::System,
                content: prompt.into(),
            },
        );
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatTurn {
            role: Role::User,
            content: content.into(),
        });
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// JSON body with `stream: true`.
    pub fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
            "stream": true,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}
