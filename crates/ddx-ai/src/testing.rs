//! Scripted model client for pipeline tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ModelClient, ModelError};

/// What the scripted model does with one call.
pub enum Reply {
    Text(String),
    Fail(u16),
    /// Never answers within any reasonable timeout.
    Hang,
}

impl Reply {
    pub fn json(v: serde_json::Value) -> Self {
        Self::Text(v.to_string())
    }
}

type Script = Box<dyn Fn(&str) -> Reply + Send + Sync>;

/// Answers each call by running the user prompt through a closure, and
/// records every user prompt it saw.
pub struct ScriptedClient {
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Reduction prompts are the only ones that open with this phrase.
pub fn is_reduce_prompt(user: &str) -> bool {
    user.starts_with("You are synthesizing")
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn invoke(
        &self,
        _system: &str,
        user: &str,
        _strict_json: bool,
    ) -> Result<String, ModelError> {
        self.calls.lock().unwrap().push(user.to_string());
        match (self.script)(user) {
            Reply::Text(text) => Ok(text),
            Reply::Fail(status) => Err(ModelError::Server {
                status,
                body: "scripted failure".into(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ModelError::EmptyResponse)
            }
        }
    }
}
