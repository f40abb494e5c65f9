//! User-script bridge
//!
//! The pipeline calls into an opaque [`ScriptEngine`] at well-defined
//! points: preprocessor, filter, transformer, response transformer,
//! postprocessor, deploy/undeploy scripts and script destinations. The
//! engine is a collaborator implementing this trait (a JavaScript runtime in
//! a full deployment); the crate ships [`PassthroughScriptEngine`], which
//! accepts everything and changes nothing, as the default.
//!
//! Every invocation is bounded by the configured wall-clock timeout; an
//! overrun surfaces as a script error on the connector message.

use crate::error::{EngineError, Result};
use crate::model::{Response, Status};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// The ambient variable bag a script sees during one pipeline step
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
    pub channel_id: String,
    pub channel_name: String,
    /// Set for connector-level scripts, absent for channel-level ones
    pub connector_name: Option<String>,
    pub meta_data_id: Option<i32>,

    /// The transformable form of the message; transformers may replace it
    pub message: String,
    /// The original raw text, read-only
    pub raw: String,

    /// Read-only facts about the receive event
    pub source_map: Arc<HashMap<String, Value>>,
    pub channel_map: HashMap<String, Value>,
    pub connector_map: HashMap<String, Value>,
    /// Destination responses keyed by destination name and `d{metaDataId}`
    pub response_map: HashMap<String, Value>,
}

impl ScriptScope {
    /// Channel map lookup with read-through to the source map
    pub fn channel_value(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.channel_map.get(key) {
            return Some(value);
        }
        let fallback = self.source_map.get(key);
        if fallback.is_some() {
            tracing::debug!(key, "channel map read fell back to source map");
        }
        fallback
    }
}

/// What a script destination returned
#[derive(Debug, Clone)]
pub enum ScriptOutcome {
    /// A full response object
    Response(Response),
    /// A bare status; the response body is empty
    Status(Status),
    /// A string body; status defaults to sent
    Body(String),
    /// Nothing; status defaults to sent with an empty body
    Empty,
}

impl ScriptOutcome {
    pub fn into_response(self) -> Response {
        match self {
            ScriptOutcome::Response(response) => response,
            ScriptOutcome::Status(status) => Response {
                status,
                message: String::new(),
                status_message: None,
                error: None,
            },
            ScriptOutcome::Body(body) => Response::sent(body),
            ScriptOutcome::Empty => Response::sent(""),
        }
    }
}

/// Opaque user-script evaluator
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Filter: true keeps the message, false filters it out
    async fn run_filter(&self, script: &str, scope: &mut ScriptScope) -> Result<bool>;

    /// Transformer: may mutate `scope.message` and the writable maps
    async fn run_transformer(&self, script: &str, scope: &mut ScriptScope) -> Result<()>;

    /// Preprocessor: returns a replacement raw text, or None to keep it
    async fn run_preprocessor(&self, script: &str, scope: &mut ScriptScope)
    -> Result<Option<String>>;

    /// Postprocessor: may return a response for the source to relay
    async fn run_postprocessor(
        &self,
        script: &str,
        scope: &mut ScriptScope,
    ) -> Result<Option<Response>>;

    /// Response transformer: may mutate the response message in
    /// `scope.message` and the response map
    async fn run_response_transformer(&self, script: &str, scope: &mut ScriptScope) -> Result<()>;

    /// Deploy/undeploy scripts; outcome is success or error only
    async fn run_lifecycle_script(&self, script: &str, scope: &mut ScriptScope) -> Result<()>;

    /// Script destination body
    async fn run_destination(&self, script: &str, scope: &mut ScriptScope)
    -> Result<ScriptOutcome>;
}

/// Default engine: accepts every message and changes nothing
pub struct PassthroughScriptEngine;

#[async_trait]
impl ScriptEngine for PassthroughScriptEngine {
    async fn run_filter(&self, _script: &str, _scope: &mut ScriptScope) -> Result<bool> {
        Ok(true)
    }

    async fn run_transformer(&self, _script: &str, _scope: &mut ScriptScope) -> Result<()> {
        Ok(())
    }

    async fn run_preprocessor(
        &self,
        _script: &str,
        _scope: &mut ScriptScope,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run_postprocessor(
        &self,
        _script: &str,
        _scope: &mut ScriptScope,
    ) -> Result<Option<Response>> {
        Ok(None)
    }

    async fn run_response_transformer(
        &self,
        _script: &str,
        _scope: &mut ScriptScope,
    ) -> Result<()> {
        Ok(())
    }

    async fn run_lifecycle_script(&self, _script: &str, _scope: &mut ScriptScope) -> Result<()> {
        Ok(())
    }

    async fn run_destination(
        &self,
        _script: &str,
        _scope: &mut ScriptScope,
    ) -> Result<ScriptOutcome> {
        Ok(ScriptOutcome::Empty)
    }
}

/// Run a script call under the engine-wide wall-clock budget
pub async fn with_timeout<T, F>(budget: Duration, label: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Script(format!(
            "{} exceeded its {}s budget",
            label,
            budget.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_accepts_and_preserves() {
        let engine = PassthroughScriptEngine;
        let mut scope = ScriptScope {
            message: "payload".into(),
            ..Default::default()
        };
        assert!(engine.run_filter("", &mut scope).await.unwrap());
        engine.run_transformer("", &mut scope).await.unwrap();
        assert_eq!(scope.message, "payload");
    }

    #[tokio::test]
    async fn timeout_maps_to_script_error() {
        let result = with_timeout(Duration::from_millis(20), "filter", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        })
        .await;
        assert!(matches!(result, Err(EngineError::Script(_))));
    }

    #[test]
    fn script_outcomes_map_to_responses() {
        assert_eq!(ScriptOutcome::Empty.into_response().status, Status::Sent);
        assert_eq!(
            ScriptOutcome::Body("ACK".into()).into_response().message,
            "ACK"
        );
        assert_eq!(
            ScriptOutcome::Status(Status::Error).into_response().status,
            Status::Error
        );
    }
}
