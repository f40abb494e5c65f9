//! Script destination
//!
//! Evaluates a user script as the destination body; the script's return
//! value becomes the dispatch response per the script-bridge contract
//! (response object, bare status, string body, or nothing).

use super::DestinationConnector;
use crate::error::Result;
use crate::model::{ConnectorMessage, Response};
use crate::script::{ScriptEngine, ScriptScope, with_timeout};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct ScriptDestination {
    name: String,
    script: String,
    engine: Arc<dyn ScriptEngine>,
    timeout: Duration,
}

impl ScriptDestination {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<String>,
        engine: Arc<dyn ScriptEngine>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            engine,
            timeout,
        }
    }
}

#[async_trait]
impl DestinationConnector for ScriptDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, cm: &ConnectorMessage, payload: &str) -> Result<Response> {
        let mut scope = ScriptScope {
            channel_id: cm.channel_id.clone(),
            connector_name: Some(self.name.clone()),
            meta_data_id: Some(cm.meta_data_id),
            message: payload.to_string(),
            raw: payload.to_string(),
            source_map: cm.source_map.clone(),
            channel_map: cm.channel_map.clone(),
            ..Default::default()
        };
        let outcome = with_timeout(
            self.timeout,
            "script destination",
            self.engine.run_destination(&self.script, &mut scope),
        )
        .await?;
        Ok(outcome.into_response())
    }
}
