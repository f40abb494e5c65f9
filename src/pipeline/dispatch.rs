//! Destination dispatch runtime
//!
//! One `DestinationDispatcher` per destination, shared by the synchronous
//! pipeline path and the queue worker so both record attempts, responses and
//! failures identically. A dispatch counted as sent always corresponds to a
//! successful transport acknowledgement; everything else is a failure that
//! either requeues or finalizes as an error.

use crate::connector::DestinationConnector;
use crate::error::{EngineError, Result};
use crate::model::{
    ConnectorMessage, ContentType, DestinationConfig, MessageContent, Response, Status,
};
use crate::script::{ScriptEngine, ScriptScope, with_timeout};
use crate::store::{MessageStore, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one dispatch attempt
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Delivered(Response),
    Failed {
        error: String,
        /// Transient failures re-enter the retry loop; non-retryable ones
        /// (script, configuration, store) fail the message outright
        retryable: bool,
    },
}

pub struct DestinationDispatcher {
    channel_id: String,
    server_id: String,
    config: DestinationConfig,
    connector: Arc<dyn DestinationConnector>,
    store: Arc<dyn Store>,
    script_engine: Arc<dyn ScriptEngine>,
    script_timeout: Duration,
}

impl DestinationDispatcher {
    pub fn new(
        channel_id: impl Into<String>,
        server_id: impl Into<String>,
        config: DestinationConfig,
        connector: Arc<dyn DestinationConnector>,
        store: Arc<dyn Store>,
        script_engine: Arc<dyn ScriptEngine>,
        script_timeout: Duration,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            server_id: server_id.into(),
            config,
            connector,
            store,
            script_engine,
            script_timeout,
        }
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn connector_name(&self) -> &str {
        self.connector.name()
    }

    /// Load the payload to send for a message: the encoded content when the
    /// transformer produced one, the raw content otherwise, with attachment
    /// tokens re-inflated.
    pub async fn load_payload(&self, message_id: i64) -> Result<String> {
        let content = match self
            .store
            .load_content(
                &self.channel_id,
                message_id,
                self.config.meta_data_id,
                ContentType::Encoded,
            )
            .await?
        {
            Some(content) => content,
            None => self
                .store
                .load_content(&self.channel_id, message_id, 0, ContentType::Raw)
                .await?
                .ok_or_else(|| {
                    EngineError::Store(crate::error::StoreError::Integrity(format!(
                        "message {} has no dispatchable content",
                        message_id
                    )))
                })?,
        };
        self.reattach(message_id, content.content).await
    }

    /// Substitute `${ATTACH:id}` tokens with the stored attachment bytes
    async fn reattach(&self, message_id: i64, payload: String) -> Result<String> {
        if !payload.contains("${ATTACH:") {
            return Ok(payload);
        }
        let mut result = String::with_capacity(payload.len());
        let mut rest = payload.as_str();
        while let Some(start) = rest.find("${ATTACH:") {
            result.push_str(&rest[..start]);
            let after = &rest[start + "${ATTACH:".len()..];
            let Some(end) = after.find('}') else {
                // unterminated token passes through untouched
                result.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let attachment_id = &after[..end];
            match self
                .store
                .load_attachment(&self.channel_id, message_id, attachment_id)
                .await?
            {
                Some(attachment) => {
                    result.push_str(&String::from_utf8_lossy(&attachment.content));
                }
                None => {
                    warn!(
                        channel_id = %self.channel_id,
                        message_id,
                        attachment_id,
                        "attachment token references missing attachment"
                    );
                }
            }
            rest = &after[end + 1..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Perform exactly one transport dispatch. No persistence happens here;
    /// the caller records the outcome.
    pub async fn dispatch_once(&self, message_id: i64, payload: &str) -> DispatchOutcome {
        let cm = ConnectorMessage::new(
            message_id,
            self.config.meta_data_id,
            &self.channel_id,
            &self.config.name,
            &self.server_id,
            Status::Pending,
        );
        match self.connector.dispatch(&cm, payload).await {
            Ok(response) if response.status == Status::Error => DispatchOutcome::Failed {
                error: response
                    .error
                    .or(response.status_message)
                    .unwrap_or_else(|| "destination rejected the message".to_string()),
                // the remote answered; it may accept on a later attempt
                retryable: true,
            },
            Ok(response) => DispatchOutcome::Delivered(response),
            Err(e) => DispatchOutcome::Failed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }

    /// Persist a successful dispatch: sent status, attempt count, response
    /// content, and the response transformer's output when configured.
    pub async fn record_success(
        &self,
        message_id: i64,
        attempts: u32,
        response: &Response,
    ) -> Result<Response> {
        let now = Utc::now();
        self.store
            .update_send_result(
                &self.channel_id,
                message_id,
                self.config.meta_data_id,
                Status::Sent,
                attempts,
                Some(now),
                Some(now),
                None,
            )
            .await?;

        let serialized = serde_json::to_string(response)?;
        self.store
            .store_content(
                &self.channel_id,
                &MessageContent::new(
                    message_id,
                    self.config.meta_data_id,
                    ContentType::Response,
                    serialized,
                ),
            )
            .await?;

        let mut effective = response.clone();
        if let Some(script) = &self.config.response_transformer {
            match self.run_response_transformer(script, message_id, response).await {
                Ok(Some(transformed)) => effective = transformed,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        channel_id = %self.channel_id,
                        message_id,
                        error = %e,
                        "response transformer failed"
                    );
                    self.store
                        .store_content(
                            &self.channel_id,
                            &MessageContent::new(
                                message_id,
                                self.config.meta_data_id,
                                ContentType::ResponseError,
                                e.to_string(),
                            ),
                        )
                        .await?;
                }
            }
        }
        debug!(
            channel_id = %self.channel_id,
            message_id,
            destination = %self.config.name,
            attempts,
            "dispatch succeeded"
        );
        Ok(effective)
    }

    async fn run_response_transformer(
        &self,
        script: &str,
        message_id: i64,
        response: &Response,
    ) -> Result<Option<Response>> {
        let mut scope = ScriptScope {
            channel_id: self.channel_id.clone(),
            connector_name: Some(self.config.name.clone()),
            meta_data_id: Some(self.config.meta_data_id),
            message: response.message.clone(),
            ..Default::default()
        };
        with_timeout(
            self.script_timeout,
            "response transformer",
            self.script_engine.run_response_transformer(script, &mut scope),
        )
        .await?;

        if scope.message == response.message {
            return Ok(None);
        }
        let transformed = Response {
            message: scope.message.clone(),
            ..response.clone()
        };
        self.store
            .store_content(
                &self.channel_id,
                &MessageContent::new(
                    message_id,
                    self.config.meta_data_id,
                    ContentType::ResponseTransformed,
                    scope.message,
                ),
            )
            .await?;
        Ok(Some(transformed))
    }

    /// Persist a failed attempt. `requeue` keeps the message queued for
    /// another try; otherwise the destination finalizes as an error.
    pub async fn record_failure(
        &self,
        message_id: i64,
        attempts: u32,
        error: &str,
        requeue: bool,
    ) -> Result<()> {
        let status = if requeue { Status::Queued } else { Status::Error };
        self.store
            .update_send_result(
                &self.channel_id,
                message_id,
                self.config.meta_data_id,
                status,
                attempts,
                Some(Utc::now()),
                None,
                Some(error),
            )
            .await?;
        self.store
            .store_content(
                &self.channel_id,
                &MessageContent::new(
                    message_id,
                    self.config.meta_data_id,
                    ContentType::ProcessingError,
                    error,
                ),
            )
            .await?;
        if !requeue {
            warn!(
                channel_id = %self.channel_id,
                message_id,
                destination = %self.config.name,
                attempts,
                error,
                "dispatch failed permanently"
            );
        }
        Ok(())
    }

    /// Persist a halt interrupting an in-flight dispatch
    pub async fn record_halted(&self, message_id: i64, attempts: u32) -> Result<()> {
        self.record_failure(
            message_id,
            attempts,
            &EngineError::Halted.to_string(),
            false,
        )
        .await
    }
}
