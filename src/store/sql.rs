//! PostgreSQL store backend with async SQLx
//!
//! Core and cluster tables are created idempotently at startup; the
//! per-channel message tables are created on first deploy and named from the
//! sanitized channel id. All dynamic identifiers pass through
//! [`super::table_suffix`] before they reach a DDL string.

use super::{
    ClusterEventRow, ClusterStore, EventStore, Lease, LeaseStore, MessageStore, QueueEntry,
    SequenceStore, ServerInfo, table_suffix,
};
use crate::error::{Result, StoreError};
use crate::model::{
    Attachment, ChannelConfig, ConnectorMessage, ContentType, Message, MessageContent,
    MetadataColumn, MetadataColumnType, MetadataValue, Status,
};
use crate::store::encryption::{ContentEncryptor, NoopEncryptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Statements that create the core and cluster tables; all idempotent
const CORE_TABLE_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS channels (
        id varchar(36) PRIMARY KEY,
        name varchar(255) NOT NULL,
        revision integer NOT NULL DEFAULT 1,
        body text NOT NULL,
        enabled boolean NOT NULL DEFAULT true
    )"#,
    r#"CREATE TABLE IF NOT EXISTS configuration (
        category varchar(255) NOT NULL,
        name varchar(255) NOT NULL,
        value text,
        PRIMARY KEY (category, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS persons (
        id serial PRIMARY KEY,
        username varchar(255) NOT NULL UNIQUE,
        email varchar(255),
        description text,
        logged_in boolean NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS person_passwords (
        person_id integer NOT NULL REFERENCES persons (id) ON DELETE CASCADE,
        password varchar(255) NOT NULL,
        date_created timestamptz NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS person_preferences (
        person_id integer NOT NULL REFERENCES persons (id) ON DELETE CASCADE,
        name varchar(255) NOT NULL,
        value text,
        PRIMARY KEY (person_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS events (
        id bigserial PRIMARY KEY,
        date_created timestamptz NOT NULL DEFAULT now(),
        name text NOT NULL,
        level varchar(16) NOT NULL,
        outcome varchar(16) NOT NULL,
        attributes text,
        user_id integer,
        ip_address varchar(64),
        server_id varchar(36)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alerts (
        id varchar(36) PRIMARY KEY,
        name varchar(255) NOT NULL,
        body text NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS code_templates (
        id varchar(36) PRIMARY KEY,
        name varchar(255) NOT NULL,
        revision integer NOT NULL DEFAULT 1,
        body text NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS code_template_libraries (
        id varchar(36) PRIMARY KEY,
        name varchar(255) NOT NULL,
        revision integer NOT NULL DEFAULT 1,
        body text NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_groups (
        id varchar(36) PRIMARY KEY,
        name varchar(255) NOT NULL,
        revision integer NOT NULL DEFAULT 1,
        body text NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS scripts (
        group_id varchar(40) NOT NULL,
        id varchar(40) NOT NULL,
        script text,
        PRIMARY KEY (group_id, id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS servers (
        server_id varchar(36) PRIMARY KEY,
        hostname varchar(255) NOT NULL,
        port integer,
        api_url varchar(255),
        started_at timestamptz NOT NULL,
        last_heartbeat timestamptz NOT NULL,
        status varchar(16) NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_deployments (
        server_id varchar(36) NOT NULL,
        channel_id varchar(36) NOT NULL,
        deployed_at timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (server_id, channel_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cluster_events (
        id bigserial PRIMARY KEY,
        channel varchar(255) NOT NULL,
        data text NOT NULL,
        created_at timestamptz NOT NULL DEFAULT now(),
        server_id varchar(36) NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS cluster_events_id_server
        ON cluster_events (id, server_id)"#,
    r#"CREATE TABLE IF NOT EXISTS global_maps (
        scope varchar(255) NOT NULL,
        map_key varchar(255) NOT NULL,
        value text,
        version bigint NOT NULL DEFAULT 0,
        updated_at timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (scope, map_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS artifact_sync (
        id bigserial PRIMARY KEY,
        artifact_type varchar(32) NOT NULL,
        artifact_id varchar(36) NOT NULL,
        revision integer NOT NULL,
        commit_hash varchar(64),
        sync_direction varchar(16) NOT NULL,
        synced_at timestamptz NOT NULL DEFAULT now(),
        synced_by varchar(255),
        environment varchar(64)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS polling_leases (
        channel_id varchar(36) PRIMARY KEY,
        server_id varchar(36) NOT NULL,
        acquired_at timestamptz NOT NULL,
        renewed_at timestamptz NOT NULL,
        expires_at timestamptz NOT NULL
    )"#,
];

/// Built-in columns on the custom metadata table, never touched by sync
const MCM_BUILTIN_COLUMNS: &[&str] = &["message_id", "metadata_id"];

struct ChannelTableNames {
    m: String,
    mm: String,
    mc: String,
    mcm: String,
    ma: String,
    msq: String,
}

impl ChannelTableNames {
    fn for_channel(channel_id: &str) -> Result<Self> {
        let suffix = table_suffix(channel_id)?;
        Ok(Self {
            m: format!("d_m{}", suffix),
            mm: format!("d_mm{}", suffix),
            mc: format!("d_mc{}", suffix),
            mcm: format!("d_mcm{}", suffix),
            ma: format!("d_ma{}", suffix),
            msq: format!("d_msq{}", suffix),
        })
    }
}

/// Main PostgreSQL store for the engine
pub struct SqlStore {
    pool: PgPool,
    encryptor: Arc<dyn ContentEncryptor>,
}

impl SqlStore {
    /// Connect and build a store without content encryption
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Self::connect_with_encryptor(database_url, max_connections, Arc::new(NoopEncryptor)).await
    }

    pub async fn connect_with_encryptor(
        database_url: &str,
        max_connections: u32,
        encryptor: Arc<dyn ContentEncryptor>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(StoreError::from)?;
        info!("connected to message store");
        Ok(Self::new(pool, encryptor))
    }

    pub fn new(pool: PgPool, encryptor: Arc<dyn ContentEncryptor>) -> Self {
        Self { pool, encryptor }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ddl(&self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    fn column_type_sql(column_type: MetadataColumnType) -> &'static str {
        match column_type {
            MetadataColumnType::String => "varchar(255)",
            MetadataColumnType::Number => "numeric(31,10)",
            MetadataColumnType::Boolean => "boolean",
            MetadataColumnType::Timestamp => "timestamptz",
        }
    }

    /// The information_schema data_type value each declared type maps to
    fn column_type_info(column_type: MetadataColumnType) -> &'static str {
        match column_type {
            MetadataColumnType::String => "character varying",
            MetadataColumnType::Number => "numeric",
            MetadataColumnType::Boolean => "boolean",
            MetadataColumnType::Timestamp => "timestamp with time zone",
        }
    }
}

#[async_trait]
impl MessageStore for SqlStore {
    async fn ensure_core_tables(&self) -> Result<()> {
        for statement in CORE_TABLE_DDL {
            self.ddl(statement).await?;
        }
        debug!("core tables ensured");
        Ok(())
    }

    async fn create_channel_tables(&self, channel_id: &str) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {m} (
                id bigint PRIMARY KEY,
                server_id varchar(36) NOT NULL,
                received_date timestamptz NOT NULL,
                processed boolean NOT NULL DEFAULT false,
                original_id bigint,
                import_id bigint,
                import_channel_id varchar(36)
            )"#,
            m = t.m
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {mm} (
                message_id bigint NOT NULL REFERENCES {m} (id) ON DELETE CASCADE,
                id integer NOT NULL,
                connector_name varchar(255) NOT NULL,
                received_date timestamptz NOT NULL,
                status char(1) NOT NULL,
                send_attempts integer NOT NULL DEFAULT 0,
                send_date timestamptz,
                response_date timestamptz,
                error_code integer NOT NULL DEFAULT 0,
                chain_id integer NOT NULL DEFAULT 0,
                order_id integer NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, id)
            )"#,
            mm = t.mm,
            m = t.m
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE INDEX IF NOT EXISTS {mm}_status ON {mm} (id, status, message_id)"#,
            mm = t.mm
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {mc} (
                message_id bigint NOT NULL REFERENCES {m} (id) ON DELETE CASCADE,
                metadata_id integer NOT NULL,
                content_type smallint NOT NULL,
                content text,
                data_type varchar(255),
                is_encrypted boolean NOT NULL DEFAULT false,
                PRIMARY KEY (message_id, metadata_id, content_type)
            )"#,
            mc = t.mc,
            m = t.m
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {mcm} (
                message_id bigint NOT NULL REFERENCES {m} (id) ON DELETE CASCADE,
                metadata_id integer NOT NULL,
                PRIMARY KEY (message_id, metadata_id)
            )"#,
            mcm = t.mcm,
            m = t.m
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {ma} (
                message_id bigint NOT NULL REFERENCES {m} (id) ON DELETE CASCADE,
                id varchar(64) NOT NULL,
                type varchar(255) NOT NULL,
                content bytea NOT NULL,
                PRIMARY KEY (message_id, id)
            )"#,
            ma = t.ma,
            m = t.m
        ))
        .await?;

        self.ddl(&format!(
            r#"CREATE TABLE IF NOT EXISTS {msq} (
                lock_id smallint PRIMARY KEY DEFAULT 1 CHECK (lock_id = 1),
                id bigint NOT NULL
            )"#,
            msq = t.msq
        ))
        .await?;

        sqlx::query(&format!(
            "INSERT INTO {msq} (lock_id, id) VALUES (1, 1) ON CONFLICT (lock_id) DO NOTHING",
            msq = t.msq
        ))
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        debug!(channel_id, "channel tables ensured");
        Ok(())
    }

    async fn remove_channel_tables(&self, channel_id: &str) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        for table in [&t.msq, &t.ma, &t.mcm, &t.mc, &t.mm, &t.m] {
            self.ddl(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .await?;
        }
        Ok(())
    }

    async fn sync_metadata_columns(
        &self,
        channel_id: &str,
        columns: &[MetadataColumn],
    ) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;

        let rows = sqlx::query(
            r#"SELECT column_name, data_type FROM information_schema.columns
               WHERE table_name = $1"#,
        )
        .bind(&t.mcm)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let mut existing: HashMap<String, String> = HashMap::new();
        for row in rows {
            let name: String = row.get("column_name");
            if !MCM_BUILTIN_COLUMNS.contains(&name.as_str()) {
                existing.insert(name.to_lowercase(), row.get("data_type"));
            }
        }

        // Declared names are matched against existing columns
        // case-insensitively; columns are created with the lower-cased name.
        let mut declared: HashMap<String, MetadataColumnType> = HashMap::new();
        for column in columns {
            declared.insert(column.name.to_lowercase(), column.column_type);
        }

        for (name, _) in existing.iter() {
            if !declared.contains_key(name) {
                self.ddl(&format!(
                    r#"ALTER TABLE {mcm} DROP COLUMN IF EXISTS "{col}""#,
                    mcm = t.mcm,
                    col = name
                ))
                .await?;
                debug!(channel_id, column = %name, "dropped metadata column");
            }
        }

        for (name, column_type) in declared.iter() {
            match existing.get(name) {
                None => {
                    self.ddl(&format!(
                        r#"ALTER TABLE {mcm} ADD COLUMN "{col}" {sql_type}"#,
                        mcm = t.mcm,
                        col = name,
                        sql_type = Self::column_type_sql(*column_type)
                    ))
                    .await?;
                    debug!(channel_id, column = %name, "added metadata column");
                }
                Some(info_type) if info_type != Self::column_type_info(*column_type) => {
                    // Type changed: drop and re-add. Values in the old type
                    // are not carried over.
                    self.ddl(&format!(
                        r#"ALTER TABLE {mcm} DROP COLUMN "{col}""#,
                        mcm = t.mcm,
                        col = name
                    ))
                    .await?;
                    self.ddl(&format!(
                        r#"ALTER TABLE {mcm} ADD COLUMN "{col}" {sql_type}"#,
                        mcm = t.mcm,
                        col = name,
                        sql_type = Self::column_type_sql(*column_type)
                    ))
                    .await?;
                    debug!(channel_id, column = %name, "re-created metadata column with new type");
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    async fn metadata_column_names(&self, channel_id: &str) -> Result<Vec<String>> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let rows = sqlx::query(
            r#"SELECT column_name FROM information_schema.columns
               WHERE table_name = $1 ORDER BY column_name"#,
        )
        .bind(&t.mcm)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<String, _>("column_name"))
            .filter(|name| !MCM_BUILTIN_COLUMNS.contains(&name.as_str()))
            .collect())
    }

    async fn upsert_channel(&self, config: &ChannelConfig) -> Result<()> {
        let body = serde_json::to_string(config)
            .map_err(|e| StoreError::Driver(format!("channel serialization: {}", e)))?;
        sqlx::query(
            r#"INSERT INTO channels (id, name, revision, body, enabled)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name,
                   revision = EXCLUDED.revision,
                   body = EXCLUDED.body,
                   enabled = EXCLUDED.enabled"#,
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(config.revision)
        .bind(&body)
        .bind(config.enabled)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let t = ChannelTableNames::for_channel(&message.channel_id)?;
        sqlx::query(&format!(
            r#"INSERT INTO {m} (id, server_id, received_date, processed, original_id, import_id, import_channel_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            m = t.m
        ))
        .bind(message.message_id)
        .bind(&message.server_id)
        .bind(message.received_date)
        .bind(message.processed)
        .bind(message.original_id)
        .bind(message.import_id)
        .bind(&message.import_channel_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn mark_processed(&self, channel_id: &str, message_id: i64) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        sqlx::query(&format!("UPDATE {m} SET processed = true WHERE id = $1", m = t.m))
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_connector_message(&self, cm: &ConnectorMessage) -> Result<()> {
        let t = ChannelTableNames::for_channel(&cm.channel_id)?;
        sqlx::query(&format!(
            r#"INSERT INTO {mm}
               (message_id, id, connector_name, received_date, status, send_attempts,
                send_date, response_date, error_code, chain_id, order_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
            mm = t.mm
        ))
        .bind(cm.message_id)
        .bind(cm.meta_data_id)
        .bind(&cm.connector_name)
        .bind(cm.received_date)
        .bind(cm.status.as_char().to_string())
        .bind(cm.send_attempts as i32)
        .bind(cm.send_date)
        .bind(cm.response_date)
        .bind(cm.error_code)
        .bind(cm.chain_id)
        .bind(cm.order_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn update_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        status: Status,
    ) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        sqlx::query(&format!(
            "UPDATE {mm} SET status = $1 WHERE message_id = $2 AND id = $3",
            mm = t.mm
        ))
        .bind(status.as_char().to_string())
        .bind(message_id)
        .bind(meta_data_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn update_send_result(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        status: Status,
        send_attempts: u32,
        send_date: Option<DateTime<Utc>>,
        response_date: Option<DateTime<Utc>>,
        processing_error: Option<&str>,
    ) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        sqlx::query(&format!(
            r#"UPDATE {mm} SET
                   status = $1,
                   send_attempts = $2,
                   send_date = COALESCE($3, send_date),
                   response_date = COALESCE($4, response_date),
                   error_code = CASE WHEN $5 THEN 1 ELSE error_code END
               WHERE message_id = $6 AND id = $7"#,
            mm = t.mm
        ))
        .bind(status.as_char().to_string())
        .bind(send_attempts as i32)
        .bind(send_date)
        .bind(response_date)
        .bind(processing_error.is_some())
        .bind(message_id)
        .bind(meta_data_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn connector_message_status(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
    ) -> Result<Option<Status>> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let row = sqlx::query(&format!(
            "SELECT status FROM {mm} WHERE message_id = $1 AND id = $2",
            mm = t.mm
        ))
        .bind(message_id)
        .bind(meta_data_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.and_then(|r| {
            let status: String = r.get("status");
            status.chars().next().and_then(Status::from_char)
        }))
    }

    async fn store_content(&self, channel_id: &str, content: &MessageContent) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let (stored, encrypted) = if self.encryptor.is_enabled() {
            (self.encryptor.encrypt(&content.content)?, true)
        } else {
            (content.content.clone(), false)
        };
        sqlx::query(&format!(
            r#"INSERT INTO {mc} (message_id, metadata_id, content_type, content, data_type, is_encrypted)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (message_id, metadata_id, content_type) DO UPDATE SET
                   content = EXCLUDED.content,
                   data_type = EXCLUDED.data_type,
                   is_encrypted = EXCLUDED.is_encrypted"#,
            mc = t.mc
        ))
        .bind(content.message_id)
        .bind(content.meta_data_id)
        .bind(content.content_type.code())
        .bind(&stored)
        .bind(&content.data_type)
        .bind(encrypted)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_content(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        content_type: ContentType,
    ) -> Result<Option<MessageContent>> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let row = sqlx::query(&format!(
            r#"SELECT content, data_type, is_encrypted FROM {mc}
               WHERE message_id = $1 AND metadata_id = $2 AND content_type = $3"#,
            mc = t.mc
        ))
        .bind(message_id)
        .bind(meta_data_id)
        .bind(content_type.code())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let Some(row) = row else { return Ok(None) };
        let stored: String = row.get("content");
        let encrypted: bool = row.get("is_encrypted");
        let content = if encrypted {
            self.encryptor.decrypt(&stored)?
        } else {
            stored
        };
        Ok(Some(MessageContent {
            message_id,
            meta_data_id,
            content_type,
            content,
            data_type: row.get("data_type"),
            encrypted: false,
        }))
    }

    async fn store_metadata_values(
        &self,
        channel_id: &str,
        message_id: i64,
        meta_data_id: i32,
        values: &HashMap<String, MetadataValue>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let t = ChannelTableNames::for_channel(channel_id)?;

        // Only declared columns exist on the table; unknown keys would make
        // the insert fail, so restrict to what the schema knows.
        let declared = self.metadata_column_names(channel_id).await?;
        let mut columns = Vec::new();
        let mut bound: Vec<&MetadataValue> = Vec::new();
        for (name, value) in values {
            let lowered = name.to_lowercase();
            if declared.contains(&lowered) {
                columns.push(lowered);
                bound.push(value);
            } else {
                debug!(channel_id, column = %name, "dropping value for undeclared metadata column");
            }
        }
        if columns.is_empty() {
            return Ok(());
        }

        let column_list: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();
        let placeholders: Vec<String> =
            (0..columns.len()).map(|i| format!("${}", i + 3)).collect();
        let updates: Vec<String> = column_list
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        let sql = format!(
            r#"INSERT INTO {mcm} (message_id, metadata_id, {columns})
               VALUES ($1, $2, {placeholders})
               ON CONFLICT (message_id, metadata_id) DO UPDATE SET {updates}"#,
            mcm = t.mcm,
            columns = column_list.join(", "),
            placeholders = placeholders.join(", "),
            updates = updates.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(message_id).bind(meta_data_id);
        for value in bound {
            query = match value {
                MetadataValue::String(s) => query.bind(s.clone()),
                MetadataValue::Number(n) => query.bind(*n),
                MetadataValue::Boolean(b) => query.bind(*b),
                MetadataValue::Timestamp(ts) => query.bind(*ts),
            };
        }
        query
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn insert_attachment(&self, channel_id: &str, attachment: &Attachment) -> Result<()> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        sqlx::query(&format!(
            r#"INSERT INTO {ma} (message_id, id, type, content) VALUES ($1, $2, $3, $4)
               ON CONFLICT (message_id, id) DO NOTHING"#,
            ma = t.ma
        ))
        .bind(attachment.message_id)
        .bind(&attachment.id)
        .bind(&attachment.mime_type)
        .bind(&attachment.content)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_attachment(
        &self,
        channel_id: &str,
        message_id: i64,
        attachment_id: &str,
    ) -> Result<Option<Attachment>> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let row = sqlx::query(&format!(
            "SELECT type, content FROM {ma} WHERE message_id = $1 AND id = $2",
            ma = t.ma
        ))
        .bind(message_id)
        .bind(attachment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| Attachment {
            id: attachment_id.to_string(),
            message_id,
            mime_type: r.get("type"),
            content: r.get("content"),
        }))
    }

    async fn queued_entries(
        &self,
        channel_id: &str,
        meta_data_id: i32,
        limit: i64,
    ) -> Result<Vec<QueueEntry>> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        let rows = sqlx::query(&format!(
            r#"SELECT message_id, send_attempts FROM {mm}
               WHERE id = $1 AND status = 'Q'
               ORDER BY message_id
               LIMIT $2"#,
            mm = t.mm
        ))
        .bind(meta_data_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| QueueEntry {
                message_id: r.get("message_id"),
                attempts: r.get::<i32, _>("send_attempts") as u32,
            })
            .collect())
    }
}

#[async_trait]
impl ClusterStore for SqlStore {
    async fn register_server(&self, info: &ServerInfo) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO servers (server_id, hostname, port, api_url, started_at, last_heartbeat, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (server_id) DO UPDATE SET
                   hostname = EXCLUDED.hostname,
                   port = EXCLUDED.port,
                   api_url = EXCLUDED.api_url,
                   started_at = EXCLUDED.started_at,
                   last_heartbeat = EXCLUDED.last_heartbeat,
                   status = EXCLUDED.status"#,
        )
        .bind(&info.server_id)
        .bind(&info.hostname)
        .bind(info.port)
        .bind(&info.api_url)
        .bind(info.started_at)
        .bind(info.last_heartbeat)
        .bind(&info.status)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE servers SET last_heartbeat = $1 WHERE server_id = $2")
            .bind(at)
            .bind(server_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn record_deployment(&self, server_id: &str, channel_id: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO channel_deployments (server_id, channel_id)
               VALUES ($1, $2)
               ON CONFLICT (server_id, channel_id) DO UPDATE SET deployed_at = now()"#,
        )
        .bind(server_id)
        .bind(channel_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn remove_deployment(&self, server_id: &str, channel_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM channel_deployments WHERE server_id = $1 AND channel_id = $2")
            .bind(server_id)
            .bind(channel_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn audit_event(
        &self,
        name: &str,
        level: &str,
        outcome: &str,
        attributes: &str,
        server_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO events (name, level, outcome, attributes, server_id)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(name)
        .bind(level)
        .bind(outcome)
        .bind(attributes)
        .bind(server_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for SqlStore {
    async fn advance_block(&self, channel_id: &str, block_size: i64) -> Result<i64> {
        let t = ChannelTableNames::for_channel(channel_id)?;
        // The UPDATE takes a row lock, so concurrent refills from other nodes
        // serialize here; each caller gets a disjoint block.
        let row = sqlx::query(&format!(
            "UPDATE {msq} SET id = id + $1 WHERE lock_id = 1 RETURNING id - $1 AS first_id",
            msq = t.msq
        ))
        .bind(block_size)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        match row {
            Some(row) => Ok(row.get("first_id")),
            None => Err(StoreError::Schema(format!(
                "sequence row missing for channel {}",
                channel_id
            ))
            .into()),
        }
    }
}

#[async_trait]
impl LeaseStore for SqlStore {
    async fn try_acquire(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Driver(format!("lease ttl out of range: {}", e)))?;
        // Insert wins the race; the conditional update steals an expired
        // lease or refreshes our own. An unexpired foreign lease matches
        // neither arm and affects zero rows.
        let result = sqlx::query(
            r#"INSERT INTO polling_leases (channel_id, server_id, acquired_at, renewed_at, expires_at)
               VALUES ($1, $2, $3, $3, $4)
               ON CONFLICT (channel_id) DO UPDATE SET
                   server_id = EXCLUDED.server_id,
                   acquired_at = CASE
                       WHEN polling_leases.server_id = EXCLUDED.server_id
                       THEN polling_leases.acquired_at
                       ELSE EXCLUDED.acquired_at
                   END,
                   renewed_at = EXCLUDED.renewed_at,
                   expires_at = EXCLUDED.expires_at
               WHERE polling_leases.expires_at < $3 OR polling_leases.server_id = $2"#,
        )
        .bind(channel_id)
        .bind(server_id)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, channel_id: &str, server_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Driver(format!("lease ttl out of range: {}", e)))?;
        let result = sqlx::query(
            r#"UPDATE polling_leases SET renewed_at = $3, expires_at = $4
               WHERE channel_id = $1 AND server_id = $2 AND expires_at >= $3"#,
        )
        .bind(channel_id)
        .bind(server_id)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, channel_id: &str, server_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM polling_leases WHERE channel_id = $1 AND server_id = $2")
            .bind(channel_id)
            .bind(server_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn current_lease(&self, channel_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query(
            r#"SELECT server_id, acquired_at, renewed_at, expires_at
               FROM polling_leases WHERE channel_id = $1"#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| Lease {
            channel_id: channel_id.to_string(),
            server_id: r.get("server_id"),
            acquired_at: r.get("acquired_at"),
            renewed_at: r.get("renewed_at"),
            expires_at: r.get("expires_at"),
        }))
    }
}

#[async_trait]
impl EventStore for SqlStore {
    async fn append_cluster_event(
        &self,
        channel: &str,
        data: &str,
        server_id: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO cluster_events (channel, data, server_id)
               VALUES ($1, $2, $3) RETURNING id"#,
        )
        .bind(channel)
        .bind(data)
        .bind(server_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.get("id"))
    }

    async fn cluster_events_after(
        &self,
        last_seen: i64,
        exclude_server: &str,
    ) -> Result<Vec<ClusterEventRow>> {
        let rows = sqlx::query(
            r#"SELECT id, channel, data, created_at, server_id FROM cluster_events
               WHERE id > $1 AND server_id != $2 ORDER BY id"#,
        )
        .bind(last_seen)
        .bind(exclude_server)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| ClusterEventRow {
                id: r.get("id"),
                channel: r.get("channel"),
                data: r.get("data"),
                created_at: r.get("created_at"),
                server_id: r.get("server_id"),
            })
            .collect())
    }

    async fn latest_cluster_event_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM cluster_events")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.get("id"))
    }
}
