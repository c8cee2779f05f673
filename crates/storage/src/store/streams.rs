#![forbid(unsafe_code)]

use super::*;
use rusqlite::Connection;
use tt_core::{JobId, StreamId, ToolCall};

const MAX_MESSAGE_ID_LEN: usize = 300;

fn normalize_message_id(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("message_id must not be empty"));
    }
    if trimmed.len() > MAX_MESSAGE_ID_LEN {
        return Err(StoreError::InvalidInput("message_id is too long"));
    }
    Ok(trimmed.to_string())
}

fn load_snapshot(conn: &Connection, stream_id: &StreamId) -> Result<Option<StreamSnapshot>, StoreError> {
    let head: Option<(i64, Option<String>, i64)> = conn
        .query_row(
            "SELECT is_streaming, job_id, revision FROM streams WHERE stream_id=?1",
            params![stream_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((is_streaming, job_id, revision)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        r#"
        SELECT message_id, role, content, tool_calls_json, updated_at_ms
        FROM stream_messages
        WHERE stream_id=?1
        ORDER BY position ASC
        "#,
    )?;
    let mut rows = stmt.query(params![stream_id.as_str()])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = row.get(1)?;
        let tool_calls_json: String = row.get(3)?;
        messages.push(StreamMessage {
            message_id: row.get(0)?,
            role: MessageRole::parse(&role)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown message role {role}")))?,
            content: row.get(2)?,
            tool_calls: serde_json::from_str::<Vec<ToolCall>>(&tool_calls_json)?,
            updated_at_ms: row.get(4)?,
        });
    }

    Ok(Some(StreamSnapshot {
        stream_id: stream_id.clone(),
        is_streaming: is_streaming != 0,
        job_id: job_id.map(JobId::try_new).transpose()?,
        revision,
        messages,
    }))
}

fn ensure_stream_tx(tx: &Transaction<'_>, stream_id: &StreamId, now_ms: i64) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT OR IGNORE INTO streams(stream_id, is_streaming, job_id, revision, updated_at_ms)
        VALUES (?1, 0, NULL, 0, ?2)
        "#,
        params![stream_id.as_str(), now_ms],
    )?;
    Ok(())
}

fn bump_stream_tx(tx: &Transaction<'_>, stream_id: &StreamId, now_ms: i64) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE streams SET revision=revision+1, updated_at_ms=?2 WHERE stream_id=?1",
        params![stream_id.as_str(), now_ms],
    )?;
    Ok(())
}

fn upsert_message_tx(
    tx: &Transaction<'_>,
    stream_id: &StreamId,
    message: StreamMessageInput,
    now_ms: i64,
) -> Result<(), StoreError> {
    let message_id = normalize_message_id(&message.message_id)?;
    let tool_calls_json = serde_json::to_string(&message.tool_calls)?;
    let updated = tx.execute(
        r#"
        UPDATE stream_messages
        SET role=?3, content=?4, tool_calls_json=?5, updated_at_ms=?6
        WHERE stream_id=?1 AND message_id=?2
        "#,
        params![
            stream_id.as_str(),
            message_id,
            message.role.as_str(),
            message.content,
            tool_calls_json,
            now_ms,
        ],
    )?;
    if updated == 1 {
        return Ok(());
    }

    let position: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position), 0) + 1 FROM stream_messages WHERE stream_id=?1",
        params![stream_id.as_str()],
        |row| row.get(0),
    )?;
    tx.execute(
        r#"
        INSERT INTO stream_messages(stream_id, message_id, position, role, content, tool_calls_json, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            stream_id.as_str(),
            message_id,
            position,
            message.role.as_str(),
            message.content,
            tool_calls_json,
            now_ms,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn stream_snapshot(&self, stream_id: &StreamId) -> Result<Option<StreamSnapshot>, StoreError> {
        load_snapshot(&self.conn, stream_id)
    }

    /// Marks the stream live. An existing job binding is kept when `job_id` is `None`.
    pub fn stream_begin(
        &mut self,
        stream_id: &StreamId,
        job_id: Option<&JobId>,
    ) -> Result<StreamSnapshot, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        ensure_stream_tx(&tx, stream_id, now_ms)?;
        tx.execute(
            r#"
            UPDATE streams
            SET is_streaming=1, job_id=COALESCE(?2, job_id), revision=revision+1, updated_at_ms=?3
            WHERE stream_id=?1
            "#,
            params![stream_id.as_str(), job_id.map(JobId::as_str), now_ms],
        )?;
        let snapshot = load_snapshot(&tx, stream_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(snapshot)
    }

    /// Updates the message in place when its id exists, appends it otherwise.
    pub fn stream_upsert_message(
        &mut self,
        stream_id: &StreamId,
        message: StreamMessageInput,
    ) -> Result<i64, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        ensure_stream_tx(&tx, stream_id, now_ms)?;
        upsert_message_tx(&tx, stream_id, message, now_ms)?;
        bump_stream_tx(&tx, stream_id, now_ms)?;
        let revision: i64 = tx.query_row(
            "SELECT revision FROM streams WHERE stream_id=?1",
            params![stream_id.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(revision)
    }

    /// Drops the in-progress placeholder, appends the final message if any and clears the live flag.
    pub fn stream_finish(
        &mut self,
        stream_id: &StreamId,
        final_message: Option<StreamMessageInput>,
    ) -> Result<StreamSnapshot, StoreError> {
        let now_ms = now_ms();
        let tx = self.conn.transaction()?;
        ensure_stream_tx(&tx, stream_id, now_ms)?;
        tx.execute(
            "DELETE FROM stream_messages WHERE stream_id=?1 AND message_id=?2",
            params![stream_id.as_str(), stream_id.placeholder_message_id()],
        )?;
        if let Some(message) = final_message {
            upsert_message_tx(&tx, stream_id, message, now_ms)?;
        }
        tx.execute(
            r#"
            UPDATE streams
            SET is_streaming=0, revision=revision+1, updated_at_ms=?2
            WHERE stream_id=?1
            "#,
            params![stream_id.as_str(), now_ms],
        )?;
        let snapshot = load_snapshot(&tx, stream_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(snapshot)
    }
}
