use crate::error::{Error, Result};
use crate::model::Message;
use rusqlite::{params, Connection, TransactionBehavior};
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

/// Durably append a message to a chat's log. The caller is responsible for
/// having verified the chat exists. `created_at` is clamped to the chat's
/// current maximum so the per-chat sequence never decreases under clock slew.
pub fn append(conn: &mut Connection, chat_id: &Uuid, user_id: &str, content: &str) -> Result<Message> {
    if content.trim().is_empty() {
        return Err(Error::validation("content", "must not be empty"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(created_at) FROM messages WHERE chat_id = ?1",
        [chat_id.to_string()],
        |row| row.get(0),
    )?;
    let created_at = now.max(last.unwrap_or(i64::MIN));
    tx.execute(
        "INSERT INTO messages (id, chat_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.to_string(), chat_id.to_string(), user_id, content, created_at],
    )?;
    tx.commit()?;
    Ok(Message {
        id,
        content: content.into(),
        user_id: user_id.into(),
        chat_id: *chat_id,
        created_at,
    })
}

/// Ranged history read, ascending creation order with insertion order as the
/// tie-break for equal timestamps.
pub fn list_by_chat(conn: &Connection, chat_id: &Uuid, limit: i64, offset: i64) -> Result<Vec<Message>> {
    if limit < 0 {
        return Err(Error::validation("limit", "must be non-negative"));
    }
    if offset < 0 {
        return Err(Error::validation("offset", "must be non-negative"));
    }
    let limit = limit.min(MAX_LIMIT);
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, user_id, content, created_at FROM messages \
         WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2 OFFSET ?3",
    )?;
    let msgs = stmt
        .query_map(params![chat_id.to_string(), limit, offset], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        chat_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap(),
        user_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}
