use crate::error::{Error, Result};
use crate::model::Chat;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use uuid::Uuid;

/// Create a chat with an ordered participant list. Duplicate ids are removed
/// preserving first occurrence.
pub fn create(conn: &mut Connection, name: &str, participant_ids: &[String]) -> Result<Chat> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    let mut participants: Vec<String> = Vec::with_capacity(participant_ids.len());
    for id in participant_ids {
        if !participants.iter().any(|p| p == id) {
            participants.push(id.clone());
        }
    }
    if participants.is_empty() {
        return Err(Error::validation("participants", "must not be empty"));
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO chats (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), name, now, now],
    )?;
    for (position, user_id) in participants.iter().enumerate() {
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![id.to_string(), user_id, position as i64],
        )?;
    }
    tx.commit()?;
    Ok(Chat {
        id,
        name: name.into(),
        participants,
        created_at: now,
        updated_at: now,
    })
}

/// Fetch a chat by id.
pub fn get(conn: &Connection, id: &Uuid) -> Result<Chat> {
    load(conn, id)?.ok_or_else(|| Error::not_found("chat", id.to_string()))
}

fn load(conn: &Connection, id: &Uuid) -> Result<Option<Chat>> {
    let mut stmt =
        conn.prepare("SELECT id, name, created_at, updated_at FROM chats WHERE id = ?1")?;
    let chat = stmt
        .query_row([id.to_string()], row_to_chat)
        .optional()?;
    match chat {
        Some(mut chat) => {
            chat.participants = participants_of(conn, id)?;
            Ok(Some(chat))
        }
        None => Ok(None),
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        name: row.get(1)?,
        participants: Vec::new(),
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn participants_of(conn: &Connection, chat_id: &Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map([chat_id.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// List chats containing a participant, most recently updated first.
pub fn list_by_participant(conn: &Connection, user_id: &str) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.created_at, c.updated_at FROM chats c \
         JOIN chat_participants p ON p.chat_id = c.id \
         WHERE p.user_id = ?1 ORDER BY c.updated_at DESC, c.created_at DESC",
    )?;
    let chats = stmt
        .query_map([user_id], row_to_chat)?
        .collect::<Result<Vec<_>, _>>()?;
    populate(conn, chats)
}

/// List every chat, most recently updated first.
pub fn list_all(conn: &Connection) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, created_at, updated_at FROM chats \
         ORDER BY updated_at DESC, created_at DESC",
    )?;
    let chats = stmt
        .query_map([], row_to_chat)?
        .collect::<Result<Vec<_>, _>>()?;
    populate(conn, chats)
}

fn populate(conn: &Connection, mut chats: Vec<Chat>) -> Result<Vec<Chat>> {
    for chat in &mut chats {
        chat.participants = participants_of(conn, &chat.id)?;
    }
    Ok(chats)
}

/// Append a participant. Idempotent: an already-present id leaves the chat
/// unchanged. Runs in an IMMEDIATE transaction so two concurrent joins on
/// the same chat cannot lose an update.
pub fn add_participant(conn: &mut Connection, chat_id: &Uuid, user_id: &str) -> Result<Chat> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let exists: Option<i64> = {
        let mut stmt = tx.prepare("SELECT 1 FROM chats WHERE id = ?1")?;
        stmt.query_row([chat_id.to_string()], |row| row.get(0))
            .optional()?
    };
    if exists.is_none() {
        return Err(Error::not_found("chat", chat_id.to_string()));
    }
    let present: Option<i64> = {
        let mut stmt =
            tx.prepare("SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2")?;
        stmt.query_row(params![chat_id.to_string(), user_id], |row| row.get(0))
            .optional()?
    };
    if present.is_none() {
        let position: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_participants WHERE chat_id = ?1",
            [chat_id.to_string()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![chat_id.to_string(), user_id, position],
        )?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        tx.execute(
            "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
            params![chat_id.to_string(), now],
        )?;
    }
    let chat = load(&tx, chat_id)?.ok_or_else(|| Error::not_found("chat", chat_id.to_string()))?;
    tx.commit()?;
    Ok(chat)
}

/// Run a chat mutation, retrying a bounded number of times when SQLite
/// reports the database busy, then surface a conflict.
pub fn with_busy_retry<T>(chat_id: &Uuid, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        match op() {
            Err(Error::Storage(e)) if is_busy(&e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(Error::Conflict {
                        chat_id: chat_id.to_string(),
                    });
                }
            }
            other => return other,
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if matches!(
            f.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}
