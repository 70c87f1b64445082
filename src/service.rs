use crate::error::{Error, Result};
use crate::hub::BroadcastHub;
use crate::identity::IdentityLookup;
use crate::model::{Chat, ChatDetail, Message, MessageView, Participant, User};
use crate::{chats, messages};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Composes the chat and message stores, the broadcast hub and the identity
/// client into the operations the API exposes.
#[derive(Clone)]
pub struct ChatService {
    pool: Pool<SqliteConnectionManager>,
    hub: BroadcastHub,
    identity: Arc<dyn IdentityLookup>,
    send_locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ChatService {
    pub fn new(
        pool: Pool<SqliteConnectionManager>,
        hub: BroadcastHub,
        identity: Arc<dyn IdentityLookup>,
    ) -> Self {
        Self {
            pool,
            hub,
            identity,
            send_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Create a chat with the creator first in the participant list.
    pub fn create_chat(
        &self,
        name: &str,
        creator_id: &str,
        other_participants: &[String],
    ) -> Result<Chat> {
        let mut ids = Vec::with_capacity(other_participants.len() + 1);
        ids.push(creator_id.to_string());
        ids.extend(other_participants.iter().cloned());
        let mut conn = self.pool.get()?;
        chats::create(&mut conn, name, &ids)
    }

    pub fn get_chat(&self, chat_id: &Uuid) -> Result<Chat> {
        let conn = self.pool.get()?;
        chats::get(&conn, chat_id)
    }

    pub fn all_chats(&self) -> Result<Vec<Chat>> {
        let conn = self.pool.get()?;
        chats::list_all(&conn)
    }

    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        let conn = self.pool.get()?;
        chats::list_by_participant(&conn, user_id)
    }

    /// Idempotently add a participant, retrying lost races before surfacing
    /// a conflict.
    pub fn join_chat(&self, chat_id: &Uuid, user_id: &str) -> Result<Chat> {
        let mut conn = self.pool.get()?;
        chats::with_busy_retry(chat_id, || chats::add_participant(&mut conn, chat_id, user_id))
    }

    pub fn message_history(
        &self,
        chat_id: &Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Message>> {
        let conn = self.pool.get()?;
        messages::list_by_chat(
            &conn,
            chat_id,
            limit.unwrap_or(messages::DEFAULT_LIMIT),
            offset.unwrap_or(0),
        )
    }

    /// Accept a message: verify the chat exists and the sender belongs to
    /// it, durably append, then broadcast. Sends for one chat are serialized
    /// so live delivery order always matches persistence order; unrelated
    /// chats proceed in parallel.
    pub async fn send_message(&self, chat_id: &Uuid, user_id: &str, content: &str) -> Result<Message> {
        let lock = self.send_lock(chat_id);
        let _guard = lock.lock().await;
        let message = {
            let mut conn = self.pool.get()?;
            let chat = chats::get(&conn, chat_id)?;
            if !chat.participants.iter().any(|p| p == user_id) {
                return Err(Error::validation(
                    "userId",
                    format!("{} is not a participant of chat {}", user_id, chat_id),
                ));
            }
            messages::append(&mut conn, chat_id, user_id, content)?
        };
        self.hub.publish(message.clone()).await;
        Ok(message)
    }

    fn send_lock(&self, chat_id: &Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.send_locks.lock().entry(*chat_id).or_default().clone()
    }

    /// Fully populated chat view: the chat, its first history page and the
    /// identity records for participants and senders. Identity failures
    /// degrade to null users, they never fail the call.
    pub async fn chat_detail(&self, chat_id: &Uuid) -> Result<ChatDetail> {
        let (chat, history) = {
            let conn = self.pool.get()?;
            let chat = chats::get(&conn, chat_id)?;
            let history = messages::list_by_chat(&conn, chat_id, messages::DEFAULT_LIMIT, 0)?;
            (chat, history)
        };
        let mut wanted = chat.participants.clone();
        for message in &history {
            if !wanted.contains(&message.user_id) {
                wanted.push(message.user_id.clone());
            }
        }
        let users = self.lookup_degraded(&wanted).await;
        let participant_users = chat
            .participants
            .iter()
            .map(|id| Participant {
                user_id: id.clone(),
                user: users.get(id).cloned().flatten(),
            })
            .collect();
        let message_views = history
            .into_iter()
            .map(|message| {
                let user = users.get(&message.user_id).cloned().flatten();
                MessageView { message, user }
            })
            .collect();
        Ok(ChatDetail {
            chat,
            participant_users,
            messages: message_views,
        })
    }

    /// Enrich a freshly published message with its sender for live feed
    /// delivery. Resolution failure degrades to a null user.
    pub async fn live_view(&self, message: Message) -> MessageView {
        let user = match self.identity.resolve(&message.user_id).await {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(user_id = %message.user_id, error = %e, "sender unresolved for live delivery");
                None
            }
        };
        MessageView { message, user }
    }

    /// Resolve ids, degrading per id instead of failing the aggregation:
    /// one batch lookup, then individual lookups for whatever made the
    /// batch fail.
    async fn lookup_degraded(&self, ids: &[String]) -> HashMap<String, Option<User>> {
        match self.identity.resolve_many(ids).await {
            Ok(users) => {
                let mut map: HashMap<String, Option<User>> =
                    ids.iter().map(|id| (id.clone(), None)).collect();
                for user in users {
                    map.insert(user.id.clone(), Some(user));
                }
                map
            }
            Err(e) => {
                tracing::warn!(error = %e, "identity resolution degraded, retrying ids individually");
                let results =
                    futures::future::join_all(ids.iter().map(|id| self.identity.resolve(id))).await;
                ids.iter()
                    .cloned()
                    .zip(results.into_iter().map(|r| r.ok()))
                    .collect()
            }
        }
    }
}
