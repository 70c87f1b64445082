use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User record owned by the identity service. Referenced by id everywhere,
/// never persisted here; timestamps are passed through as issued.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub name: String,
    /// Ordered, duplicate-free; the creator is always first.
    pub participants: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub user_id: String,
    pub chat_id: Uuid,
    pub created_at: i64,
}

/// A chat participant with its identity resolution outcome. `user` is null
/// when the identity service could not resolve the id.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub user: Option<User>,
}

/// A message enriched with its sender, as delivered on the live feed and in
/// chat detail views.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub user: Option<User>,
}

/// Fully populated chat view.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatDetail {
    #[serde(flatten)]
    pub chat: Chat,
    pub participant_users: Vec<Participant>,
    pub messages: Vec<MessageView>,
}
