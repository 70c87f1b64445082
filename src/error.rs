use thiserror::Error;

/// Error taxonomy shared by every component.
///
/// The first four variants are the caller-visible classes; the transparent
/// wrappers carry internal storage failures up to the HTTP layer where they
/// become opaque 500s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("identity lookup failed for {}", .ids.join(", "))]
    Upstream { ids: Vec<String> },

    #[error("conflicting update on chat {chat_id}")]
    Conflict { chat_id: String },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_field_and_id() {
        let e = Error::validation("content", "must not be empty");
        assert_eq!(e.to_string(), "invalid content: must not be empty");
        let e = Error::not_found("chat", "abc");
        assert_eq!(e.to_string(), "chat abc not found");
        let e = Error::Upstream {
            ids: vec!["u1".into(), "u2".into()],
        };
        assert!(e.to_string().contains("u1, u2"));
    }
}
