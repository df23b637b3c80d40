//! Request validation for user ids and topic names.

use super::error::ApiError;
use crate::notification::UserId;

const MAX_NAME_LEN: usize = 255;

/// Accept a non-empty user id of at most 255 bytes.
pub fn validate_user_id(raw: &str) -> Result<UserId, ApiError> {
    if raw.is_empty() {
        return Err(ApiError::BadRequest("user_id cannot be empty".into()));
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "user_id too long (max {MAX_NAME_LEN} bytes)"
        )));
    }
    Ok(UserId::new(raw))
}

/// Accept a topic of 1-255 characters from `[A-Za-z0-9._-]`.
pub fn validate_topic(topic: &str) -> Result<(), ApiError> {
    if topic.is_empty() {
        return Err(ApiError::BadRequest("topic cannot be empty".into()));
    }
    if topic.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "topic name too long (max {MAX_NAME_LEN} characters)"
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ApiError::BadRequest(format!(
            "topic contains invalid character {c:?}"
        )));
    }
    Ok(())
}
