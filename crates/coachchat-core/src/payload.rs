//! Validation of loosely typed backend payloads into domain types.
//!
//! The messaging backend speaks untyped JSON. Everything crossing into the
//! sync engine goes through these functions first; nothing past this module
//! inspects raw JSON.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    error::PayloadError,
    types::{Channel, ChannelId, Message, MessageId, UserId},
};

type Object = Map<String, Value>;

fn object(value: &Value) -> Result<&Object, PayloadError> {
    value.as_object().ok_or(PayloadError::NotAnObject)
}

fn str_field<'a>(obj: &'a Object, field: &'static str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn timestamp(obj: &Object, field: &'static str) -> Result<Option<DateTime<Utc>>, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| PayloadError::InvalidField {
                field,
                reason: e.to_string(),
            }),
        Some(other) => Err(PayloadError::InvalidField {
            field,
            reason: format!("expected RFC 3339 string, got {other}"),
        }),
    }
}

/// Channel id carried by an object, from `channel_id` or a qualified `cid`.
pub(crate) fn channel_id_of(obj: &Object) -> Option<ChannelId> {
    str_field(obj, "channel_id")
        .map(ChannelId::new)
        .or_else(|| str_field(obj, "cid").map(ChannelId::from_cid))
}

fn author_of(obj: &Object) -> Option<UserId> {
    obj.get("user")
        .and_then(Value::as_object)
        .and_then(|user| str_field(user, "id"))
        .or_else(|| str_field(obj, "user_id"))
        .map(UserId::new)
}

/// Validate a message payload.
///
/// `channel_hint` supplies the channel when the payload itself omits it,
/// as event envelopes usually carry the cid outside the message.
///
/// # Errors
/// Returns [`PayloadError`] when a required field is missing or malformed.
pub fn parse_message(value: &Value, channel_hint: Option<&ChannelId>) -> Result<Message, PayloadError> {
    let obj = object(value)?;

    let id = str_field(obj, "id").ok_or(PayloadError::MissingField("id"))?;
    let channel_id = channel_id_of(obj)
        .or_else(|| channel_hint.cloned())
        .ok_or(PayloadError::MissingField("cid"))?;
    let author_id = author_of(obj).ok_or(PayloadError::MissingField("user.id"))?;
    let text = match obj.get("text") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(_) => {
            return Err(PayloadError::InvalidField {
                field: "text",
                reason: "expected string".to_owned(),
            });
        }
    };
    let created_at = timestamp(obj, "created_at")?.ok_or(PayloadError::MissingField("created_at"))?;
    let updated_at = timestamp(obj, "updated_at")?;

    Ok(Message {
        id: MessageId::new(id),
        channel_id,
        author_id,
        text,
        created_at,
        updated_at,
    })
}

fn member_id(entry: &Value) -> Option<UserId> {
    match entry {
        Value::String(id) if !id.is_empty() => Some(UserId::new(id.as_str())),
        Value::Object(obj) => str_field(obj, "user_id")
            .or_else(|| {
                obj.get("user")
                    .and_then(Value::as_object)
                    .and_then(|user| str_field(user, "id"))
            })
            .map(UserId::new),
        _ => None,
    }
}

/// Validate a channel payload.
///
/// Activity time is `last_message_at`, falling back to `created_at` for
/// channels that never saw a message, then to the Unix epoch.
///
/// # Errors
/// Returns [`PayloadError`] when the id is missing or a field is malformed.
pub fn parse_channel(value: &Value) -> Result<Channel, PayloadError> {
    let obj = object(value)?;

    let id = str_field(obj, "id")
        .map(ChannelId::new)
        .or_else(|| str_field(obj, "cid").map(ChannelId::from_cid))
        .ok_or(PayloadError::MissingField("id"))?;

    let display_name = str_field(obj, "name")
        .or_else(|| {
            obj.get("data")
                .and_then(Value::as_object)
                .and_then(|data| str_field(data, "name"))
        })
        .map_or_else(|| id.to_string(), str::to_owned);

    let member_ids: BTreeSet<UserId> = match obj.get("members") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Array(entries)) => entries.iter().filter_map(member_id).collect(),
        Some(_) => {
            return Err(PayloadError::InvalidField {
                field: "members",
                reason: "expected array".to_owned(),
            });
        }
    };

    let last_activity_at = match timestamp(obj, "last_message_at")? {
        Some(at) => at,
        None => timestamp(obj, "created_at")?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    };

    Ok(Channel {
        id,
        display_name,
        member_ids,
        last_activity_at,
    })
}
