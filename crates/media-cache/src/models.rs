//! Mapping between domain records and the flat string hashes they are stored as.
//! Posts and comments are not here: they are stored as one JSON blob per
//! hash field instead.

use std::collections::HashMap;

use media_types::models::{ChannelView, Group, Relationship, User, UserChannel, UserGroup};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("missing field {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// A record stored as a hash of string fields.
///
/// Optional values are written as empty strings so that an update which
/// clears a field overwrites the previous value; an absent or empty field
/// reads back as `None`.
pub trait HashRecord: Sized {
    fn to_fields(&self) -> Vec<(String, String)>;
    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError>;
}

fn field(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}

fn optional_field(name: &str, value: &Option<String>) -> (String, String) {
    field(name, value.clone().unwrap_or_default())
}

fn required(fields: &HashMap<String, String>, name: &'static str) -> Result<String, RecordError> {
    fields
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(RecordError::Missing(name))
}

fn optional(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn parse<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<T, RecordError> {
    let raw = required(fields, name)?;
    raw.parse()
        .map_err(|_| RecordError::Invalid { field: name, value: raw })
}

fn relationship(fields: &HashMap<String, String>) -> Result<Relationship, RecordError> {
    parse(fields, "relationship")
}

impl HashRecord for User {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("email", &self.email),
            optional_field("firstName", &self.first_name),
            optional_field("lastName", &self.last_name),
            optional_field("dateOfBirth", &self.date_of_birth),
            optional_field("gender", &self.gender),
            optional_field("occupation", &self.occupation),
            optional_field("avatarUrl", &self.avatar_url),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        Ok(Self {
            email: required(fields, "email")?,
            first_name: optional(fields, "firstName"),
            last_name: optional(fields, "lastName"),
            date_of_birth: optional(fields, "dateOfBirth"),
            gender: optional(fields, "gender"),
            occupation: optional(fields, "occupation"),
            avatar_url: optional(fields, "avatarUrl"),
        })
    }
}

impl HashRecord for Group {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("id", &self.id),
            field("name", &self.name),
            field("code", &self.code),
            field("hidden", self.hidden.to_string()),
            field("createdBy", &self.created_by),
            field("createdAt", self.created_at.to_string()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        Ok(Self {
            id: required(fields, "id")?,
            name: required(fields, "name")?,
            code: required(fields, "code")?,
            hidden: parse(fields, "hidden")?,
            created_by: required(fields, "createdBy")?,
            created_at: parse(fields, "createdAt")?,
        })
    }
}

impl HashRecord for ChannelView {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("channelId", &self.channel_id),
            field("name", &self.name),
            field("groupId", &self.group_id),
            field("isDefault", self.is_default.to_string()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        Ok(Self {
            channel_id: required(fields, "channelId")?,
            name: required(fields, "name")?,
            group_id: required(fields, "groupId")?,
            // Entries written before the flag existed only carried it when true.
            is_default: optional(fields, "isDefault").is_some_and(|v| v == "true"),
        })
    }
}

impl HashRecord for UserGroup {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("userId", &self.user_id),
            field("groupId", &self.group_id),
            field("relationship", self.relationship.as_str()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        Ok(Self {
            user_id: required(fields, "userId")?,
            group_id: required(fields, "groupId")?,
            relationship: relationship(fields)?,
        })
    }
}

impl HashRecord for UserChannel {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("userId", &self.user_id),
            field("channelId", &self.channel_id),
            field("relationship", self.relationship.as_str()),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        Ok(Self {
            user_id: required(fields, "userId")?,
            channel_id: required(fields, "channelId")?,
            relationship: relationship(fields)?,
        })
    }
}
