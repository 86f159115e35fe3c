use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Channel name that marks a group's default channel.
pub const DEFAULT_CHANNEL_NAME: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl User {
    /// A user snapshot carrying nothing but the identifying email.
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            first_name: None,
            last_name: None,
            date_of_birth: None,
            gender: None,
            occupation: None,
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Join token, unique across the cache.
    pub code: String,
    #[serde(default)]
    pub hidden: bool,
    pub created_by: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub group_id: String,
}

impl Channel {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CHANNEL_NAME
    }
}

/// A channel as stored in the cache, with its default flag resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel_id: String,
    pub name: String,
    pub group_id: String,
    pub is_default: bool,
}

impl From<&Channel> for ChannelView {
    fn from(channel: &Channel) -> Self {
        Self {
            channel_id: channel.channel_id.clone(),
            name: channel.name.clone(),
            group_id: channel.group_id.clone(),
            is_default: channel.is_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub author: User,
    pub content: String,
    #[serde(default)]
    pub likes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub author: User,
    pub content: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl Comment {
    pub fn target(&self) -> Result<CommentTarget<'_>, CommentTargetError> {
        CommentTarget::resolve(self.post_id.as_deref(), self.parent_id.as_deref())
    }
}

/// Where a comment hangs: directly under a post, or as a reply to another comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentTarget<'a> {
    Post(&'a str),
    Reply(&'a str),
}

impl<'a> CommentTarget<'a> {
    /// Exactly one of `post_id` / `parent_id` must be set. Blank ids count
    /// as unset.
    pub fn resolve(
        post_id: Option<&'a str>,
        parent_id: Option<&'a str>,
    ) -> Result<Self, CommentTargetError> {
        let present = |id: Option<&'a str>| id.filter(|id| !id.trim().is_empty());
        match (present(post_id), present(parent_id)) {
            (Some(post_id), None) => Ok(Self::Post(post_id)),
            (None, Some(parent_id)) => Ok(Self::Reply(parent_id)),
            (Some(_), Some(_)) => Err(CommentTargetError::Both),
            (None, None) => Err(CommentTargetError::Neither),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommentTargetError {
    #[error("comment has both postId and parentId set")]
    Both,
    #[error("comment has neither postId nor parentId set")]
    Neither,
}

/// How a user came to be in a group or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Relationship {
    Create,
    Join,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Join => "JOIN",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown relationship kind: {0}")]
pub struct UnknownRelationship(pub String);

impl FromStr for Relationship {
    type Err = UnknownRelationship;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "JOIN" => Ok(Self::Join),
            other => Err(UnknownRelationship(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroup {
    pub user_id: String,
    pub group_id: String,
    pub relationship: Relationship,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChannel {
    pub user_id: String,
    pub channel_id: String,
    pub relationship: Relationship,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_target_requires_exactly_one_parent() {
        assert_eq!(
            CommentTarget::resolve(Some("p1"), None),
            Ok(CommentTarget::Post("p1"))
        );
        assert_eq!(
            CommentTarget::resolve(None, Some("c1")),
            Ok(CommentTarget::Reply("c1"))
        );
        assert_eq!(
            CommentTarget::resolve(Some("p1"), Some("c1")),
            Err(CommentTargetError::Both)
        );
        assert_eq!(
            CommentTarget::resolve(None, None),
            Err(CommentTargetError::Neither)
        );
    }

    #[test]
    fn blank_comment_parents_count_as_unset() {
        assert_eq!(
            CommentTarget::resolve(Some(""), Some("c1")),
            Ok(CommentTarget::Reply("c1"))
        );
        assert_eq!(
            CommentTarget::resolve(Some("p1"), Some("  ")),
            Ok(CommentTarget::Post("p1"))
        );
        assert_eq!(
            CommentTarget::resolve(Some(""), None),
            Err(CommentTargetError::Neither)
        );
    }

    #[test]
    fn general_channel_is_default() {
        let channel = Channel {
            channel_id: "ch_1".into(),
            name: "general".into(),
            group_id: "g1".into(),
        };
        assert!(ChannelView::from(&channel).is_default);

        let other = Channel {
            name: "random".into(),
            ..channel
        };
        assert!(!other.is_default());
    }

    #[test]
    fn relationship_wire_names() {
        assert_eq!(serde_json::to_string(&Relationship::Create).unwrap(), "\"CREATE\"");
        assert_eq!("JOIN".parse::<Relationship>().unwrap(), Relationship::Join);
        assert!("join".parse::<Relationship>().is_err());
    }

    #[test]
    fn user_optional_fields_default_to_none() {
        let user: User = serde_json::from_str(r#"{"email":"a@b.c","firstName":"Ann"}"#).unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Ann"));
        assert!(user.avatar_url.is_none());
    }
}
