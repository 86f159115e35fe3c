use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Channel, Comment, Group, Post, Relationship, User, UserChannel, UserGroup};

/// Broker topics. The string names are fixed and shared with other producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    UserCreate,
    UserUpdate,
    GroupCreated,
    GroupUpdated,
    UserGroupCreate,
    UserGroupJoin,
    ChannelCreated,
    ChannelUpdated,
    UserChannelEvents,
    PostCreated,
    PostUpdated,
    PostDeleted,
    PostLiked,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    #[serde(rename = "media-dead-letter")]
    DeadLetter,
}

impl Topic {
    pub const ALL: [Topic; 17] = [
        Topic::UserCreate,
        Topic::UserUpdate,
        Topic::GroupCreated,
        Topic::GroupUpdated,
        Topic::UserGroupCreate,
        Topic::UserGroupJoin,
        Topic::ChannelCreated,
        Topic::ChannelUpdated,
        Topic::UserChannelEvents,
        Topic::PostCreated,
        Topic::PostUpdated,
        Topic::PostDeleted,
        Topic::PostLiked,
        Topic::CommentCreated,
        Topic::CommentUpdated,
        Topic::CommentDeleted,
        Topic::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCreate => "user-create",
            Self::UserUpdate => "user-update",
            Self::GroupCreated => "group-created",
            Self::GroupUpdated => "group-updated",
            Self::UserGroupCreate => "user-group-create",
            Self::UserGroupJoin => "user-group-join",
            Self::ChannelCreated => "channel-created",
            Self::ChannelUpdated => "channel-updated",
            Self::UserChannelEvents => "user-channel-events",
            Self::PostCreated => "post-created",
            Self::PostUpdated => "post-updated",
            Self::PostDeleted => "post-deleted",
            Self::PostLiked => "post-liked",
            Self::CommentCreated => "comment-created",
            Self::CommentUpdated => "comment-updated",
            Self::CommentDeleted => "comment-deleted",
            Self::DeadLetter => "media-dead-letter",
        }
    }

    /// Number of partitions the topic is provisioned with.
    pub fn partitions(&self) -> u32 {
        match self {
            Self::DeadLetter => 1,
            _ => 3,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// Identifies a post to remove from its group (and channel) listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRef {
    pub id: String,
    pub group_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Absolute like count for a post. Absolute rather than a delta so that
/// redelivery leaves the same count behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostLike {
    pub id: String,
    pub group_id: String,
    pub likes: u32,
}

/// Identifies a comment or reply to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRef {
    pub id: String,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Domain events relayed through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    UserCreated(User),
    UserUpdated(User),

    GroupCreated(Group),
    GroupUpdated(Group),

    ChannelCreated(Channel),
    ChannelUpdated(Channel),

    PostCreated(Post),
    PostUpdated(Post),
    PostDeleted(PostRef),
    PostLiked(PostLike),

    CommentCreated(Comment),
    CommentUpdated(Comment),
    CommentDeleted(CommentRef),

    /// A user created or joined a group
    UserGroupLinked(UserGroup),

    /// A user created or joined a channel
    UserChannelLinked(UserChannel),
}

impl DomainEvent {
    /// Topic this event is published to.
    pub fn topic(&self) -> Topic {
        match self {
            Self::UserCreated(_) => Topic::UserCreate,
            Self::UserUpdated(_) => Topic::UserUpdate,
            Self::GroupCreated(_) => Topic::GroupCreated,
            Self::GroupUpdated(_) => Topic::GroupUpdated,
            Self::ChannelCreated(_) => Topic::ChannelCreated,
            Self::ChannelUpdated(_) => Topic::ChannelUpdated,
            Self::PostCreated(_) => Topic::PostCreated,
            Self::PostUpdated(_) => Topic::PostUpdated,
            Self::PostDeleted(_) => Topic::PostDeleted,
            Self::PostLiked(_) => Topic::PostLiked,
            Self::CommentCreated(_) => Topic::CommentCreated,
            Self::CommentUpdated(_) => Topic::CommentUpdated,
            Self::CommentDeleted(_) => Topic::CommentDeleted,
            Self::UserGroupLinked(rel) => match rel.relationship {
                Relationship::Create => Topic::UserGroupCreate,
                Relationship::Join => Topic::UserGroupJoin,
            },
            Self::UserChannelLinked(_) => Topic::UserChannelEvents,
        }
    }

    /// Partitioning key, built from the entity's natural identifier.
    pub fn key(&self) -> String {
        match self {
            Self::UserCreated(user) | Self::UserUpdated(user) => user.email.clone(),
            Self::GroupCreated(group) | Self::GroupUpdated(group) => group.id.clone(),
            Self::ChannelCreated(channel) | Self::ChannelUpdated(channel) => {
                channel.channel_id.clone()
            }
            Self::PostCreated(post) | Self::PostUpdated(post) => post.id.clone(),
            Self::PostDeleted(post) => post.id.clone(),
            Self::PostLiked(like) => like.id.clone(),
            Self::CommentCreated(comment) | Self::CommentUpdated(comment) => comment.id.clone(),
            Self::CommentDeleted(comment) => comment.id.clone(),
            Self::UserGroupLinked(rel) => format!("{}:{}", rel.user_id, rel.group_id),
            Self::UserChannelLinked(rel) => format!("{}:{}", rel.user_id, rel.channel_id),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserCreated(_) => "UserCreated",
            Self::UserUpdated(_) => "UserUpdated",
            Self::GroupCreated(_) => "GroupCreated",
            Self::GroupUpdated(_) => "GroupUpdated",
            Self::ChannelCreated(_) => "ChannelCreated",
            Self::ChannelUpdated(_) => "ChannelUpdated",
            Self::PostCreated(_) => "PostCreated",
            Self::PostUpdated(_) => "PostUpdated",
            Self::PostDeleted(_) => "PostDeleted",
            Self::PostLiked(_) => "PostLiked",
            Self::CommentCreated(_) => "CommentCreated",
            Self::CommentUpdated(_) => "CommentUpdated",
            Self::CommentDeleted(_) => "CommentDeleted",
            Self::UserGroupLinked(_) => "UserGroupLinked",
            Self::UserChannelLinked(_) => "UserChannelLinked",
        }
    }
}

/// What travels on the wire: the event plus its key and publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub key: String,
    pub event: DomainEvent,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            key: event.key(),
            event,
            published_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }
}
