//! Cache key layout. Writers (the projector) and readers (the query service)
//! both build keys through [`CacheKey`], so the two sides cannot drift apart.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// `user:<email>` hash of user fields
    User(&'a str),
    /// `group:<id>` hash of group fields
    Group(&'a str),
    /// `group:code` hash of join code -> group id
    GroupCodes,
    /// `channel:<id>` hash of channel fields
    Channel(&'a str),
    /// `group:channels:<groupId>` set of channel ids
    GroupChannels(&'a str),
    /// `group:<groupId>:posts` hash of post id -> post JSON
    GroupPosts(&'a str),
    /// `channel:<channelId>:posts` hash of post id -> post JSON
    ChannelPosts(&'a str),
    /// `post:<postId>:comments` hash of comment id -> comment JSON
    PostComments(&'a str),
    /// `comment:<parentId>:replies` hash of reply id -> comment JSON
    CommentReplies(&'a str),
    /// `user:group:<userId>:<groupId>` hash of relation fields
    UserGroup { user_id: &'a str, group_id: &'a str },
    /// `group:users:<groupId>` set of user ids
    GroupUsers(&'a str),
    /// `user:groups:<userId>` set of group ids
    UserGroups(&'a str),
    /// `user:channel:<userId>:<channelId>` hash of relation fields
    UserChannel { user_id: &'a str, channel_id: &'a str },
    /// `channel:users:<channelId>` set of user ids
    ChannelUsers(&'a str),
    /// `user:channels:<userId>` set of channel ids
    UserChannels(&'a str),
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(email) => write!(f, "user:{email}"),
            Self::Group(id) => write!(f, "group:{id}"),
            Self::GroupCodes => f.write_str("group:code"),
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::GroupChannels(group_id) => write!(f, "group:channels:{group_id}"),
            Self::GroupPosts(group_id) => write!(f, "group:{group_id}:posts"),
            Self::ChannelPosts(channel_id) => write!(f, "channel:{channel_id}:posts"),
            Self::PostComments(post_id) => write!(f, "post:{post_id}:comments"),
            Self::CommentReplies(parent_id) => write!(f, "comment:{parent_id}:replies"),
            Self::UserGroup { user_id, group_id } => write!(f, "user:group:{user_id}:{group_id}"),
            Self::GroupUsers(group_id) => write!(f, "group:users:{group_id}"),
            Self::UserGroups(user_id) => write!(f, "user:groups:{user_id}"),
            Self::UserChannel {
                user_id,
                channel_id,
            } => write!(f, "user:channel:{user_id}:{channel_id}"),
            Self::ChannelUsers(channel_id) => write!(f, "channel:users:{channel_id}"),
            Self::UserChannels(user_id) => write!(f, "user:channels:{user_id}"),
        }
    }
}

impl From<CacheKey<'_>> for String {
    fn from(key: CacheKey<'_>) -> Self {
        key.to_string()
    }
}
