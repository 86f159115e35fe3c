use std::sync::Arc;

use media_types::models::{ChannelView, Comment, Group, Post, User, UserChannel, UserGroup};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::models::HashRecord;
use crate::{Cache, CacheError, CacheKey};

/// Read side of the cache. Every getter distinguishes "not cached"
/// (`Ok(None)` / empty list) from a cache failure (`Err`).
#[derive(Clone)]
pub struct QueryService {
    cache: Arc<dyn Cache>,
}

impl QueryService {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.cache.ping().await
    }

    // -- Users --

    pub async fn get_user(&self, email: &str) -> Result<Option<User>, CacheError> {
        self.record(CacheKey::User(email)).await
    }

    // -- Groups --

    pub async fn get_group(&self, group_id: &str) -> Result<Option<Group>, CacheError> {
        self.record(CacheKey::Group(group_id)).await
    }

    pub async fn get_group_by_code(&self, code: &str) -> Result<Option<Group>, CacheError> {
        let key = CacheKey::GroupCodes.to_string();
        match self.cache.hash_get(&key, code).await? {
            Some(group_id) => self.get_group(&group_id).await,
            None => Ok(None),
        }
    }

    pub async fn get_group_users(&self, group_id: &str) -> Result<Vec<String>, CacheError> {
        self.members(CacheKey::GroupUsers(group_id)).await
    }

    pub async fn get_user_groups(&self, user_id: &str) -> Result<Vec<String>, CacheError> {
        self.members(CacheKey::UserGroups(user_id)).await
    }

    pub async fn get_user_group(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<UserGroup>, CacheError> {
        self.record(CacheKey::UserGroup { user_id, group_id }).await
    }

    // -- Channels --

    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelView>, CacheError> {
        self.record(CacheKey::Channel(channel_id)).await
    }

    /// Channels of a group, ordered by id. Ids in the membership set whose
    /// channel hash is missing or unreadable are skipped.
    pub async fn get_group_channels(&self, group_id: &str) -> Result<Vec<ChannelView>, CacheError> {
        let mut channels = Vec::new();
        for channel_id in self.members(CacheKey::GroupChannels(group_id)).await? {
            match self.get_channel(&channel_id).await {
                Ok(Some(channel)) => channels.push(channel),
                Ok(None) => {
                    warn!(group_id, channel_id = %channel_id, "Listed channel is not cached, skipping");
                }
                Err(CacheError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Skipping unreadable channel");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(channels)
    }

    /// First channel of the group flagged as default.
    pub async fn get_default_channel(
        &self,
        group_id: &str,
    ) -> Result<Option<ChannelView>, CacheError> {
        Ok(self
            .get_group_channels(group_id)
            .await?
            .into_iter()
            .find(|channel| channel.is_default))
    }

    pub async fn get_channel_users(&self, channel_id: &str) -> Result<Vec<String>, CacheError> {
        self.members(CacheKey::ChannelUsers(channel_id)).await
    }

    pub async fn get_user_channels(&self, user_id: &str) -> Result<Vec<String>, CacheError> {
        self.members(CacheKey::UserChannels(user_id)).await
    }

    pub async fn get_user_channel(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<Option<UserChannel>, CacheError> {
        self.record(CacheKey::UserChannel {
            user_id,
            channel_id,
        })
        .await
    }

    // -- Posts --

    pub async fn get_group_posts(&self, group_id: &str) -> Result<Vec<Post>, CacheError> {
        let mut posts: Vec<Post> = self.blobs(CacheKey::GroupPosts(group_id)).await?;
        posts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(posts)
    }

    pub async fn get_channel_posts(&self, channel_id: &str) -> Result<Vec<Post>, CacheError> {
        let mut posts: Vec<Post> = self.blobs(CacheKey::ChannelPosts(channel_id)).await?;
        posts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(posts)
    }

    pub async fn get_post(&self, group_id: &str, post_id: &str) -> Result<Option<Post>, CacheError> {
        self.blob(CacheKey::GroupPosts(group_id), post_id).await
    }

    // -- Comments --

    pub async fn get_post_comments(&self, post_id: &str) -> Result<Vec<Comment>, CacheError> {
        let mut comments: Vec<Comment> = self.blobs(CacheKey::PostComments(post_id)).await?;
        sort_comments(&mut comments);
        Ok(comments)
    }

    pub async fn get_comment_replies(&self, comment_id: &str) -> Result<Vec<Comment>, CacheError> {
        let mut replies: Vec<Comment> = self.blobs(CacheKey::CommentReplies(comment_id)).await?;
        sort_comments(&mut replies);
        Ok(replies)
    }

    pub async fn get_comment(
        &self,
        post_id: &str,
        comment_id: &str,
    ) -> Result<Option<Comment>, CacheError> {
        self.blob(CacheKey::PostComments(post_id), comment_id).await
    }

    pub async fn get_reply(
        &self,
        parent_id: &str,
        reply_id: &str,
    ) -> Result<Option<Comment>, CacheError> {
        self.blob(CacheKey::CommentReplies(parent_id), reply_id).await
    }

    // -- Helpers --

    async fn record<T: HashRecord>(&self, key: CacheKey<'_>) -> Result<Option<T>, CacheError> {
        let key = key.to_string();
        let fields = self.cache.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        T::from_fields(&fields)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key,
                reason: e.to_string(),
            })
    }

    async fn members(&self, key: CacheKey<'_>) -> Result<Vec<String>, CacheError> {
        let mut members = self.cache.set_members(&key.to_string()).await?;
        members.sort();
        Ok(members)
    }

    async fn blob<T: DeserializeOwned>(
        &self,
        key: CacheKey<'_>,
        field: &str,
    ) -> Result<Option<T>, CacheError> {
        let key = key.to_string();
        let Some(raw) = self.cache.hash_get(&key, field).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: format!("{key}[{field}]"),
                reason: e.to_string(),
            })
    }

    async fn blobs<T: DeserializeOwned>(&self, key: CacheKey<'_>) -> Result<Vec<T>, CacheError> {
        let key = key.to_string();
        let entries = self.cache.hash_get_all(&key).await?;

        let mut values = Vec::with_capacity(entries.len());
        for (field, raw) in entries {
            match serde_json::from_str(&raw) {
                Ok(value) => values.push(value),
                Err(e) => warn!(key = %key, field = %field, error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(values)
    }
}

fn sort_comments(comments: &mut [Comment]) {
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
