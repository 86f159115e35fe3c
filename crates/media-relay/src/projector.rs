use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use media_cache::models::HashRecord;
use media_cache::{Cache, CacheError, CacheKey, Mutation};
use media_types::events::{CommentRef, DomainEvent, Envelope, PostLike, PostRef, Topic};
use media_types::models::{
    Channel, ChannelView, Comment, CommentTarget, Group, Post, User, UserChannel, UserGroup,
};

/// The projector families. Each runs as its own consumer with its own group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectorKind {
    User,
    Group,
    Channel,
    Post,
    Comment,
    UserGroup,
    UserChannel,
}

impl ProjectorKind {
    pub const ALL: [ProjectorKind; 7] = [
        ProjectorKind::User,
        ProjectorKind::Group,
        ProjectorKind::Channel,
        ProjectorKind::Post,
        ProjectorKind::Comment,
        ProjectorKind::UserGroup,
        ProjectorKind::UserChannel,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Channel => "channel",
            Self::Post => "post",
            Self::Comment => "comment",
            Self::UserGroup => "user-group",
            Self::UserChannel => "user-channel",
        }
    }

    pub fn topics(&self) -> &'static [Topic] {
        match self {
            Self::User => &[Topic::UserCreate, Topic::UserUpdate],
            Self::Group => &[Topic::GroupCreated, Topic::GroupUpdated],
            Self::Channel => &[Topic::ChannelCreated, Topic::ChannelUpdated],
            Self::Post => &[
                Topic::PostCreated,
                Topic::PostUpdated,
                Topic::PostDeleted,
                Topic::PostLiked,
            ],
            Self::Comment => &[
                Topic::CommentCreated,
                Topic::CommentUpdated,
                Topic::CommentDeleted,
            ],
            Self::UserGroup => &[Topic::UserGroupCreate, Topic::UserGroupJoin],
            Self::UserChannel => &[Topic::UserChannelEvents],
        }
    }

    /// Consumer group name on the broker.
    pub fn group(&self) -> String {
        format!("media-{}-projector", self.name())
    }

    pub fn handles(&self, topic: Topic) -> bool {
        self.topics().contains(&topic)
    }
}

impl fmt::Display for ProjectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The payload is not a valid envelope.
    #[error("undecodable message: {0}")]
    Decode(String),

    /// The event decoded but violates an invariant or arrived on the wrong topic.
    #[error("event rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ProjectionError {
    /// Only cache I/O failures can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Cache(CacheError::Connection(_) | CacheError::Command(_))
        )
    }
}

fn rejected(reason: impl Into<String>) -> ProjectionError {
    ProjectionError::Rejected(reason.into())
}

fn require(value: &str, what: &str) -> Result<(), ProjectionError> {
    if value.trim().is_empty() {
        return Err(rejected(format!("{what} is empty")));
    }
    Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, ProjectionError> {
    serde_json::to_string(value).map_err(|e| rejected(format!("cannot encode payload: {e}")))
}

/// Projects the events of one [`ProjectorKind`] into the cache.
#[derive(Clone)]
pub struct Projector {
    kind: ProjectorKind,
    cache: Arc<dyn Cache>,
}

impl Projector {
    pub fn new(kind: ProjectorKind, cache: Arc<dyn Cache>) -> Self {
        Self { kind, cache }
    }

    pub fn kind(&self) -> ProjectorKind {
        self.kind
    }

    /// Decode a raw payload received on `topic` and check it belongs here.
    pub fn decode(&self, topic: Topic, payload: &str) -> Result<Envelope, ProjectionError> {
        let envelope: Envelope =
            serde_json::from_str(payload).map_err(|e| ProjectionError::Decode(e.to_string()))?;

        if !self.kind.handles(topic) {
            return Err(rejected(format!(
                "{} projector does not consume {topic}",
                self.kind
            )));
        }
        if envelope.topic() != topic {
            return Err(rejected(format!(
                "{} event received on {topic}",
                envelope.event.name()
            )));
        }
        Ok(envelope)
    }

    /// Apply one event. Safe to repeat: replaying the same event leaves the
    /// cache in the same state.
    pub async fn project(&self, envelope: &Envelope) -> Result<(), ProjectionError> {
        let plan = plan(&envelope.event, self.cache.as_ref()).await?;
        if plan.is_empty() {
            return Ok(());
        }
        self.cache.apply(&plan).await?;

        debug!(
            projector = %self.kind,
            event = envelope.event.name(),
            key = %envelope.key,
            mutations = plan.len(),
            "Projected event"
        );
        Ok(())
    }
}

/// Build the cache mutations for one event. Every check runs before anything
/// is written, so a rejected event leaves the cache untouched. Only reads
/// touch the cache here.
pub async fn plan(event: &DomainEvent, cache: &dyn Cache) -> Result<Vec<Mutation>, ProjectionError> {
    match event {
        DomainEvent::UserCreated(user) | DomainEvent::UserUpdated(user) => plan_user(user),
        DomainEvent::GroupCreated(group) | DomainEvent::GroupUpdated(group) => {
            plan_group(group, cache).await
        }
        DomainEvent::ChannelCreated(channel) | DomainEvent::ChannelUpdated(channel) => {
            plan_channel(channel)
        }
        DomainEvent::PostCreated(post) | DomainEvent::PostUpdated(post) => {
            plan_post(post, cache).await
        }
        DomainEvent::PostDeleted(post) => plan_post_delete(post, cache).await,
        DomainEvent::PostLiked(like) => plan_post_like(like, cache).await,
        DomainEvent::CommentCreated(comment) | DomainEvent::CommentUpdated(comment) => {
            plan_comment(comment)
        }
        DomainEvent::CommentDeleted(comment) => plan_comment_delete(comment),
        DomainEvent::UserGroupLinked(rel) => plan_user_group(rel),
        DomainEvent::UserChannelLinked(rel) => plan_user_channel(rel),
    }
}

fn hash_put(key: CacheKey<'_>, fields: Vec<(String, String)>) -> Mutation {
    Mutation::HashPut {
        key: key.to_string(),
        fields,
    }
}

fn hash_field(key: CacheKey<'_>, field: &str, value: String) -> Mutation {
    hash_put(key, vec![(field.to_string(), value)])
}

fn hash_delete(key: CacheKey<'_>, field: &str) -> Mutation {
    Mutation::HashDelete {
        key: key.to_string(),
        field: field.to_string(),
    }
}

fn set_add(key: CacheKey<'_>, member: &str) -> Mutation {
    Mutation::SetAdd {
        key: key.to_string(),
        member: member.to_string(),
    }
}

// -- Users --

fn plan_user(user: &User) -> Result<Vec<Mutation>, ProjectionError> {
    require(&user.email, "user email")?;
    Ok(vec![hash_put(CacheKey::User(&user.email), user.to_fields())])
}

// -- Groups --

async fn plan_group(group: &Group, cache: &dyn Cache) -> Result<Vec<Mutation>, ProjectionError> {
    require(&group.id, "group id")?;
    require(&group.code, "group code")?;

    let codes = CacheKey::GroupCodes.to_string();
    let mut plan = Vec::new();

    // A changed code leaves the old one pointing at this group; drop it
    // unless another group has taken it since.
    let previous = cache
        .hash_get(&CacheKey::Group(&group.id).to_string(), "code")
        .await?;
    if let Some(old_code) = previous.filter(|old| !old.is_empty() && *old != group.code) {
        if cache.hash_get(&codes, &old_code).await?.as_deref() == Some(group.id.as_str()) {
            plan.push(hash_delete(CacheKey::GroupCodes, &old_code));
        }
    }

    if let Some(owner) = cache.hash_get(&codes, &group.code).await? {
        if owner != group.id {
            warn!(code = %group.code, owner = %owner, group_id = %group.id, "Group code reassigned");
        }
    }

    plan.push(hash_put(CacheKey::Group(&group.id), group.to_fields()));
    plan.push(hash_field(CacheKey::GroupCodes, &group.code, group.id.clone()));
    Ok(plan)
}

// -- Channels --

fn plan_channel(channel: &Channel) -> Result<Vec<Mutation>, ProjectionError> {
    require(&channel.channel_id, "channel id")?;
    require(&channel.group_id, "channel group id")?;

    let view = ChannelView::from(channel);
    Ok(vec![
        hash_put(CacheKey::Channel(&channel.channel_id), view.to_fields()),
        set_add(CacheKey::GroupChannels(&channel.group_id), &channel.channel_id),
    ])
}

// -- Posts --

fn post_channel(post: &Post) -> Option<&str> {
    post.channel_id.as_deref().filter(|c| !c.is_empty())
}

async fn plan_post(post: &Post, cache: &dyn Cache) -> Result<Vec<Mutation>, ProjectionError> {
    require(&post.id, "post id")?;
    require(&post.group_id, "post group id")?;

    // A post moved out of a channel must leave that channel's listing.
    let mut plan = Vec::with_capacity(3);
    if let Some(stored) = stored_post(cache, &post.group_id, &post.id).await? {
        if let Some(old) = post_channel(&stored).filter(|old| Some(*old) != post_channel(post)) {
            plan.push(hash_delete(CacheKey::ChannelPosts(old), &post.id));
        }
    }
    plan.extend(write_post(post, encode(post)?));
    Ok(plan)
}

fn write_post(post: &Post, json: String) -> Vec<Mutation> {
    let mut plan = Vec::with_capacity(2);
    if let Some(channel_id) = post_channel(post) {
        plan.push(hash_field(CacheKey::ChannelPosts(channel_id), &post.id, json.clone()));
    }
    plan.push(hash_field(CacheKey::GroupPosts(&post.group_id), &post.id, json));
    plan
}

async fn cached_post(
    cache: &dyn Cache,
    group_id: &str,
    post_id: &str,
) -> Result<Option<Post>, ProjectionError> {
    let key = CacheKey::GroupPosts(group_id).to_string();
    let Some(raw) = cache.hash_get(&key, post_id).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw).map(Some).map_err(|e| {
        CacheError::Corrupt {
            key: format!("{key}[{post_id}]"),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Like [`cached_post`], but a corrupt copy reads as absent since the caller
/// is about to overwrite or remove it. Connection failures still propagate.
async fn stored_post(
    cache: &dyn Cache,
    group_id: &str,
    post_id: &str,
) -> Result<Option<Post>, ProjectionError> {
    match cached_post(cache, group_id, post_id).await {
        Err(ProjectionError::Cache(CacheError::Corrupt { key, reason })) => {
            warn!(key = %key, reason = %reason, "Ignoring unreadable stored post");
            Ok(None)
        }
        other => other,
    }
}

async fn plan_post_delete(
    post: &PostRef,
    cache: &dyn Cache,
) -> Result<Vec<Mutation>, ProjectionError> {
    require(&post.id, "post id")?;
    require(&post.group_id, "post group id")?;

    // The event's channel and the one the cached post names can differ;
    // clear both.
    let stored = stored_post(cache, &post.group_id, &post.id).await?;
    let mut channels: Vec<&str> = post.channel_id.as_deref().into_iter().collect();
    channels.extend(stored.as_ref().and_then(post_channel));
    channels.retain(|c| !c.is_empty());
    channels.dedup();

    let mut plan = vec![hash_delete(CacheKey::GroupPosts(&post.group_id), &post.id)];
    for channel_id in channels {
        plan.push(hash_delete(CacheKey::ChannelPosts(channel_id), &post.id));
    }
    Ok(plan)
}

async fn plan_post_like(
    like: &PostLike,
    cache: &dyn Cache,
) -> Result<Vec<Mutation>, ProjectionError> {
    require(&like.id, "post id")?;
    require(&like.group_id, "post group id")?;

    let Some(mut post) = cached_post(cache, &like.group_id, &like.id).await? else {
        debug!(post_id = %like.id, group_id = %like.group_id, "Like for uncached post ignored");
        return Ok(Vec::new());
    };
    post.likes = like.likes;
    let json = encode(&post)?;
    Ok(write_post(&post, json))
}

// -- Comments --

fn comment_hash(target: CommentTarget<'_>) -> CacheKey<'_> {
    match target {
        CommentTarget::Post(post_id) => CacheKey::PostComments(post_id),
        CommentTarget::Reply(parent_id) => CacheKey::CommentReplies(parent_id),
    }
}

fn plan_comment(comment: &Comment) -> Result<Vec<Mutation>, ProjectionError> {
    require(&comment.id, "comment id")?;
    let target = comment
        .target()
        .map_err(|e| rejected(format!("comment {}: {e}", comment.id)))?;

    Ok(vec![hash_field(comment_hash(target), &comment.id, encode(comment)?)])
}

fn plan_comment_delete(comment: &CommentRef) -> Result<Vec<Mutation>, ProjectionError> {
    require(&comment.id, "comment id")?;
    let target = CommentTarget::resolve(comment.post_id.as_deref(), comment.parent_id.as_deref())
        .map_err(|e| rejected(format!("comment {}: {e}", comment.id)))?;

    Ok(vec![hash_delete(comment_hash(target), &comment.id)])
}

// -- Memberships --

fn plan_user_group(rel: &UserGroup) -> Result<Vec<Mutation>, ProjectionError> {
    require(&rel.user_id, "user id")?;
    require(&rel.group_id, "group id")?;

    Ok(vec![
        hash_put(
            CacheKey::UserGroup {
                user_id: &rel.user_id,
                group_id: &rel.group_id,
            },
            rel.to_fields(),
        ),
        set_add(CacheKey::GroupUsers(&rel.group_id), &rel.user_id),
        set_add(CacheKey::UserGroups(&rel.user_id), &rel.group_id),
    ])
}

fn plan_user_channel(rel: &UserChannel) -> Result<Vec<Mutation>, ProjectionError> {
    require(&rel.user_id, "user id")?;
    require(&rel.channel_id, "channel id")?;

    Ok(vec![
        hash_put(
            CacheKey::UserChannel {
                user_id: &rel.user_id,
                channel_id: &rel.channel_id,
            },
            rel.to_fields(),
        ),
        set_add(CacheKey::ChannelUsers(&rel.channel_id), &rel.user_id),
        set_add(CacheKey::UserChannels(&rel.user_id), &rel.channel_id),
    ])
}
