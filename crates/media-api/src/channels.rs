use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use media_types::api::{Claims, CreateChannelRequest, UpdateChannelRequest};
use media_types::events::DomainEvent;
use media_types::models::{Channel, DEFAULT_CHANNEL_NAME, Relationship, UserChannel};

use crate::error::ApiError;
use crate::state::AppState;
use crate::{accepted, new_channel_id};

fn reserved_name() -> ApiError {
    ApiError::Conflict(format!(
        "Channel name '{DEFAULT_CHANNEL_NAME}' is reserved for the group's default channel"
    ))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Channel name must not be empty"));
    }
    // A group's only default channel is the one created with the group.
    if name == DEFAULT_CHANNEL_NAME {
        return Err(reserved_name());
    }
    if state.queries.get_group(&req.group_id).await?.is_none() {
        return Err(ApiError::not_found("Group not found in cache"));
    }

    let channel = Channel {
        channel_id: new_channel_id(),
        name: name.to_string(),
        group_id: req.group_id.clone(),
    };
    let body = format!(
        "Channel creation request accepted. Channel ID: {}",
        channel.channel_id
    );

    let events = vec![
        DomainEvent::UserChannelLinked(UserChannel {
            user_id: claims.sub.clone(),
            channel_id: channel.channel_id.clone(),
            relationship: Relationship::Create,
        }),
        DomainEvent::ChannelCreated(channel),
    ];
    state
        .publisher
        .publish_all(events, state.publish_timeout)
        .await?;
    Ok(accepted(body))
}

/// Rename a channel. Its group never changes, and the default channel keeps
/// its name.
pub async fn update_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(req): Json<UpdateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Channel name must not be empty"));
    }
    let current = state
        .queries
        .get_channel(&channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel not found in cache"))?;
    if current.is_default {
        return Err(ApiError::Conflict(
            "The default channel cannot be renamed".into(),
        ));
    }
    if name == DEFAULT_CHANNEL_NAME {
        return Err(reserved_name());
    }

    state
        .publisher
        .publish(DomainEvent::ChannelUpdated(Channel {
            channel_id: current.channel_id,
            name: name.to_string(),
            group_id: current.group_id,
        }))
        .await?;
    Ok(accepted(format!(
        "Channel update request accepted. Channel ID: {channel_id}"
    )))
}

pub async fn join_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.queries.get_channel(&channel_id).await?.is_none() {
        return Err(ApiError::not_found("Channel not found in cache"));
    }
    if state
        .queries
        .get_user_channel(&claims.sub, &channel_id)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(
            "User is already a member of this channel".into(),
        ));
    }

    state
        .publisher
        .publish(DomainEvent::UserChannelLinked(UserChannel {
            user_id: claims.sub.clone(),
            channel_id: channel_id.clone(),
            relationship: Relationship::Join,
        }))
        .await?;
    Ok(accepted(format!(
        "Channel join request accepted. User: {}, Channel: {}",
        claims.sub, channel_id
    )))
}

// -- Reads --

pub async fn get_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state
        .queries
        .get_channel(&channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Channel not found in cache"))?;
    Ok(Json(channel))
}

pub async fn get_group_channels(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_group_channels(&group_id).await?))
}

pub async fn get_default_channel(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state
        .queries
        .get_default_channel(&group_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Default channel not found for group"))?;
    Ok(Json(channel))
}

pub async fn get_channel_users(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_channel_users(&channel_id).await?))
}

pub async fn get_user_channels(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_user_channels(&user_id).await?))
}

pub async fn get_relationship(
    State(state): State<AppState>,
    Path((user_id, channel_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let relation = state
        .queries
        .get_user_channel(&user_id, &channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User-channel relationship not found"))?;
    Ok(Json(relation))
}
