use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use media_types::api::{Claims, CreateGroupRequest, JoinGroupRequest, UpdateGroupRequest};
use media_types::events::DomainEvent;
use media_types::models::{
    Channel, DEFAULT_CHANNEL_NAME, Group, Relationship, UserChannel, UserGroup,
};

use crate::error::ApiError;
use crate::state::AppState;
use crate::{accepted, new_channel_id};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;

/// Attempts at drawing a code not already in the cache.
const CODE_ATTEMPTS: usize = 5;

pub fn generate_group_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

async fn unused_group_code(
    state: &AppState,
    mut draw: impl FnMut() -> String,
) -> Result<String, ApiError> {
    for _ in 0..CODE_ATTEMPTS {
        let code = draw();
        if state.queries.get_group_by_code(&code).await?.is_none() {
            return Ok(code);
        }
        warn!("Group code {} already taken, drawing another", code);
    }
    Err(ApiError::Conflict(
        "Could not allocate an unused group code, try again".into(),
    ))
}

/// Create a group with its default channel, both owned by the caller.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Group name must not be empty"));
    }

    let group = Group {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        code: unused_group_code(&state, generate_group_code).await?,
        hidden: req.hidden,
        created_by: claims.sub.clone(),
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    let channel = Channel {
        channel_id: new_channel_id(),
        name: DEFAULT_CHANNEL_NAME.to_string(),
        group_id: group.id.clone(),
    };

    let body = format!(
        "Group creation request accepted. Group ID: {}, Code: {}",
        group.id, group.code
    );
    let events = vec![
        DomainEvent::UserGroupLinked(UserGroup {
            user_id: claims.sub.clone(),
            group_id: group.id.clone(),
            relationship: Relationship::Create,
        }),
        DomainEvent::UserChannelLinked(UserChannel {
            user_id: claims.sub.clone(),
            channel_id: channel.channel_id.clone(),
            relationship: Relationship::Create,
        }),
        DomainEvent::ChannelCreated(channel),
        DomainEvent::GroupCreated(group),
    ];
    state
        .publisher
        .publish_all(events, state.publish_timeout)
        .await?;

    info!("{} created a group: {}", claims.sub, body);
    Ok(accepted(body))
}

pub async fn join_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<JoinGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .queries
        .get_group_by_code(req.group_code.trim())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Group not found with code: {}", req.group_code)))?;

    if state
        .queries
        .get_user_group(&claims.sub, &group.id)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(
            "User is already a member of this group".into(),
        ));
    }

    state
        .publisher
        .publish(DomainEvent::UserGroupLinked(UserGroup {
            user_id: claims.sub.clone(),
            group_id: group.id.clone(),
            relationship: Relationship::Join,
        }))
        .await?;

    Ok(accepted(format!(
        "Group join request accepted. User: {}, Group: {}",
        claims.sub, group.id
    )))
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut group = state
        .queries
        .get_group(&group_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Group not found in cache"))?;

    if let Some(name) = req.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::bad_request("Group name must not be empty"));
        }
        group.name = name.to_string();
    }
    if let Some(hidden) = req.hidden {
        group.hidden = hidden;
    }

    state
        .publisher
        .publish(DomainEvent::GroupUpdated(group))
        .await?;
    Ok(accepted(format!("Group update request accepted. Group ID: {group_id}")))
}

// -- Reads --

pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .queries
        .get_group(&group_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Group not found in cache"))?;
    Ok(Json(group))
}

pub async fn get_group_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .queries
        .get_group_by_code(&code)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Group not found with code: {code}")))?;
    Ok(Json(group))
}

pub async fn get_group_users(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_group_users(&group_id).await?))
}

pub async fn get_user_groups(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_user_groups(&user_id).await?))
}

pub async fn get_relationship(
    State(state): State<AppState>,
    Path((user_id, group_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let relation = state
        .queries
        .get_user_group(&user_id, &group_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User-group relationship not found"))?;
    Ok(Json(relation))
}
