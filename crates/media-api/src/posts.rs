use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use media_types::api::{Claims, DeletePostQuery, LikePostQuery, PostRequest};
use media_types::events::{DomainEvent, PostLike, PostRef};
use media_types::models::Post;

use crate::accepted;
use crate::error::ApiError;
use crate::state::AppState;

fn build_post(id: String, req: PostRequest, claims: &Claims) -> Result<Post, ApiError> {
    if req.group_id.trim().is_empty() {
        return Err(ApiError::bad_request("groupId is required"));
    }
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("Post content must not be empty"));
    }

    let mut author = req.author;
    if author.email.trim().is_empty() {
        author.email = claims.sub.clone();
    }
    Ok(Post {
        id,
        group_id: req.group_id,
        channel_id: req.channel_id.filter(|c| !c.trim().is_empty()),
        author,
        content: req.content,
        likes: req.likes,
    })
}

pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let post = build_post(Uuid::new_v4().to_string(), req, &claims)?;
    let body = format!("Post creation request accepted. Post ID: {}", post.id);
    state.publisher.publish(DomainEvent::PostCreated(post)).await?;
    Ok(accepted(body))
}

pub async fn update_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<String>,
    Json(req): Json<PostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let post = build_post(post_id.clone(), req, &claims)?;
    state.publisher.publish(DomainEvent::PostUpdated(post)).await?;
    Ok(accepted(format!("Post update request accepted. Post ID: {post_id}")))
}

pub async fn delete_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Query(query): Query<DeletePostQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.group_id.trim().is_empty() {
        return Err(ApiError::bad_request("groupId is required"));
    }

    state
        .publisher
        .publish(DomainEvent::PostDeleted(PostRef {
            id: post_id.clone(),
            group_id: query.group_id,
            channel_id: query.channel_id.filter(|c| !c.trim().is_empty()),
        }))
        .await?;
    Ok(accepted(format!("Post deletion request accepted. Post ID: {post_id}")))
}

/// Add one like. The event carries the resulting count, not the increment.
pub async fn like_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Query(query): Query<LikePostQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let post = state
        .queries
        .get_post(&query.group_id, &post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found in cache"))?;

    let likes = post.likes.saturating_add(1);
    state
        .publisher
        .publish(DomainEvent::PostLiked(PostLike {
            id: post.id,
            group_id: post.group_id,
            likes,
        }))
        .await?;
    Ok(accepted(format!(
        "Post like request accepted. Post ID: {post_id}, likes: {likes}"
    )))
}

// -- Reads --

pub async fn get_group_posts(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_group_posts(&group_id).await?))
}

pub async fn get_channel_posts(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_channel_posts(&channel_id).await?))
}

pub async fn get_post(
    State(state): State<AppState>,
    Path((group_id, post_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let post = state
        .queries
        .get_post(&group_id, &post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found in cache"))?;
    Ok(Json(post))
}
