use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use media_types::api::{Claims, CommentRequest, DeleteCommentQuery};
use media_types::events::{CommentRef, DomainEvent};
use media_types::models::{Comment, CommentTarget};

use crate::accepted;
use crate::error::ApiError;
use crate::state::AppState;

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn build_comment(id: String, req: CommentRequest, claims: &Claims) -> Result<Comment, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("Comment content must not be empty"));
    }

    let mut author = req.author;
    if author.email.trim().is_empty() {
        author.email = claims.sub.clone();
    }
    let comment = Comment {
        id,
        post_id: non_empty(req.post_id),
        parent_id: non_empty(req.parent_id),
        author,
        content: req.content,
        created_at: chrono::Utc::now().timestamp_millis(),
    };
    comment
        .target()
        .map_err(|e| ApiError::bad_request(format!("Invalid comment target: {e}")))?;
    Ok(comment)
}

async fn publish_new(state: &AppState, comment: Comment) -> Result<String, ApiError> {
    let body = format!("Comment creation request accepted. Comment ID: {}", comment.id);
    state
        .publisher
        .publish(DomainEvent::CommentCreated(comment))
        .await?;
    Ok(body)
}

/// Top-level comment on a post.
pub async fn create_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = build_comment(Uuid::new_v4().to_string(), req, &claims)?;
    if comment.post_id.is_none() {
        return Err(ApiError::bad_request("postId is required for a comment"));
    }
    Ok(accepted(publish_new(&state, comment).await?))
}

/// Reply to another comment.
pub async fn create_reply(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = build_comment(Uuid::new_v4().to_string(), req, &claims)?;
    if comment.parent_id.is_none() {
        return Err(ApiError::bad_request("parentId is required for a reply"));
    }
    Ok(accepted(publish_new(&state, comment).await?))
}

pub async fn update_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(comment_id): Path<String>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = build_comment(comment_id.clone(), req, &claims)?;
    state
        .publisher
        .publish(DomainEvent::CommentUpdated(comment))
        .await?;
    Ok(accepted(format!(
        "Comment update request accepted. Comment ID: {comment_id}"
    )))
}

pub async fn delete_comment(
    State(state): State<AppState>,
    Path(comment_id): Path<String>,
    Query(query): Query<DeleteCommentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let post_id = non_empty(query.post_id);
    let parent_id = non_empty(query.parent_id);
    CommentTarget::resolve(post_id.as_deref(), parent_id.as_deref())
        .map_err(|e| ApiError::bad_request(format!("Invalid comment target: {e}")))?;

    state
        .publisher
        .publish(DomainEvent::CommentDeleted(CommentRef {
            id: comment_id.clone(),
            post_id,
            parent_id,
        }))
        .await?;
    Ok(accepted(format!(
        "Comment deletion request accepted. Comment ID: {comment_id}"
    )))
}

// -- Reads --

pub async fn get_post_comments(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_post_comments(&post_id).await?))
}

pub async fn get_comment_replies(
    State(state): State<AppState>,
    Path(comment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queries.get_comment_replies(&comment_id).await?))
}

pub async fn get_comment(
    State(state): State<AppState>,
    Path((post_id, comment_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = state
        .queries
        .get_comment(&post_id, &comment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Comment not found in cache"))?;
    Ok(Json(comment))
}

pub async fn get_reply(
    State(state): State<AppState>,
    Path((parent_id, reply_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let reply = state
        .queries
        .get_reply(&parent_id, &reply_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Reply not found in cache"))?;
    Ok(Json(reply))
}
