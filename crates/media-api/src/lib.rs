pub mod channels;
pub mod comments;
pub mod error;
pub mod groups;
pub mod health;
pub mod middleware;
pub mod posts;
pub mod state;
pub mod users;

use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use uuid::Uuid;

use crate::middleware::require_auth;
use crate::state::AppState;

/// Every publishing route answers 202 with a short human-readable body.
pub(crate) fn accepted(body: impl Into<String>) -> impl IntoResponse {
    (StatusCode::ACCEPTED, body.into())
}

pub(crate) fn new_channel_id() -> String {
    format!("ch_{}", Uuid::new_v4())
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .with_state(state.clone());

    let protected_routes = Router::new()
        // Users
        .route("/user-events/create", post(users::create_user))
        .route("/user-events/update", post(users::update_user))
        .route("/users/get", get(users::get_user))
        // Groups
        .route("/group-events/create", post(groups::create_group))
        .route("/group-events/join", post(groups::join_group))
        .route("/group-events/update/{group_id}", put(groups::update_group))
        .route("/group-events/{group_id}", get(groups::get_group))
        .route("/group-events/code/{code}", get(groups::get_group_by_code))
        .route("/group-events/{group_id}/users", get(groups::get_group_users))
        .route("/group-events/user/{user_id}", get(groups::get_user_groups))
        .route(
            "/group-events/relationship/{user_id}/{group_id}",
            get(groups::get_relationship),
        )
        // Channels
        .route("/channel-events/create", post(channels::create_channel))
        .route("/channel-events/update/{channel_id}", put(channels::update_channel))
        .route("/channel-events/{channel_id}/join", post(channels::join_channel))
        .route("/channel-events/{channel_id}", get(channels::get_channel))
        .route("/channel-events/group/{group_id}", get(channels::get_group_channels))
        .route(
            "/channel-events/group/{group_id}/default",
            get(channels::get_default_channel),
        )
        .route("/channel-events/{channel_id}/users", get(channels::get_channel_users))
        .route("/channel-events/user/{user_id}", get(channels::get_user_channels))
        .route(
            "/channel-events/relationship/{user_id}/{channel_id}",
            get(channels::get_relationship),
        )
        // Posts
        .route("/post-events/create", post(posts::create_post))
        .route("/post-events/update/{post_id}", put(posts::update_post))
        .route("/post-events/delete/{post_id}", delete(posts::delete_post))
        .route("/post-events/like/{post_id}", post(posts::like_post))
        .route("/post/group/{group_id}", get(posts::get_group_posts))
        .route("/post/channel/{channel_id}", get(posts::get_channel_posts))
        .route("/post/{group_id}/{post_id}", get(posts::get_post))
        // Comments
        .route("/comment-events/create/comment", post(comments::create_comment))
        .route("/comment-events/create/reply", post(comments::create_reply))
        .route("/comment-events/update/{comment_id}", put(comments::update_comment))
        .route("/comment-events/delete/{comment_id}", delete(comments::delete_comment))
        .route("/comment/post/{post_id}", get(comments::get_post_comments))
        .route("/comment/replies/{comment_id}", get(comments::get_comment_replies))
        .route("/comment/post/{post_id}/{comment_id}", get(comments::get_comment))
        .route("/comment/reply/{parent_id}/{reply_id}", get(comments::get_reply))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use media_cache::{Cache, MemoryCache, QueryService};
    use media_relay::{Consumer, ConsumerConfig, MemoryBroker, Projector, ProjectorKind, Publisher};
    use media_types::api::Claims;
    use media_types::events::Topic;

    use super::*;
    use crate::state::AppStateInner;

    const SECRET: &str = "test-secret";

    struct Harness {
        app: Router,
        cache: Arc<MemoryCache>,
        broker: Arc<MemoryBroker>,
    }

    impl Harness {
        fn new() -> Self {
            let cache = Arc::new(MemoryCache::new());
            let broker = Arc::new(MemoryBroker::new());
            let state: AppState = Arc::new(AppStateInner {
                publisher: Publisher::new(broker.clone()),
                queries: QueryService::new(cache.clone()),
                jwt_secret: SECRET.into(),
                publish_timeout: Duration::from_secs(5),
            });
            Self {
                app: router(state),
                cache,
                broker,
            }
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            user: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, String) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(user) = user {
                req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
            }
            let body = match body {
                Some(json) => {
                    req = req.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };

            let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            (status, String::from_utf8(bytes.to_vec()).unwrap())
        }

        /// Run every projector until the broker has nothing left for it.
        async fn project(&self) {
            let cache: Arc<dyn Cache> = self.cache.clone();
            for kind in ProjectorKind::ALL {
                let consumer = Consumer::new(
                    Projector::new(kind, cache.clone()),
                    self.broker.clone(),
                    ConsumerConfig {
                        worker_name: "api-test".into(),
                        retry_base: Duration::from_millis(1),
                        block: Duration::from_millis(10),
                        ..ConsumerConfig::default()
                    },
                );
                consumer.prepare().await.unwrap();
                while consumer.run_once().await.unwrap() > 0 {}
            }
        }
    }

    fn token(sub: &str) -> String {
        let claims = Claims {
            sub: sub.into(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn group_code(body: &str) -> String {
        body.rsplit("Code: ").next().unwrap().trim().to_string()
    }

    fn group_id(body: &str) -> String {
        body.split("Group ID: ")
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .unwrap()
            .to_string()
    }

    async fn create_group(h: &Harness, owner: &str, name: &str) -> (String, String) {
        let (status, body) = h
            .call("POST", "/group-events/create", Some(owner), Some(json!({ "name": name })))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        h.project().await;
        (group_id(&body), group_code(&body))
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = Harness::new();
        let (status, body) = h.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn protected_routes_require_a_valid_token() {
        let h = Harness::new();
        let (status, _) = h.call("GET", "/users/get", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/users/get")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let resp = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn user_profile_round_trips_through_the_cache() {
        let h = Harness::new();
        let (status, _) = h
            .call(
                "POST",
                "/user-events/create",
                Some("ana@example.com"),
                Some(json!({ "email": "", "firstName": "Ana" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = h.call("GET", "/users/get", Some("ana@example.com"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.project().await;
        let (status, body) = h.call("GET", "/users/get", Some("ana@example.com"), None).await;
        assert_eq!(status, StatusCode::OK);
        let user: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(user["email"], "ana@example.com");
        assert_eq!(user["firstName"], "Ana");
    }

    #[tokio::test]
    async fn group_create_publishes_group_channel_and_memberships() {
        let h = Harness::new();
        let (status, body) = h
            .call(
                "POST",
                "/group-events/create",
                Some("owner@example.com"),
                Some(json!({ "name": "Hikers" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.starts_with("Group creation request accepted. Group ID: "));
        assert_eq!(group_code(&body).len(), 6);

        for topic in [
            Topic::GroupCreated,
            Topic::ChannelCreated,
            Topic::UserGroupCreate,
            Topic::UserChannelEvents,
        ] {
            assert_eq!(h.broker.published(topic).len(), 1, "{topic}");
        }

        h.project().await;
        let id = group_id(&body);
        let (status, body) = h
            .call("GET", &format!("/channel-events/group/{id}/default"), Some("owner@example.com"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let channel: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(channel["name"], "general");
        assert_eq!(channel["isDefault"], true);

        let (_, body) = h
            .call("GET", &format!("/group-events/{id}/users"), Some("owner@example.com"), None)
            .await;
        assert_eq!(body, r#"["owner@example.com"]"#);
    }

    #[tokio::test]
    async fn group_create_rejects_blank_name() {
        let h = Harness::new();
        let (status, _) = h
            .call("POST", "/group-events/create", Some("a@example.com"), Some(json!({ "name": "  " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.broker.published(Topic::GroupCreated).is_empty());
    }

    #[tokio::test]
    async fn join_by_code_checks_existence_and_membership() {
        let h = Harness::new();
        let (status, body) = h
            .call(
                "POST",
                "/group-events/join",
                Some("b@example.com"),
                Some(json!({ "groupCode": "ZZZZZZ" })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Group not found with code: ZZZZZZ");

        let (id, code) = create_group(&h, "owner@example.com", "Readers").await;

        let (status, body) = h
            .call(
                "POST",
                "/group-events/join",
                Some("owner@example.com"),
                Some(json!({ "groupCode": code })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, "User is already a member of this group");

        let (status, body) = h
            .call(
                "POST",
                "/group-events/join",
                Some("b@example.com"),
                Some(json!({ "groupCode": code })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, format!("Group join request accepted. User: b@example.com, Group: {id}"));

        h.project().await;
        let (status, body) = h
            .call(
                "GET",
                &format!("/group-events/relationship/b@example.com/{id}"),
                Some("b@example.com"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let relation: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(relation["relationship"], "JOIN");
    }

    #[tokio::test]
    async fn missing_relationship_is_not_found() {
        let h = Harness::new();
        let (status, body) = h
            .call("GET", "/group-events/relationship/x@example.com/g1", Some("x@example.com"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "User-group relationship not found");
    }

    #[tokio::test]
    async fn channel_create_needs_a_cached_group() {
        let h = Harness::new();
        let (status, _) = h
            .call(
                "POST",
                "/channel-events/create",
                Some("a@example.com"),
                Some(json!({ "groupId": "nope", "name": "random" })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (id, _) = create_group(&h, "a@example.com", "Team").await;
        let (status, _) = h
            .call(
                "POST",
                "/channel-events/create",
                Some("a@example.com"),
                Some(json!({ "groupId": id, "name": "random" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        h.project().await;
        let (_, body) = h
            .call("GET", &format!("/channel-events/group/{id}"), Some("a@example.com"), None)
            .await;
        let channels: Vec<Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(channels.len(), 2);
    }

    #[tokio::test]
    async fn groups_keep_exactly_one_default_channel() {
        let h = Harness::new();
        let owner = Some("a@example.com");
        let (id, _) = create_group(&h, "a@example.com", "Team").await;

        let (status, _) = h
            .call(
                "POST",
                "/channel-events/create",
                owner,
                Some(json!({ "groupId": id, "name": "general" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = h
            .call("GET", &format!("/channel-events/group/{id}/default"), owner, None)
            .await;
        let general: Value = serde_json::from_str(&body).unwrap();
        let general_id = general["channelId"].as_str().unwrap().to_string();

        let (status, _) = h
            .call(
                "PUT",
                &format!("/channel-events/update/{general_id}"),
                owner,
                Some(json!({ "name": "chat" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = h
            .call(
                "POST",
                "/channel-events/create",
                owner,
                Some(json!({ "groupId": id, "name": "random" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        h.project().await;

        let (_, body) = h
            .call("GET", &format!("/channel-events/group/{id}"), owner, None)
            .await;
        let channels: Vec<Value> = serde_json::from_str(&body).unwrap();
        let random_id = channels
            .iter()
            .find(|c| c["name"] == "random")
            .and_then(|c| c["channelId"].as_str())
            .unwrap()
            .to_string();

        let (status, _) = h
            .call(
                "PUT",
                &format!("/channel-events/update/{random_id}"),
                owner,
                Some(json!({ "name": "general" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(h.broker.published(Topic::ChannelUpdated).len(), 0);

        h.project().await;
        let (_, body) = h
            .call("GET", &format!("/channel-events/group/{id}"), owner, None)
            .await;
        let channels: Vec<Value> = serde_json::from_str(&body).unwrap();
        let defaults = channels.iter().filter(|c| c["isDefault"] == true).count();
        assert_eq!(defaults, 1);
        assert_eq!(channels.len(), 2);
    }

    #[tokio::test]
    async fn like_requires_cached_post_and_sends_absolute_count() {
        let h = Harness::new();
        let (status, _) = h
            .call("POST", "/post-events/like/p1?groupId=g1", Some("a@example.com"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = h
            .call(
                "POST",
                "/post-events/create",
                Some("a@example.com"),
                Some(json!({
                    "groupId": "g1",
                    "author": { "email": "" },
                    "content": "hello",
                    "likes": 2
                })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let post_id = body.rsplit("Post ID: ").next().unwrap().to_string();
        h.project().await;

        let (status, _) = h
            .call(
                "POST",
                &format!("/post-events/like/{post_id}?groupId=g1"),
                Some("a@example.com"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        h.project().await;

        let (_, body) = h
            .call("GET", &format!("/post/g1/{post_id}"), Some("a@example.com"), None)
            .await;
        let post: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(post["likes"], 3);
        assert_eq!(post["author"]["email"], "a@example.com");
    }

    #[tokio::test]
    async fn comment_routes_validate_their_target() {
        let h = Harness::new();
        let author = json!({ "email": "c@example.com" });

        let (status, _) = h
            .call(
                "POST",
                "/comment-events/create/comment",
                Some("c@example.com"),
                Some(json!({ "parentId": "c1", "author": author, "content": "hi" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .call(
                "POST",
                "/comment-events/create/reply",
                Some("c@example.com"),
                Some(json!({ "postId": "p1", "author": author, "content": "hi" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .call(
                "DELETE",
                "/comment-events/delete/c1?postId=p1&parentId=c0",
                Some("c@example.com"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .call(
                "POST",
                "/comment-events/create/comment",
                Some("c@example.com"),
                Some(json!({ "postId": "p1", "author": author, "content": "first" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(h.broker.published(Topic::CommentCreated).len(), 1);

        h.project().await;
        let (_, body) = h
            .call("GET", "/comment/post/p1", Some("c@example.com"), None)
            .await;
        let comments: Vec<Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0]["content"], "first");
    }

    #[tokio::test]
    async fn broker_outage_is_a_server_error() {
        let h = Harness::new();
        h.broker.set_unavailable(true);
        let (status, body) = h
            .call(
                "POST",
                "/user-events/create",
                Some("a@example.com"),
                Some(json!({ "email": "a@example.com" })),
            )
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Failed to publish event"));
    }
}
