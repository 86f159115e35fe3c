use std::sync::Arc;
use std::time::Duration;

use media_cache::QueryService;
use media_relay::Publisher;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub publisher: Publisher,
    pub queries: QueryService,
    pub jwt_secret: String,
    /// Upper bound for multi-event publishes such as group creation.
    pub publish_timeout: Duration,
}
