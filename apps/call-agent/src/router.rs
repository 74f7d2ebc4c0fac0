use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use video_call_cell::handlers::CallAgentState;
use video_call_cell::router::video_call_routes;

pub fn create_router(state: Arc<CallAgentState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Call agent is running!" }))
        .nest("/video", video_call_routes(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use shared_utils::test_utils::TestConfig;
    use tower::ServiceExt;
    use video_call_cell::services::{CallRegistry, ConfiguredDependencies};

    #[tokio::test]
    async fn test_root_and_nested_health() {
        let config = TestConfig::default().to_arc();
        let provider = Arc::new(ConfiguredDependencies::from_config(config.clone()));
        let state = Arc::new(CallAgentState::new(config, CallRegistry::new(), provider));
        let app = create_router(state);

        let root = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(root.status(), StatusCode::OK);

        let health = app
            .oneshot(Request::builder().uri("/video/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
