use std::sync::Arc;

use axum::{routing, Router};

use crate::usecase::DlqUsecase;

use super::messages;

pub fn add_routes(router: Router, usecase: Arc<DlqUsecase>) -> Router {
    let messages = Router::new()
        .route("/messages", routing::get(messages::get_many))
        .route("/messages/:id/republish", routing::post(messages::republish))
        .with_state(usecase);

    router.route("/", routing::get(index)).merge(messages)
}

pub async fn index() -> &'static str {
    "dlq service"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use dlq_common::test_utils::RecordingPublisher;

    use crate::store::MemoryMessageStore;

    #[tokio::test]
    async fn index() {
        let usecase = Arc::new(DlqUsecase::new(
            Arc::new(MemoryMessageStore::default()),
            Arc::new(RecordingPublisher::default()),
        ));
        let app = add_routes(Router::new(), usecase);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"dlq service");
    }
}
