use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dlq_common::eventbus::DeadLetterQueueMessage;

/// A stored dead letter. Created once, removed when republished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub message: DeadLetterQueueMessage,
}

impl DlqRecord {
    pub fn new(message: DeadLetterQueueMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Created,
    NotFoundError,
    BadRequestError,
    InternalServerError,
}

impl Status {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Status::Ok => StatusCode::OK,
            Status::Created => StatusCode::CREATED,
            Status::NotFoundError => StatusCode::NOT_FOUND,
            Status::BadRequestError => StatusCode::BAD_REQUEST,
            Status::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub page: i64,
    pub total_page: i64,
    pub total_data_on_page: i64,
    pub total_data: i64,
}

/// JSON envelope of every HTTP response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T> {
    pub status: Status,
    pub data: Option<T>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: Status::Ok,
            data: Some(data),
            error: String::new(),
            meta: None,
        }
    }

    pub fn error(status: Status, error: String) -> Self {
        Self {
            status,
            data: None,
            error,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl<T: Serialize> IntoResponse for Response<T> {
    fn into_response(self) -> axum::response::Response {
        (self.status.status_code(), Json(self)).into_response()
    }
}
