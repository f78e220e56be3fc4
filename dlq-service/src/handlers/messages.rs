use std::sync::Arc;

use axum::extract::{Path, Query, State};
use serde::Deserialize;
use tracing::error;

use crate::error::UsecaseError;
use crate::model::{DlqRecord, Response};
use crate::usecase::DlqUsecase;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_size")]
    size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_size() -> i64 {
    10
}

pub async fn get_many(
    State(usecase): State<Arc<DlqUsecase>>,
    Query(params): Query<PageParams>,
) -> Response<Vec<DlqRecord>> {
    match usecase.get_many(params.page, params.size).await {
        Ok(page) => Response::ok(page.records).with_meta(page.meta),
        Err(err) => failure(err),
    }
}

pub async fn republish(
    State(usecase): State<Arc<DlqUsecase>>,
    Path(id): Path<String>,
) -> Response<DlqRecord> {
    match usecase.republish(&id).await {
        Ok(record) => Response::ok(record),
        Err(err) => failure(err),
    }
}

fn failure<T>(err: UsecaseError) -> Response<T> {
    let status = err.status();
    if matches!(err, UsecaseError::Store(_) | UsecaseError::Publish(_)) {
        error!("internal error: {}", err);
    }
    Response::error(status, err.to_string())
}
