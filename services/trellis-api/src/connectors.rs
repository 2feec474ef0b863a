use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::error::ApiError;
use crate::AppState;
use trellis_connectors::connector::ConnectOutcome;
use trellis_connectors::ConnectorInfo;

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ConnectorInfo>>, ApiError> {
    let infos = state.catalog.get_all().await?;
    Ok(Json(infos))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectorInfo>, ApiError> {
    let info = state.catalog.get_connector_info(&id).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub redirect_to: String,
    pub user_id: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectOutcome>, ApiError> {
    let connector = state.catalog.get_connector(&id).await?;
    let outcome = connector
        .connect(&request.redirect_to, request.user_id.as_deref())
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub redirect_to: String,
}

pub async fn callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = state.catalog.get_connector(&id).await?;
    connector
        .continue_to_connect(&query.code, &query.redirect_to)
        .await?;
    Ok(Json(serde_json::json!({ "connected": true })))
}
