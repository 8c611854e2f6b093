//! Workspace file access: upload, browse, download.
//!
//! All paths are confined to the session's workspace directory; anything
//! that resolves outside it is rejected before touching the filesystem.

use std::path::{Path as FsPath, PathBuf};

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::auth::CurrentUser;

use super::error::{ApiError, ApiResult};
use super::handlers::verify_owner;
use super::state::AppState;

/// Strip leading separators and refuse traversal segments.
fn sanitize_relative(raw: &str) -> ApiResult<String> {
    let cleaned = raw.trim_start_matches(['/', '\\']).to_string();
    if cleaned.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(ApiError::bad_request("invalid path"));
    }
    Ok(cleaned)
}

/// Resolve `raw` inside `workspace`, requiring the result to stay inside.
fn resolve_existing(workspace: &FsPath, raw: &str) -> ApiResult<PathBuf> {
    let cleaned = sanitize_relative(raw)?;
    let target = if cleaned.is_empty() {
        workspace.to_path_buf()
    } else {
        workspace.join(&cleaned)
    };

    let workspace_real = workspace
        .canonicalize()
        .map_err(|_| ApiError::not_found("workspace not found"))?;
    let target_real = target
        .canonicalize()
        .map_err(|_| ApiError::not_found("path not found"))?;

    if !target_real.starts_with(&workspace_real) {
        return Err(ApiError::bad_request("invalid path"));
    }
    Ok(target_real)
}

fn workspace_for(state: &AppState, session_id: &str) -> ApiResult<PathBuf> {
    state
        .registry
        .get(session_id)
        .map(|s| s.workspace)
        .ok_or_else(|| ApiError::not_found("session not found"))
}

/// POST /session/{id}/upload - multipart upload into the workspace.
///
/// An optional `path` field carries a relative target path so folder
/// uploads keep their structure.
#[instrument(skip(state, user, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;
    let workspace = workspace_for(&state, &session_id)?;

    let mut relative_path: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut contents: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        match field.name() {
            Some("path") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                if !text.is_empty() {
                    relative_path = Some(text);
                }
            }
            Some("file") => {
                file_name = field.file_name().map(|n| n.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                contents = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let contents = contents.ok_or_else(|| ApiError::bad_request("missing file field"))?;
    let relative = match relative_path.or(file_name) {
        Some(r) => sanitize_relative(&r)?,
        None => return Err(ApiError::bad_request("missing filename")),
    };
    let filename = FsPath::new(&relative)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::bad_request("invalid filename"))?
        .to_string();

    let target = workspace.join(&relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
    }
    let size = contents.len();
    tokio::fs::write(&target, contents)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    state.registry.touch(&session_id);

    Ok(Json(json!({
        "filename": filename,
        "path": relative,
        "size": size,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    pub path: String,
}

/// GET /session/{id}/browse - list a workspace directory.
#[instrument(skip(state, user))]
pub async fn browse_files(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<BrowseQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;
    let workspace = workspace_for(&state, &session_id)?;

    let target = resolve_existing(&workspace, &query.path)?;
    if !target.is_dir() {
        return Err(ApiError::bad_request("path is not a directory"));
    }

    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(&target)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    while let Ok(Some(entry)) = reader.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "size": meta.len(),
            "is_dir": meta.is_dir(),
            "modified": modified,
        }));
    }

    entries.sort_by(|a, b| {
        let dir_rank = |v: &serde_json::Value| !v["is_dir"].as_bool().unwrap_or(false);
        let name = |v: &serde_json::Value| v["name"].as_str().unwrap_or("").to_lowercase();
        dir_rank(a)
            .cmp(&dir_rank(b))
            .then_with(|| name(a).cmp(&name(b)))
    });

    let cleaned = sanitize_relative(&query.path)?;
    let parent = if cleaned.is_empty() {
        None
    } else {
        Some(
            FsPath::new(&cleaned)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
    };

    Ok(Json(json!({
        "path": cleaned,
        "files": entries,
        "parent": parent,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

/// GET /session/{id}/download - fetch one file from the workspace.
#[instrument(skip(state, user))]
pub async fn download_file(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    verify_owner(&state, &user, &session_id)?;
    let workspace = workspace_for(&state, &session_id)?;

    if query.path.trim_matches('/').is_empty() {
        return Err(ApiError::bad_request("path required"));
    }

    let target = resolve_existing(&workspace, &query.path)?;
    if target.is_dir() {
        return Err(ApiError::bad_request("path is a directory"));
    }

    let bytes = tokio::fs::read(&target)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let filename = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    let response = (
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Body::from(bytes),
    )
        .into_response();

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_relative() {
        assert_eq!(sanitize_relative("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(sanitize_relative("a/b.txt").unwrap(), "a/b.txt");
        assert!(sanitize_relative("../etc/passwd").is_err());
        assert!(sanitize_relative("a/../../etc").is_err());
        assert_eq!(sanitize_relative("").unwrap(), "");
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::TempDir::new().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "x").unwrap();
        std::fs::write(workspace.join("ok.txt"), "y").unwrap();

        assert!(resolve_existing(&workspace, "ok.txt").is_ok());
        assert!(resolve_existing(&workspace, "../secret.txt").is_err());
        assert!(resolve_existing(&workspace, "missing.txt").is_err());
    }
}
