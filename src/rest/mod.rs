// rest/mod.rs — HTTP surface: the axum router wiring the JSON-RPC endpoint,
// the SSE session pair, and the skill-store REST API.
//
// Endpoints:
//   POST /mcp                                  — JSON-RPC 2.0
//   GET  /sse                                  — SSE stream (paired POST below)
//   POST /message?sessionId=…                  — paired message channel
//   GET  /api/status
//   GET|POST /api/skills
//   POST /api/skills/validate
//   GET|PUT|DELETE /api/skills/{name}
//   POST /api/skills/{name}/activate|disable
//   GET  /api/skills/{name}/workflow
//   POST /api/skills/{name}/execute
//   GET  /api/skills/{name}/files
//   GET|PUT|DELETE /api/skills/{name}/files/{path}

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::gateway::dispatch_text;
use crate::mcp::ToolArguments;
use crate::skills::store::{StoreError, MAX_FILE_SIZE};
use crate::skills::{parse_skill_md, Skill, SkillState};
use crate::sse;
use crate::workflow::dag::plan_levels;
use crate::GatewayContext;

pub fn build_router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post))
        .route("/sse", get(sse::sse_handler))
        .route("/message", post(sse::message_handler))
        .route("/api/status", get(status))
        .route("/api/skills", get(list_skills).post(create_skill))
        .route("/api/skills/validate", post(validate_skill))
        .route(
            "/api/skills/:name",
            get(get_skill).put(update_skill).delete(delete_skill),
        )
        .route("/api/skills/:name/activate", post(activate_skill))
        .route("/api/skills/:name/disable", post(disable_skill))
        .route("/api/skills/:name/workflow", get(skill_workflow))
        .route("/api/skills/:name/execute", post(execute_skill))
        .route("/api/skills/:name/files", get(list_skill_files))
        .route(
            "/api/skills/:name/files/*path",
            get(read_skill_file)
                .put(write_skill_file)
                .delete(delete_skill_file),
        )
        .with_state(ctx)
}

// ─── JSON-RPC endpoint ───────────────────────────────────────────────────────

async fn mcp_post(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let agent = sse::agent_identity(&params, &headers);
    match dispatch_text(&ctx.gateway, &body, &agent, &ctx.shutdown).await {
        Some(resp) => Json(resp).into_response(),
        // Notifications get no body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

async fn status(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let mut servers = Vec::new();
    for name in ctx.router.client_names().await {
        if let Some(client) = ctx.router.client(&name).await {
            servers.push(json!({
                "name": name,
                "state": client.state().await.to_string(),
                "tools": client.tools().await.len(),
            }));
        }
    }
    let store = ctx.store.status();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "servers": servers,
        "sessions": ctx.sessions.count().await,
        "skills": {
            "total": store.total_skills,
            "active": store.active_skills,
        },
    }))
}

// ─── Skill CRUD ──────────────────────────────────────────────────────────────

type RestError = (StatusCode, Json<Value>);

fn rest_error(status: StatusCode, message: impl Into<String>) -> RestError {
    (status, Json(json!({"error": message.into()})))
}

fn store_error(e: StoreError) -> RestError {
    match &e {
        StoreError::NotFound(what) => {
            rest_error(StatusCode::NOT_FOUND, format!("not found: {what}"))
        }
        StoreError::InvalidPath(_) => rest_error(StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::TooLarge => rest_error(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        StoreError::Skill(_) => rest_error(StatusCode::BAD_REQUEST, e.to_string()),
        StoreError::Io(_) => {
            warn!(err = %e, "store I/O failure");
            rest_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// REST payloads carry the markdown body alongside the frontmatter fields;
/// on the `Skill` type itself the body is not a frontmatter key.
#[derive(Deserialize)]
struct SkillPayload {
    #[serde(flatten)]
    skill: Skill,
    #[serde(default)]
    body: String,
}

impl SkillPayload {
    fn into_skill(self) -> Skill {
        let mut skill = self.skill;
        skill.body = self.body;
        skill
    }
}

fn skill_to_json(skill: &Skill) -> Value {
    let mut v = serde_json::to_value(skill).unwrap_or_default();
    v["body"] = Value::String(skill.body.clone());
    v
}

async fn list_skills(State(ctx): State<Arc<GatewayContext>>) -> Json<Value> {
    let skills: Vec<Value> = ctx.store.list().iter().map(skill_to_json).collect();
    Json(Value::Array(skills))
}

async fn create_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Json(payload): Json<SkillPayload>,
) -> Result<(StatusCode, Json<Value>), RestError> {
    let skill = payload.into_skill();
    skill
        .validate()
        .map_err(|e| rest_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    if ctx.store.get(&skill.name).is_ok() {
        return Err(rest_error(
            StatusCode::CONFLICT,
            format!("skill already exists: {}", skill.name),
        ));
    }
    ctx.store.save(&skill).map_err(store_error)?;
    ctx.refresh_skill_registration().await;
    Ok((StatusCode::CREATED, Json(skill_to_json(&skill))))
}

async fn get_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RestError> {
    let skill = ctx.store.get(&name).map_err(store_error)?;
    Ok(Json(skill_to_json(&skill)))
}

async fn update_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
    Json(payload): Json<SkillPayload>,
) -> Result<Json<Value>, RestError> {
    let mut skill = payload.into_skill();
    // The URL name wins over whatever the payload says.
    skill.name = name.clone();
    skill
        .validate()
        .map_err(|e| rest_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    ctx.store.get(&name).map_err(store_error)?;
    ctx.store.save(&skill).map_err(store_error)?;
    ctx.refresh_skill_registration().await;
    Ok(Json(skill_to_json(&skill)))
}

async fn delete_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<StatusCode, RestError> {
    ctx.store.delete(&name).map_err(store_error)?;
    ctx.refresh_skill_registration().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RestError> {
    set_skill_state(&ctx, &name, SkillState::Active).await
}

async fn disable_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RestError> {
    set_skill_state(&ctx, &name, SkillState::Disabled).await
}

async fn set_skill_state(
    ctx: &Arc<GatewayContext>,
    name: &str,
    state: SkillState,
) -> Result<Json<Value>, RestError> {
    let mut skill = ctx.store.get(name).map_err(store_error)?;
    skill.state = state;
    ctx.store.save(&skill).map_err(store_error)?;
    ctx.refresh_skill_registration().await;
    Ok(Json(skill_to_json(&skill)))
}

// ─── Workflow view / execution / validation ──────────────────────────────────

async fn skill_workflow(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RestError> {
    let skill = ctx.store.get(&name).map_err(store_error)?;
    if !skill.is_executable() {
        return Err(rest_error(
            StatusCode::BAD_REQUEST,
            "skill has no workflow definition",
        ));
    }

    let dag = match plan_levels(&skill.workflow) {
        Ok(levels) => {
            let named: Vec<Vec<&str>> = levels
                .iter()
                .map(|level| {
                    level
                        .iter()
                        .map(|&i| skill.workflow[i].id.as_str())
                        .collect()
                })
                .collect();
            json!({"levels": named})
        }
        Err(e) => json!({"error": e.to_string()}),
    };

    Ok(Json(json!({
        "name": skill.name,
        "inputs": skill.inputs,
        "workflow": skill.workflow,
        "output": skill.output,
        "dag": dag,
    })))
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    arguments: ToolArguments,
}

async fn execute_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>, RestError> {
    let outcome = ctx
        .skills
        .execute_skill(&ctx.shutdown, &name, req.arguments)
        .await
        .map_err(|e| rest_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({
        "status": outcome.status.to_string(),
        "skipped": outcome.skipped,
        "result": outcome.result,
    })))
}

#[derive(Deserialize)]
struct ValidateRequest {
    content: String,
}

async fn validate_skill(
    State(ctx): State<Arc<GatewayContext>>,
    Json(req): Json<ValidateRequest>,
) -> Json<Value> {
    let skill = match parse_skill_md(&req.content) {
        Ok(skill) => skill,
        Err(e) => {
            return Json(json!({
                "valid": false,
                "errors": [format!("Failed to parse SKILL.md: {e}")],
                "warnings": [],
            }))
        }
    };

    let available: HashSet<String> = ctx
        .router
        .all_tools()
        .await
        .into_iter()
        .map(|t| t.name)
        .collect();
    let report = skill.validate_full(Some(&available));
    Json(json!({
        "valid": report.valid(),
        "errors": report.errors,
        "warnings": report.warnings,
        "parsed": skill_to_json(&skill),
    }))
}

// ─── Side files ──────────────────────────────────────────────────────────────

async fn list_skill_files(
    State(ctx): State<Arc<GatewayContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, RestError> {
    let files = ctx.store.list_files(&name).map_err(store_error)?;
    Ok(Json(serde_json::to_value(files).unwrap_or_default()))
}

async fn read_skill_file(
    State(ctx): State<Arc<GatewayContext>>,
    Path((name, path)): Path<(String, String)>,
) -> Result<axum::response::Response, RestError> {
    let data = ctx.store.read_file(&name, &path).map_err(store_error)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, content_type_for(&path))],
        data,
    )
        .into_response())
}

async fn write_skill_file(
    State(ctx): State<Arc<GatewayContext>>,
    Path((name, path)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, RestError> {
    if body.len() > MAX_FILE_SIZE {
        return Err(rest_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("file exceeds {MAX_FILE_SIZE} byte limit"),
        ));
    }
    ctx.store
        .write_file(&name, &path, &body)
        .map_err(store_error)?;
    if path == crate::skills::store::SKILL_FILE {
        ctx.refresh_skill_registration().await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_skill_file(
    State(ctx): State<Arc<GatewayContext>>,
    Path((name, path)): Path<(String, String)>,
) -> Result<StatusCode, RestError> {
    ctx.store.delete_file(&name, &path).map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("md") => "text/markdown",
        Some("sh") => "text/x-shellscript",
        Some("py") => "text/x-python",
        Some("json") => "application/json",
        Some("yaml") | Some("yml") => "text/yaml",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}
