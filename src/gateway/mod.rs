// SPDX-License-Identifier: MIT
//! Gateway façade — the northbound JSON-RPC method surface.
//!
//! Dispatches `initialize`, `tools/list`, `tools/call`, `prompts/list` and
//! `prompts/get` against the router, the agent ACL and the skill service.
//! Responses preserve the request id verbatim. Transport failures become
//! JSON-RPC errors; tool-reported errors and ACL denials stay inside the
//! tool result so clients surface them naturally.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acl::AclRegistry;
use crate::jsonrpc::{self, Request, Response};
use crate::mcp::{
    ClientInfo, InitializeParams, InitializeResult, PromptsListResult, ServerInfo, ToolCallParams,
    ToolCallResult, ToolsListResult,
};
use crate::router::{split_tool_name, RouteError, Router};
use crate::skills::service::SkillService;

pub struct Gateway {
    router: Arc<Router>,
    acl: Arc<AclRegistry>,
    skills: Arc<SkillService>,
}

impl Gateway {
    pub fn new(router: Arc<Router>, acl: Arc<AclRegistry>, skills: Arc<SkillService>) -> Self {
        Self {
            router,
            acl,
            skills,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn acl(&self) -> &Arc<AclRegistry> {
        &self.acl
    }

    pub fn skills(&self) -> &Arc<SkillService> {
        &self.skills
    }

    /// Dispatch one JSON-RPC request for `agent`. Notifications return
    /// `None`; everything else returns a response carrying the request id
    /// exactly as it arrived.
    pub async fn dispatch(
        &self,
        req: Request,
        agent: &str,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        if req.jsonrpc != "2.0" {
            return Some(Response::error(
                req.id.unwrap_or(Value::Null),
                jsonrpc::INVALID_REQUEST,
                "Invalid Request",
            ));
        }

        if req.is_notification() {
            debug!(method = %req.method, "notification");
            return None;
        }

        let id = req.id.clone().unwrap_or(Value::Null);
        let params = req.params.unwrap_or(Value::Null);
        debug!(method = %req.method, agent = %agent, "rpc dispatch");

        let resp = match req.method.as_str() {
            "initialize" => self.handle_initialize(id, params),
            "ping" => Response::ok(id, json!({})),
            "tools/list" => self.handle_tools_list(id, agent).await,
            "tools/call" => self.handle_tools_call(id, params, agent, cancel).await,
            "prompts/list" => self.handle_prompts_list(id),
            "prompts/get" => self.handle_prompts_get(id, params),
            other => {
                warn!(method = %other, "method not found");
                Response::error(id, jsonrpc::METHOD_NOT_FOUND, "Method not found")
            }
        };
        Some(resp)
    }

    fn handle_initialize(&self, id: Value, params: Value) -> Response {
        let client: Option<ClientInfo> = serde_json::from_value::<InitializeParams>(params)
            .ok()
            .and_then(|p| p.client_info);
        if let Some(client) = client {
            debug!(client = %client.name, version = %client.version, "client initialized");
        }

        let result = InitializeResult {
            protocol_version: crate::mcp::PROTOCOL_VERSION.into(),
            capabilities: json!({
                "tools": {"listChanged": false},
                "prompts": {},
            }),
            server_info: ServerInfo {
                name: "meshd".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        Response::ok(id, serde_json::to_value(result).unwrap_or(Value::Null))
    }

    async fn handle_tools_list(&self, id: Value, agent: &str) -> Response {
        let tools = self.router.all_tools().await;
        let tools = self.acl.filter_tools(agent, tools).await;
        let result = ToolsListResult { tools };
        Response::ok(id, serde_json::to_value(result).unwrap_or(Value::Null))
    }

    async fn handle_tools_call(
        &self,
        id: Value,
        params: Value,
        agent: &str,
        cancel: &CancellationToken,
    ) -> Response {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return Response::error(
                    id,
                    jsonrpc::INVALID_PARAMS,
                    format!("Invalid params: {e}"),
                )
            }
        };

        let Some((server, tool)) = split_tool_name(&params.name) else {
            return Response::error(
                id,
                jsonrpc::INVALID_PARAMS,
                format!("invalid tool name: {}", params.name),
            );
        };

        // A denial is a tool result, never a protocol error.
        if !self.acl.allows(agent, server, tool).await {
            warn!(agent = %agent, tool = %params.name, "access denied");
            let denied = ToolCallResult::error(format!(
                "Access denied: agent '{agent}' is not allowed to call '{}'",
                params.name
            ));
            return Response::ok(id, serde_json::to_value(denied).unwrap_or(Value::Null));
        }

        match self
            .router
            .call_tool(cancel, &params.name, params.arguments)
            .await
        {
            Ok(result) => Response::ok(id, serde_json::to_value(result).unwrap_or(Value::Null)),
            Err(RouteError::ToolNotFound(name)) => Response::error(
                id,
                jsonrpc::INVALID_PARAMS,
                format!("unknown tool: {name}"),
            ),
            Err(RouteError::Transport(e)) => {
                warn!(tool = %params.name, err = %e, "tool call failed");
                Response::error(id, jsonrpc::INTERNAL_ERROR, e.to_string())
            }
        }
    }

    fn handle_prompts_list(&self, id: Value) -> Response {
        let result = PromptsListResult {
            prompts: self.skills.prompts(),
        };
        Response::ok(id, serde_json::to_value(result).unwrap_or(Value::Null))
    }

    fn handle_prompts_get(&self, id: Value, params: Value) -> Response {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name.is_empty() {
            return Response::error(id, jsonrpc::INVALID_PARAMS, "missing prompt name");
        }
        match self.skills.get_prompt(name) {
            Ok(prompt) => Response::ok(id, serde_json::to_value(prompt).unwrap_or(Value::Null)),
            Err(e) => Response::error(id, jsonrpc::INVALID_PARAMS, e),
        }
    }
}

/// Parse one raw JSON-RPC body and dispatch it. Parse failures yield a
/// parse-error response with a null id.
pub async fn dispatch_text(
    gateway: &Gateway,
    body: &str,
    agent: &str,
    cancel: &CancellationToken,
) -> Option<Response> {
    let req: Request = match serde_json::from_str(body) {
        Ok(req) => req,
        Err(_) => {
            return Some(Response::error(
                Value::Null,
                jsonrpc::PARSE_ERROR,
                "Parse error",
            ))
        }
    };
    gateway.dispatch(req, agent, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::ToolSelector;
    use crate::mcp::{Tool, ToolArguments};
    use crate::skills::store::SkillStore;
    use crate::transport::{AgentClient, ClientState, TransportError};
    use async_trait::async_trait;
    use serde_json::json;

    struct MockClient {
        name: String,
        tools: Vec<Tool>,
    }

    #[async_trait]
    impl AgentClient for MockClient {
        fn name(&self) -> &str {
            &self.name
        }
        async fn initialize(&self, _: &CancellationToken) -> Result<(), TransportError> {
            Ok(())
        }
        async fn tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }
        async fn refresh_tools(&self, _: &CancellationToken) -> Result<(), TransportError> {
            Ok(())
        }
        async fn call_tool(
            &self,
            _: &CancellationToken,
            name: &str,
            _: ToolArguments,
        ) -> Result<ToolCallResult, TransportError> {
            Ok(ToolCallResult::text(format!("called {name}")))
        }
        async fn state(&self) -> ClientState {
            ClientState::Ready
        }
        async fn close(&self) {}
    }

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.into(),
            title: None,
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }
    }

    async fn gateway() -> Gateway {
        let router = Arc::new(Router::new());
        router
            .add_client(Arc::new(MockClient {
                name: "server1".into(),
                tools: vec![tool("allowed"), tool("denied")],
            }))
            .await;
        let acl = Arc::new(AclRegistry::new());
        acl.register_agent(
            "filtered",
            vec![ToolSelector {
                server: "server1".into(),
                tools: vec!["allowed".into()],
            }],
        )
        .await;
        let store = Arc::new(SkillStore::new(std::env::temp_dir().join("meshd-gw-test")));
        let skills = Arc::new(SkillService::new(store, None));
        Gateway::new(router, acl, skills)
    }

    fn request(id: Value, method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".into(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                request(json!(1), "initialize", json!({"clientInfo": {"name": "t"}})),
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "meshd");
        assert_eq!(result["protocolVersion"], crate::mcp::PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                request(json!("req-9"), "bogus/method", Value::Null),
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc::METHOD_NOT_FOUND);
        // The string id came back as a string.
        assert_eq!(resp.id, json!("req-9"));
    }

    #[tokio::test]
    async fn tools_list_is_filtered_by_agent() {
        let gw = gateway().await;

        let all = gw
            .dispatch(
                request(json!(1), "tools/list", Value::Null),
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let tools = all.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 2);

        let filtered = gw
            .dispatch(
                request(json!(2), "tools/list", Value::Null),
                "filtered",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let result = filtered.result.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "server1__allowed");
    }

    #[tokio::test]
    async fn denied_call_is_a_tool_error_not_a_protocol_error() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                request(
                    json!(3),
                    "tools/call",
                    json!({"name": "server1__denied", "arguments": {}}),
                ),
                "filtered",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(resp.error.is_none(), "denial must not be a JSON-RPC error");
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Access denied"), "{text}");
    }

    #[tokio::test]
    async fn allowed_call_routes_through() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                request(
                    json!(4),
                    "tools/call",
                    json!({"name": "server1__allowed", "arguments": {}}),
                ),
                "filtered",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["content"][0]["text"], "called allowed");
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                request(
                    json!(5),
                    "tools/call",
                    json!({"name": "ghost__tool", "arguments": {}}),
                ),
                "",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, jsonrpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let gw = gateway().await;
        let resp = gw
            .dispatch(
                Request::notification("initialized", None),
                "",
                &CancellationToken::new(),
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn parse_error_has_null_id() {
        let gw = gateway().await;
        let resp = dispatch_text(&gw, "{not json", "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, jsonrpc::PARSE_ERROR);
    }
}
