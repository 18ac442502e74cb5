use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router,
};
use serde::Deserialize;
use std::borrow::Cow;

/// The resource the authorization server protects. In HTTP mode every call
/// has already passed the bearer middleware; stdio mode has no auth at all.
#[derive(Clone)]
pub struct GreetingServer {
    authenticated: bool,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SayHelloRequest {
    #[schemars(description = "Name of the person to greet")]
    pub name: String,
}

fn mcp_error(code: ErrorCode, msg: impl Into<String>) -> McpError {
    McpError {
        code,
        message: Cow::Owned(msg.into()),
        data: None,
    }
}

fn greeting(name: &str, authenticated: bool) -> String {
    if authenticated {
        format!("Hello, {}! Welcome to your authenticated MCP server.", name)
    } else {
        format!("Hello, {}! (stdio mode - no auth)", name)
    }
}

#[tool_router]
impl GreetingServer {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Greet someone by name")]
    async fn say_hello(
        &self,
        Parameters(req): Parameters<SayHelloRequest>,
    ) -> Result<CallToolResult, McpError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(mcp_error(ErrorCode::INVALID_PARAMS, "name cannot be empty"));
        }

        tracing::info!("say_hello called with name={}", name);
        Ok(CallToolResult::success(vec![Content::text(greeting(
            name,
            self.authenticated,
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for GreetingServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Greeting server behind OAuth 2.1. Use say_hello to get a greeting.".to_string(),
            ),
        }
    }
}
