//! What a session serves: the [`McpHandler`] trait and [`ToolRouter`], a
//! handler assembled from individual tools, resources and prompts.

use std::{collections::HashMap, future::Future, sync::Arc};

use {
    async_trait::async_trait,
    serde_json::Value,
    switchboard_protocol::{
        JsonRpcError,
        types::{
            CallToolResult, Content, GetPromptResult, Implementation, InitializeParams,
            ListChangedCapability, Prompt, PromptMessage, ReadResourceResult, Resource,
            ResourceContents, ResourcesCapability, ServerCapabilities, Tool,
        },
    },
};

use crate::{
    context::ExecutionContext,
    error::{Error, Result},
};

/// Server-side MCP behavior shared by every session.
#[async_trait]
pub trait McpHandler: Send + Sync {
    fn server_info(&self) -> Implementation;

    fn capabilities(&self) -> ServerCapabilities;

    fn instructions(&self) -> Option<String> {
        None
    }

    /// Called before the session is marked initialized. An error rejects
    /// the handshake.
    async fn on_initialize(&self, _params: &InitializeParams) -> Result<()> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: ExecutionContext,
    ) -> Result<CallToolResult>;

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        Err(JsonRpcError::invalid_params(format!("unknown resource: {uri}")).into())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        Ok(Vec::new())
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        Err(JsonRpcError::invalid_params(format!("unknown prompt: {name}")).into())
    }
}

/// A single callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> Tool;
    async fn call(&self, arguments: Value, ctx: ExecutionContext) -> Result<CallToolResult>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnTool<F> {
    definition: Tool,
    f: F,
}

impl<F> FnTool<F> {
    pub fn new(definition: Tool, f: F) -> Self {
        Self { definition, f }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallToolResult>> + Send,
{
    fn definition(&self) -> Tool {
        self.definition.clone()
    }

    async fn call(&self, arguments: Value, ctx: ExecutionContext) -> Result<CallToolResult> {
        (self.f)(arguments, ctx).await
    }
}

struct StaticPrompt {
    prompt: Prompt,
    messages: Vec<PromptMessage>,
}

/// Handler built from registered tools plus static resources and prompts.
pub struct ToolRouter {
    info: Implementation,
    instructions: Option<String>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    resources: Vec<(Resource, String)>,
    prompts: HashMap<String, StaticPrompt>,
}

impl ToolRouter {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            instructions: None,
            tools: HashMap::new(),
            resources: Vec::new(),
            prompts: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.definition().name, tool);
    }

    #[must_use]
    pub fn tool<F, Fut>(mut self, definition: Tool, f: F) -> Self
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        self.register(Arc::new(FnTool::new(definition, f)));
        self
    }

    #[must_use]
    pub fn text_resource(mut self, resource: Resource, text: impl Into<String>) -> Self {
        self.resources.push((resource, text.into()));
        self
    }

    /// A prompt whose text contents substitute `{{argument}}` placeholders.
    #[must_use]
    pub fn prompt(mut self, prompt: Prompt, messages: Vec<PromptMessage>) -> Self {
        self.prompts
            .insert(prompt.name.clone(), StaticPrompt { prompt, messages });
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl McpHandler for ToolRouter {
    fn server_info(&self) -> Implementation {
        self.info.clone()
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            resources: (!self.resources.is_empty()).then(ResourcesCapability::default),
            prompts: (!self.prompts.is_empty()).then(ListChangedCapability::default),
            logging: Some(serde_json::json!({})),
            experimental: None,
        }
    }

    fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: ExecutionContext,
    ) -> Result<CallToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        tool.call(arguments, ctx).await
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.iter().map(|(r, _)| r.clone()).collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let (resource, text) = self
            .resources
            .iter()
            .find(|(r, _)| r.uri == uri)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown resource: {uri}")))?;
        let mut contents = ResourceContents::text(uri, text.clone());
        contents.mime_type = resource.mime_type.clone();
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let mut prompts: Vec<_> = self.prompts.values().map(|p| p.prompt.clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(prompts)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let entry = self
            .prompts
            .get(name)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown prompt: {name}")))?;
        for arg in entry.prompt.arguments.iter().filter(|a| a.required) {
            if !arguments.contains_key(&arg.name) {
                return Err(JsonRpcError::invalid_params(format!(
                    "missing required argument '{}' for prompt {name}",
                    arg.name
                ))
                .into());
            }
        }
        let messages = entry
            .messages
            .iter()
            .map(|message| {
                let mut message = message.clone();
                if let Some(text) = message.content.as_text() {
                    let filled = arguments.iter().fold(text.to_string(), |acc, (k, v)| {
                        acc.replace(&format!("{{{{{k}}}}}"), v)
                    });
                    message.content = Content::text(filled);
                }
                message
            })
            .collect();
        Ok(GetPromptResult {
            description: entry.prompt.description.clone(),
            messages,
        })
    }
}
