//! Demo tools served by `switchboard serve`.

use std::{sync::Arc, time::Duration};

use {
    anyhow::Result,
    serde_json::{Value, json},
    switchboard_config::ServerConfig,
    switchboard_protocol::types::{
        CallToolResult, Content, ElicitAction, ElicitRequestParams, Prompt, PromptArgument,
        PromptMessage, Resource, Role, Tool,
    },
    switchboard_server::{
        ElicitOptions, ExecutionContext, SampleOptions, SessionSettings, ToolRouter, serve_stdio,
    },
    tracing::info,
};

const ASK_TIMEOUT: Duration = Duration::from_secs(120);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);

pub fn router() -> ToolRouter {
    ToolRouter::new("switchboard", env!("CARGO_PKG_VERSION"))
        .with_instructions("Demo server: echo, countdown, ask and confirm.")
        .tool(
            Tool::new(
                "echo",
                "Return the given text unchanged",
                json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            ),
            |args, _ctx| async move {
                let text = args["text"].as_str().unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            },
        )
        .tool(
            Tool::new(
                "countdown",
                "Count down, reporting progress each second",
                json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "integer", "minimum": 1, "maximum": 60},
                        "interval_ms": {"type": "integer", "minimum": 0}
                    }
                }),
            ),
            countdown,
        )
        .tool(
            Tool::new(
                "ask",
                "Ask the client's model a question",
                json!({
                    "type": "object",
                    "properties": {"question": {"type": "string"}},
                    "required": ["question"]
                }),
            ),
            ask,
        )
        .tool(
            Tool::new(
                "confirm",
                "Ask the user to confirm an action",
                json!({
                    "type": "object",
                    "properties": {"action": {"type": "string"}},
                    "required": ["action"]
                }),
            ),
            confirm,
        )
        .text_resource(
            Resource {
                description: Some("What this server offers".into()),
                mime_type: Some("text/plain".into()),
                ..Resource::new("switchboard://about", "about")
            },
            "switchboard demo server. Tools: echo, countdown, ask, confirm.",
        )
        .prompt(
            Prompt {
                name: "summarize".into(),
                title: None,
                description: Some("Summarize a topic in three sentences".into()),
                arguments: vec![PromptArgument {
                    name: "topic".into(),
                    description: None,
                    required: true,
                }],
            },
            vec![PromptMessage {
                role: Role::User,
                content: Content::text("Summarize {{topic}} in three sentences."),
            }],
        )
}

async fn countdown(args: Value, ctx: ExecutionContext) -> switchboard_server::Result<CallToolResult> {
    let from = args["from"].as_u64().unwrap_or(5).clamp(1, 60);
    let interval = Duration::from_millis(args["interval_ms"].as_u64().unwrap_or(1000));

    ctx.log("info", format!("counting down from {from}"), Some("countdown"));
    for remaining in (0..from).rev() {
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                ctx.log("warning", "countdown cancelled", Some("countdown"));
                return Ok(CallToolResult::error("cancelled"));
            },
            () = tokio::time::sleep(interval) => {},
        }
        let done = from - remaining;
        ctx.report_progress(done as f64, Some(from as f64), Some(format!("{remaining} left")));
        ctx.log("debug", format!("{remaining} left"), Some("countdown"));
    }
    Ok(CallToolResult::success(vec![Content::text("liftoff")]))
}

async fn ask(args: Value, ctx: ExecutionContext) -> switchboard_server::Result<CallToolResult> {
    let Some(question) = args["question"].as_str() else {
        return Ok(CallToolResult::error("missing 'question'"));
    };
    let options = SampleOptions {
        timeout: Some(ASK_TIMEOUT),
        ..SampleOptions::default()
    };
    let reply = ctx.sample(question, options).await?;
    ctx.log("info", format!("answered by {}", reply.model), Some("ask"));
    Ok(CallToolResult::success(vec![reply.content]))
}

async fn confirm(args: Value, ctx: ExecutionContext) -> switchboard_server::Result<CallToolResult> {
    let action = args["action"].as_str().unwrap_or("continue");
    let params = ElicitRequestParams::form(
        format!("Confirm: {action}?"),
        json!({
            "type": "object",
            "properties": {"confirmed": {"type": "boolean"}},
            "required": ["confirmed"]
        }),
    );
    let options = ElicitOptions {
        timeout: Some(CONFIRM_TIMEOUT),
    };
    let result = ctx.elicit(params, options).await?;
    let text = match result.action {
        ElicitAction::Accept => {
            let confirmed = result
                .content
                .as_ref()
                .and_then(|c| c["confirmed"].as_bool())
                .unwrap_or(false);
            if confirmed { "confirmed" } else { "not confirmed" }
        },
        ElicitAction::Decline => "declined",
        ElicitAction::Cancel => "cancelled",
    };
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

pub async fn serve(config: ServerConfig, stdio: bool) -> Result<()> {
    let handler = Arc::new(router());
    if stdio {
        let settings = SessionSettings {
            min_log_level: config.min_log_level.clone(),
            sampling_heartbeat: config.sampling_heartbeat(),
        };
        info!("serving MCP over stdio");
        serve_stdio(handler, settings).await?;
    } else {
        switchboard_server::serve(&config, handler).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        switchboard_protocol::RequestId,
        switchboard_server::{McpHandler, RequestContext},
    };

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            RequestContext {
                session_id: "test".into(),
                request_id: RequestId::Number(1),
                progress_token: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn lists_demo_tools() {
        let tools = router().list_tools().await.unwrap();
        let names: Vec<_> = tools.into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["ask", "confirm", "countdown", "echo"]);
    }

    #[tokio::test]
    async fn countdown_finishes_without_a_client_channel() {
        let result = countdown(json!({"from": 2, "interval_ms": 0}), ctx())
            .await
            .unwrap();
        assert_eq!(result.text(), "liftoff");
    }

    #[tokio::test]
    async fn countdown_stops_when_cancelled() {
        let ctx = ctx();
        ctx.cancellation().cancel();
        let result = countdown(json!({"from": 3, "interval_ms": 10_000}), ctx)
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn ask_needs_a_client_channel() {
        let err = ask(json!({"question": "hi"}), ctx()).await.unwrap_err();
        assert!(matches!(err, switchboard_server::Error::NoClientChannel));
    }
}
