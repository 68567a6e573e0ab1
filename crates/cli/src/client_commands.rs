use std::time::Duration;

use {
    anyhow::{Context, Result},
    serde_json::Value,
    switchboard_config::ClientConfig,
    switchboard_mcp::{CallToolOptions, Connector, McpClient},
};

pub struct CallOptions {
    pub timeout_ms: Option<u64>,
    pub progress: bool,
}

pub fn list_servers(config: &ClientConfig) {
    let client = McpClient::new(config.clone());
    let names = client.server_names();
    if names.is_empty() {
        eprintln!("No MCP servers configured.");
        return;
    }
    for name in names {
        let server = &config.mcp_servers[&name];
        let target = match (&server.url, &server.command) {
            (Some(url), _) => url.clone(),
            (None, Some(command)) if server.args.is_empty() => command.clone(),
            (None, Some(command)) => format!("{command} {}", server.args.join(" ")),
            (None, None) => String::new(),
        };
        let state = if server.enabled { "" } else { " (disabled)" };
        println!("{name}\t{}\t{target}{state}", server.transport_kind());
    }
}

/// Connect and initialize one server, run `f`, and always disconnect.
async fn with_session<T, F, Fut>(config: ClientConfig, server: &str, f: F) -> Result<T>
where
    F: FnOnce(Connector) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let client = McpClient::new(config);
    let connector = client
        .create_session(server, true)
        .await
        .with_context(|| format!("failed to connect to MCP server '{server}'"))?;
    let result = f(connector).await;
    client.close_all_sessions().await;
    result
}

pub async fn list_tools(config: ClientConfig, server: &str) -> Result<()> {
    with_session(config, server, |connector| async move {
        for tool in connector.tools().await? {
            println!("{}\t{}", tool.name, tool.description.unwrap_or_default());
        }
        Ok(())
    })
    .await
}

pub async fn call_tool(
    config: ClientConfig,
    server: &str,
    tool: &str,
    args: &str,
    options: CallOptions,
) -> Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be a JSON object")?;
    if !arguments.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }

    let mut request = CallToolOptions::default();
    if let Some(ms) = options.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if options.progress {
        request = request.reset_on_progress().on_progress(|p| {
            let total = p.total.map(|t| format!("/{t}")).unwrap_or_default();
            let message = p.message.as_deref().unwrap_or_default();
            eprintln!("progress {}{total} {message}", p.progress);
        });
    }

    with_session(config, server, |connector| async move {
        let result = connector.call_tool(tool, arguments, request).await?;
        if let Some(structured) = &result.structured_content {
            println!("{}", serde_json::to_string_pretty(structured)?);
        } else {
            println!("{}", result.text());
        }
        if result.is_error {
            anyhow::bail!("tool '{tool}' reported an error");
        }
        Ok(())
    })
    .await
}

pub async fn list_resources(config: ClientConfig, server: &str) -> Result<()> {
    with_session(config, server, |connector| async move {
        for resource in connector.resources().await? {
            println!("{}\t{}", resource.uri, resource.name);
        }
        Ok(())
    })
    .await
}

pub async fn read_resource(config: ClientConfig, server: &str, uri: &str) -> Result<()> {
    with_session(config, server, |connector| async move {
        let result = connector.read_resource(uri).await?;
        println!("{}", serde_json::to_string_pretty(&result.contents)?);
        Ok(())
    })
    .await
}

pub async fn list_prompts(config: ClientConfig, server: &str) -> Result<()> {
    with_session(config, server, |connector| async move {
        for prompt in connector.prompts().await? {
            let args: Vec<_> = prompt.arguments.iter().map(|a| a.name.as_str()).collect();
            println!(
                "{}({})\t{}",
                prompt.name,
                args.join(", "),
                prompt.description.unwrap_or_default()
            );
        }
        Ok(())
    })
    .await
}
