use std::sync::Arc;

use anyhow::Result;
use tokio::io::{stdin, stdout};

use crate::host::{HostMessage, StdioHost};
use crate::workspace::{HostWindow, Workspace};
use crate::Config;

/// Run the workspace against a host speaking on stdin/stdout until the
/// host closes the stream.
pub async fn serve() -> Result<()> {
    let config = Config::from_args_and_env()?;

    // stdout carries the RPC stream, so logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .target(env_logger::Target::Stderr)
        .init();
    log::info!("User settings file: {}", config.user_config_file().display());

    let (host, mut messages) = StdioHost::new(stdin(), stdout());
    let workspace = Arc::new(Workspace::new(host.clone(), config));

    if let Err(e) = workspace
        .initialize(Arc::new(HostWindow::new(host.clone())))
        .await
    {
        log::error!("Failed to initialize workspace: {:#}", e);
    }

    while let Some(message) = messages.recv().await {
        match message {
            HostMessage::Notification { method, params } => {
                if let Err(e) = workspace.handle_notification(&method, params).await {
                    log::warn!("Failed to handle '{}': {:#}", method, e);
                }
            }
            HostMessage::Request { id, method, params } => {
                let workspace = workspace.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    let result = workspace
                        .handle_request(&method, params)
                        .await
                        .map_err(|e| format!("{:#}", e));
                    if let Err(e) = host.respond(id, result).await {
                        log::warn!("Failed to answer '{}': {}", method, e);
                    }
                });
            }
        }
    }

    workspace.dispose().await;
    Ok(())
}
