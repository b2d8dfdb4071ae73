//! ant-server：JSON-RPC 2.0 服务
//!
//! --stdio 时一个进程服务一个客户端；否则监听 TCP，Ctrl+C 优雅退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ant::rpc::{serve_stdio, serve_tcp, RpcService};
use ant::{load_config, observability, AgentBuilder};

#[derive(Parser)]
#[command(name = "ant-server")]
#[command(about = "JSON-RPC server for the ant task agent", version)]
struct Args {
    /// 通过 stdin/stdout 服务
    #[arg(long, conflicts_with_all = ["host", "port"])]
    stdio: bool,

    /// 覆盖 [server].host
    #[arg(long)]
    host: Option<String>,

    /// 覆盖 [server].port
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, env = "ANT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let cfg = load_config(args.config.clone()).context("failed to load configuration")?;
    let host = args.host.clone().unwrap_or_else(|| cfg.server.host.clone());
    let port = args.port.unwrap_or(cfg.server.port);

    let mut builder = AgentBuilder::new(cfg);
    if let Some(ws) = args.workspace.clone() {
        builder = builder.with_workspace(ws);
    }
    let agent = builder.build().context("failed to build agent")?;
    let service = Arc::new(RpcService::new(agent));

    if args.stdio {
        serve_stdio(service).await.context("stdio transport failed")?;
        return Ok(());
    }

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("ctrl-c received, shutting down");
        signal_token.cancel();
    });

    serve_tcp(service, listener, shutdown).await.context("tcp transport failed")?;
    tracing::info!("server stopped");
    Ok(())
}
