//! 传输层：按行读取请求、按行写回响应
//!
//! stdio 每个进程服务一个客户端；TCP 每个连接一个 tokio 任务，共享同一个 RpcService。

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::rpc::service::RpcService;

/// 读到 EOF 为止；每条响应后 flush
pub async fn serve_lines<R, W>(service: &RpcService, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(response) = service.handle_line(&line).await {
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

pub async fn serve_stdio(service: Arc<RpcService>) -> std::io::Result<()> {
    tracing::info!("serving JSON-RPC over stdio");
    serve_lines(&service, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// 接受连接直到 shutdown 被取消；进行中的连接同时收到取消
pub async fn serve_tcp(
    service: Arc<RpcService>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "serving JSON-RPC over TCP");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::info!(%peer, "client connected");
                let service = Arc::clone(&service);
                let token = shutdown.clone();
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    tokio::select! {
                        res = serve_lines(&service, BufReader::new(read), write) => {
                            if let Err(e) = res {
                                tracing::warn!(%peer, error = %e, "connection error");
                            }
                        }
                        _ = token.cancelled() => {}
                    }
                    tracing::info!(%peer, "client disconnected");
                });
            }
        }
    }
    Ok(())
}
