//! Listener wiring: the RTMP accept loop, the HTTP control server and the
//! background sweepers, all running until shutdown is requested.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bidcast_api::{router, ApiState};
use bidcast_livestream::session::{self, SessionKind};
use bidcast_livestream::ServerContext;

pub struct BidcastServer {
    ctx: ServerContext,
}

impl BidcastServer {
    #[must_use]
    pub fn new(ctx: ServerContext) -> Self {
        Self { ctx }
    }

    /// Run until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.ctx.registry.spawn_sweepers(&cancel);

        let http_addr = format!(
            "{}:{}",
            self.ctx.config.server.host, self.ctx.config.server.http_port
        );
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("binding control API on {http_addr}"))?;
        info!(%http_addr, "control API listening");

        let api_state = ApiState::new(self.ctx.clone());
        let http_cancel = cancel.clone();
        tokio::spawn(async move {
            let app = router(api_state);
            let serve = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move { http_cancel.cancelled().await });
            if let Err(err) = serve.await {
                error!(%err, "control API server failed");
            }
        });

        self.serve_rtmp(cancel).await
    }

    async fn serve_rtmp(&self, cancel: CancellationToken) -> Result<()> {
        let rtmp_addr = format!(
            "{}:{}",
            self.ctx.config.server.host, self.ctx.config.server.rtmp_port
        );
        let listener = TcpListener::bind(&rtmp_addr)
            .await
            .with_context(|| format!("binding RTMP listener on {rtmp_addr}"))?;
        info!(%rtmp_addr, "RTMP listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_conn(ctx, socket).await {
                                    warn!(%peer, %err, "rtmp connection closed");
                                }
                            });
                        }
                        Err(err) => warn!(%err, "rtmp accept failed"),
                    }
                }
                () = cancel.cancelled() => {
                    info!("RTMP listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// One connection: handshake and negotiation, admission against the room
/// pool, then hand-off to the registry. Errors here close only this
/// connection.
async fn handle_conn(ctx: ServerContext, socket: TcpStream) -> Result<()> {
    socket.set_nodelay(true).ok();

    let negotiated = session::accept(socket, ctx.config.server.chunk_size).await?;
    let key = negotiated.info.key.clone();

    // The only authorization there is: the URL must have been allocated.
    let endpoint = match ctx.rooms.endpoint_by_path(&key) {
        Ok(endpoint) => endpoint,
        Err(_) => {
            negotiated.reject("Not Found PushStream").await;
            bail!("Not Found PushStream {key}");
        }
    };
    let canonical_url = endpoint.endpoint.push_url.clone();

    match negotiated.kind {
        SessionKind::Publisher => {
            let read_timeout = Duration::from_secs(ctx.config.server.read_timeout_secs);
            let conn = negotiated.into_publisher(canonical_url, read_timeout).await?;
            ctx.registry.handle_publisher(conn, &endpoint);
        }
        SessionKind::Viewer => {
            let write_timeout = Duration::from_secs(ctx.config.server.write_timeout_secs);
            let conn = negotiated.into_viewer(canonical_url, write_timeout).await?;
            ctx.registry.handle_viewer(conn, &endpoint);
        }
    }
    Ok(())
}
