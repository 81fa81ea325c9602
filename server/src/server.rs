use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tracing::{error, info};

use crate::context::ApplicationContext;
use crate::frame::SignalFrame;
use crate::{http, ws};

async fn dispatch(ctx: Arc<ApplicationContext>, req: Request<Body>) -> Response<Body> {
    if ws::is_upgrade_request(&req) {
        ws::handle_upgrade(ctx, req).await
    } else {
        http::route(ctx, req).await
    }
}

async fn shutdown_signal(ctx: Arc<ApplicationContext>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    let _ = ctx.get_signal_sender().send(SignalFrame::Shutdown).await;
}

pub async fn run_server(ctx: Arc<ApplicationContext>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.server.port));

    let service_ctx = ctx.clone();
    let make_svc = make_service_fn(move |_conn| {
        let ctx = service_ctx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(dispatch(ctx, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("Server started at {:?}", addr);
    server.with_graceful_shutdown(shutdown_signal(ctx)).await?;
    info!("Server stopped");
    Ok(())
}
