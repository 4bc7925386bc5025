use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use tandem::pipeline::LoopbackPipelineFactory;
use tandem::ws::WsTransport;
use tandem::{config, logging, metrics, run_peer_server, AppContext, RoomStore};

#[derive(Clone)]
struct ServerState {
    store: Arc<RoomStore>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::validate_env()?;
    logging::init(&config);
    metrics::register_metrics();

    let port = config.port;
    let ctx = AppContext::new(config, Arc::new(LoopbackPipelineFactory));
    let store = RoomStore::new(ctx);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(ServerState { store });

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    upgrade.on_upgrade(move |socket| async move {
        run_peer_server(origin, Arc::new(WsTransport::new(socket)), state.store).await;
    })
}

async fn metrics_handler() -> String {
    metrics::render()
}
