use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::pipeline::Orchestrator;
use crate::config::HostdeckConfig;

/// Options for the deploy server.
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    /// Open the console URL in a browser once listening.
    pub open_browser: bool,
}

impl ServerOptions {
    pub fn from_config(config: &HostdeckConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: false,
            open_browser: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the deploy server and block until Ctrl+C, then cancel active runs.
pub async fn start_server(config: HostdeckConfig, options: ServerOptions) -> Result<()> {
    config.ensure_apps_root()?;
    let orchestrator = Arc::new(Orchestrator::new(config));
    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
    });
    let app = build_router(state, options.dev_mode);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://{}", local_addr);
    info!(%url, dev_mode = options.dev_mode, "hostdeck server listening");
    println!("hostdeck running at {}", url);

    if options.open_browser {
        if let Err(e) = open::that(&url) {
            warn!(error = %e, "failed to open browser");
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::testing::FakeRunner;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, Stream, StreamExt};
    use hostdeck_common::{RunEvent, RunStatus};
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    fn test_orchestrator(dir: &TempDir, runner: FakeRunner) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::with_runner(
            FakeRunner::config(dir.path()),
            Arc::new(runner),
        ))
    }

    async fn spawn_server(orchestrator: Arc<Orchestrator>) -> std::net::SocketAddr {
        let app = build_router(Arc::new(AppState { orchestrator }), false);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Read text frames as events until the server closes the socket.
    async fn read_events<S>(ws: &mut S) -> (Vec<RunEvent>, Option<(u16, String)>)
    where
        S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut events = Vec::new();
        while let Some(msg) = ws.next().await {
            match msg.unwrap() {
                WsMessage::Text(text) => events.push(serde_json::from_str(text.as_str()).unwrap()),
                WsMessage::Close(frame) => {
                    let frame = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                    return (events, frame);
                }
                _ => {}
            }
        }
        (events, None)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(AppState {
            orchestrator: test_orchestrator(&dir, FakeRunner::default()),
        });
        let app = build_router(state, true);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deploy_stream_runs_to_done() {
        let dir = TempDir::new().unwrap();
        let orchestrator = test_orchestrator(&dir, FakeRunner::default());
        let addr = spawn_server(orchestrator.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/deploy/stream", addr))
            .await
            .unwrap();
        let request = serde_json::json!({"repo": "demo-app", "port": 3050});
        ws.send(WsMessage::text(request.to_string())).await.unwrap();

        let (events, close) = read_events(&mut ws).await;
        assert!(matches!(
            events.first(),
            Some(RunEvent::StepStart { command, .. }) if command.starts_with("git clone")
        ));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Done {
                success: true,
                error: None
            })
        );
        assert_eq!(close.map(|(code, _)| code), Some(1000));

        let run = &orchestrator.list()[0];
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(events, run.events_so_far());
    }

    #[tokio::test]
    async fn test_deploy_stream_rejection_closes_with_code() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner {
            hang_on: Some("git clone"),
            ..Default::default()
        };
        let orchestrator = test_orchestrator(&dir, runner);
        orchestrator
            .start(&hostdeck_common::DeployRequest::new("demo-app", "main", 3050))
            .unwrap();
        let addr = spawn_server(orchestrator.clone()).await;
        let url = format!("ws://{}/api/deploy/stream", addr);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let busy = serde_json::json!({"repo": "demo-app", "port": 3051});
        ws.send(WsMessage::text(busy.to_string())).await.unwrap();
        let (events, close) = read_events(&mut ws).await;
        assert!(events.is_empty());
        assert_eq!(close, Some((4409, "slot-occupied".to_string())));

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let bad_port = serde_json::json!({"repo": "other", "port": 22});
        ws.send(WsMessage::text(bad_port.to_string())).await.unwrap();
        let (events, close) = read_events(&mut ws).await;
        assert!(events.is_empty());
        assert_eq!(close, Some((4400, "invalid-port".to_string())));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_websocket_subscriber_gets_replay() {
        let dir = TempDir::new().unwrap();
        let orchestrator = test_orchestrator(&dir, FakeRunner::default());
        let run = orchestrator
            .start(&hostdeck_common::DeployRequest::new("demo-app", "main", 3050))
            .unwrap();
        run.wait().await;
        let addr = spawn_server(orchestrator.clone()).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/runs/{}/events", addr, run.id()))
                .await
                .unwrap();
        let (events, _) = read_events(&mut ws).await;
        assert_eq!(events, run.events_so_far());
        assert!(events.last().is_some_and(RunEvent::is_terminal));
    }

    #[tokio::test]
    async fn test_client_disconnect_does_not_cancel_run() {
        let dir = TempDir::new().unwrap();
        let orchestrator = test_orchestrator(&dir, FakeRunner::default());
        let addr = spawn_server(orchestrator.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/deploy/stream", addr))
            .await
            .unwrap();
        let request = serde_json::json!({"repo": "demo-app", "port": 3050});
        ws.send(WsMessage::text(request.to_string())).await.unwrap();
        // Wait until the run exists, then hang up.
        let _ = ws.next().await;
        drop(ws);

        let run = orchestrator.list()[0].clone();
        assert_eq!(run.wait().await, RunStatus::Succeeded);
    }
}
