use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse},
    routing::get,
    serve, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::Environment;
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::completion::CompletionClient;
use crate::constants::{
    DEFAULT_TEMPERATURE, EMOTION_PRESETS, MODEL_OPTIONS, NONE_SELECTED, TEMPERATURE_MAX,
    TEMPERATURE_MIN, TEMPERATURE_STEP, TEMPERATURE_TICKS,
};
use crate::session::{ClientEvent, ServerEvent, SessionController};

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

// Buffered server events per connection; fragments wait here while the socket drains.
const EVENT_BUFFER: usize = 256;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Hosting parameters. Everything about the chat itself is set from the page.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub static_dir: PathBuf,
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<Environment<'static>>,
    client: Arc<dyn CompletionClient>,
}

impl AppState {
    pub fn new(client: Arc<dyn CompletionClient>) -> Result<Self> {
        let templates = create_minijinja_env().context("Failed to initialize template engine")?;
        Ok(Self {
            templates: Arc::new(templates),
            client,
        })
    }
}

fn create_minijinja_env() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("index.html", INDEX_TEMPLATE)?;
    Ok(env)
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, Html<String>> {
    state
        .templates
        .get_template("index.html")
        .and_then(|tmpl| {
            let context = minijinja::context! {
                title => "Empathy Chat: emotion-aware conversation",
                none_selected => NONE_SELECTED,
                presets => EMOTION_PRESETS.to_vec(),
                models => MODEL_OPTIONS.to_vec(),
                temperature_min => one_decimal(TEMPERATURE_MIN),
                temperature_max => one_decimal(TEMPERATURE_MAX),
                temperature_step => one_decimal(TEMPERATURE_STEP),
                temperature_default => one_decimal(DEFAULT_TEMPERATURE),
                temperature_ticks => TEMPERATURE_TICKS
                    .iter()
                    .map(|t| one_decimal(*t))
                    .collect::<Vec<_>>(),
            };
            tmpl.render(context)
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            Html(format!("Internal Server Error: {}", e))
        })
}

// f32 values widen badly in templates (0.8 -> 0.800000011920929).
fn one_decimal(value: f32) -> String {
    format!("{:.1}", value)
}

async fn health_handler() -> &'static str {
    "ok"
}

// WebSocket upgrade handler; every connection is a fresh session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.client))
}

async fn handle_socket(socket: WebSocket, client: Arc<dyn CompletionClient>) {
    let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    info!(session, "Session opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(EVENT_BUFFER);

    // Forward session events to the client in order.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        warn!(session, "WebSocket send failed. Closing connection.");
                        break;
                    }
                }
                Err(e) => error!(session, "Failed to serialize server event: {}", e),
            }
        }
    });

    let mut controller = SessionController::new(client);
    if controller.handle_event(ClientEvent::Refresh, &tx).await.is_ok() {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    // Frames may carry the API key, so only the size is logged.
                    debug!(session, bytes = text.len(), "Client event received");
                    let result = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => controller.handle_event(event, &tx).await,
                        Err(e) => {
                            warn!(session, "Malformed client event: {}", e);
                            tx.send(ServerEvent::Error {
                                message: format!("Malformed message: {}", e),
                            })
                            .await
                            .context("Session event channel closed")
                        }
                    };
                    if let Err(e) = result {
                        warn!(session, "Ending session: {:#}", e);
                        break;
                    }
                }
                Message::Binary(_) => {
                    warn!(session, "Received unexpected binary message from client")
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    info!(session, "Client requested WebSocket close");
                    break;
                }
            }
        }
    }

    drop(tx);
    if let Err(e) = writer.await {
        error!(session, "WebSocket writer task failed: {:?}", e);
    }
    info!(session, "Session closed");
}

pub fn router(state: AppState, static_dir: PathBuf) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(
    config: ServerConfig,
    client: Arc<dyn CompletionClient>,
) -> Result<()> {
    let state = AppState::new(client)?;
    let app = router(state, config.static_dir.clone());

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;
    info!("Web server listening on http://{}", addr);

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
