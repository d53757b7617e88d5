use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tokio::sync::broadcast;

use crate::adapter::{Outbound, Router};
use crate::app::clash_mode::ModeState;
use crate::log::LogFactory;

use super::log_broadcast::LogEntry;
use super::models::*;

/// 共享应用状态
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<dyn Router>,
    pub mode: Arc<ModeState>,
    pub log_factory: Arc<dyn LogFactory>,
    pub secret: Option<String>,
}

/// GET /version
pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        premium: false,
    })
}

/// GET /configs
pub async fn get_configs(State(state): State<AppState>) -> Json<ConfigsResponse> {
    Json(ConfigsResponse {
        mode: state.mode.get(),
        mode_list: state.mode.list().to_vec(),
    })
}

/// PATCH /configs - 切换模式
pub async fn patch_configs(
    State(state): State<AppState>,
    Json(body): Json<PatchConfigsRequest>,
) -> impl IntoResponse {
    if let Some(mode) = body.mode {
        if !state.mode.set(&mode) {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    message: format!("unknown mode: {}", mode),
                }),
            )
                .into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

fn proxy_info(outbound: &dyn Outbound) -> ProxyInfo {
    ProxyInfo {
        name: outbound.tag().to_string(),
        proxy_type: capitalize(outbound.outbound_type()),
        udp: false,
        history: vec![],
        all: None,
        now: None,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// GET /proxies
///
/// Besides every outbound, lists a `GLOBAL` selector whose current member
/// is the router's default outbound.
pub async fn get_proxies(State(state): State<AppState>) -> Json<ProxiesResponse> {
    let outbounds = state.router.outbounds();
    let mut proxies: HashMap<String, ProxyInfo> = outbounds
        .iter()
        .map(|outbound| (outbound.tag().to_string(), proxy_info(outbound.as_ref())))
        .collect();
    proxies.insert(
        "GLOBAL".to_string(),
        ProxyInfo {
            name: "GLOBAL".to_string(),
            proxy_type: "Selector".to_string(),
            udp: false,
            history: vec![],
            all: Some(outbounds.iter().map(|o| o.tag().to_string()).collect()),
            now: state.router.default_outbound().map(|o| o.tag().to_string()),
        },
    );
    Json(ProxiesResponse { proxies })
}

/// GET /proxies/:name
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.router.outbound(&name) {
        Some(outbound) => Json(proxy_info(outbound.as_ref())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /logs (WebSocket)
pub async fn logs_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // WebSocket 认证检查
    if let Some(ref secret) = state.secret {
        let token = params.get("token").map(|s| s.as_str()).unwrap_or("");
        if token != secret {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Some(rx) = state.log_factory.subscribe() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let level_filter = params
        .get("level")
        .cloned()
        .unwrap_or_else(|| "info".to_string());

    ws.on_upgrade(move |socket| handle_logs_ws(socket, rx, level_filter))
        .into_response()
}

async fn handle_logs_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<LogEntry>,
    level_filter: String,
) {
    loop {
        match rx.recv().await {
            Ok(entry) => {
                if !should_include_level(&entry.level, &level_filter) {
                    continue;
                }
                let json = match serde_json::to_string(&entry) {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub(crate) fn should_include_level(entry_level: &str, filter: &str) -> bool {
    let level_value = |l: &str| match l {
        "error" => 0,
        "warning" => 1,
        "info" => 2,
        "debug" => 3,
        _ => 4,
    };
    level_value(entry_level) <= level_value(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filtering() {
        assert!(should_include_level("error", "info"));
        assert!(should_include_level("info", "info"));
        assert!(!should_include_level("debug", "info"));
        assert!(should_include_level("debug", "debug"));
        assert!(!should_include_level("info", "warning"));
    }

    #[test]
    fn type_names_are_capitalized() {
        assert_eq!(capitalize("direct"), "Direct");
        assert_eq!(capitalize(""), "");
    }
}
