//! V2Ray Stats API
//!
//! 提供入站/出站流量统计和用户流量统计。
//!
//! ## API 端点
//! - `GET /v2ray/stats?pattern=&reset=` — 查询统计项
//! - `GET /v2ray/stats/{name}?reset=` — 查询指定统计项
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Service, V2RayServer};
use crate::app::context::BoxContext;
use crate::config::types::V2RayApiOptions;
use crate::log::Logger;

/// V2Ray 统计服务
#[derive(Default)]
pub struct StatsService {
    /// 统计计数器表：name -> counter
    counters: RwLock<BTreeMap<String, Arc<StatCounter>>>,
}

/// 单个统计计数器
#[derive(Default)]
pub struct StatCounter {
    value: AtomicU64,
}

/// 统计查询结果
#[derive(Debug, Serialize, Deserialize)]
pub struct StatResult {
    pub name: String,
    pub value: u64,
}

/// 统计查询响应
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stat: Vec<StatResult>,
}

impl StatCounter {
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }

    fn read(&self, reset: bool) -> u64 {
        if reset {
            self.reset()
        } else {
            self.get()
        }
    }
}

impl StatsService {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: &str, name: &str) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        for direction in ["uplink", "downlink"] {
            counters
                .entry(format!("{}>>>{}>>>traffic>>>{}", kind, name, direction))
                .or_default();
        }
    }

    pub fn register_inbound(&self, tag: &str) {
        self.register("inbound", tag);
    }

    pub fn register_outbound(&self, tag: &str) {
        self.register("outbound", tag);
    }

    pub fn register_user(&self, name: &str) {
        self.register("user", name);
    }

    /// 获取计数器引用（用于高频更新）
    pub fn counter(&self, name: &str) -> Option<Arc<StatCounter>> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Add to `<kind>>>><name>>>>traffic>>><direction>` if registered.
    pub fn record(&self, kind: &str, name: &str, direction: &str, bytes: u64) {
        if let Some(counter) = self.counter(&format!("{}>>>{}>>>traffic>>>{}", kind, name, direction)) {
            counter.add(bytes);
        }
    }

    /// 查询统计（GetStats）
    pub fn get_stats(&self, name: &str, reset: bool) -> Option<StatResult> {
        self.counter(name).map(|counter| StatResult {
            name: name.to_string(),
            value: counter.read(reset),
        })
    }

    /// 查询所有统计（QueryStats），按名称排序
    pub fn query_stats(&self, pattern: Option<&str>, reset: bool) -> StatsResponse {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        let stat = counters
            .iter()
            .filter(|(name, _)| pattern.map(|p| name.contains(p)).unwrap_or(true))
            .map(|(name, counter)| StatResult {
                name: name.clone(),
                value: counter.read(reset),
            })
            .collect();
        StatsResponse { stat }
    }
}

/// V2Ray API 服务
pub struct V2RayApiServer {
    logger: Logger,
    listen: String,
    stats: Arc<StatsService>,
    token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl V2RayApiServer {
    pub fn new(ctx: &BoxContext, logger: Logger, options: &V2RayApiOptions) -> Result<Self> {
        if options.listen.is_empty() {
            anyhow::bail!("missing listen address");
        }
        let stats = StatsService::new();
        if let Some(stats_options) = options.stats.as_ref().filter(|s| s.enabled) {
            stats_options.inbounds.iter().for_each(|t| stats.register_inbound(t));
            stats_options.outbounds.iter().for_each(|t| stats.register_outbound(t));
            stats_options.users.iter().for_each(|u| stats.register_user(u));
        }
        Ok(Self {
            logger,
            listen: options.listen.clone(),
            stats: Arc::new(stats),
            token: ctx.token.child_token(),
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    reset: bool,
}

async fn query_stats(
    State(stats): State<Arc<StatsService>>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsResponse> {
    Json(stats.query_stats(query.pattern.as_deref(), query.reset))
}

async fn get_stat(
    State(stats): State<Arc<StatsService>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let reset = query.get("reset").is_some_and(|v| v == "true");
    match stats.get_stats(&name, reset) {
        Some(result) => Json(result).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[async_trait]
impl Service for V2RayApiServer {
    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| anyhow::anyhow!("v2ray api listen error: {}", e))?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        self.logger.info(format!("grpc server started at {}", local));

        let app = axum::Router::new()
            .route("/v2ray/stats", get(query_stats))
            .route("/v2ray/stats/{name}", get(get_stat))
            .with_state(self.stats.clone());
        let token = self.token.clone();
        let logger = self.logger.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                logger.error(format!("stats server error: {}", e));
            }
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl V2RayServer for V2RayApiServer {
    fn stats(&self) -> Arc<StatsService> {
        self.stats.clone()
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::reload::reload_channel;
    use crate::config::types::V2RayStatsOptions;

    #[test]
    fn stats_service_basic() {
        let svc = StatsService::new();
        svc.register_outbound("proxy");

        svc.record("outbound", "proxy", "uplink", 1000);
        svc.record("outbound", "proxy", "uplink", 500);
        svc.record("outbound", "proxy", "downlink", 2000);
        svc.record("outbound", "unknown", "uplink", 1);

        let up = svc.get_stats("outbound>>>proxy>>>traffic>>>uplink", false).unwrap();
        assert_eq!(up.value, 1500);
        let down = svc.get_stats("outbound>>>proxy>>>traffic>>>downlink", false).unwrap();
        assert_eq!(down.value, 2000);
        assert!(svc.get_stats("outbound>>>unknown>>>traffic>>>uplink", false).is_none());
    }

    #[test]
    fn stats_reset() {
        let svc = StatsService::new();
        svc.register_outbound("proxy");
        svc.record("outbound", "proxy", "uplink", 1000);

        let result = svc.get_stats("outbound>>>proxy>>>traffic>>>uplink", true).unwrap();
        assert_eq!(result.value, 1000);
        let result = svc.get_stats("outbound>>>proxy>>>traffic>>>uplink", false).unwrap();
        assert_eq!(result.value, 0);
    }

    #[test]
    fn query_stats_filter() {
        let svc = StatsService::new();
        svc.register_inbound("tun");
        svc.register_outbound("proxy");
        let resp = svc.query_stats(Some("inbound"), false);
        assert_eq!(resp.stat.len(), 2);
        assert!(resp.stat.iter().all(|s| s.name.contains("inbound")));
    }

    #[test]
    fn server_registers_configured_counters() {
        let (notifier, _signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        let server = V2RayApiServer::new(
            &ctx,
            Logger::new("v2ray-api"),
            &V2RayApiOptions {
                listen: "127.0.0.1:0".to_string(),
                stats: Some(V2RayStatsOptions {
                    enabled: true,
                    inbounds: vec!["in".to_string()],
                    outbounds: vec!["out".to_string()],
                    users: vec!["alice".to_string()],
                }),
            },
        )
        .unwrap();
        assert_eq!(server.stats().query_stats(None, false).stat.len(), 6);
    }

    #[test]
    fn listen_is_required() {
        let (notifier, _signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        assert!(V2RayApiServer::new(&ctx, Logger::new("v2ray-api"), &V2RayApiOptions::default()).is_err());
    }
}
