//! Control-plane services: the Clash compatible API and the V2Ray stats API.

pub mod handlers;
pub mod log_broadcast;
pub mod models;
pub mod v2ray_stats;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::adapter::{ClashServer, PreStarter, Router, Service};
use crate::app::clash_mode::ModeState;
use crate::app::context::BoxContext;
use crate::config::types::ClashApiOptions;
use crate::log::{LogFactory, Logger};

use handlers::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Clash API 服务
pub struct ClashApiServer {
    logger: Logger,
    options: ClashApiOptions,
    router: Arc<dyn Router>,
    log_factory: Arc<dyn LogFactory>,
    mode: Arc<ModeState>,
    token: CancellationToken,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClashApiServer {
    pub fn new(
        ctx: &BoxContext,
        router: Arc<dyn Router>,
        log_factory: Arc<dyn LogFactory>,
        options: ClashApiOptions,
    ) -> Result<Self> {
        if log_factory.subscribe().is_none() {
            anyhow::bail!("clash api requires an observable log factory");
        }
        let mode = ModeState::new(options.mode_list.clone(), options.default_mode.as_deref());
        Ok(Self {
            logger: log_factory.new_logger("clash-api"),
            options,
            router,
            log_factory,
            mode: Arc::new(mode),
            token: ctx.token.child_token(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// Bound address, once pre-started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn bind(&self) -> Result<()> {
        if self.options.external_controller.is_empty() {
            return Ok(());
        }
        let listener = TcpListener::bind(&self.options.external_controller)
            .await
            .map_err(|e| {
                anyhow::anyhow!("external controller listen error: {}", e)
            })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        self.logger.info(format!("restful api listening at {}", local));
        Ok(())
    }

    fn app(&self) -> axum::Router {
        let state = AppState {
            router: self.router.clone(),
            mode: self.mode.clone(),
            log_factory: self.log_factory.clone(),
            secret: self.options.secret.clone(),
        };

        let mut app = axum::Router::new()
            .route("/version", get(handlers::get_version))
            .route(
                "/configs",
                get(handlers::get_configs).patch(handlers::patch_configs),
            )
            .route("/proxies", get(handlers::get_proxies))
            .route("/proxies/{name}", get(handlers::get_proxy))
            .route("/logs", get(handlers::logs_ws))
            .layer(CorsLayer::permissive());

        // 如果配置了 secret，添加认证中间件
        if let Some(secret) = self.options.secret.clone().filter(|s| !s.is_empty()) {
            app = app.layer(middleware::from_fn(move |req, next| {
                auth_middleware(req, next, secret.clone())
            }));
        }

        app.with_state(state)
    }
}

#[async_trait]
impl PreStarter for ClashApiServer {
    async fn pre_start(&self) -> Result<()> {
        self.bind().await
    }
}

#[async_trait]
impl Service for ClashApiServer {
    async fn start(&self) -> Result<()> {
        if self.options.external_controller.is_empty() {
            return Ok(());
        }
        let pending = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let listener = match pending {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("listener unavailable"))?
            }
        };

        let app = self.app();
        let token = self.token.clone();
        let logger = self.logger.clone();
        let handle = tokio::spawn(async move {
            let shutdown = token.cancelled_owned();
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                logger.error(format!("api server error: {}", e));
            }
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                self.logger.warn("api server did not stop in time");
            }
        }
        Ok(())
    }

    fn as_pre_starter(&self) -> Option<&dyn PreStarter> {
        Some(self)
    }
}

impl ClashServer for ClashApiServer {
    fn mode(&self) -> String {
        self.mode.get()
    }

    fn mode_list(&self) -> Vec<String> {
        self.mode.list().to_vec()
    }

    fn options(&self) -> &ClashApiOptions {
        &self.options
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}

/// Bearer token 认证中间件
async fn auth_middleware(req: Request, next: Next, secret: String) -> Result<Response, StatusCode> {
    // /logs 的 WebSocket 升级由 handler 通过 token 查询参数认证
    if req.uri().path() == "/logs" && req.headers().contains_key(header::UPGRADE) {
        return Ok(next.run(req).await);
    }

    // /version 端点不需要认证
    if req.uri().path() == "/version" {
        return Ok(next.run(req).await);
    }

    if let Some(auth) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                if token == secret {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}
