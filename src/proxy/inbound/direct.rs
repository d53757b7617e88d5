use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Inbound, Router, Service};
use crate::app::context::BoxContext;
use crate::config::types::InboundOptions;
use crate::log::Logger;

const DEFAULT_LISTEN: &str = "127.0.0.1";

/// 端口转发入站：把每个连接经默认出站转发到固定目标
pub struct DirectInbound {
    tag: String,
    logger: Logger,
    router: Arc<dyn Router>,
    listen: String,
    destination: String,
    token: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DirectInbound {
    pub fn new(
        ctx: &BoxContext,
        router: Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &InboundOptions,
    ) -> Result<Self> {
        let address = options
            .override_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing override_address"))?;
        let port = options
            .override_port
            .ok_or_else(|| anyhow::anyhow!("missing override_port"))?;
        let listen = options.listen.as_deref().unwrap_or(DEFAULT_LISTEN);

        Ok(Self {
            tag: tag.to_string(),
            logger,
            router,
            listen: join_host_port(listen, options.listen_port.unwrap_or(0)),
            destination: join_host_port(address, port),
            token: ctx.token.child_token(),
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[async_trait]
impl Service for DirectInbound {
    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| anyhow::anyhow!("listen {}: {}", self.listen, e))?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        self.logger.info(format!("tcp server started at {}", local));

        let token = self.token.clone();
        let router = self.router.clone();
        let logger = self.logger.clone();
        let destination = self.destination.clone();
        let tag: Arc<str> = Arc::from(self.tag.as_str());
        let handle = tokio::spawn(async move {
            loop {
                let (stream, source) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            logger.error(format!("accept failed: {}", e));
                            continue;
                        }
                    },
                };
                let router = router.clone();
                let logger = logger.clone();
                let destination = destination.clone();
                let token = token.clone();
                let tag = tag.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        result = forward(stream, &router, &tag, &destination) => {
                            if let Err(e) = result {
                                logger.debug(format!("{} -> {}: {:#}", source, destination, e));
                            }
                        }
                    }
                });
            }
            logger.trace("listener stopped");
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        // 等待 accept 循环退出，监听随之释放
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn forward(
    mut inbound: TcpStream,
    router: &Arc<dyn Router>,
    inbound_tag: &str,
    destination: &str,
) -> Result<()> {
    let outbound = router
        .default_outbound()
        .ok_or_else(|| anyhow::anyhow!("no default outbound"))?;
    let mut remote = outbound.dial(destination).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut inbound, &mut remote).await?;
    if let Some(server) = router.v2ray_server() {
        let stats = server.stats();
        stats.record("inbound", inbound_tag, "uplink", up);
        stats.record("inbound", inbound_tag, "downlink", down);
        stats.record("outbound", outbound.tag(), "uplink", up);
        stats.record("outbound", outbound.tag(), "downlink", down);
    }
    Ok(())
}

impl Inbound for DirectInbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn inbound_type(&self) -> &str {
        "direct"
    }
}
