use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::adapter::{Outbound, Service};
use crate::config::types::OutboundOptions;
use crate::log::Logger;

/// 直连出站
pub struct DirectOutbound {
    tag: String,
    logger: Logger,
    connect_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl DirectOutbound {
    pub fn new(logger: Logger, tag: &str, options: &OutboundOptions) -> Self {
        Self {
            tag: tag.to_string(),
            logger,
            connect_timeout: options
                .connect_timeout
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Service for DirectOutbound {
    async fn start(&self) -> Result<()> {
        self.logger.trace("ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        "direct"
    }

    async fn dial(&self, destination: &str) -> Result<TcpStream> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("outbound closed");
        }
        self.logger.debug(format!("dial {}", destination));
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(destination))
                .await
                .map_err(|_| anyhow::anyhow!("dial {}: timed out after {:?}", destination, timeout))??,
            None => TcpStream::connect(destination).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
