use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::adapter::{Outbound, Service};
use crate::log::Logger;

/// 拒绝所有连接
pub struct BlockOutbound {
    tag: String,
    logger: Logger,
}

impl BlockOutbound {
    pub fn new(logger: Logger, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            logger,
        }
    }
}

#[async_trait]
impl Service for BlockOutbound {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Outbound for BlockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        "block"
    }

    async fn dial(&self, destination: &str) -> Result<TcpStream> {
        self.logger.debug(format!("blocked {}", destination));
        anyhow::bail!("connection to {} blocked by outbound '{}'", destination, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_dial_is_refused() {
        let outbound = BlockOutbound::new(Logger::new("outbound/block[reject]"), "reject");
        let err = outbound.dial("example.com:443").await.unwrap_err();
        assert!(err.to_string().contains("blocked by outbound 'reject'"));
    }
}
