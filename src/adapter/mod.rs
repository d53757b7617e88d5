//! Capability traits shared by the box and the components it drives.
//!
//! The box only sequences `start`/`close` across these; what a component
//! does inside them is its own business.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::types::{ClashApiOptions, DnsRule, OutboundOptions, RouteRule};
use crate::log::LogLevel;

/// 生命周期服务
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Query for the optional pre-start phase. `None` means the component
    /// has no such phase and is skipped.
    fn as_pre_starter(&self) -> Option<&dyn PreStarter> {
        None
    }

    /// Query for the optional post-start phase.
    fn as_post_starter(&self) -> Option<&dyn PostStarter> {
        None
    }
}

#[async_trait]
pub trait PreStarter: Send + Sync {
    async fn pre_start(&self) -> Result<()>;
}

#[async_trait]
pub trait PostStarter: Send + Sync {
    async fn post_start(&self) -> Result<()>;
}

/// 入站
pub trait Inbound: Service {
    fn tag(&self) -> &str;
    fn inbound_type(&self) -> &str;
}

/// 出站
#[async_trait]
pub trait Outbound: Service {
    fn tag(&self) -> &str;
    fn outbound_type(&self) -> &str;

    async fn dial(&self, destination: &str) -> Result<TcpStream> {
        anyhow::bail!(
            "dial {} not supported by outbound/{}[{}]",
            destination,
            self.outbound_type(),
            self.tag()
        )
    }
}

#[async_trait]
pub trait ProxyProvider: Service {
    fn tag(&self) -> &str;

    /// Fetch the outbound definitions this provider contributes. Called
    /// exactly once while the box is being built, before `start`.
    async fn start_get_outbounds(&self) -> Result<Vec<OutboundOptions>>;
}

pub trait RuleProvider: Service {
    fn tag(&self) -> &str;

    /// Rewrite the DNS and route rule lists. `None` means the list is
    /// empty; the corresponding output is ignored by the caller.
    fn format_rule(
        &self,
        dns_rules: Option<&[DnsRule]>,
        route_rules: Option<&[RouteRule]>,
    ) -> Result<(Vec<DnsRule>, Vec<RouteRule>)>;

    fn set_router(&self, router: Arc<dyn Router>);
}

/// Lazily builds the synthetic `default` direct outbound.
pub type DefaultOutboundFactory<'a> = dyn FnMut() -> Result<Arc<dyn Outbound>> + 'a;

pub trait Router: Service {
    fn initialize(
        &self,
        inbounds: &[Arc<dyn Inbound>],
        outbounds: &[Arc<dyn Outbound>],
        default_outbound: &mut DefaultOutboundFactory<'_>,
        proxy_providers: &[Arc<dyn ProxyProvider>],
        rule_providers: &[Arc<dyn RuleProvider>],
    ) -> Result<()>;

    fn set_clash_server(&self, server: Arc<dyn ClashServer>);
    fn set_v2ray_server(&self, server: Arc<dyn V2RayServer>);
    fn v2ray_server(&self) -> Option<Arc<dyn V2RayServer>>;

    fn default_outbound(&self) -> Option<Arc<dyn Outbound>>;
    fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>>;
    fn outbounds(&self) -> Vec<Arc<dyn Outbound>>;
}

/// Clash compatible control API.
pub trait ClashServer: Service {
    fn mode(&self) -> String;
    fn mode_list(&self) -> Vec<String>;
    fn options(&self) -> &ClashApiOptions;
    fn into_service(self: Arc<Self>) -> Arc<dyn Service>;
}

/// V2Ray compatible stats API.
pub trait V2RayServer: Service {
    fn stats(&self) -> Arc<crate::api::v2ray_stats::StatsService>;
    fn into_service(self: Arc<Self>) -> Arc<dyn Service>;
}

/// Host platform integration (mobile/desktop shells embedding the box).
#[async_trait]
pub trait PlatformInterface: Send + Sync {
    async fn initialize(&self, router: Arc<dyn Router>) -> Result<()>;

    /// Receives formatted log lines when the platform owns log output.
    fn write_log(&self, level: LogLevel, message: &str);
}
