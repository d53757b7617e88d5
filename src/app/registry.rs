//! Component construction.
//!
//! The box never builds components itself; it asks a [`Registry`]. The
//! built-in registry wires the types shipped with this crate, embedders
//! and tests supply their own.

use std::sync::Arc;

use anyhow::Result;

use crate::adapter::{
    ClashServer, Inbound, Outbound, ProxyProvider, Router, RuleProvider, V2RayServer,
};
use crate::api::v2ray_stats::V2RayApiServer;
use crate::api::ClashApiServer;
use crate::config::types::{
    ClashApiOptions, DnsOptions, InboundOptions, NtpOptions, OutboundOptions,
    ProxyProviderOptions, RouteOptions, RuleProviderOptions, V2RayApiOptions,
};
use crate::log::{LogFactory, LogFactoryOptions, Logger, TracingLogFactory};
use crate::proxy::inbound::DirectInbound;
use crate::proxy::outbound::{BlockOutbound, DirectOutbound};
use crate::proxy::provider::SubscriptionProvider;
use crate::router::provider::LocalRuleProvider;
use crate::router::DefaultRouter;

use super::context::BoxContext;

pub trait Registry: Send + Sync {
    fn new_log_factory(&self, options: LogFactoryOptions) -> Result<Arc<dyn LogFactory>>;

    fn new_rule_provider(
        &self,
        ctx: &BoxContext,
        logger: Logger,
        tag: &str,
        options: &RuleProviderOptions,
    ) -> Result<Arc<dyn RuleProvider>>;

    fn new_router(
        &self,
        ctx: &BoxContext,
        log_factory: &Arc<dyn LogFactory>,
        route: RouteOptions,
        dns: DnsOptions,
        ntp: NtpOptions,
        inbounds: &[InboundOptions],
    ) -> Result<Arc<dyn Router>>;

    fn new_inbound(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &InboundOptions,
    ) -> Result<Arc<dyn Inbound>>;

    fn new_outbound(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &OutboundOptions,
    ) -> Result<Arc<dyn Outbound>>;

    fn new_proxy_provider(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &ProxyProviderOptions,
    ) -> Result<Arc<dyn ProxyProvider>>;

    fn new_clash_server(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        log_factory: &Arc<dyn LogFactory>,
        options: ClashApiOptions,
    ) -> Result<Arc<dyn ClashServer>>;

    fn new_v2ray_server(
        &self,
        ctx: &BoxContext,
        logger: Logger,
        options: &V2RayApiOptions,
    ) -> Result<Arc<dyn V2RayServer>>;
}

/// 内置组件注册表
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinRegistry;

impl Registry for BuiltinRegistry {
    fn new_log_factory(&self, options: LogFactoryOptions) -> Result<Arc<dyn LogFactory>> {
        Ok(Arc::new(TracingLogFactory::new(options)?))
    }

    fn new_rule_provider(
        &self,
        ctx: &BoxContext,
        logger: Logger,
        tag: &str,
        options: &RuleProviderOptions,
    ) -> Result<Arc<dyn RuleProvider>> {
        Ok(Arc::new(LocalRuleProvider::new(ctx, logger, tag, options)?))
    }

    fn new_router(
        &self,
        ctx: &BoxContext,
        log_factory: &Arc<dyn LogFactory>,
        route: RouteOptions,
        dns: DnsOptions,
        ntp: NtpOptions,
        inbounds: &[InboundOptions],
    ) -> Result<Arc<dyn Router>> {
        let logger = log_factory.new_logger("router");
        Ok(Arc::new(DefaultRouter::new(ctx, logger, route, dns, ntp, inbounds)?))
    }

    fn new_inbound(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &InboundOptions,
    ) -> Result<Arc<dyn Inbound>> {
        match options.inbound_type.as_str() {
            "direct" => Ok(Arc::new(DirectInbound::new(
                ctx,
                router.clone(),
                logger,
                tag,
                options,
            )?)),
            other => anyhow::bail!("unsupported inbound type: {}", other),
        }
    }

    fn new_outbound(
        &self,
        _ctx: &BoxContext,
        _router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &OutboundOptions,
    ) -> Result<Arc<dyn Outbound>> {
        match options.outbound_type.as_str() {
            "direct" => Ok(Arc::new(DirectOutbound::new(logger, tag, options))),
            "block" => Ok(Arc::new(BlockOutbound::new(logger, tag))),
            other => anyhow::bail!("unsupported outbound type: {}", other),
        }
    }

    fn new_proxy_provider(
        &self,
        ctx: &BoxContext,
        _router: &Arc<dyn Router>,
        logger: Logger,
        tag: &str,
        options: &ProxyProviderOptions,
    ) -> Result<Arc<dyn ProxyProvider>> {
        Ok(Arc::new(SubscriptionProvider::new(ctx, logger, tag, options)?))
    }

    fn new_clash_server(
        &self,
        ctx: &BoxContext,
        router: &Arc<dyn Router>,
        log_factory: &Arc<dyn LogFactory>,
        options: ClashApiOptions,
    ) -> Result<Arc<dyn ClashServer>> {
        Ok(Arc::new(ClashApiServer::new(
            ctx,
            router.clone(),
            log_factory.clone(),
            options,
        )?))
    }

    fn new_v2ray_server(
        &self,
        ctx: &BoxContext,
        logger: Logger,
        options: &V2RayApiOptions,
    ) -> Result<Arc<dyn V2RayServer>> {
        Ok(Arc::new(V2RayApiServer::new(ctx, logger, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::reload::reload_channel;

    fn setup() -> (BoxContext, Arc<dyn Router>) {
        let (notifier, _signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        let router: Arc<dyn Router> = Arc::new(
            DefaultRouter::new(
                &ctx,
                Logger::new("router"),
                RouteOptions::default(),
                DnsOptions::default(),
                NtpOptions::default(),
                &[],
            )
            .unwrap(),
        );
        (ctx, router)
    }

    #[test]
    fn builds_known_outbounds() {
        let (ctx, router) = setup();
        let registry = BuiltinRegistry;
        let out = registry
            .new_outbound(&ctx, &router, Logger::new("t"), "b", &OutboundOptions::new("block", ""))
            .unwrap();
        assert_eq!(out.tag(), "b");
        assert_eq!(out.outbound_type(), "block");
    }

    #[test]
    fn rejects_unknown_types() {
        let (ctx, router) = setup();
        let registry = BuiltinRegistry;
        let err = registry
            .new_outbound(&ctx, &router, Logger::new("t"), "x", &OutboundOptions::new("vmess", "x"))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "unsupported outbound type: vmess");

        let inbound = InboundOptions {
            inbound_type: "tun".to_string(),
            ..Default::default()
        };
        assert!(registry
            .new_inbound(&ctx, &router, Logger::new("t"), "0", &inbound)
            .is_err());
    }
}
