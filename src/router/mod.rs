pub mod provider;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::adapter::{
    ClashServer, DefaultOutboundFactory, Inbound, Outbound, ProxyProvider, Router, RuleProvider,
    Service, V2RayServer,
};
use crate::app::context::BoxContext;
use crate::app::tag_or_index;
use crate::config::types::{
    DnsOptions, DnsRule, InboundOptions, NtpOptions, RouteOptions, RouteRule, RuleView,
};
use crate::log::Logger;

#[derive(Default)]
struct RouterState {
    inbounds: HashMap<String, Arc<dyn Inbound>>,
    outbounds: Vec<Arc<dyn Outbound>>,
    outbound_index: HashMap<String, Arc<dyn Outbound>>,
    default_outbound: Option<Arc<dyn Outbound>>,
    proxy_providers: Vec<Arc<dyn ProxyProvider>>,
    rule_providers: Vec<Arc<dyn RuleProvider>>,
    clash_server: Option<Arc<dyn ClashServer>>,
    v2ray_server: Option<Arc<dyn V2RayServer>>,
}

/// 默认路由器：持有最终的路由/DNS 规则，并按 tag 索引入站与出站
pub struct DefaultRouter {
    logger: Logger,
    ctx: BoxContext,
    route: RouteOptions,
    dns: DnsOptions,
    ntp: NtpOptions,
    state: RwLock<RouterState>,
}

impl DefaultRouter {
    pub fn new(
        ctx: &BoxContext,
        logger: Logger,
        route: RouteOptions,
        dns: DnsOptions,
        ntp: NtpOptions,
        inbounds: &[InboundOptions],
    ) -> Result<Self> {
        for (i, rule) in route.rules.iter().enumerate() {
            if let Some(tag) = unresolved_provider(rule) {
                anyhow::bail!("rule[{}] references unknown rule provider {}", i, tag);
            }
        }
        for (i, rule) in dns.rules.iter().enumerate() {
            if let Some(tag) = unresolved_provider(rule) {
                anyhow::bail!("dns rule[{}] references unknown rule provider {}", i, tag);
            }
        }

        let mut seen = Vec::with_capacity(inbounds.len());
        for (i, inbound) in inbounds.iter().enumerate() {
            let tag = tag_or_index(&inbound.tag, i);
            if seen.contains(&tag) {
                anyhow::bail!("duplicate inbound tag: {}", tag);
            }
            seen.push(tag);
        }

        Ok(Self {
            logger,
            ctx: ctx.clone(),
            route,
            dns,
            ntp,
            state: RwLock::new(RouterState::default()),
        })
    }

    pub fn route_rules(&self) -> &[RouteRule] {
        &self.route.rules
    }

    pub fn dns_rules(&self) -> &[DnsRule] {
        &self.dns.rules
    }

    pub fn ntp(&self) -> &NtpOptions {
        &self.ntp
    }

    pub fn inbound(&self, tag: &str) -> Option<Arc<dyn Inbound>> {
        self.state().inbounds.get(tag).cloned()
    }

    pub fn clash_server(&self) -> Option<Arc<dyn ClashServer>> {
        self.state().clash_server.clone()
    }

    pub fn proxy_provider_tags(&self) -> Vec<String> {
        self.state()
            .proxy_providers
            .iter()
            .map(|p| p.tag().to_string())
            .collect()
    }

    pub fn rule_provider_tags(&self) -> Vec<String> {
        self.state()
            .rule_providers
            .iter()
            .map(|p| p.tag().to_string())
            .collect()
    }

    /// Ask the owner of the box to rebuild it. Coalesces with pending
    /// requests.
    pub fn request_reload(&self) -> bool {
        self.logger.debug("reload requested");
        self.ctx.reload.notify()
    }

    fn state(&self) -> std::sync::RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unresolved_provider(rule: &dyn RuleView) -> Option<String> {
    let mut found = rule.rule_providers().first().cloned();
    if found.is_none() && rule.is_logical() {
        rule.for_each_nested(&mut |nested| {
            if found.is_none() {
                found = unresolved_provider(nested);
            }
        });
    }
    found
}

#[async_trait]
impl Service for DefaultRouter {
    async fn start(&self) -> Result<()> {
        let state = self.state();
        self.logger.trace(format!(
            "started with {} route rules, {} dns rules, {} outbounds",
            self.route.rules.len(),
            self.dns.rules.len(),
            state.outbounds.len()
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // 释放对组件与 API 服务的引用，打破循环引用
        *self.state_mut() = RouterState::default();
        self.logger.trace("closed");
        Ok(())
    }
}

impl Router for DefaultRouter {
    fn initialize(
        &self,
        inbounds: &[Arc<dyn Inbound>],
        outbounds: &[Arc<dyn Outbound>],
        default_outbound: &mut DefaultOutboundFactory<'_>,
        proxy_providers: &[Arc<dyn ProxyProvider>],
        rule_providers: &[Arc<dyn RuleProvider>],
    ) -> Result<()> {
        let mut inbound_index = HashMap::with_capacity(inbounds.len());
        for inbound in inbounds {
            inbound_index.insert(inbound.tag().to_string(), inbound.clone());
        }

        let mut outbound_list = outbounds.to_vec();
        let mut outbound_index = HashMap::with_capacity(outbounds.len());
        for outbound in outbounds {
            if outbound_index
                .insert(outbound.tag().to_string(), outbound.clone())
                .is_some()
            {
                anyhow::bail!("duplicate outbound tag: {}", outbound.tag());
            }
        }

        let default = match self.route.final_outbound.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) => outbound_index
                .get(tag)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("default outbound not found: {}", tag))?,
            None => match outbounds.first() {
                Some(first) => first.clone(),
                None => {
                    let created = default_outbound()?;
                    outbound_index.insert(created.tag().to_string(), created.clone());
                    outbound_list.push(created.clone());
                    created
                }
            },
        };

        for (i, rule) in self.route.rules.iter().enumerate() {
            if !rule.outbound.is_empty() && !outbound_index.contains_key(&rule.outbound) {
                anyhow::bail!("rule[{}]: outbound not found: {}", i, rule.outbound);
            }
        }

        self.logger.debug(format!(
            "default outbound: {}/{}",
            default.outbound_type(),
            default.tag()
        ));

        let mut state = self.state_mut();
        state.inbounds = inbound_index;
        state.outbounds = outbound_list;
        state.outbound_index = outbound_index;
        state.default_outbound = Some(default);
        state.proxy_providers = proxy_providers.to_vec();
        state.rule_providers = rule_providers.to_vec();
        Ok(())
    }

    fn set_clash_server(&self, server: Arc<dyn ClashServer>) {
        self.state_mut().clash_server = Some(server);
    }

    fn set_v2ray_server(&self, server: Arc<dyn V2RayServer>) {
        self.state_mut().v2ray_server = Some(server);
    }

    fn v2ray_server(&self) -> Option<Arc<dyn V2RayServer>> {
        self.state().v2ray_server.clone()
    }

    fn default_outbound(&self) -> Option<Arc<dyn Outbound>> {
        self.state().default_outbound.clone()
    }

    fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.state().outbound_index.get(tag).cloned()
    }

    fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.state().outbounds.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::reload::reload_channel;
    use crate::config::types::OutboundOptions;
    use crate::proxy::outbound::{BlockOutbound, DirectOutbound};

    fn context() -> BoxContext {
        let (notifier, _signal) = reload_channel();
        BoxContext::new(None, notifier, None)
    }

    fn route(json: &str) -> RouteOptions {
        serde_json::from_str(json).unwrap()
    }

    fn direct(tag: &str) -> Arc<dyn Outbound> {
        Arc::new(DirectOutbound::new(Logger::new("test"), tag, &OutboundOptions::new("direct", tag)))
    }

    fn block(tag: &str) -> Arc<dyn Outbound> {
        Arc::new(BlockOutbound::new(Logger::new("test"), tag))
    }

    fn router(route: RouteOptions) -> DefaultRouter {
        DefaultRouter::new(
            &context(),
            Logger::new("router"),
            route,
            DnsOptions::default(),
            NtpOptions::default(),
            &[],
        )
        .unwrap()
    }

    #[test]
    fn unresolved_rule_provider_is_rejected() {
        let result = DefaultRouter::new(
            &context(),
            Logger::new("router"),
            route(r#"{"rules": [{"outbound": "a"}, {"type": "logical", "rules": [{"rule_provider": ["missing"]}]}]}"#),
            DnsOptions::default(),
            NtpOptions::default(),
            &[],
        );
        let err = result.err().unwrap().to_string();
        assert_eq!(err, "rule[1] references unknown rule provider missing");
    }

    #[test]
    fn duplicate_inbound_tags_are_rejected() {
        let inbounds: Vec<InboundOptions> =
            serde_json::from_str(r#"[{"type": "direct", "tag": "1"}, {"type": "direct"}]"#).unwrap();
        let result = DefaultRouter::new(
            &context(),
            Logger::new("router"),
            RouteOptions::default(),
            DnsOptions::default(),
            NtpOptions::default(),
            &inbounds,
        );
        assert!(result.is_err());
    }

    #[test]
    fn first_outbound_is_default_without_final() {
        let router = router(RouteOptions::default());
        let mut calls = 0;
        let mut factory = || -> Result<Arc<dyn Outbound>> {
            calls += 1;
            Ok(direct("default"))
        };
        router
            .initialize(&[], &[block("reject"), direct("out")], &mut factory, &[], &[])
            .unwrap();
        assert_eq!(calls, 0);
        assert_eq!(router.default_outbound().unwrap().tag(), "reject");
        assert!(router.outbound("out").is_some());
    }

    #[test]
    fn final_selects_default() {
        let router = router(route(r#"{"final": "out", "rules": [{"outbound": "reject"}]}"#));
        let mut factory = || -> Result<Arc<dyn Outbound>> { Ok(direct("default")) };
        router
            .initialize(&[], &[block("reject"), direct("out")], &mut factory, &[], &[])
            .unwrap();
        assert_eq!(router.default_outbound().unwrap().tag(), "out");
    }

    #[test]
    fn factory_fills_in_when_no_outbounds() {
        let router = router(route(r#"{"rules": [{"outbound": "default"}]}"#));
        let mut calls = 0;
        let mut factory = || -> Result<Arc<dyn Outbound>> {
            calls += 1;
            Ok(direct("default"))
        };
        router.initialize(&[], &[], &mut factory, &[], &[]).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(router.default_outbound().unwrap().tag(), "default");
        assert_eq!(router.outbounds().len(), 1);
    }

    #[test]
    fn unknown_rule_outbound_fails() {
        let router = router(route(r#"{"rules": [{"outbound": "nowhere"}]}"#));
        let mut factory = || -> Result<Arc<dyn Outbound>> { Ok(direct("default")) };
        let err = router
            .initialize(&[], &[direct("out")], &mut factory, &[], &[])
            .unwrap_err();
        assert_eq!(err.to_string(), "rule[0]: outbound not found: nowhere");
    }

    #[test]
    fn duplicate_outbound_tags_fail() {
        let router = router(RouteOptions::default());
        let mut factory = || -> Result<Arc<dyn Outbound>> { Ok(direct("default")) };
        assert!(router
            .initialize(&[], &[direct("a"), block("a")], &mut factory, &[], &[])
            .is_err());
    }

    #[tokio::test]
    async fn close_drops_references() {
        let router = router(RouteOptions::default());
        let mut factory = || -> Result<Arc<dyn Outbound>> { Ok(direct("default")) };
        router.initialize(&[], &[direct("a")], &mut factory, &[], &[]).unwrap();
        router.start().await.unwrap();
        router.close().await.unwrap();
        assert!(router.default_outbound().is_none());
        assert!(router.outbounds().is_empty());
    }

    #[test]
    fn request_reload_coalesces() {
        let (notifier, signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        let router = DefaultRouter::new(
            &ctx,
            Logger::new("router"),
            RouteOptions::default(),
            DnsOptions::default(),
            NtpOptions::default(),
            &[],
        )
        .unwrap();
        assert!(router.request_reload());
        assert!(!router.request_reload());
        assert!(signal.try_recv());
    }
}
