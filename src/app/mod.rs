pub mod clash_mode;
pub mod context;
pub mod debug;
pub mod registry;
pub mod reload;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    Inbound, Outbound, PlatformInterface, ProxyProvider, Router, RuleProvider, Service,
};
use crate::common::error::{BoxError, CloseErrors, RollbackFault};
use crate::config::types::OutboundOptions;
use crate::config::Options;
use crate::log::{LogFactory, LogFactoryOptions, Logger};

use context::BoxContext;
use registry::{BuiltinRegistry, Registry};
use reload::{reload_channel, ReloadSignal};

/// Everything needed to build a [`ProxyBox`].
pub struct BoxOptions {
    pub options: Options,
    /// Parent lifetime; the box derives a child token from it.
    pub context: Option<CancellationToken>,
    pub platform: Option<Arc<dyn PlatformInterface>>,
    pub registry: Arc<dyn Registry>,
    /// Started by [`ProxyBox::post_start`], in insertion order.
    pub post_services: Vec<(String, Arc<dyn Service>)>,
}

impl BoxOptions {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            context: None,
            platform: None,
            registry: Arc::new(BuiltinRegistry),
            post_services: Vec::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_context(mut self, token: CancellationToken) -> Self {
        self.context = Some(token);
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn PlatformInterface>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_post_service(mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.post_services.push((name.into(), service));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxState {
    Created,
    PreStarted,
    Started,
    PostStarted,
    Closed,
}

const STATE_CREATED: u8 = 0;
const STATE_PRE_STARTED: u8 = 1;
const STATE_STARTED: u8 = 2;
const STATE_POST_STARTED: u8 = 3;

/// The orchestrator: owns the router, inbounds, outbounds, providers and
/// control-plane services, and drives them through start and close.
pub struct ProxyBox {
    created_at: Instant,
    ctx: BoxContext,
    router: Arc<dyn Router>,
    inbounds: Vec<Arc<dyn Inbound>>,
    outbounds: Vec<Arc<dyn Outbound>>,
    proxy_providers: Vec<Arc<dyn ProxyProvider>>,
    rule_providers: Vec<Arc<dyn RuleProvider>>,
    log_factory: Arc<dyn LogFactory>,
    logger: Logger,
    pre_services: Vec<(String, Arc<dyn Service>)>,
    post_services: Vec<(String, Arc<dyn Service>)>,
    reload: ReloadSignal,
    state: AtomicU8,
    started_inbounds: AtomicUsize,
    closed: AtomicBool,
}

/// Tag used when the configuration leaves it empty: the item's position.
pub fn tag_or_index(tag: &str, index: usize) -> String {
    if tag.is_empty() {
        index.to_string()
    } else {
        tag.to_string()
    }
}

impl ProxyBox {
    pub async fn new(options: BoxOptions) -> Result<Self, BoxError> {
        let BoxOptions {
            options,
            context,
            platform,
            registry,
            post_services,
        } = options;

        let created_at = Instant::now();
        let (reload_notifier, reload) = reload_channel();
        let ctx = BoxContext::new(context.as_ref(), reload_notifier, platform.clone());

        let experimental = options.experimental.clone().unwrap_or_default();
        debug::apply_debug_options(&experimental.debug.clone().unwrap_or_default());
        let need_clash_api = experimental.clash_api.is_some() || platform.is_some();
        let need_v2ray_api = experimental
            .v2ray_api
            .as_ref()
            .map(|v2ray| !v2ray.listen.is_empty())
            .unwrap_or(false);

        let log_factory = registry
            .new_log_factory(LogFactoryOptions {
                options: options.log.clone().unwrap_or_default(),
                observable: need_clash_api,
                discard_default: platform.is_some(),
                platform: platform.clone(),
            })
            .map_err(|e| BoxError::construction("create log factory", e))?;

        let mut route_options = options.route.clone().unwrap_or_default();
        let mut dns_options = options.dns.clone().unwrap_or_default();
        let mut rule_providers: Vec<Arc<dyn RuleProvider>> =
            Vec::with_capacity(options.rule_providers.len());
        for (i, provider_options) in options.rule_providers.iter().enumerate() {
            let tag = tag_or_index(&provider_options.tag, i);
            let mut provider_options = provider_options.clone();
            provider_options.tag = tag.clone();
            let provider = registry
                .new_rule_provider(
                    &ctx,
                    log_factory.new_logger(&format!("ruleprovider[{}]", tag)),
                    &tag,
                    &provider_options,
                )
                .map_err(|e| BoxError::construction(format!("parse ruleprovider[{}]", i), e))?;

            let has_route_rules = !route_options.rules.is_empty();
            let has_dns_rules = !dns_options.rules.is_empty();
            let (dns_rules, route_rules) = provider
                .format_rule(
                    has_dns_rules.then_some(dns_options.rules.as_slice()),
                    has_route_rules.then_some(route_options.rules.as_slice()),
                )
                .map_err(|e| BoxError::construction(format!("ruleprovider[{}] format rule", i), e))?;
            if has_route_rules {
                route_options.rules = route_rules;
            }
            if has_dns_rules {
                dns_options.rules = dns_rules;
            }
            rule_providers.push(provider);
        }

        let router = registry
            .new_router(
                &ctx,
                &log_factory,
                route_options,
                dns_options,
                options.ntp.clone().unwrap_or_default(),
                &options.inbounds,
            )
            .map_err(|e| BoxError::construction("parse route options", e))?;
        for provider in &rule_providers {
            provider.set_router(router.clone());
        }

        let mut inbounds: Vec<Arc<dyn Inbound>> = Vec::with_capacity(options.inbounds.len());
        for (i, inbound_options) in options.inbounds.iter().enumerate() {
            let tag = tag_or_index(&inbound_options.tag, i);
            let logger = log_factory.new_logger(&format!(
                "inbound/{}[{}]",
                inbound_options.inbound_type, tag
            ));
            let inbound = registry
                .new_inbound(&ctx, &router, logger, &tag, inbound_options)
                .map_err(|e| BoxError::construction(format!("parse inbound[{}]", i), e))?;
            inbounds.push(inbound);
        }

        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::with_capacity(options.outbounds.len());
        for (i, outbound_options) in options.outbounds.iter().enumerate() {
            let tag = tag_or_index(&outbound_options.tag, i);
            let logger = log_factory.new_logger(&format!(
                "outbound/{}[{}]",
                outbound_options.outbound_type, tag
            ));
            let outbound = registry
                .new_outbound(&ctx, &router, logger, &tag, outbound_options)
                .map_err(|e| BoxError::construction(format!("parse outbound[{}]", i), e))?;
            outbounds.push(outbound);
        }

        let mut proxy_providers: Vec<Arc<dyn ProxyProvider>> =
            Vec::with_capacity(options.proxy_providers.len());
        for (i, provider_options) in options.proxy_providers.iter().enumerate() {
            let tag = tag_or_index(&provider_options.tag, i);
            let mut provider_options = provider_options.clone();
            provider_options.tag = tag.clone();
            let provider = registry
                .new_proxy_provider(
                    &ctx,
                    &router,
                    log_factory.new_logger(&format!("proxyprovider[{}]", tag)),
                    &tag,
                    &provider_options,
                )
                .map_err(|e| BoxError::construction(format!("parse proxyprovider[{}]", i), e))?;
            let provided = provider.start_get_outbounds().await.map_err(|e| {
                BoxError::construction(format!("get outbounds from proxyprovider[{}]", i), e)
            })?;
            for (j, outbound_options) in provided.iter().enumerate() {
                let out_tag = if outbound_options.tag.is_empty() {
                    format!("{}/{}", provider.tag(), j)
                } else {
                    outbound_options.tag.clone()
                };
                let logger = log_factory.new_logger(&format!(
                    "outbound/{}[{}]",
                    outbound_options.outbound_type, out_tag
                ));
                let outbound = registry
                    .new_outbound(&ctx, &router, logger, &out_tag, outbound_options)
                    .map_err(|e| {
                        BoxError::construction(
                            format!("parse proxyprovider[{}] outbound[{}]", provider.tag(), j),
                            e,
                        )
                    })?;
                outbounds.push(outbound);
            }
            proxy_providers.push(provider);
        }

        let mut default_outbound: Option<Arc<dyn Outbound>> = None;
        {
            let mut factory = || -> anyhow::Result<Arc<dyn Outbound>> {
                if let Some(outbound) = &default_outbound {
                    return Ok(outbound.clone());
                }
                let outbound = registry.new_outbound(
                    &ctx,
                    &router,
                    log_factory.new_logger("outbound/direct"),
                    "default",
                    &OutboundOptions::new("direct", "default"),
                )?;
                default_outbound = Some(outbound.clone());
                Ok(outbound)
            };
            router
                .initialize(
                    &inbounds,
                    &outbounds,
                    &mut factory,
                    &proxy_providers,
                    &rule_providers,
                )
                .map_err(|e| BoxError::construction("initialize router", e))?;
        }
        if let Some(outbound) = default_outbound {
            outbounds.push(outbound);
        }

        if let Some(platform) = &platform {
            platform
                .initialize(router.clone())
                .await
                .map_err(|e| BoxError::construction("initialize platform interface", e))?;
        }

        let mut pre_services: Vec<(String, Arc<dyn Service>)> = Vec::new();
        if need_clash_api {
            let mut clash_options = experimental.clash_api.clone().unwrap_or_default();
            clash_options.mode_list = clash_mode::calculate_clash_mode_list(&options);
            let server = registry
                .new_clash_server(&ctx, &router, &log_factory, clash_options)
                .map_err(|e| BoxError::construction("create clash api server", e))?;
            router.set_clash_server(server.clone());
            pre_services.push(("clash api".to_string(), server.into_service()));
        }
        if need_v2ray_api {
            let v2ray_options = experimental.v2ray_api.clone().unwrap_or_default();
            let server = registry
                .new_v2ray_server(&ctx, log_factory.new_logger("v2ray-api"), &v2ray_options)
                .map_err(|e| BoxError::construction("create v2ray api server", e))?;
            router.set_v2ray_server(server.clone());
            pre_services.push(("v2ray api".to_string(), server.into_service()));
        }

        Ok(Self {
            created_at,
            ctx,
            router,
            inbounds,
            outbounds,
            proxy_providers,
            rule_providers,
            logger: log_factory.logger(),
            log_factory,
            pre_services,
            post_services,
            reload,
            state: AtomicU8::new(STATE_CREATED),
            started_inbounds: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Run pre-start hooks, start outbounds, then the router. Rolls the
    /// whole box back on failure.
    pub async fn pre_start(&self) -> Result<(), BoxError> {
        if self.is_closed() {
            return Err(BoxError::AlreadyClosed);
        }
        if let Err(err) = self.pre_start_inner().await {
            return Err(self.rollback(err).await.resolve());
        }
        self.logger.info(format!(
            "proxybox pre-started ({:.2}s)",
            self.created_at.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    /// Pre-start (unless already done), then start pre-services, proxy
    /// providers, rule providers and finally inbounds. Rolls the whole
    /// box back on failure.
    pub async fn start(&self) -> Result<(), BoxError> {
        if self.is_closed() {
            return Err(BoxError::AlreadyClosed);
        }
        if let Err(err) = self.start_inner().await {
            return Err(self.rollback(err).await.resolve());
        }
        self.logger.info(format!(
            "proxybox started ({:.2}s)",
            self.created_at.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    async fn pre_start_inner(&self) -> Result<(), BoxError> {
        for (name, service) in &self.pre_services {
            if let Some(pre_starter) = service.as_pre_starter() {
                self.logger.trace(format!("pre-start {}", name));
                pre_starter
                    .pre_start()
                    .await
                    .map_err(|e| BoxError::start(format!("pre-start {}", name), e))?;
            }
        }
        self.start_outbounds().await?;
        self.logger.trace("starting router");
        self.router
            .start()
            .await
            .map_err(|e| BoxError::start("start router", e))?;
        self.state.store(STATE_PRE_STARTED, Ordering::Release);
        Ok(())
    }

    async fn start_outbounds(&self) -> Result<(), BoxError> {
        for (i, outbound) in self.outbounds.iter().enumerate() {
            let tag = tag_or_index(outbound.tag(), i);
            self.logger.trace(format!(
                "initializing outbound/{}[{}]",
                outbound.outbound_type(),
                tag
            ));
            outbound.start().await.map_err(|e| {
                BoxError::start(
                    format!("initialize outbound/{}[{}]", outbound.outbound_type(), tag),
                    e,
                )
            })?;
        }
        Ok(())
    }

    async fn start_inner(&self) -> Result<(), BoxError> {
        if self.state.load(Ordering::Acquire) < STATE_PRE_STARTED {
            self.pre_start_inner().await?;
        }
        for (name, service) in &self.pre_services {
            self.logger.trace(format!("starting {}", name));
            service
                .start()
                .await
                .map_err(|e| BoxError::start(format!("start {}", name), e))?;
        }
        for provider in &self.proxy_providers {
            self.logger
                .trace(format!("starting proxyprovider {}", provider.tag()));
            provider.start().await.map_err(|e| {
                BoxError::start(format!("start proxyprovider {}", provider.tag()), e)
            })?;
        }
        for provider in &self.rule_providers {
            self.logger
                .trace(format!("starting ruleprovider {}", provider.tag()));
            provider.start().await.map_err(|e| {
                BoxError::start(format!("start ruleprovider {}", provider.tag()), e)
            })?;
        }
        for (i, inbound) in self.inbounds.iter().enumerate() {
            let tag = tag_or_index(inbound.tag(), i);
            self.logger.trace(format!(
                "initializing inbound/{}[{}]",
                inbound.inbound_type(),
                tag
            ));
            inbound.start().await.map_err(|e| {
                BoxError::start(
                    format!("initialize inbound/{}[{}]", inbound.inbound_type(), tag),
                    e,
                )
            })?;
            self.started_inbounds.fetch_add(1, Ordering::AcqRel);
        }
        self.state.store(STATE_STARTED, Ordering::Release);
        Ok(())
    }

    /// Start post-services, then run the post-start hook of every outbound
    /// that has one. Not chained from [`start`](Self::start).
    pub async fn post_start(&self) -> Result<(), BoxError> {
        if self.is_closed() {
            return Err(BoxError::AlreadyClosed);
        }
        for (name, service) in &self.post_services {
            self.logger.trace(format!("starting {}", name));
            service
                .start()
                .await
                .map_err(|e| BoxError::start(format!("start {}", name), e))?;
        }
        for (i, outbound) in self.outbounds.iter().enumerate() {
            if let Some(post_starter) = outbound.as_post_starter() {
                let tag = tag_or_index(outbound.tag(), i);
                self.logger.trace(format!(
                    "post-starting outbound/{}[{}]",
                    outbound.outbound_type(),
                    tag
                ));
                post_starter.post_start().await.map_err(|e| {
                    BoxError::start(
                        format!("post-start outbound/{}[{}]", outbound.outbound_type(), tag),
                        e,
                    )
                })?;
            }
        }
        self.state.store(STATE_POST_STARTED, Ordering::Release);
        Ok(())
    }

    /// Tear everything down, exactly once. Every subsystem is closed even
    /// when earlier ones fail; all failures come back together.
    pub async fn close(&self) -> Result<(), BoxError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BoxError::AlreadyClosed);
        }

        let mut errors = CloseErrors::new();
        for (name, service) in &self.post_services {
            self.logger.trace(format!("closing {}", name));
            errors.append(|| format!("close {}", name), service.close().await);
        }
        for provider in &self.rule_providers {
            self.logger
                .trace(format!("closing ruleprovider {}", provider.tag()));
            errors.append(
                || format!("close ruleprovider {}", provider.tag()),
                provider.close().await,
            );
        }
        for provider in &self.proxy_providers {
            self.logger
                .trace(format!("closing proxyprovider {}", provider.tag()));
            errors.append(
                || format!("close proxyprovider {}", provider.tag()),
                provider.close().await,
            );
        }
        // 未启动的入站没有需要释放的监听
        let started_inbounds = self.started_inbounds.load(Ordering::Acquire);
        for (i, inbound) in self.inbounds.iter().take(started_inbounds).enumerate() {
            self.logger
                .trace(format!("closing inbound/{}[{}]", inbound.inbound_type(), i));
            errors.append(
                || format!("close inbound/{}[{}]", inbound.inbound_type(), i),
                inbound.close().await,
            );
        }
        for (i, outbound) in self.outbounds.iter().enumerate() {
            self.logger
                .trace(format!("closing outbound/{}[{}]", outbound.outbound_type(), i));
            errors.append(
                || format!("close outbound/{}[{}]", outbound.outbound_type(), i),
                outbound.close().await,
            );
        }
        self.logger.trace("closing router");
        errors.append(|| "close router".to_string(), self.router.close().await);
        for (name, service) in &self.pre_services {
            self.logger.trace(format!("closing {}", name));
            errors.append(|| format!("close {}", name), service.close().await);
        }
        self.logger.trace("closing log factory");
        errors.append(|| "close log factory".to_string(), self.log_factory.close());

        self.ctx.token.cancel();
        errors.into_result().map_err(BoxError::Close)
    }

    /// Close a box whose start failed. A panic inside `close` is trapped
    /// and kept next to the original error instead of replacing it.
    async fn rollback(&self, cause: BoxError) -> Rollback {
        let fault = match AssertUnwindSafe(self.close()).catch_unwind().await {
            Ok(Ok(())) | Ok(Err(BoxError::AlreadyClosed)) => None,
            Ok(Err(close_err)) => {
                self.logger
                    .warn(format!("close after failed start: {}", close_err));
                None
            }
            Err(payload) => Some(payload),
        };
        Rollback { cause, fault }
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    /// Coalescing reload requests posted by the router, providers or
    /// control API. Reacting to them is up to the caller.
    pub fn reload_signal(&self) -> &ReloadSignal {
        &self.reload
    }

    pub fn inbounds(&self) -> &[Arc<dyn Inbound>] {
        &self.inbounds
    }

    pub fn outbounds(&self) -> &[Arc<dyn Outbound>] {
        &self.outbounds
    }

    pub fn proxy_providers(&self) -> &[Arc<dyn ProxyProvider>] {
        &self.proxy_providers
    }

    pub fn rule_providers(&self) -> &[Arc<dyn RuleProvider>] {
        &self.rule_providers
    }

    pub fn pre_service_names(&self) -> Vec<&str> {
        self.pre_services.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn log_factory(&self) -> Arc<dyn LogFactory> {
        self.log_factory.clone()
    }

    pub fn context(&self) -> &BoxContext {
        &self.ctx
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BoxState {
        if self.is_closed() {
            return BoxState::Closed;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_PRE_STARTED => BoxState::PreStarted,
            STATE_STARTED => BoxState::Started,
            STATE_POST_STARTED => BoxState::PostStarted,
            _ => BoxState::Created,
        }
    }
}

/// Outcome of closing a box after a failed start: the start error, and
/// the panic payload if closing itself panicked.
struct Rollback {
    cause: BoxError,
    fault: Option<Box<dyn Any + Send>>,
}

impl Rollback {
    /// Hand back the start error, or log it and re-raise the close fault.
    fn resolve(self) -> BoxError {
        let Some(payload) = self.fault else {
            return self.cause;
        };
        let message = RollbackFault::describe_payload(payload.as_ref());
        tracing::error!(error = %self.cause, "origin error");
        tracing::error!(fault = %message, "panic on early close");
        std::panic::panic_any(RollbackFault {
            message,
            origin: self.cause.to_string(),
        })
    }
}
