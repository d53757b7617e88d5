//! 规则提供者
//!
//! 从本地文件（或远程下载并缓存）加载规则集，在构建阶段把规则集合并进
//! 引用它的路由/DNS 规则中。

use std::fs;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Router, RuleProvider, Service};
use crate::app::context::BoxContext;
use crate::config::types::{
    DnsRule, RouteRule, RuleProviderOptions, RuleView, PROVIDER_MATCHER_KEYS,
};
use crate::log::Logger;

/// 规则集中的域名规则
#[derive(Debug, Clone, PartialEq)]
pub enum DomainRule {
    Full(String),
    Suffix(String),
    Keyword(String),
}

/// 规则集数据
#[derive(Debug, Default)]
pub struct RuleSetData {
    pub domain_rules: Vec<DomainRule>,
    pub ip_cidrs: Vec<IpNet>,
}

impl RuleSetData {
    pub fn parse(behavior: &str, content: &str) -> Result<Self> {
        match behavior {
            "domain" => parse_domain_rules(content),
            "ipcidr" => parse_ipcidr_rules(content),
            "classical" => parse_classical_rules(content),
            other => anyhow::bail!("unsupported rule-provider behavior '{}'", other),
        }
    }

    /// 检查域名是否匹配任一域名规则
    pub fn matches_domain(&self, domain: &str) -> bool {
        let domain_lower = domain.to_lowercase();
        self.domain_rules.iter().any(|rule| match rule {
            DomainRule::Full(d) => domain_lower == *d,
            DomainRule::Suffix(suffix) => {
                domain_lower == *suffix || domain_lower.ends_with(&format!(".{}", suffix))
            }
            DomainRule::Keyword(keyword) => domain_lower.contains(keyword.as_str()),
        })
    }

    /// 检查 IP 是否匹配任一 CIDR 规则
    pub fn matches_ip(&self, ip: std::net::IpAddr) -> bool {
        self.ip_cidrs.iter().any(|net| net.contains(&ip))
    }

    /// Matcher lists this rule set contributes, keyed like rule matchers.
    /// Empty lists are left out.
    pub fn matchers(&self) -> Vec<(&'static str, Vec<String>)> {
        let mut domain = Vec::new();
        let mut suffix = Vec::new();
        let mut keyword = Vec::new();
        for rule in &self.domain_rules {
            match rule {
                DomainRule::Full(d) => domain.push(d.clone()),
                DomainRule::Suffix(s) => suffix.push(s.clone()),
                DomainRule::Keyword(k) => keyword.push(k.clone()),
            }
        }
        let cidrs = self.ip_cidrs.iter().map(ToString::to_string).collect();
        PROVIDER_MATCHER_KEYS
            .into_iter()
            .zip([domain, suffix, keyword, cidrs])
            .filter(|(_, values)| !values.is_empty())
            .collect()
    }
}

/// 内置规则提供者（local / remote）
pub struct LocalRuleProvider {
    tag: String,
    options: RuleProviderOptions,
    logger: Logger,
    ctx: BoxContext,
    data: Arc<RwLock<Arc<RuleSetData>>>,
    content: Arc<Mutex<String>>,
    router: RwLock<Option<Arc<dyn Router>>>,
    token: CancellationToken,
}

impl LocalRuleProvider {
    pub fn new(
        ctx: &BoxContext,
        logger: Logger,
        tag: &str,
        options: &RuleProviderOptions,
    ) -> Result<Self> {
        let content = match options.provider_type.as_str() {
            "local" => {
                if options.path.is_empty() {
                    anyhow::bail!("missing path");
                }
                fs::read_to_string(&options.path)
                    .map_err(|e| anyhow::anyhow!("read {}: {}", options.path, e))?
            }
            "remote" => load_remote(&logger, options)?,
            other => anyhow::bail!("unknown rule provider type: {}", other),
        };
        let data = RuleSetData::parse(&options.behavior, &content)?;
        logger.info(format!(
            "loaded {} domain rules, {} cidrs ({})",
            data.domain_rules.len(),
            data.ip_cidrs.len(),
            options.behavior
        ));

        Ok(Self {
            tag: tag.to_string(),
            options: options.clone(),
            logger,
            ctx: ctx.clone(),
            data: Arc::new(RwLock::new(Arc::new(data))),
            content: Arc::new(Mutex::new(content)),
            router: RwLock::new(None),
            token: ctx.token.child_token(),
        })
    }

    pub fn data(&self) -> Arc<RuleSetData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn router(&self) -> Option<Arc<dyn Router>> {
        self.router.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn format_rules<R: RuleView + Clone>(&self, rules: &[R], data: &RuleSetData) -> Vec<R> {
        rules
            .iter()
            .cloned()
            .map(|mut rule| {
                merge_into(&mut rule, &self.tag, data);
                rule
            })
            .collect()
    }
}

/// Merge `data` into `rule` (and nested logical rules) wherever the rule
/// references `tag`, dropping the reference.
fn merge_into(rule: &mut dyn RuleView, tag: &str, data: &RuleSetData) {
    if rule.is_logical() {
        rule.for_each_nested_mut(&mut |nested| merge_into(nested, tag, data));
    }
    let references = rule.rule_provider_mut();
    let before = references.len();
    references.retain(|r| r != tag);
    if references.len() == before {
        return;
    }
    let matchers = rule.matchers_mut();
    for (key, values) in data.matchers() {
        append_unique(matchers, key, values);
    }
}

fn append_unique(matchers: &mut Map<String, Value>, key: &str, values: Vec<String>) {
    let entry = matchers
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::String(single) = entry {
        let single = std::mem::take(single);
        *entry = Value::Array(vec![Value::String(single)]);
    }
    if let Value::Array(list) = entry {
        for value in values {
            let value = Value::String(value);
            if !list.contains(&value) {
                list.push(value);
            }
        }
    }
}

#[async_trait]
impl Service for LocalRuleProvider {
    async fn start(&self) -> Result<()> {
        let Some(url) = self.options.url.clone() else {
            return Ok(());
        };
        if self.options.provider_type != "remote" || self.options.update_interval == 0 {
            return Ok(());
        }

        let interval = Duration::from_secs(self.options.update_interval);
        let token = self.token.clone();
        let ctx = self.ctx.clone();
        let logger = self.logger.clone();
        let content = self.content.clone();
        let path = self.options.path.clone();
        let behavior = self.options.behavior.clone();
        let data = self.data.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                ctx.pause.wait_active().await;
                match fetch(&url).await {
                    Ok(fresh) => {
                        let changed = {
                            let mut current = content.lock().unwrap_or_else(PoisonError::into_inner);
                            let changed = *current != fresh;
                            if changed {
                                *current = fresh.clone();
                            }
                            changed
                        };
                        if !changed {
                            continue;
                        }
                        if !path.is_empty() {
                            if let Err(e) = fs::write(&path, &fresh) {
                                logger.warn(format!("write cache {}: {}", path, e));
                            }
                        }
                        match RuleSetData::parse(&behavior, &fresh) {
                            Ok(parsed) => {
                                *data.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(parsed);
                                logger.info("rule set changed, requesting reload");
                                ctx.reload.notify();
                            }
                            Err(e) => logger.warn(format!("parse refreshed rule set: {:#}", e)),
                        }
                    }
                    Err(e) => logger.warn(format!("refresh failed: {:#}", e)),
                }
            }
            logger.trace("refresh loop stopped");
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

impl RuleProvider for LocalRuleProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn format_rule(
        &self,
        dns_rules: Option<&[DnsRule]>,
        route_rules: Option<&[RouteRule]>,
    ) -> Result<(Vec<DnsRule>, Vec<RouteRule>)> {
        let data = self.data();
        let dns = dns_rules
            .map(|rules| self.format_rules(rules, &data))
            .unwrap_or_default();
        let route = route_rules
            .map(|rules| self.format_rules(rules, &data))
            .unwrap_or_default();
        Ok((dns, route))
    }

    fn set_router(&self, router: Arc<dyn Router>) {
        *self.router.write().unwrap_or_else(PoisonError::into_inner) = Some(router);
    }
}

/// Cached copy when fresh enough, otherwise download (falling back to a
/// stale cache on failure).
fn load_remote(logger: &Logger, options: &RuleProviderOptions) -> Result<String> {
    let url = options
        .url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("remote rule provider requires url"))?;

    let cached = (!options.path.is_empty())
        .then(|| fs::read_to_string(&options.path).ok())
        .flatten();
    let stale = match fs::metadata(&options.path).and_then(|m| m.modified()) {
        Ok(modified) => {
            modified.elapsed().unwrap_or_default().as_secs() > options.update_interval
        }
        Err(_) => true,
    };
    if let (Some(content), false) = (&cached, stale) {
        return Ok(content.clone());
    }

    logger.info(format!("downloading {}", url));
    let downloaded = join_download(std::thread::spawn(move || download_provider(&url)));
    match downloaded {
        Ok(content) => {
            if !options.path.is_empty() {
                if let Some(parent) = std::path::Path::new(&options.path).parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&options.path, &content)?;
            }
            Ok(content)
        }
        Err(e) => match cached {
            Some(content) => {
                logger.warn(format!("download failed, using cached version: {:#}", e));
                Ok(content)
            }
            None => Err(e.context("download failed and no cache available")),
        },
    }
}

/// reqwest::blocking 会在 runtime 上下文中 panic，所以下载放在独立线程；
/// 调用方仍同步等待。多线程 runtime 下先让出当前 worker 上的其他任务。
fn join_download(handle: std::thread::JoinHandle<Result<String>>) -> Result<String> {
    let join = move || {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("download thread panicked"))
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(join)?
        }
        _ => join()?,
    }
}

fn download_provider(url: &str) -> Result<String> {
    let response = reqwest::blocking::get(url)
        .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {} for {}", response.status(), url);
    }
    response
        .text()
        .map_err(|e| anyhow::anyhow!("failed to read response body: {}", e))
}

async fn fetch(url: &str) -> Result<String> {
    let response = reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(30))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?)
}

fn clean_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line == "payload:" {
        return None;
    }
    // 剥离 YAML 列表前缀和引号
    let line = line.strip_prefix("- ").unwrap_or(line);
    let line = line.trim_matches('\'').trim_matches('"');
    (!line.is_empty()).then_some(line)
}

/// 解析域名行为的规则文件
///
/// 支持格式:
/// - 纯文本: 每行一个域名，默认后缀匹配
/// - Clash YAML payload: `- '+.example.com'` 或 `- 'example.com'`
/// - 前缀语法: `domain:`, `domain_suffix:`, `domain_keyword:`, `+.`
fn parse_domain_rules(content: &str) -> Result<RuleSetData> {
    let domain_rules = content
        .lines()
        .filter_map(clean_line)
        .map(|line| {
            if let Some(domain) = line.strip_prefix("domain:") {
                DomainRule::Full(domain.to_lowercase())
            } else if let Some(suffix) = line.strip_prefix("domain_suffix:") {
                DomainRule::Suffix(suffix.to_lowercase())
            } else if let Some(keyword) = line.strip_prefix("domain_keyword:") {
                DomainRule::Keyword(keyword.to_lowercase())
            } else if let Some(suffix) = line.strip_prefix("+.") {
                DomainRule::Suffix(suffix.to_lowercase())
            } else {
                DomainRule::Suffix(line.to_lowercase())
            }
        })
        .collect();
    Ok(RuleSetData {
        domain_rules,
        ip_cidrs: Vec::new(),
    })
}

fn parse_ipcidr_rules(content: &str) -> Result<RuleSetData> {
    let ip_cidrs = content
        .lines()
        .filter_map(clean_line)
        .map(|line| {
            line.parse::<IpNet>()
                .map_err(|e| anyhow::anyhow!("invalid CIDR '{}': {}", line, e))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RuleSetData {
        domain_rules: Vec::new(),
        ip_cidrs,
    })
}

/// 解析 classical 行为的规则文件
///
/// 每行格式: `RULE-TYPE,value[,extra]`
/// 支持: DOMAIN, DOMAIN-SUFFIX, DOMAIN-KEYWORD, IP-CIDR, IP-CIDR6
fn parse_classical_rules(content: &str) -> Result<RuleSetData> {
    let mut data = RuleSetData::default();
    for line in content.lines().filter_map(clean_line) {
        let Some((kind, rest)) = line.split_once(',') else {
            continue;
        };
        let value = rest.split(',').next().unwrap_or(rest);
        match kind {
            "DOMAIN" => data.domain_rules.push(DomainRule::Full(value.to_lowercase())),
            "DOMAIN-SUFFIX" => data.domain_rules.push(DomainRule::Suffix(value.to_lowercase())),
            "DOMAIN-KEYWORD" => data.domain_rules.push(DomainRule::Keyword(value.to_lowercase())),
            "IP-CIDR" | "IP-CIDR6" => {
                let cidr: IpNet = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid CIDR '{}': {}", value, e))?;
                data.ip_cidrs.push(cidr);
            }
            // 跳过不支持的规则类型
            _ => {}
        }
    }
    Ok(data)
}
