use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 顶层配置
///
/// Every section is optional; list items without an explicit `tag` get
/// their zero-based position as tag during box construction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Options {
    #[serde(default)]
    pub log: Option<LogOptions>,
    #[serde(default)]
    pub dns: Option<DnsOptions>,
    #[serde(default)]
    pub route: Option<RouteOptions>,
    #[serde(default)]
    pub ntp: Option<NtpOptions>,
    #[serde(default)]
    pub inbounds: Vec<InboundOptions>,
    #[serde(default)]
    pub outbounds: Vec<OutboundOptions>,
    #[serde(default, alias = "proxy-providers")]
    pub proxy_providers: Vec<ProxyProviderOptions>,
    #[serde(default, alias = "rule-providers")]
    pub rule_providers: Vec<RuleProviderOptions>,
    #[serde(default)]
    pub experimental: Option<ExperimentalOptions>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogOptions {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub timestamp: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            level: default_log_level(),
            timestamp: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DnsOptions {
    #[serde(default)]
    pub servers: Vec<Value>,
    #[serde(default)]
    pub rules: Vec<DnsRule>,
    #[serde(default, rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_server: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteOptions {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    /// 默认出站 tag
    #[serde(default, rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_outbound: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NtpOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

/// Matcher keys a rule provider is allowed to merge into a rule.
pub const PROVIDER_MATCHER_KEYS: [&str; 4] = ["domain", "domain_suffix", "domain_keyword", "ip_cidr"];

/// Route rule. `type: logical` rules nest further rules under `rules`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RouteRule {
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub rule_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_provider: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub outbound: String,
    #[serde(flatten)]
    pub matchers: Map<String, Value>,
}

/// DNS rule, same shape as [`RouteRule`] but targeting a DNS server tag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DnsRule {
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub rule_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<DnsRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_provider: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(flatten)]
    pub matchers: Map<String, Value>,
}

/// Shared view over route and DNS rules, used by rule providers and the
/// clash mode calculation.
pub trait RuleView {
    fn is_logical(&self) -> bool;
    fn clash_mode(&self) -> Option<&str>;
    fn rule_providers(&self) -> &[String];
    fn rule_provider_mut(&mut self) -> &mut Vec<String>;
    fn matchers_mut(&mut self) -> &mut Map<String, Value>;
    fn for_each_nested(&self, f: &mut dyn FnMut(&dyn RuleView));
    fn for_each_nested_mut(&mut self, f: &mut dyn FnMut(&mut dyn RuleView));
}

macro_rules! impl_rule_view {
    ($ty:ty) => {
        impl RuleView for $ty {
            fn is_logical(&self) -> bool {
                self.rule_type == "logical"
            }

            fn clash_mode(&self) -> Option<&str> {
                self.clash_mode.as_deref()
            }

            fn rule_providers(&self) -> &[String] {
                &self.rule_provider
            }

            fn rule_provider_mut(&mut self) -> &mut Vec<String> {
                &mut self.rule_provider
            }

            fn matchers_mut(&mut self) -> &mut Map<String, Value> {
                &mut self.matchers
            }

            fn for_each_nested(&self, f: &mut dyn FnMut(&dyn RuleView)) {
                for rule in &self.rules {
                    f(rule);
                }
            }

            fn for_each_nested_mut(&mut self, f: &mut dyn FnMut(&mut dyn RuleView)) {
                for rule in &mut self.rules {
                    f(rule);
                }
            }
        }
    };
}

impl_rule_view!(RouteRule);
impl_rule_view!(DnsRule);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InboundOptions {
    #[serde(rename = "type")]
    pub inbound_type: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct OutboundOptions {
    #[serde(rename = "type")]
    pub outbound_type: String,
    #[serde(default)]
    pub tag: String,
    /// 连接超时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundOptions {
    pub fn new(outbound_type: &str, tag: &str) -> Self {
        Self {
            outbound_type: outbound_type.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyProviderOptions {
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 刷新间隔（秒），0 表示不刷新
    #[serde(default)]
    pub update_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleProviderOptions {
    #[serde(default)]
    pub tag: String,
    /// `local` or `remote`
    #[serde(rename = "type", default = "default_rule_provider_type")]
    pub provider_type: String,
    /// `domain`, `ipcidr` or `classical`
    #[serde(default = "default_behavior")]
    pub behavior: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 刷新间隔（秒）
    #[serde(default = "default_rule_provider_interval")]
    pub update_interval: u64,
}

fn default_rule_provider_type() -> String {
    "local".to_string()
}

fn default_behavior() -> String {
    "domain".to_string()
}

fn default_rule_provider_interval() -> u64 {
    86400
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExperimentalOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_api: Option<ClashApiOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2ray_api: Option<V2RayApiOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugOptions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClashApiOptions {
    #[serde(default)]
    pub external_controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<String>,
    /// 由 box 在构建时计算，不从配置读取
    #[serde(skip)]
    pub mode_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct V2RayApiOptions {
    #[serde(default)]
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<V2RayStatsOptions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct V2RayStatsOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub inbounds: Vec<String>,
    #[serde(default)]
    pub outbounds: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
}

/// Process-wide runtime tuning, applied once while building a box.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebugOptions {
    /// Address space limit in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<u64>,
    #[serde(default)]
    pub backtrace: bool,
}
