use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// GET /version 响应
#[derive(Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub premium: bool,
}

/// GET /configs 响应
#[derive(Serialize, Deserialize)]
pub struct ConfigsResponse {
    pub mode: String,
    #[serde(rename = "mode-list")]
    pub mode_list: Vec<String>,
}

/// PATCH /configs 请求
#[derive(Deserialize)]
pub struct PatchConfigsRequest {
    #[serde(default)]
    pub mode: Option<String>,
}

/// GET /proxies 响应
#[derive(Serialize, Deserialize)]
pub struct ProxiesResponse {
    pub proxies: HashMap<String, ProxyInfo>,
}

/// 单个代理信息
#[derive(Serialize, Deserialize, Clone)]
pub struct ProxyInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub udp: bool,
    pub history: Vec<serde_json::Value>,
    /// 代理组专有：包含的代理列表
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<String>>,
    /// 代理组专有：当前选中的代理
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
}
