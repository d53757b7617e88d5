//! 订阅代理提供者
//!
//! 从 HTTP 订阅或本地文件读取 `outbounds` 列表，支持 ETag / Last-Modified
//! 条件请求，内容变化时请求重载。

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::adapter::{ProxyProvider, Service};
use crate::app::context::BoxContext;
use crate::app::tag_or_index;
use crate::config::types::{OutboundOptions, ProxyProviderOptions};
use crate::log::Logger;

const DEFAULT_USER_AGENT: &str = concat!("proxybox/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default)]
struct FetchState {
    etag: Option<String>,
    last_modified: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct ProviderDocument {
    #[serde(default)]
    outbounds: Vec<OutboundOptions>,
}

/// Parse provider content: sing-box style JSON or YAML carrying an
/// `outbounds` list.
pub fn parse_provider_content(content: &str) -> Result<Vec<OutboundOptions>> {
    let trimmed = content.trim_start();
    let document: ProviderDocument = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).context("decode json provider content")?
    } else {
        serde_yml::from_str(content).context("decode yaml provider content")?
    };
    if document.outbounds.is_empty() {
        anyhow::bail!("no outbounds in provider content");
    }
    Ok(document.outbounds)
}

pub struct SubscriptionProvider {
    tag: String,
    logger: Logger,
    ctx: BoxContext,
    options: ProxyProviderOptions,
    client: reqwest::Client,
    state: Arc<Mutex<FetchState>>,
    outbounds: RwLock<Vec<OutboundOptions>>,
    token: CancellationToken,
}

impl SubscriptionProvider {
    pub fn new(
        ctx: &BoxContext,
        logger: Logger,
        tag: &str,
        options: &ProxyProviderOptions,
    ) -> Result<Self> {
        let has_url = options.url.as_deref().is_some_and(|u| !u.is_empty());
        let has_path = options.path.as_deref().is_some_and(|p| !p.is_empty());
        if !has_url && !has_path {
            anyhow::bail!("missing url or path");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            tag: tag.to_string(),
            logger,
            ctx: ctx.clone(),
            options: options.clone(),
            client,
            state: Arc::new(Mutex::new(FetchState::default())),
            outbounds: RwLock::new(Vec::new()),
            token: ctx.token.child_token(),
        })
    }

    /// Outbounds produced by the last successful load.
    pub fn outbounds(&self) -> Vec<OutboundOptions> {
        self.outbounds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn namespaced(&self, outbounds: Vec<OutboundOptions>) -> Vec<OutboundOptions> {
        outbounds
            .into_iter()
            .enumerate()
            .map(|(i, mut outbound)| {
                outbound.tag = format!("{}/{}", self.tag, tag_or_index(&outbound.tag, i));
                outbound
            })
            .collect()
    }
}

#[async_trait]
impl Service for SubscriptionProvider {
    async fn start(&self) -> Result<()> {
        if self.options.update_interval == 0 {
            return Ok(());
        }
        let interval = Duration::from_secs(self.options.update_interval);
        let source = Source {
            client: self.client.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
        };
        let token = self.token.clone();
        let ctx = self.ctx.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if ctx.pause.is_paused() {
                    logger.trace("paused, skip refresh");
                    continue;
                }
                match source.load().await {
                    Ok(Loaded { changed: true, content }) => {
                        match parse_provider_content(&content) {
                            Ok(outbounds) => {
                                logger.info(format!(
                                    "subscription changed ({} outbounds), requesting reload",
                                    outbounds.len()
                                ));
                                ctx.reload.notify();
                            }
                            Err(e) => logger.warn(format!("ignore refreshed content: {:#}", e)),
                        }
                    }
                    Ok(_) => logger.trace("subscription unchanged"),
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

#[async_trait]
impl ProxyProvider for SubscriptionProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn start_get_outbounds(&self) -> Result<Vec<OutboundOptions>> {
        let source = Source {
            client: self.client.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
        };
        let loaded = source.load().await?;
        let outbounds = self.namespaced(parse_provider_content(&loaded.content)?);
        self.logger
            .info(format!("loaded {} outbounds", outbounds.len()));
        *self.outbounds.write().unwrap_or_else(PoisonError::into_inner) = outbounds.clone();
        Ok(outbounds)
    }
}

struct Loaded {
    changed: bool,
    content: String,
}

struct Source {
    client: reqwest::Client,
    options: ProxyProviderOptions,
    state: Arc<Mutex<FetchState>>,
}

impl Source {
    /// Load the current content: HTTP when a url is set (falling back to the
    /// cache file on failure), the file otherwise.
    async fn load(&self) -> Result<Loaded> {
        let path = self.options.path.as_deref().filter(|p| !p.is_empty());
        let content = match self.options.url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => match self.fetch(url).await {
                Ok(content) => {
                    if let Some(path) = path {
                        tokio::fs::write(path, &content)
                            .await
                            .with_context(|| format!("write cache {}", path))?;
                    }
                    content
                }
                Err(e) => match path {
                    Some(path) => tokio::fs::read_to_string(path)
                        .await
                        .map_err(|_| e)
                        .context("fetch failed and no cache available")?,
                    None => return Err(e),
                },
            },
            None => {
                let path = path.ok_or_else(|| anyhow::anyhow!("missing url or path"))?;
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("read {}", path))?
            }
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = state.content.as_deref() != Some(content.as_str());
        state.content = Some(content.clone());
        Ok(Loaded { changed, content })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let (etag, last_modified, cached) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                state.etag.clone(),
                state.last_modified.clone(),
                state.content.clone(),
            )
        };

        let user_agent = self.options.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        let mut request = self.client.get(url).header(USER_AGENT, user_agent);
        if cached.is_some() {
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }
        let response = response.error_for_status()?;
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let new_etag = header(ETAG);
        let new_last_modified = header(LAST_MODIFIED);
        let content = response.text().await?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.etag = new_etag;
        state.last_modified = new_last_modified;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::reload::reload_channel;
    use std::io::Write;

    const CONTENT: &str = r#"
outbounds:
  - type: direct
    tag: hk
  - type: block
"#;

    fn provider(path: &std::path::Path) -> SubscriptionProvider {
        let (notifier, _signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        SubscriptionProvider::new(
            &ctx,
            Logger::new("proxyprovider[sub]"),
            "sub",
            &ProxyProviderOptions {
                tag: "sub".to_string(),
                path: Some(path.to_string_lossy().to_string()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn parse_json_and_yaml() {
        let json = r#"{"outbounds": [{"type": "direct", "tag": "a"}]}"#;
        assert_eq!(parse_provider_content(json).unwrap()[0].tag, "a");
        let yaml = parse_provider_content(CONTENT).unwrap();
        assert_eq!(yaml.len(), 2);
        assert_eq!(yaml[1].outbound_type, "block");
    }

    #[test]
    fn empty_content_fails() {
        assert!(parse_provider_content("outbounds: []").is_err());
        assert!(parse_provider_content("{}").is_err());
    }

    #[test]
    fn requires_a_source() {
        let (notifier, _signal) = reload_channel();
        let ctx = BoxContext::new(None, notifier, None);
        let result = SubscriptionProvider::new(
            &ctx,
            Logger::new("t"),
            "sub",
            &ProxyProviderOptions::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn file_outbounds_are_namespaced() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", CONTENT).unwrap();
        let provider = provider(file.path());

        let outbounds = provider.start_get_outbounds().await.unwrap();
        let tags: Vec<_> = outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["sub/hk", "sub/1"]);
        assert_eq!(provider.outbounds(), outbounds);
    }

    #[tokio::test]
    async fn reload_detects_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", CONTENT).unwrap();
        let provider = provider(file.path());
        let source = Source {
            client: provider.client.clone(),
            options: provider.options.clone(),
            state: provider.state.clone(),
        };
        assert!(source.load().await.unwrap().changed);
        assert!(!source.load().await.unwrap().changed);

        std::fs::write(file.path(), "outbounds:\n  - type: direct\n").unwrap();
        assert!(source.load().await.unwrap().changed);
    }
}
