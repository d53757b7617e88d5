pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::Options;

/// Read and decode a configuration file.
///
/// JSON and YAML are both accepted (YAML is a superset of JSON for our
/// purposes). `${VAR}`, `${VAR:-default}` and `$VAR` references are
/// expanded from the environment before decoding.
pub fn load_options(path: impl AsRef<Path>) -> Result<Options> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_options(&raw)
}

pub fn parse_options(content: &str) -> Result<Options> {
    let expanded = expand_env_vars(content);
    let trimmed = expanded.trim_start();
    let options = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).context("decode json config")?
    } else {
        serde_yml::from_str(&expanded).context("decode yaml config")?
    };
    Ok(options)
}

pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            if let Some((name, default)) = var_name.split_once(":-") {
                match std::env::var(name) {
                    Ok(val) if !val.is_empty() => result.push_str(&val),
                    _ => result.push_str(default),
                }
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                result.push('$');
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_options() {
        let options = parse_options(
            r#"{
                "inbounds": [{"type": "direct", "listen": "127.0.0.1", "listen_port": 1080}],
                "outbounds": [{"type": "direct", "tag": "out"}, {"type": "block"}],
                "route": {"final": "out", "rules": [{"domain": ["a.com"], "outbound": "out"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(options.inbounds.len(), 1);
        assert!(options.inbounds[0].tag.is_empty());
        assert_eq!(options.outbounds[1].outbound_type, "block");
        let route = options.route.unwrap();
        assert_eq!(route.final_outbound.as_deref(), Some("out"));
        assert!(route.rules[0].matchers.contains_key("domain"));
    }

    #[test]
    fn parse_yaml_options_with_providers() {
        let options = parse_options(
            "outbounds:\n  - type: direct\nrule_providers:\n  - tag: ads\n    path: ads.txt\nproxy-providers:\n  - url: https://example.com/sub\n",
        )
        .unwrap();
        assert_eq!(options.rule_providers[0].tag, "ads");
        assert_eq!(options.rule_providers[0].provider_type, "local");
        assert_eq!(options.rule_providers[0].behavior, "domain");
        assert_eq!(options.proxy_providers.len(), 1);
        assert!(options.proxy_providers[0].tag.is_empty());
    }

    #[test]
    fn logical_rule_nests() {
        let options = parse_options(
            r#"{"route": {"rules": [{"type": "logical", "mode": "and", "rules": [{"clash_mode": "Global"}], "outbound": "x"}]}}"#,
        )
        .unwrap();
        let rule = &options.route.unwrap().rules[0];
        assert_eq!(rule.rule_type, "logical");
        assert_eq!(rule.rules[0].clash_mode.as_deref(), Some("Global"));
    }

    #[test]
    fn env_expansion() {
        std::env::set_var("PROXYBOX_TEST_PORT", "7890");
        let out = expand_env_vars("port: ${PROXYBOX_TEST_PORT} other: ${PROXYBOX_MISSING:-x} $ end");
        assert_eq!(out, "port: 7890 other: x $ end");
        std::env::remove_var("PROXYBOX_TEST_PORT");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "log:\n  level: debug\n").unwrap();
        let options = load_options(&path).unwrap();
        assert_eq!(options.log.unwrap().level, "debug");
    }
}
