//! Clash 模式
//!
//! 模式列表来自路由/DNS 规则中出现的 `clash_mode` 值，
//! 当前模式由 Clash API 服务持有，可通过 `PATCH /configs` 切换。

use std::sync::{PoisonError, RwLock};

use crate::config::types::RuleView;
use crate::config::Options;

pub const DEFAULT_MODE: &str = "Rule";

/// Unique, non-empty `clash_mode` values of the route rules then the DNS
/// rules, descending into logical rules, in first-seen order.
pub fn calculate_clash_mode_list(options: &Options) -> Vec<String> {
    let mut modes = Vec::new();
    if let Some(route) = &options.route {
        for rule in &route.rules {
            collect_modes(rule, &mut modes);
        }
    }
    if let Some(dns) = &options.dns {
        for rule in &dns.rules {
            collect_modes(rule, &mut modes);
        }
    }
    modes
}

fn collect_modes(rule: &dyn RuleView, modes: &mut Vec<String>) {
    if rule.is_logical() {
        rule.for_each_nested(&mut |nested| collect_modes(nested, modes));
        return;
    }
    if let Some(mode) = rule.clash_mode() {
        if !mode.is_empty() && !modes.iter().any(|m| m == mode) {
            modes.push(mode.to_string());
        }
    }
}

/// Current mode plus the modes it may switch to.
#[derive(Debug)]
pub struct ModeState {
    current: RwLock<String>,
    list: Vec<String>,
}

impl ModeState {
    /// `default_mode` wins when configured; otherwise the first listed
    /// mode, otherwise [`DEFAULT_MODE`]. The initial mode is always part
    /// of the list.
    pub fn new(mut list: Vec<String>, default_mode: Option<&str>) -> Self {
        let initial = default_mode
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| list.first().cloned())
            .unwrap_or_else(|| DEFAULT_MODE.to_string());
        if !list.iter().any(|m| m.eq_ignore_ascii_case(&initial)) {
            list.insert(0, initial.clone());
        }
        Self {
            current: RwLock::new(initial),
            list,
        }
    }

    pub fn get(&self) -> String {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn list(&self) -> &[String] {
        &self.list
    }

    /// 切换模式（大小写不敏感），未知模式返回 false
    pub fn set(&self, mode: &str) -> bool {
        let Some(canonical) = self.list.iter().find(|m| m.eq_ignore_ascii_case(mode)) else {
            return false;
        };
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if *current != *canonical {
            *current = canonical.clone();
            tracing::info!(mode = canonical.as_str(), "clash mode changed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_options;

    #[test]
    fn mode_list_is_unique_and_ordered() {
        let options = parse_options(
            r#"{
                "route": {"rules": [
                    {"clash_mode": "Direct", "outbound": "direct"},
                    {"type": "logical", "rules": [{"clash_mode": "Global"}, {"clash_mode": "Direct"}]},
                    {"clash_mode": "", "outbound": "direct"}
                ]},
                "dns": {"rules": [{"clash_mode": "Global", "server": "a"}, {"clash_mode": "Block", "server": "b"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(
            calculate_clash_mode_list(&options),
            vec!["Direct", "Global", "Block"]
        );
    }

    #[test]
    fn no_rules_means_no_modes() {
        assert!(calculate_clash_mode_list(&Options::default()).is_empty());
    }

    #[test]
    fn default_mode_selection() {
        let state = ModeState::new(vec![], None);
        assert_eq!(state.get(), "Rule");
        assert_eq!(state.list(), ["Rule"]);

        let state = ModeState::new(vec!["Global".into(), "Direct".into()], None);
        assert_eq!(state.get(), "Global");

        let state = ModeState::new(vec!["Global".into()], Some("Rule"));
        assert_eq!(state.get(), "Rule");
        assert_eq!(state.list(), ["Rule", "Global"]);
    }

    #[test]
    fn switch_is_case_insensitive() {
        let state = ModeState::new(vec!["Rule".into(), "Global".into()], None);
        assert!(state.set("global"));
        assert_eq!(state.get(), "Global");
        assert!(!state.set("invalid"));
        assert_eq!(state.get(), "Global");
    }
}
