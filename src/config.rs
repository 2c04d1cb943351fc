//! YAML configuration with validation up front, so a bad deployment fails
//! at startup instead of mid-sweep.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bot: BotConfig,
    pub storage: StorageConfig,
    pub denylist: DenylistConfig,
    #[serde(default)]
    pub sweeps: SweepConfig,
    pub defaults: Defaults,
    /// Chat that receives operational notices (denylist bans, privilege
    /// failures). Optional.
    pub debug_chat_id: Option<i64>,
    #[serde(default)]
    pub spam_rules: Vec<SpamRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub token: String,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenylistConfig {
    /// Full lists, merged on the daily refresh.
    pub daily_urls: Vec<String>,
    /// Incremental list, refreshed hourly.
    pub hourly_url: String,
    /// Per-user live status endpoint, consulted on cache misses.
    pub status_url: Option<String>,
    pub fetch_timeout_secs: Option<u64>,
    pub retry_backoff_secs: Option<u64>,
    pub refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SweepConfig {
    pub joiner_interval_secs: Option<u64>,
    pub expiry_interval_secs: Option<u64>,
}

/// Global defaults that per-chat settings may override. A NULL override in
/// `chat_settings` means "inherit these".
#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    pub challenge_timeout_secs: i64,
    pub reject_timeout_secs: i64,
    pub voting_timeout_secs: i64,
    pub min_voters: i64,
    pub max_voters: i64,
    pub min_voters_percent: i64,
    #[serde(default = "default_captcha_options")]
    pub captcha_options: usize,
}

fn default_captcha_options() -> usize {
    crate::captcha::DEFAULT_OPTION_COUNT
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpamRule {
    pub name: String,
    #[serde(default)]
    pub any_keywords: Vec<String>,
    #[serde(default)]
    pub all_keywords: Vec<String>,
    #[serde(default)]
    pub regex: Vec<String>,
    pub case_insensitive: Option<bool>,
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is empty"));
    }
    if cfg.denylist.daily_urls.is_empty() {
        return Err(anyhow!("denylist.daily_urls must list at least one source"));
    }
    let d = &cfg.defaults;
    if d.challenge_timeout_secs < 5 || d.challenge_timeout_secs > 24 * 3600 {
        return Err(anyhow!(
            "defaults.challenge_timeout_secs={} out of range (5..=86400)",
            d.challenge_timeout_secs
        ));
    }
    if d.reject_timeout_secs < 30 {
        return Err(anyhow!(
            "defaults.reject_timeout_secs={} must be >= 30",
            d.reject_timeout_secs
        ));
    }
    if d.voting_timeout_secs < 5 {
        return Err(anyhow!(
            "defaults.voting_timeout_secs={} must be >= 5",
            d.voting_timeout_secs
        ));
    }
    if !(0..=100).contains(&d.min_voters_percent) {
        return Err(anyhow!(
            "defaults.min_voters_percent={} out of range (0..=100)",
            d.min_voters_percent
        ));
    }
    if d.min_voters < 1 {
        return Err(anyhow!("defaults.min_voters={} must be >= 1", d.min_voters));
    }
    for rule in &cfg.spam_rules {
        if rule.any_keywords.is_empty() && rule.all_keywords.is_empty() && rule.regex.is_empty() {
            return Err(anyhow!("spam rule '{}' matches nothing", rule.name));
        }
        for pat in &rule.regex {
            regex::Regex::new(pat)
                .with_context(|| format!("bad regex in spam rule '{}'", rule.name))?;
        }
    }
    Ok(())
}

pub fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_yaml::from_str(
            r#"
bot:
  token: "123:abc"
storage:
  path: ":memory:"
denylist:
  daily_urls: ["https://example.org/a.txt", "https://example.org/b.txt"]
  hourly_url: "https://example.org/hourly.txt"
defaults:
  challenge_timeout_secs: 180
  reject_timeout_secs: 600
  voting_timeout_secs: 300
  min_voters: 2
  max_voters: 10
  min_voters_percent: 5
spam_rules:
  - name: crypto
    any_keywords: ["airdrop", "usdt"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn sample_validates() {
        validate_config(&sample()).unwrap();
    }

    #[test]
    fn rejects_bad_timeout() {
        let mut cfg = sample();
        cfg.defaults.challenge_timeout_secs = 2;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_empty_rule() {
        let mut cfg = sample();
        cfg.spam_rules.push(SpamRule {
            name: "empty".into(),
            any_keywords: vec![],
            all_keywords: vec![],
            regex: vec![],
            case_insensitive: None,
        });
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn config_arg_parsing() {
        let args = vec!["--config".to_string(), "warden.yaml".to_string()];
        assert_eq!(parse_config_arg(&args), Some(PathBuf::from("warden.yaml")));
        assert_eq!(parse_config_arg(&["--config".to_string()]), None);
    }
}
