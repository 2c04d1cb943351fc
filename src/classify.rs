//! Spam classifier seam.
//!
//! The consensus engine only needs a boolean oracle. An LLM-backed
//! implementation can live behind the same trait; the shipped one matches
//! configured keyword/regex rules, with compiled patterns cached per rule.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;

use crate::config::SpamRule;

#[async_trait]
pub trait SpamClassifier: Send + Sync {
    /// `prior_examples` are recently confirmed spam texts; implementations
    /// may ignore them.
    async fn is_spam(&self, text: &str, prior_examples: &[String]) -> anyhow::Result<bool>;
}

pub struct RuleClassifier {
    rules: Vec<SpamRule>,
    compiled: DashMap<String, Vec<Regex>>,
}

impl RuleClassifier {
    pub fn new(rules: Vec<SpamRule>) -> Self {
        Self {
            rules,
            compiled: DashMap::new(),
        }
    }

    fn compiled_for(&self, rule: &SpamRule) -> Vec<Regex> {
        if let Some(v) = self.compiled.get(&rule.name) {
            return v.clone();
        }
        // patterns were validated at config load; skip any that still fail
        let out: Vec<Regex> = rule
            .regex
            .iter()
            .filter_map(|pat| Regex::new(pat).ok())
            .collect();
        self.compiled.insert(rule.name.clone(), out.clone());
        out
    }

    fn matches(&self, rule: &SpamRule, text: &str) -> bool {
        let ci = rule.case_insensitive.unwrap_or(true);
        let haystack = if ci { text.to_lowercase() } else { text.to_string() };

        for k in &rule.all_keywords {
            let needle = if ci { k.to_lowercase() } else { k.clone() };
            if !haystack.contains(&needle) {
                return false;
            }
        }

        if !rule.any_keywords.is_empty() {
            let any_hit = rule.any_keywords.iter().any(|k| {
                let needle = if ci { k.to_lowercase() } else { k.clone() };
                haystack.contains(&needle)
            });
            if !any_hit {
                return false;
            }
        }

        let compiled = self.compiled_for(rule);
        if !compiled.is_empty() {
            return compiled.iter().any(|r| r.is_match(text));
        }

        !(rule.any_keywords.is_empty() && rule.all_keywords.is_empty())
    }
}

#[async_trait]
impl SpamClassifier for RuleClassifier {
    async fn is_spam(&self, text: &str, _prior_examples: &[String]) -> anyhow::Result<bool> {
        Ok(self.rules.iter().any(|rule| self.matches(rule, text)))
    }
}
