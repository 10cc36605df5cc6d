//! Compiled Rule Sets
//!
//! A [`MappingRuleSet`] is compiled once when loaded into L1: exact rules are
//! indexed per direction and wildcard rules are split into prefix/suffix
//! pairs. Resolution honours declared rule order, so the first rule matching
//! an input wins whether it is exact or a pattern.

use std::collections::HashMap;

use crate::domain::{Direction, MappingRuleSet, ProviderId, RuleVersion, WILDCARD};
use crate::error::Result;

/// `prefix*suffix` split of a wildcard rule side
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    prefix: String,
    suffix: String,
}

impl Pattern {
    fn parse(side: &str) -> Option<Self> {
        let (prefix, suffix) = side.split_once(WILDCARD)?;
        Some(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Text matched by the wildcard; never empty.
    fn capture<'a>(&self, input: &'a str) -> Option<&'a str> {
        if input.len() <= self.prefix.len() + self.suffix.len() {
            return None;
        }
        if !input.starts_with(&self.prefix) || !input.ends_with(&self.suffix) {
            return None;
        }
        Some(&input[self.prefix.len()..input.len() - self.suffix.len()])
    }

    fn expand(&self, captured: &str) -> String {
        let mut out =
            String::with_capacity(self.prefix.len() + captured.len() + self.suffix.len());
        out.push_str(&self.prefix);
        out.push_str(captured);
        out.push_str(&self.suffix);
        out
    }
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    index: usize,
    source: Pattern,
    target: Pattern,
}

/// Successful rule application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Translated symbol
    pub target: String,
    /// Position of the rule that matched
    pub rule_index: usize,
    /// Market of the matching rule (rule tag, else the rule-set default)
    pub market: String,
}

/// Rule set ready for in-memory resolution
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    rule_set: MappingRuleSet,
    to_standard: HashMap<String, usize>,
    from_standard: HashMap<String, usize>,
    patterns: Vec<CompiledPattern>,
}

impl CompiledRuleSet {
    /// Validate and compile a rule set
    pub fn compile(rule_set: MappingRuleSet) -> Result<Self> {
        rule_set.validate()?;

        let mut to_standard = HashMap::new();
        let mut from_standard = HashMap::new();
        let mut patterns = Vec::new();

        for (index, rule) in rule_set.rules.iter().enumerate() {
            match (Pattern::parse(&rule.source), Pattern::parse(&rule.target)) {
                (Some(source), Some(target)) => patterns.push(CompiledPattern {
                    index,
                    source,
                    target,
                }),
                _ => {
                    to_standard.entry(rule.source.clone()).or_insert(index);
                    from_standard.entry(rule.target.clone()).or_insert(index);
                }
            }
        }

        Ok(Self {
            rule_set,
            to_standard,
            from_standard,
            patterns,
        })
    }

    pub fn provider(&self) -> &ProviderId {
        &self.rule_set.provider
    }

    pub fn version(&self) -> RuleVersion {
        self.rule_set.version
    }

    pub fn default_market(&self) -> &str {
        &self.rule_set.market
    }

    pub fn rule_set(&self) -> &MappingRuleSet {
        &self.rule_set
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rule_set.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_set.rules.is_empty()
    }

    /// Apply the rules to one symbol
    pub fn resolve(&self, direction: Direction, symbol: &str) -> Option<Resolution> {
        let exact = match direction {
            Direction::ToStandard => self.to_standard.get(symbol).copied(),
            Direction::FromStandard => self.from_standard.get(symbol).copied(),
        };

        for pattern in &self.patterns {
            if exact.map_or(false, |e| pattern.index > e) {
                break;
            }
            let (from, to) = match direction {
                Direction::ToStandard => (&pattern.source, &pattern.target),
                Direction::FromStandard => (&pattern.target, &pattern.source),
            };
            if let Some(captured) = from.capture(symbol) {
                return Some(self.resolution(pattern.index, to.expand(captured)));
            }
        }

        exact.map(|index| {
            let rule = &self.rule_set.rules[index];
            let target = match direction {
                Direction::ToStandard => rule.target.clone(),
                Direction::FromStandard => rule.source.clone(),
            };
            self.resolution(index, target)
        })
    }

    fn resolution(&self, rule_index: usize, target: String) -> Resolution {
        let market = self.rule_set.rules[rule_index]
            .market
            .clone()
            .unwrap_or_else(|| self.rule_set.market.clone());
        Resolution {
            target,
            rule_index,
            market,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MappingRule;

    fn compile(rules: Vec<MappingRule>) -> CompiledRuleSet {
        CompiledRuleSet::compile(MappingRuleSet::new("acme", RuleVersion(1), "US", rules)).unwrap()
    }

    #[test]
    fn test_exact_rule_both_directions() {
        let rules = compile(vec![MappingRule::exact("AAA", "AAA.US")]);

        let res = rules.resolve(Direction::ToStandard, "AAA").unwrap();
        assert_eq!(res.target, "AAA.US");
        assert_eq!(res.market, "US");

        let res = rules.resolve(Direction::FromStandard, "AAA.US").unwrap();
        assert_eq!(res.target, "AAA");

        assert!(rules.resolve(Direction::ToStandard, "BBB").is_none());
    }

    #[test]
    fn test_pattern_rule() {
        let rules = compile(vec![MappingRule::exact("*", "*.US")]);

        assert_eq!(rules.resolve(Direction::ToStandard, "MSFT").unwrap().target, "MSFT.US");
        assert_eq!(rules.resolve(Direction::FromStandard, "MSFT.US").unwrap().target, "MSFT");
        // Empty capture never matches
        assert!(rules.resolve(Direction::FromStandard, ".US").is_none());
        assert!(rules.resolve(Direction::FromStandard, "MSFT.L").is_none());
    }

    #[test]
    fn test_declared_order_wins() {
        // Exact rule declared first beats the catch-all
        let rules = compile(vec![
            MappingRule::exact("BRK.B", "BRK-B.US"),
            MappingRule::exact("*", "*.US"),
        ]);
        assert_eq!(rules.resolve(Direction::ToStandard, "BRK.B").unwrap().target, "BRK-B.US");

        // Catch-all declared first shadows the later exact rule
        let rules = compile(vec![
            MappingRule::exact("*", "*.US"),
            MappingRule::exact("BRK.B", "BRK-B.US"),
        ]);
        let res = rules.resolve(Direction::ToStandard, "BRK.B").unwrap();
        assert_eq!(res.target, "BRK.B.US");
        assert_eq!(res.rule_index, 0);
    }

    #[test]
    fn test_rule_market_tag_overrides_default() {
        let rules = compile(vec![
            MappingRule::exact("VOD", "VOD.L").with_market("LSE"),
            MappingRule::exact("*", "*.US"),
        ]);
        assert_eq!(rules.resolve(Direction::ToStandard, "VOD").unwrap().market, "LSE");
        assert_eq!(rules.resolve(Direction::ToStandard, "IBM").unwrap().market, "US");
    }

    #[test]
    fn test_prefix_and_suffix_pattern() {
        let rules = compile(vec![MappingRule::exact("X:*-PERP", "*USDT.PERP")]);
        assert_eq!(
            rules.resolve(Direction::ToStandard, "X:BTC-PERP").unwrap().target,
            "BTCUSDT.PERP"
        );
        assert_eq!(
            rules.resolve(Direction::FromStandard, "ETHUSDT.PERP").unwrap().target,
            "X:ETH-PERP"
        );
    }

    #[test]
    fn test_compile_rejects_invalid_rule_set() {
        let result = CompiledRuleSet::compile(MappingRuleSet::new(
            "acme",
            RuleVersion(1),
            "US",
            vec![MappingRule::exact("*", "FIXED")],
        ));
        assert!(result.is_err());
    }
}
