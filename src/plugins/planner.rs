// Installation planner - expands requested plugin tokens into resolved sets

use crate::plugins::catalog::PluginCatalog;
use crate::plugins::error::PluginError;
use std::collections::BTreeSet;
use std::fmt;

/// The plugins to fetch for a single requested token
pub type ResolvedPluginSet = BTreeSet<String>;

/// One entry of the request list: `name` or `name[featureA&featureB]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginToken {
    pub base: String,
    pub features: Vec<String>,
    bracketed: bool,
}

impl PluginToken {
    pub fn parse(token: &str) -> Result<Self, PluginError> {
        let token = token.trim();
        let malformed = |reason: &str| PluginError::MalformedToken {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let Some(open) = token.find('[') else {
            if token.contains(']') {
                return Err(malformed("unexpected ']' without a matching '['"));
            }
            if token.is_empty() {
                return Err(malformed("empty plugin name"));
            }
            return Ok(Self {
                base: token.to_string(),
                features: Vec::new(),
                bracketed: false,
            });
        };

        let Some(inner) = token[open + 1..].strip_suffix(']') else {
            return Err(malformed("feature list must end with ']'"));
        };
        let base = token[..open].trim();
        if base.is_empty() {
            return Err(malformed("empty plugin name"));
        }
        if inner.contains('[') || inner.contains(']') {
            return Err(malformed("nested brackets are not allowed"));
        }

        let features: Vec<String> = inner.split('&').map(|f| f.trim().to_string()).collect();
        if features.iter().any(|f| f.is_empty()) {
            return Err(malformed("empty feature name"));
        }

        Ok(Self {
            base: base.to_string(),
            features,
            bracketed: true,
        })
    }

    pub fn is_bracketed(&self) -> bool {
        self.bracketed
    }
}

impl fmt::Display for PluginToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bracketed {
            write!(f, "{}[{}]", self.base, self.features.join("&"))
        } else {
            write!(f, "{}", self.base)
        }
    }
}

/// Split a comma-separated plugin list, skipping empty entries.
///
/// A single empty entry is simply "nothing requested"; empty entries in a
/// longer list are stray separators and are reported as warnings. Returns the
/// non-empty entries and the number of stray separators seen.
pub fn split_plugin_list<'s>(list: &'s str, what: &str) -> (Vec<&'s str>, usize) {
    let entries: Vec<&str> = list.split(',').map(str::trim).collect();
    let mut names = Vec::new();
    let mut stray = 0;

    for entry in &entries {
        if entry.is_empty() {
            if entries.len() == 1 {
                tracing::info!("No plugins to {}...", what);
            } else {
                stray += 1;
                tracing::warn!("Extra comma in the list of plugins to {}?", what);
            }
            continue;
        }
        names.push(*entry);
    }

    (names, stray)
}

/// The parsed request list for one run, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallationRequest {
    pub tokens: Vec<PluginToken>,
    pub stray_separators: usize,
}

impl InstallationRequest {
    pub fn parse(list: &str) -> Result<Self, PluginError> {
        let (entries, stray_separators) = split_plugin_list(list, "install");
        let tokens = entries
            .into_iter()
            .map(PluginToken::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tokens,
            stray_separators,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub struct Planner<'a> {
    catalog: &'a PluginCatalog,
    expand_requires_unconditionally: bool,
}

impl<'a> Planner<'a> {
    /// `expand_requires_unconditionally` controls whether a bracket-less token
    /// also pulls in the plugin's `requires`. Bracketed tokens always do.
    pub fn new(catalog: &'a PluginCatalog, expand_requires_unconditionally: bool) -> Self {
        Self {
            catalog,
            expand_requires_unconditionally,
        }
    }

    /// Expand a raw request token into the set of plugins to fetch
    pub fn expand(&self, token: &str) -> Result<ResolvedPluginSet, PluginError> {
        self.expand_token(&PluginToken::parse(token)?)
    }

    pub fn expand_token(&self, token: &PluginToken) -> Result<ResolvedPluginSet, PluginError> {
        let mut resolved = ResolvedPluginSet::new();

        if !token.is_bracketed() && !self.expand_requires_unconditionally {
            resolved.insert(token.base.clone());
            return Ok(resolved);
        }

        let descriptor = self.catalog.lookup(&token.base)?;
        resolved.insert(descriptor.name.clone());
        for required in &descriptor.requires {
            self.add_with_requirements(required, &mut resolved)?;
        }

        for feature_name in &token.features {
            let feature = descriptor.optional_features.get(feature_name).ok_or_else(|| {
                PluginError::UnknownFeature {
                    plugin: descriptor.name.clone(),
                    feature: feature_name.clone(),
                }
            })?;
            for required in &feature.requires {
                self.add_with_requirements(required, &mut resolved)?;
            }
        }

        tracing::debug!("Expanded {} into {:?}", token, resolved);
        Ok(resolved)
    }

    // Requirement graph is acyclic (checked at catalog load); the insert guard
    // also stops revisiting shared requirements.
    fn add_with_requirements(
        &self,
        name: &str,
        resolved: &mut ResolvedPluginSet,
    ) -> Result<(), PluginError> {
        if !resolved.insert(name.to_string()) {
            return Ok(());
        }
        let descriptor = self.catalog.lookup(name)?;
        for required in &descriptor.requires {
            self.add_with_requirements(required, resolved)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PluginCatalog {
        PluginCatalog::from_json(
            r#"{"plugins": {
                "p": {
                    "custom_install": {"installer": "x"},
                    "requires": ["r"],
                    "optional_features": {
                        "f1": {"requires": ["a"]},
                        "f2": {"requires": ["b"]}
                    }
                },
                "r": {"custom_install": {"installer": "x"}, "requires": ["r2"]},
                "r2": {"custom_install": {"installer": "x"}},
                "a": {"custom_install": {"installer": "x"}},
                "b": {"custom_install": {"installer": "x"}, "requires": ["r"]}
            }}"#,
        )
        .unwrap()
    }

    fn set(items: &[&str]) -> ResolvedPluginSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_token_is_just_itself() {
        let catalog = catalog();
        let planner = Planner::new(&catalog, false);
        assert_eq!(planner.expand("p").unwrap(), set(&["p"]));
        // Not looked up until it is fetched
        assert_eq!(planner.expand("unlisted").unwrap(), set(&["unlisted"]));
    }

    #[test]
    fn test_plain_token_with_unconditional_requires() {
        let catalog = catalog();
        let planner = Planner::new(&catalog, true);
        assert_eq!(planner.expand("p").unwrap(), set(&["p", "r", "r2"]));
        assert!(matches!(
            planner.expand("unlisted"),
            Err(PluginError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn test_features_expand() {
        let catalog = catalog();
        let planner = Planner::new(&catalog, false);
        assert_eq!(
            planner.expand("p[f1&f2]").unwrap(),
            set(&["p", "a", "b", "r", "r2"])
        );
        assert_eq!(planner.expand("p[f1]").unwrap(), set(&["p", "a", "r", "r2"]));
    }

    #[test]
    fn test_unknown_feature() {
        let catalog = catalog();
        let planner = Planner::new(&catalog, false);
        assert!(matches!(
            planner.expand("p[f1&nope]"),
            Err(PluginError::UnknownFeature { feature, .. }) if feature == "nope"
        ));
    }

    #[test]
    fn test_bracketed_unknown_plugin() {
        let catalog = catalog();
        let planner = Planner::new(&catalog, false);
        assert!(matches!(
            planner.expand("ghost[f1]"),
            Err(PluginError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["p[f1", "p]", "[f1]", "p[]", "p[f1&&f2]", "p[f[1]]"] {
            assert!(
                matches!(PluginToken::parse(token), Err(PluginError::MalformedToken { .. })),
                "{} should be rejected",
                token
            );
        }
    }

    #[test]
    fn test_token_display_roundtrip() {
        let token = PluginToken::parse(" p[ f1 & f2 ] ").unwrap();
        assert_eq!(token.base, "p");
        assert_eq!(token.features, vec!["f1", "f2"]);
        assert_eq!(token.to_string(), "p[f1&f2]");
    }

    #[test]
    fn test_request_empty_list() {
        let request = InstallationRequest::parse("").unwrap();
        assert!(request.is_empty());
        assert_eq!(request.stray_separators, 0);
    }

    #[test]
    fn test_request_stray_separators() {
        let request = InstallationRequest::parse("a, ,b,").unwrap();
        assert_eq!(
            request.tokens.iter().map(|t| t.base.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(request.stray_separators, 2);
    }

    #[test]
    fn test_request_keeps_order() {
        let request = InstallationRequest::parse("z, p[f2], a").unwrap();
        let names: Vec<String> = request.tokens.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, vec!["z", "p[f2]", "a"]);
    }
}
