//! Static category routing.
//!
//! Each category resolves to its dedicated destination if a rule names one,
//! otherwise to the default destination. A rule with `mirror = true` also sends
//! to its `mirror_to` destination (or the default when unset). Without
//! mirroring a dedicated destination replaces the default path entirely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DeliveryError, DeliveryResult};

/// Endpoint settings for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Webhook URL.
    pub url: String,
    /// Secondary URL for the fallback attempt.
    #[serde(default)]
    pub fallback_url: Option<String>,
}

/// Routing rule for one category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Dedicated destination name.
    #[serde(default)]
    pub destination: Option<String>,
    /// Also send to the mirror target.
    #[serde(default)]
    pub mirror: bool,
    /// Mirror target name. Defaults to the default destination.
    #[serde(default)]
    pub mirror_to: Option<String>,
}

/// Routing table as loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Named destinations.
    #[serde(default)]
    pub destinations: HashMap<String, DestinationConfig>,
    /// Destination used by categories without a dedicated rule.
    #[serde(default)]
    pub default_destination: Option<String>,
    /// Per-category rules.
    #[serde(default)]
    pub rules: HashMap<String, RoutingRule>,
}

impl RoutingConfig {
    /// Check every referenced name and URL.
    pub fn validate(&self) -> DeliveryResult<()> {
        for (name, destination) in &self.destinations {
            validate_url(name, &destination.url)?;
            if let Some(fallback) = &destination.fallback_url {
                validate_url(name, fallback)?;
            }
        }

        if let Some(name) = &self.default_destination {
            self.require(name, "default_destination")?;
        }

        for (category, rule) in &self.rules {
            if let Some(name) = &rule.destination {
                self.require(name, &format!("routing rule '{category}'"))?;
            }
            if let Some(name) = &rule.mirror_to {
                self.require(name, &format!("mirror target of '{category}'"))?;
            }
            if rule.mirror && rule.mirror_to.is_none() && self.default_destination.is_none() {
                return Err(DeliveryError::ConfigError(format!(
                    "routing rule '{category}' mirrors but no mirror_to or default destination is set"
                )));
            }
        }
        Ok(())
    }

    fn require(&self, name: &str, referenced_by: &str) -> DeliveryResult<()> {
        if self.destinations.contains_key(name) {
            Ok(())
        } else {
            Err(DeliveryError::UnknownDestination {
                name: name.to_string(),
                referenced_by: referenced_by.to_string(),
            })
        }
    }
}

fn validate_url(name: &str, url: &str) -> DeliveryResult<()> {
    let parsed = reqwest::Url::parse(url).map_err(|e| DeliveryError::InvalidUrl {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DeliveryError::InvalidUrl {
            name: name.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// A resolved delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub url: String,
    pub fallback_url: Option<String>,
}

/// Validated routing table.
#[derive(Debug, Clone)]
pub struct Router {
    destinations: HashMap<String, Destination>,
    default_destination: Option<String>,
    rules: HashMap<String, RoutingRule>,
}

impl Router {
    /// Build a router, validating the table once.
    pub fn new(config: RoutingConfig) -> DeliveryResult<Self> {
        config.validate()?;
        let destinations = config
            .destinations
            .into_iter()
            .map(|(name, d)| {
                let destination = Destination {
                    name: name.clone(),
                    url: d.url,
                    fallback_url: d.fallback_url,
                };
                (name, destination)
            })
            .collect();

        Ok(Self {
            destinations,
            default_destination: config.default_destination,
            rules: config.rules,
        })
    }

    /// Resolve the destinations for a category.
    ///
    /// Pure: no I/O and no state. Returns an empty list when neither a rule
    /// nor a default destination applies. Never returns the same destination
    /// twice.
    pub fn resolve(&self, category: &str) -> Vec<Destination> {
        let rule = self.rules.get(category);
        let primary = rule
            .and_then(|r| r.destination.as_deref())
            .or(self.default_destination.as_deref());
        let mirror = rule
            .filter(|r| r.mirror)
            .and_then(|r| r.mirror_to.as_deref().or(self.default_destination.as_deref()));

        let mut resolved: Vec<Destination> = Vec::with_capacity(2);
        for name in [primary, mirror].into_iter().flatten() {
            if resolved.iter().any(|d| d.name == name) {
                continue;
            }
            if let Some(destination) = self.destinations.get(name) {
                resolved.push(destination.clone());
            }
        }
        resolved
    }

    pub fn destination(&self, name: &str) -> Option<&Destination> {
        self.destinations.get(name)
    }

    pub fn destination_names(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(url: &str) -> DestinationConfig {
        DestinationConfig {
            url: url.to_string(),
            fallback_url: None,
        }
    }

    fn config() -> RoutingConfig {
        RoutingConfig {
            destinations: HashMap::from([
                ("main".to_string(), dest("https://hooks.example.com/main")),
                (
                    "liquidations".to_string(),
                    dest("https://hooks.example.com/liq"),
                ),
                ("ops".to_string(), dest("https://hooks.example.com/ops")),
            ]),
            default_destination: Some("main".to_string()),
            rules: HashMap::from([
                (
                    "liquidation".to_string(),
                    RoutingRule {
                        destination: Some("liquidations".to_string()),
                        mirror: false,
                        mirror_to: None,
                    },
                ),
                (
                    "whale_activity".to_string(),
                    RoutingRule {
                        destination: Some("liquidations".to_string()),
                        mirror: true,
                        mirror_to: None,
                    },
                ),
                (
                    "cpu".to_string(),
                    RoutingRule {
                        destination: Some("ops".to_string()),
                        mirror: true,
                        mirror_to: Some("liquidations".to_string()),
                    },
                ),
            ]),
        }
    }

    fn names(destinations: &[Destination]) -> Vec<&str> {
        destinations.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_dedicated_without_mirror_skips_default() {
        let router = Router::new(config()).unwrap();
        assert_eq!(names(&router.resolve("liquidation")), vec!["liquidations"]);
    }

    #[test]
    fn test_dedicated_with_mirror_includes_default() {
        let router = Router::new(config()).unwrap();
        assert_eq!(
            names(&router.resolve("whale_activity")),
            vec!["liquidations", "main"]
        );
    }

    #[test]
    fn test_explicit_mirror_target() {
        let router = Router::new(config()).unwrap();
        assert_eq!(names(&router.resolve("cpu")), vec!["ops", "liquidations"]);
    }

    #[test]
    fn test_unruled_category_uses_default() {
        let router = Router::new(config()).unwrap();
        assert_eq!(names(&router.resolve("market_report")), vec!["main"]);
    }

    #[test]
    fn test_no_default_resolves_empty() {
        let mut cfg = config();
        cfg.default_destination = None;
        cfg.rules.remove("whale_activity");
        let router = Router::new(cfg).unwrap();
        assert!(router.resolve("market_report").is_empty());
        assert_eq!(names(&router.resolve("liquidation")), vec!["liquidations"]);
    }

    #[test]
    fn test_mirror_to_self_not_duplicated() {
        let mut cfg = config();
        cfg.rules.insert(
            "signal".to_string(),
            RoutingRule {
                destination: Some("main".to_string()),
                mirror: true,
                mirror_to: None,
            },
        );
        let router = Router::new(cfg).unwrap();
        assert_eq!(names(&router.resolve("signal")), vec!["main"]);
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let mut cfg = config();
        cfg.rules.insert(
            "signal".to_string(),
            RoutingRule {
                destination: Some("nowhere".to_string()),
                ..Default::default()
            },
        );
        let err = Router::new(cfg).unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownDestination { name, .. } if name == "nowhere"));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut cfg = config();
        cfg.destinations
            .insert("bad".to_string(), dest("ftp://hooks.example.com"));
        assert!(matches!(
            Router::new(cfg),
            Err(DeliveryError::InvalidUrl { .. })
        ));

        let mut cfg = config();
        cfg.destinations.insert("bad".to_string(), dest("not a url"));
        assert!(Router::new(cfg).is_err());
    }

    #[test]
    fn test_mirror_without_target_rejected() {
        let mut cfg = config();
        cfg.default_destination = None;
        assert!(matches!(
            Router::new(cfg),
            Err(DeliveryError::ConfigError(_))
        ));
    }
}
