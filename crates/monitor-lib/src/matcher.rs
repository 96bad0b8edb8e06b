//! Container-name matching for the platform naming convention
//!
//! Managed containers are named `{prefix}-{appId}-{tenantId}-{service}` with
//! an optional `-N` replica ordinal. Service names may themselves contain
//! hyphens, so the service is matched as the longest known suffix and the
//! remainder must split into exactly two segments. This is a filter, not a
//! validator: names that do not match are silently excluded.

use crate::models::ManagedContainer;
use crate::runtime::RuntimeContainer;

/// Identity extracted from a matching container name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub app_id: String,
    pub tenant_id: String,
    pub service: String,
}

/// Matches runtime container names against the platform convention
#[derive(Debug, Clone)]
pub struct ContainerMatcher {
    prefix: String,
    /// Known service names, longest first so hyphenated names win over
    /// any shorter suffix of themselves
    services: Vec<String>,
}

impl ContainerMatcher {
    pub fn new(prefix: impl Into<String>, services: impl IntoIterator<Item = String>) -> Self {
        let mut services: Vec<String> = services.into_iter().collect();
        services.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        services.dedup();
        Self {
            prefix: prefix.into(),
            services,
        }
    }

    /// Extracts `(appId, tenantId, service)` from a container name, or
    /// `None` when the name does not follow the convention
    pub fn identify(&self, name: &str) -> Option<ContainerIdentity> {
        let rest = name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?;

        self.match_tail(rest)
            .or_else(|| strip_ordinal(rest).and_then(|base| self.match_tail(base)))
    }

    /// Keeps only managed containers, annotated with their identity
    pub fn filter(&self, containers: Vec<RuntimeContainer>) -> Vec<ManagedContainer> {
        containers
            .into_iter()
            .filter_map(|c| {
                self.identify(&c.name).map(|identity| ManagedContainer {
                    id: c.id,
                    name: c.name,
                    app_id: identity.app_id,
                    tenant_id: identity.tenant_id,
                    service: identity.service,
                })
            })
            .collect()
    }

    fn match_tail(&self, rest: &str) -> Option<ContainerIdentity> {
        for service in &self.services {
            let Some(head) = rest.strip_suffix(service.as_str()) else {
                continue;
            };
            let Some(head) = head.strip_suffix('-') else {
                continue;
            };
            let mut parts = head.split('-');
            if let (Some(app), Some(tenant), None) = (parts.next(), parts.next(), parts.next()) {
                if !app.is_empty() && !tenant.is_empty() {
                    return Some(ContainerIdentity {
                        app_id: app.to_string(),
                        tenant_id: tenant.to_string(),
                        service: service.clone(),
                    });
                }
            }
        }
        None
    }
}

/// Strips a trailing `-N` replica ordinal, if present
fn strip_ordinal(rest: &str) -> Option<&str> {
    let (base, tail) = rest.rsplit_once('-')?;
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(base)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> ContainerMatcher {
        ContainerMatcher::new(
            "plat",
            ["web", "api", "background-worker", "redis"]
                .into_iter()
                .map(String::from),
        )
    }

    #[test]
    fn test_identify_simple_name() {
        let id = matcher().identify("plat-shop-acme-web").unwrap();
        assert_eq!(
            id,
            ContainerIdentity {
                app_id: "shop".to_string(),
                tenant_id: "acme".to_string(),
                service: "web".to_string(),
            }
        );
    }

    #[test]
    fn test_identify_with_replica_ordinal() {
        let id = matcher().identify("plat-shop-acme-web-3").unwrap();
        assert_eq!(id.service, "web");
        assert_eq!(id.tenant_id, "acme");
    }

    #[test]
    fn test_identify_hyphenated_service() {
        let id = matcher()
            .identify("plat-shop-acme-background-worker")
            .unwrap();
        assert_eq!(id.service, "background-worker");
        assert_eq!(id.app_id, "shop");

        let id = matcher()
            .identify("plat-shop-acme-background-worker-2")
            .unwrap();
        assert_eq!(id.service, "background-worker");
    }

    #[test]
    fn test_identify_rejects_foreign_names() {
        let m = matcher();
        assert!(m.identify("other-shop-acme-web").is_none());
        assert!(m.identify("plat-shop-acme-postgres").is_none());
        assert!(m.identify("plat-acme-web").is_none());
        assert!(m.identify("plat-a-b-c-web-extra").is_none());
        assert!(m.identify("plat").is_none());
        assert!(m.identify("plat-").is_none());
        assert!(m.identify("plat--acme-web").is_none());
        assert!(m.identify("").is_none());
    }

    #[test]
    fn test_identify_never_matches_without_tenant_segment() {
        // "background-worker" would leave only one segment before it
        assert!(matcher().identify("plat-acme-background-worker").is_none());
    }

    #[test]
    fn test_filter_annotates_and_excludes() {
        let containers = vec![
            RuntimeContainer {
                id: "c1".to_string(),
                name: "plat-shop-acme-web-1".to_string(),
            },
            RuntimeContainer {
                id: "c2".to_string(),
                name: "registry-cache".to_string(),
            },
            RuntimeContainer {
                id: "c3".to_string(),
                name: "plat-crm-globex-redis".to_string(),
            },
        ];

        let managed = matcher().filter(containers);
        assert_eq!(managed.len(), 2);
        assert_eq!(managed[0].name, "plat-shop-acme-web-1");
        assert_eq!(managed[0].app_id, "shop");
        assert_eq!(managed[0].tenant_id, "acme");
        assert_eq!(managed[0].service, "web");
        assert_eq!(managed[1].tenant_id, "globex");
        assert_eq!(managed[1].service, "redis");
    }
}
