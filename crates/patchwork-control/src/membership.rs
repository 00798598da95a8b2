//! Group membership resolution.
//!
//! Answers which deployments exist in a scope and at which locations they run.
//! Topology is owned elsewhere; the control plane only reads it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::config::TopologyConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::types::{validate_name, DeploymentInfo, Location, Scope};

/// Resolves deployments and their running locations.
#[async_trait]
pub trait MembershipResolver: Send + Sync + std::fmt::Debug {
    /// Deployments assigned within `scope`. For the domain, every group's
    /// deployments, one entry per runtime name.
    async fn deployments_in_scope(&self, scope: &Scope) -> OverlayResult<Vec<DeploymentInfo>>;

    /// Locations running `deployment` (by runtime name) within `scope`, sorted.
    ///
    /// Disabled deployments have no locations.
    async fn locations_for(&self, deployment: &str, scope: &Scope) -> OverlayResult<Vec<Location>>;

    /// Returns true if `deployment` is assigned within `scope`.
    async fn is_present(&self, deployment: &str, scope: &Scope) -> OverlayResult<bool> {
        Ok(self
            .deployments_in_scope(scope)
            .await?
            .iter()
            .any(|info| info.runtime_name == deployment))
    }
}

#[derive(Debug, Clone, Default)]
struct GroupTopology {
    members: Vec<Location>,
    deployments: Vec<DeploymentInfo>,
}

/// Resolver backed by static topology configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    groups: BTreeMap<String, GroupTopology>,
}

impl StaticMembership {
    /// Create an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the topology from configuration.
    pub fn from_config(config: &TopologyConfig) -> OverlayResult<Self> {
        let mut membership = Self::new();

        for group in &config.groups {
            validate_name("server group", &group.name)?;
            if membership.groups.contains_key(&group.name) {
                return Err(OverlayError::Config(format!(
                    "server group {} is defined twice",
                    group.name
                )));
            }

            let members = group
                .members
                .iter()
                .map(|member| {
                    let location = Location::new(&member.host, &member.server);
                    match &member.endpoint {
                        Some(endpoint) => location.with_endpoint(endpoint),
                        None => location,
                    }
                })
                .collect();

            let deployments = group
                .deployments
                .iter()
                .map(|deployment| DeploymentInfo {
                    name: deployment.name.clone(),
                    runtime_name: deployment
                        .runtime_name
                        .clone()
                        .unwrap_or_else(|| deployment.name.clone()),
                    enabled: deployment.enabled,
                    base_content: deployment.base_content.clone(),
                })
                .collect();

            membership = membership.with_group(&group.name, members, deployments);
        }

        Ok(membership)
    }

    /// Add a server group.
    #[must_use]
    pub fn with_group(
        mut self,
        name: impl Into<String>,
        members: Vec<Location>,
        deployments: Vec<DeploymentInfo>,
    ) -> Self {
        self.groups.insert(
            name.into(),
            GroupTopology {
                members,
                deployments,
            },
        );
        self
    }

    /// Names of every configured group.
    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    fn groups_in<'a>(
        &'a self,
        scope: &'a Scope,
    ) -> impl Iterator<Item = &'a GroupTopology> + 'a {
        self.groups
            .iter()
            .filter(move |(name, _)| match scope.group() {
                Some(group) => group == name.as_str(),
                None => true,
            })
            .map(|(_, topology)| topology)
    }
}

#[async_trait]
impl MembershipResolver for StaticMembership {
    async fn deployments_in_scope(&self, scope: &Scope) -> OverlayResult<Vec<DeploymentInfo>> {
        let mut seen = BTreeSet::new();
        Ok(self
            .groups_in(scope)
            .flat_map(|group| group.deployments.iter())
            .filter(|info| seen.insert(info.runtime_name.clone()))
            .cloned()
            .collect())
    }

    async fn locations_for(&self, deployment: &str, scope: &Scope) -> OverlayResult<Vec<Location>> {
        let locations: BTreeSet<Location> = self
            .groups_in(scope)
            .filter(|group| {
                group
                    .deployments
                    .iter()
                    .any(|info| info.enabled && info.runtime_name == deployment)
            })
            .flat_map(|group| group.members.iter().cloned())
            .collect();

        Ok(locations.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str, runtime_name: &str) -> DeploymentInfo {
        DeploymentInfo {
            name: name.to_owned(),
            runtime_name: runtime_name.to_owned(),
            enabled: true,
            base_content: None,
        }
    }

    fn topology() -> StaticMembership {
        StaticMembership::new()
            .with_group(
                "main-server-group",
                vec![
                    Location::new("master", "main-one"),
                    Location::new("slave", "main-three"),
                ],
                vec![deployment("deployment.jar", "main-deployment.jar")],
            )
            .with_group(
                "other-server-group",
                vec![Location::new("slave", "other-two")],
                vec![deployment("deployment.jar", "other-deployment.jar")],
            )
    }

    #[tokio::test]
    async fn group_scope_sees_only_its_deployments() {
        let topology = topology();
        let main = Scope::server_group("main-server-group");

        assert!(topology
            .is_present("main-deployment.jar", &main)
            .await
            .expect("lookup failed"));
        assert!(!topology
            .is_present("other-deployment.jar", &main)
            .await
            .expect("lookup failed"));
    }

    #[tokio::test]
    async fn domain_scope_spans_every_group() {
        let topology = topology();
        let deployments = topology
            .deployments_in_scope(&Scope::Domain)
            .await
            .expect("lookup failed");
        assert_eq!(deployments.len(), 2);

        let locations = topology
            .locations_for("main-deployment.jar", &Scope::Domain)
            .await
            .expect("lookup failed");
        assert_eq!(
            locations,
            vec![
                Location::new("master", "main-one"),
                Location::new("slave", "main-three"),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_group_is_empty() {
        let topology = topology();
        let missing = Scope::server_group("missing");
        assert!(topology
            .deployments_in_scope(&missing)
            .await
            .expect("lookup failed")
            .is_empty());
        assert!(topology
            .locations_for("main-deployment.jar", &missing)
            .await
            .expect("lookup failed")
            .is_empty());
    }

    #[tokio::test]
    async fn disabled_deployments_have_no_locations() {
        let mut disabled = deployment("app.war", "app.war");
        disabled.enabled = false;
        let topology = StaticMembership::new().with_group(
            "g",
            vec![Location::new("h", "s")],
            vec![disabled],
        );

        let scope = Scope::server_group("g");
        assert!(topology.is_present("app.war", &scope).await.expect("lookup failed"));
        assert!(topology
            .locations_for("app.war", &scope)
            .await
            .expect("lookup failed")
            .is_empty());
    }

    #[test]
    fn from_config_defaults_runtime_name() {
        let config: TopologyConfig = toml::from_str(
            r#"
            [[groups]]
            name = "g"

            [[groups.members]]
            host = "h"
            server = "s"
            endpoint = "http://h:9991/s"

            [[groups.deployments]]
            name = "app.war"
            "#,
        )
        .expect("parse failed");

        let topology = StaticMembership::from_config(&config).expect("build failed");
        let group = &topology.groups["g"];
        assert_eq!(group.deployments[0].runtime_name, "app.war");
        assert_eq!(group.members[0].endpoint.as_deref(), Some("http://h:9991/s"));
    }

    #[test]
    fn from_config_rejects_duplicate_groups() {
        let config: TopologyConfig = toml::from_str(
            r#"
            [[groups]]
            name = "g"

            [[groups]]
            name = "g"
            "#,
        )
        .expect("parse failed");

        assert!(matches!(
            StaticMembership::from_config(&config),
            Err(OverlayError::Config(_))
        ));
    }
}
