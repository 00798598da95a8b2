//! Test fixtures for control plane integration tests.
//!
//! Two server groups share a domain:
//!
//! ```text
//! main-server-group   master:main-one, slave:main-three   main-deployment.jar
//! other-server-group  slave:other-two                     other-deployment.jar
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use patchwork_control::{DeploymentInfo, Location, MockExecutor, Scope, StaticMembership};

pub const OVERLAY: &str = "test-overlay";
pub const MAIN_GROUP: &str = "main-server-group";
pub const OTHER_GROUP: &str = "other-server-group";
pub const MAIN_DEPLOYMENT: &str = "main-deployment.jar";
pub const OTHER_DEPLOYMENT: &str = "other-deployment.jar";
pub const PROPERTIES: &str = "service.properties";
pub const BASE_CONTENT: &[u8] = b"service=is new";
pub const OVERLAY_CONTENT: &[u8] = b"service=is added";

pub fn main_one() -> Location {
    Location::new("master", "main-one")
}

pub fn main_three() -> Location {
    Location::new("slave", "main-three")
}

pub fn other_two() -> Location {
    Location::new("slave", "other-two")
}

pub fn main_group() -> Scope {
    Scope::server_group(MAIN_GROUP)
}

pub fn other_group() -> Scope {
    Scope::server_group(OTHER_GROUP)
}

fn deployment(name: &str) -> DeploymentInfo {
    DeploymentInfo {
        name: name.to_owned(),
        runtime_name: name.to_owned(),
        enabled: true,
        base_content: None,
    }
}

/// Membership for the two-group domain.
pub fn topology() -> StaticMembership {
    StaticMembership::new()
        .with_group(
            MAIN_GROUP,
            vec![main_one(), main_three()],
            vec![deployment(MAIN_DEPLOYMENT)],
        )
        .with_group(
            OTHER_GROUP,
            vec![other_two()],
            vec![deployment(OTHER_DEPLOYMENT)],
        )
}

/// Start every deployment with the base properties file.
pub fn deploy_base_everywhere(executor: &MockExecutor) {
    let base = || [(PROPERTIES.to_owned(), Bytes::from_static(BASE_CONTENT))];
    for location in [main_one(), main_three()] {
        executor
            .deploy_base(&location, MAIN_DEPLOYMENT, base())
            .expect("deploy failed");
    }
    executor
        .deploy_base(&other_two(), OTHER_DEPLOYMENT, base())
        .expect("deploy failed");
}

/// The properties file currently served by `deployment` at `location`.
pub fn served_properties(
    executor: &MockExecutor,
    location: &Location,
    deployment: &str,
) -> Bytes {
    let running: BTreeMap<String, Bytes> = executor
        .running_content(location, deployment)
        .expect("lookup failed")
        .expect("not running");
    running.get(PROPERTIES).cloned().expect("no properties file")
}
