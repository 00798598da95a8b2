//! Redeploy request validation.
//!
//! Pure over a [`LinkIndex`] snapshot: nothing here touches the resolver,
//! the store or any server.

use std::collections::BTreeSet;

use tracing::debug;

use crate::links::LinkIndex;
use crate::types::Scope;

/// A deployment to redeploy, as reached through one enabled link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// Scope of the link; locations are resolved within it.
    pub scope: Scope,
    /// Deployment runtime name.
    pub deployment: String,
    /// The caller named this deployment. Absent explicit targets are errors;
    /// absent implicit ones are skipped.
    pub explicit: bool,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The first requested name without an enabled link in scope.
    NotLinked {
        /// Offending deployment name.
        deployment: String,
    },
}

/// Outcome of validating a redeploy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Every requested name is linked; these are the targets, in order.
    Validated(Vec<LinkTarget>),
    /// The request names something that is not linked.
    Rejected(Rejection),
}

/// Validate a redeploy request against one link snapshot.
///
/// With `requested` absent every enabled link to `overlay` visible from
/// `scope` is targeted. Otherwise each name must have at least one such link;
/// duplicates collapse to their first occurrence. A name linked in several
/// visible scopes yields one target per link.
#[must_use]
pub fn validate(
    index: &LinkIndex,
    scope: &Scope,
    overlay: &str,
    requested: Option<&[String]>,
) -> Validation {
    let Some(requested) = requested else {
        let targets = index
            .enabled(scope, overlay)
            .map(|key| LinkTarget {
                scope: key.scope.clone(),
                deployment: key.deployment.clone(),
                explicit: false,
            })
            .collect();
        return Validation::Validated(targets);
    };

    let mut seen = BTreeSet::new();
    let mut targets = Vec::new();

    for deployment in requested {
        if !seen.insert(deployment.as_str()) {
            continue;
        }

        let before = targets.len();
        targets.extend(
            index
                .enabled(scope, overlay)
                .filter(|key| key.deployment == *deployment)
                .map(|key| LinkTarget {
                    scope: key.scope.clone(),
                    deployment: key.deployment.clone(),
                    explicit: true,
                }),
        );

        if targets.len() == before {
            debug!(overlay, scope = %scope, deployment = %deployment, "redeploy request rejected");
            return Validation::Rejected(Rejection::NotLinked {
                deployment: deployment.clone(),
            });
        }
    }

    Validation::Validated(targets)
}
