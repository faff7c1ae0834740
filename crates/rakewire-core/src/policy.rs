//! Channel access control.

use crate::identity::{Identity, Role};
use std::collections::HashMap;

/// Decides whether an identity may subscribe to a channel.
pub trait AuthorizationPolicy: Send + Sync {
    /// Whether `identity` may join `channel`.
    fn can_access_channel(&self, identity: &Identity, channel: &str) -> bool;
}

/// Every identity may join every channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn can_access_channel(&self, _identity: &Identity, _channel: &str) -> bool {
        true
    }
}

/// Restricts named channels to a set of roles.
///
/// Channels without a rule are open to every role. Names match exactly.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    restricted: HashMap<String, Vec<Role>>,
}

impl RolePolicy {
    /// Create a policy with no restrictions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `channel` to `roles`.
    #[must_use]
    pub fn restrict(mut self, channel: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        self.restricted
            .insert(channel.into(), roles.into_iter().collect());
        self
    }

    /// Number of restricted channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.restricted.len()
    }

    /// Whether no channel is restricted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restricted.is_empty()
    }
}

impl FromIterator<(String, Vec<Role>)> for RolePolicy {
    fn from_iter<T: IntoIterator<Item = (String, Vec<Role>)>>(iter: T) -> Self {
        Self {
            restricted: iter.into_iter().collect(),
        }
    }
}

impl AuthorizationPolicy for RolePolicy {
    fn can_access_channel(&self, identity: &Identity, channel: &str) -> bool {
        self.restricted
            .get(channel)
            .map_or(true, |roles| roles.contains(&identity.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_policy() {
        let policy = RolePolicy::new().restrict("ops-internal", [Role::Admin, Role::Operator]);

        let admin = Identity::new("a", Role::Admin);
        let user = Identity::new("u", Role::User);

        assert!(policy.can_access_channel(&admin, "ops-internal"));
        assert!(!policy.can_access_channel(&user, "ops-internal"));
        assert!(policy.can_access_channel(&user, "tracking"));
        // No prefix matching.
        assert!(policy.can_access_channel(&user, "ops-internal-2"));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.can_access_channel(&Identity::anonymous(), "anything"));
    }
}
