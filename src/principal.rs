//! The `Principal` boundary the core consumes from the (out-of-scope)
//! authentication collaborator (spec §1, §4.7).

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{bail, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Read,
    Write,
    Admin,
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "admin" => Ok(Scope::Admin),
            other => bail!("unknown scope '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Bearer,
    WebSocketSubprotocol,
    LegacyQueryToken,
}

/// An authenticated identity with an associated scope set, already
/// resolved by the authentication collaborator (spec §1 non-goals).
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub scopes: HashSet<Scope>,
    pub auth_type: AuthType,
}

impl Principal {
    pub fn has_scope(&self, requested: Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(&requested)
    }
}

/// Resolves a bearer/subprotocol token to a `Principal`. The core only
/// depends on this trait; a real deployment plugs in whatever identity
/// provider it uses.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, token: &str, auth_type: AuthType) -> Result<Principal, Error>;
}

/// Development/test resolver: tokens are of the form
/// `"<user-id>:<scope>[,<scope>...]"`, e.g. `"alice:read,write"`. This
/// is not a credential system — it exists only so the Access Gate and
/// HTTP surface can be exercised without a real authentication
/// collaborator wired in, matching the way the spec treats
/// authentication as injected (spec §1, §4.7).
pub struct StaticPrincipalResolver;

impl PrincipalResolver for StaticPrincipalResolver {
    fn resolve(&self, token: &str, auth_type: AuthType) -> Result<Principal, Error> {
        let (user_id, scopes_str) = token
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed token"))?;

        if user_id.is_empty() {
            bail!("malformed token: empty user id");
        }

        let mut scopes = HashSet::new();
        for part in scopes_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            scopes.insert(Scope::from_str(part)?);
        }

        if scopes.is_empty() {
            bail!("malformed token: no scopes");
        }

        Ok(Principal {
            user_id: user_id.to_string(),
            scopes,
            auth_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_implies_every_scope() {
        let p = Principal {
            user_id: "alice".into(),
            scopes: [Scope::Admin].into_iter().collect(),
            auth_type: AuthType::Bearer,
        };
        assert!(p.has_scope(Scope::Read));
        assert!(p.has_scope(Scope::Write));
    }

    #[test]
    fn read_and_write_are_siblings() {
        let p = Principal {
            user_id: "alice".into(),
            scopes: [Scope::Read].into_iter().collect(),
            auth_type: AuthType::Bearer,
        };
        assert!(p.has_scope(Scope::Read));
        assert!(!p.has_scope(Scope::Write));
    }

    #[test]
    fn static_resolver_parses_token() {
        let resolver = StaticPrincipalResolver;
        let p = resolver.resolve("alice:read,write", AuthType::Bearer).unwrap();
        assert_eq!(p.user_id, "alice");
        assert!(p.has_scope(Scope::Read));
        assert!(p.has_scope(Scope::Write));
        assert!(!p.has_scope(Scope::Admin));
    }

    #[test]
    fn static_resolver_rejects_malformed_token() {
        let resolver = StaticPrincipalResolver;
        assert!(resolver.resolve("no-colon-here", AuthType::Bearer).is_err());
        assert!(resolver.resolve("alice:", AuthType::Bearer).is_err());
    }
}
