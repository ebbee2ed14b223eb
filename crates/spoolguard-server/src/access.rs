//! Access control gate.
//!
//! Authorizes an operation given an actor (interactive session, bearer
//! credential, or kiosk) against a reconciled job's effective owner.  The
//! permission-tier checks enumerate the satisfying tiers explicitly: a key
//! holding only `admin` still passes a `read`-gated check because `admin`
//! is listed, not because of any numeric ordering.

use spoolguard_store::{ApiKey, Permission};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::reconcile::EnrichedJob;
use crate::session::SessionUser;

/// Who is asking.
#[derive(Debug, Clone)]
pub enum Actor {
    /// An interactive platform session.
    Session(SessionUser),
    /// A long-lived bearer credential.
    Credential(ApiKey),
    /// An authenticated kiosk display; operates with release/cancel rights
    /// over the whole queue.
    Kiosk,
}

/// What is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    View,
    Release,
    Cancel,
    Claim,
}

/// Tiers that satisfy each required tier.  Spelled out rather than ordered.
fn satisfying_tiers(required: Permission) -> &'static [Permission] {
    match required {
        Permission::Read => &[Permission::Read, Permission::Write, Permission::Admin],
        Permission::Write => &[Permission::Write, Permission::Admin],
        Permission::Admin => &[Permission::Admin],
    }
}

/// Whether the key's permission set satisfies the required tier.
pub fn key_satisfies(key: &ApiKey, required: Permission) -> bool {
    satisfying_tiers(required)
        .iter()
        .any(|tier| key.has(*tier))
}

/// The authorization matrix, constructed once from immutable configuration.
#[derive(Debug, Clone)]
pub struct AccessGate {
    admin_groups: Vec<String>,
    admin_users: Vec<String>,
}

impl AccessGate {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            admin_groups: config.admin_groups.clone(),
            admin_users: config.admin_users.clone(),
        }
    }

    /// Admin status: group intersection with the configured admin groups, or
    /// username in the configured admin-user list.
    pub fn is_admin(&self, user: &SessionUser) -> bool {
        user.groups.iter().any(|g| self.admin_groups.contains(g))
            || self.admin_users.contains(&user.username)
    }

    /// Authorize `op` on `job` for `actor`.
    pub fn authorize(
        &self,
        actor: &Actor,
        op: Operation,
        job: &EnrichedJob,
    ) -> Result<(), ServerError> {
        match actor {
            Actor::Session(user) => self.authorize_session(user, op, job),
            Actor::Credential(key) => authorize_credential(key, op, job),
            // Kiosks are approval consoles: full view/release/cancel over
            // the queue, but claiming binds a personal identity they lack.
            Actor::Kiosk => match op {
                Operation::View | Operation::Release | Operation::Cancel => Ok(()),
                Operation::Claim => Err(ServerError::PermissionDenied(
                    "kiosks cannot claim jobs".into(),
                )),
            },
        }
    }

    fn authorize_session(
        &self,
        user: &SessionUser,
        op: Operation,
        job: &EnrichedJob,
    ) -> Result<(), ServerError> {
        let owns = job.effective_owner.as_deref() == Some(user.username.as_str());
        let admin = self.is_admin(user);

        match op {
            Operation::View => {
                if owns || admin || job.claimable {
                    Ok(())
                } else {
                    Err(ServerError::PermissionDenied(
                        "job belongs to another user".into(),
                    ))
                }
            }
            Operation::Release | Operation::Cancel => {
                if owns || admin {
                    Ok(())
                } else {
                    Err(ServerError::PermissionDenied(
                        "only the job owner or an admin may do this".into(),
                    ))
                }
            }
            Operation::Claim => {
                if job.claimable {
                    Ok(())
                } else {
                    Err(ServerError::PermissionDenied("job is not claimable".into()))
                }
            }
        }
    }
}

fn authorize_credential(
    key: &ApiKey,
    op: Operation,
    job: &EnrichedJob,
) -> Result<(), ServerError> {
    // Credential rights are global, not per-job.
    let required = match op {
        Operation::View => Permission::Read,
        Operation::Release | Operation::Cancel | Operation::Claim => Permission::Write,
    };

    if !key_satisfies(key, required) {
        return Err(ServerError::PermissionDenied(format!(
            "key '{}' lacks the {} permission",
            key.name, required
        )));
    }

    if op == Operation::Claim && !job.claimable {
        return Err(ServerError::PermissionDenied("job is not claimable".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use spoolguard_store::SubmitChannel;

    use crate::spooler::{JobState, SpoolJob};

    fn gate() -> AccessGate {
        AccessGate {
            admin_groups: vec!["print-admins".into()],
            admin_users: vec!["root".into()],
        }
    }

    fn user(name: &str, groups: &[&str]) -> SessionUser {
        SessionUser {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            name: name.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            id_token: None,
        }
    }

    fn key(name: &str, perms: &[Permission]) -> ApiKey {
        ApiKey {
            id: 1,
            key_prefix: "pq_test".into(),
            name: name.into(),
            owner: "owner".into(),
            permissions: perms.to_vec(),
            created_at: Utc::now(),
            last_used: None,
            request_count: 0,
            is_active: true,
        }
    }

    fn job(owner: Option<&str>, claimable: bool) -> EnrichedJob {
        EnrichedJob {
            job: SpoolJob {
                id: 1,
                title: "doc".into(),
                originating_user: "x".into(),
                printer: "p".into(),
                state: JobState::Held,
                pages: 1,
                size_kb: 1,
                created_at: None,
            },
            state_text: "Held",
            submitted_via: SubmitChannel::Ipp,
            original_filename: None,
            claimed_by: None,
            effective_owner: owner.map(String::from),
            via_device_mapping: false,
            claimable,
        }
    }

    #[test]
    fn owner_may_release_others_may_not() {
        let g = gate();
        let j = job(Some("alice"), false);

        assert!(g.authorize(&Actor::Session(user("alice", &[])), Operation::Release, &j).is_ok());
        assert!(g.authorize(&Actor::Session(user("bob", &[])), Operation::Release, &j).is_err());
        assert!(g.authorize(&Actor::Session(user("bob", &[])), Operation::View, &j).is_err());
    }

    #[test]
    fn admin_overrides_ownership() {
        let g = gate();
        let j = job(Some("alice"), false);

        // Via group membership.
        let grouped = user("carol", &["print-admins", "staff"]);
        assert!(g.authorize(&Actor::Session(grouped), Operation::Cancel, &j).is_ok());

        // Via the admin-user list.
        assert!(g.authorize(&Actor::Session(user("root", &[])), Operation::Cancel, &j).is_ok());
    }

    #[test]
    fn unclaimed_jobs_are_visible_and_claimable_by_anyone() {
        let g = gate();
        let j = job(Some("shared-pc"), true);
        let bob = user("bob", &[]);

        assert!(g.authorize(&Actor::Session(bob.clone()), Operation::View, &j).is_ok());
        assert!(g.authorize(&Actor::Session(bob.clone()), Operation::Claim, &j).is_ok());
        // But not release before claiming.
        assert!(g.authorize(&Actor::Session(bob), Operation::Release, &j).is_err());
    }

    #[test]
    fn claim_requires_claimable_job() {
        let g = gate();
        let j = job(Some("alice"), false);
        assert!(g.authorize(&Actor::Session(user("bob", &[])), Operation::Claim, &j).is_err());
        assert!(g.authorize(&Actor::Credential(key("k", &[Permission::Write])), Operation::Claim, &j).is_err());
    }

    #[test]
    fn read_only_key_cannot_write() {
        // Scenario: a write-gated request with a read-only key is denied.
        let g = gate();
        let j = job(Some("alice"), false);
        let k = key("reader", &[Permission::Read]);

        assert!(g.authorize(&Actor::Credential(k.clone()), Operation::View, &j).is_ok());
        let denied = g.authorize(&Actor::Credential(k), Operation::Release, &j);
        assert!(matches!(denied, Err(ServerError::PermissionDenied(_))));
    }

    #[test]
    fn admin_only_key_satisfies_lower_tiers_explicitly() {
        // A key holding just ["admin"] passes read- and write-gated checks
        // because the satisfied-by table lists admin, not via ordering.
        let k = key("super", &[Permission::Admin]);
        assert!(key_satisfies(&k, Permission::Read));
        assert!(key_satisfies(&k, Permission::Write));
        assert!(key_satisfies(&k, Permission::Admin));

        let w = key("writer", &[Permission::Write]);
        assert!(key_satisfies(&w, Permission::Read));
        assert!(!key_satisfies(&w, Permission::Admin));
    }

    #[test]
    fn kiosk_controls_queue_but_cannot_claim() {
        let g = gate();
        let j = job(Some("alice"), false);

        assert!(g.authorize(&Actor::Kiosk, Operation::View, &j).is_ok());
        assert!(g.authorize(&Actor::Kiosk, Operation::Release, &j).is_ok());
        assert!(g.authorize(&Actor::Kiosk, Operation::Cancel, &j).is_ok());
        assert!(g.authorize(&Actor::Kiosk, Operation::Claim, &job(None, true)).is_err());
    }
}
