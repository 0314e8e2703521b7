use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use farmchat_storage::{Backend, Tier, UserId, UserRecord, UserRole};
use snafu::ResultExt;

use crate::error::{FetchResult, ListingSnafu};

pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// Display metadata for the other side of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partner {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub name: Option<String>,
    pub profile_name: Option<String>,
    pub role: UserRole,
    pub tier: Option<Tier>,
}

impl Partner {
    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            id: record.id,
            display_name: display_name(record),
            email: record.email.clone(),
            name: record.name.clone(),
            profile_name: record.profile_name.clone(),
            role: record.role,
            tier: record.tier,
        }
    }

    /// Placeholder for a user the store no longer knows about.
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            display_name: UNKNOWN_DISPLAY_NAME.to_string(),
            email: String::new(),
            name: None,
            profile_name: None,
            role: UserRole::Member,
            tier: None,
        }
    }

    pub fn tier_label(&self) -> Option<&'static str> {
        self.tier.map(|tier| tier.as_str())
    }

    fn matches(&self, needle: &str) -> bool {
        let haystacks = [
            Some(self.email.as_str()),
            self.name.as_deref(),
            self.profile_name.as_deref(),
        ];
        haystacks
            .into_iter()
            .flatten()
            .any(|value| value.to_lowercase().contains(needle))
    }
}

/// First non-blank of profile name, nickname, name, and the email local part.
pub fn display_name(record: &UserRecord) -> String {
    let email_local = record.email.split('@').next();
    [
        record.profile_name.as_deref(),
        record.nickname.as_deref(),
        record.name.as_deref(),
        email_local,
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|value| !value.is_empty())
    .unwrap_or(UNKNOWN_DISPLAY_NAME)
    .to_string()
}

/// Resolves user ids to partners and keeps the contact list for new conversations.
pub struct PartnerDirectory {
    backend: Arc<dyn Backend>,
    viewer: UserId,
    resolved: ArcSwap<HashMap<UserId, Partner>>,
    contacts: ArcSwap<Vec<Partner>>,
}

impl PartnerDirectory {
    pub fn new(backend: Arc<dyn Backend>, viewer: UserId) -> Self {
        Self {
            backend,
            viewer,
            resolved: ArcSwap::from_pointee(HashMap::new()),
            contacts: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn cached(&self, user_id: UserId) -> Option<Partner> {
        self.resolved.load().get(&user_id).cloned()
    }

    pub fn remember(&self, partner: Partner) {
        self.remember_all(std::iter::once(partner));
    }

    fn remember_all(&self, partners: impl IntoIterator<Item = Partner>) {
        let partners = partners.into_iter().collect::<Vec<_>>();
        if partners.is_empty() {
            return;
        }
        self.resolved.rcu(|current| {
            let mut next = HashMap::clone(current);
            for partner in &partners {
                next.insert(partner.id, partner.clone());
            }
            next
        });
    }

    /// Memoized lookup. Store failures degrade to an `Unknown` partner and are not memoized.
    pub async fn resolve(&self, user_id: UserId) -> Partner {
        if let Some(partner) = self.cached(user_id) {
            return partner;
        }

        match self.backend.get_user(user_id).await {
            Ok(Some(record)) => {
                let partner = Partner::from_record(&record);
                self.remember(partner.clone());
                partner
            }
            Ok(None) => {
                tracing::debug!(user = %user_id, "partner lookup found no user");
                Partner::unknown(user_id)
            }
            Err(error) => {
                tracing::warn!(user = %user_id, error = %error, "partner lookup failed");
                Partner::unknown(user_id)
            }
        }
    }

    /// Reloads the contact list. Staff accounts and the viewer are never offered as contacts.
    pub async fn refresh_contacts(&self) -> FetchResult<Arc<Vec<Partner>>> {
        let users = self.backend.list_users().await.context(ListingSnafu {
            stage: "contacts-refresh",
            listing: "contacts",
        })?;

        let everyone = users.iter().map(Partner::from_record).collect::<Vec<_>>();
        let contacts = everyone
            .iter()
            .filter(|partner| !partner.role.is_staff() && partner.id != self.viewer)
            .cloned()
            .collect::<Vec<_>>();

        self.remember_all(everyone);
        let contacts = Arc::new(contacts);
        self.contacts.store(contacts.clone());
        tracing::debug!(count = contacts.len(), "contacts refreshed");
        Ok(contacts)
    }

    pub fn contacts(&self) -> Arc<Vec<Partner>> {
        self.contacts.load_full()
    }

    pub fn find_contact(&self, user_id: UserId) -> Option<Partner> {
        self.contacts
            .load()
            .iter()
            .find(|partner| partner.id == user_id)
            .cloned()
    }

    /// Case-insensitive substring search over email, name and profile name.
    pub fn search(&self, query: &str) -> Vec<Partner> {
        let needle = query.trim().to_lowercase();
        let contacts = self.contacts.load();
        if needle.is_empty() {
            return contacts.as_ref().clone();
        }
        contacts
            .iter()
            .filter(|partner| partner.matches(&needle))
            .cloned()
            .collect()
    }
}
