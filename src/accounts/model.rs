//! On-disk account registry shapes and pure selection rules.

use crate::auth::credential::QwenCredential;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const REGISTRY_VERSION: u32 = 1;

/// One registered identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub token: QwenCredential,
    /// Denormalized copy of the credential's routing hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    /// Epoch-ms instant until which this account is quota-cooled; 0 = healthy.
    #[serde(rename = "exhaustedUntil", default)]
    pub exhausted_until: i64,
    #[serde(rename = "lastErrorCode", skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    /// Stable identity fingerprint used for login de-duplication.
    #[serde(rename = "accountKey", skip_serializing_if = "Option::is_none")]
    pub account_key: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

impl Account {
    pub fn is_exhausted(&self, now_ms: i64) -> bool {
        self.exhausted_until > now_ms
    }
}

/// The full multi-account store. Insertion order is rotation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRegistry {
    pub version: u32,
    #[serde(rename = "activeAccountId")]
    pub active_account_id: Option<String>,
    pub accounts: Vec<Account>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        AccountRegistry {
            version: REGISTRY_VERSION,
            active_account_id: None,
            accounts: Vec::new(),
        }
    }
}

impl AccountRegistry {
    pub fn position(&self, id: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.id == id)
    }

    pub fn find_by_key(&self, key: &str) -> Option<&Account> {
        self.accounts
            .iter()
            .find(|a| a.account_key.as_deref() == Some(key))
    }

    /// Re-point a dangling active pointer at the first account (or clear it
    /// when the list is empty). Returns true when anything changed.
    pub fn repair_active_pointer(&mut self) -> bool {
        let valid = self
            .active_account_id
            .as_deref()
            .is_some_and(|id| self.position(id).is_some());
        if valid {
            return false;
        }

        let replacement = self.accounts.first().map(|a| a.id.clone());
        if replacement == self.active_account_id {
            return false;
        }
        self.active_account_id = replacement;
        true
    }

    /// Rotation tie-break rule: strict forward order starting immediately
    /// after `after_id`'s position (or index 0 when it is unknown), wrapping
    /// around; the first candidate that is neither excluded nor exhausted
    /// wins.
    pub fn next_healthy_after(
        &self,
        after_id: Option<&str>,
        exclude: &HashSet<String>,
        now_ms: i64,
    ) -> Option<&Account> {
        if self.accounts.is_empty() {
            return None;
        }

        let start = after_id.and_then(|id| self.position(id)).unwrap_or(0);
        let len = self.accounts.len();
        (1..=len)
            .map(|offset| &self.accounts[(start + offset) % len])
            .find(|a| !exclude.contains(&a.id) && !a.is_exhausted(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(tag: &str) -> QwenCredential {
        QwenCredential {
            access_token: format!("at-{tag}"),
            refresh_token: format!("rt-{tag}"),
            token_type: "Bearer".to_string(),
            expiry_date: 1_900_000_000_000,
            resource_url: None,
        }
    }

    fn account(id: &str, exhausted_until: i64) -> Account {
        Account {
            id: id.to_string(),
            token: cred(id),
            resource_url: None,
            exhausted_until,
            last_error_code: None,
            account_key: Some(format!("key-{id}")),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn registry(accounts: Vec<Account>, active: Option<&str>) -> AccountRegistry {
        AccountRegistry {
            version: REGISTRY_VERSION,
            active_account_id: active.map(str::to_string),
            accounts,
        }
    }

    #[test]
    fn rotation_skips_exhausted_accounts_with_wraparound() {
        let now = 1_000;
        let reg = registry(
            vec![account("a", 0), account("b", now + 60_000), account("c", 0)],
            Some("a"),
        );

        let next = reg
            .next_healthy_after(Some("a"), &HashSet::new(), now)
            .expect("candidate");
        assert_eq!(next.id, "c");
    }

    #[test]
    fn rotation_respects_exclusions() {
        let now = 1_000;
        let reg = registry(vec![account("a", 0), account("b", 0), account("c", 0)], Some("a"));

        let exclude: HashSet<String> = ["b".to_string()].into_iter().collect();
        let next = reg.next_healthy_after(Some("a"), &exclude, now).expect("candidate");
        assert_eq!(next.id, "c");
    }

    #[test]
    fn rotation_reports_none_when_everyone_is_out() {
        let now = 1_000;
        let reg = registry(vec![account("a", now + 1), account("b", now + 1)], Some("a"));
        assert!(reg.next_healthy_after(Some("a"), &HashSet::new(), now).is_none());
    }

    #[test]
    fn dangling_active_pointer_is_repaired() {
        let mut reg = registry(vec![account("a", 0)], Some("gone"));
        assert!(reg.repair_active_pointer());
        assert_eq!(reg.active_account_id.as_deref(), Some("a"));

        let mut empty = registry(vec![], Some("gone"));
        assert!(empty.repair_active_pointer());
        assert!(empty.active_account_id.is_none());

        let mut ok = registry(vec![account("a", 0)], Some("a"));
        assert!(!ok.repair_active_pointer());
    }

    #[test]
    fn wire_format_uses_documented_field_names() {
        let reg = registry(vec![account("a", 5)], Some("a"));
        let v = serde_json::to_value(&reg).expect("serialize");
        assert_eq!(v["activeAccountId"], "a");
        assert_eq!(v["accounts"][0]["exhaustedUntil"], 5);
        assert_eq!(v["accounts"][0]["accountKey"], "key-a");
        assert!(v["accounts"][0].get("createdAt").is_some());
    }
}
