//! Multi-account registry: which identity services the next request.
//!
//! Every mutation happens under the accounts file lock, and every
//! read-then-decide sequence re-reads the freshest on-disk state inside the
//! critical section; other host processes share these files. The refresher's
//! validity check runs outside the selection lock so a slow token endpoint
//! never blocks account selection in sibling processes.

use crate::accounts::identity::derive_account_key;
use crate::accounts::model::{Account, AccountRegistry, REGISTRY_VERSION};
use crate::auth::credential::QwenCredential;
use crate::auth::lock::FileLock;
use crate::auth::refresher::{AccessOutcome, Refresher};
use crate::auth::store::TokenStore;
use crate::config::{DEFAULT_API_BASE, RegistryConfig};
use crate::error::CastorError;
use crate::utils::fsx::write_atomic_private;
use crate::utils::now_ms;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A selected account plus its validated credential, ready for one request.
#[derive(Debug, Clone)]
pub struct RuntimeAccount {
    pub id: String,
    pub credential: QwenCredential,
    pub resource_url: Option<String>,
}

impl RuntimeAccount {
    /// API origin for this account: its routing hint, or the fleet default.
    pub fn api_base(&self) -> &str {
        self.resource_url.as_deref().unwrap_or(DEFAULT_API_BASE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Update this exact account instead of matching by key.
    pub account_id: Option<String>,
    /// Caller-supplied identity fingerprint; derived from the credential when
    /// absent.
    pub account_key: Option<String>,
    /// Always insert, even when a key match exists.
    pub force_new: bool,
    pub set_active: bool,
}

#[derive(Debug, Clone)]
pub struct GetActiveOptions {
    /// Accept an account that is currently in quota cooldown.
    pub allow_exhausted: bool,
    /// Run the refresher's validity check on the selected account. Disabling
    /// this returns whatever the registry holds, unvalidated.
    pub require_valid_token: bool,
    pub preferred_account_id: Option<String>,
}

impl Default for GetActiveOptions {
    fn default() -> Self {
        GetActiveOptions {
            allow_exhausted: false,
            require_valid_token: true,
            preferred_account_id: None,
        }
    }
}

pub struct AccountManager {
    cfg: RegistryConfig,
    store: TokenStore,
    http: reqwest::Client,
}

impl AccountManager {
    pub fn new(cfg: RegistryConfig, store: TokenStore, http: reqwest::Client) -> Self {
        Self { cfg, store, http }
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    fn lock_path(&self) -> PathBuf {
        let mut p = self.cfg.accounts_path.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    /// Register or update an identity after a successful login/refresh
    /// exchange. Clears any exhaustion state for that identity.
    pub async fn upsert(
        &self,
        cred: QwenCredential,
        opts: UpsertOptions,
    ) -> Result<Account, CastorError> {
        let guard = FileLock::acquire(&self.lock_path()).await?;
        let mut reg = self.load_or_bridge();
        let now = now_ms();

        let key = opts
            .account_key
            .clone()
            .unwrap_or_else(|| derive_account_key(&cred));

        let existing_id = if opts.force_new {
            None
        } else {
            opts.account_id
                .as_deref()
                .filter(|id| reg.position(id).is_some())
                .map(str::to_string)
                .or_else(|| reg.find_by_key(&key).map(|a| a.id.clone()))
        };

        let resource_url = cred.resource_url.clone();
        let id = match existing_id {
            Some(id) => {
                let account = reg.get_mut(&id).expect("id was just resolved");
                account.token = cred;
                account.resource_url = resource_url;
                account.exhausted_until = 0;
                account.last_error_code = None;
                account.account_key = Some(key);
                account.updated_at = now;
                debug!(account_id = %id, "updated existing account");
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                reg.accounts.push(Account {
                    id: id.clone(),
                    token: cred,
                    resource_url,
                    exhausted_until: 0,
                    last_error_code: None,
                    account_key: Some(key),
                    created_at: now,
                    updated_at: now,
                });
                info!(account_id = %id, total = reg.accounts.len(), "registered new account");
                id
            }
        };

        if opts.set_active || reg.accounts.len() == 1 {
            reg.active_account_id = Some(id.clone());
        }
        reg.repair_active_pointer();
        self.save_registry(&reg)?;

        let account = reg.get(&id).expect("account just written").clone();
        guard.release();

        // Keep the single-credential file in step with the active identity so
        // legacy single-account consumers see the latest login.
        if reg.active_account_id.as_deref() == Some(id.as_str()) {
            self.sync_store_to(&account).await?;
        }

        Ok(account)
    }

    /// Resolve the account that should service the next request, validated.
    ///
    /// Selection happens under the registry lock; the refresher's validity
    /// check happens outside it. An auth-rejected identity is put into
    /// cooldown and selection retries against the remaining accounts until
    /// each has been tried once.
    pub async fn get_active(
        &self,
        opts: GetActiveOptions,
    ) -> Result<Option<RuntimeAccount>, CastorError> {
        let mut tried: HashSet<String> = HashSet::new();

        loop {
            let Some(account) = self.select_account(&opts, &tried).await? else {
                return Ok(None);
            };

            if !opts.require_valid_token {
                return Ok(Some(runtime(&account, account.token.clone())));
            }

            self.sync_store_to(&account).await?;

            match Refresher::ensure_valid(&self.store, &self.http).await? {
                AccessOutcome::Valid(cred) => {
                    self.write_back_credential(&account.id, &cred).await?;
                    return Ok(Some(runtime(&account, cred)));
                }
                AccessOutcome::AuthRejected | AccessOutcome::NotAuthenticated => {
                    warn!(account_id = %account.id, "account rejected by auth server; cooling down");
                    self.mark_quota_exhausted(&account.id, "auth_rejected").await?;
                    tried.insert(account.id);
                }
                AccessOutcome::Failed => {
                    warn!(account_id = %account.id, "token validation failed; trying next account");
                    tried.insert(account.id);
                }
            }
        }
    }

    /// Put an account into quota cooldown and rotate the active pointer off it.
    pub async fn mark_quota_exhausted(
        &self,
        account_id: &str,
        error_code: &str,
    ) -> Result<(), CastorError> {
        let guard = FileLock::acquire(&self.lock_path()).await?;
        let mut reg = self.load_or_bridge();
        let now = now_ms();

        let Some(account) = reg.get_mut(account_id) else {
            guard.release();
            return Ok(());
        };

        let cooldown_ms = i64::try_from(self.cfg.quota_cooldown.as_millis()).unwrap_or(i64::MAX);
        account.exhausted_until = now.saturating_add(cooldown_ms);
        account.last_error_code = Some(error_code.to_string());
        account.updated_at = now;
        info!(
            account_id,
            error_code,
            until = account.exhausted_until,
            "account marked quota-exhausted"
        );

        if reg.active_account_id.as_deref() == Some(account_id) {
            if let Some(next) = reg.next_healthy_after(Some(account_id), &HashSet::new(), now) {
                let next_id = next.id.clone();
                info!(from = %account_id, to = %next_id, "rotated active account");
                reg.active_account_id = Some(next_id);
            }
        }

        self.save_registry(&reg)?;
        guard.release();
        Ok(())
    }

    /// Explicit mid-request failover. Returns the new active account id, or
    /// `None` when no healthy candidate exists.
    pub async fn switch_to_next_healthy(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<Option<String>, CastorError> {
        let guard = FileLock::acquire(&self.lock_path()).await?;
        let mut reg = self.load_or_bridge();
        reg.repair_active_pointer();
        let now = now_ms();

        let next = reg
            .next_healthy_after(reg.active_account_id.as_deref(), exclude, now)
            .map(|a| a.id.clone());

        if let Some(id) = &next {
            reg.active_account_id = Some(id.clone());
            self.save_registry(&reg)?;
            info!(account_id = %id, "switched active account");
        }

        guard.release();
        Ok(next)
    }

    /// One locked selection round: repair the pointer, skip tried/exhausted
    /// accounts by forward rotation, persist any pointer movement.
    async fn select_account(
        &self,
        opts: &GetActiveOptions,
        tried: &HashSet<String>,
    ) -> Result<Option<Account>, CastorError> {
        let guard = FileLock::acquire(&self.lock_path()).await?;
        let mut reg = self.load_or_bridge();
        let mut dirty = reg.repair_active_pointer();
        let now = now_ms();

        let acceptable = |a: &Account| {
            !tried.contains(&a.id) && (opts.allow_exhausted || !a.is_exhausted(now))
        };

        let initial = opts
            .preferred_account_id
            .as_deref()
            .filter(|id| reg.position(id).is_some())
            .or(reg.active_account_id.as_deref())
            .map(str::to_string);

        let chosen = match initial {
            Some(id) if reg.get(&id).is_some_and(acceptable) => Some(id),
            anchor => {
                // With allow_exhausted, every cooldown is treated as elapsed
                // and only explicit exclusions apply.
                let horizon = if opts.allow_exhausted { i64::MIN } else { now };
                reg.next_healthy_after(anchor.as_deref(), tried, horizon)
                    .map(|a| a.id.clone())
            }
        };

        let Some(id) = chosen else {
            guard.release();
            debug!("no selectable account in registry");
            return Ok(None);
        };

        if reg.active_account_id.as_deref() != Some(id.as_str()) {
            reg.active_account_id = Some(id.clone());
            dirty = true;
        }
        if dirty {
            self.save_registry(&reg)?;
        }

        let account = reg.get(&id).expect("selected id exists").clone();
        guard.release();
        Ok(Some(account))
    }

    /// Load the registry, bridging a pre-registry single credential into a
    /// one-account registry on first touch. Callers hold the registry lock.
    fn load_or_bridge(&self) -> AccountRegistry {
        match fs::read(&self.cfg.accounts_path) {
            Ok(bytes) => match serde_json::from_slice::<AccountRegistry>(&bytes) {
                Ok(reg) => reg,
                Err(e) => {
                    warn!(
                        path = %self.cfg.accounts_path.display(),
                        error = %e,
                        "accounts file is unreadable; starting from an empty registry"
                    );
                    AccountRegistry::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.bridge_legacy_credential(),
            Err(e) => {
                warn!(error = %e, "failed to read accounts file");
                AccountRegistry::default()
            }
        }
    }

    fn bridge_legacy_credential(&self) -> AccountRegistry {
        let Some(cred) = self.store.load() else {
            return AccountRegistry::default();
        };

        let now = now_ms();
        let id = Uuid::new_v4().to_string();
        let reg = AccountRegistry {
            version: REGISTRY_VERSION,
            active_account_id: Some(id.clone()),
            accounts: vec![Account {
                id,
                resource_url: cred.resource_url.clone(),
                account_key: Some(derive_account_key(&cred)),
                token: cred,
                exhausted_until: 0,
                last_error_code: None,
                created_at: now,
                updated_at: now,
            }],
        };

        match self.save_registry(&reg) {
            Ok(()) => info!("migrated single credential into a one-account registry"),
            Err(e) => warn!(error = %e, "failed to persist migrated registry"),
        }
        reg
    }

    fn save_registry(&self, reg: &AccountRegistry) -> Result<(), CastorError> {
        let body = serde_json::to_vec_pretty(reg)?;
        write_atomic_private(&self.cfg.accounts_path, &body)
    }

    /// Point the single-credential store at this account's grant.
    ///
    /// The store file is shared with sibling processes, so the write runs
    /// under the store's own lock and re-reads the freshest on-disk state
    /// first. When the file already holds the same grant, or a newer grant
    /// for the same identity (another process rotated the refresh token
    /// after our registry snapshot), the on-disk copy wins; clobbering it
    /// would present a dead refresh token on the next exchange.
    async fn sync_store_to(&self, account: &Account) -> Result<(), CastorError> {
        let guard = FileLock::acquire(&self.store.lock_path()).await?;

        let overwrite = match self.store.load() {
            None => true,
            Some(on_disk) if on_disk.refresh_token == account.token.refresh_token => false,
            Some(on_disk) => {
                on_disk.expiry_date <= account.token.expiry_date
                    || claims_conflict(&on_disk, account)
            }
        };
        if overwrite {
            self.store.save(&account.token)?;
        } else {
            debug!(account_id = %account.id, "store holds a fresher grant; leaving it in place");
        }

        guard.release();
        Ok(())
    }

    /// Persist a refreshed credential back into the account entry.
    async fn write_back_credential(
        &self,
        account_id: &str,
        cred: &QwenCredential,
    ) -> Result<(), CastorError> {
        let guard = FileLock::acquire(&self.lock_path()).await?;
        let mut reg = self.load_or_bridge();

        if let Some(account) = reg.get_mut(account_id) {
            if account.token.access_token != cred.access_token
                || account.token.expiry_date != cred.expiry_date
            {
                account.token = cred.clone();
                if account.resource_url.is_none() {
                    account.resource_url = cred.resource_url.clone();
                }
                account.updated_at = now_ms();
                self.save_registry(&reg)?;
            }
        }

        guard.release();
        Ok(())
    }
}

/// True when the stored credential's token claims name a different user than
/// the account. Hash-derived keys rotate with the refresh token itself, so
/// their inequality carries no identity signal and never forces an overwrite.
fn claims_conflict(on_disk: &QwenCredential, account: &Account) -> bool {
    let Some(key) = account.account_key.as_deref() else {
        return false;
    };
    let disk_key = derive_account_key(on_disk);
    if key.starts_with("rt:") || disk_key.starts_with("rt:") {
        return false;
    }
    disk_key != key
}

fn runtime(account: &Account, cred: QwenCredential) -> RuntimeAccount {
    RuntimeAccount {
        id: account.id.clone(),
        resource_url: cred.resource_url.clone().or_else(|| account.resource_url.clone()),
        credential: cred,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> AccountManager {
        let root = dir.path().join("creds");
        let store = TokenStore::new(AuthConfig::with_dir(root.clone()));
        let cfg = RegistryConfig {
            credential_dir: root.clone(),
            accounts_path: root.join("accounts.json"),
            quota_cooldown: Duration::from_secs(1800),
        };
        AccountManager::new(cfg, store, reqwest::Client::new())
    }

    fn cred(tag: &str) -> QwenCredential {
        QwenCredential {
            access_token: format!("opaque-at-{tag}"),
            refresh_token: format!("rt-{tag}"),
            token_type: "Bearer".to_string(),
            expiry_date: now_ms() + 3_600_000,
            resource_url: None,
        }
    }

    fn unvalidated() -> GetActiveOptions {
        GetActiveOptions {
            require_valid_token: false,
            ..GetActiveOptions::default()
        }
    }

    #[tokio::test]
    async fn upsert_deduplicates_by_account_key() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let first = m.upsert(cred("a"), UpsertOptions::default()).await.expect("insert");
        let again = m
            .upsert(cred("a"), UpsertOptions::default())
            .await
            .expect("update");
        assert_eq!(first.id, again.id);

        let forced = m
            .upsert(
                cred("a"),
                UpsertOptions {
                    force_new: true,
                    ..UpsertOptions::default()
                },
            )
            .await
            .expect("forced insert");
        assert_ne!(first.id, forced.id);
    }

    #[tokio::test]
    async fn upsert_clears_exhaustion_on_relogin() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let a = m.upsert(cred("a"), UpsertOptions::default()).await.expect("insert");
        m.mark_quota_exhausted(&a.id, "insufficient_quota").await.expect("mark");

        let relogged = m.upsert(cred("a"), UpsertOptions::default()).await.expect("relogin");
        assert_eq!(relogged.id, a.id);
        assert_eq!(relogged.exhausted_until, 0);
        assert!(relogged.last_error_code.is_none());
    }

    #[tokio::test]
    async fn quota_exhaustion_rotates_past_exhausted_accounts() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let a = m
            .upsert(cred("a"), UpsertOptions { set_active: true, ..UpsertOptions::default() })
            .await
            .expect("a");
        let b = m.upsert(cred("b"), UpsertOptions::default()).await.expect("b");
        let c = m.upsert(cred("c"), UpsertOptions::default()).await.expect("c");

        m.mark_quota_exhausted(&b.id, "insufficient_quota").await.expect("mark b");
        m.mark_quota_exhausted(&a.id, "insufficient_quota").await.expect("mark a");

        // A exhausted, B exhausted: the wraparound-safe forward search lands on C.
        let active = m.get_active(unvalidated()).await.expect("get").expect("account");
        assert_eq!(active.id, c.id);
    }

    #[tokio::test]
    async fn get_active_returns_none_when_everyone_is_cooling() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let a = m.upsert(cred("a"), UpsertOptions::default()).await.expect("a");
        m.mark_quota_exhausted(&a.id, "insufficient_quota").await.expect("mark");

        assert!(m.get_active(unvalidated()).await.expect("get").is_none());

        // allow_exhausted opts back into the cooled account.
        let opts = GetActiveOptions {
            allow_exhausted: true,
            require_valid_token: false,
            ..GetActiveOptions::default()
        };
        let got = m.get_active(opts).await.expect("get").expect("account");
        assert_eq!(got.id, a.id);
    }

    #[tokio::test]
    async fn switch_to_next_healthy_honors_exclusions() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let a = m
            .upsert(cred("a"), UpsertOptions { set_active: true, ..UpsertOptions::default() })
            .await
            .expect("a");
        let b = m.upsert(cred("b"), UpsertOptions::default()).await.expect("b");
        let c = m.upsert(cred("c"), UpsertOptions::default()).await.expect("c");

        let exclude: HashSet<String> = [b.id.clone()].into_iter().collect();
        let next = m.switch_to_next_healthy(&exclude).await.expect("switch");
        assert_eq!(next.as_deref(), Some(c.id.as_str()));

        // Now active=c; excluding everyone reports no healthy account.
        let all: HashSet<String> = [a.id, b.id, c.id].into_iter().collect();
        assert!(m.switch_to_next_healthy(&all).await.expect("switch").is_none());
    }

    #[tokio::test]
    async fn rotated_grant_on_disk_survives_selection() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        m.upsert(cred("a"), UpsertOptions { set_active: true, ..UpsertOptions::default() })
            .await
            .expect("insert");

        // A sibling process rotated the refresh token after our registry
        // snapshot was taken. Selection must adopt the rotated grant, not
        // clobber it with the stale registry copy.
        let mut rotated = cred("a-rotated");
        rotated.expiry_date = now_ms() + 7_200_000;
        m.token_store().save(&rotated).expect("rotate on disk");

        let got = m
            .get_active(GetActiveOptions::default())
            .await
            .expect("get")
            .expect("account");
        assert_eq!(got.credential.refresh_token, "rt-a-rotated");

        let on_disk = m.token_store().load().expect("credential present");
        assert_eq!(on_disk.refresh_token, "rt-a-rotated");
    }

    #[tokio::test]
    async fn stale_store_copy_is_replaced_during_selection() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        m.upsert(cred("a"), UpsertOptions { set_active: true, ..UpsertOptions::default() })
            .await
            .expect("insert");

        // The on-disk grant expires sooner than the registry copy, so it is
        // the stale one and gets replaced.
        let mut stale = cred("other");
        stale.expiry_date = now_ms() + 600_000;
        m.token_store().save(&stale).expect("seed stale grant");

        let got = m
            .get_active(GetActiveOptions::default())
            .await
            .expect("get")
            .expect("account");
        assert_eq!(got.credential.refresh_token, "rt-a");

        let on_disk = m.token_store().load().expect("credential present");
        assert_eq!(on_disk.refresh_token, "rt-a");
    }

    #[tokio::test]
    async fn legacy_single_credential_is_bridged_into_the_registry() {
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        m.token_store().save(&cred("legacy")).expect("seed single credential");

        let active = m.get_active(unvalidated()).await.expect("get").expect("account");
        assert_eq!(active.credential.refresh_token, "rt-legacy");
        assert!(m.cfg.accounts_path.exists());
    }

    #[tokio::test]
    async fn valid_account_is_returned_without_any_refresh_call() {
        // require_valid_token=true, far-future expiry: ensure_valid must
        // short-circuit on the stored credential, no token endpoint involved
        // (there is no server to talk to in this test).
        let dir = TempDir::new().expect("tempdir");
        let m = manager(&dir);

        let a = m
            .upsert(cred("a"), UpsertOptions { set_active: true, ..UpsertOptions::default() })
            .await
            .expect("a");

        let got = m
            .get_active(GetActiveOptions::default())
            .await
            .expect("get")
            .expect("account");
        assert_eq!(got.id, a.id);
        assert_eq!(got.credential.access_token, "opaque-at-a");
    }
}
