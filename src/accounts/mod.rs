//! Account registry
//!
//! An account is identified by `(provider, external_key)`. Capabilities,
//! alias and status can change at any time. Accounts are soft-disabled
//! rather than removed while reply entries for their messages are open.

use crate::provider::{Capability, ProviderContext};
use crate::store::{conversion_error, row_ts, to_ts, EncryptedStore};
use crate::{MailHubError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Independent capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub mail: bool,
    pub calendar: bool,
    pub contacts: bool,
}

impl CapabilitySet {
    pub fn mail_only() -> Self {
        Self {
            mail: true,
            ..Self::default()
        }
    }

    pub fn from_list(caps: &[Capability]) -> Self {
        let mut set = Self::default();
        for cap in caps {
            set.set(*cap, true);
        }
        set
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Mail => self.mail,
            Capability::Calendar => self.calendar,
            Capability::Contacts => self.contacts,
        }
    }

    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::Mail => self.mail = enabled,
            Capability::Calendar => self.calendar = enabled,
            Capability::Contacts => self.contacts = enabled,
        }
    }

    pub fn enabled(&self) -> Vec<Capability> {
        [Capability::Mail, Capability::Calendar, Capability::Contacts]
            .into_iter()
            .filter(|c| self.has(*c))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub provider: String,
    pub external_key: String,
    pub alias: Option<String>,
    pub address: Option<String>,
    pub capabilities: CapabilitySet,
    /// Name of the entry in the secret table, never the secret itself
    pub secret_ref: Option<String>,
    pub status: AccountStatus,
    pub status_detail: Option<String>,
    pub disabled: bool,
    pub bootstrap_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Alias if set, else the external key
    pub fn display_name(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(&self.external_key)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            provider: row.get(1)?,
            external_key: row.get(2)?,
            alias: row.get(3)?,
            address: row.get(4)?,
            capabilities: CapabilitySet {
                mail: row.get(5)?,
                calendar: row.get(6)?,
                contacts: row.get(7)?,
            },
            secret_ref: row.get(8)?,
            status: match status.as_str() {
                "active" => AccountStatus::Active,
                "error" => AccountStatus::Error,
                other => return Err(conversion_error(9, format!("unknown account status {}", other))),
            },
            status_detail: row.get(10)?,
            disabled: row.get(11)?,
            bootstrap_pending: row.get(12)?,
            created_at: row_ts(row, 13)?,
            updated_at: row_ts(row, 14)?,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, provider, external_key, alias, address, cap_mail, cap_calendar, \
     cap_contacts, secret_ref, status, status_detail, disabled, bootstrap_pending, created_at, updated_at";

/// Input for [`AccountRegistry::bind`]
#[derive(Debug, Clone, Default)]
pub struct BindRequest {
    pub provider: String,
    pub external_key: String,
    pub alias: Option<String>,
    pub address: Option<String>,
    pub capabilities: CapabilitySet,
    /// Stored in the secret table; only the reference lands on the account
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindOutcome {
    pub account: Account,
    pub created: bool,
}

/// CRUD over bound accounts
pub struct AccountRegistry<'a> {
    store: &'a EncryptedStore,
}

impl<'a> AccountRegistry<'a> {
    pub fn new(store: &'a EncryptedStore) -> Self {
        Self { store }
    }

    /// Bind or re-bind an account.
    ///
    /// A new account starts with a pending bootstrap pass. Re-binding an
    /// existing one updates its attributes and re-enables it, but keeps its
    /// cursors and bootstrap state.
    pub fn bind(&self, request: &BindRequest) -> Result<BindOutcome> {
        let provider = request.provider.trim().to_lowercase();
        let external_key = request.external_key.trim();
        if provider.is_empty() || external_key.is_empty() {
            return Err(MailHubError::InvalidState(
                "provider and external key are required to bind an account".to_string(),
            ));
        }
        if request.capabilities == CapabilitySet::default() {
            return Err(MailHubError::InvalidState(
                "an account needs at least one capability".to_string(),
            ));
        }

        let secret_ref = match &request.secret {
            Some(secret) => {
                let name = format!("account:{}:{}", provider, external_key);
                self.store.secrets().set(&name, secret)?;
                Some(name)
            }
            None => None,
        };

        let existing = self.find(&provider, external_key)?;
        let now = to_ts(&Utc::now());
        let caps = request.capabilities;

        let id = match &existing {
            Some(account) => {
                self.store.conn().execute(
                    "UPDATE accounts SET
                        alias = COALESCE(?2, alias),
                        address = COALESCE(?3, address),
                        cap_mail = ?4, cap_calendar = ?5, cap_contacts = ?6,
                        secret_ref = COALESCE(?7, secret_ref),
                        disabled = 0, status = 'active', status_detail = NULL,
                        updated_at = ?8
                     WHERE id = ?1",
                    params![
                        account.id,
                        request.alias,
                        request.address,
                        caps.mail,
                        caps.calendar,
                        caps.contacts,
                        secret_ref,
                        now
                    ],
                )?;
                account.id
            }
            None => {
                self.store.conn().execute(
                    "INSERT INTO accounts
                        (provider, external_key, alias, address, cap_mail, cap_calendar, cap_contacts,
                         secret_ref, status, disabled, bootstrap_pending, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', 0, 1, ?9, ?9)",
                    params![
                        provider,
                        external_key,
                        request.alias,
                        request.address,
                        caps.mail,
                        caps.calendar,
                        caps.contacts,
                        secret_ref,
                        now
                    ],
                )?;
                self.store.conn().last_insert_rowid()
            }
        };

        let account = self.require(id)?;
        tracing::info!(
            account_id = id,
            provider = %account.provider,
            created = existing.is_none(),
            "Account bound"
        );
        Ok(BindOutcome {
            account,
            created: existing.is_none(),
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
        Ok(self
            .store
            .conn()
            .query_row(&sql, params![id], Account::from_row)
            .optional()?)
    }

    pub fn require(&self, id: i64) -> Result<Account> {
        self.get(id)?
            .ok_or_else(|| MailHubError::NotFound(format!("account {}", id)))
    }

    pub fn find(&self, provider: &str, external_key: &str) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE provider = ?1 AND external_key = ?2",
            ACCOUNT_COLUMNS
        );
        Ok(self
            .store
            .conn()
            .query_row(&sql, params![provider.to_lowercase(), external_key], Account::from_row)
            .optional()?)
    }

    /// Resolve a numeric id, alias or external key
    pub fn resolve(&self, reference: &str) -> Result<Account> {
        let reference = reference.trim();
        if let Ok(id) = reference.parse::<i64>() {
            if let Some(account) = self.get(id)? {
                return Ok(account);
            }
        }
        let mut matches: Vec<Account> = self
            .list()?
            .into_iter()
            .filter(|a| a.external_key == reference || a.alias.as_deref() == Some(reference))
            .collect();
        match matches.len() {
            0 => Err(MailHubError::NotFound(format!("account {}", reference))),
            1 => Ok(matches.remove(0)),
            _ => Err(MailHubError::Ambiguous {
                target: reference.to_string(),
                candidates: matches.iter().map(|a| a.id).collect(),
            }),
        }
    }

    pub fn list(&self) -> Result<Vec<Account>> {
        let sql = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let mut stmt = self.store.conn().prepare(&sql)?;
        let rows = stmt.query_map([], Account::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_enabled(&self) -> Result<Vec<Account>> {
        Ok(self.list()?.into_iter().filter(|a| !a.disabled).collect())
    }

    pub fn set_alias(&self, id: i64, alias: Option<&str>) -> Result<Account> {
        let alias = alias.map(str::trim).filter(|a| !a.is_empty());
        self.update(id, "alias = ?2", params![id, alias, to_ts(&Utc::now())])
    }

    pub fn set_capabilities(&self, id: i64, caps: CapabilitySet) -> Result<Account> {
        let changed = self.store.conn().execute(
            "UPDATE accounts SET cap_mail = ?2, cap_calendar = ?3, cap_contacts = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, caps.mail, caps.calendar, caps.contacts, to_ts(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(MailHubError::NotFound(format!("account {}", id)));
        }
        self.require(id)
    }

    pub fn set_status(&self, id: i64, status: AccountStatus, detail: Option<&str>) -> Result<()> {
        self.store.conn().execute(
            "UPDATE accounts SET status = ?2, status_detail = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), detail, to_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Soft-disable: the account stops syncing but its data stays
    pub fn disable(&self, id: i64) -> Result<Account> {
        let account = self.update(id, "disabled = 1", params![id, to_ts(&Utc::now())])?;
        tracing::info!(account_id = id, "Account disabled");
        Ok(account)
    }

    /// Hard delete. Refused while reply entries for its messages are open.
    pub fn remove(&self, id: i64) -> Result<()> {
        let account = self.require(id)?;
        let open = self.store.open_reply_count_for_account(id)?;
        if open > 0 {
            return Err(MailHubError::InvalidState(format!(
                "account {} has {} open reply entries; disable it instead",
                account.display_name(),
                open
            )));
        }
        if let Some(name) = &account.secret_ref {
            self.store.secrets().delete(name)?;
        }
        self.store
            .conn()
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        tracing::info!(account_id = id, "Account removed");
        Ok(())
    }

    /// Everything a connector needs, with the account secret resolved
    pub fn provider_context(&self, account: &Account, capability: Capability) -> Result<ProviderContext> {
        let secret = match &account.secret_ref {
            Some(name) => self.store.secrets().get(name)?,
            None => None,
        };
        Ok(ProviderContext {
            account_id: account.id,
            provider: account.provider.clone(),
            external_key: account.external_key.clone(),
            address: account.address.clone(),
            capability,
            secret,
        })
    }

    fn update(&self, id: i64, assignment: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Account> {
        // the timestamp is always the last parameter
        let sql = format!(
            "UPDATE accounts SET {}, updated_at = ?{} WHERE id = ?1",
            assignment,
            params.len()
        );
        let changed = self.store.conn().execute(&sql, params)?;
        if changed == 0 {
            return Err(MailHubError::NotFound(format!("account {}", id)));
        }
        self.require(id)
    }
}
