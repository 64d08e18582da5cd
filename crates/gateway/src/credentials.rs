//! API credentials and where they come from
//!
//! Credentials are opaque to everything above the venue clients and are never
//! logged: `Debug` redacts them.

use meridian_core::{AccountId, AccountRole};
use std::fmt;

/// Key material for one account
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    /// Required by OKX, unused elsewhere
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field(
                "passphrase",
                &self.passphrase.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Source of per-account credentials
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, account: &AccountId) -> Option<Credentials>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads credentials from environment variables
///
/// `kraken:master` reads `MERIDIAN_KRAKEN_MASTER_API_KEY`,
/// `MERIDIAN_KRAKEN_MASTER_API_SECRET` and optionally
/// `MERIDIAN_KRAKEN_MASTER_PASSPHRASE`. User roles use `USER_` plus the
/// upper-cased user id (`MERIDIAN_KRAKEN_USER_ALICE_API_KEY`).
pub struct EnvCredentialStore {
    lookup: Lookup,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    /// Use a custom variable lookup instead of the process environment
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    pub fn prefix(account: &AccountId) -> String {
        let role = match &account.role {
            AccountRole::Master => "MASTER".to_string(),
            AccountRole::User(id) => {
                let id: String = id
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                format!("USER_{id}")
            }
        };
        format!(
            "MERIDIAN_{}_{}",
            account.exchange.as_str().to_ascii_uppercase(),
            role
        )
    }

    fn read(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn credentials(&self, account: &AccountId) -> Option<Credentials> {
        let prefix = Self::prefix(account);
        let api_key = self.read(&format!("{prefix}_API_KEY"))?;
        let api_secret = self.read(&format!("{prefix}_API_SECRET"))?;
        Some(Credentials {
            api_key,
            api_secret,
            passphrase: self.read(&format!("{prefix}_PASSPHRASE")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::ExchangeId;
    use std::collections::HashMap;

    fn store(vars: &[(&str, &str)]) -> EnvCredentialStore {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvCredentialStore::with_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_reads_master_and_user_variables() {
        let store = store(&[
            ("MERIDIAN_KRAKEN_MASTER_API_KEY", "k1"),
            ("MERIDIAN_KRAKEN_MASTER_API_SECRET", "s1"),
            ("MERIDIAN_OKX_USER_TANIA_R_API_KEY", "k2"),
            ("MERIDIAN_OKX_USER_TANIA_R_API_SECRET", "s2"),
            ("MERIDIAN_OKX_USER_TANIA_R_PASSPHRASE", "p2"),
        ]);

        let master = store
            .credentials(&AccountId::master(ExchangeId::Kraken))
            .unwrap();
        assert_eq!(master.api_key, "k1");
        assert_eq!(master.passphrase, None);

        let user = store
            .credentials(&AccountId::user(ExchangeId::Okx, "tania.r"))
            .unwrap();
        assert_eq!(user.api_secret, "s2");
        assert_eq!(user.passphrase.as_deref(), Some("p2"));
    }

    #[test]
    fn test_missing_secret_means_no_credentials() {
        let store = store(&[("MERIDIAN_BINANCE_MASTER_API_KEY", "k")]);
        assert!(
            store
                .credentials(&AccountId::master(ExchangeId::Binance))
                .is_none()
        );
    }

    #[test]
    fn test_debug_never_prints_secrets() {
        let creds = Credentials::new("public-key", "very-secret").with_passphrase("pp");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("very-secret"));
        assert!(!shown.contains("public-key"));
        assert!(!shown.contains("pp\""));
        assert!(shown.contains("<redacted>"));
    }
}
