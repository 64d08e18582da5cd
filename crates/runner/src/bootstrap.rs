//! Bootstrap - account discovery
//!
//! Builds a broker adapter for every configured account, connects it and
//! reads its balance. Accounts without usable credentials, refused by the
//! exchange or holding too little cash are skipped with a reason; the rest
//! are handed to the engine. An account that only hit a transient failure
//! is handed over too and starts degraded.

use log::{info, warn};
use meridian_clock::Clock;
use meridian_core::{AccountId, ExchangeId};
use meridian_gateway::{
    Balance, BrokerAdapter, CredentialStore, PaperConfig, PaperNonceGate, PaperVenue, Venue,
    VenueConfig,
};
use meridian_nonce::SerializationAuthority;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, ExchangeSettings, RunMode};
use crate::error::EngineError;

/// An account that passed discovery
pub struct FundedAccount {
    pub adapter: Arc<BrokerAdapter>,
    pub settings: ExchangeSettings,
    /// `None` when a transient failure kept discovery from reading it
    pub balance: Option<Balance>,
    /// Why the account's supervisor starts degraded
    pub startup_failure: Option<String>,
}

/// Result of discovering every configured account
pub struct Discovery {
    pub funded: Vec<FundedAccount>,
    pub skipped: Vec<(AccountId, String)>,
    /// Paper venue behind each account, when running in paper mode
    pub paper_venues: BTreeMap<AccountId, Arc<PaperVenue>>,
}

impl Discovery {
    pub fn funded_accounts(&self) -> Vec<AccountId> {
        self.funded.iter().map(|f| f.adapter.account().clone()).collect()
    }

    pub fn skip_reason(&self, account: &AccountId) -> Option<&str> {
        self.skipped
            .iter()
            .find(|(id, _)| id == account)
            .map(|(_, reason)| reason.as_str())
    }
}

/// Paper venue settings for one exchange
pub fn paper_config(config: &EngineConfig, settings: &ExchangeSettings, index: usize) -> PaperConfig {
    let fee_pct = config
        .paper
        .fee_pct
        .unwrap_or_else(|| settings.exit_rules().round_trip_fee_pct / rust_decimal::Decimal::TWO);
    let synthetic_feed = config.paper.synthetic_feed.clone().map(|mut feed| {
        feed.seed = feed.seed.wrapping_add(index as u64);
        feed
    });
    PaperConfig {
        fee_pct,
        starting_cash: config.paper.starting_cash,
        cash_asset: config.paper.cash_asset.clone(),
        synthetic_feed,
        latency: Duration::from_millis(config.paper.latency_ms),
    }
}

/// Connect an adapter and check its balance
///
/// A transient failure does not exclude the account: it comes back without
/// a balance, flagged to start degraded, and its first cycle retries the
/// connection. Any other failure, or cash below the exchange's minimum, is
/// returned as the reason to skip it.
pub async fn check_account(
    adapter: BrokerAdapter,
    settings: &ExchangeSettings,
) -> Result<FundedAccount, String> {
    let reading = match adapter.connect().await {
        Ok(()) => adapter
            .get_balance()
            .await
            .map_err(|err| (err, "balance unavailable")),
        Err(err) => Err((err, "unreachable")),
    };

    let balance = match reading {
        Ok(balance) => balance,
        Err((err, context)) if err.is_transient() => {
            let reason = format!("{context}: {err}");
            warn!(
                "[BOOTSTRAP] {} starting degraded, will retry: {}",
                adapter.account(),
                reason
            );
            return Ok(FundedAccount {
                adapter: Arc::new(adapter),
                settings: settings.clone(),
                balance: None,
                startup_failure: Some(reason),
            });
        }
        Err((err, context)) => return Err(format!("{context}: {err}")),
    };

    if balance.cash < settings.min_balance_to_trade {
        return Err(format!(
            "balance ${:.2} below minimum ${:.2}",
            balance.cash, settings.min_balance_to_trade
        ));
    }

    info!(
        "[BOOTSTRAP] {} funded with ${:.2} cash, {} other holdings",
        adapter.account(),
        balance.cash,
        balance.holdings.len()
    );
    Ok(FundedAccount {
        adapter: Arc::new(adapter),
        settings: settings.clone(),
        balance: Some(balance),
        startup_failure: None,
    })
}

/// Discover and fund-check every configured account
pub async fn discover_accounts(
    config: &EngineConfig,
    authority: Arc<SerializationAuthority>,
    credentials: &dyn CredentialStore,
    clock: Arc<dyn Clock>,
) -> Result<Discovery, EngineError> {
    config.validate()?;

    let mut discovery = Discovery {
        funded: Vec::new(),
        skipped: Vec::new(),
        paper_venues: BTreeMap::new(),
    };
    let mut gates: HashMap<ExchangeId, Arc<PaperNonceGate>> = HashMap::new();
    let mut keys: HashMap<(ExchangeId, String), AccountId> = HashMap::new();

    for (index, entry) in config.accounts.iter().enumerate() {
        let account = entry.id();
        let Some(settings) = config.exchange(entry.exchange) else {
            discovery
                .skipped
                .push((account, "no exchange settings".to_string()));
            continue;
        };

        let venue = match config.mode {
            RunMode::Paper => {
                let gate = gates
                    .entry(entry.exchange)
                    .or_insert_with(PaperNonceGate::new)
                    .clone();
                let paper = PaperVenue::with_gate(
                    entry.exchange,
                    paper_config(config, settings, index),
                    clock.clone(),
                    gate,
                );
                discovery.paper_venues.insert(account.clone(), paper.clone());
                Venue::paper(paper)
            }
            RunMode::Live => {
                let Some(creds) = credentials.credentials(&account) else {
                    warn!("[BOOTSTRAP] {} skipped: no credentials", account);
                    discovery.skipped.push((account, "no credentials".to_string()));
                    continue;
                };
                // Two roles on one key would share a nonce sequence and a balance
                let key = (entry.exchange, creds.api_key.clone());
                if let Some(owner) = keys.get(&key) {
                    let reason = format!("shares its API key with {owner}");
                    warn!("[BOOTSTRAP] {} skipped: {}", account, reason);
                    discovery.skipped.push((account, reason));
                    continue;
                }
                keys.insert(key, account.clone());

                let venue_config = VenueConfig {
                    base_url: settings.base_url.clone(),
                    credentials: Some(creds),
                };
                match Venue::live(entry.exchange, venue_config) {
                    Ok(venue) => venue,
                    Err(err) => {
                        warn!("[BOOTSTRAP] {} skipped: {}", account, err);
                        discovery.skipped.push((account, err.to_string()));
                        continue;
                    }
                }
            }
        };

        let adapter = BrokerAdapter::new(
            account.clone(),
            venue,
            authority.clone(),
            settings.rules(),
            clock.clone(),
        )
        .with_retry(config.retry.policy())
        .with_verify(config.retry.verify());

        match check_account(adapter, settings).await {
            Ok(funded) => discovery.funded.push(funded),
            Err(reason) => {
                warn!("[BOOTSTRAP] {} skipped: {}", account, reason);
                discovery.skipped.push((account, reason));
            }
        }
    }

    info!(
        "[BOOTSTRAP] {} of {} accounts funded",
        discovery.funded.len(),
        config.accounts.len()
    );
    Ok(discovery)
}
