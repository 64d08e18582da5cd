//! Trading engine - one supervisor task per funded account
//!
//! Tasks share nothing but the nonce authority inside their adapters. A
//! panic or failure in one task never reaches the others; shutdown is a
//! broadcast flag every task checks between cycles.

use log::{error, info};
use meridian_clock::Clock;
use meridian_core::{AccountId, TradeResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bootstrap::FundedAccount;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::status::AccountStatus;
use crate::strategy::Strategy;
use crate::supervisor::{AccountSupervisor, SupervisorSettings};

const TRADE_CHANNEL_CAPACITY: usize = 256;

pub struct TradingEngine {
    shutdown_tx: watch::Sender<bool>,
    trades_tx: broadcast::Sender<TradeResult>,
    statuses: BTreeMap<AccountId, watch::Receiver<AccountStatus>>,
    tasks: Vec<(AccountId, JoinHandle<AccountStatus>)>,
}

impl TradingEngine {
    /// Spawn a supervisor for every funded account
    pub fn start(
        config: &EngineConfig,
        funded: Vec<FundedAccount>,
        strategy: Arc<dyn Strategy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        if funded.is_empty() {
            return Err(EngineError::NoFundedAccounts);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let (trades_tx, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);

        // Build every supervisor before spawning any, so a setup error
        // leaves nothing running
        let mut supervisors = Vec::with_capacity(funded.len());
        for account in funded {
            let settings = SupervisorSettings::new(config, &account.settings);
            let (mut supervisor, status_rx) = AccountSupervisor::new(
                account.adapter,
                account.settings.exit_rules(),
                config.risk.clone(),
                strategy.clone(),
                settings,
                clock.clone(),
                trades_tx.clone(),
            )?;
            if let Some(reason) = account.startup_failure {
                supervisor.start_degraded(reason);
            }
            supervisors.push((supervisor, status_rx));
        }

        let mut statuses = BTreeMap::new();
        let mut tasks = Vec::with_capacity(supervisors.len());
        for (supervisor, status_rx) in supervisors {
            let account = supervisor.account().clone();
            let handle = tokio::spawn(supervisor.run(shutdown_tx.subscribe()));
            statuses.insert(account.clone(), status_rx);
            tasks.push((account, handle));
        }

        info!("[ENGINE] started {} account supervisors", tasks.len());
        Ok(Self {
            shutdown_tx,
            trades_tx,
            statuses,
            tasks,
        })
    }

    /// Closed trades from every account
    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeResult> {
        self.trades_tx.subscribe()
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.statuses.keys().cloned().collect()
    }

    /// Latest published status of one account
    pub fn status(&self, account: &AccountId) -> Option<AccountStatus> {
        self.statuses.get(account).map(|rx| rx.borrow().clone())
    }

    pub fn statuses(&self) -> Vec<AccountStatus> {
        self.statuses.values().map(|rx| rx.borrow().clone()).collect()
    }

    /// Wait for a status change on `account`
    pub async fn status_changed(&mut self, account: &AccountId) -> Option<AccountStatus> {
        let rx = self.statuses.get_mut(account)?;
        rx.changed().await.ok()?;
        Some(rx.borrow_and_update().clone())
    }

    /// Stop every task after its current cycle and collect final statuses
    ///
    /// Open positions and pending orders stay on the exchange.
    pub async fn shutdown(self) -> Vec<AccountStatus> {
        info!("[ENGINE] shutting down {} supervisors", self.tasks.len());
        self.shutdown_tx.send_replace(true);

        let mut finals = Vec::with_capacity(self.tasks.len());
        for (account, handle) in self.tasks {
            match handle.await {
                Ok(status) => finals.push(status),
                Err(err) => {
                    error!("[ENGINE] {} task ended abnormally: {}", account, err);
                    if let Some(rx) = self.statuses.get(&account) {
                        finals.push(rx.borrow().clone());
                    }
                }
            }
        }

        info!("[ENGINE] all supervisors stopped");
        finals
    }
}
