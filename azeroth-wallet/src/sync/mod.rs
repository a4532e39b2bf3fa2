//! Background note sync.
//!
//! Two engines keep a wallet's notes current:
//! - [`ForwardNoteSync`] caches new `LogZkTransfer` events from the chain head into the local
//!   event cache and claims the wallet's notes from it.
//! - [`BackwardNoteSync`] walks older history on demand, a bounded window per tick.
//!
//! Both are explicit handles constructed once around a [`SyncContext`]; the host keeps one `Arc`
//! of each. Their progress goes out through the [`UpdateSyncManager`] under
//! [`FORWARD_SYNC_LISTENER_KEY`] and [`BACKWARD_SYNC_LISTENER_KEY`].

mod backward;
mod forward;
mod process;
mod progress;

pub use backward::{BackwardNoteSync, BackwardProgress, BackwardTick};
pub use forward::{ForwardNoteSync, ForwardTick};
pub use process::{
    process_cached_zk_events, EventSource, ProcessHandle, ProcessInput, ProcessProgress,
};
pub use progress::{
    ListenerCallback, ListenerHandle, ListenerId, NoteProgressNotification, UpdateSyncManager,
    BACKWARD_SYNC_LISTENER_KEY, FORWARD_SYNC_LISTENER_KEY,
};

use std::sync::Arc;

use async_trait::async_trait;
use azeroth_crypto::UserKey;
use tracing::{debug, info, warn};

use crate::chain::{connect_with_timeout, AzerothChain, ChainConnector};
use crate::config::WalletConfig;
use crate::ena_status::{check_ena_exist, EnaState};
use crate::error::{Result, WalletError};
use crate::store::LocalStore;
use crate::types::{same_address, Network, Wallet};

/// Source of a wallet's shielded secret (the host decrypts it from its key store).
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn user_key(&self, wallet: &Wallet) -> Result<UserKey>;
}

/// The wallet and network an engine runs for.
#[derive(Clone, Debug, PartialEq)]
pub struct AppProfile {
    pub wallet: Wallet,
    pub network: Network,
}

impl AppProfile {
    pub fn new(wallet: Wallet, network: Network) -> Self {
        Self { wallet, network }
    }

    /// Same wallet on the same network; other fields may have moved on.
    pub fn same_as(&self, other: &AppProfile) -> bool {
        self.network.uid == other.network.uid
            && same_address(&self.wallet.address, &other.wallet.address)
    }
}

/// Collaborators shared by both engines.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub chains: Arc<dyn ChainConnector>,
    pub progress: Arc<UpdateSyncManager<NoteProgressNotification>>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub config: WalletConfig,
}

impl SyncContext {
    /// Chain handle for `network`, bounded by its request timeout.
    pub fn chain(&self, network: &Network) -> Result<Arc<dyn AzerothChain>> {
        connect_with_timeout(self.chains.as_ref(), network, &self.config)
    }

    pub(crate) fn publish(&self, key: &str, data: NoteProgressNotification) {
        self.progress.update_data(vec![(key.to_string(), data)]);
    }

    /// The stored copy of `network`, which carries the current watermarks.
    pub(crate) fn fresh_network(&self, network: &Network) -> Result<Network> {
        Ok(self
            .store
            .network(&network.uid)?
            .unwrap_or_else(|| network.clone()))
    }

    /// Whether the wallet has an ena on this network. A recorded `true` is trusted; otherwise the
    /// contract is asked and a positive answer recorded.
    pub(crate) async fn ena_registered(
        &self,
        chain: &dyn AzerothChain,
        wallet: &Wallet,
        network: &Network,
    ) -> Result<bool> {
        if self.store.wn_meta(&wallet.address, &network.uid)?.ena_exist == Some(true) {
            return Ok(true);
        }
        match check_ena_exist(chain, &wallet.address).await? {
            EnaState::Set => {
                info!(wallet = %wallet.address, network = %network.network_name, "ena registered");
                self.store
                    .set_ena_exist(&wallet.address, &network.uid, true, None)?;
                Ok(true)
            }
            EnaState::NotSet | EnaState::Unknown => Ok(false),
        }
    }
}

/// Give a network its sync origin: the current head, recorded once.
///
/// Returns the network as stored afterwards. A failed head lookup leaves it unset.
pub async fn init_network_note_sync(
    store: &dyn LocalStore,
    chain: &dyn AzerothChain,
    network: &Network,
) -> Result<Network> {
    let current = store.network(&network.uid)?.unwrap_or_else(|| network.clone());
    if current.start_zk_event_blk_num.is_some() {
        return Ok(current);
    }

    match chain.block_number().await {
        Ok(head) => {
            debug!(network = %network.network_name, head, "recording note sync origin");
            if store.network(&network.uid)?.is_none() {
                store.add_network(current.clone())?;
            }
            store.set_network_start_blk(&network.uid, head)?;
            store
                .network(&network.uid)?
                .ok_or_else(|| WalletError::MissingData(format!("network {}", network.uid)))
        }
        Err(e) => {
            warn!(network = %network.network_name, error = %e, "head lookup failed, origin left unset");
            Ok(current)
        }
    }
}
