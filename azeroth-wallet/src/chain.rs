//! Chain collaborators.
//!
//! The wallet core never speaks JSON-RPC itself. A host supplies an [`AzerothChain`] per network
//! (through a [`ChainConnector`]) that covers the plain transport, the Azeroth contract surface and
//! the ERC token calls. Retries and endpoint rotation live behind that trait; the core only sees
//! success or an exhausted-retries error.
//!
//! [`TimeoutChain`] bounds every call by the network's request timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azeroth_crypto::{AffinePoint, Fr, SymmetricCiphertext, Upk};
use serde::{Deserialize, Serialize};

use crate::config::WalletConfig;
use crate::error::{Result, WalletError};
use crate::snark_input::ContractArgs;
use crate::types::{
    BlockInfo, BlockRange, GasEstimation, Network, Token, TokenMeta, TransactionInfo, TxResult,
    ZkTransferEvent,
};

/// Shielded transfer entry points of the Azeroth contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractEntry {
    ZkTransfer20,
    ZkTransfer721,
    ZkTransfer1155,
}

impl ContractEntry {
    pub fn method_name(&self) -> &'static str {
        match self {
            ContractEntry::ZkTransfer20 => "zkTransfer20",
            ContractEntry::ZkTransfer721 => "zkTransfer721",
            ContractEntry::ZkTransfer1155 => "zkTransfer1155",
        }
    }
}

/// Everything the wallet core reads from or writes to one network.
#[async_trait]
pub trait AzerothChain: Send + Sync {
    // ═══ transport ═══

    async fn block_number(&self) -> Result<u64>;

    async fn get_block(&self, number: u64) -> Result<BlockInfo>;

    async fn get_transaction(&self, hash: &str) -> Result<TransactionInfo>;

    async fn send_native_transfer(&self, sender: &str, to: &str, amount: u128) -> Result<TxResult>;

    // ═══ Azeroth contract ═══

    /// `LogZkTransfer` events in the inclusive range.
    async fn get_zk_transfer_events(&self, range: BlockRange) -> Result<Vec<ZkTransferEvent>>;

    async fn get_apk(&self) -> Result<AffinePoint>;

    async fn get_zk_transfer_fee(&self) -> Result<u128>;

    /// An unregistered address yields [`Upk::empty`].
    async fn get_user_public_keys(&self, address: &str) -> Result<Upk>;

    /// `registerUser(ena, pkOwn, [pkEnc.x, pkEnc.y])`.
    async fn register_user(&self, upk: &Upk, sender: &str) -> Result<TxResult>;

    async fn estimate_register_user(&self, upk: &Upk, sender: &str) -> Result<GasEstimation>;

    async fn is_nullified(&self, nullifier: &Fr) -> Result<bool>;

    async fn get_ena_length(&self, ena: &Fr) -> Result<u64>;

    async fn get_ciphertext(&self, ena: &Fr, index: u64) -> Result<SymmetricCiphertext>;

    async fn get_root_top(&self) -> Result<Fr>;

    async fn get_merkle_path(&self, index: u64) -> Result<Vec<Fr>>;

    async fn zk_transfer(
        &self,
        entry: ContractEntry,
        args: &ContractArgs,
        sender: &str,
        value: u128,
    ) -> Result<TxResult>;

    // ═══ ERC tokens ═══

    async fn send_erc_transfer(
        &self,
        token: &Token,
        sender: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxResult>;

    async fn send_erc_approval(
        &self,
        token: &Token,
        owner: &str,
        spender: &str,
        amount: u128,
    ) -> Result<TxResult>;

    async fn get_token_meta(&self, contract_address: &str, token_id: &Fr) -> Result<TokenMeta>;
}

/// Builds the chain handle for a network.
pub trait ChainConnector: Send + Sync {
    fn connect(&self, network: &Network) -> Result<Arc<dyn AzerothChain>>;
}

/// Connect and wrap the handle in the network's request timeout.
pub fn connect_with_timeout(
    connector: &dyn ChainConnector,
    network: &Network,
    config: &WalletConfig,
) -> Result<Arc<dyn AzerothChain>> {
    let inner = connector.connect(network)?;
    let limit = config.request_timeout(network.average_block_time);
    Ok(Arc::new(TimeoutChain::new(inner, limit)))
}

/// Run `fut`, mapping an elapsed deadline to [`WalletError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, secs = limit.as_secs(), "chain request timed out");
            Err(WalletError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIMEOUT WRAPPER
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounds every call of the wrapped chain by one deadline.
pub struct TimeoutChain {
    inner: Arc<dyn AzerothChain>,
    limit: Duration,
}

impl TimeoutChain {
    pub fn new(inner: Arc<dyn AzerothChain>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

#[async_trait]
impl AzerothChain for TimeoutChain {
    async fn block_number(&self) -> Result<u64> {
        with_timeout("getBlockNumber", self.limit, self.inner.block_number()).await
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo> {
        with_timeout("getBlock", self.limit, self.inner.get_block(number)).await
    }

    async fn get_transaction(&self, hash: &str) -> Result<TransactionInfo> {
        with_timeout("getTransaction", self.limit, self.inner.get_transaction(hash)).await
    }

    async fn send_native_transfer(&self, sender: &str, to: &str, amount: u128) -> Result<TxResult> {
        with_timeout(
            "sendNativeTokenTransfer",
            self.limit,
            self.inner.send_native_transfer(sender, to, amount),
        )
        .await
    }

    async fn get_zk_transfer_events(&self, range: BlockRange) -> Result<Vec<ZkTransferEvent>> {
        with_timeout(
            "getPastEventLogs",
            self.limit,
            self.inner.get_zk_transfer_events(range),
        )
        .await
    }

    async fn get_apk(&self) -> Result<AffinePoint> {
        with_timeout("getAPK", self.limit, self.inner.get_apk()).await
    }

    async fn get_zk_transfer_fee(&self) -> Result<u128> {
        with_timeout("getZkTransferFee", self.limit, self.inner.get_zk_transfer_fee()).await
    }

    async fn get_user_public_keys(&self, address: &str) -> Result<Upk> {
        with_timeout(
            "getUserPublicKeys",
            self.limit,
            self.inner.get_user_public_keys(address),
        )
        .await
    }

    async fn register_user(&self, upk: &Upk, sender: &str) -> Result<TxResult> {
        with_timeout("registerUser", self.limit, self.inner.register_user(upk, sender)).await
    }

    async fn estimate_register_user(&self, upk: &Upk, sender: &str) -> Result<GasEstimation> {
        with_timeout(
            "estimateRegisterUser",
            self.limit,
            self.inner.estimate_register_user(upk, sender),
        )
        .await
    }

    async fn is_nullified(&self, nullifier: &Fr) -> Result<bool> {
        with_timeout("isNullified", self.limit, self.inner.is_nullified(nullifier)).await
    }

    async fn get_ena_length(&self, ena: &Fr) -> Result<u64> {
        with_timeout("getEnaLength", self.limit, self.inner.get_ena_length(ena)).await
    }

    async fn get_ciphertext(&self, ena: &Fr, index: u64) -> Result<SymmetricCiphertext> {
        with_timeout("getCiphertext", self.limit, self.inner.get_ciphertext(ena, index)).await
    }

    async fn get_root_top(&self) -> Result<Fr> {
        with_timeout("getRootTop", self.limit, self.inner.get_root_top()).await
    }

    async fn get_merkle_path(&self, index: u64) -> Result<Vec<Fr>> {
        with_timeout("getMerklePath", self.limit, self.inner.get_merkle_path(index)).await
    }

    async fn zk_transfer(
        &self,
        entry: ContractEntry,
        args: &ContractArgs,
        sender: &str,
        value: u128,
    ) -> Result<TxResult> {
        with_timeout(
            entry.method_name(),
            self.limit,
            self.inner.zk_transfer(entry, args, sender, value),
        )
        .await
    }

    async fn send_erc_transfer(
        &self,
        token: &Token,
        sender: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxResult> {
        with_timeout(
            "sendTransfer",
            self.limit,
            self.inner.send_erc_transfer(token, sender, to, amount),
        )
        .await
    }

    async fn send_erc_approval(
        &self,
        token: &Token,
        owner: &str,
        spender: &str,
        amount: u128,
    ) -> Result<TxResult> {
        with_timeout(
            "sendApproval",
            self.limit,
            self.inner.send_erc_approval(token, owner, spender, amount),
        )
        .await
    }

    async fn get_token_meta(&self, contract_address: &str, token_id: &Fr) -> Result<TokenMeta> {
        with_timeout(
            "getTokenMeta",
            self.limit,
            self.inner.get_token_meta(contract_address, token_id),
        )
        .await
    }
}
