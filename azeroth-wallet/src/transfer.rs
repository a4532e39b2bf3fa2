//! Transfer orchestration.
//!
//! A request is classified once ([`required_transfer`]) and then runs either a plain public
//! transfer or the shielded flow: optional ERC approval, the concurrent pre-fetch of everything
//! the circuit needs, input assembly, proof, verification and the `zkTransfer*` call.
//!
//! Nothing here returns a [`WalletError`] to the caller. Every failure is classified into a
//! [`TransferFailure`]; [`transfer`] hands it to the caller's callback. No local state is written
//! by this module, so an abort before broadcast leaves the store untouched.

use std::sync::Arc;

use azeroth_crypto::{AuditKey, SymmetricCiphertext, UserKey};
use tracing::{debug, info, warn};

use crate::chain::{connect_with_timeout, AzerothChain, ChainConnector};
use crate::config::WalletConfig;
use crate::ena_status::{get_apk, get_ena_index_status, EnaStatusRegistry};
use crate::error::{Result, TransferFailure, WalletError};
use crate::prover::{Proof, ProvingService};
use crate::snark_input::{generate_snark_input, SnarkInputRequest, TokenInfo, ZkWalletKeys};
use crate::types::{short_address, Address, Network, Token, TransferAmounts, TxResult};

/// Which legs a request needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequiredTransfer {
    pub zk: bool,
    pub only_public: bool,
    pub erc_approve: bool,
}

pub fn required_transfer(amounts: &TransferAmounts, token: &Token) -> RequiredTransfer {
    let zk = amounts.from_note.is_some()
        || amounts.from_private_amount > 0
        || amounts.to_private_amount > 0
        || amounts.remaining_amount > 0;
    RequiredTransfer {
        zk,
        only_public: !zk && amounts.from_public_amount > 0,
        erc_approve: token.kind.requires_approval(amounts),
    }
}

/// The contract's per-transfer fee; 0 when it cannot be read.
pub async fn get_zk_transfer_fee(chain: &dyn AzerothChain) -> u128 {
    match chain.get_zk_transfer_fee().await {
        Ok(fee) => fee,
        Err(e) => {
            warn!(error = %e, "getZkTransferFee failed");
            0
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST / CONTEXT / RECEIPT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub wallet_address: Address,
    pub user_key: UserKey,
    pub network_uid: String,
    /// The Azeroth contract; spender of the ERC approval.
    pub contract_address: Address,
    pub token: Token,
    pub amounts: TransferAmounts,
    pub receiver_address: Address,
    /// Fetched from the contract when `None`.
    pub zk_tx_fee: Option<u128>,
}

/// Collaborators of a foreground transfer.
#[derive(Clone)]
pub struct TransferContext {
    pub chain: Arc<dyn AzerothChain>,
    pub prover: Arc<dyn ProvingService>,
    pub ena_registry: EnaStatusRegistry,
    pub config: WalletConfig,
}

impl TransferContext {
    /// Context whose chain calls are bounded by the network's request timeout.
    pub fn connect(
        connector: &dyn ChainConnector,
        network: &Network,
        prover: Arc<dyn ProvingService>,
        ena_registry: EnaStatusRegistry,
        config: WalletConfig,
    ) -> Result<Self> {
        let chain = connect_with_timeout(connector, network, &config)?;
        Ok(Self {
            chain,
            prover,
            ena_registry,
            config,
        })
    }
}

/// Phases reported to the caller's progress callback, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferPhase {
    PublicSent,
    PreProcessed,
    ProofGenerated,
    Broadcast,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReceipt {
    pub block_number: u64,
    /// Unix seconds.
    pub block_date_time: i64,
    pub transaction_index: u64,
    pub transaction_hash: String,
    pub gas_used: u128,
    pub gas_price: u128,
    pub erc_approve_tx_hash: Option<String>,
}

impl TransferReceipt {
    fn fill(&mut self, result: &TxResult) {
        if let Some(receipt) = &result.receipt {
            self.block_number = receipt.block_number;
            self.transaction_index = receipt.transaction_index;
            self.transaction_hash = receipt.transaction_hash.clone();
            self.gas_used = receipt.gas_used;
            self.gas_price = receipt
                .effective_gas_price
                .or_else(|| result.gas_estimation.as_ref().map(|g| g.gas_price))
                .unwrap_or(0);
        }
        self.block_date_time = result
            .block_timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
    }
}

/// A sent transaction without a receipt: the transport flags gas overshoot as low balance.
fn no_receipt_failure(operation: &str, result: &TxResult) -> TransferFailure {
    if result.over_shot() {
        TransferFailure::insufficient_balance()
    } else {
        TransferFailure::internal(format!(
            "{operation}: {}",
            result.error.as_deref().unwrap_or("no receipt")
        ))
    }
}

fn internal(operation: &str, error: WalletError) -> TransferFailure {
    warn!(operation, error = %error, "transfer step failed");
    TransferFailure::internal(format!("{operation}: {error}"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORCHESTRATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Run the transfer and report the outcome through callbacks: `progress` after each phase,
/// `on_fail` exactly once on failure.
pub async fn transfer<P, F>(
    ctx: &TransferContext,
    request: &TransferRequest,
    progress: P,
    on_fail: F,
) -> Option<TransferReceipt>
where
    P: FnMut(TransferPhase) + Send,
    F: FnOnce(TransferFailure),
{
    match execute_transfer(ctx, request, progress).await {
        Ok(receipt) => Some(receipt),
        Err(failure) => {
            warn!(kind = ?failure.kind, reason = ?failure.reason, "transfer failed");
            on_fail(failure);
            None
        }
    }
}

pub async fn execute_transfer<P>(
    ctx: &TransferContext,
    request: &TransferRequest,
    mut progress: P,
) -> std::result::Result<TransferReceipt, TransferFailure>
where
    P: FnMut(TransferPhase) + Send,
{
    let required = required_transfer(&request.amounts, &request.token);
    debug!(?required, token = %request.token.token_uid, "classified transfer");

    if required.only_public {
        return public_transfer(ctx, request, &mut progress).await;
    }
    if !required.zk {
        return Err(TransferFailure::internal("nothing to transfer"));
    }
    zk_transfer(ctx, request, required, &mut progress).await
}

async fn public_transfer<P>(
    ctx: &TransferContext,
    request: &TransferRequest,
    progress: &mut P,
) -> std::result::Result<TransferReceipt, TransferFailure>
where
    P: FnMut(TransferPhase) + Send,
{
    let token = &request.token;
    let amount = token.kind.public_only_amount(&request.amounts);
    info!(
        to = %short_address(&request.receiver_address),
        amount,
        kind = ?token.kind,
        "sending public transfer"
    );

    let sent = if token.kind.is_native() {
        ctx.chain
            .send_native_transfer(&request.wallet_address, &request.receiver_address, amount)
            .await
    } else {
        ctx.chain
            .send_erc_transfer(token, &request.wallet_address, &request.receiver_address, amount)
            .await
    };
    let result = sent.map_err(|e| internal("public transfer", e))?;
    if result.receipt.is_none() {
        return Err(no_receipt_failure("public transfer", &result));
    }
    progress(TransferPhase::PublicSent);

    let mut receipt = TransferReceipt::default();
    receipt.fill(&result);
    Ok(receipt)
}

async fn zk_transfer<P>(
    ctx: &TransferContext,
    request: &TransferRequest,
    required: RequiredTransfer,
    progress: &mut P,
) -> std::result::Result<TransferReceipt, TransferFailure>
where
    P: FnMut(TransferPhase) + Send,
{
    let chain = ctx.chain.as_ref();
    let token = &request.token;
    let amounts = &request.amounts;
    let user_key = &request.user_key;
    let mut receipt = TransferReceipt::default();

    if required.erc_approve {
        info!(amount = amounts.from_public_amount, "approving the pool contract");
        let result = chain
            .send_erc_approval(
                token,
                &request.wallet_address,
                &request.contract_address,
                amounts.from_public_amount,
            )
            .await
            .map_err(|e| internal("approve", e))?;
        match &result.receipt {
            Some(approval) => receipt.erc_approve_tx_hash = Some(approval.transaction_hash.clone()),
            None if result.over_shot() => return Err(TransferFailure::insufficient_balance()),
            None => warn!(error = ?result.error, "approval sent without a receipt, continuing"),
        }
    }

    let leaf_index = amounts.from_note.as_ref().map(|note| note.index).unwrap_or(0);
    let ena = user_key.ena();
    let (apk, receiver_upk, root, merkle_path, cached_status) = tokio::join!(
        get_apk(chain),
        chain.get_user_public_keys(&request.receiver_address),
        chain.get_root_top(),
        chain.get_merkle_path(leaf_index),
        get_ena_index_status(chain, &ena, 0, &user_key.sk),
    );

    let apk = apk.map_err(|e| internal("getAPK", e))?;
    let receiver_upk = match receiver_upk {
        Ok(upk) if !upk.is_empty() => upk,
        Ok(_) | Err(_) => {
            return Err(TransferFailure::receiver_unregistered(format!(
                "Receiver [{}] Ena Invalid",
                short_address(&request.receiver_address)
            )))
        }
    };
    let root = root.map_err(|e| internal("getRootTop", e))?;
    let merkle_path = merkle_path.map_err(|e| internal("getMerklePath", e))?;
    let cached_status = cached_status
        .map_err(|e| internal("getCiphertext", e))?
        .ok_or_else(|| TransferFailure::internal("ledger slot 0 does not decrypt"))?;

    let (ena_index, sct) = if cached_status.matches_token(token) {
        (0, cached_status.sct)
    } else {
        ledger_slot_for(ctx, request).await?
    };
    debug!(ena_index, "ledger slot selected");
    progress(TransferPhase::PreProcessed);

    let snark_request = SnarkInputRequest {
        keys: ZkWalletKeys {
            user_key: user_key.clone(),
            audit_key: AuditKey::public_only(apk.pk),
            receiver_key: receiver_upk,
        },
        token: TokenInfo {
            ena_index,
            token_address: token.contract_address.clone(),
            token_id: token.token_id,
            kind: token.kind,
        },
        amounts: amounts.clone(),
        sct,
        root,
        merkle_path,
    };
    let receiver_eoa = if amounts.to_public_amount > 0 {
        request.receiver_address.as_str()
    } else {
        ctx.config.transfer.zero_address.as_str()
    };

    let param = generate_snark_input(&snark_request, receiver_eoa)?;
    let raw_proof = ctx
        .prover
        .run_proof(&param.circuit_args_json()?)
        .await
        .map_err(|e| internal("runProof", e))?;
    let verified = ctx
        .prover
        .run_verify(&raw_proof, &param.statement_json()?)
        .await
        .map_err(|e| internal("runVerify", e))?;
    if !verified {
        return Err(TransferFailure::from(WalletError::VerificationFailed));
    }
    let proof = Proof::from_library(&raw_proof)?;
    let args = param.to_contract_args(&proof)?;
    progress(TransferPhase::ProofGenerated);

    let fee = match request.zk_tx_fee {
        Some(fee) => fee,
        None => get_zk_transfer_fee(chain).await,
    };
    let entry = token.kind.zk_entry();
    let value = token.kind.zk_call_value(fee, amounts.from_public_amount);
    info!(method = entry.method_name(), value, ena_index, "broadcasting shielded transfer");

    let result = chain
        .zk_transfer(entry, &args, &request.wallet_address, value)
        .await
        .map_err(|e| internal(entry.method_name(), e))?;
    if result.receipt.is_none() {
        return Err(no_receipt_failure(entry.method_name(), &result));
    }
    progress(TransferPhase::Broadcast);

    receipt.fill(&result);
    info!(hash = %receipt.transaction_hash, block = receipt.block_number, "shielded transfer mined");
    Ok(receipt)
}

/// Slot 0 holds another token: scan the whole ledger. A token found nowhere opens a new slot at
/// `ena_length` with the empty ciphertext.
async fn ledger_slot_for(
    ctx: &TransferContext,
    request: &TransferRequest,
) -> std::result::Result<(u64, SymmetricCiphertext), TransferFailure> {
    let all = ctx
        .ena_registry
        .get_all_ena_status(
            ctx.chain.clone(),
            &request.network_uid,
            &request.wallet_address,
            &request.user_key,
        )
        .await
        .map_err(|e| internal("getAllEnaStatus", e))?;
    Ok(match all.find(&request.token) {
        Some(slot) => (slot.ena_index, slot.status.sct.clone()),
        None => {
            debug!(ena_length = all.ena_length, "token has no ledger slot yet");
            (all.ena_length, SymmetricCiphertext::empty())
        }
    })
}
