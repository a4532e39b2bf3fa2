//! Claiming a wallet's notes from a batch of `LogZkTransfer` events.
//!
//! Events are handled one at a time on a spawned task, with a pause between two events so a long
//! batch never monopolises the runtime. The run stops early when its [`CancellationToken`] fires;
//! transfers already merged stay merged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::AzerothChain;
use crate::error::{Result, WalletError};
use crate::note::{is_spent_note, NoteOwnership};
use crate::store::LocalStore;
use crate::tokens::find_token;
use crate::types::{
    AddZkTransferParam, Network, PrivateLeg, Wallet, ZkEventCache, ZkTransfer, ZkTransferAmounts,
    ZkTransferEvent, ZkTransferMapping,
};

/// Events to process: rows of the local cache (forward) or events fetched directly (backward).
#[derive(Clone, Debug)]
pub enum EventSource {
    Cached(Vec<ZkEventCache>),
    Fresh(Vec<ZkTransferEvent>),
}

impl EventSource {
    pub fn len(&self) -> usize {
        match self {
            EventSource::Cached(rows) => rows.len(),
            EventSource::Fresh(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The event at `index` and, for cache rows, the row id.
    fn get(&self, index: usize) -> Option<(ZkTransferEvent, Option<u64>)> {
        match self {
            EventSource::Cached(rows) => rows.get(index).map(|row| (row.to_event(), Some(row.id))),
            EventSource::Fresh(events) => events.get(index).map(|event| (event.clone(), None)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessProgress {
    pub index: usize,
    pub total: usize,
}

/// A running batch.
pub struct ProcessHandle {
    pub cancel: CancellationToken,
    next_index: Arc<AtomicUsize>,
    total: usize,
    task: JoinHandle<Result<AddZkTransferParam>>,
}

impl ProcessHandle {
    pub fn stop(&self) {
        debug!("stop requested for event processing");
        self.cancel.cancel();
    }

    pub fn progress(&self) -> ProcessProgress {
        ProcessProgress {
            index: self.next_index.load(Ordering::SeqCst),
            total: self.total,
        }
    }

    /// New transfer records to merge. A stopped run yields an empty list.
    pub async fn join(self) -> Result<AddZkTransferParam> {
        self.task
            .await
            .map_err(|e| WalletError::Task(format!("event processing task: {e}")))?
    }
}

/// Collaborators of one batch.
#[derive(Clone)]
pub struct ProcessInput {
    pub store: Arc<dyn LocalStore>,
    pub chain: Arc<dyn AzerothChain>,
    pub wallet: Wallet,
    pub network: Network,
    pub ownership: NoteOwnership,
    /// Pause between two events.
    pub yield_between: std::time::Duration,
}

/// Start processing `events` for the wallet in `input`.
///
/// An owned note whose transaction is already recorded is attached to that record right away.
/// Otherwise the token is resolved (and cached) and a new record is staged in the result,
/// together with the cache row to evict. Failing to resolve the token drops the note; failing to
/// read its spent state aborts the batch, so the caller retries it later.
pub fn process_cached_zk_events(
    input: ProcessInput,
    events: EventSource,
    cancel: CancellationToken,
) -> ProcessHandle {
    let total = events.len();
    let next_index = Arc::new(AtomicUsize::new(0));
    debug!(
        wallet = %input.wallet.address,
        network = %input.network.network_name,
        total,
        "processing zk events"
    );

    let task = {
        let cancel = cancel.clone();
        let next_index = next_index.clone();
        tokio::spawn(async move { run(input, events, cancel, next_index).await })
    };

    ProcessHandle {
        cancel,
        next_index,
        total,
        task,
    }
}

async fn run(
    input: ProcessInput,
    events: EventSource,
    cancel: CancellationToken,
    next_index: Arc<AtomicUsize>,
) -> Result<AddZkTransferParam> {
    let mut result = AddZkTransferParam {
        network_uid: input.network.uid.clone(),
        map_list: Vec::new(),
    };
    let stopped = || AddZkTransferParam {
        network_uid: input.network.uid.clone(),
        map_list: Vec::new(),
    };

    for index in 0..events.len() {
        if cancel.is_cancelled() {
            debug!(index, "event processing stopped");
            return Ok(stopped());
        }
        if let Some((event, cache_id)) = events.get(index) {
            if let Some(mapping) = process_event(&input, event, cache_id).await? {
                result.map_list.push(mapping);
            }
        }
        next_index.store(index + 1, Ordering::SeqCst);

        if index + 1 < events.len() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(index, "event processing stopped");
                    return Ok(stopped());
                }
                _ = tokio::time::sleep(input.yield_between) => {}
            }
        }
    }

    debug!(staged = result.map_list.len(), "event processing done");
    Ok(result)
}

async fn process_event(
    input: &ProcessInput,
    event: ZkTransferEvent,
    cache_id: Option<u64>,
) -> Result<Option<ZkTransferMapping>> {
    let data = &event.event_data;
    let Some(owned) = input.ownership.is_owner(&data.ct, &data.com) else {
        return Ok(None);
    };
    let mut note = owned.into_note(data.num_leaves);
    info!(
        wallet = %input.wallet.address,
        network = %input.network.network_name,
        block = event.block_number,
        tx_index = event.transaction_index,
        token = %note.token_address,
        amount = note.amount,
        "wallet note found"
    );

    let is_spent =
        is_spent_note(input.chain.as_ref(), input.ownership.secret(), &note.commitment).await?;
    note.is_spent = is_spent;

    let network_uid = &input.network.uid;
    if input
        .store
        .zk_transfer(network_uid, &event.transaction_hash)?
        .is_some()
    {
        debug!(hash = %event.transaction_hash, "transfer already recorded, attaching note");
        input
            .store
            .add_to_private_note(network_uid, &event.transaction_hash, note, is_spent)?;
        return Ok(None);
    }

    let token = find_token(
        input.store.as_ref(),
        input.chain.as_ref(),
        network_uid,
        &note.token_address,
        &note.token_id,
    )
    .await?;
    let Some(token) = token else {
        warn!(token = %note.token_address, "note token could not be resolved, skipping");
        return Ok(None);
    };

    let block_date_time = match input.chain.get_block(event.block_number).await {
        Ok(block) => block.timestamp,
        Err(e) => {
            warn!(block = event.block_number, error = %e, "getBlock failed");
            0
        }
    };
    let (from, gas_fee) = match input.chain.get_transaction(&event.transaction_hash).await {
        Ok(tx) => (tx.from, tx.gas.saturating_mul(tx.gas_price)),
        Err(e) => {
            warn!(hash = %event.transaction_hash, error = %e, "getTransaction failed");
            (String::new(), 0)
        }
    };

    let amount = note.amount;
    Ok(Some(ZkTransferMapping {
        token,
        cached_event_to_remove: cache_id,
        transfer: ZkTransfer {
            network_uid: network_uid.clone(),
            token_uid: String::new(),
            block_number: event.block_number,
            block_date_time,
            transaction_index: event.transaction_index,
            transaction_hash: event.transaction_hash,
            from,
            to: input.wallet.address.clone(),
            amounts: ZkTransferAmounts {
                to_private: Some(PrivateLeg { amount, note }),
                to_private_note_is_spent: is_spent,
                gas_fee: Some(gas_fee),
                ..Default::default()
            },
            erc_approve_tx_hash: None,
        },
    }))
}
