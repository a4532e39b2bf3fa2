//! Shared data model: networks, wallets, tokens, cached events and merged transfer records.
//!
//! Addresses are kept as lower-case `0x`-prefixed strings throughout; comparisons go through
//! [`same_address`].

use azeroth_crypto::field::{fr_from_hex, fr_to_hex, serde_fr_hex, serde_fr_vec, Fr};
use serde::{Deserialize, Serialize};

use crate::chain::ContractEntry;
use crate::note::Note;

/// 20-byte address with `0x` prefix, lower case.
pub type Address = String;

pub fn normalize_address(address: &str) -> Address {
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    format!("0x{}", digits.to_ascii_lowercase())
}

pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// `0x12...abcd`, as shown in user-facing failure reasons.
/// Cuts on characters, so unvalidated input never panics.
pub fn short_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 8 {
        return address.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Field element for an address; the zero address and garbage map to zero.
pub fn address_to_fr(address: &str) -> Fr {
    fr_from_hex(address).unwrap_or(Fr::from(0u64))
}

/// 40-digit address for a field element, or `None` when it does not fit 160 bits.
pub fn fr_to_address(value: &Fr) -> Option<Address> {
    let digits = fr_to_hex(value);
    if digits.len() > 40 {
        return None;
    }
    Some(format!("0x{digits:0>40}"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// NETWORK / WALLET
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub uid: String,
    pub network_name: String,
    pub chain_id: u64,
    pub azeroth_contract_address: Address,
    /// Seconds.
    pub average_block_time: f64,
    /// First block the wallet cares about; set once, to the head at first sync.
    pub start_zk_event_blk_num: Option<u64>,
    /// Highest block whose events are in the local cache.
    pub latest_zk_event_blk_num: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: Address,
    pub name: String,
}

/// Per (wallet, network) sync and registration state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WnMeta {
    pub ena_exist: Option<bool>,
    pub ena_length: Option<u64>,
    /// Next block the forward engine will process for this wallet.
    pub latest_zk_event_blk_num: Option<u64>,
    /// Lowest block the backward engine has processed for this wallet.
    pub earliest_zk_event_blk_num: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKENS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Native,
    Erc20,
    Erc721,
    Erc1155,
}

impl TokenKind {
    pub fn is_native(&self) -> bool {
        matches!(self, TokenKind::Native)
    }

    pub fn is_nft(&self) -> bool {
        matches!(self, TokenKind::Erc721 | TokenKind::Erc1155)
    }

    /// Contract entry point for a shielded transfer of this kind.
    pub fn zk_entry(&self) -> ContractEntry {
        match self {
            TokenKind::Native | TokenKind::Erc20 => ContractEntry::ZkTransfer20,
            TokenKind::Erc721 => ContractEntry::ZkTransfer721,
            TokenKind::Erc1155 => ContractEntry::ZkTransfer1155,
        }
    }

    /// Value attached to a shielded transfer: native tokens carry the public input leg.
    pub fn zk_call_value(&self, fee: u128, from_public: u128) -> u128 {
        match self {
            TokenKind::Native => fee.saturating_add(from_public),
            TokenKind::Erc20 | TokenKind::Erc721 | TokenKind::Erc1155 => fee,
        }
    }

    /// Amount moved by a transfer that never enters the shielded pool.
    pub fn public_only_amount(&self, amounts: &TransferAmounts) -> u128 {
        match self {
            TokenKind::Native => amounts.to_public_amount,
            TokenKind::Erc20 | TokenKind::Erc721 | TokenKind::Erc1155 => {
                amounts.from_public_amount
            }
        }
    }

    /// ERC tokens must be approved to the contract before the pool can pull them.
    pub fn requires_approval(&self, amounts: &TransferAmounts) -> bool {
        !self.is_native() && amounts.from_public_amount > 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub network_uid: String,
    pub token_uid: String,
    pub kind: TokenKind,
    /// The zero address for the native token.
    pub contract_address: Address,
    pub token_name: String,
    pub token_symbol: String,
    pub decimal: Option<u8>,
    /// Zero for fungible tokens.
    #[serde(with = "serde_fr_hex")]
    pub token_id: Fr,
}

/// Chain-side token description, as returned by the ERC metadata calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub kind: TokenKind,
    pub name: String,
    pub symbol: String,
    pub decimal: Option<u8>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER AMOUNTS
// ═══════════════════════════════════════════════════════════════════════════════

/// The four legs of a transfer plus the note being spent, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferAmounts {
    pub from_public_amount: u128,
    pub from_private_amount: u128,
    pub from_note: Option<Note>,
    pub to_public_amount: u128,
    pub to_private_amount: u128,
    /// Ledger balance left after the transfer.
    pub remaining_amount: u128,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload of one `LogZkTransfer` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkEventData {
    #[serde(with = "serde_fr_hex")]
    pub nullifier: Fr,
    #[serde(with = "serde_fr_hex")]
    pub com: Fr,
    /// The 11-element pCT list.
    #[serde(with = "serde_fr_vec")]
    pub ct: Vec<Fr>,
    pub num_leaves: u64,
    /// The sender's new sCT list.
    #[serde(with = "serde_fr_vec")]
    pub ena: Vec<Fr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkTransferEvent {
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub event_data: ZkEventData,
}

/// A cached raw event; `id` is assigned by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkEventCache {
    pub id: u64,
    pub network_uid: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub event_data: ZkEventData,
}

impl ZkEventCache {
    pub fn to_event(&self) -> ZkTransferEvent {
        ZkTransferEvent {
            block_number: self.block_number,
            transaction_hash: self.transaction_hash.clone(),
            transaction_index: self.transaction_index,
            event_data: self.event_data.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFER RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateLeg {
    pub amount: u128,
    pub note: Note,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkTransferAmounts {
    pub from_public: Option<u128>,
    pub from_private: Option<u128>,
    pub to_public: Option<u128>,
    pub to_private: Option<PrivateLeg>,
    pub to_private_note_is_spent: bool,
    pub gas_fee: Option<u128>,
}

/// A merged transfer record, keyed by `(network_uid, transaction_hash)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkTransfer {
    pub network_uid: String,
    pub token_uid: String,
    pub block_number: u64,
    /// Unix seconds.
    pub block_date_time: i64,
    pub transaction_index: u64,
    pub transaction_hash: String,
    pub from: Address,
    pub to: Address,
    pub amounts: ZkTransferAmounts,
    pub erc_approve_tx_hash: Option<String>,
}

/// One owned note ready to be merged, plus the cache row it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZkTransferMapping {
    pub token: Token,
    pub cached_event_to_remove: Option<u64>,
    pub transfer: ZkTransfer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddZkTransferParam {
    pub network_uid: String,
    pub map_list: Vec<ZkTransferMapping>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN VALUES
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusive block range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive sub-ranges of at most `size` blocks.
    pub fn windows(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut windows = Vec::new();
        let mut from = self.from;
        while from <= self.to {
            let to = from.saturating_add(size - 1).min(self.to);
            windows.push(BlockRange { from, to });
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        windows
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEstimation {
    pub gas_fee: u128,
    pub gas_price: u128,
    /// The estimate exceeded the sender's balance.
    pub possible_over_shot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub gas_used: u128,
    pub effective_gas_price: Option<u128>,
}

/// Outcome of a value-moving call. `receipt` is `None` when the transport did not broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub receipt: Option<TxReceipt>,
    /// Unix seconds of the including block, when the transport fetched it.
    pub block_timestamp: Option<i64>,
    pub gas_estimation: Option<GasEstimation>,
    pub error: Option<String>,
}

impl TxResult {
    pub fn over_shot(&self) -> bool {
        self.gas_estimation
            .as_ref()
            .map(|g| g.possible_over_shot)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub hash: String,
    pub from: Address,
    pub gas: u128,
    pub gas_price: u128,
}
