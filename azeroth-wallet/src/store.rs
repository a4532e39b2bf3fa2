//! Local store seam.
//!
//! The wallet core needs keyed access to wallets, networks, tokens, the raw event cache and the
//! merged transfer records. Every method is one short, individually consistent write or read; no
//! caller holds anything across an `.await`, so the two sync engines and a foreground transfer
//! can interleave freely. Each engine writes only its own watermark field.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use azeroth_crypto::Fr;
use tracing::debug;

use crate::error::{Result, WalletError};
use crate::note::Note;
use crate::types::{
    normalize_address, same_address, AddZkTransferParam, Network, PrivateLeg, Token, Wallet,
    WnMeta, ZkEventCache, ZkTransfer, ZkTransferEvent,
};

/// Block filter for cached event queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZkEventFilter {
    All,
    /// Strictly greater than.
    BlocksAfter(u64),
    /// Strictly less than.
    BlocksBefore(u64),
}

impl ZkEventFilter {
    fn matches(&self, block: u64) -> bool {
        match *self {
            ZkEventFilter::All => true,
            ZkEventFilter::BlocksAfter(b) => block > b,
            ZkEventFilter::BlocksBefore(b) => block < b,
        }
    }
}

pub trait LocalStore: Send + Sync {
    // ═══ wallets and networks ═══

    fn add_wallet(&self, wallet: Wallet) -> Result<()>;

    fn wallets(&self) -> Result<Vec<Wallet>>;

    fn wallet(&self, address: &str) -> Result<Option<Wallet>>;

    fn add_network(&self, network: Network) -> Result<()>;

    fn network(&self, network_uid: &str) -> Result<Option<Network>>;

    fn set_network_start_blk(&self, network_uid: &str, block: u64) -> Result<()>;

    fn set_network_latest_blk(&self, network_uid: &str, block: u64) -> Result<()>;

    // ═══ per (wallet, network) ═══

    /// Default (all unset) when nothing was recorded yet.
    fn wn_meta(&self, wallet: &str, network_uid: &str) -> Result<WnMeta>;

    fn set_ena_exist(&self, wallet: &str, network_uid: &str, exists: bool, length: Option<u64>)
        -> Result<()>;

    fn set_wallet_latest_blk(&self, wallet: &str, network_uid: &str, block: u64) -> Result<()>;

    fn set_wallet_earliest_blk(&self, wallet: &str, network_uid: &str, block: u64) -> Result<()>;

    // ═══ event cache ═══

    /// Append raw events; `latest` also moves the network's cache watermark.
    fn add_zk_event_cache(
        &self,
        network_uid: &str,
        latest: Option<u64>,
        events: Vec<ZkTransferEvent>,
    ) -> Result<()>;

    /// Matching rows ordered by block, then transaction index.
    fn zk_events(&self, network_uid: &str, filter: ZkEventFilter) -> Result<Vec<ZkEventCache>>;

    /// Returns the number of rows removed.
    fn delete_zk_events(&self, network_uid: &str, filter: ZkEventFilter) -> Result<usize>;

    // ═══ transfers ═══

    /// Upsert every mapping by transaction hash and drop the cache rows they consumed.
    fn add_zk_transfer(&self, param: AddZkTransferParam) -> Result<()>;

    fn zk_transfer(&self, network_uid: &str, transaction_hash: &str) -> Result<Option<ZkTransfer>>;

    fn zk_transfers(&self, network_uid: &str) -> Result<Vec<ZkTransfer>>;

    /// Attach a received note to an existing record, keeping its amount if it had one.
    fn add_to_private_note(
        &self,
        network_uid: &str,
        transaction_hash: &str,
        note: Note,
        is_spent: bool,
    ) -> Result<()>;

    // ═══ tokens ═══

    fn add_token(&self, token: Token) -> Result<()>;

    fn find_token(&self, network_uid: &str, contract_address: &str, token_id: &Fr)
        -> Result<Option<Token>>;

    fn native_token(&self, network_uid: &str) -> Result<Option<Token>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    wallets: BTreeMap<String, Wallet>,
    networks: HashMap<String, Network>,
    wn_meta: HashMap<(String, String), WnMeta>,
    events: BTreeMap<u64, ZkEventCache>,
    next_event_id: u64,
    transfers: HashMap<(String, String), ZkTransfer>,
    tokens: Vec<Token>,
}

/// Process-local store, also used by tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| WalletError::Store("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| WalletError::Store("store lock poisoned".into()))
    }

    fn network_mut<'a>(state: &'a mut MemoryState, network_uid: &str) -> Result<&'a mut Network> {
        state
            .networks
            .get_mut(network_uid)
            .ok_or_else(|| WalletError::Store(format!("unknown network {network_uid}")))
    }

    fn meta_mut<'a>(state: &'a mut MemoryState, wallet: &str, network_uid: &str) -> &'a mut WnMeta {
        state
            .wn_meta
            .entry((normalize_address(wallet), network_uid.to_string()))
            .or_default()
    }
}

impl LocalStore for MemoryStore {
    fn add_wallet(&self, wallet: Wallet) -> Result<()> {
        let mut wallet = wallet;
        wallet.address = normalize_address(&wallet.address);
        self.write()?.wallets.insert(wallet.address.clone(), wallet);
        Ok(())
    }

    fn wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self.read()?.wallets.values().cloned().collect())
    }

    fn wallet(&self, address: &str) -> Result<Option<Wallet>> {
        Ok(self.read()?.wallets.get(&normalize_address(address)).cloned())
    }

    fn add_network(&self, network: Network) -> Result<()> {
        self.write()?.networks.insert(network.uid.clone(), network);
        Ok(())
    }

    fn network(&self, network_uid: &str) -> Result<Option<Network>> {
        Ok(self.read()?.networks.get(network_uid).cloned())
    }

    fn set_network_start_blk(&self, network_uid: &str, block: u64) -> Result<()> {
        let mut state = self.write()?;
        Self::network_mut(&mut state, network_uid)?.start_zk_event_blk_num = Some(block);
        Ok(())
    }

    fn set_network_latest_blk(&self, network_uid: &str, block: u64) -> Result<()> {
        let mut state = self.write()?;
        Self::network_mut(&mut state, network_uid)?.latest_zk_event_blk_num = Some(block);
        Ok(())
    }

    fn wn_meta(&self, wallet: &str, network_uid: &str) -> Result<WnMeta> {
        Ok(self
            .read()?
            .wn_meta
            .get(&(normalize_address(wallet), network_uid.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn set_ena_exist(
        &self,
        wallet: &str,
        network_uid: &str,
        exists: bool,
        length: Option<u64>,
    ) -> Result<()> {
        let mut state = self.write()?;
        let meta = Self::meta_mut(&mut state, wallet, network_uid);
        meta.ena_exist = Some(exists);
        meta.ena_length = length;
        Ok(())
    }

    fn set_wallet_latest_blk(&self, wallet: &str, network_uid: &str, block: u64) -> Result<()> {
        let mut state = self.write()?;
        Self::meta_mut(&mut state, wallet, network_uid).latest_zk_event_blk_num = Some(block);
        Ok(())
    }

    fn set_wallet_earliest_blk(&self, wallet: &str, network_uid: &str, block: u64) -> Result<()> {
        let mut state = self.write()?;
        Self::meta_mut(&mut state, wallet, network_uid).earliest_zk_event_blk_num = Some(block);
        Ok(())
    }

    fn add_zk_event_cache(
        &self,
        network_uid: &str,
        latest: Option<u64>,
        events: Vec<ZkTransferEvent>,
    ) -> Result<()> {
        let mut state = self.write()?;
        if let Some(latest) = latest {
            Self::network_mut(&mut state, network_uid)?.latest_zk_event_blk_num = Some(latest);
        }
        let count = events.len();
        for event in events {
            state.next_event_id += 1;
            let id = state.next_event_id;
            state.events.insert(
                id,
                ZkEventCache {
                    id,
                    network_uid: network_uid.to_string(),
                    block_number: event.block_number,
                    transaction_hash: event.transaction_hash.to_ascii_lowercase(),
                    transaction_index: event.transaction_index,
                    event_data: event.event_data,
                },
            );
        }
        debug!(network_uid, count, ?latest, "cached zk events");
        Ok(())
    }

    fn zk_events(&self, network_uid: &str, filter: ZkEventFilter) -> Result<Vec<ZkEventCache>> {
        let state = self.read()?;
        let mut rows: Vec<ZkEventCache> = state
            .events
            .values()
            .filter(|e| e.network_uid == network_uid && filter.matches(e.block_number))
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.block_number, e.transaction_index, e.id));
        Ok(rows)
    }

    fn delete_zk_events(&self, network_uid: &str, filter: ZkEventFilter) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.events.len();
        state
            .events
            .retain(|_, e| !(e.network_uid == network_uid && filter.matches(e.block_number)));
        Ok(before - state.events.len())
    }

    fn add_zk_transfer(&self, param: AddZkTransferParam) -> Result<()> {
        let mut state = self.write()?;
        for mapping in param.map_list {
            if let Some(id) = mapping.cached_event_to_remove {
                state.events.remove(&id);
            }
            let mut transfer = mapping.transfer;
            transfer.network_uid = param.network_uid.clone();
            transfer.token_uid = mapping.token.token_uid.clone();
            transfer.from = normalize_address(&transfer.from);
            transfer.to = normalize_address(&transfer.to);
            transfer.transaction_hash = transfer.transaction_hash.to_ascii_lowercase();

            let key = (param.network_uid.clone(), transfer.transaction_hash.clone());
            match state.transfers.entry(key) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    if transfer.amounts.to_private.is_some() {
                        existing.amounts.to_private = transfer.amounts.to_private;
                        existing.amounts.to_private_note_is_spent =
                            transfer.amounts.to_private_note_is_spent;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(transfer);
                }
            }
        }
        Ok(())
    }

    fn zk_transfer(&self, network_uid: &str, transaction_hash: &str) -> Result<Option<ZkTransfer>> {
        Ok(self
            .read()?
            .transfers
            .get(&(network_uid.to_string(), transaction_hash.to_ascii_lowercase()))
            .cloned())
    }

    fn zk_transfers(&self, network_uid: &str) -> Result<Vec<ZkTransfer>> {
        let mut list: Vec<ZkTransfer> = self
            .read()?
            .transfers
            .values()
            .filter(|t| t.network_uid == network_uid)
            .cloned()
            .collect();
        list.sort_by_key(|t| (t.block_number, t.transaction_index));
        Ok(list)
    }

    fn add_to_private_note(
        &self,
        network_uid: &str,
        transaction_hash: &str,
        note: Note,
        is_spent: bool,
    ) -> Result<()> {
        let mut state = self.write()?;
        let key = (network_uid.to_string(), transaction_hash.to_ascii_lowercase());
        let transfer = state
            .transfers
            .get_mut(&key)
            .ok_or_else(|| WalletError::Store(format!("no transfer {transaction_hash}")))?;
        let amount = transfer
            .amounts
            .to_private
            .as_ref()
            .map(|leg| leg.amount)
            .unwrap_or(note.amount);
        transfer.amounts.to_private = Some(PrivateLeg { amount, note });
        transfer.amounts.to_private_note_is_spent = is_spent;
        Ok(())
    }

    fn add_token(&self, token: Token) -> Result<()> {
        let mut token = token;
        token.contract_address = normalize_address(&token.contract_address);
        let mut state = self.write()?;
        state
            .tokens
            .retain(|t| !(t.network_uid == token.network_uid && t.token_uid == token.token_uid));
        state.tokens.push(token);
        Ok(())
    }

    fn find_token(
        &self,
        network_uid: &str,
        contract_address: &str,
        token_id: &Fr,
    ) -> Result<Option<Token>> {
        Ok(self
            .read()?
            .tokens
            .iter()
            .find(|t| {
                t.network_uid == network_uid
                    && same_address(&t.contract_address, contract_address)
                    && t.token_id == *token_id
            })
            .cloned())
    }

    fn native_token(&self, network_uid: &str) -> Result<Option<Token>> {
        Ok(self
            .read()?
            .tokens
            .iter()
            .find(|t| t.network_uid == network_uid && t.kind.is_native())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenKind, ZkEventData, ZkTransferAmounts, ZkTransferMapping};

    fn network() -> Network {
        Network {
            uid: "net".into(),
            network_name: "testnet".into(),
            chain_id: 1337,
            azeroth_contract_address: "0xc0ffee".into(),
            average_block_time: 2.0,
            start_zk_event_blk_num: None,
            latest_zk_event_blk_num: None,
        }
    }

    fn event(block: u64, index: u64) -> ZkTransferEvent {
        ZkTransferEvent {
            block_number: block,
            transaction_hash: format!("0xAB{block:02}{index:02}"),
            transaction_index: index,
            event_data: ZkEventData {
                nullifier: Fr::from(1u64),
                com: Fr::from(2u64),
                ct: vec![],
                num_leaves: 1,
                ena: vec![],
            },
        }
    }

    fn native() -> Token {
        Token {
            network_uid: "net".into(),
            token_uid: "native".into(),
            kind: TokenKind::Native,
            contract_address: "0x0000000000000000000000000000000000000000".into(),
            token_name: "Ether".into(),
            token_symbol: "ETH".into(),
            decimal: Some(18),
            token_id: Fr::from(0u64),
        }
    }

    #[test]
    fn test_event_cache_order_and_filters() {
        let store = MemoryStore::new();
        store.add_network(network()).unwrap();
        store
            .add_zk_event_cache("net", Some(20), vec![event(12, 1), event(10, 0), event(12, 0)])
            .unwrap();

        assert_eq!(store.network("net").unwrap().unwrap().latest_zk_event_blk_num, Some(20));

        let all = store.zk_events("net", ZkEventFilter::All).unwrap();
        let order: Vec<(u64, u64)> = all.iter().map(|e| (e.block_number, e.transaction_index)).collect();
        assert_eq!(order, vec![(10, 0), (12, 0), (12, 1)]);
        assert_eq!(all[0].transaction_hash, "0xab1000");

        assert_eq!(store.zk_events("net", ZkEventFilter::BlocksAfter(10)).unwrap().len(), 2);
        assert_eq!(store.delete_zk_events("net", ZkEventFilter::BlocksBefore(12)).unwrap(), 1);
        assert_eq!(store.zk_events("other", ZkEventFilter::All).unwrap().len(), 0);
    }

    #[test]
    fn test_add_zk_transfer_removes_cache_rows() {
        let store = MemoryStore::new();
        store.add_network(network()).unwrap();
        store.add_zk_event_cache("net", None, vec![event(10, 0)]).unwrap();
        let cached = store.zk_events("net", ZkEventFilter::All).unwrap();

        let transfer = ZkTransfer {
            network_uid: String::new(),
            token_uid: String::new(),
            block_number: 10,
            block_date_time: 0,
            transaction_index: 0,
            transaction_hash: "0xAB1000".into(),
            from: "0xAAAA".into(),
            to: "0xBBBB".into(),
            amounts: ZkTransferAmounts::default(),
            erc_approve_tx_hash: None,
        };
        store
            .add_zk_transfer(AddZkTransferParam {
                network_uid: "net".into(),
                map_list: vec![ZkTransferMapping {
                    token: native(),
                    cached_event_to_remove: Some(cached[0].id),
                    transfer,
                }],
            })
            .unwrap();

        assert!(store.zk_events("net", ZkEventFilter::All).unwrap().is_empty());
        let stored = store.zk_transfer("net", "0xab1000").unwrap().unwrap();
        assert_eq!(stored.from, "0xaaaa");
        assert_eq!(stored.token_uid, "native");
    }

    #[test]
    fn test_watermarks_are_independent() {
        let store = MemoryStore::new();
        store.set_wallet_latest_blk("0xAA", "net", 50).unwrap();
        store.set_wallet_earliest_blk("0xaa", "net", 7).unwrap();
        let meta = store.wn_meta("0xaa", "net").unwrap();
        assert_eq!(meta.latest_zk_event_blk_num, Some(50));
        assert_eq!(meta.earliest_zk_event_blk_num, Some(7));
        assert_eq!(meta.ena_exist, None);
    }

    #[test]
    fn test_tokens() {
        let store = MemoryStore::new();
        store.add_token(native()).unwrap();
        assert!(store.native_token("net").unwrap().is_some());
        assert!(store
            .find_token("net", "0x0000000000000000000000000000000000000000", &Fr::from(0u64))
            .unwrap()
            .is_some());
        assert!(store
            .find_token("net", "0x0000000000000000000000000000000000000000", &Fr::from(1u64))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unknown_network_is_store_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set_network_latest_blk("missing", 1),
            Err(WalletError::Store(_))
        ));
    }
}
