//! Shared fixtures for the wallet's integration tests: a scripted in-memory chain, a canned
//! prover, a key vault and builders for networks, wallets, tokens and note-carrying events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use azeroth_crypto::field::{fr_from_u128, fr_to_hex, Fr};
use azeroth_crypto::{
    AffinePoint, AuditKey, PublicKeyEncryption, SymmetricCiphertext, SymmetricKeyEncryption, Upk,
    UserKey,
};
use azeroth_wallet::chain::{AzerothChain, ChainConnector, ContractEntry};
use azeroth_wallet::config::WalletConfig;
use azeroth_wallet::note::Note;
use azeroth_wallet::prover::ProvingService;
use azeroth_wallet::snark_input::ContractArgs;
use azeroth_wallet::sync::{
    ListenerCallback, NoteProgressNotification, SecretsProvider, SyncContext, UpdateSyncManager,
};
use azeroth_wallet::tokens::token_uid;
use azeroth_wallet::types::{
    address_to_fr, normalize_address, BlockInfo, BlockRange, GasEstimation, Network, Token,
    TokenKind, TokenMeta, TransactionInfo, TxReceipt, TxResult, Wallet, ZkEventData,
    ZkTransferEvent,
};
use azeroth_wallet::{MemoryStore, Result, WalletError};
use once_cell::sync::OnceCell;

pub const NETWORK_UID: &str = "devnet";
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
pub const GAS_PRICE: u128 = 10;
const GENESIS_TIMESTAMP: i64 = 1_700_000_000;
const AUDIT_SK: u64 = 11;

static AUDIT_KEY: OnceCell<AuditKey> = OnceCell::new();

/// Route `tracing` output through the test harness; honours `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODEL BUILDERS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn audit_key() -> &'static AuditKey {
    AUDIT_KEY.get_or_init(|| AuditKey::recover(Fr::from(AUDIT_SK)).expect("audit key"))
}

pub fn user_key(sk: u64) -> UserKey {
    UserKey::recover_from_user_sk(Fr::from(sk)).expect("user key")
}

/// `0xtttt...tt`, forty digits.
pub fn address(tag: u8) -> String {
    format!("0x{}", format!("{tag:02x}").repeat(20))
}

pub fn wallet(tag: u8) -> Wallet {
    Wallet {
        address: address(tag),
        name: format!("wallet-{tag}"),
    }
}

pub fn network() -> Network {
    network_with(NETWORK_UID, 12.0)
}

pub fn network_with(uid: &str, average_block_time: f64) -> Network {
    Network {
        uid: uid.to_string(),
        network_name: format!("{uid}-net"),
        chain_id: 31337,
        azeroth_contract_address: address(0xc0),
        average_block_time,
        start_zk_event_blk_num: None,
        latest_zk_event_blk_num: None,
    }
}

pub fn native_token(network_uid: &str) -> Token {
    Token {
        network_uid: network_uid.to_string(),
        token_uid: token_uid(network_uid, ZERO_ADDRESS, &Fr::from(0u64)),
        kind: TokenKind::Native,
        contract_address: ZERO_ADDRESS.to_string(),
        token_name: "Ether".into(),
        token_symbol: "ETH".into(),
        decimal: Some(18),
        token_id: Fr::from(0u64),
    }
}

pub fn erc20_token(network_uid: &str, contract_address: &str) -> Token {
    Token {
        network_uid: network_uid.to_string(),
        token_uid: token_uid(network_uid, contract_address, &Fr::from(0u64)),
        kind: TokenKind::Erc20,
        contract_address: normalize_address(contract_address),
        token_name: "Test Token".into(),
        token_symbol: "TST".into(),
        decimal: Some(18),
        token_id: Fr::from(0u64),
    }
}

/// The ledger slot ciphertext for `(token_address, token_id, balance)` under `sk`.
pub fn ledger_slot(sk: &Fr, token_address: &str, token_id: Fr, balance: u128) -> SymmetricCiphertext {
    SymmetricKeyEncryption::new(*sk).encrypt_with_randomness(
        &[address_to_fr(token_address), token_id, fr_from_u128(balance)],
        Fr::from(5u64),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOTE EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// A `LogZkTransfer` event carrying a note for `receiver`.
#[derive(Clone, Debug)]
pub struct NoteEvent {
    pub receiver: UserKey,
    pub open: Fr,
    pub token_address: String,
    pub token_id: Fr,
    pub amount: u128,
    pub block: u64,
    pub tx_index: u64,
    pub num_leaves: u64,
}

impl NoteEvent {
    pub fn native(receiver: &UserKey, amount: u128, block: u64) -> Self {
        Self {
            receiver: receiver.clone(),
            open: Fr::from(block * 1_000 + 1),
            token_address: ZERO_ADDRESS.to_string(),
            token_id: Fr::from(0u64),
            amount,
            block,
            tx_index: 0,
            num_leaves: 1,
        }
    }

    pub fn with_open(mut self, open: u64) -> Self {
        self.open = Fr::from(open);
        self
    }

    pub fn with_num_leaves(mut self, num_leaves: u64) -> Self {
        self.num_leaves = num_leaves;
        self
    }

    pub fn tx_hash(&self) -> String {
        format!("0x{:060x}{:04x}", self.block, self.tx_index)
    }

    /// The note the receiver should end up with.
    pub fn note(&self) -> Note {
        Note::new(
            self.open,
            self.token_address.clone(),
            self.token_id,
            self.amount,
            self.receiver.ena(),
            self.num_leaves.saturating_sub(1),
        )
    }

    pub fn build(&self) -> AnyResult<ZkTransferEvent> {
        let note = self.note();
        let msg = [
            note.open,
            address_to_fr(&note.token_address),
            note.token_id,
            fr_from_u128(note.amount),
            note.addr,
        ];
        let encrypted = PublicKeyEncryption::new()
            .encrypt_with_randomness(
                &audit_key().pk,
                &self.receiver.pk,
                &msg,
                Fr::from(self.block + 3),
                Fr::from(self.block + 4),
            )
            .context("encrypt note for receiver")?;

        Ok(ZkTransferEvent {
            block_number: self.block,
            transaction_hash: self.tx_hash(),
            transaction_index: self.tx_index,
            event_data: ZkEventData {
                nullifier: Fr::from(self.block * 7 + self.tx_index),
                com: note.commitment,
                ct: encrypted.ciphertext.to_list(),
                num_leaves: self.num_leaves,
                ena: Vec::new(),
            },
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAKE CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// A value-moving call the chain accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTx {
    pub method: &'static str,
    pub sender: String,
    pub to: String,
    pub value: u128,
    pub ena_index: Option<u64>,
}

/// Scripted chain state. Tests reach it through [`FakeChain::with`].
pub struct ChainState {
    pub head: u64,
    pub events: Vec<ZkTransferEvent>,
    /// By lower-case address.
    pub upks: HashMap<String, Upk>,
    /// Ledger slots by ena hex.
    pub ledgers: HashMap<String, Vec<SymmetricCiphertext>>,
    /// Nullifier hex.
    pub nullified: HashSet<String>,
    pub token_meta: HashMap<String, TokenMeta>,
    pub apk: AffinePoint,
    pub zk_fee: u128,
    pub root: Fr,
    pub merkle_depth: usize,
    /// Fail the next N event fetches.
    pub event_failures: usize,
    /// Methods answering with a transport error.
    pub down: HashSet<&'static str>,
    /// Methods that panic on their next call, once.
    pub panic_once: HashSet<&'static str>,
    /// Value-moving calls come back without a receipt, flagged as gas overshoot.
    pub over_shot: bool,
    pub latency: Duration,
    pub calls: HashMap<&'static str, usize>,
    pub fetched: Vec<BlockRange>,
    pub sent: Vec<SentTx>,
}

impl ChainState {
    fn new() -> Self {
        Self {
            head: 0,
            events: Vec::new(),
            upks: HashMap::new(),
            ledgers: HashMap::new(),
            nullified: HashSet::new(),
            token_meta: HashMap::new(),
            apk: audit_key().pk,
            zk_fee: 0,
            root: Fr::from(42u64),
            merkle_depth: 32,
            event_failures: 0,
            down: HashSet::new(),
            panic_once: HashSet::new(),
            over_shot: false,
            latency: Duration::ZERO,
            calls: HashMap::new(),
            fetched: Vec::new(),
            sent: Vec::new(),
        }
    }

    /// Register `key` for `owner` as `registerUser` would.
    pub fn register(&mut self, owner: &str, key: &UserKey) {
        self.upks.insert(normalize_address(owner), key.pk.clone());
    }

    pub fn set_ledger(&mut self, ena: &Fr, slots: Vec<SymmetricCiphertext>) {
        self.ledgers.insert(fr_to_hex(ena), slots);
    }

    pub fn nullify(&mut self, note: &Note, sk: &Fr) {
        self.nullified.insert(fr_to_hex(&note.nullifier(sk)));
    }

    fn receipt(&mut self, method: &'static str) -> TxResult {
        if self.over_shot {
            return TxResult {
                receipt: None,
                block_timestamp: None,
                gas_estimation: Some(GasEstimation {
                    gas_fee: 0,
                    gas_price: GAS_PRICE,
                    possible_over_shot: true,
                }),
                error: Some("insufficient funds for gas".into()),
            };
        }
        self.head += 1;
        TxResult {
            receipt: Some(TxReceipt {
                transaction_hash: format!("0x{:064x}", self.sent.len() + 1),
                block_number: self.head,
                transaction_index: 0,
                gas_used: if method == "zkTransfer" { 1_500_000 } else { 21_000 },
                effective_gas_price: Some(GAS_PRICE),
            }),
            block_timestamp: Some(block_timestamp(self.head)),
            gas_estimation: None,
            error: None,
        }
    }
}

fn block_timestamp(number: u64) -> i64 {
    GENESIS_TIMESTAMP + 12 * number as i64
}

#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn fetched(&self) -> Vec<BlockRange> {
        self.lock().fetched.clone()
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.lock().sent.clone()
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        let (latency, down, panics) = {
            let mut state = self.lock();
            *state.calls.entry(method).or_default() += 1;
            let panics = state.panic_once.remove(method);
            (state.latency, state.down.contains(method), panics)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if panics {
            panic!("{method}: injected panic");
        }
        if down {
            return Err(WalletError::Transport(format!("{method}: connection refused")));
        }
        Ok(())
    }

    fn send(&self, method: &'static str, sent: SentTx) -> TxResult {
        let mut state = self.lock();
        let result = state.receipt(method);
        if result.receipt.is_some() {
            state.sent.push(sent);
        }
        result
    }
}

impl ChainConnector for FakeChain {
    fn connect(&self, _network: &Network) -> Result<Arc<dyn AzerothChain>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl AzerothChain for FakeChain {
    async fn block_number(&self) -> Result<u64> {
        self.enter("blockNumber").await?;
        Ok(self.lock().head)
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo> {
        self.enter("getBlock").await?;
        Ok(BlockInfo {
            number,
            timestamp: block_timestamp(number),
        })
    }

    async fn get_transaction(&self, hash: &str) -> Result<TransactionInfo> {
        self.enter("getTransaction").await?;
        Ok(TransactionInfo {
            hash: hash.to_string(),
            from: address(0xaa),
            gas: 21_000,
            gas_price: GAS_PRICE,
        })
    }

    async fn send_native_transfer(&self, sender: &str, to: &str, amount: u128) -> Result<TxResult> {
        self.enter("sendNativeTransfer").await?;
        Ok(self.send(
            "sendNativeTransfer",
            SentTx {
                method: "sendNativeTransfer",
                sender: sender.to_string(),
                to: to.to_string(),
                value: amount,
                ena_index: None,
            },
        ))
    }

    async fn get_zk_transfer_events(&self, range: BlockRange) -> Result<Vec<ZkTransferEvent>> {
        self.enter("getZkTransferEvents").await?;
        let mut state = self.lock();
        if state.event_failures > 0 {
            state.event_failures -= 1;
            return Err(WalletError::Transport("getZkTransferEvents: gateway timeout".into()));
        }
        state.fetched.push(range);
        Ok(state
            .events
            .iter()
            .filter(|e| e.block_number >= range.from && e.block_number <= range.to)
            .cloned()
            .collect())
    }

    async fn get_apk(&self) -> Result<AffinePoint> {
        self.enter("getAPK").await?;
        Ok(self.lock().apk)
    }

    async fn get_zk_transfer_fee(&self) -> Result<u128> {
        self.enter("getZkTransferFee").await?;
        Ok(self.lock().zk_fee)
    }

    async fn get_user_public_keys(&self, address: &str) -> Result<Upk> {
        self.enter("getUserPublicKeys").await?;
        Ok(self
            .lock()
            .upks
            .get(&normalize_address(address))
            .cloned()
            .unwrap_or_else(Upk::empty))
    }

    async fn register_user(&self, upk: &Upk, sender: &str) -> Result<TxResult> {
        self.enter("registerUser").await?;
        let result = self.send(
            "registerUser",
            SentTx {
                method: "registerUser",
                sender: sender.to_string(),
                to: address(0xc0),
                value: 0,
                ena_index: None,
            },
        );
        if result.receipt.is_some() {
            self.lock().upks.insert(normalize_address(sender), upk.clone());
        }
        Ok(result)
    }

    async fn estimate_register_user(&self, _upk: &Upk, _sender: &str) -> Result<GasEstimation> {
        self.enter("estimateRegisterUser").await?;
        Ok(GasEstimation {
            gas_fee: 200_000 * GAS_PRICE,
            gas_price: GAS_PRICE,
            possible_over_shot: false,
        })
    }

    async fn is_nullified(&self, nullifier: &Fr) -> Result<bool> {
        self.enter("isNullified").await?;
        Ok(self.lock().nullified.contains(&fr_to_hex(nullifier)))
    }

    async fn get_ena_length(&self, ena: &Fr) -> Result<u64> {
        self.enter("getEnaLength").await?;
        Ok(self
            .lock()
            .ledgers
            .get(&fr_to_hex(ena))
            .map(|slots| slots.len() as u64)
            .unwrap_or(0))
    }

    async fn get_ciphertext(&self, ena: &Fr, index: u64) -> Result<SymmetricCiphertext> {
        self.enter("getCiphertext").await?;
        Ok(self
            .lock()
            .ledgers
            .get(&fr_to_hex(ena))
            .and_then(|slots| slots.get(index as usize).cloned())
            .unwrap_or_else(SymmetricCiphertext::empty))
    }

    async fn get_root_top(&self) -> Result<Fr> {
        self.enter("getRootTop").await?;
        Ok(self.lock().root)
    }

    async fn get_merkle_path(&self, index: u64) -> Result<Vec<Fr>> {
        self.enter("getMerklePath").await?;
        let depth = self.lock().merkle_depth;
        Ok((0..depth as u64).map(|level| Fr::from(index + level)).collect())
    }

    async fn zk_transfer(
        &self,
        entry: ContractEntry,
        args: &ContractArgs,
        sender: &str,
        value: u128,
    ) -> Result<TxResult> {
        self.enter(entry.method_name()).await?;
        Ok(self.send(
            "zkTransfer",
            SentTx {
                method: entry.method_name(),
                sender: sender.to_string(),
                to: args.receiver_eoa.clone(),
                value,
                ena_index: Some(args.ena_index),
            },
        ))
    }

    async fn send_erc_transfer(
        &self,
        _token: &Token,
        sender: &str,
        to: &str,
        amount: u128,
    ) -> Result<TxResult> {
        self.enter("sendErcTransfer").await?;
        Ok(self.send(
            "sendErcTransfer",
            SentTx {
                method: "sendErcTransfer",
                sender: sender.to_string(),
                to: to.to_string(),
                value: amount,
                ena_index: None,
            },
        ))
    }

    async fn send_erc_approval(
        &self,
        _token: &Token,
        owner: &str,
        spender: &str,
        amount: u128,
    ) -> Result<TxResult> {
        self.enter("approve").await?;
        Ok(self.send(
            "approve",
            SentTx {
                method: "approve",
                sender: owner.to_string(),
                to: spender.to_string(),
                value: amount,
                ena_index: None,
            },
        ))
    }

    async fn get_token_meta(&self, contract_address: &str, _token_id: &Fr) -> Result<TokenMeta> {
        self.enter("getTokenMeta").await?;
        self.lock()
            .token_meta
            .get(&normalize_address(contract_address))
            .cloned()
            .ok_or_else(|| WalletError::MissingData(format!("token {contract_address}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROVER / SECRETS
// ═══════════════════════════════════════════════════════════════════════════════

/// Returns a fixed proof; verification outcome is switchable.
pub struct FakeProver {
    verifies: AtomicBool,
    proofs: AtomicUsize,
}

impl Default for FakeProver {
    fn default() -> Self {
        Self {
            verifies: AtomicBool::new(true),
            proofs: AtomicUsize::new(0),
        }
    }
}

impl FakeProver {
    pub fn rejecting() -> Self {
        let prover = Self::default();
        prover.verifies.store(false, Ordering::SeqCst);
        prover
    }

    pub fn proofs(&self) -> usize {
        self.proofs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvingService for FakeProver {
    async fn run_proof(&self, circuit_args: &str) -> Result<String> {
        serde_json::from_str::<serde_json::Value>(circuit_args)?;
        self.proofs.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({
            "A": ["0x1", "0x2"],
            "B": ["0x3", "0x4", "0x5", "0x6"],
            "C": ["0x7", "0x8"],
        })
        .to_string())
    }

    async fn run_verify(&self, _raw_proof: &str, _statement: &str) -> Result<bool> {
        Ok(self.verifies.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    keys: Mutex<HashMap<String, UserKey>>,
}

impl FakeSecrets {
    pub fn insert(&self, wallet: &Wallet, key: UserKey) {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(normalize_address(&wallet.address), key);
    }
}

#[async_trait]
impl SecretsProvider for FakeSecrets {
    async fn user_key(&self, wallet: &Wallet) -> Result<UserKey> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize_address(&wallet.address))
            .cloned()
            .ok_or_else(|| WalletError::MissingData(format!("secret of {}", wallet.address)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYNC HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Config for engine tests: no countdowns, no pauses, and tick loops too slow to interfere with
/// ticks driven by hand.
pub fn test_config() -> WalletConfig {
    let mut config = WalletConfig::default();
    config.sync.forward.rerun_countdown = 0;
    config.sync.forward.cleanup_countdown = 0;
    config.sync.forward.tick_interval_ms = 3_600_000;
    config.sync.backward.tick_interval_ms = 3_600_000;
    config.sync.event_yield_ms = 0;
    config
}

pub type ProgressLog = Arc<Mutex<Vec<(String, NoteProgressNotification)>>>;

/// Everything an engine needs, wired to fakes.
pub struct SyncHarness {
    pub chain: FakeChain,
    pub store: Arc<MemoryStore>,
    pub secrets: Arc<FakeSecrets>,
    pub progress: Arc<UpdateSyncManager<NoteProgressNotification>>,
    pub ctx: SyncContext,
}

impl SyncHarness {
    pub fn new(config: WalletConfig) -> Self {
        let chain = FakeChain::new();
        let store = Arc::new(MemoryStore::new());
        let secrets = Arc::new(FakeSecrets::default());
        let progress = Arc::new(UpdateSyncManager::default());
        let ctx = SyncContext {
            store: store.clone(),
            chains: Arc::new(chain.clone()),
            progress: progress.clone(),
            secrets: secrets.clone(),
            config,
        };
        Self {
            chain,
            store,
            secrets,
            progress,
            ctx,
        }
    }

    /// Record every update published under `key`.
    pub fn record(&self, key: &str) -> ProgressLog {
        let log: ProgressLog = Default::default();
        let sink = log.clone();
        let callback: ListenerCallback<NoteProgressNotification> =
            Arc::new(move |key: &str, _id, data: &NoteProgressNotification| {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push((key.to_string(), data.clone()));
            });
        self.progress.add_listener(Some(key), callback);
        log
    }
}
