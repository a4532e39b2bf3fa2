//! Backward note sync.
//!
//! Walks history below the wallet's earliest processed block, `n_days` worth of blocks per
//! request. Each tick fetches one window directly from the chain (bypassing the event cache),
//! claims the wallet's notes from it and moves the wallet's earliest watermark down to the
//! window start. Only one profile is scanned at a time; asking for another one stops the
//! current scan first.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{process_cached_zk_events, EventSource, ProcessInput};
use super::progress::{NoteProgressNotification, BACKWARD_SYNC_LISTENER_KEY};
use super::{init_network_note_sync, AppProfile, SyncContext};
use crate::error::{Result, WalletError};
use crate::note::NoteOwnership;
use crate::types::{BlockRange, Network};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackwardProgress {
    pub scanned: u64,
    pub total: u64,
}

/// What one call to [`BackwardNoteSync::tick`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackwardTick {
    /// More windows remain.
    Continue,
    /// The scan reached the bottom of its range.
    Completed,
    /// Stopped by request, by a missing ena, by a non-retryable error or after too many retries.
    Stopped,
}

#[derive(Clone)]
struct BackwardRun {
    generation: u64,
    profile: AppProfile,
    ownership: NoteOwnership,
    scan_range: BlockRange,
    scanned: u64,
    total: u64,
    /// Consecutive retryable failures.
    failures: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct BackwardState {
    running: bool,
    generation: u64,
    run: Option<BackwardRun>,
}

/// The backward engine. Construct once and share the `Arc`.
///
/// Updates are published after the state lock is released, so progress listeners may query the
/// engine.
pub struct BackwardNoteSync {
    ctx: SyncContext,
    state: StdMutex<BackwardState>,
    /// Serialises ticks with `start`.
    tick_lock: Mutex<()>,
}

impl BackwardNoteSync {
    pub fn new(ctx: SyncContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: StdMutex::new(BackwardState::default()),
            tick_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BackwardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scan `n_days` (at least one) of history below the wallet's earliest processed block.
    ///
    /// A request for the profile already being scanned is ignored.
    pub async fn start(self: &Arc<Self>, profile: AppProfile, n_days: u64) -> Result<()> {
        {
            let state = self.lock();
            if state.running {
                if let Some(run) = &state.run {
                    if run.profile.same_as(&profile) {
                        debug!(wallet = %profile.wallet.address, "backward scan already running");
                        return Ok(());
                    }
                }
            }
        }
        if self.is_running() {
            info!("switching backward scan to another profile");
            self.stop();
        }
        let _tick = self.tick_lock.lock().await;

        let store = &self.ctx.store;
        let wallet = &profile.wallet;
        let chain = self.ctx.chain(&profile.network)?;
        let network = init_network_note_sync(store.as_ref(), chain.as_ref(), &profile.network).await?;

        let to_block = match store.wn_meta(&wallet.address, &network.uid)?.earliest_zk_event_blk_num {
            Some(earliest) => earliest,
            None => {
                let start = network.start_zk_event_blk_num.ok_or_else(|| {
                    WalletError::MissingData(format!("sync origin of {}", network.network_name))
                })?;
                store.set_wallet_earliest_blk(&wallet.address, &network.uid, start)?;
                start
            }
        };
        let blocks_per_scan = self.blocks_per_scan(&network, n_days);
        let scan_range = BlockRange::new(to_block.saturating_sub(blocks_per_scan), to_block);

        let user_key = self.ctx.secrets.user_key(wallet).await?;
        info!(
            network = %network.network_name,
            wallet = %wallet.address,
            n_days,
            total = blocks_per_scan,
            from = scan_range.from,
            to = scan_range.to,
            "backward note scan started"
        );

        let cancel = CancellationToken::new();
        {
            let mut state = self.lock();
            state.generation += 1;
            let generation = state.generation;
            state.run = Some(BackwardRun {
                generation,
                profile: AppProfile::new(wallet.clone(), network),
                ownership: NoteOwnership::new(user_key.sk),
                scan_range,
                scanned: 0,
                total: blocks_per_scan,
                failures: 0,
                cancel: cancel.clone(),
            });
            state.running = true;
        }
        self.ctx.publish(
            BACKWARD_SYNC_LISTENER_KEY,
            NoteProgressNotification::running(blocks_per_scan, 0, scan_range),
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let interval = engine.ctx.config.backward_tick();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if engine.tick().await != BackwardTick::Continue {
                    break;
                }
            }
            debug!("backward note sync loop exited");
        });
        Ok(())
    }

    /// Blocks covering `n_days` at the network's block time; a fixed count on sub-second chains.
    fn blocks_per_scan(&self, network: &Network, n_days: u64) -> u64 {
        if network.average_block_time >= 1.0 {
            (SECONDS_PER_DAY * n_days.max(1) as f64 / network.average_block_time) as u64
        } else {
            self.ctx.config.sync.backward.dev_network_scan_blocks
        }
    }

    /// Request a stop. An in-flight batch stops at its next event boundary.
    pub fn stop(&self) {
        info!("backward note sync stop requested");
        {
            let mut state = self.lock();
            if let Some(run) = &state.run {
                run.cancel.cancel();
            }
            state.running = false;
        }
        self.publish_stopped();
    }

    fn publish_stopped(&self) {
        self.ctx
            .publish(BACKWARD_SYNC_LISTENER_KEY, NoteProgressNotification::stopped());
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Zeros unless a scan is running.
    pub fn progress(&self) -> BackwardProgress {
        let state = self.lock();
        match (&state.run, state.running) {
            (Some(run), true) => BackwardProgress {
                scanned: run.scanned,
                total: run.total,
            },
            _ => BackwardProgress::default(),
        }
    }

    /// The profile of the current (or last) scan.
    pub fn profile(&self) -> Option<AppProfile> {
        self.lock().run.as_ref().map(|run| run.profile.clone())
    }

    /// Scan one window.
    pub async fn tick(&self) -> BackwardTick {
        let _tick = self.tick_lock.lock().await;
        let run = {
            let state = self.lock();
            match (&state.run, state.running) {
                (Some(run), true) => run.clone(),
                _ => return BackwardTick::Stopped,
            }
        };
        if run.cancel.is_cancelled() {
            return self.finish(&run, BackwardTick::Stopped);
        }

        match self.scan_window(&run).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                let failures = self.record_failure(&run);
                if failures > self.ctx.config.sync.backward.max_retries {
                    warn!(error = %e, failures, "backward scan window keeps failing, giving up");
                    return self.finish(&run, BackwardTick::Stopped);
                }
                warn!(error = %e, failures, "backward scan window failed, retrying");
                BackwardTick::Continue
            }
            Err(e) => {
                warn!(error = %e, "backward scan aborted");
                self.finish(&run, BackwardTick::Stopped)
            }
        }
    }

    async fn scan_window(&self, run: &BackwardRun) -> Result<BackwardTick> {
        let store = &self.ctx.store;
        let wallet = &run.profile.wallet;
        let network = &run.profile.network;
        let chain = self.ctx.chain(network)?;

        if !self.ctx.ena_registered(chain.as_ref(), wallet, network).await? {
            debug!(wallet = %wallet.address, "wallet has no ena, backward scan stopped");
            return Ok(self.finish(run, BackwardTick::Stopped));
        }

        let current = store
            .wn_meta(&wallet.address, &network.uid)?
            .earliest_zk_event_blk_num
            .unwrap_or(run.scan_range.to);
        let window = self.next_window(run, current);

        let events = if window.is_empty() {
            Vec::new()
        } else {
            chain.get_zk_transfer_events(window).await?
        };
        debug!(from = window.from, to = window.to, events = events.len(), "backward window fetched");
        if run.cancel.is_cancelled() {
            return Ok(self.finish(run, BackwardTick::Stopped));
        }

        if !events.is_empty() {
            let input = ProcessInput {
                store: store.clone(),
                chain: chain.clone(),
                wallet: wallet.clone(),
                network: network.clone(),
                ownership: run.ownership.clone(),
                yield_between: self.ctx.config.event_yield(),
            };
            let handle =
                process_cached_zk_events(input, EventSource::Fresh(events), run.cancel.child_token());
            let param = handle.join().await?;
            if run.cancel.is_cancelled() {
                return Ok(self.finish(run, BackwardTick::Stopped));
            }
            if !param.map_list.is_empty() {
                info!(transfers = param.map_list.len(), "recorded historical transfers");
                store.add_zk_transfer(param)?;
            }
        }

        let completed = window.from <= run.scan_range.from.max(self.deploy_block());
        let scanned = {
            let mut state = self.lock();
            if run.cancel.is_cancelled() {
                return Ok(BackwardTick::Stopped);
            }
            store.set_wallet_earliest_blk(&wallet.address, &network.uid, window.from)?;
            let scanned = match state.run.as_mut() {
                Some(current) => {
                    current.failures = 0;
                    current.scanned += window.len();
                    current.scanned
                }
                None => window.len(),
            };
            if completed {
                run.cancel.cancel();
                state.running = false;
            }
            scanned
        };
        debug!(scanned, total = run.total, "backward scan progress");
        self.ctx.publish(
            BACKWARD_SYNC_LISTENER_KEY,
            NoteProgressNotification::running(run.total, scanned, run.scan_range),
        );

        if !completed {
            return Ok(BackwardTick::Continue);
        }
        info!(
            network = %network.network_name,
            wallet = %wallet.address,
            last_block = window.from,
            "backward note scan completed"
        );
        self.publish_stopped();
        Ok(BackwardTick::Completed)
    }

    /// Count a retryable failure against the current run.
    fn record_failure(&self, run: &BackwardRun) -> u32 {
        let mut state = self.lock();
        match state.run.as_mut() {
            Some(current) if current.generation == run.generation => {
                current.failures += 1;
                current.failures
            }
            _ => 0,
        }
    }

    fn deploy_block(&self) -> u64 {
        self.ctx.config.sync.backward.contract_deploy_block
    }

    /// The window just below `current`, at most `blocks_per_fetch` (and never more than the whole
    /// scan) wide, clipped at the scan's lower end and the contract deployment block.
    fn next_window(&self, run: &BackwardRun, current: u64) -> BlockRange {
        let deploy = self.deploy_block();
        let width = self.ctx.config.sync.backward.blocks_per_fetch.min(run.total.max(1));
        let floor = run.scan_range.from.max(deploy);
        BlockRange::new(
            current.saturating_sub(width).max(floor),
            current.saturating_sub(1).max(deploy),
        )
    }

    /// Go idle unless a newer run has already taken over.
    fn finish(&self, run: &BackwardRun, outcome: BackwardTick) -> BackwardTick {
        let stopped = {
            let mut state = self.lock();
            let current =
                state.run.as_ref().map(|current| current.generation) == Some(run.generation);
            let stopping = current && state.running;
            if stopping {
                run.cancel.cancel();
                state.running = false;
            }
            stopping
        };
        if stopped {
            self.publish_stopped();
        }
        outcome
    }
}
