//! Forward note sync.
//!
//! One tick a second. Between two runs the engine counts down `rerun_countdown` ticks (or none
//! after [`ForwardNoteSync::fast_forward`]). A run then:
//!
//! 1. caches every `LogZkTransfer` event from the network watermark to the head, a bounded window
//!    at a time, moving the network watermark with each window;
//! 2. claims the wallet's notes from the cached events at or above the wallet watermark and
//!    moves that watermark to one past the network's;
//! 3. every `cleanup_countdown` runs, evicts cached events every wallet on the network has
//!    already processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{process_cached_zk_events, EventSource, ProcessInput};
use super::progress::{NoteProgressNotification, FORWARD_SYNC_LISTENER_KEY};
use super::{init_network_note_sync, AppProfile, SyncContext};
use crate::chain::AzerothChain;
use crate::error::Result;
use crate::note::NoteOwnership;
use crate::store::ZkEventFilter;
use crate::types::{BlockRange, Network, Wallet};

/// What one call to [`ForwardNoteSync::tick`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardTick {
    /// Waiting; ticks left before the next run.
    Countdown(u32),
    NoProfile,
    NoNewBlocks,
    /// Events were cached but the wallet has no ena yet, so nothing was claimed.
    EnaNotRegistered,
    Completed {
        cached: BlockRange,
        staged_transfers: usize,
    },
    /// Logged and rescheduled.
    Failed(String),
}

struct ForwardRun {
    profile: AppProfile,
    ownership: NoteOwnership,
}

struct ForwardState {
    rerun_countdown: u32,
    cleanup_countdown: u32,
    profile: Option<AppProfile>,
    run: Option<ForwardRun>,
}

/// The forward engine. Construct once and share the `Arc`.
pub struct ForwardNoteSync {
    ctx: SyncContext,
    state: Mutex<ForwardState>,
    running: AtomicBool,
    fast_forward: AtomicBool,
    cancel: StdMutex<CancellationToken>,
}

impl ForwardNoteSync {
    pub fn new(ctx: SyncContext) -> Arc<Self> {
        let forward = &ctx.config.sync.forward;
        let state = ForwardState {
            rerun_countdown: forward.rerun_countdown,
            cleanup_countdown: forward.cleanup_countdown,
            profile: None,
            run: None,
        };
        Arc::new(Self {
            ctx,
            state: Mutex::new(state),
            running: AtomicBool::new(false),
            fast_forward: AtomicBool::new(false),
            cancel: StdMutex::new(CancellationToken::new()),
        })
    }

    /// Follow `profile` from now on; starts the tick loop if it is not running.
    pub async fn start(self: &Arc<Self>, profile: AppProfile) {
        info!(
            network = %profile.network.network_name,
            wallet = %profile.wallet.address,
            "forward note sync requested"
        );
        let mut profile = profile;
        if let Ok(chain) = self.ctx.chain(&profile.network) {
            match init_network_note_sync(self.ctx.store.as_ref(), chain.as_ref(), &profile.network)
                .await
            {
                Ok(network) => profile.network = network,
                Err(e) => warn!(error = %e, "note sync origin not recorded"),
            }
        }
        self.state.lock().await.profile = Some(profile);

        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.cancel_slot() = token.clone();

        let engine = self.clone();
        tokio::spawn(async move {
            let interval = engine.ctx.config.forward_tick();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                engine.tick().await;
            }
            debug!("forward note sync loop exited");
        });
    }

    /// Run on the next tick instead of waiting out the countdown.
    pub fn fast_forward(&self) {
        debug!("forward note sync fast-forward");
        self.fast_forward.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative: the loop exits before its next tick and an in-flight batch stops at the next
    /// event boundary.
    pub fn stop(&self) {
        info!("forward note sync stop requested");
        self.running.store(false, Ordering::SeqCst);
        self.cancel_slot().cancel();
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_stopped(&self) {
        self.ctx
            .publish(FORWARD_SYNC_LISTENER_KEY, NoteProgressNotification::stopped());
    }

    /// One step of the state machine. Ticks never overlap.
    pub async fn tick(&self) -> ForwardTick {
        let mut state = self.state.lock().await;

        if self.fast_forward.load(Ordering::SeqCst) {
            state.rerun_countdown = 0;
        }
        if state.rerun_countdown > 0 {
            state.rerun_countdown -= 1;
            return ForwardTick::Countdown(state.rerun_countdown);
        }

        let outcome = self.run_once(&mut state).await;
        match &outcome {
            ForwardTick::Failed(reason) => warn!(reason = %reason, "forward note sync run failed"),
            other => debug!(outcome = ?other, "forward note sync run finished"),
        }
        if !matches!(outcome, ForwardTick::NoProfile | ForwardTick::NoNewBlocks) {
            self.publish_stopped();
        }

        self.fast_forward.store(false, Ordering::SeqCst);
        state.rerun_countdown = self.ctx.config.sync.forward.rerun_countdown;
        outcome
    }

    async fn run_once(&self, state: &mut ForwardState) -> ForwardTick {
        let Some(profile) = state.profile.clone() else {
            return ForwardTick::NoProfile;
        };

        let stale = match &state.run {
            Some(run) => !run.profile.same_as(&profile),
            None => true,
        };
        if stale {
            match self.ctx.secrets.user_key(&profile.wallet).await {
                Ok(user_key) => {
                    state.run = Some(ForwardRun {
                        profile: profile.clone(),
                        ownership: NoteOwnership::new(user_key.sk),
                    })
                }
                Err(e) => return ForwardTick::Failed(format!("user key unavailable: {e}")),
            }
        }
        let Some(run) = state.run.as_ref() else {
            return ForwardTick::NoProfile;
        };

        match self.run_profile(run, &mut state.cleanup_countdown).await {
            Ok(outcome) => outcome,
            Err(e) => ForwardTick::Failed(e.to_string()),
        }
    }

    async fn run_profile(&self, run: &ForwardRun, cleanup_countdown: &mut u32) -> Result<ForwardTick> {
        let wallet = &run.profile.wallet;
        let chain = self.ctx.chain(&run.profile.network)?;
        let network = self.ctx.fresh_network(&run.profile.network)?;
        let head = chain.block_number().await?;

        let from = match (network.latest_zk_event_blk_num, network.start_zk_event_blk_num) {
            (Some(latest), _) if latest >= head => {
                debug!(network = %network.network_name, latest, head, "no new blocks");
                return Ok(ForwardTick::NoNewBlocks);
            }
            (Some(latest), _) => latest + 1,
            (None, Some(start)) => start,
            (None, None) => head,
        };
        let scan_range = BlockRange::new(from, head);
        info!(
            network = %network.network_name,
            wallet = %wallet.address,
            from = scan_range.from,
            to = scan_range.to,
            total = scan_range.len(),
            "forward note sync run"
        );
        self.ctx.publish(
            FORWARD_SYNC_LISTENER_KEY,
            NoteProgressNotification::running(scan_range.len(), 0, scan_range),
        );

        let cached = self.cache_events(chain.as_ref(), &network, scan_range).await;

        if !self.ctx.ena_registered(chain.as_ref(), wallet, &network).await? {
            debug!(wallet = %wallet.address, "wallet has no ena, skipping note claim");
            return Ok(ForwardTick::EnaNotRegistered);
        }

        let staged_transfers = self.process_events(chain, run, &network).await?;
        self.cleanup(&network, cleanup_countdown);

        Ok(ForwardTick::Completed {
            cached: cached.unwrap_or(BlockRange::new(from, from.saturating_sub(1))),
            staged_transfers,
        })
    }

    /// Fetch and cache window after window; stop at the first failure. Returns the cached span.
    async fn cache_events(
        &self,
        chain: &dyn AzerothChain,
        network: &Network,
        scan_range: BlockRange,
    ) -> Option<BlockRange> {
        let size = self.ctx.config.sync.forward.blocks_per_fetch;
        let mut cached: Option<BlockRange> = None;

        for window in scan_range.windows(size) {
            let events = match chain.get_zk_transfer_events(window).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(from = window.from, to = window.to, error = %e, "fetching zk events failed");
                    break;
                }
            };
            debug!(from = window.from, to = window.to, events = events.len(), "caching zk events");
            if let Err(e) = self
                .ctx
                .store
                .add_zk_event_cache(&network.uid, Some(window.to), events)
            {
                warn!(error = %e, "caching zk events failed");
                break;
            }

            let span = match cached {
                Some(span) => BlockRange::new(span.from, window.to),
                None => window,
            };
            cached = Some(span);
            self.ctx.publish(
                FORWARD_SYNC_LISTENER_KEY,
                NoteProgressNotification::running(scan_range.len(), span.len(), scan_range),
            );
        }
        cached
    }

    async fn process_events(
        &self,
        chain: Arc<dyn AzerothChain>,
        run: &ForwardRun,
        network: &Network,
    ) -> Result<usize> {
        let store = &self.ctx.store;
        let wallet = &run.profile.wallet;
        let network = self.ctx.fresh_network(network)?;
        let (Some(net_start), Some(net_latest)) =
            (network.start_zk_event_blk_num, network.latest_zk_event_blk_num)
        else {
            return Ok(0);
        };

        let wallet_latest = match store.wn_meta(&wallet.address, &network.uid)?.latest_zk_event_blk_num {
            Some(latest) if latest > net_latest => {
                debug!(latest, net_latest, "no new cached events for wallet");
                return Ok(0);
            }
            Some(latest) => latest,
            None => {
                info!(network = %network.network_name, net_start, "first forward run for wallet");
                net_start
            }
        };

        let filter = match wallet_latest.checked_sub(1) {
            Some(before) => ZkEventFilter::BlocksAfter(before),
            None => ZkEventFilter::All,
        };
        let rows = store.zk_events(&network.uid, filter)?;
        debug!(events = rows.len(), wallet_latest, "processing cached zk events");

        let mut staged = 0;
        if !rows.is_empty() {
            let input = ProcessInput {
                store: store.clone(),
                chain,
                wallet: wallet.clone(),
                network: network.clone(),
                ownership: run.ownership.clone(),
                yield_between: self.ctx.config.event_yield(),
            };
            let token = self.cancel_slot().child_token();
            let param = process_cached_zk_events(input, EventSource::Cached(rows), token.clone())
                .join()
                .await?;
            if token.is_cancelled() {
                debug!("forward processing stopped, watermark kept");
                return Ok(0);
            }
            staged = param.map_list.len();
            if staged > 0 {
                store.add_zk_transfer(param)?;
                info!(transfers = staged, "recorded received transfers");
            }
        }

        store.set_wallet_latest_blk(&wallet.address, &network.uid, net_latest + 1)?;
        debug!(watermark = net_latest + 1, "wallet forward watermark moved");
        Ok(staged)
    }

    fn cleanup(&self, network: &Network, countdown: &mut u32) {
        if *countdown > 0 {
            *countdown -= 1;
            return;
        }
        *countdown = self.ctx.config.sync.forward.cleanup_countdown;

        match self.cleanup_bound(network) {
            Ok(Some(bound)) => match self
                .ctx
                .store
                .delete_zk_events(&network.uid, ZkEventFilter::BlocksBefore(bound))
            {
                Ok(removed) => debug!(bound, removed, "evicted processed zk events"),
                Err(e) => warn!(error = %e, "zk event cleanup failed"),
            },
            Ok(None) => debug!("some wallet has not synced yet, skipping cleanup"),
            Err(e) => warn!(error = %e, "zk event cleanup failed"),
        }
    }

    /// Lowest "next block to process" over every wallet, capped at the cache watermark.
    fn cleanup_bound(&self, network: &Network) -> Result<Option<u64>> {
        let network = self.ctx.fresh_network(network)?;
        let Some(net_latest) = network.latest_zk_event_blk_num else {
            return Ok(None);
        };
        let mut bound = net_latest + 1;
        let wallets: Vec<Wallet> = self.ctx.store.wallets()?;
        for wallet in wallets {
            match self
                .ctx
                .store
                .wn_meta(&wallet.address, &network.uid)?
                .latest_zk_event_blk_num
            {
                Some(latest) => bound = bound.min(latest),
                None => return Ok(None),
            }
        }
        Ok(Some(bound))
    }
}
