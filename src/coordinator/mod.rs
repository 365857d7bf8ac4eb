//! Claim coordinator: the single task that owns contract state, wallet
//! snapshots and counters, consumes verified nonces, broadcasts claims and
//! reacts to chain events.
//!
//! At most one broadcast is ever in flight. Candidates that arrive while
//! one resolves collapse to the freshest; a reject of a stale nonce is the
//! expected outcome after a lost race, so the newest attempt is always the
//! one worth trying.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::algo::daa::{self, DaaMode, DaaState};
use crate::chain::gateway::{ChainGateway, StatusEvent};
use crate::chain::tx_builder::{ClaimBuilder, ClaimParams, FEE_PER_KB};
use crate::chain::wallet::{script_hash, WalletProvider, WalletSnapshot};
use crate::contract::state::{ContractState, ContractUpdate, Work};
use crate::contract::{script, REF_LEN};
use crate::engine::{EngineHandle, NonceCandidate};
use crate::error::{BroadcastRejection, MinerError};

/// Reserve kept in the wallet beyond the per-mint reward (0.01 coin).
pub const MIN_BALANCE_PHOTONS: u64 = 1_000_000;

/// Our own recent claim txids, kept to suppress subscription echoes.
const RECENT_LOCATIONS_CAP: usize = 20;

/// Conflicts in a row before a full recovery.
const MAX_CONSECUTIVE_CONFLICTS: u32 = 3;

/// No status after a broadcast within this window forces an unspent
/// refresh.
const SUBSCRIPTION_CHECK: Duration = Duration::from_secs(10);

/// Subscription silence before the contract location is re-checked.
const CONTRACT_CHECK_IDLE: Duration = Duration::from_secs(60);

/// Shortened re-check after a mempool conflict.
const CONTRACT_CHECK_CONFLICT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Subscribed contract reference, little-endian form.
    pub contract_ref_le: [u8; REF_LEN],
    /// Annotation placed in every claim's message output.
    pub mint_message: String,
    pub daa_mode: DaaMode,
    pub min_balance: u64,
    pub fee_per_kb: u64,
}

impl CoordinatorConfig {
    pub fn new(contract_ref_le: [u8; REF_LEN]) -> Self {
        CoordinatorConfig {
            contract_ref_le,
            mint_message: String::new(),
            daa_mode: DaaMode::Fixed,
            min_balance: MIN_BALANCE_PHOTONS,
            fee_per_kb: FEE_PER_KB,
        }
    }
}

/// Immutable view published to observers after every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinerStatusSnapshot {
    pub mining: bool,
    pub burned: bool,
    pub height: u64,
    pub max_height: u64,
    pub difficulty: u64,
    pub hash_rate: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub notice: Option<String>,
}

pub struct MintController<G, W> {
    gateway: Arc<G>,
    wallet: Arc<W>,
    engine: EngineHandle,
    candidates: mpsc::Receiver<NonceCandidate>,
    events_tx: mpsc::Sender<StatusEvent>,
    events: mpsc::Receiver<StatusEvent>,
    config: CoordinatorConfig,

    contract: Option<ContractState>,
    work: Option<Work>,
    daa: Option<DaaState>,
    snapshot: WalletSnapshot,
    mining_enabled: bool,
    burned: bool,
    /// Terminal mint broadcast, burn confirmation still pending.
    pending_burn: bool,

    accepted: u64,
    rejected: u64,
    conflicts: u32,
    recent_locations: VecDeque<[u8; 32]>,
    last_status_token: Option<String>,
    subscribed_hash: Option<[u8; 32]>,

    subscription_check_at: Option<Instant>,
    contract_check_at: Instant,

    status_tx: watch::Sender<MinerStatusSnapshot>,
}

impl<G: ChainGateway, W: WalletProvider> MintController<G, W> {
    pub fn new(
        gateway: Arc<G>,
        wallet: Arc<W>,
        engine: EngineHandle,
        candidates: mpsc::Receiver<NonceCandidate>,
        config: CoordinatorConfig,
    ) -> (Self, watch::Receiver<MinerStatusSnapshot>) {
        let (events_tx, events) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(MinerStatusSnapshot::default());
        let controller = MintController {
            gateway,
            wallet,
            engine,
            candidates,
            events_tx,
            events,
            config,
            contract: None,
            work: None,
            daa: None,
            snapshot: WalletSnapshot::default(),
            mining_enabled: false,
            burned: false,
            pending_burn: false,
            accepted: 0,
            rejected: 0,
            conflicts: 0,
            recent_locations: VecDeque::new(),
            last_status_token: None,
            subscribed_hash: None,
            subscription_check_at: None,
            contract_check_at: Instant::now() + CONTRACT_CHECK_IDLE,
            status_tx,
        };
        (controller, status_rx)
    }

    /// Load the contract, pass the balance gate and run the event loop
    /// until the engine side hangs up.
    pub async fn run(mut self) -> Result<(), MinerError> {
        self.refresh_wallet().await?;
        self.load_contract_with_retry().await?;

        let reward = self.contract.as_ref().map(|c| c.header.reward).unwrap_or(0);
        if self.snapshot.total() < self.config.min_balance + reward {
            self.notify(format!(
                "balance {} photons below the {} needed to mine",
                self.snapshot.total(),
                self.config.min_balance + reward
            ));
        } else {
            self.start_engine();
        }
        self.publish();

        loop {
            tokio::select! {
                candidate = self.candidates.recv() => {
                    let Some(candidate) = candidate else { break };
                    self.on_candidate(candidate).await;
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.on_status_event(event).await;
                }
                _ = deadline(self.subscription_check_at) => {
                    self.on_subscription_check().await;
                }
                _ = tokio::time::sleep_until(self.contract_check_at) => {
                    self.on_contract_check().await;
                }
            }
            self.publish();
        }
        self.engine.shutdown();
        Ok(())
    }

    // --- candidate path ---

    async fn on_candidate(&mut self, first: NonceCandidate) {
        // Collapse the backlog to the freshest nonce.
        let mut candidate = first;
        while let Ok(newer) = self.candidates.try_recv() {
            candidate = newer;
        }
        if !self.mining_enabled || self.burned || self.pending_burn {
            return;
        }
        let (Some(state), Some(work)) = (self.contract.as_ref(), self.work.as_ref()) else {
            return;
        };

        // Final host check against the live work; the engine may have
        // produced this under a configuration we already left behind.
        if !crate::algo::verify::verify(
            work.algorithm(),
            &work.preimage,
            candidate.value(),
            &work.target(),
        ) {
            debug!(nonce = candidate.value(), "dropping stale candidate");
            return;
        }

        let now = unix_time();
        let new_height = state.header.height + 1;
        let next_difficulty = match self.daa.as_ref() {
            Some(daa_state) => {
                daa::next_difficulty(&self.config.daa_mode, daa_state, new_height, now)
            }
            None => state.header.target.difficulty(),
        };
        let next_target = crate::algo::Target::from_difficulty(
            state.header.algorithm.target_format(),
            next_difficulty,
        );

        let claim_result = {
            let params = ClaimParams {
                state,
                work,
                nonce: candidate.value(),
                contract_value: state.value,
                next_target,
                mint_time: now as u32,
                snapshot: &self.snapshot,
            };
            ClaimBuilder::new(self.wallet.as_ref())
                .with_fee_per_kb(self.config.fee_per_kb)
                .build(&params)
        };
        let claim = match claim_result {
            Ok(tx) => tx,
            Err(MinerError::BalanceTooLow { have, need }) => {
                self.stop_and_notify(format!(
                    "balance too low to assemble a claim ({} < {})",
                    have, need
                ));
                return;
            }
            Err(e) => {
                error!("claim assembly failed: {}", e);
                return;
            }
        };

        info!(height = new_height, nonce = candidate.value(), "broadcasting claim");
        let gateway = self.gateway.clone();
        let broadcast_result = gateway.broadcast(claim.serialize()).await;
        match broadcast_result {
            Ok(txid) => self.on_accept(txid, next_target, next_difficulty, now).await,
            Err(MinerError::BroadcastRejected(rejection)) => {
                self.on_reject(rejection).await;
            }
            Err(e) => {
                warn!("broadcast transport failure: {}", e);
                self.contract_check_at = Instant::now() + CONTRACT_CHECK_CONFLICT;
            }
        }
    }

    /// Optimistic local advance after an accepted broadcast.
    async fn on_accept(
        &mut self,
        txid: [u8; 32],
        next_target: crate::algo::Target,
        next_difficulty: u64,
        now: u64,
    ) {
        self.accepted += 1;
        self.conflicts = 0;
        self.recent_locations.push_back(txid);
        while self.recent_locations.len() > RECENT_LOCATIONS_CAP {
            self.recent_locations.pop_front();
        }

        let Some(state) = self.contract.as_mut() else { return };
        let terminal = state.header.next_mint_is_terminal();
        state.header = state.header.advanced(next_target, now as u32);
        state.location = crate::chain::tx::OutPoint { txid, vout: 0 };
        info!(height = state.header.height, txid = %hex::encode(txid), "claim accepted");

        if let Some(daa_state) = self.daa.as_mut() {
            daa_state.record_block(&self.config.daa_mode, state.header.height, now, next_difficulty);
        }

        if terminal {
            // Nothing left to mine; the burn is confirmed by the next
            // subscription echo.
            self.pending_burn = true;
            self.engine.stop();
        } else {
            self.rederive_work();
            self.resubscribe().await;
        }
        self.subscription_check_at = Some(Instant::now() + SUBSCRIPTION_CHECK);

        // Re-check the balance gate on every accept.
        if let Err(e) = self.refresh_wallet().await {
            warn!("unspent refresh after accept failed: {}", e);
        }
        let reward = self.contract.as_ref().map(|c| c.header.reward).unwrap_or(0);
        if !self.pending_burn && self.snapshot.total() < self.config.min_balance + reward {
            self.stop_and_notify(format!(
                "balance {} photons below the {} needed to continue",
                self.snapshot.total(),
                self.config.min_balance + reward
            ));
        }
    }

    async fn on_reject(&mut self, rejection: BroadcastRejection) {
        self.rejected += 1;
        warn!(%rejection, "claim rejected");
        match rejection {
            BroadcastRejection::MempoolConflict => {
                self.conflicts += 1;
                if self.conflicts >= MAX_CONSECUTIVE_CONFLICTS {
                    self.full_recovery().await;
                } else {
                    self.contract_check_at = Instant::now() + CONTRACT_CHECK_CONFLICT;
                }
            }
            BroadcastRejection::ContractFail | BroadcastRejection::MissingInputs => {
                self.full_recovery().await;
            }
            BroadcastRejection::LowFee => {
                self.stop_and_notify("claim fee below the relay minimum".to_string());
            }
            BroadcastRejection::Other(reason) => {
                debug!("unclassified reject: {}", reason);
            }
        }
    }

    // --- chain event path ---

    async fn on_status_event(&mut self, event: StatusEvent) {
        if self.last_status_token.as_deref() == Some(event.status.as_str()) {
            return;
        }
        self.last_status_token = Some(event.status);
        self.subscription_check_at = None;
        self.contract_check_at = Instant::now() + CONTRACT_CHECK_IDLE;
        self.sync_location().await;
    }

    async fn on_subscription_check(&mut self) {
        debug!("no status after broadcast, refreshing unspent");
        self.subscription_check_at = None;
        if let Err(e) = self.refresh_wallet().await {
            warn!("unspent refresh failed: {}", e);
        }
    }

    async fn on_contract_check(&mut self) {
        self.contract_check_at = Instant::now() + CONTRACT_CHECK_IDLE;
        if self.conflicts > 0 {
            self.full_recovery().await;
        } else {
            self.sync_location().await;
        }
    }

    /// Compare our location against the chain and adopt whatever moved.
    async fn sync_location(&mut self) {
        let Some(state) = self.contract.as_ref() else { return };
        let locations = match self.gateway.fetch_ref(&self.config.contract_ref_le).await {
            Ok(locations) => locations,
            Err(e) => {
                warn!("location refresh failed: {}", e);
                return;
            }
        };
        if locations.current == state.location
            || self.recent_locations.contains(&locations.current.txid)
        {
            // Our own mint coming back around; only a pending burn needs
            // acting on.
            if self.pending_burn {
                self.finalize_burn();
            }
            return;
        }
        self.adopt_location(locations.current.txid).await;
    }

    /// Someone else minted; reload the state from their transaction.
    async fn adopt_location(&mut self, txid: [u8; 32]) {
        let fetched = match self.gateway.fetch_tx(txid, true).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!("could not fetch new location {}: {}", hex::encode(txid), e);
                return;
            }
        };
        let subscribed = self.config.contract_ref_le;
        match ContractState::from_outputs(fetched.txid, &fetched.outputs, &subscribed) {
            Ok(ContractUpdate::Active(new_state)) => {
                info!(height = new_state.header.height, "contract moved, adopting new state");
                let now = unix_time();
                if let Some(daa_state) = self.daa.as_mut() {
                    daa_state.record_block(
                        &self.config.daa_mode,
                        new_state.header.height,
                        now,
                        new_state.header.target.difficulty(),
                    );
                }
                self.contract = Some(new_state);
                self.conflicts = 0;
                if self.mining_enabled {
                    self.rederive_work();
                }
                self.resubscribe().await;
            }
            Ok(ContractUpdate::Burned { .. }) => self.finalize_burn(),
            Err(e) => warn!("new location does not parse as the contract: {}", e),
        }
    }

    fn finalize_burn(&mut self) {
        if let Some(state) = self.contract.as_mut() {
            state.header.height = state.header.max_height;
        }
        self.burned = true;
        self.pending_burn = false;
        self.mining_enabled = false;
        self.engine.stop();
        self.notify("minted out".to_string());
    }

    // --- recovery and plumbing ---

    /// Stop, refresh unspent, refetch the location, resubscribe, restart.
    async fn full_recovery(&mut self) {
        info!("full recovery");
        self.engine.stop();
        self.conflicts = 0;
        if let Err(e) = self.refresh_wallet().await {
            warn!("recovery unspent refresh failed: {}", e);
        }
        if let Err(e) = self.load_contract().await {
            warn!("recovery location refetch failed: {}", e);
            return;
        }
        if self.mining_enabled && !self.burned {
            self.start_engine();
        }
    }

    async fn load_contract_with_retry(&mut self) -> Result<(), MinerError> {
        let mut delay = Duration::from_millis(500);
        let mut attempts = 0u32;
        loop {
            match self.load_contract().await {
                Ok(()) => return Ok(()),
                Err(MinerError::ChainUnavailable(reason)) if attempts < 3 => {
                    attempts += 1;
                    warn!("contract load failed (attempt {}/3): {}", attempts, reason);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_contract(&mut self) -> Result<(), MinerError> {
        let subscribed = self.config.contract_ref_le;
        let locations = self.gateway.fetch_ref(&subscribed).await?;
        let fetched = self.gateway.fetch_tx(locations.current.txid, true).await?;
        match ContractState::from_outputs(fetched.txid, &fetched.outputs, &subscribed)? {
            ContractUpdate::Active(state) => {
                let difficulty = state.header.target.difficulty();
                let daa_state = self
                    .daa
                    .take()
                    .unwrap_or_else(|| DaaState::new(difficulty, state.header.height, unix_time()));
                self.daa = Some(daa_state);
                self.contract = Some(state);
                self.rederive_work();
                self.resubscribe().await;
                Ok(())
            }
            ContractUpdate::Burned { .. } => {
                self.finalize_burn();
                Ok(())
            }
        }
    }

    fn start_engine(&mut self) {
        if self.burned {
            return;
        }
        self.mining_enabled = true;
        if let Some(work) = self.work.clone() {
            self.engine.submit_work(work);
        }
    }

    fn rederive_work(&mut self) {
        let Some(state) = self.contract.as_ref() else { return };
        let input_script = script::p2pkh(&self.wallet.pubkey_hash());
        let output_script = script::message_script(&self.config.mint_message);
        let work = Work::derive(state, input_script, output_script);
        if self.mining_enabled {
            self.engine.submit_work(work.clone());
        }
        self.work = Some(work);
    }

    async fn resubscribe(&mut self) {
        let Some(state) = self.contract.as_ref() else { return };
        let new_hash = script_hash(&state.header.encode());
        if self.subscribed_hash == Some(new_hash) {
            return;
        }
        if let Some(old) = self.subscribed_hash.take() {
            if let Err(e) = self.gateway.unsubscribe(old).await {
                debug!("unsubscribe failed: {}", e);
            }
        }
        match self.gateway.subscribe(new_hash, self.events_tx.clone()).await {
            Ok(()) => {
                self.subscribed_hash = Some(new_hash);
                self.last_status_token = None;
            }
            Err(e) => warn!("subscription failed: {}", e),
        }
    }

    async fn refresh_wallet(&mut self) -> Result<(), MinerError> {
        self.snapshot = self.wallet.unspent().await?;
        Ok(())
    }

    fn stop_and_notify(&mut self, message: String) {
        self.mining_enabled = false;
        self.engine.stop();
        self.notify(message);
    }

    fn notify(&mut self, message: String) {
        warn!("{}", message);
        let mut snapshot = self.snapshot_now();
        snapshot.notice = Some(message);
        let _ = self.status_tx.send(snapshot);
    }

    fn publish(&self) {
        let _ = self.status_tx.send(self.snapshot_now());
    }

    fn snapshot_now(&self) -> MinerStatusSnapshot {
        let (height, max_height, difficulty) = match self.contract.as_ref() {
            Some(state) => (
                state.header.height,
                state.header.max_height,
                state.header.target.difficulty(),
            ),
            None => (0, 0, 0),
        };
        MinerStatusSnapshot {
            mining: self.mining_enabled,
            burned: self.burned,
            height,
            max_height,
            difficulty,
            hash_rate: self.engine.hash_rate(),
            accepted: self.accepted,
            rejected: self.rejected,
            notice: self.status_tx.borrow().notice.clone(),
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
