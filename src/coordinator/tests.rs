use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::algo::{Algorithm, Target, TargetFormat};
use crate::chain::gateway::{ChainGateway, FetchedTx, RefLocations, StatusEvent};
use crate::chain::tx::{OutPoint, TxOutput};
use crate::chain::wallet::{MiningKey, SingleKeyWallet, Unspent, WalletProvider, WalletSnapshot};
use crate::contract::state::StateHeader;
use crate::contract::REF_LEN;
use crate::engine::device::CpuDevice;
use crate::engine::{EngineStatus, MiningEngine, NonceCandidate};
use crate::error::{BroadcastRejection, MinerError};

use super::*;

// --- fixtures ---

struct MockState {
    txs: HashMap<[u8; 32], FetchedTx>,
    current: OutPoint,
    scripted_broadcasts: VecDeque<Result<[u8; 32], MinerError>>,
    subscribers: Vec<mpsc::Sender<StatusEvent>>,
}

struct MockGateway {
    state: Mutex<MockState>,
    broadcasts: AtomicUsize,
    ref_fetches: AtomicUsize,
}

impl MockGateway {
    fn new(genesis: FetchedTx) -> Self {
        let current = OutPoint { txid: genesis.txid, vout: 0 };
        let mut txs = HashMap::new();
        txs.insert(genesis.txid, genesis);
        MockGateway {
            state: Mutex::new(MockState {
                txs,
                current,
                scripted_broadcasts: VecDeque::new(),
                subscribers: Vec::new(),
            }),
            broadcasts: AtomicUsize::new(0),
            ref_fetches: AtomicUsize::new(0),
        }
    }

    fn script_broadcast(&self, outcome: Result<[u8; 32], MinerError>) {
        self.state.lock().unwrap().scripted_broadcasts.push_back(outcome);
    }

    fn set_current(&self, location: OutPoint) {
        self.state.lock().unwrap().current = location;
    }

    fn add_tx(&self, tx: FetchedTx) {
        self.state.lock().unwrap().txs.insert(tx.txid, tx);
    }

    async fn send_status(&self, token: &str) {
        let subscribers: Vec<_> = self.state.lock().unwrap().subscribers.clone();
        for sub in subscribers {
            let _ = sub
                .send(StatusEvent { script_hash: [0u8; 32], status: token.to_string() })
                .await;
        }
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn fetch_tx(&self, txid: [u8; 32], _fresh: bool) -> Result<FetchedTx, MinerError> {
        self.state
            .lock()
            .unwrap()
            .txs
            .get(&txid)
            .cloned()
            .ok_or_else(|| MinerError::ChainUnavailable("unknown tx".into()))
    }

    async fn fetch_ref(&self, _contract_ref: &[u8; REF_LEN]) -> Result<RefLocations, MinerError> {
        self.ref_fetches.fetch_add(1, Ordering::SeqCst);
        let current = self.state.lock().unwrap().current;
        Ok(RefLocations { first: current, current })
    }

    async fn subscribe(
        &self,
        _script_hash: [u8; 32],
        events: mpsc::Sender<StatusEvent>,
    ) -> Result<(), MinerError> {
        self.state.lock().unwrap().subscribers.push(events);
        Ok(())
    }

    async fn unsubscribe(&self, _script_hash: [u8; 32]) -> Result<(), MinerError> {
        Ok(())
    }

    async fn broadcast(&self, raw_tx: Vec<u8>) -> Result<[u8; 32], MinerError> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(outcome) = state.scripted_broadcasts.pop_front() {
            return outcome;
        }
        let mut txid = crate::algo::preimage::sha256d(&raw_tx);
        txid.reverse();
        state.current = OutPoint { txid, vout: 0 };
        Ok(txid)
    }
}

struct TestWallet {
    inner: SingleKeyWallet,
    refreshes: AtomicUsize,
}

impl TestWallet {
    fn with_balance(value: u64) -> Self {
        let inner = SingleKeyWallet::new(MiningKey::random());
        inner.set_unspent(WalletSnapshot {
            unspent: vec![Unspent {
                outpoint: OutPoint { txid: [0xEE; 32], vout: 0 },
                value,
            }],
        });
        TestWallet { inner, refreshes: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl WalletProvider for TestWallet {
    fn address(&self) -> String {
        self.inner.address()
    }
    fn public_key(&self) -> [u8; 33] {
        self.inner.public_key()
    }
    fn pubkey_hash(&self) -> [u8; 20] {
        self.inner.pubkey_hash()
    }
    fn change_script(&self) -> Vec<u8> {
        self.inner.change_script()
    }
    fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        self.inner.sign_digest(digest)
    }
    async fn unspent(&self) -> Result<WalletSnapshot, MinerError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.inner.unspent().await
    }
}

fn header_at(height: u64, difficulty: u64) -> StateHeader {
    StateHeader {
        height,
        contract_ref: [0xAA; REF_LEN],
        token_ref: [0xBB; REF_LEN],
        max_height: 100,
        reward: 1_000_000,
        target: Target::from_difficulty(TargetFormat::Full256, difficulty),
        algorithm: Algorithm::Blake3,
        last_time: Some(1_700_000_000),
        target_time: Some(60),
    }
}

fn genesis_tx(header: &StateHeader) -> FetchedTx {
    FetchedTx {
        txid: [0x11; 32],
        outputs: vec![TxOutput::new(1_000, header.encode())],
    }
}

fn subscribed_ref(header: &StateHeader) -> [u8; REF_LEN] {
    let mut contract_ref = header.contract_ref;
    contract_ref.reverse();
    contract_ref
}

struct Harness {
    gateway: Arc<MockGateway>,
    wallet: Arc<TestWallet>,
    candidates_tx: mpsc::Sender<NonceCandidate>,
    status: watch::Receiver<MinerStatusSnapshot>,
    engine: EngineHandle,
    // Keeps the driverless engine (and its channel ends) alive.
    _engine_owner: MiningEngine,
    _task: tokio::task::JoinHandle<Result<(), MinerError>>,
}

fn launch(header: StateHeader, balance: u64) -> Harness {
    let gateway = Arc::new(MockGateway::new(genesis_tx(&header)));
    let wallet = Arc::new(TestWallet::with_balance(balance));
    let (engine_owner, _unused_rx) = MiningEngine::new(Box::new(CpuDevice::new(1)));
    let engine = engine_owner.handle();
    let (candidates_tx, candidates_rx) = mpsc::channel(16);
    let config = CoordinatorConfig::new(subscribed_ref(&header));

    let (controller, status) = MintController::new(
        gateway.clone(),
        wallet.clone(),
        engine.clone(),
        candidates_rx,
        config,
    );
    let task = tokio::spawn(controller.run());
    Harness {
        gateway,
        wallet,
        candidates_tx,
        status,
        engine,
        _engine_owner: engine_owner,
        _task: task,
    }
}

async fn wait_for<F>(status: &mut watch::Receiver<MinerStatusSnapshot>, what: &str, predicate: F)
where
    F: Fn(&MinerStatusSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if predicate(&status.borrow()) {
            return;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for {}: {:?}", what, *status.borrow());
        }
        let _ = tokio::time::timeout(remaining, status.changed()).await;
    }
}

fn candidate(nonce: u64) -> NonceCandidate {
    NonceCandidate { nonce_hi: (nonce >> 32) as u32, nonce_lo: nonce as u32 }
}

// --- scenarios ---

#[tokio::test]
async fn test_accept_advances_height_optimistically() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;
    assert_eq!(h.status.borrow().height, 10);

    h.candidates_tx.send(candidate(7)).await.unwrap();
    wait_for(&mut h.status, "an accept", |s| s.accepted == 1).await;

    let snapshot = h.status.borrow().clone();
    assert_eq!(snapshot.height, 11);
    assert_eq!(snapshot.rejected, 0);
    assert_eq!(h.gateway.broadcasts.load(Ordering::SeqCst), 1);
    // The engine was preempted with fresh work rather than restarted.
    assert_eq!(h.engine.status(), EngineStatus::Change);
}

#[tokio::test]
async fn test_stale_candidate_never_broadcasts() {
    // Difficulty 2^40 over a 256-bit space: nonce 7 will not verify.
    let mut h = launch(header_at(10, 1 << 40), 100_000_000);
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;

    h.candidates_tx.send(candidate(7)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.gateway.broadcasts.load(Ordering::SeqCst), 0);
    assert_eq!(h.status.borrow().accepted, 0);
}

#[tokio::test]
async fn test_mempool_conflict_ladder_triggers_full_recovery() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    for _ in 0..3 {
        h.gateway.script_broadcast(Err(MinerError::BroadcastRejected(
            BroadcastRejection::MempoolConflict,
        )));
    }
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;
    let refreshes_before = h.wallet.refreshes.load(Ordering::SeqCst);
    let ref_fetches_before = h.gateway.ref_fetches.load(Ordering::SeqCst);

    // First two conflicts: reject counted, engine keeps running.
    for expected in 1..=2u64 {
        h.candidates_tx.send(candidate(expected)).await.unwrap();
        wait_for(&mut h.status, "a reject", move |s| s.rejected == expected).await;
        assert!(h.status.borrow().mining);
        assert_eq!(h.wallet.refreshes.load(Ordering::SeqCst), refreshes_before);
    }

    // Third consecutive conflict: full recovery refreshes the wallet and
    // refetches the location.
    h.candidates_tx.send(candidate(3)).await.unwrap();
    wait_for(&mut h.status, "the third reject", |s| s.rejected == 3).await;
    wait_for(&mut h.status, "recovery to finish", |s| s.mining).await;
    assert!(h.wallet.refreshes.load(Ordering::SeqCst) > refreshes_before);
    assert!(h.gateway.ref_fetches.load(Ordering::SeqCst) > ref_fetches_before);
    assert_eq!(h.engine.status(), EngineStatus::Change);
}

#[tokio::test]
async fn test_contract_fail_recovers_immediately() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    h.gateway.script_broadcast(Err(MinerError::BroadcastRejected(
        BroadcastRejection::ContractFail,
    )));
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;
    let refreshes_before = h.wallet.refreshes.load(Ordering::SeqCst);

    h.candidates_tx.send(candidate(1)).await.unwrap();
    wait_for(&mut h.status, "the reject", |s| s.rejected == 1).await;
    wait_for(&mut h.status, "recovery to finish", |s| s.mining).await;
    assert!(h.wallet.refreshes.load(Ordering::SeqCst) > refreshes_before);
}

#[tokio::test]
async fn test_low_fee_stops_and_notifies() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    h.gateway
        .script_broadcast(Err(MinerError::BroadcastRejected(BroadcastRejection::LowFee)));
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;

    h.candidates_tx.send(candidate(1)).await.unwrap();
    wait_for(&mut h.status, "the stop", |s| !s.mining && s.notice.is_some()).await;
    // No driver is attached, so the stop request stays visible.
    assert_eq!(h.engine.status(), EngineStatus::Stop);
    assert_eq!(h.status.borrow().rejected, 1);
}

#[tokio::test]
async fn test_terminal_mint_burns_and_reports_minted_out() {
    let mut h = launch(header_at(99, 1), 100_000_000);
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;

    h.candidates_tx.send(candidate(1)).await.unwrap();
    wait_for(&mut h.status, "the terminal accept", |s| s.accepted == 1).await;
    assert_eq!(h.status.borrow().height, 100);

    // The subscription echoes our own burn back; "minted out" follows.
    h.gateway.send_status("burn-status").await;
    wait_for(&mut h.status, "the burn", |s| s.burned).await;
    let snapshot = h.status.borrow().clone();
    assert!(!snapshot.mining);
    assert_eq!(snapshot.notice.as_deref(), Some("minted out"));
    assert_eq!(h.engine.status(), EngineStatus::Stop);
}

#[tokio::test]
async fn test_duplicate_status_tokens_are_idempotent() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;
    let before = h.gateway.ref_fetches.load(Ordering::SeqCst);

    h.gateway.send_status("tok-1").await;
    h.gateway.send_status("tok-1").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.gateway.ref_fetches.load(Ordering::SeqCst), before + 1);
}

#[tokio::test]
async fn test_foreign_mint_adopts_new_state() {
    let mut h = launch(header_at(10, 1), 100_000_000);
    wait_for(&mut h.status, "mining to start", |s| s.mining).await;

    // Someone else mints height 11 at a new location.
    let mut next = header_at(11, 1);
    next.last_time = Some(1_700_000_600);
    h.gateway.add_tx(FetchedTx {
        txid: [0x99; 32],
        outputs: vec![TxOutput::new(1_000, next.encode())],
    });
    h.gateway.set_current(OutPoint { txid: [0x99; 32], vout: 0 });
    h.gateway.send_status("foreign-mint").await;

    wait_for(&mut h.status, "adoption", |s| s.height == 11).await;
    assert!(h.status.borrow().mining);
    assert_eq!(h.engine.status(), EngineStatus::Change);
}

#[tokio::test]
async fn test_balance_gate_blocks_start() {
    let mut h = launch(header_at(10, 1), 10_000);
    wait_for(&mut h.status, "the balance notice", |s| s.notice.is_some()).await;
    assert!(!h.status.borrow().mining);
    assert_eq!(h.engine.status(), EngineStatus::Ready);
}
