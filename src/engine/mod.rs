//! The PoW search engine: a cooperative driver loop over a data-parallel
//! device. Host-side control is a status word checked between dispatches;
//! verified candidates flow out through a bounded channel.

pub mod device;
#[cfg(feature = "gpu")]
pub mod gpu;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::algo::verify;
use crate::contract::Work;

use self::device::SearchDevice;

/// Candidate queue depth between driver and coordinator.
pub const CANDIDATE_QUEUE: usize = 64;

/// EMA weight for the per-sweep hash-rate estimate.
const RATE_ALPHA: f64 = 0.15;

/// Pause while parked in `Ready` with no work.
const PARK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineStatus {
    Ready = 0,
    Mining = 1,
    /// Re-read work and rewrite device buffers without restarting.
    Change = 2,
    /// Cancellation requested; observed within one dispatch interval.
    Stop = 3,
    /// Exit the driver task.
    Shutdown = 4,
}

impl EngineStatus {
    fn from_u8(value: u8) -> EngineStatus {
        match value {
            1 => EngineStatus::Mining,
            2 => EngineStatus::Change,
            3 => EngineStatus::Stop,
            4 => EngineStatus::Shutdown,
            _ => EngineStatus::Ready,
        }
    }
}

/// An 8-byte nonce in its two device halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCandidate {
    pub nonce_hi: u32,
    pub nonce_lo: u32,
}

impl NonceCandidate {
    pub fn value(&self) -> u64 {
        ((self.nonce_hi as u64) << 32) | self.nonce_lo as u64
    }
}

/// Cloneable control surface over a running driver.
#[derive(Clone)]
pub struct EngineHandle {
    status: Arc<AtomicU8>,
    pending: Arc<Mutex<Option<Work>>>,
    rate_bits: Arc<AtomicU64>,
    hashes: Arc<AtomicU64>,
}

impl EngineHandle {
    fn new() -> Self {
        EngineHandle {
            status: Arc::new(AtomicU8::new(EngineStatus::Ready as u8)),
            pending: Arc::new(Mutex::new(None)),
            rate_bits: Arc::new(AtomicU64::new(0)),
            hashes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Hand the driver new work. From `Ready` this starts mining; while
    /// mining it preempts in place.
    pub fn submit_work(&self, work: Work) {
        *self.pending.lock().expect("pending work lock") = Some(work);
        if self.status() != EngineStatus::Shutdown {
            self.set_status(EngineStatus::Change);
        }
    }

    /// Request cancellation. The driver parks in `Ready` after at most one
    /// dispatch.
    pub fn stop(&self) {
        if self.status() != EngineStatus::Shutdown {
            self.set_status(EngineStatus::Stop);
        }
    }

    pub fn shutdown(&self) {
        self.set_status(EngineStatus::Shutdown);
    }

    /// Smoothed hash rate in H/s; updated per completed 32-bit sweep, zero
    /// after a stop.
    pub fn hash_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }

    fn record_sweep(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instant = (u32::MAX as f64 + 1.0) / secs;
        let smoothed = (1.0 - RATE_ALPHA) * self.hash_rate() + RATE_ALPHA * instant;
        self.rate_bits.store(smoothed.to_bits(), Ordering::Relaxed);
    }

    fn reset_rate(&self) {
        self.rate_bits.store(0, Ordering::Relaxed);
    }
}

/// Driver owning the device. `spawn` moves it onto a blocking task; the
/// returned handle and channel outlive it.
pub struct MiningEngine {
    device: Box<dyn SearchDevice>,
    handle: EngineHandle,
    candidates: mpsc::Sender<NonceCandidate>,
}

impl MiningEngine {
    pub fn new(device: Box<dyn SearchDevice>) -> (Self, mpsc::Receiver<NonceCandidate>) {
        let (candidates, rx) = mpsc::channel(CANDIDATE_QUEUE);
        let engine = MiningEngine { device, handle: EngineHandle::new(), candidates };
        (engine, rx)
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(mut self) {
        let mut work: Option<Work> = None;
        let mut nonce_hi = 0u32;
        let mut nonce_offset = 0u32;
        let mut sweep_started = Instant::now();

        info!("search driver started");
        loop {
            match self.handle.status() {
                EngineStatus::Shutdown => break,

                EngineStatus::Ready => std::thread::sleep(PARK_INTERVAL),

                EngineStatus::Stop => {
                    debug!("driver stopped, parking");
                    self.handle.reset_rate();
                    self.handle.set_status(EngineStatus::Ready);
                }

                EngineStatus::Change => {
                    let pending = self.handle.pending.lock().expect("pending work lock").take();
                    if let Some(new_work) = pending {
                        let algo = new_work.algorithm();
                        let midstate =
                            crate::algo::preimage::Midstate::for_algorithm(algo, &new_work.preimage);
                        let target_words = new_work.target().device_words();
                        if let Err(e) =
                            self.device.configure(algo, &midstate.device_words(), &target_words)
                        {
                            error!("device rejected work: {}", e);
                            work = None;
                            self.handle.set_status(EngineStatus::Ready);
                            continue;
                        }
                        info!(algo = algo.name(), "work configured");
                        work = Some(new_work);
                        nonce_hi = 0;
                        nonce_offset = 0;
                        sweep_started = Instant::now();
                    }
                    // A Stop that raced us wins; otherwise resume mining.
                    let _ = self.handle.status.compare_exchange(
                        EngineStatus::Change as u8,
                        if work.is_some() {
                            EngineStatus::Mining as u8
                        } else {
                            EngineStatus::Ready as u8
                        },
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }

                EngineStatus::Mining => {
                    let Some(current) = work.as_ref() else {
                        self.handle.set_status(EngineStatus::Ready);
                        continue;
                    };
                    let mut slots = match self.device.dispatch(nonce_hi, nonce_offset) {
                        Ok(slots) => slots,
                        Err(e) => {
                            error!("device dispatch failed: {}", e);
                            self.handle.reset_rate();
                            self.handle.set_status(EngineStatus::Ready);
                            continue;
                        }
                    };
                    let dispatched = self.device.dispatch_size();
                    self.handle.hashes.fetch_add(dispatched as u64, Ordering::Relaxed);

                    // Results of a dispatch that a stop or work change
                    // overlapped are discarded.
                    if self.handle.status() == EngineStatus::Mining {
                        slots.sort_by_key(|s| s.nonce_lo);
                        for slot in slots.iter().filter(|s| s.flag == 1) {
                            let candidate =
                                NonceCandidate { nonce_hi, nonce_lo: slot.nonce_lo };
                            if !verify::verify(
                                current.algorithm(),
                                &current.preimage,
                                candidate.value(),
                                &current.target(),
                            ) {
                                // Device false positive.
                                debug!(nonce = candidate.value(), "candidate failed host verify");
                                continue;
                            }
                            match self.candidates.try_send(candidate) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!("candidate queue full, dropping nonce")
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    info!("candidate consumer gone, shutting down driver");
                                    return;
                                }
                            }
                        }
                    }

                    let (next_offset, wrapped) = nonce_offset.overflowing_add(dispatched);
                    if wrapped {
                        self.handle.record_sweep(sweep_started.elapsed());
                        sweep_started = Instant::now();
                        nonce_hi = nonce_hi.wrapping_add(1);
                    }
                    nonce_offset = next_offset;
                }
            }
        }
        info!("search driver exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{Algorithm, Target, TargetFormat};
    use crate::chain::tx::OutPoint;
    use crate::contract::script;
    use crate::contract::state::{ContractState, StateHeader};
    use crate::contract::REF_LEN;
    use crate::engine::device::CpuDevice;

    fn easy_work(difficulty: u64) -> Work {
        let header = StateHeader {
            height: 1,
            contract_ref: [1u8; REF_LEN],
            token_ref: [2u8; REF_LEN],
            max_height: 100,
            reward: 1_000,
            target: Target::from_difficulty(TargetFormat::Full256, difficulty),
            algorithm: Algorithm::Blake3,
            last_time: Some(0),
            target_time: Some(60),
        };
        let state = ContractState {
            header,
            location: OutPoint { txid: [3u8; 32], vout: 0 },
            value: 1_000,
            message: None,
        };
        Work::derive(&state, script::p2pkh(&[4u8; 20]), script::message_script("test"))
    }

    async fn wait_for_status(handle: &EngineHandle, status: EngineStatus) {
        for _ in 0..200 {
            if handle.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never reached {:?}", status);
    }

    #[tokio::test]
    async fn test_engine_finds_verified_ordered_candidates() {
        let (engine, mut rx) = MiningEngine::new(Box::new(CpuDevice::new(1)));
        let handle = engine.handle();
        let task = engine.spawn();

        let work = easy_work(10_000);
        handle.submit_work(work.clone());

        let mut last = None;
        for _ in 0..3 {
            let candidate = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for candidate")
                .expect("driver hung up");
            assert!(verify::verify(
                work.algorithm(),
                &work.preimage,
                candidate.value(),
                &work.target()
            ));
            if let Some(prev) = last {
                assert!(candidate.value() > prev, "candidates must arrive in nonce order");
            }
            last = Some(candidate.value());
        }

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_parks_and_resets_rate() {
        let (engine, _rx) = MiningEngine::new(Box::new(CpuDevice::new(1)));
        let handle = engine.handle();
        let task = engine.spawn();

        handle.submit_work(easy_work(1));
        wait_for_status(&handle, EngineStatus::Mining).await;

        handle.stop();
        wait_for_status(&handle, EngineStatus::Ready).await;
        assert_eq!(handle.hash_rate(), 0.0);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_change_rewrites_work_without_restart() {
        let (engine, mut rx) = MiningEngine::new(Box::new(CpuDevice::new(1)));
        let handle = engine.handle();
        let task = engine.spawn();

        handle.submit_work(easy_work(1));
        wait_for_status(&handle, EngineStatus::Mining).await;

        // Preempt with fresh work; the driver keeps running and candidates
        // keep flowing.
        let loose = easy_work(1);
        handle.submit_work(easy_work(2));
        wait_for_status(&handle, EngineStatus::Mining).await;
        // Candidates from before and after the change share the preimage;
        // all of them satisfy the looser of the two targets.
        let candidate = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out after change")
            .expect("driver hung up");
        assert!(verify::verify(
            loose.algorithm(),
            &loose.preimage,
            candidate.value(),
            &loose.target()
        ));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_algorithm_parks_driver() {
        let (engine, _rx) = MiningEngine::new(Box::new(CpuDevice::new(1)));
        let handle = engine.handle();
        let task = engine.spawn();

        let mut work = easy_work(1);
        work.algorithm_id = Algorithm::Argon2Light.id();
        handle.submit_work(work);
        wait_for_status(&handle, EngineStatus::Ready).await;

        handle.shutdown();
        task.await.unwrap();
    }

    #[test]
    fn test_nonce_candidate_value() {
        let candidate = NonceCandidate { nonce_hi: 0x1, nonce_lo: 0xffff_ffff };
        assert_eq!(candidate.value(), 0x1_ffff_ffff);
    }
}
