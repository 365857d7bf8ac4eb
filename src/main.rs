use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dmint_miner::algo::daa::DaaMode;
use dmint_miner::algo::{Algorithm, Target};
use dmint_miner::chain::tx::OutPoint;
use dmint_miner::config;
use dmint_miner::contract::state::{ContractState, StateHeader};
use dmint_miner::contract::{script, Work, REF_LEN};
use dmint_miner::engine::device::CpuDevice;
use dmint_miner::engine::MiningEngine;
use dmint_miner::error::MinerError;

// Validation bounds for the bench command
const MAX_WORKGROUPS: u32 = 4096;
const MAX_DURATION: u64 = 86400; // 24 hours

#[derive(Parser)]
#[command(name = "dmint-miner")]
#[command(about = "Proof-of-work miner for dMint token contracts", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exercise the search engine against a synthetic contract
    Bench {
        /// Hash algorithm: sha256d, blake3, k12
        #[arg(short, long, default_value = "sha256d")]
        algorithm: String,

        /// Initial difficulty
        #[arg(short, long, default_value = "1000")]
        difficulty: u64,

        /// DAA mode to report for the synthetic token: fixed, epoch,
        /// asert, lwma, schedule
        #[arg(long, default_value = "fixed")]
        daa_mode: String,

        /// Target seconds between mints, for the DAA report
        #[arg(long, default_value = "300")]
        target_block_time: u64,

        /// Device workgroup hint (256 threads each)
        #[arg(short, long)]
        workgroups: Option<u32>,

        /// Memory ceiling in MiB, reserved for argon2id-light
        #[arg(long, default_value = "512")]
        max_memory: u64,

        /// Bench duration in seconds
        #[arg(long, default_value = "30")]
        duration: u64,
    },

    /// Decode a dMint locking script from hex
    Decode {
        script_hex: String,
    },

    /// Generate a default configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dmint_miner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            e.downcast_ref::<MinerError>().map(|m| m.exit_code()).unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Bench {
            algorithm,
            difficulty,
            daa_mode,
            target_block_time,
            workgroups,
            max_memory,
            duration,
        } => {
            run_bench(
                &algorithm,
                difficulty,
                &daa_mode,
                target_block_time,
                workgroups,
                max_memory,
                duration,
            )
            .await
        }
        Commands::Decode { script_hex } => {
            let bytes = hex::decode(script_hex.trim())
                .map_err(|e| MinerError::ConfigInvalid(format!("script hex: {}", e)))?;
            let header = StateHeader::parse(&bytes)?;
            println!("algorithm:   {}", header.algorithm.name());
            println!("height:      {} / {}", header.height, header.max_height);
            println!("reward:      {} photons", header.reward);
            println!("difficulty:  {}", header.target.difficulty());
            println!("contract:    {}", hex::encode(header.contract_ref));
            println!("token:       {}", hex::encode(header.token_ref));
            if let (Some(last_time), Some(target_time)) = (header.last_time, header.target_time) {
                println!("last mint:   {}", last_time);
                println!("target time: {} s", target_time);
            }
            Ok(0)
        }
        Commands::Init { output } => {
            let config = config::Config::default();
            config.save(&output)?;
            info!("Configuration file created at: {}", output);
            Ok(0)
        }
    }
}

async fn run_bench(
    algorithm: &str,
    difficulty: u64,
    daa_mode: &str,
    target_block_time: u64,
    workgroups: Option<u32>,
    _max_memory: u64,
    duration: u64,
) -> Result<i32> {
    let algo = Algorithm::from_name(algorithm)?;
    if !algo.is_minable() {
        return Err(MinerError::UnsupportedAlgorithm(algo.name().to_string()).into());
    }
    if difficulty == 0 {
        bail!("difficulty must be positive");
    }
    if duration == 0 || duration > MAX_DURATION {
        bail!("duration must be between 1 and {} seconds", MAX_DURATION);
    }
    let workgroups = workgroups.unwrap_or_else(|| (num_cpus::get() as u32).max(1));
    if workgroups == 0 || workgroups > MAX_WORKGROUPS {
        bail!("workgroup count must be between 1 and {}", MAX_WORKGROUPS);
    }
    let mode = bench_daa_mode(daa_mode, target_block_time)?;
    mode.validate()?;

    info!("Starting bench");
    info!("Algorithm: {}", algo.name());
    info!("Difficulty: {}", difficulty);
    info!("DAA mode: {}", mode.name());
    info!("Workgroups: {}", workgroups);

    let work = synthetic_work(algo, difficulty);
    let (engine, mut candidates) = MiningEngine::new(Box::new(CpuDevice::new(workgroups)));
    let handle = engine.handle();
    let driver = engine.spawn();
    handle.submit_work(work);

    let started = std::time::Instant::now();
    let mut found = 0u64;
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    let code = loop {
        tokio::select! {
            _ = &mut deadline => break 0,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break 130;
            }
            _ = report.tick() => {
                let elapsed = started.elapsed().as_secs_f64();
                let rate = handle.hashes() as f64 / elapsed.max(f64::EPSILON);
                info!(
                    "Rate: {:.2} MH/s ({} nonces found)",
                    rate / 1_000_000.0,
                    found
                );
            }
            Some(candidate) = candidates.recv() => {
                found += 1;
                info!(
                    "Found nonce 0x{:016x} after {:?}",
                    candidate.value(),
                    started.elapsed()
                );
            }
        }
    };

    handle.shutdown();
    let _ = driver.await;
    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "Bench complete: {} hashes in {:.1} s, {} candidates",
        handle.hashes(),
        elapsed,
        found
    );
    Ok(code)
}

fn bench_daa_mode(name: &str, target_block_time: u64) -> Result<DaaMode, MinerError> {
    match name {
        "fixed" => Ok(DaaMode::Fixed),
        "epoch" => Ok(DaaMode::Epoch {
            epoch_length: 100,
            target_block_time,
            max_adjustment: 4,
        }),
        "asert" => Ok(DaaMode::Asert {
            target_block_time,
            half_life: 12 * target_block_time.max(1),
            asymptote: 0,
        }),
        "lwma" => Ok(DaaMode::Lwma { target_block_time, window_size: 60 }),
        "schedule" => Ok(DaaMode::Schedule {
            breakpoints: vec![dmint_miner::algo::daa::Breakpoint { height: 0, difficulty: 1_000 }],
        }),
        other => Err(MinerError::ConfigInvalid(format!("unknown DAA mode '{}'", other))),
    }
}

fn synthetic_work(algo: Algorithm, difficulty: u64) -> Work {
    let header = StateHeader {
        height: 0,
        contract_ref: [0u8; REF_LEN],
        token_ref: [0u8; REF_LEN],
        max_height: u32::MAX as u64,
        reward: 1,
        target: Target::from_difficulty(algo.target_format(), difficulty),
        algorithm: algo,
        last_time: Some(0),
        target_time: Some(300),
    };
    let state = ContractState {
        header,
        location: OutPoint { txid: [0u8; 32], vout: 0 },
        value: 0,
        message: None,
    };
    Work::derive(
        &state,
        script::p2pkh(&[0u8; 20]),
        script::message_script("bench"),
    )
}
