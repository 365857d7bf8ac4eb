//! Wallet capability surface consumed by the claim coordinator, plus the
//! single-key signer the shell wires in.

use async_trait::async_trait;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::chain::tx::OutPoint;
use crate::error::MinerError;

/// Base58check version byte for P2PKH addresses.
const ADDRESS_VERSION: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unspent {
    pub outpoint: OutPoint,
    pub value: u64,
}

/// Point-in-time view of the wallet's spendable coins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub unspent: Vec<Unspent>,
}

impl WalletSnapshot {
    pub fn total(&self) -> u64 {
        self.unspent.iter().map(|u| u.value).sum()
    }
}

/// What the coordinator needs from a wallet. Key material and coin
/// selection policy stay behind this trait.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn address(&self) -> String;
    fn public_key(&self) -> [u8; 33];
    fn pubkey_hash(&self) -> [u8; 20];
    /// Locking script change is paid to.
    fn change_script(&self) -> Vec<u8>;
    /// ECDSA over a sighash digest, DER-encoded without the sighash byte.
    fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8>;
    async fn unspent(&self) -> Result<WalletSnapshot, MinerError>;
}

/// secp256k1 keypair for mining rewards and claim signing.
pub struct MiningKey {
    secp: Secp256k1<All>,
    secret: SecretKey,
    public: PublicKey,
}

impl MiningKey {
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, MinerError> {
        let bytes = Zeroizing::new(bytes.to_vec());
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| MinerError::WalletError(format!("bad secret key: {}", e)))?;
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(MiningKey { secp, secret, public })
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, MinerError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_str.trim())
                .map_err(|e| MinerError::WalletError(format!("bad secret hex: {}", e)))?,
        );
        Self::from_secret_bytes(&bytes)
    }

    pub fn random() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        MiningKey { secp, secret, public }
    }

    pub fn public_key(&self) -> [u8; 33] {
        self.public.serialize()
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public.serialize())
    }

    pub fn address(&self) -> String {
        encode_address(&self.pubkey_hash())
    }

    pub fn sign_digest(&self, digest: &[u8; 32]) -> Signature {
        let message = Message::from_digest(*digest);
        self.secp.sign_ecdsa(&message, &self.secret)
    }
}

impl std::fmt::Debug for MiningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiningKey").field("address", &self.address()).finish()
    }
}

/// Wallet backed by one key and an externally refreshed coin list.
pub struct SingleKeyWallet {
    key: MiningKey,
    snapshot: std::sync::Mutex<WalletSnapshot>,
}

impl SingleKeyWallet {
    pub fn new(key: MiningKey) -> Self {
        SingleKeyWallet { key, snapshot: std::sync::Mutex::new(WalletSnapshot::default()) }
    }

    pub fn set_unspent(&self, snapshot: WalletSnapshot) {
        *self.snapshot.lock().expect("wallet snapshot lock") = snapshot;
    }

    pub fn key(&self) -> &MiningKey {
        &self.key
    }
}

#[async_trait]
impl WalletProvider for SingleKeyWallet {
    fn address(&self) -> String {
        self.key.address()
    }

    fn public_key(&self) -> [u8; 33] {
        self.key.public_key()
    }

    fn pubkey_hash(&self) -> [u8; 20] {
        self.key.pubkey_hash()
    }

    fn change_script(&self) -> Vec<u8> {
        crate::contract::script::p2pkh(&self.key.pubkey_hash())
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        self.key.sign_digest(digest).serialize_der().to_vec()
    }

    async fn unspent(&self) -> Result<WalletSnapshot, MinerError> {
        Ok(self.snapshot.lock().expect("wallet snapshot lock").clone())
    }
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

/// Electrum-style script hash for subscriptions: SHA-256 of the locking
/// script, byte-reversed.
pub fn script_hash(script: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(script));
    out.reverse();
    out
}

pub fn encode_address(pubkey_hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    let check = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&check[..4]);
    bs58::encode(payload).into_string()
}

pub fn decode_address(address: &str) -> Result<[u8; 20], MinerError> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|e| MinerError::WalletError(format!("bad address: {}", e)))?;
    if payload.len() != 25 {
        return Err(MinerError::WalletError("bad address length".into()));
    }
    if payload[0] != ADDRESS_VERSION {
        return Err(MinerError::WalletError(format!(
            "unexpected address version 0x{:02x}",
            payload[0]
        )));
    }
    let check = Sha256::digest(Sha256::digest(&payload[..21]));
    if payload[21..] != check[..4] {
        return Err(MinerError::WalletError("address checksum mismatch".into()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&payload[1..21]);
    Ok(out)
}
