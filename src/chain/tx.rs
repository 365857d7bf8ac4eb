//! Transaction wire types and sighash computation.
//!
//! Consensus serialization is the bitcoin-family layout: little-endian
//! integers, varint-prefixed vectors, outpoint txids reversed on the wire.
//! Txids are held in display order (the byte order RPC hex uses) and
//! flipped at the serialization boundary.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SIGHASH_ALL: u32 = 0x01;
/// Fork-id flag; always set so signatures never replay onto ancestor
/// chains.
pub const SIGHASH_FORKID: u32 = 0x40;

pub const TX_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Display-order txid.
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub fn to_hex(&self) -> String {
        format!("{}:{}", hex::encode(self.txid), self.vout)
    }

    fn write_wire(&self, buf: &mut Vec<u8>) {
        let mut txid = self.txid;
        txid.reverse();
        buf.extend_from_slice(&txid);
        buf.extend_from_slice(&self.vout.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(prev: OutPoint, script_sig: Vec<u8>) -> Self {
        TxInput { prev, script_sig, sequence: 0xffff_ffff }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOutput { value, script_pubkey }
    }

    fn write_wire(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_varint(buf, self.script_pubkey.len() as u64);
        buf.extend_from_slice(&self.script_pubkey);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction { version: TX_VERSION, inputs, outputs, lock_time: 0 }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_estimate());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prev.write_wire(&mut buf);
            write_varint(&mut buf, input.script_sig.len() as u64);
            buf.extend_from_slice(&input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_wire(&mut buf);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Display-order txid: SHA-256d of the serialization, reversed.
    pub fn txid(&self) -> [u8; 32] {
        let mut txid = sha256d(&self.serialize());
        txid.reverse();
        txid
    }

    /// Serialized size upper bound used for fee estimation before the
    /// script-sigs are final.
    pub fn size_estimate(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| 36 + 4 + varint_len(i.script_sig.len() as u64) + i.script_sig.len())
            .sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| 8 + varint_len(o.script_pubkey.len() as u64) + o.script_pubkey.len())
            .sum();
        4 + varint_len(self.inputs.len() as u64)
            + inputs
            + varint_len(self.outputs.len() as u64)
            + outputs
            + 4
    }

    /// BIP143-style digest for signing `input_index`, committing to the
    /// spent output's script and value.
    pub fn sighash(
        &self,
        input_index: usize,
        script_code: &[u8],
        value: u64,
        sighash_type: u32,
    ) -> [u8; 32] {
        let mut prevouts = Vec::with_capacity(self.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(self.inputs.len() * 4);
        for input in &self.inputs {
            input.prev.write_wire(&mut prevouts);
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in &self.outputs {
            output.write_wire(&mut outputs);
        }

        let input = &self.inputs[input_index];
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&sha256d(&prevouts));
        preimage.extend_from_slice(&sha256d(&sequences));
        input.prev.write_wire(&mut preimage);
        write_varint(&mut preimage, script_code.len() as u64);
        preimage.extend_from_slice(script_code);
        preimage.extend_from_slice(&value.to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&sha256d(&outputs));
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&sighash_type.to_le_bytes());
        sha256d(&preimage)
    }
}

pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn varint_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(first));
    out
}
