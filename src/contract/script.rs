//! Script primitives for the dMint template family.
//!
//! Only the opcodes the templates use are named here; the dMint bytecode
//! tail itself is matched as an opaque suffix token.

use crate::error::MinerError;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_STATESEPARATOR: u8 = 0xbd;
pub const OP_PUSHINPUTREF: u8 = 0xd0;
pub const OP_PUSHINPUTREFSINGLETON: u8 = 0xd8;

/// Marker pushed ahead of the annotation text in a message output.
pub const MSG_MARKER: &[u8] = b"msg";

/// Message annotations are truncated to this many UTF-8 bytes.
pub const MAX_MESSAGE_LEN: usize = 80;

/// The fixed dMint bytecode, state separator first. Reproduced from
/// deployed contracts; matched as a suffix, never interpreted.
pub const DMINT_TAIL: &[u8] = &[
    OP_STATESEPARATOR, 0x75, 0x51, 0xc0, 0xc8, 0x7c, 0xa8, 0x7b, 0x87, 0x69, 0x7c, 0xa9, 0x7b,
    0x88, 0x76, 0x01, 0x20, 0x7f, 0x77, 0x7c, 0xaa, 0x7b, 0x87, 0x69, 0x7c, 0x01, 0x0c, 0x7f,
    0x75, 0x52, 0x79, 0xa2, 0x69, 0x7c, 0xd1, 0x51, 0x79, 0xd0, 0x7b, 0x88, 0x7e, 0xaa, 0x88,
    0x51,
];

/// Append a minimally-encoded data push.
pub fn push_data(buf: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => buf.push(OP_0),
        len if len < OP_PUSHDATA1 as usize => {
            buf.push(len as u8);
            buf.extend_from_slice(data);
        }
        len if len <= 0xff => {
            buf.push(OP_PUSHDATA1);
            buf.push(len as u8);
            buf.extend_from_slice(data);
        }
        len if len <= 0xffff => {
            buf.push(OP_PUSHDATA2);
            buf.extend_from_slice(&(len as u16).to_le_bytes());
            buf.extend_from_slice(data);
        }
        len => {
            buf.push(OP_PUSHDATA4);
            buf.extend_from_slice(&(len as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
    }
}

/// Minimal script-number bytes: little-endian, trailing zeros stripped,
/// high bit kept clear (values here are never negative).
pub fn number_bytes(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut bytes: Vec<u8> = value.to_le_bytes().into();
    while bytes.len() > 1 && *bytes.last().unwrap() == 0 {
        bytes.pop();
    }
    if bytes.last().unwrap() & 0x80 != 0 {
        bytes.push(0);
    }
    bytes
}

/// Decode a minimal script number into a non-negative integer.
pub fn decode_number(bytes: &[u8]) -> Result<u64, MinerError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 9 {
        return Err(MinerError::StateInvalid("numeric push too long".into()));
    }
    let last = *bytes.last().unwrap();
    if last & 0x80 != 0 {
        return Err(MinerError::StateInvalid("negative numeric push".into()));
    }
    if last == 0 && (bytes.len() < 2 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return Err(MinerError::StateInvalid("non-minimal numeric push".into()));
    }
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 8 {
            if *byte != 0 {
                return Err(MinerError::StateInvalid("numeric push overflow".into()));
            }
            continue;
        }
        value |= (*byte as u64) << (8 * i);
    }
    Ok(value)
}

pub fn push_number(buf: &mut Vec<u8>, value: u64) {
    let bytes = number_bytes(value);
    push_data(buf, &bytes);
}

/// Standard P2PKH locking script for a 20-byte pubkey hash.
pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    push_data(&mut script, pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `OP_RETURN "msg" <utf8>` annotation output, text truncated to 80 bytes
/// on a char boundary.
pub fn message_script(text: &str) -> Vec<u8> {
    let mut end = text.len().min(MAX_MESSAGE_LEN);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut script = Vec::new();
    script.push(OP_RETURN);
    push_data(&mut script, MSG_MARKER);
    push_data(&mut script, text[..end].as_bytes());
    script
}

/// `OP_PUSHINPUTREFSINGLETON <ref> OP_RETURN` burn output.
pub fn burn_script(contract_ref: &[u8; 36]) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_PUSHINPUTREFSINGLETON);
    push_data(&mut script, contract_ref);
    script.push(OP_RETURN);
    script
}

/// Reward output: P2PKH to the miner with the token reference appended.
pub fn reward_script(pubkey_hash: &[u8; 20], token_ref: &[u8; 36]) -> Vec<u8> {
    let mut script = p2pkh(pubkey_hash);
    script.push(OP_PUSHINPUTREF);
    push_data(&mut script, token_ref);
    script
}

/// Sequential reader over script bytes.
pub struct ScriptReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ScriptReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ScriptReader { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn read_opcode(&mut self) -> Result<u8, MinerError> {
        let op = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| MinerError::StateInvalid("script truncated".into()))?;
        self.pos += 1;
        Ok(op)
    }

    pub fn expect_opcode(&mut self, expected: u8) -> Result<(), MinerError> {
        let op = self.read_opcode()?;
        if op != expected {
            return Err(MinerError::StateInvalid(format!(
                "expected opcode 0x{:02x}, found 0x{:02x}",
                expected, op
            )));
        }
        Ok(())
    }

    /// Read one data push (direct length byte or PUSHDATA1/2/4).
    pub fn read_push(&mut self) -> Result<&'a [u8], MinerError> {
        let op = self.read_opcode()?;
        let len = match op {
            OP_0 => 0,
            n if n < OP_PUSHDATA1 => n as usize,
            OP_PUSHDATA1 => self.read_opcode()? as usize,
            OP_PUSHDATA2 => {
                let lo = self.read_opcode()?;
                let hi = self.read_opcode()?;
                u16::from_le_bytes([lo, hi]) as usize
            }
            OP_PUSHDATA4 => {
                let mut len_bytes = [0u8; 4];
                for byte in len_bytes.iter_mut() {
                    *byte = self.read_opcode()?;
                }
                u32::from_le_bytes(len_bytes) as usize
            }
            other => {
                return Err(MinerError::StateInvalid(format!(
                    "expected push, found opcode 0x{:02x}",
                    other
                )))
            }
        };
        if self.pos + len > self.bytes.len() {
            return Err(MinerError::StateInvalid("push runs past script end".into()));
        }
        let data = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(data)
    }

    pub fn read_push_exact(&mut self, len: usize) -> Result<&'a [u8], MinerError> {
        let data = self.read_push()?;
        if data.len() != len {
            return Err(MinerError::StateInvalid(format!(
                "expected {}-byte push, found {} bytes",
                len,
                data.len()
            )));
        }
        Ok(data)
    }
}
