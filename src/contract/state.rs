//! dMint contract state: decode from locking scripts, re-encode for the
//! next-state output, and derive the search `Work`.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::algo::{preimage, Algorithm, Target};
use crate::chain::tx::{OutPoint, TxOutput};
use crate::error::MinerError;

use super::script::{
    self, ScriptReader, DMINT_TAIL, MSG_MARKER, OP_PUSHINPUTREF, OP_PUSHINPUTREFSINGLETON,
    OP_RETURN,
};

pub const REF_LEN: usize = 36;

/// The location-independent state header pushed ahead of the dMint tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHeader {
    pub height: u64,
    pub contract_ref: [u8; REF_LEN],
    pub token_ref: [u8; REF_LEN],
    pub max_height: u64,
    pub reward: u64,
    pub target: Target,
    pub algorithm: Algorithm,
    /// v2 only: unix seconds of the previous mint.
    pub last_time: Option<u32>,
    /// v2 only: declared target seconds between mints.
    pub target_time: Option<u64>,
}

impl StateHeader {
    pub fn is_v2(&self) -> bool {
        self.last_time.is_some()
    }

    /// Decode a locking script. `NotAContract` when the dMint tail is
    /// absent; `StateInvalid` when the tail matches but the prologue does
    /// not decode.
    pub fn parse(script_bytes: &[u8]) -> Result<Self, MinerError> {
        if script_bytes.len() < DMINT_TAIL.len() || !script_bytes.ends_with(DMINT_TAIL) {
            return Err(MinerError::NotAContract);
        }
        let prologue = &script_bytes[..script_bytes.len() - DMINT_TAIL.len()];
        let mut reader = ScriptReader::new(prologue);

        let height_bytes = reader.read_push_exact(4)?;
        let height = u32::from_le_bytes([
            height_bytes[0],
            height_bytes[1],
            height_bytes[2],
            height_bytes[3],
        ]) as u64;

        reader.expect_opcode(OP_PUSHINPUTREFSINGLETON)?;
        let contract_ref: [u8; REF_LEN] = reader
            .read_push_exact(REF_LEN)?
            .try_into()
            .expect("length checked");

        reader.expect_opcode(OP_PUSHINPUTREF)?;
        let token_ref: [u8; REF_LEN] = reader
            .read_push_exact(REF_LEN)?
            .try_into()
            .expect("length checked");

        let max_height = script::decode_number(reader.read_push()?)?;
        let reward = script::decode_number(reader.read_push()?)?;
        let target_bytes = reader.read_push()?.to_vec();

        let (algorithm, last_time, target_time) = if reader.is_empty() {
            (Algorithm::Sha256d, None, None)
        } else {
            let algo_byte = reader.read_push_exact(1)?[0];
            let algorithm = Algorithm::from_id(algo_byte)?;
            let lt = reader.read_push_exact(4)?;
            let last_time = u32::from_le_bytes([lt[0], lt[1], lt[2], lt[3]]);
            let target_time = script::decode_number(reader.read_push()?)?;
            if !reader.is_empty() {
                return Err(MinerError::StateInvalid(
                    "trailing bytes after state prologue".into(),
                ));
            }
            (algorithm, Some(last_time), Some(target_time))
        };

        let target = Target::from_state_bytes(algorithm.target_format(), &target_bytes)?;

        let header = StateHeader {
            height,
            contract_ref,
            token_ref,
            max_height,
            reward,
            target,
            algorithm,
            last_time,
            target_time,
        };
        header.check_invariants()?;
        Ok(header)
    }

    fn check_invariants(&self) -> Result<(), MinerError> {
        if self.height > self.max_height {
            return Err(MinerError::StateInvalid(format!(
                "height {} above max height {}",
                self.height, self.max_height
            )));
        }
        if self.max_height == 0 {
            return Err(MinerError::StateInvalid("max height is zero".into()));
        }
        if self.reward == 0 {
            return Err(MinerError::StateInvalid("zero reward".into()));
        }
        if self.target.is_zero() {
            return Err(MinerError::StateInvalid("zero target".into()));
        }
        Ok(())
    }

    /// Check the header against the subscribed reference (little-endian
    /// form).
    pub fn validate_ref(&self, subscribed_ref_le: &[u8; REF_LEN]) -> Result<(), MinerError> {
        let mut ours = self.contract_ref;
        ours.reverse();
        if &ours != subscribed_ref_le {
            return Err(MinerError::StateInvalid(
                "state header carries a different contract reference".into(),
            ));
        }
        Ok(())
    }

    /// Re-encode the prologue plus tail. Inverse of `parse`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + DMINT_TAIL.len());
        script::push_data(&mut out, &(self.height as u32).to_le_bytes());
        out.push(OP_PUSHINPUTREFSINGLETON);
        script::push_data(&mut out, &self.contract_ref);
        out.push(OP_PUSHINPUTREF);
        script::push_data(&mut out, &self.token_ref);
        script::push_number(&mut out, self.max_height);
        script::push_number(&mut out, self.reward);
        script::push_data(&mut out, &target_push_bytes(&self.target));
        if let (Some(last_time), Some(target_time)) = (self.last_time, self.target_time) {
            script::push_data(&mut out, &[self.algorithm.id()]);
            script::push_data(&mut out, &last_time.to_le_bytes());
            script::push_number(&mut out, target_time);
        }
        out.extend_from_slice(DMINT_TAIL);
        out
    }

    /// The header after a successful mint: height advances, the DAA output
    /// replaces the target, v2 stamps the mint time.
    pub fn advanced(&self, next_target: Target, mint_time: u32) -> StateHeader {
        let mut next = self.clone();
        next.height += 1;
        next.target = next_target;
        if next.last_time.is_some() {
            next.last_time = Some(mint_time);
        }
        next
    }

    /// True when the NEXT mint is the terminal one and must burn instead of
    /// re-creating the state output.
    pub fn next_mint_is_terminal(&self) -> bool {
        self.height + 1 >= self.max_height
    }
}

/// Target comparand bytes as pushed on-chain: big-endian, leading zeros
/// stripped.
fn target_push_bytes(target: &Target) -> Vec<u8> {
    let be = target.to_be_bytes();
    let start = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
    be[start..].to_vec()
}

/// One classified transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOutput {
    State(StateHeader),
    Burn([u8; REF_LEN]),
    Message(String),
    Other,
}

/// Recognize the dMint state, burn and message templates.
pub fn classify_output(script_bytes: &[u8]) -> ParsedOutput {
    match StateHeader::parse(script_bytes) {
        Ok(header) => return ParsedOutput::State(header),
        Err(MinerError::NotAContract) => {}
        Err(_) => return ParsedOutput::Other,
    }
    if let Some(burn_ref) = parse_burn(script_bytes) {
        return ParsedOutput::Burn(burn_ref);
    }
    if let Some(text) = parse_message(script_bytes) {
        return ParsedOutput::Message(text);
    }
    ParsedOutput::Other
}

fn parse_burn(script_bytes: &[u8]) -> Option<[u8; REF_LEN]> {
    let mut reader = ScriptReader::new(script_bytes);
    reader.expect_opcode(OP_PUSHINPUTREFSINGLETON).ok()?;
    let burn_ref: [u8; REF_LEN] = reader.read_push_exact(REF_LEN).ok()?.try_into().ok()?;
    reader.expect_opcode(OP_RETURN).ok()?;
    reader.is_empty().then_some(burn_ref)
}

fn parse_message(script_bytes: &[u8]) -> Option<String> {
    let mut reader = ScriptReader::new(script_bytes);
    reader.expect_opcode(OP_RETURN).ok()?;
    if reader.read_push().ok()? != MSG_MARKER {
        return None;
    }
    let text = reader.read_push().ok()?;
    let end = text.len().min(script::MAX_MESSAGE_LEN);
    // Foreign annotations may truncate mid-character; decode leniently.
    Some(String::from_utf8_lossy(&text[..end]).into_owned())
}

/// The outcome of scanning one transaction's outputs for the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractUpdate {
    Active(ContractState),
    /// Burn sibling with no state output: the terminal mint happened.
    Burned { contract_ref: [u8; REF_LEN] },
}

/// Live contract state: header plus its current chain location and the
/// value locked there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractState {
    pub header: StateHeader,
    pub location: OutPoint,
    pub value: u64,
    pub message: Option<String>,
}

impl ContractState {
    /// Scan a transaction's outputs for the contract's new state.
    pub fn from_outputs(
        txid: [u8; 32],
        outputs: &[TxOutput],
        subscribed_ref_le: &[u8; REF_LEN],
    ) -> Result<ContractUpdate, MinerError> {
        let mut state: Option<(u32, u64, StateHeader)> = None;
        let mut burn: Option<[u8; REF_LEN]> = None;
        let mut message: Option<String> = None;

        for (vout, output) in outputs.iter().enumerate() {
            match classify_output(&output.script_pubkey) {
                ParsedOutput::State(header) => {
                    if header.validate_ref(subscribed_ref_le).is_ok() && state.is_none() {
                        state = Some((vout as u32, output.value, header));
                    }
                }
                ParsedOutput::Burn(burn_ref) => burn = Some(burn_ref),
                ParsedOutput::Message(text) => message = Some(text),
                ParsedOutput::Other => {}
            }
        }

        if let Some((vout, value, header)) = state {
            return Ok(ContractUpdate::Active(ContractState {
                header,
                location: OutPoint { txid, vout },
                value,
                message,
            }));
        }
        if let Some(contract_ref) = burn {
            return Ok(ContractUpdate::Burned { contract_ref });
        }
        Err(MinerError::NotAContract)
    }
}

/// Immutable search input derived from one contract location. Byte orders
/// are pre-flipped to the form the preimage requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub algorithm_id: u8,
    pub txid_le: [u8; 32],
    #[serde(with = "BigArray")]
    pub contract_ref_le: [u8; REF_LEN],
    pub input_script: Vec<u8>,
    pub output_script: Vec<u8>,
    pub target: WorkTarget,
    #[serde(with = "BigArray")]
    pub preimage: [u8; 64],
}

/// Serializable mirror of `Target` for work snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkTarget {
    Legacy(u64),
    Full([u8; 32]),
}

impl From<Target> for WorkTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Legacy(t) => WorkTarget::Legacy(t),
            Target::Full(t) => WorkTarget::Full(t),
        }
    }
}

impl From<WorkTarget> for Target {
    fn from(target: WorkTarget) -> Self {
        match target {
            WorkTarget::Legacy(t) => Target::Legacy(t),
            WorkTarget::Full(t) => Target::Full(t),
        }
    }
}

impl Work {
    pub fn derive(
        state: &ContractState,
        input_script: Vec<u8>,
        output_script: Vec<u8>,
    ) -> Work {
        let mut txid_le = state.location.txid;
        txid_le.reverse();
        let mut contract_ref_le = state.header.contract_ref;
        contract_ref_le.reverse();
        let preimage = preimage::build(&txid_le, &contract_ref_le, &input_script, &output_script);
        Work {
            algorithm_id: state.header.algorithm.id(),
            txid_le,
            contract_ref_le,
            input_script,
            output_script,
            target: state.header.target.into(),
            preimage,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        Algorithm::from_id(self.algorithm_id).expect("constructed from a parsed state")
    }

    pub fn target(&self) -> Target {
        self.target.into()
    }
}
