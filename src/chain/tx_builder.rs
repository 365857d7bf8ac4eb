//! Claim transaction assembly.
//!
//! Input 0 spends the contract UTXO with the proof-of-work script-sig;
//! every wallet coin rides along as a signed P2PKH input. Outputs are, in
//! order: the re-created state (or a burn on the terminal mint), the token
//! reward, the annotation, and change.

use crate::algo::Target;
use crate::chain::tx::{Transaction, TxInput, TxOutput, SIGHASH_ALL, SIGHASH_FORKID};
use crate::chain::wallet::{WalletProvider, WalletSnapshot};
use crate::contract::script::{self, OP_0};
use crate::contract::state::{ContractState, Work};
use crate::error::MinerError;

/// Fee rate in photons per 1000 serialized bytes.
pub const FEE_PER_KB: u64 = 5_000_000;

/// Change below this is folded into the fee.
pub const DUST_LIMIT: u64 = 546;

/// Upper bound on a P2PKH script-sig: pushed DER signature with sighash
/// byte plus pushed compressed key.
const P2PKH_SCRIPT_SIG_MAX: usize = 1 + 73 + 1 + 33;

pub struct ClaimParams<'a> {
    pub state: &'a ContractState,
    pub work: &'a Work,
    pub nonce: u64,
    /// Value carried by the contract UTXO being spent.
    pub contract_value: u64,
    /// DAA output for the re-created state.
    pub next_target: Target,
    /// Unix seconds stamped into v2 state headers.
    pub mint_time: u32,
    pub snapshot: &'a WalletSnapshot,
}

pub struct ClaimBuilder<'a, W: WalletProvider> {
    wallet: &'a W,
    fee_per_kb: u64,
}

impl<'a, W: WalletProvider> ClaimBuilder<'a, W> {
    pub fn new(wallet: &'a W) -> Self {
        ClaimBuilder { wallet, fee_per_kb: FEE_PER_KB }
    }

    pub fn with_fee_per_kb(mut self, fee_per_kb: u64) -> Self {
        self.fee_per_kb = fee_per_kb;
        self
    }

    pub fn build(&self, params: &ClaimParams<'_>) -> Result<Transaction, MinerError> {
        let header = &params.state.header;

        let mut inputs = vec![TxInput::new(
            params.state.location,
            contract_script_sig(params.nonce, params.work),
        )];
        for coin in &params.snapshot.unspent {
            inputs.push(TxInput::new(coin.outpoint, Vec::new()));
        }

        // Output 0: next state, or a burn once the final height is minted.
        let state_output = if header.next_mint_is_terminal() {
            TxOutput::new(0, script::burn_script(&header.contract_ref))
        } else {
            let next = header.advanced(params.next_target, params.mint_time);
            TxOutput::new(params.contract_value, next.encode())
        };
        let reward_output = TxOutput::new(
            header.reward,
            script::reward_script(&self.wallet.pubkey_hash(), &header.token_ref),
        );
        let message_output = TxOutput::new(0, params.work.output_script.clone());

        let funds = params.contract_value + params.snapshot.total();
        let committed = state_output.value + reward_output.value;

        let mut tx = Transaction::new(
            inputs,
            vec![
                state_output,
                reward_output,
                message_output,
                TxOutput::new(0, self.wallet.change_script()),
            ],
        );

        // Fee over the worst-case signed size; real signatures may come in
        // a byte or two shorter, which only overpays.
        let max_size = tx.size_estimate()
            + (tx.inputs.len() - 1) * P2PKH_SCRIPT_SIG_MAX
            + varint_slack(tx.inputs.len() - 1);
        let fee = fee_for_size(max_size, self.fee_per_kb);

        let needed = committed + fee;
        if funds < needed {
            return Err(MinerError::BalanceTooLow { have: funds, need: needed });
        }
        let change = funds - needed;
        if change < DUST_LIMIT {
            tx.outputs.pop();
        } else {
            tx.outputs[3].value = change;
        }

        self.sign_wallet_inputs(&mut tx, params.snapshot)?;
        Ok(tx)
    }

    fn sign_wallet_inputs(
        &self,
        tx: &mut Transaction,
        snapshot: &WalletSnapshot,
    ) -> Result<(), MinerError> {
        let script_code = self.wallet.change_script();
        let sighash_type = SIGHASH_ALL | SIGHASH_FORKID;
        for (slot, coin) in snapshot.unspent.iter().enumerate() {
            let index = slot + 1;
            let digest = tx.sighash(index, &script_code, coin.value, sighash_type);
            let mut signature = self.wallet.sign_digest(&digest);
            signature.push(sighash_type as u8);

            let mut script_sig = Vec::with_capacity(P2PKH_SCRIPT_SIG_MAX);
            script::push_data(&mut script_sig, &signature);
            script::push_data(&mut script_sig, &self.wallet.public_key());
            tx.inputs[index].script_sig = script_sig;
        }
        Ok(())
    }
}

/// `<nonce> <sha256d(input_script)> <sha256d(output_script)> 0`
fn contract_script_sig(nonce: u64, work: &Work) -> Vec<u8> {
    let mut script_sig = Vec::with_capacity(9 + 33 + 33 + 1);
    script::push_data(&mut script_sig, &nonce.to_le_bytes());
    script::push_data(&mut script_sig, &crate::algo::preimage::sha256d(&work.input_script));
    script::push_data(&mut script_sig, &crate::algo::preimage::sha256d(&work.output_script));
    script_sig.push(OP_0);
    script_sig
}

pub fn fee_for_size(size: usize, fee_per_kb: u64) -> u64 {
    (size as u64 * fee_per_kb).div_ceil(1000)
}

/// Script-sig growth can push a varint over a length boundary.
fn varint_slack(signed_inputs: usize) -> usize {
    signed_inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{Algorithm, TargetFormat};
    use crate::chain::tx::OutPoint;
    use crate::chain::wallet::{MiningKey, SingleKeyWallet, Unspent};
    use crate::contract::script::ScriptReader;
    use crate::contract::state::{ContractUpdate, StateHeader};
    use crate::contract::REF_LEN;

    fn fixture(height: u64, balance: u64) -> (SingleKeyWallet, ContractState, Work, WalletSnapshot) {
        let wallet = SingleKeyWallet::new(MiningKey::random());
        let header = StateHeader {
            height,
            contract_ref: [0xab; REF_LEN],
            token_ref: [0xcd; REF_LEN],
            max_height: 1_000,
            reward: 5_000_000,
            target: Target::from_difficulty(TargetFormat::Full256, 1),
            algorithm: Algorithm::Blake3,
            last_time: Some(1_700_000_000),
            target_time: Some(300),
        };
        let state = ContractState {
            header,
            location: OutPoint { txid: [0x77; 32], vout: 0 },
            value: 1_000,
            message: None,
        };
        let work = Work::derive(
            &state,
            script::p2pkh(&wallet.pubkey_hash()),
            script::message_script("dmint"),
        );
        let snapshot = WalletSnapshot {
            unspent: vec![Unspent {
                outpoint: OutPoint { txid: [0x88; 32], vout: 3 },
                value: balance,
            }],
        };
        (wallet, state, work, snapshot)
    }

    fn params<'a>(
        state: &'a ContractState,
        work: &'a Work,
        snapshot: &'a WalletSnapshot,
    ) -> ClaimParams<'a> {
        ClaimParams {
            state,
            work,
            nonce: 0x1122_3344_5566_7788,
            contract_value: 1_000,
            next_target: state.header.target,
            mint_time: 1_700_000_300,
            snapshot,
        }
    }

    #[test]
    fn test_claim_has_four_outputs() {
        let (wallet, state, work, snapshot) = fixture(10, 50_000_000);
        let tx = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap();

        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 4);

        // Output 0 re-creates the state at height + 1.
        let next = StateHeader::parse(&tx.outputs[0].script_pubkey).unwrap();
        assert_eq!(next.height, 11);
        assert_eq!(tx.outputs[0].value, 1_000);

        // Output 1 pays the reward bound to the token ref.
        assert_eq!(tx.outputs[1].value, state.header.reward);
        assert!(tx.outputs[1]
            .script_pubkey
            .windows(REF_LEN)
            .any(|w| w == state.header.token_ref));

        // Output 2 is the annotation, output 3 the change.
        assert_eq!(tx.outputs[2].script_pubkey, work.output_script);
        assert_eq!(tx.outputs[3].script_pubkey, wallet.change_script());
    }

    #[test]
    fn test_contract_script_sig_layout() {
        let (wallet, state, work, snapshot) = fixture(10, 50_000_000);
        let tx = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap();

        let mut reader = ScriptReader::new(&tx.inputs[0].script_sig);
        let nonce = reader.read_push().unwrap();
        assert_eq!(nonce, 0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(
            reader.read_push().unwrap(),
            crate::algo::preimage::sha256d(&work.input_script)
        );
        assert_eq!(
            reader.read_push().unwrap(),
            crate::algo::preimage::sha256d(&work.output_script)
        );
        assert_eq!(reader.read_opcode().unwrap(), OP_0);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_terminal_mint_burns() {
        let (wallet, mut state, _, snapshot) = fixture(10, 50_000_000);
        state.header.height = state.header.max_height - 1;
        let work = Work::derive(
            &state,
            script::p2pkh(&wallet.pubkey_hash()),
            script::message_script("last one"),
        );
        let tx = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap();
        assert_eq!(
            crate::contract::classify_output(&tx.outputs[0].script_pubkey),
            crate::contract::ParsedOutput::Burn(state.header.contract_ref)
        );
        assert_eq!(tx.outputs[0].value, 0);
    }

    #[test]
    fn test_fee_rate_respected() {
        let (wallet, state, work, snapshot) = fixture(10, 50_000_000);
        let tx = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap();

        let funds = 1_000 + snapshot.total();
        let spent: u64 = tx.outputs.iter().map(|o| o.value).sum();
        let fee = funds - spent;
        let size = tx.serialize().len();
        // At least the declared rate over the final size, and not wildly
        // above the worst-case estimate.
        assert!(fee >= fee_for_size(size, FEE_PER_KB), "fee {} size {}", fee, size);
        assert!(fee <= fee_for_size(size + 8, FEE_PER_KB));
    }

    #[test]
    fn test_insufficient_funds() {
        let (wallet, state, work, snapshot) = fixture(10, 1_000);
        let err = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap_err();
        assert!(matches!(err, MinerError::BalanceTooLow { .. }));
    }

    #[test]
    fn test_next_state_round_trips_through_parser() {
        let (wallet, state, work, snapshot) = fixture(10, 50_000_000);
        let tx = ClaimBuilder::new(&wallet)
            .build(&params(&state, &work, &snapshot))
            .unwrap();
        let mut subscribed = state.header.contract_ref;
        subscribed.reverse();
        match ContractState::from_outputs(tx.txid(), &tx.outputs, &subscribed).unwrap() {
            ContractUpdate::Active(next) => {
                assert_eq!(next.header.height, 11);
                assert_eq!(next.location.vout, 0);
                assert_eq!(next.header.last_time, Some(1_700_000_300));
            }
            other => panic!("expected active state, got {:?}", other),
        }
    }
}
