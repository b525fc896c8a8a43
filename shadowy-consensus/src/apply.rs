use crate::ops::{apply_token_op, shadow_debit};
use crate::ChainParams;
use chrono::{DateTime, Utc};
use shadowy_core::{Address, LedgerState, SignedTransaction, TokenId, TxInput, TxOutput};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction has no outputs and no token operations")]
    NoEffect,
    #[error("transaction body does not hash to its claimed id")]
    HashMismatch,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("non-coinbase transaction carries no inputs")]
    MissingInputs,
    #[error("input {0:?} spent twice in one transaction")]
    DuplicateInput(TxInput),
    #[error("input {0:?} does not reference an unspent output")]
    InputNotFound(TxInput),
    #[error("input {0:?} is not owned by the signer")]
    InputNotOwned(TxInput),
    #[error("value overflow")]
    ValueOverflow,
    #[error("inputs {inputs} below outputs plus obligations {required}")]
    ConservationViolated { inputs: u64, required: u64 },
    #[error("transaction is not yet valid")]
    NotYetValid,
    #[error("transaction already applied")]
    Replayed,
    #[error("coinbase malformed: {0}")]
    BadCoinbase(String),
    #[error("token {0} does not exist")]
    UnknownToken(TokenId),
    #[error("token {0} is not a trade offer")]
    NotATradeOffer(TokenId),
    #[error("operation actor is not the transaction signer")]
    ActorMismatch,
    #[error("zero amount")]
    ZeroAmount,
    #[error("token supply must be nonzero")]
    ZeroSupply,
    #[error("token name empty or too long")]
    BadTokenName,
    #[error("token ticker empty or too long")]
    BadTokenTicker,
    #[error("token {0} already exists")]
    DuplicateToken(TokenId),
    #[error("pool {0} already exists")]
    DuplicatePool(Address),
    #[error("pool legs must differ")]
    IdenticalPoolTokens,
    #[error("fee bps {0} out of range")]
    BadFeeBps(u16),
    #[error("pool {0} does not exist")]
    UnknownPool(Address),
    #[error("token is not part of pool {0}")]
    TokenNotInPool(Address),
    #[error("swap expired")]
    SwapExpired,
    #[error("swap output {out} below minimum {min_received}")]
    SwapBelowMinimum { out: u64, min_received: u64 },
    #[error("slippage {slippage_bps} bps exceeds cap {max_bps} bps")]
    SlippageExceeded { slippage_bps: u64, max_bps: u16 },
    #[error("swap would drain the pool")]
    PoolDrained,
    #[error("trade offer expired")]
    TradeExpired,
    #[error("cannot purchase own trade offer")]
    SelfPurchase,
    #[error("bad trade expiration")]
    BadExpiration,
    #[error("insufficient balance of token {token}: have {have}, need {need}")]
    InsufficientTokenBalance { token: TokenId, have: u64, need: u64 },
}

/// Validates and applies one non-coinbase transaction in a fixed order:
/// structure, signature, temporal, conservation, token ops, replay.
/// Mutates `state` only on a fully successful path; callers work on a
/// clone and discard it when a block fails.
///
/// Returns the implicit fee (inputs minus outputs minus obligations).
pub fn apply_transaction(
    state: &mut LedgerState,
    signed: &SignedTransaction,
    block_time: DateTime<Utc>,
    params: &ChainParams,
) -> Result<u64, TxError> {
    let tx = &signed.transaction;

    // 1. structure
    if !tx.has_effect() {
        return Err(TxError::NoEffect);
    }
    if tx.inputs.is_empty() {
        return Err(TxError::MissingInputs);
    }

    // 2. signature over the canonical body, and the claimed hash
    shadowy_crypto::verify_signed_transaction(signed).map_err(|e| match e {
        shadowy_crypto::CryptoError::HashMismatch => TxError::HashMismatch,
        _ => TxError::SignatureInvalid,
    })?;
    let spender = shadowy_crypto::address_from_public_key(&signed.public_key);

    // 3. temporal
    if let Some(not_until) = tx.not_until {
        if block_time < not_until {
            return Err(TxError::NotYetValid);
        }
    }

    // 4. conservation against the pre-state
    let mut seen: HashSet<TxInput> = HashSet::new();
    let mut input_total: u64 = 0;
    for input in &tx.inputs {
        if !seen.insert(*input) {
            return Err(TxError::DuplicateInput(*input));
        }
        let output = state
            .utxos
            .get(&(input.prev_tx, input.output_index))
            .ok_or(TxError::InputNotFound(*input))?;
        if output.address != spender {
            return Err(TxError::InputNotOwned(*input));
        }
        input_total = input_total
            .checked_add(output.value)
            .ok_or(TxError::ValueOverflow)?;
    }
    let output_total = tx.total_output_value().ok_or(TxError::ValueOverflow)?;
    let mut required = output_total;
    for op in &tx.token_ops {
        required = required
            .checked_add(shadow_debit(state, op, params)?)
            .ok_or(TxError::ValueOverflow)?;
    }
    if input_total < required {
        return Err(TxError::ConservationViolated {
            inputs: input_total,
            required,
        });
    }
    let fee = input_total - required;

    // 5. token operations in declaration order
    let mut credits: Vec<(Address, u64)> = Vec::new();
    for op in &tx.token_ops {
        credits.extend(apply_token_op(
            state,
            op,
            &spender,
            &signed.tx_hash,
            block_time,
            params,
        )?);
    }

    // 6. replay protection
    if state.contains_tx(&signed.tx_hash) {
        return Err(TxError::Replayed);
    }

    // commit the coin ledger: consume inputs, mint declared outputs, then
    // the synthetic credit outputs past the declared ones
    for input in &tx.inputs {
        state.utxos.remove(&(input.prev_tx, input.output_index));
    }
    for (index, output) in tx.outputs.iter().enumerate() {
        state
            .utxos
            .insert((signed.tx_hash, index as u32), output.clone());
    }
    let mut next_index = tx.outputs.len() as u32;
    for (address, value) in credits {
        state
            .utxos
            .insert((signed.tx_hash, next_index), TxOutput { address, value });
        next_index += 1;
    }
    state.applied_txs.insert(signed.tx_hash);
    Ok(fee)
}

/// Validates and applies the position-0 reward transaction. Input-free and
/// token-op-free by definition; its outputs must total `expected_value`.
pub fn apply_coinbase(
    state: &mut LedgerState,
    signed: &SignedTransaction,
    expected_value: u64,
) -> Result<(), TxError> {
    let tx = &signed.transaction;
    if !tx.is_coinbase() {
        return Err(TxError::BadCoinbase("inputs or token ops present".into()));
    }
    shadowy_crypto::verify_signed_transaction(signed).map_err(|e| match e {
        shadowy_crypto::CryptoError::HashMismatch => TxError::HashMismatch,
        _ => TxError::SignatureInvalid,
    })?;
    let total = tx.total_output_value().ok_or(TxError::ValueOverflow)?;
    if total != expected_value {
        return Err(TxError::BadCoinbase(format!(
            "pays {total}, expected {expected_value}"
        )));
    }
    if state.contains_tx(&signed.tx_hash) {
        return Err(TxError::Replayed);
    }
    for (index, output) in tx.outputs.iter().enumerate() {
        state
            .utxos
            .insert((signed.tx_hash, index as u32), output.clone());
    }
    state.applied_txs.insert(signed.tx_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shadowy_core::{TokenOp, TokenRef, Transaction};
    use shadowy_crypto::Keypair;

    fn params() -> ChainParams {
        ChainParams::default()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Funds `keypair` with a single spendable output of `value`.
    fn fund(state: &mut LedgerState, keypair: &Keypair, value: u64) -> TxInput {
        let seed = state.utxos.len() as u64;
        let fake_tx = shadowy_core::sha3_digest(&seed.to_le_bytes());
        state.utxos.insert(
            (fake_tx, 0),
            TxOutput {
                address: keypair.address(),
                value,
            },
        );
        TxInput {
            prev_tx: fake_tx,
            output_index: 0,
        }
    }

    fn signed_with(
        keypair: &Keypair,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        token_ops: Vec<TokenOp>,
    ) -> SignedTransaction {
        let tx = Transaction {
            version: Transaction::CURRENT_VERSION,
            inputs,
            outputs,
            token_ops,
            timestamp: now(),
            not_until: None,
            nonce: rand_nonce(),
        };
        shadowy_crypto::sign_transaction(tx, keypair).unwrap()
    }

    fn rand_nonce() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn plain_transfer_pays_fee() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut state = LedgerState::default();
        let input = fund(&mut state, &kp, 10_000);
        let signed = signed_with(
            &kp,
            vec![input],
            vec![TxOutput {
                address: other.address(),
                value: 9_000,
            }],
            vec![],
        );
        let fee = apply_transaction(&mut state, &signed, now(), &params()).unwrap();
        assert_eq!(fee, 1_000);
        assert_eq!(state.balance(&other.address()), 9_000);
        assert_eq!(state.balance(&kp.address()), 0);
        // replay is rejected
        assert_eq!(
            apply_transaction(&mut state, &signed, now(), &params()),
            Err(TxError::InputNotFound(input))
        );
    }

    #[test]
    fn conservation_rejects_overdraw() {
        let kp = Keypair::generate();
        let mut state = LedgerState::default();
        let input = fund(&mut state, &kp, 100);
        let signed = signed_with(
            &kp,
            vec![input],
            vec![TxOutput {
                address: kp.address(),
                value: 101,
            }],
            vec![],
        );
        assert!(matches!(
            apply_transaction(&mut state, &signed, now(), &params()),
            Err(TxError::ConservationViolated { .. })
        ));
    }

    #[test]
    fn foreign_input_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut state = LedgerState::default();
        let foreign = fund(&mut state, &other, 500);
        let signed = signed_with(
            &kp,
            vec![foreign],
            vec![TxOutput {
                address: kp.address(),
                value: 100,
            }],
            vec![],
        );
        assert!(matches!(
            apply_transaction(&mut state, &signed, now(), &params()),
            Err(TxError::InputNotOwned(_))
        ));
    }

    #[test]
    fn not_until_gates_inclusion() {
        let kp = Keypair::generate();
        let mut state = LedgerState::default();
        let input = fund(&mut state, &kp, 1_000);
        let mut tx = Transaction {
            version: Transaction::CURRENT_VERSION,
            inputs: vec![input],
            outputs: vec![TxOutput {
                address: kp.address(),
                value: 900,
            }],
            token_ops: vec![],
            timestamp: now(),
            not_until: Some(now() + chrono::Duration::hours(1)),
            nonce: 1,
        };
        let signed = shadowy_crypto::sign_transaction(tx.clone(), &kp).unwrap();
        assert_eq!(
            apply_transaction(&mut state, &signed, now(), &params()),
            Err(TxError::NotYetValid)
        );
        tx.not_until = Some(now());
        let signed = shadowy_crypto::sign_transaction(tx, &kp).unwrap();
        apply_transaction(&mut state, &signed, now(), &params()).unwrap();
    }

    #[test]
    fn token_create_locks_shadow() {
        let kp = Keypair::generate();
        let mut state = LedgerState::default();
        let input = fund(&mut state, &kp, 1_000_000);
        let signed = signed_with(
            &kp,
            vec![input],
            vec![],
            vec![TokenOp::Create {
                name: "Example".into(),
                ticker: "EXM".into(),
                total_supply: 1_000,
                decimals: 2,
                lock_amount: 500,
                creator: kp.address(),
            }],
        );
        let fee = apply_transaction(&mut state, &signed, now(), &params()).unwrap();
        // 1_000 units x 500 sat lock = 500_000 locked
        assert_eq!(fee, 500_000);
        let token_id = *state.tokens.keys().next().unwrap();
        assert_eq!(state.token_balance(&token_id, &kp.address()), 1_000);
        assert_eq!(state.token_circulating(&token_id), 1_000);
    }

    #[test]
    fn melt_refunds_lock_as_synthetic_output() {
        let kp = Keypair::generate();
        let mut state = LedgerState::default();
        let input = fund(&mut state, &kp, 1_000_000);
        let create = signed_with(
            &kp,
            vec![input],
            vec![],
            vec![TokenOp::Create {
                name: "Example".into(),
                ticker: "EXM".into(),
                total_supply: 1_000,
                decimals: 2,
                lock_amount: 500,
                creator: kp.address(),
            }],
        );
        apply_transaction(&mut state, &create, now(), &params()).unwrap();
        let token_id = *state.tokens.keys().next().unwrap();

        let spend = fund(&mut state, &kp, 10);
        let melt = signed_with(
            &kp,
            vec![spend],
            vec![],
            vec![TokenOp::Melt {
                token_id,
                amount: 400,
                from: kp.address(),
            }],
        );
        let before = state.balance(&kp.address());
        apply_transaction(&mut state, &melt, now(), &params()).unwrap();
        // input (10) consumed, 400 x 500 = 200_000 refunded synthetically
        assert_eq!(state.balance(&kp.address()), before - 10 + 200_000);
        assert_eq!(state.token_balance(&token_id, &kp.address()), 600);
        assert_eq!(state.melted_units(&token_id), 400);
        // supply invariant: circulating + melted == total supply
        assert_eq!(
            state.token_circulating(&token_id) + state.melted_units(&token_id),
            1_000
        );
    }

    #[test]
    fn coinbase_value_must_match() {
        let kp = Keypair::generate();
        let mut state = LedgerState::default();
        let coinbase = Transaction::coinbase(3, 5_000, kp.address(), now());
        let signed = shadowy_crypto::sign_transaction(coinbase, &kp).unwrap();
        assert!(matches!(
            apply_coinbase(&mut state, &signed, 5_001),
            Err(TxError::BadCoinbase(_))
        ));
        apply_coinbase(&mut state, &signed, 5_000).unwrap();
        assert_eq!(state.balance(&kp.address()), 5_000);
    }
}
