use crate::apply::TxError;
use crate::ChainParams;
use chrono::{DateTime, Duration, Utc};
use shadowy_core::token::{derive_token_id, MAX_TOKEN_NAME_LEN, MAX_TOKEN_TICKER_LEN};
use shadowy_core::{
    address::derive_pool_address, spot_quote, swap_output, Address, Hash32, LedgerState,
    PoolState, TokenId, TokenMetadata, TokenOp, TokenRef, TradeTerms,
};

/// SHADOW the op pulls out of the transaction's input surplus. Computed
/// against the pre-application state so conservation can be checked before
/// any mutation happens.
pub(crate) fn shadow_debit(
    state: &LedgerState,
    op: &TokenOp,
    params: &ChainParams,
) -> Result<u64, TxError> {
    match op {
        TokenOp::Create {
            total_supply,
            lock_amount,
            ..
        } => total_supply
            .checked_mul(*lock_amount)
            .ok_or(TxError::ValueOverflow),
        TokenOp::Transfer { .. } | TokenOp::Melt { .. } | TokenOp::SyndicateJoin { .. } => Ok(0),
        TokenOp::PoolCreate {
            token_a,
            token_b,
            initial_a,
            initial_b,
            ..
        } => {
            let mut debit = params.pool_creation_fee;
            if token_a.is_shadow() {
                debit = debit.checked_add(*initial_a).ok_or(TxError::ValueOverflow)?;
            }
            if token_b.is_shadow() {
                debit = debit.checked_add(*initial_b).ok_or(TxError::ValueOverflow)?;
            }
            Ok(debit)
        }
        TokenOp::PoolSwap {
            input, input_amount, ..
        } => Ok(if input.is_shadow() { *input_amount } else { 0 }),
        TokenOp::TradeOfferCreate {
            locked_token,
            locked_amount,
            ..
        } => {
            let mut debit = params.trade_nft_creation_fee;
            if locked_token.is_shadow() {
                debit = debit
                    .checked_add(*locked_amount)
                    .ok_or(TxError::ValueOverflow)?;
            }
            Ok(debit)
        }
        TokenOp::TradePurchase { trade_nft, .. } => {
            let metadata = state
                .tokens
                .get(trade_nft)
                .ok_or(TxError::UnknownToken(*trade_nft))?;
            let terms = metadata
                .trade
                .as_ref()
                .ok_or(TxError::NotATradeOffer(*trade_nft))?;
            Ok(if terms.asking_token.is_shadow() {
                terms.asking_price
            } else {
                0
            })
        }
    }
}

/// Applies one op to the working state. Returns the synthetic SHADOW
/// credits the op mints; the caller turns them into ledger outputs keyed
/// past the transaction's real outputs.
pub(crate) fn apply_token_op(
    state: &mut LedgerState,
    op: &TokenOp,
    spender: &Address,
    tx_hash: &Hash32,
    block_time: DateTime<Utc>,
    params: &ChainParams,
) -> Result<Vec<(Address, u64)>, TxError> {
    match op {
        TokenOp::Create {
            name,
            ticker,
            total_supply,
            decimals,
            lock_amount,
            creator,
        } => {
            require_actor(creator, spender)?;
            if name.is_empty() || name.len() > MAX_TOKEN_NAME_LEN {
                return Err(TxError::BadTokenName);
            }
            if ticker.is_empty() || ticker.len() > MAX_TOKEN_TICKER_LEN {
                return Err(TxError::BadTokenTicker);
            }
            if *total_supply == 0 {
                return Err(TxError::ZeroSupply);
            }
            let token_id = derive_token_id(
                name,
                ticker,
                *total_supply,
                *decimals,
                *lock_amount,
                creator,
                tx_hash,
            );
            if state.tokens.contains_key(&token_id) {
                return Err(TxError::DuplicateToken(token_id));
            }
            state.tokens.insert(
                token_id,
                TokenMetadata {
                    token_id,
                    name: name.clone(),
                    ticker: ticker.clone(),
                    decimals: *decimals,
                    total_supply: *total_supply,
                    lock_amount: *lock_amount,
                    creator: creator.clone(),
                    created_at: block_time,
                    trade: None,
                    syndicate: None,
                },
            );
            state
                .token_balances
                .insert((token_id, creator.clone()), *total_supply);
            Ok(Vec::new())
        }

        TokenOp::Transfer {
            token_id,
            amount,
            from,
            to,
        } => {
            require_actor(from, spender)?;
            if *amount == 0 {
                return Err(TxError::ZeroAmount);
            }
            if !state.tokens.contains_key(token_id) {
                return Err(TxError::UnknownToken(*token_id));
            }
            debit_token(state, token_id, from, *amount)?;
            credit_token(state, token_id, to, *amount)?;
            Ok(Vec::new())
        }

        TokenOp::Melt {
            token_id,
            amount,
            from,
        } => {
            require_actor(from, spender)?;
            if *amount == 0 {
                return Err(TxError::ZeroAmount);
            }
            let metadata = state
                .tokens
                .get(token_id)
                .cloned()
                .ok_or(TxError::UnknownToken(*token_id))?;
            debit_token(state, token_id, from, *amount)?;
            *state.melted.entry(*token_id).or_insert(0) += amount;

            if let Some(terms) = &metadata.trade {
                // melting a trade-offer NFT reclaims the escrowed asset
                let escrow = Address::from_identifier(token_id);
                match terms.locked_token {
                    TokenRef::Shadow => {
                        return Ok(vec![(from.clone(), terms.locked_amount)]);
                    }
                    TokenRef::Token(locked_id) => {
                        debit_token(state, &locked_id, &escrow, terms.locked_amount)?;
                        credit_token(state, &locked_id, from, terms.locked_amount)?;
                        return Ok(Vec::new());
                    }
                }
            }
            let refund = amount
                .checked_mul(metadata.lock_amount)
                .ok_or(TxError::ValueOverflow)?;
            if refund > 0 {
                Ok(vec![(from.clone(), refund)])
            } else {
                Ok(Vec::new())
            }
        }

        TokenOp::PoolCreate {
            token_a,
            token_b,
            initial_a,
            initial_b,
            fee_bps,
            creator,
            nonce,
        } => {
            require_actor(creator, spender)?;
            if token_a == token_b {
                return Err(TxError::IdenticalPoolTokens);
            }
            if *initial_a == 0 || *initial_b == 0 {
                return Err(TxError::ZeroAmount);
            }
            if *fee_bps >= 10_000 {
                return Err(TxError::BadFeeBps(*fee_bps));
            }
            let address = derive_pool_address(token_a, token_b, *fee_bps, creator, *nonce);
            if state.pools.contains_key(&address) {
                return Err(TxError::DuplicatePool(address));
            }
            move_into_pool(state, token_a, creator, &address, *initial_a)?;
            move_into_pool(state, token_b, creator, &address, *initial_b)?;

            let shares = isqrt(*initial_a as u128 * *initial_b as u128).max(1) as u64;
            let share_token = derive_token_id(
                "Pool Share",
                "PSHR",
                shares,
                0,
                0,
                &address,
                tx_hash,
            );
            state.tokens.insert(
                share_token,
                TokenMetadata {
                    token_id: share_token,
                    name: "Pool Share".into(),
                    ticker: "PSHR".into(),
                    decimals: 0,
                    total_supply: shares,
                    lock_amount: 0,
                    creator: address.clone(),
                    created_at: block_time,
                    trade: None,
                    syndicate: None,
                },
            );
            state
                .token_balances
                .insert((share_token, creator.clone()), shares);
            state.pools.insert(
                address.clone(),
                PoolState {
                    address,
                    token_a: *token_a,
                    token_b: *token_b,
                    reserve_a: *initial_a,
                    reserve_b: *initial_b,
                    fee_bps: *fee_bps,
                    share_token,
                    creator: creator.clone(),
                },
            );
            Ok(Vec::new())
        }

        TokenOp::PoolSwap {
            pool,
            input,
            output,
            input_amount,
            max_slippage_bps,
            min_received,
            expiration,
            all_or_nothing: _,
        } => {
            if *input_amount == 0 {
                return Err(TxError::ZeroAmount);
            }
            if block_time > *expiration {
                return Err(TxError::SwapExpired);
            }
            let pool_state = state
                .pools
                .get(pool)
                .cloned()
                .ok_or_else(|| TxError::UnknownPool(pool.clone()))?;
            if input == output {
                return Err(TxError::IdenticalPoolTokens);
            }
            let (reserve_in, reserve_out) = pool_state
                .oriented_reserves(input)
                .ok_or_else(|| TxError::TokenNotInPool(pool.clone()))?;
            if pool_state.oriented_reserves(output).is_none() {
                return Err(TxError::TokenNotInPool(pool.clone()));
            }

            let out = swap_output(reserve_in, reserve_out, *input_amount, pool_state.fee_bps)
                .map_err(|_| TxError::ValueOverflow)?;
            if out < *min_received {
                return Err(TxError::SwapBelowMinimum {
                    out,
                    min_received: *min_received,
                });
            }
            let quote = spot_quote(reserve_in, reserve_out, *input_amount);
            if quote > 0 {
                let slippage_bps = ((quote - out) as u128 * 10_000 / quote as u128) as u64;
                if slippage_bps > *max_slippage_bps as u64 {
                    return Err(TxError::SlippageExceeded {
                        slippage_bps,
                        max_bps: *max_slippage_bps,
                    });
                }
            }
            if out >= reserve_out {
                return Err(TxError::PoolDrained);
            }

            // move the input leg in
            if let TokenRef::Token(id) = input {
                debit_token(state, id, spender, *input_amount)?;
                credit_token(state, id, pool, *input_amount)?;
            }
            // move the output leg out
            let mut credits = Vec::new();
            match output {
                TokenRef::Shadow => credits.push((spender.clone(), out)),
                TokenRef::Token(id) => {
                    debit_token(state, id, pool, out)?;
                    credit_token(state, id, spender, out)?;
                }
            }

            let entry = state.pools.get_mut(pool).expect("pool checked above");
            if *input == entry.token_a {
                entry.reserve_a += input_amount;
                entry.reserve_b -= out;
            } else {
                entry.reserve_b += input_amount;
                entry.reserve_a -= out;
            }
            Ok(credits)
        }

        TokenOp::TradeOfferCreate {
            locked_token,
            locked_amount,
            asking_token,
            asking_price,
            expiration_hours,
            seller,
        } => {
            require_actor(seller, spender)?;
            if *locked_amount == 0 || *asking_price == 0 {
                return Err(TxError::ZeroAmount);
            }
            if *expiration_hours == 0 {
                return Err(TxError::BadExpiration);
            }
            let nft_id = derive_token_id(
                "Trade Offer",
                "TRADE",
                1,
                0,
                0,
                seller,
                tx_hash,
            );
            if state.tokens.contains_key(&nft_id) {
                return Err(TxError::DuplicateToken(nft_id));
            }
            // escrow the asset under an address derived from the NFT id
            if let TokenRef::Token(locked_id) = locked_token {
                let escrow = Address::from_identifier(&nft_id);
                debit_token(state, locked_id, seller, *locked_amount)?;
                credit_token(state, locked_id, &escrow, *locked_amount)?;
            }
            let terms = TradeTerms {
                seller: seller.clone(),
                locked_token: *locked_token,
                locked_amount: *locked_amount,
                asking_token: *asking_token,
                asking_price: *asking_price,
                created_at: block_time,
                expires_at: block_time + Duration::hours(*expiration_hours as i64),
            };
            state.tokens.insert(
                nft_id,
                TokenMetadata {
                    token_id: nft_id,
                    name: "Trade Offer".into(),
                    ticker: "TRADE".into(),
                    decimals: 0,
                    total_supply: 1,
                    lock_amount: 0,
                    creator: seller.clone(),
                    created_at: block_time,
                    trade: Some(terms),
                    syndicate: None,
                },
            );
            state
                .token_balances
                .insert((nft_id, seller.clone()), 1);
            Ok(Vec::new())
        }

        TokenOp::TradePurchase { trade_nft, buyer } => {
            require_actor(buyer, spender)?;
            let metadata = state
                .tokens
                .get(trade_nft)
                .cloned()
                .ok_or(TxError::UnknownToken(*trade_nft))?;
            let terms = metadata
                .trade
                .clone()
                .ok_or(TxError::NotATradeOffer(*trade_nft))?;
            if block_time > terms.expires_at {
                return Err(TxError::TradeExpired);
            }
            let holder = state
                .token_balances
                .iter()
                .find(|((id, _), amount)| id == trade_nft && **amount > 0)
                .map(|((_, address), _)| address.clone())
                .ok_or(TxError::NotATradeOffer(*trade_nft))?;
            if &holder == buyer {
                return Err(TxError::SelfPurchase);
            }

            let mut credits = Vec::new();
            // price to the current holder
            match terms.asking_token {
                TokenRef::Shadow => credits.push((holder.clone(), terms.asking_price)),
                TokenRef::Token(asking_id) => {
                    debit_token(state, &asking_id, buyer, terms.asking_price)?;
                    credit_token(state, &asking_id, &holder, terms.asking_price)?;
                }
            }
            // escrowed asset to the buyer
            match terms.locked_token {
                TokenRef::Shadow => credits.push((buyer.clone(), terms.locked_amount)),
                TokenRef::Token(locked_id) => {
                    let escrow = Address::from_identifier(trade_nft);
                    debit_token(state, &locked_id, &escrow, terms.locked_amount)?;
                    credit_token(state, &locked_id, buyer, terms.locked_amount)?;
                }
            }
            // the NFT burns on settlement
            debit_token(state, trade_nft, &holder, 1)?;
            *state.melted.entry(*trade_nft).or_insert(0) += 1;
            Ok(credits)
        }

        TokenOp::SyndicateJoin { syndicate, member } => {
            require_actor(member, spender)?;
            let members = state.syndicates.entry(*syndicate).or_default();
            if !members.contains(member) {
                members.push(member.clone());
            }
            Ok(Vec::new())
        }
    }
}

fn require_actor(claimed: &Address, spender: &Address) -> Result<(), TxError> {
    if claimed == spender {
        Ok(())
    } else {
        Err(TxError::ActorMismatch)
    }
}

fn debit_token(
    state: &mut LedgerState,
    token: &TokenId,
    address: &Address,
    amount: u64,
) -> Result<(), TxError> {
    let key = (*token, address.clone());
    let balance = state.token_balances.get(&key).copied().unwrap_or(0);
    if balance < amount {
        return Err(TxError::InsufficientTokenBalance {
            token: *token,
            have: balance,
            need: amount,
        });
    }
    state.token_balances.insert(key, balance - amount);
    Ok(())
}

fn credit_token(
    state: &mut LedgerState,
    token: &TokenId,
    address: &Address,
    amount: u64,
) -> Result<(), TxError> {
    let key = (*token, address.clone());
    let balance = state.token_balances.get(&key).copied().unwrap_or(0);
    let next = balance.checked_add(amount).ok_or(TxError::ValueOverflow)?;
    state.token_balances.insert(key, next);
    Ok(())
}

fn move_into_pool(
    state: &mut LedgerState,
    token: &TokenRef,
    from: &Address,
    pool: &Address,
    amount: u64,
) -> Result<(), TxError> {
    if let TokenRef::Token(id) = token {
        if !state.tokens.contains_key(id) {
            return Err(TxError::UnknownToken(*id));
        }
        debit_token(state, id, from, amount)?;
        credit_token(state, id, pool, amount)?;
    }
    // SHADOW legs are funded from the transaction's input surplus
    Ok(())
}

fn isqrt(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shadowy_core::{identifier_from_public_key, sha3_digest};

    fn addr(seed: &[u8]) -> Address {
        Address::from_identifier(&identifier_from_public_key(seed))
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn params() -> ChainParams {
        ChainParams::default()
    }

    /// Mints a fungible token straight into the state.
    fn seed_token(state: &mut LedgerState, owner: &Address, supply: u64) -> TokenId {
        let op = TokenOp::Create {
            name: "Seed".into(),
            ticker: "SEED".into(),
            total_supply: supply,
            decimals: 0,
            lock_amount: 0,
            creator: owner.clone(),
        };
        apply_token_op(state, &op, owner, &sha3_digest(b"seed tx"), now(), &params()).unwrap();
        *state.tokens.keys().next().unwrap()
    }

    fn offer_op(seller: &Address, token: TokenId) -> TokenOp {
        TokenOp::TradeOfferCreate {
            locked_token: TokenRef::Token(token),
            locked_amount: 40,
            asking_token: TokenRef::Shadow,
            asking_price: 9_000,
            expiration_hours: 24,
            seller: seller.clone(),
        }
    }

    fn nft_of(state: &LedgerState) -> TokenId {
        *state
            .tokens
            .values()
            .find(|t| t.trade.is_some())
            .map(|t| &t.token_id)
            .unwrap()
    }

    #[test]
    fn isqrt_exact_and_floor() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(4), 2);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(1_000_000), 1_000);
    }

    #[test]
    fn trade_offer_escrows_and_purchase_settles() {
        let seller = addr(b"seller");
        let buyer = addr(b"buyer");
        let mut state = LedgerState::default();
        let token = seed_token(&mut state, &seller, 100);

        apply_token_op(
            &mut state,
            &offer_op(&seller, token),
            &seller,
            &sha3_digest(b"offer tx"),
            now(),
            &params(),
        )
        .unwrap();
        let nft = nft_of(&state);
        // the asset left the seller and sits in escrow
        assert_eq!(state.token_balance(&token, &seller), 60);
        let escrow = Address::from_identifier(&nft);
        assert_eq!(state.token_balance(&token, &escrow), 40);
        assert_eq!(state.token_balance(&nft, &seller), 1);

        let purchase = TokenOp::TradePurchase {
            trade_nft: nft,
            buyer: buyer.clone(),
        };
        let credits = apply_token_op(
            &mut state,
            &purchase,
            &buyer,
            &sha3_digest(b"purchase tx"),
            now() + Duration::hours(1),
            &params(),
        )
        .unwrap();
        // SHADOW price surfaces as a synthetic credit to the holder
        assert_eq!(credits, vec![(seller.clone(), 9_000)]);
        assert_eq!(state.token_balance(&token, &buyer), 40);
        assert_eq!(state.token_balance(&token, &escrow), 0);
        // the NFT burned
        assert_eq!(state.token_balance(&nft, &seller), 0);
        assert_eq!(state.melted_units(&nft), 1);
    }

    #[test]
    fn expired_offer_cannot_be_purchased_but_melts_back() {
        let seller = addr(b"seller");
        let buyer = addr(b"buyer");
        let mut state = LedgerState::default();
        let token = seed_token(&mut state, &seller, 100);
        apply_token_op(
            &mut state,
            &offer_op(&seller, token),
            &seller,
            &sha3_digest(b"offer tx"),
            now(),
            &params(),
        )
        .unwrap();
        let nft = nft_of(&state);

        let after_expiry = now() + Duration::hours(25);
        let purchase = TokenOp::TradePurchase {
            trade_nft: nft,
            buyer: buyer.clone(),
        };
        assert_eq!(
            apply_token_op(
                &mut state,
                &purchase,
                &buyer,
                &sha3_digest(b"late tx"),
                after_expiry,
                &params()
            ),
            Err(TxError::TradeExpired)
        );

        // the seller melts the NFT and reclaims the escrowed asset
        let melt = TokenOp::Melt {
            token_id: nft,
            amount: 1,
            from: seller.clone(),
        };
        let credits = apply_token_op(
            &mut state,
            &melt,
            &seller,
            &sha3_digest(b"melt tx"),
            after_expiry,
            &params(),
        )
        .unwrap();
        assert!(credits.is_empty());
        assert_eq!(state.token_balance(&token, &seller), 100);
    }

    #[test]
    fn purchase_rejects_wrong_actor_and_self_purchase() {
        let seller = addr(b"seller");
        let mut state = LedgerState::default();
        let token = seed_token(&mut state, &seller, 100);
        apply_token_op(
            &mut state,
            &offer_op(&seller, token),
            &seller,
            &sha3_digest(b"offer tx"),
            now(),
            &params(),
        )
        .unwrap();
        let nft = nft_of(&state);

        let purchase = TokenOp::TradePurchase {
            trade_nft: nft,
            buyer: addr(b"someone"),
        };
        assert_eq!(
            apply_token_op(
                &mut state,
                &purchase,
                &addr(b"not the buyer"),
                &sha3_digest(b"tx"),
                now(),
                &params()
            ),
            Err(TxError::ActorMismatch)
        );
        let self_purchase = TokenOp::TradePurchase {
            trade_nft: nft,
            buyer: seller.clone(),
        };
        assert_eq!(
            apply_token_op(
                &mut state,
                &self_purchase,
                &seller,
                &sha3_digest(b"tx2"),
                now(),
                &params()
            ),
            Err(TxError::SelfPurchase)
        );
    }

    fn seeded_pool(state: &mut LedgerState, creator: &Address) -> (TokenId, Address) {
        let token = seed_token(state, creator, 1_000_000);
        let create = TokenOp::PoolCreate {
            token_a: TokenRef::Shadow,
            token_b: TokenRef::Token(token),
            initial_a: 1_000,
            initial_b: 1_000,
            fee_bps: 30,
            creator: creator.clone(),
            nonce: 0,
        };
        apply_token_op(state, &create, creator, &sha3_digest(b"pool tx"), now(), &params())
            .unwrap();
        let pool = state.pools.keys().next().unwrap().clone();
        (token, pool)
    }

    #[test]
    fn swap_updates_reserves_and_keeps_k() {
        let trader = addr(b"trader");
        let mut state = LedgerState::default();
        let (token, pool) = seeded_pool(&mut state, &trader);
        let k_before = state.pools[&pool].k();

        let swap = TokenOp::PoolSwap {
            pool: pool.clone(),
            input: TokenRef::Shadow,
            output: TokenRef::Token(token),
            input_amount: 100,
            max_slippage_bps: 2_000,
            min_received: 85,
            expiration: now() + Duration::hours(1),
            all_or_nothing: false,
        };
        apply_token_op(&mut state, &swap, &trader, &sha3_digest(b"swap tx"), now(), &params())
            .unwrap();
        let after = &state.pools[&pool];
        assert_eq!(after.reserve_a, 1_100);
        assert_eq!(after.reserve_b, 1_000 - 90);
        assert!(after.k() >= k_before);
        assert_eq!(state.token_balance(&token, &trader), 1_000_000 - 1_000 + 90);
    }

    #[test]
    fn swap_guards_fire() {
        let trader = addr(b"trader");
        let mut state = LedgerState::default();
        let (token, pool) = seeded_pool(&mut state, &trader);

        let base = TokenOp::PoolSwap {
            pool: pool.clone(),
            input: TokenRef::Shadow,
            output: TokenRef::Token(token),
            input_amount: 100,
            max_slippage_bps: 2_000,
            min_received: 85,
            expiration: now() + Duration::hours(1),
            all_or_nothing: false,
        };

        let mut demanding = base.clone();
        if let TokenOp::PoolSwap { min_received, .. } = &mut demanding {
            *min_received = 95;
        }
        assert!(matches!(
            apply_token_op(&mut state, &demanding, &trader, &sha3_digest(b"a"), now(), &params()),
            Err(TxError::SwapBelowMinimum { out: 90, .. })
        ));

        let mut tight = base.clone();
        if let TokenOp::PoolSwap {
            max_slippage_bps, ..
        } = &mut tight
        {
            // spot quote is 100, delivered 90: 1000 bps of slippage
            *max_slippage_bps = 500;
        }
        assert!(matches!(
            apply_token_op(&mut state, &tight, &trader, &sha3_digest(b"b"), now(), &params()),
            Err(TxError::SlippageExceeded { .. })
        ));

        let mut late = base.clone();
        if let TokenOp::PoolSwap { expiration, .. } = &mut late {
            *expiration = now() - Duration::hours(1);
        }
        assert_eq!(
            apply_token_op(&mut state, &late, &trader, &sha3_digest(b"c"), now(), &params()),
            Err(TxError::SwapExpired)
        );

        let mut foreign = base;
        if let TokenOp::PoolSwap { output, .. } = &mut foreign {
            *output = TokenRef::Token(sha3_digest(b"not pooled"));
        }
        assert!(matches!(
            apply_token_op(&mut state, &foreign, &trader, &sha3_digest(b"d"), now(), &params()),
            Err(TxError::TokenNotInPool(_))
        ));
    }

    #[test]
    fn pool_create_mints_shares_and_rejects_duplicates() {
        let creator = addr(b"creator");
        let mut state = LedgerState::default();
        let (_, pool) = seeded_pool(&mut state, &creator);
        let share_token = state.pools[&pool].share_token;
        // sqrt(1000 * 1000)
        assert_eq!(state.token_balance(&share_token, &creator), 1_000);

        let token = *state
            .tokens
            .keys()
            .find(|id| **id != share_token)
            .unwrap();
        let duplicate = TokenOp::PoolCreate {
            token_a: TokenRef::Shadow,
            token_b: TokenRef::Token(token),
            initial_a: 500,
            initial_b: 500,
            fee_bps: 30,
            creator: creator.clone(),
            nonce: 0,
        };
        assert!(matches!(
            apply_token_op(
                &mut state,
                &duplicate,
                &creator,
                &sha3_digest(b"dup"),
                now(),
                &params()
            ),
            Err(TxError::DuplicatePool(_))
        ));
    }

    #[test]
    fn syndicate_join_is_idempotent() {
        let member = addr(b"member");
        let mut state = LedgerState::default();
        let op = TokenOp::SyndicateJoin {
            syndicate: sha3_digest(b"syn"),
            member: member.clone(),
        };
        apply_token_op(&mut state, &op, &member, &sha3_digest(b"j1"), now(), &params()).unwrap();
        apply_token_op(&mut state, &op, &member, &sha3_digest(b"j2"), now(), &params()).unwrap();
        assert_eq!(state.syndicates[&sha3_digest(b"syn")], vec![member]);
    }
}
