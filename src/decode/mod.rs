//! Transaction decoder: turn a watched account's transaction into the
//! token whose balance changed, plus that token's current raw balance.

pub mod classifier;

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::ledger::{LedgerSource, TokenBalance, TransactionRecord};

pub use classifier::{classify, is_swap, SwapSignature};

/// Wrapped SOL; stands in for the native currency on either side of a swap.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("meta missing")]
    MetaMissing,
    #[error("pre/post token or native balances missing")]
    BalancesMissing,
    #[error("unparseable token amount `{0}`")]
    InvalidAmount(String),
    #[error("missing input mint or output mint")]
    MintsUnresolved,
    #[error("transaction not found")]
    TransactionNotFound,
    #[error("rpc error: {0}")]
    Rpc(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Native currency spent, token received.
    Buy,
    Sell,
}

/// Which mints a transaction moved for the watched account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapDelta {
    /// Spent side.
    pub input_mint: String,
    /// Received side.
    pub output_mint: String,
    pub side: Side,
}

impl SwapDelta {
    /// The non-native mint of the swap. For token-to-token swaps this is the
    /// received token.
    pub fn other_mint(&self) -> &str {
        if self.output_mint != NATIVE_MINT {
            &self.output_mint
        } else {
            &self.input_mint
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeResult {
    pub other_mint: String,
    /// Live raw balance of `other_mint`, read after decoding.
    pub token_balance: u64,
    pub side: Side,
}

/// Sum raw amounts per mint for entries owned by `owner`, remembering the
/// order in which mints were first seen.
fn sum_by_mint(
    balances: &[TokenBalance],
    owner: &str,
    order: &mut Vec<String>,
) -> Result<HashMap<String, i128>, DecodeError> {
    let mut sums: HashMap<String, i128> = HashMap::new();
    for entry in balances.iter().filter(|b| b.owner.as_deref() == Some(owner)) {
        let amount: u64 = entry
            .raw_amount
            .parse()
            .map_err(|_| DecodeError::InvalidAmount(entry.raw_amount.clone()))?;
        if !order.contains(&entry.mint) {
            order.push(entry.mint.clone());
        }
        *sums.entry(entry.mint.clone()).or_insert(0) += i128::from(amount);
    }
    Ok(sums)
}

/// Pure decode of the spent and received mints.
pub fn decode_swap(record: &TransactionRecord, owner: &str) -> Result<SwapDelta, DecodeError> {
    let meta = record.meta.as_ref().ok_or(DecodeError::MetaMissing)?;

    let (Some(pre_tokens), Some(post_tokens)) =
        (meta.pre_token_balances.as_ref(), meta.post_token_balances.as_ref())
    else {
        return Err(DecodeError::BalancesMissing);
    };
    let (Some(pre_native), Some(post_native)) = (
        meta.pre_balances.as_ref().and_then(|b| b.first()),
        meta.post_balances.as_ref().and_then(|b| b.first()),
    ) else {
        return Err(DecodeError::BalancesMissing);
    };
    if pre_tokens.is_empty() || post_tokens.is_empty() {
        return Err(DecodeError::BalancesMissing);
    }

    /* -------- token pass ------------------------------------------ */
    let mut order = Vec::new();
    let pre = sum_by_mint(pre_tokens, owner, &mut order)?;
    let post = sum_by_mint(post_tokens, owner, &mut order)?;

    let mut input_mint: Option<&str> = None;
    let mut output_mint: Option<&str> = None;
    for mint in &order {
        let before = pre.get(mint).copied().unwrap_or(0);
        let after = post.get(mint).copied().unwrap_or(0);
        let diff = after - before;
        if diff < 0 {
            input_mint = Some(mint.as_str());
        } else if diff > 0 {
            output_mint = Some(mint.as_str());
        }
    }

    /* -------- native pass ----------------------------------------- */
    let (pre_native, post_native, fee) = (*pre_native, *post_native, meta.fee);
    let mut native_in = 0u64;
    let mut native_out = 0u64;
    if post_native < pre_native {
        let spent = pre_native - post_native;
        if spent > fee {
            native_in = spent - fee;
        }
    } else if post_native > pre_native {
        native_out = post_native - pre_native + fee;
    }
    if input_mint.is_none() && native_in > 0 {
        input_mint = Some(NATIVE_MINT);
    }
    if output_mint.is_none() && native_out > 0 {
        output_mint = Some(NATIVE_MINT);
    }

    let (Some(input_mint), Some(output_mint)) = (input_mint, output_mint) else {
        return Err(DecodeError::MintsUnresolved);
    };
    if input_mint == output_mint {
        return Err(DecodeError::MintsUnresolved);
    }

    let side = if input_mint == NATIVE_MINT {
        Side::Buy
    } else {
        Side::Sell
    };
    Ok(SwapDelta {
        input_mint: input_mint.to_string(),
        output_mint: output_mint.to_string(),
        side,
    })
}

/// Fetch, decode, then re-read the live balance of the non-native mint.
///
/// The live read is what makes dropped or reordered events harmless: the
/// stored balance is always current truth, never an accumulated delta.
pub async fn decode_transaction(
    ledger: &dyn LedgerSource,
    signature: &str,
    owner: &str,
) -> Result<DecodeResult, DecodeError> {
    let record = ledger
        .get_transaction(signature)
        .await
        .map_err(|e| DecodeError::Rpc(format!("{e:#}")))?
        .ok_or(DecodeError::TransactionNotFound)?;

    let delta = decode_swap(&record, owner)?;
    let other_mint = delta.other_mint().to_string();
    let token_balance = ledger
        .token_balance(owner, &other_mint)
        .await
        .map_err(|e| DecodeError::Rpc(format!("{e:#}")))?;

    debug!(
        "[DECODE] {} {:?}: {} -> {}, live balance {}",
        signature, delta.side, delta.input_mint, delta.output_mint, token_balance
    );
    Ok(DecodeResult {
        other_mint,
        token_balance,
        side: delta.side,
    })
}
