use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::FutureExt;
use k256::ecdsa::SigningKey;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde::Serialize;
use sqlx::{Pool, Postgres, Row};

use crate::auth::{address_of_key, keccak256};
use crate::bank::{Bank, SqlBank, WithdrawHook};
use crate::config::{AppConfig, CurrencyDef};
use crate::error::{BankError, WithdrawError};

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const WITHDRAWAL_REQUEST_TYPE: &str = "WithdrawalRequest(address user,uint32 coinId,uint256 amount,uint256 nonce,Task[] tasks)Task(uint8 taskType,address user,uint32 coinId,uint256 amount,uint256 nonce)";

const DOMAIN_NAME: &str = "Crash";
const DOMAIN_VERSION: &str = "1.0";

/// The voucher as serialized into the withdrawals table and handed back to
/// the client. Amounts here stay human-denominated; only the signed message
/// carries the `10^decimals`-scaled integer.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct WithdrawalRequest {
    pub(crate) user: String,
    #[serde(rename = "coinId")]
    pub(crate) coin_id: String,
    pub(crate) amount: String,
    pub(crate) nonce: String,
    pub(crate) tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Task {
    #[serde(rename = "taskType")]
    pub(crate) task_type: u8,
    pub(crate) user: String,
    #[serde(rename = "coinId")]
    pub(crate) coin_id: String,
    pub(crate) amount: String,
    pub(crate) nonce: String,
}

pub(crate) struct SignedWithdrawal {
    pub(crate) request: WithdrawalRequest,
    pub(crate) signature: String,
    pub(crate) nonce: i64,
    pub(crate) balance: Decimal,
}

fn parse_address(addr: &str) -> Result<[u8; 20]> {
    let raw = hex::decode(addr.strip_prefix("0x").unwrap_or(addr))
        .with_context(|| format!("address {addr} is not hex"))?;
    if raw.len() != 20 {
        bail!("address {addr} must be 20 bytes");
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&raw);
    Ok(out)
}

fn address_word(addr: &[u8; 20]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(addr);
    out
}

fn u256_from_u64(v: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&v.to_be_bytes());
    out
}

/// Big-endian 256-bit word from a non-negative integral decimal.
fn u256_from_decimal(value: Decimal) -> Result<[u8; 32]> {
    if value.is_sign_negative() {
        bail!("amount must not be negative");
    }
    let value = value.normalize();
    if value.scale() != 0 {
        bail!("amount scaling left a fractional remainder");
    }
    let v = value.to_i128().context("amount exceeds 128 bits")?;
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&v.to_be_bytes());
    Ok(out)
}

fn domain_separator(chain_id: u64, contract: &[u8; 20]) -> [u8; 32] {
    let mut data = Vec::with_capacity(5 * 32);
    data.extend_from_slice(&keccak256(DOMAIN_TYPE.as_bytes()));
    data.extend_from_slice(&keccak256(DOMAIN_NAME.as_bytes()));
    data.extend_from_slice(&keccak256(DOMAIN_VERSION.as_bytes()));
    data.extend_from_slice(&u256_from_u64(chain_id));
    data.extend_from_slice(&address_word(contract));
    keccak256(&data)
}

fn struct_hash(user: &[u8; 20], coin_id: u32, amount_units: &[u8; 32], nonce: u64) -> [u8; 32] {
    let mut data = Vec::with_capacity(6 * 32);
    data.extend_from_slice(&keccak256(WITHDRAWAL_REQUEST_TYPE.as_bytes()));
    data.extend_from_slice(&address_word(user));
    data.extend_from_slice(&u256_from_u64(u64::from(coin_id)));
    data.extend_from_slice(amount_units);
    data.extend_from_slice(&u256_from_u64(nonce));
    // Hash of the empty tasks array.
    data.extend_from_slice(&keccak256(b""));
    keccak256(&data)
}

pub(crate) fn signing_digest(
    chain_id: u64,
    contract: &[u8; 20],
    user: &[u8; 20],
    coin_id: u32,
    amount_units: &[u8; 32],
    nonce: u64,
) -> [u8; 32] {
    let mut data = Vec::with_capacity(2 + 64);
    data.extend_from_slice(b"\x19\x01");
    data.extend_from_slice(&domain_separator(chain_id, contract));
    data.extend_from_slice(&struct_hash(user, coin_id, amount_units, nonce));
    keccak256(&data)
}

/// Builds and signs the typed-data voucher. The recovery byte is normalized
/// the way on-chain verifiers expect (0/1 becomes 27/28).
pub(crate) fn create_withdrawal_request(
    key: &SigningKey,
    wallet: &str,
    amount: Decimal,
    currency: &CurrencyDef,
    chain_id: u64,
    contract: &str,
    nonce: i64,
) -> Result<(WithdrawalRequest, String)> {
    let user = parse_address(wallet)?;
    let contract = parse_address(contract)?;

    let scale = Decimal::from(10i64).powi(i64::from(currency.decimals));
    let amount_units = u256_from_decimal(amount * scale)?;

    let digest = signing_digest(chain_id, &contract, &user, currency.coin_id, &amount_units, nonce as u64);

    let (sig, recid) = key.sign_prehash_recoverable(&digest).context("signing failed")?;
    let mut raw = sig.to_bytes().to_vec();
    let mut v = recid.to_byte();
    if v == 0 || v == 1 {
        v += 27;
    }
    raw.push(v);

    let request = WithdrawalRequest {
        user: wallet.to_string(),
        coin_id: currency.coin_id.to_string(),
        amount: amount.to_string(),
        nonce: nonce.to_string(),
        tasks: Vec::new(),
    };

    Ok((request, format!("0x{}", hex::encode(raw))))
}

pub(crate) async fn next_nonce(db: &Pool<Postgres>, wallet: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(nonce) + 1, 0) AS nonce
        FROM withdrawals
        WHERE wallet = $1
        "#,
    )
    .bind(wallet)
    .fetch_one(db)
    .await?;

    Ok(row.get("nonce"))
}

pub(crate) struct WithdrawalSigner {
    key: SigningKey,
    bank: Arc<SqlBank>,
    db: Pool<Postgres>,
    cfg: Arc<AppConfig>,
}

impl WithdrawalSigner {
    /// Reads `AGENT_PRIVATE_KEY` (hex, optional `0x` prefix). Meant to run at
    /// boot so a bad key fails the process before it serves traffic.
    pub(crate) fn from_env(bank: Arc<SqlBank>, db: Pool<Postgres>, cfg: Arc<AppConfig>) -> Result<Self> {
        let key_hex = std::env::var("AGENT_PRIVATE_KEY").context("AGENT_PRIVATE_KEY not defined")?;
        Self::new(&key_hex, bank, db, cfg)
    }

    pub(crate) fn new(
        key_hex: &str,
        bank: Arc<SqlBank>,
        db: Pool<Postgres>,
        cfg: Arc<AppConfig>,
    ) -> Result<Self> {
        let raw = hex::decode(key_hex.strip_prefix("0x").unwrap_or(key_hex))
            .context("AGENT_PRIVATE_KEY is not hex")?;
        let key = SigningKey::from_slice(&raw).context("invalid agent signing key")?;
        Ok(Self { key, bank, db, cfg })
    }

    pub(crate) fn address(&self) -> String {
        address_of_key(self.key.verifying_key())
    }

    /// Debits the ledger and produces the signed voucher in one transaction.
    /// Concurrent withdrawals for one wallet are arbitrated by the
    /// UNIQUE(wallet, nonce) index: the loser's insert fails the hook and the
    /// debit rolls back.
    pub(crate) async fn withdraw(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<SignedWithdrawal, WithdrawError> {
        let def = self
            .cfg
            .currencies
            .get(currency)
            .ok_or_else(|| WithdrawError::Signing(anyhow!("unknown currency {currency}")))?
            .clone();

        let balance = match self.bank.balance(wallet, currency).await {
            Ok(balance) => balance,
            Err(BankError::AccountMissing) => return Err(WithdrawError::InsufficientFunds),
            Err(e) => return Err(e.into()),
        };
        if balance < amount {
            return Err(WithdrawError::InsufficientFunds);
        }

        let nonce = next_nonce(&self.db, wallet)
            .await
            .map_err(|e| WithdrawError::Bank(BankError::Db(e)))?;

        let (request, signature) = create_withdrawal_request(
            &self.key,
            wallet,
            amount,
            &def,
            self.cfg.on_chain.chain_id,
            &self.cfg.on_chain.contract,
            nonce,
        )
        .map_err(WithdrawError::Signing)?;

        let serialized =
            serde_json::to_string(&request).map_err(|e| WithdrawError::Signing(e.into()))?;

        let row_wallet = wallet.to_string();
        let row_currency = currency.to_string();
        let row_signature = signature.clone();
        let hook: WithdrawHook = Box::new(move |tx| {
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO withdrawals
                    (wallet, nonce, amount, currency, signature, request)
                    VALUES
                    ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(row_wallet)
                .bind(nonce)
                .bind(amount)
                .bind(row_currency)
                .bind(row_signature)
                .bind(serialized)
                .execute(&mut **tx)
                .await?;
                Ok(())
            }
            .boxed()
        });

        let balance = self.bank.withdraw(wallet, currency, amount, hook).await?;

        Ok(SignedWithdrawal { request, signature, nonce, balance })
    }
}
