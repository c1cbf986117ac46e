use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::BankError;

/// Runs inside the open withdrawal transaction so the caller's record lands
/// atomically with the `withdrawn` debit. A hook error rolls everything back.
pub(crate) type WithdrawHook = Box<
    dyn for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, anyhow::Result<()>>
        + Send,
>;

/// The capability set the round engine is allowed to touch. `withdraw` is
/// deliberately absent; only the withdrawal signer uses it, on `SqlBank`
/// directly.
#[async_trait]
pub(crate) trait Bank: Send + Sync {
    async fn credit(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
        reason: &str,
        game_id: Uuid,
    ) -> Result<Decimal, BankError>;

    async fn debit(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
        reason: &str,
        game_id: Uuid,
    ) -> Result<Decimal, BankError>;

    async fn balance(&self, wallet: &str, currency: &str) -> Result<Decimal, BankError>;

    async fn balances(&self, wallet: &str) -> Result<HashMap<String, Decimal>, BankError>;
}

pub(crate) struct SqlBank {
    db: Pool<Postgres>,
}

pub(crate) fn ensure_positive(amount: Decimal) -> Result<(), BankError> {
    if amount <= Decimal::ZERO {
        return Err(BankError::InvalidAmount);
    }
    Ok(())
}

impl SqlBank {
    pub(crate) fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Debits the `withdrawn` aggregate under the same solvency guard as a
    /// bet debit, appends the journal row, then hands the open transaction
    /// to `hook` before committing.
    pub(crate) async fn withdraw(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
        hook: WithdrawHook,
    ) -> Result<Decimal, BankError> {
        ensure_positive(amount)?;

        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE balances
            SET withdrawn = withdrawn + $1
            WHERE wallet = $2
            AND currency = $3
            AND balance + gained - spent - withdrawn - $1 >= 0
            RETURNING balance + gained - spent - withdrawn AS balance
            "#,
        )
        .bind(amount)
        .bind(wallet)
        .bind(currency)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(BankError::InsufficientFunds);
        };
        let new_balance: Decimal = row.get("balance");

        sqlx::query(
            r#"
            INSERT INTO ledger (wallet, currency, change, reason, game_id)
            VALUES ($1, $2, $3, $4, NULL)
            "#,
        )
        .bind(wallet)
        .bind(currency)
        .bind(-amount)
        .bind("Withdrawal")
        .execute(&mut *tx)
        .await?;

        if let Err(e) = hook(&mut tx).await {
            tx.rollback().await.ok();
            return Err(BankError::WithdrawFailed(e));
        }

        tx.commit().await?;

        Ok(new_balance)
    }
}

#[async_trait]
impl Bank for SqlBank {
    async fn credit(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
        reason: &str,
        game_id: Uuid,
    ) -> Result<Decimal, BankError> {
        ensure_positive(amount)?;

        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE balances
            SET gained = gained + $1
            WHERE wallet = $2
            AND currency = $3
            RETURNING balance + gained - spent - withdrawn AS balance
            "#,
        )
        .bind(amount)
        .bind(wallet)
        .bind(currency)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(BankError::AccountMissing);
        };
        let new_balance: Decimal = row.get("balance");

        sqlx::query(
            r#"
            INSERT INTO ledger (wallet, currency, change, reason, game_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(wallet)
        .bind(currency)
        .bind(amount)
        .bind(reason)
        .bind(game_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(new_balance)
    }

    async fn debit(
        &self,
        wallet: &str,
        currency: &str,
        amount: Decimal,
        reason: &str,
        game_id: Uuid,
    ) -> Result<Decimal, BankError> {
        ensure_positive(amount)?;

        let mut tx = self.db.begin().await?;

        // The solvency guard rides in the same statement as the update so two
        // concurrent debits cannot both observe sufficient funds.
        let row = sqlx::query(
            r#"
            UPDATE balances
            SET spent = spent + $1
            WHERE wallet = $2
            AND currency = $3
            AND balance + gained - spent - withdrawn - $1 >= 0
            RETURNING balance + gained - spent - withdrawn AS balance
            "#,
        )
        .bind(amount)
        .bind(wallet)
        .bind(currency)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(BankError::InsufficientFunds);
        };
        let new_balance: Decimal = row.get("balance");

        sqlx::query(
            r#"
            INSERT INTO ledger (wallet, currency, change, reason, game_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(wallet)
        .bind(currency)
        .bind(-amount)
        .bind(reason)
        .bind(game_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(new_balance)
    }

    async fn balance(&self, wallet: &str, currency: &str) -> Result<Decimal, BankError> {
        let row = sqlx::query(
            r#"
            SELECT balance + gained - spent - withdrawn AS balance
            FROM balances
            WHERE wallet = $1
            AND currency = $2
            LIMIT 1
            "#,
        )
        .bind(wallet)
        .bind(currency)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(row.get("balance")),
            None => Err(BankError::AccountMissing),
        }
    }

    async fn balances(&self, wallet: &str) -> Result<HashMap<String, Decimal>, BankError> {
        let rows = sqlx::query(
            r#"
            SELECT currency, balance + gained - spent - withdrawn AS balance
            FROM balances
            WHERE wallet = $1
            "#,
        )
        .bind(wallet)
        .fetch_all(&self.db)
        .await?;

        let mut balances = HashMap::new();
        for row in rows {
            let currency: String = row.get("currency");
            let balance: Decimal = row.get("balance");
            balances.insert(currency, balance);
        }

        Ok(balances)
    }
}
