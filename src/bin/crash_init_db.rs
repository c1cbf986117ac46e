use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;

/// Splits a schema file into individual statements. Understands `--` line
/// comments and single-quoted strings, which is all our plain DDL uses.
fn schema_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                quoted = !quoted;
                current.push(ch);
            }
            '-' if !quoted && chars.peek() == Some(&'-') => {
                // Comment runs to end of line.
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
                current.push('\n');
            }
            ';' if !quoted => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }

    statements
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = std::env::var("DATABASE_URL").context("missing required env var: DATABASE_URL")?;
    let schema_path = std::env::var("SCHEMA_PATH").unwrap_or_else(|_| "schema.sql".to_string());

    let db = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .context("open database pool")?;

    let schema_sql =
        fs::read_to_string(&schema_path).with_context(|| format!("read {schema_path}"))?;
    for statement in schema_statements(&schema_sql) {
        let label: String = statement.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
        sqlx::query(&statement)
            .execute(&db)
            .await
            .with_context(|| format!("apply schema statement '{label}'"))?;
    }

    // Optional demo account seed for local play.
    if let (Ok(wallet), Ok(balance)) = (std::env::var("SEED_WALLET"), std::env::var("SEED_BALANCE")) {
        let currency = std::env::var("SEED_CURRENCY").unwrap_or_else(|_| "eth".to_string());
        let amount: Decimal = balance.parse().context("SEED_BALANCE is not a decimal")?;
        sqlx::query(
            "INSERT INTO balances (wallet, currency, balance) VALUES ($1, $2, $3)
             ON CONFLICT (wallet, currency) DO UPDATE SET balance = EXCLUDED.balance",
        )
        .bind(&wallet)
        .bind(&currency)
        .bind(amount)
        .execute(&db)
        .await?;
        println!("seeded balance: wallet={wallet} currency={currency} balance={amount}");
    }

    println!("schema initialized from {schema_path}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_statements_and_drops_comments() {
        let sql = "-- header\nCREATE TABLE a (x INT);\n\n-- more\nCREATE TABLE b (y TEXT);\n";
        let statements = schema_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert!(statements[1].starts_with("CREATE TABLE b"));
    }

    #[test]
    fn keeps_semicolons_inside_string_literals() {
        let sql = "INSERT INTO t (v) VALUES ('a;b');\nCREATE TABLE c (z INT) -- trailing; note\n;";
        let statements = schema_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("'a;b'"));
        assert!(statements[1].starts_with("CREATE TABLE c"));
        assert!(!statements[1].contains("trailing"));
    }
}
