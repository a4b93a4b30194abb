use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool};

use crate::error::{AmlError, Result};

use super::snapshot::Snapshot;
use super::store::GraphStore;
use super::types::{
    Address, AddressRecord, Alert, AlertType, Counterparty, Direction, StructuralFeatures,
    Transaction, Transfer,
};

type AddressRow = (
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    BigDecimal,
    BigDecimal,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<i64>,
    Option<f64>,
    Option<DateTime<Utc>>,
);

type TransactionRow = (String, String, String, BigDecimal, DateTime<Utc>, i64, i64);

type TransferRow = (String, String, i64, BigDecimal, DateTime<Utc>);

type AlertRow = (String, String, f64, JsonValue, DateTime<Utc>);

const ADDRESS_COLUMNS: &str = "address, first_seen, last_seen, total_in, total_out, risk_score, \
     pagerank, degree, in_degree, out_degree, community_id, triangle_count, features_updated_at";

const TRANSACTION_COLUMNS: &str =
    "hash, from_address, to_address, value, block_timestamp, block_number, nonce";

fn decimal(value: f64) -> Result<BigDecimal> {
    BigDecimal::from_f64(value)
        .ok_or_else(|| AmlError::Validation(format!("value {} is not a finite number", value)))
}

fn float(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn address_from_row(row: AddressRow) -> Result<AddressRecord> {
    let (
        address,
        first_seen,
        last_seen,
        total_in,
        total_out,
        risk_score,
        pagerank,
        degree,
        in_degree,
        out_degree,
        community_id,
        triangle_count,
        features_updated_at,
    ) = row;
    let features = features_updated_at.map(|_| StructuralFeatures {
        pagerank: pagerank.unwrap_or(0.0),
        degree: degree.unwrap_or(0.0),
        in_degree: in_degree.unwrap_or(0.0),
        out_degree: out_degree.unwrap_or(0.0),
        community_id,
        triangle_count: triangle_count.unwrap_or(0.0),
    });
    Ok(AddressRecord {
        address: Address::parse(&address)?,
        first_seen,
        last_seen,
        total_in: float(&total_in),
        total_out: float(&total_out),
        risk_score,
        features,
    })
}

fn transaction_from_row(row: TransactionRow) -> Result<Transaction> {
    let (hash, from, to, value, timestamp, block, nonce) = row;
    Ok(Transaction {
        hash,
        from: Address::parse(&from)?,
        to: Address::parse(&to)?,
        value: float(&value),
        timestamp,
        block: block.max(0) as u64,
        nonce: nonce.max(0) as u64,
    })
}

fn transfer_from_row(row: TransferRow) -> Result<Transfer> {
    let (source, destination, count, value_sum, last_timestamp) = row;
    Ok(Transfer {
        source: Address::parse(&source)?,
        destination: Address::parse(&destination)?,
        count: count.max(0) as u64,
        value_sum: float(&value_sum),
        last_timestamp,
    })
}

fn alert_from_row(row: AlertRow) -> Result<Alert> {
    let (address, alert_type, score, details, created_at) = row;
    Ok(Alert {
        address: Address::parse(&address)?,
        alert_type: alert_type.parse()?,
        score,
        details,
        created_at,
    })
}

// ============================================================================
// Shared reads (pool or snapshot transaction)
// ============================================================================

async fn fetch_address<'e, E: PgExecutor<'e>>(
    exec: E,
    address: &Address,
) -> Result<Option<AddressRecord>> {
    let row: Option<AddressRow> = sqlx::query_as(&format!(
        "SELECT {} FROM addresses WHERE address = $1",
        ADDRESS_COLUMNS
    ))
    .bind(address.as_str())
    .fetch_optional(exec)
    .await?;
    row.map(address_from_row).transpose()
}

async fn fetch_transactions<'e, E: PgExecutor<'e>>(
    exec: E,
    address: &Address,
    direction: Direction,
    until: DateTime<Utc>,
) -> Result<Vec<Transaction>> {
    let column = match direction {
        Direction::Incoming => "to_address",
        Direction::Outgoing => "from_address",
    };
    let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM transactions
         WHERE {} = $1 AND block_timestamp <= $2
         ORDER BY block_timestamp, block_number, nonce",
        TRANSACTION_COLUMNS, column
    ))
    .bind(address.as_str())
    .bind(until)
    .fetch_all(exec)
    .await?;
    rows.into_iter().map(transaction_from_row).collect()
}

async fn fetch_transfers<'e, E: PgExecutor<'e>>(
    exec: E,
    address: &Address,
    direction: Direction,
) -> Result<Vec<Transfer>> {
    let column = match direction {
        Direction::Incoming => "destination",
        Direction::Outgoing => "source",
    };
    let rows: Vec<TransferRow> = sqlx::query_as(&format!(
        "SELECT source, destination, tx_count, value_sum, last_timestamp
         FROM transfers
         WHERE {} = $1
         ORDER BY value_sum DESC",
        column
    ))
    .bind(address.as_str())
    .fetch_all(exec)
    .await?;
    rows.into_iter().map(transfer_from_row).collect()
}

// ============================================================================
// Store
// ============================================================================

/// [`GraphStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn get_address(&self, address: &Address) -> Result<Option<AddressRecord>> {
        fetch_address(&self.pool, address).await
    }

    async fn upsert_address(&self, address: &Address, seen: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO addresses (address, first_seen, last_seen)
             VALUES ($1, $2, $2)
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(address.as_str())
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_transaction(&self, tx: &Transaction) -> Result<bool> {
        let value = decimal(tx.value)?;
        let mut db = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO transactions (hash, from_address, to_address, value, block_timestamp, block_number, nonce)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(&tx.hash)
        .bind(tx.from.as_str())
        .bind(tx.to.as_str())
        .bind(&value)
        .bind(tx.timestamp)
        .bind(tx.block as i64)
        .bind(tx.nonce as i64)
        .execute(&mut *db)
        .await?
        .rows_affected();

        if inserted == 0 {
            db.rollback().await?;
            return Ok(false);
        }

        let zero = BigDecimal::from(0);
        for (address, total_in, total_out) in [(&tx.from, &zero, &value), (&tx.to, &value, &zero)] {
            sqlx::query(
                "INSERT INTO addresses (address, first_seen, last_seen, total_in, total_out)
                 VALUES ($1, $2, $2, $3, $4)
                 ON CONFLICT (address) DO UPDATE
                 SET first_seen = LEAST(addresses.first_seen, EXCLUDED.first_seen),
                     last_seen = GREATEST(addresses.last_seen, EXCLUDED.last_seen),
                     total_in = addresses.total_in + EXCLUDED.total_in,
                     total_out = addresses.total_out + EXCLUDED.total_out",
            )
            .bind(address.as_str())
            .bind(tx.timestamp)
            .bind(total_in)
            .bind(total_out)
            .execute(&mut *db)
            .await?;
        }

        sqlx::query(
            "INSERT INTO transfers (source, destination, tx_count, value_sum, last_timestamp)
             VALUES ($1, $2, 1, $3, $4)
             ON CONFLICT (source, destination) DO UPDATE
             SET tx_count = transfers.tx_count + 1,
                 value_sum = transfers.value_sum + EXCLUDED.value_sum,
                 last_timestamp = GREATEST(transfers.last_timestamp, EXCLUDED.last_timestamp)",
        )
        .bind(tx.from.as_str())
        .bind(tx.to.as_str())
        .bind(&value)
        .bind(tx.timestamp)
        .execute(&mut *db)
        .await?;

        db.commit().await?;
        Ok(true)
    }

    async fn transactions(
        &self,
        address: &Address,
        direction: Direction,
        until: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        fetch_transactions(&self.pool, address, direction, until).await
    }

    async fn transfers(&self, address: &Address, direction: Direction) -> Result<Vec<Transfer>> {
        fetch_transfers(&self.pool, address, direction).await
    }

    async fn get_counterparties(
        &self,
        address: &Address,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Counterparty>> {
        let rows: Vec<(String, BigDecimal)> = sqlx::query_as(
            "SELECT other, SUM(v) AS total FROM (
                 SELECT destination AS other, value_sum AS v FROM transfers
                 WHERE source = $1 AND value_sum >= $2
                 UNION ALL
                 SELECT source AS other, value_sum AS v FROM transfers
                 WHERE destination = $1 AND value_sum >= $2
             ) c
             WHERE other <> $1
             GROUP BY other
             ORDER BY total DESC, other
             LIMIT $3",
        )
        .bind(address.as_str())
        .bind(decimal(min_value)?)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(other, total)| {
                Ok(Counterparty {
                    address: Address::parse(&other)?,
                    total_value: float(&total),
                })
            })
            .collect()
    }

    async fn shortest_path(
        &self,
        from: &Address,
        to: &Address,
        max_hops: u32,
    ) -> Result<Option<Vec<Address>>> {
        let row: Option<(Vec<String>,)> = sqlx::query_as(
            "WITH RECURSIVE edges AS (
                 SELECT source AS a, destination AS b FROM transfers
                 UNION
                 SELECT destination AS a, source AS b FROM transfers
             ),
             walk (node, path, depth) AS (
                 SELECT $1::text, ARRAY[$1::text], 0
                 UNION ALL
                 SELECT e.b, w.path || e.b, w.depth + 1
                 FROM walk w
                 JOIN edges e ON e.a = w.node
                 WHERE w.depth < $3 AND NOT (e.b = ANY(w.path))
             )
             SELECT path FROM walk WHERE node = $2 ORDER BY depth LIMIT 1",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(max_hops as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(path,)| path.iter().map(|a| Address::parse(a)).collect())
            .transpose()
    }

    async fn find_alerts(
        &self,
        address: Option<&Address>,
        types: &[AlertType],
        min_score: f64,
    ) -> Result<Vec<Alert>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "SELECT address, alert_type, score, details, created_at FROM alerts WHERE score >= ",
        );
        qb.push_bind(min_score);
        if let Some(address) = address {
            qb.push(" AND address = ").push_bind(address.as_str());
        }
        if !types.is_empty() {
            let names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            qb.push(" AND alert_type = ANY(").push_bind(names).push(")");
        }
        qb.push(" ORDER BY created_at, id");

        let rows: Vec<AlertRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(alert_from_row).collect()
    }

    async fn write_alert(
        &self,
        address: &Address,
        alert_type: AlertType,
        score: f64,
        details: JsonValue,
    ) -> Result<Option<Alert>> {
        let created: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "INSERT INTO alerts (address, alert_type, score, details)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (address, alert_type, details) DO NOTHING
             RETURNING created_at",
        )
        .bind(address.as_str())
        .bind(alert_type.as_str())
        .bind(score)
        .bind(&details)
        .fetch_optional(&self.pool)
        .await?;

        Ok(created.map(|(created_at,)| Alert {
            address: address.clone(),
            alert_type,
            score,
            details,
            created_at,
        }))
    }

    async fn write_risk_score(&self, address: &Address, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO addresses (address, first_seen, last_seen, risk_score)
             VALUES ($1, now(), now(), $2)
             ON CONFLICT (address) DO UPDATE SET risk_score = EXCLUDED.risk_score",
        )
        .bind(address.as_str())
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_structural_features(&self, address: &Address) -> Result<StructuralFeatures> {
        Ok(fetch_address(&self.pool, address)
            .await?
            .and_then(|r| r.features)
            .unwrap_or_default())
    }

    async fn write_structural_features(
        &self,
        address: &Address,
        features: &StructuralFeatures,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO addresses (address, first_seen, last_seen, pagerank, degree, in_degree,
                                    out_degree, community_id, triangle_count, features_updated_at)
             VALUES ($1, now(), now(), $2, $3, $4, $5, $6, $7, now())
             ON CONFLICT (address) DO UPDATE
             SET pagerank = EXCLUDED.pagerank,
                 degree = EXCLUDED.degree,
                 in_degree = EXCLUDED.in_degree,
                 out_degree = EXCLUDED.out_degree,
                 community_id = EXCLUDED.community_id,
                 triangle_count = EXCLUDED.triangle_count,
                 features_updated_at = EXCLUDED.features_updated_at",
        )
        .bind(address.as_str())
        .bind(features.pagerank)
        .bind(features.degree)
        .bind(features.in_degree)
        .bind(features.out_degree)
        .bind(features.community_id)
        .bind(features.triangle_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_block(&self) -> Result<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(block_number) FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.map(|b| b.max(0) as u64))
    }

    async fn large_transactions(
        &self,
        from_block: u64,
        to_block: u64,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions
             WHERE block_number BETWEEN $1 AND $2 AND value >= $3
             ORDER BY value DESC, hash
             LIMIT $4",
            TRANSACTION_COLUMNS
        ))
        .bind(from_block as i64)
        .bind(to_block as i64)
        .bind(decimal(min_value)?)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(transaction_from_row).collect()
    }

    /// All reads happen inside one REPEATABLE READ transaction.
    async fn snapshot(
        &self,
        address: &Address,
        as_of: DateTime<Utc>,
        hops: u32,
        edge_limit: usize,
    ) -> Result<Snapshot> {
        let mut db = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *db)
            .await?;

        let record = fetch_address(&mut *db, address).await?;
        let incoming = fetch_transactions(&mut *db, address, Direction::Incoming, as_of).await?;
        let outgoing = fetch_transactions(&mut *db, address, Direction::Outgoing, as_of).await?;
        let edges_in = fetch_transfers(&mut *db, address, Direction::Incoming).await?;
        let edges_out = fetch_transfers(&mut *db, address, Direction::Outgoing).await?;

        let mut reachable = Vec::new();
        let mut seen: HashSet<Address> = HashSet::from([address.clone()]);
        let mut frontier: VecDeque<(Address, u32)> = VecDeque::from([(address.clone(), 0)]);
        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= hops || reachable.len() >= edge_limit {
                continue;
            }
            let edges = if &node == address {
                edges_out.clone()
            } else {
                fetch_transfers(&mut *db, &node, Direction::Outgoing).await?
            };
            for edge in edges {
                if reachable.len() >= edge_limit {
                    break;
                }
                if seen.insert(edge.destination.clone()) {
                    frontier.push_back((edge.destination.clone(), depth + 1));
                }
                reachable.push(edge);
            }
        }

        db.commit().await?;

        Ok(Snapshot {
            address: address.clone(),
            as_of,
            record,
            incoming,
            outgoing,
            edges_in,
            edges_out,
            reachable,
        })
    }
}
