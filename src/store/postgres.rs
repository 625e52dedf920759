//! Postgres wire protocol backend (QuestDB speaks it on port 8812).

use super::connection::{Connector, QueryResult, StoreConnection};
use crate::config::StoreConfig;
use crate::schema::SqlValue;
use crate::utils::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, error};

pub struct PgConnector {
    conn_str: String,
    label: String,
}

impl PgConnector {
    pub fn new(cfg: &StoreConfig) -> Self {
        Self {
            conn_str: cfg.connection_string(),
            label: format!("{}@{}:{}/{}", cfg.user, cfg.host, cfg.port, cfg.database),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls).await?;
        let label = self.label.clone();
        // The driver runs until the client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target = %label, error = %e, "Store connection driver stopped");
            }
        });
        debug!(target = %self.label, "Opened store connection");
        Ok(Box::new(PgConnection { client }))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

struct PgConnection {
    client: Client,
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn to_param(value: &SqlValue) -> BoxedParam {
    match value {
        | SqlValue::Null => Box::new(Option::<String>::None),
        | SqlValue::Bool(b) => Box::new(*b),
        | SqlValue::Int(i) => Box::new(*i),
        | SqlValue::Long(i) => Box::new(*i),
        | SqlValue::Float(f) => Box::new(*f),
        | SqlValue::Double(f) => Box::new(*f),
        | SqlValue::Text(s) | SqlValue::Symbol(s) => Box::new(s.clone()),
        | SqlValue::Timestamp(ts) => Box::new(*ts),
        | SqlValue::Date(d) => Box::new(*d),
    }
}

fn decode(row: &Row, idx: usize) -> SqlValue {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        | Type::BOOL => get::<bool>(row, idx).map(SqlValue::Bool),
        | Type::INT2 => get::<i16>(row, idx).map(|v| SqlValue::Int(v as i32)),
        | Type::INT4 => get::<i32>(row, idx).map(SqlValue::Int),
        | Type::INT8 => get::<i64>(row, idx).map(SqlValue::Long),
        | Type::FLOAT4 => get::<f32>(row, idx).map(SqlValue::Float),
        | Type::FLOAT8 => get::<f64>(row, idx).map(SqlValue::Double),
        | Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(SqlValue::Timestamp),
        | Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(|n| SqlValue::Timestamp(n.and_utc())),
        | Type::DATE => get::<NaiveDate>(row, idx).map(SqlValue::Date),
        | _ => get::<String>(row, idx).map(SqlValue::Text),
    };
    value.unwrap_or(SqlValue::Null)
}

#[async_trait]
impl StoreConnection for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        if params.is_empty() {
            // Simple protocol: literal batch inserts and DDL.
            let messages = self.client.simple_query(sql).await?;
            return Ok(messages
                .iter()
                .map(|m| match m {
                    | SimpleQueryMessage::CommandComplete(n) => *n,
                    | _ => 0,
                })
                .sum());
        }
        let boxed: Vec<BoxedParam> = params.iter().map(to_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        Ok(self.client.execute(sql, &refs).await?)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StoreError> {
        let boxed: Vec<BoxedParam> = params.iter().map(to_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(sql, &refs).await?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows.iter().map(|row| (0..row.len()).map(|i| decode(row, i)).collect()).collect();
        Ok(QueryResult { columns, rows })
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("BEGIN").await?)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("COMMIT").await?)
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        Ok(self.client.batch_execute("ROLLBACK").await?)
    }

    async fn close(&mut self) {
        // Dropping the client ends the driver task; nothing to flush.
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

#[cfg(all(test, feature = "live-store-tests"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_against_local_store() {
        let connector = PgConnector::new(&StoreConfig::default());
        let mut conn = connector.connect().await.unwrap();
        conn.ping().await.unwrap();
        let result = conn.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }
}
