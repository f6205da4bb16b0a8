use super::{QueryExecutor, ResultColumn, ResultSet, Row};
use crate::{
    config::ClickHouseConfig,
    error::{Result, ServiceError},
    sql::{BindParam, Statement},
};
use async_trait::async_trait;
use clickhouse::{query::Query, Client};
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio::io::AsyncBufReadExt;
use tracing::debug;

/// Header rows carry names then types; every following line is one row.
const RESULT_FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

/// Runs statements through the `clickhouse` client. Values are bound with
/// `Query::bind`, so escaping is the client's job.
#[derive(Clone)]
pub struct ClickHouseExecutor {
    client: Client,
    request_timeout: Duration,
}

impl ClickHouseExecutor {
    pub fn new(config: &ClickHouseConfig, request_timeout: Duration) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(ServiceError::Config("CLICKHOUSE_URL must not be empty".into()));
        }

        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database)
            .with_option("output_format_json_quote_64bit_integers", "0")
            .with_option(
                "max_execution_time",
                request_timeout.as_secs().max(1).to_string(),
            );

        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn query(&self, operation: &'static str, statement: &Statement) -> Result<Query> {
        debug!(
            operation,
            sql = %statement.sql,
            params = ?statement.params.names(),
            "executing statement"
        );
        statement
            .bound
            .values
            .iter()
            .try_fold(self.client.query(&statement.bound.sql), bind)
    }

    async fn timed<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.request_timeout, future)
            .await
            .map_err(|_| {
                ServiceError::executor(
                    operation,
                    format!("timed out after {}s", self.request_timeout.as_secs()),
                )
            })?
    }
}

fn bind(query: Query, value: &BindParam) -> Result<Query> {
    let query = match value {
        BindParam::Null => query.bind(Option::<&str>::None),
        BindParam::Bool(flag) => query.bind(*flag),
        BindParam::Int(int) => query.bind(*int),
        BindParam::Float(float) => query.bind(*float),
        BindParam::Text(text) => query.bind(text.as_str()),
        BindParam::Timestamp(ts) => query.bind(ts.to_rfc3339()),
        BindParam::List(_) => {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "nested lists cannot be bound"
            )))
        }
    };
    Ok(query)
}

fn failed(operation: &'static str) -> impl Fn(clickhouse::error::Error) -> ServiceError {
    move |err| ServiceError::executor(operation, err.to_string())
}

/// Decodes `JSONCompactEachRowWithNamesAndTypes` lines into named rows.
fn decode_rows(lines: &[String]) -> Result<ResultSet> {
    let parse = |line: &String| -> Result<Vec<Value>> {
        serde_json::from_str(line).map_err(|err| ServiceError::executor("decode", err.to_string()))
    };
    let text = |value: Value| match value {
        Value::String(text) => text,
        other => other.to_string(),
    };

    let mut lines = lines.iter().filter(|line| !line.trim().is_empty());
    let Some(names) = lines.next() else {
        return Ok(ResultSet::default());
    };
    let names: Vec<String> = parse(names)?.into_iter().map(text).collect();
    let types: Vec<String> = match lines.next() {
        Some(types) => parse(types)?.into_iter().map(text).collect(),
        None => Vec::new(),
    };

    let rows = lines
        .map(|line| {
            let values = parse(line)?;
            if values.len() != names.len() {
                return Err(ServiceError::executor(
                    "decode",
                    format!("expected {} values, got {}", names.len(), values.len()),
                ));
            }
            Ok(names.iter().cloned().zip(values).collect::<Row>())
        })
        .collect::<Result<Vec<_>>>()?;

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(index, name)| ResultColumn {
            name,
            data_type: types.get(index).cloned().unwrap_or_default(),
        })
        .collect();

    Ok(ResultSet { columns, rows })
}

#[async_trait]
impl QueryExecutor for ClickHouseExecutor {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        let query = self.query("execute", statement)?;
        self.timed("execute", async {
            query.execute().await.map_err(failed("execute"))
        })
        .await
    }

    async fn fetch_all(&self, statement: &Statement) -> Result<ResultSet> {
        let query = self.query("fetch", statement)?;
        let lines = self
            .timed("fetch", async {
                let mut cursor = query
                    .fetch_bytes(RESULT_FORMAT)
                    .map_err(failed("fetch"))?
                    .lines();
                let mut lines = Vec::new();
                while let Some(line) = cursor
                    .next_line()
                    .await
                    .map_err(|err| ServiceError::executor("fetch", err.to_string()))?
                {
                    lines.push(line);
                }
                Ok(lines)
            })
            .await?;
        decode_rows(&lines)
    }
}
