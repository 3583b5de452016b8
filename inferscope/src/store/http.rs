//! ClickHouse HTTP driver.
//!
//! Each pooled connection owns its own `reqwest` client, so discarding a
//! connection after a failed query really does tear down its transport
//! state rather than returning it to a shared pool. Statements are POSTed
//! with `FORMAT JSONEachRow`; result rows come back one JSON object per
//! line and are parsed into dynamic maps, which is what a planner emitting
//! request-dependent column sets needs. Bind parameters travel as
//! ClickHouse `param_*` query parameters, never interpolated into SQL.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Response;
use tracing::debug;
use url::Url;

use crate::config::{PoolConfig, StoreConfig};
use crate::errors::{StoreError, sql_preview};

use super::{Connection, Connector, QueryParams, Row, RowStream};

/// Characters of a store error body retained in error messages.
const ERROR_BODY_LEN: usize = 512;

/// Dials [`HttpConnection`]s for the pool.
pub struct HttpConnector {
    store: StoreConfig,
    pool: PoolConfig,
}

impl HttpConnector {
    pub fn new(store: &StoreConfig, pool: &PoolConfig) -> Self {
        Self {
            store: store.clone(),
            pool: pool.clone(),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.pool.connect_timeout)
            .build()
            .map_err(|e| StoreError::Connect { message: e.to_string() })?;
        Ok(Arc::new(HttpConnection {
            client,
            store: self.store.clone(),
        }))
    }
}

/// One pooled connection to the store's HTTP interface.
pub struct HttpConnection {
    client: reqwest::Client,
    store: StoreConfig,
}

impl HttpConnection {
    /// Endpoint URL with the database, JSON number formatting, and bind
    /// parameters attached. `output_format_json_quote_64bit_integers=0`
    /// keeps UInt64 aggregates as JSON numbers instead of strings.
    fn endpoint(&self, params: &QueryParams) -> Url {
        let mut url = self.store.url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("database", &self.store.database);
            pairs.append_pair("output_format_json_quote_64bit_integers", "0");
            for (name, value) in params {
                pairs.append_pair(&format!("param_{name}"), value);
            }
        }
        url
    }

    async fn send(&self, sql: &str, params: &QueryParams, body: String) -> Result<Response, StoreError> {
        let mut request = self
            .client
            .post(self.endpoint(params))
            .header("X-ClickHouse-User", &self.store.user)
            .body(body);
        if let Some(password) = &self.store.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await.map_err(|e| StoreError::Query {
            message: e.to_string(),
            sql_preview: sql_preview(sql),
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Query {
                message: format!("store returned {status}: {}", truncate_body(&text)),
                sql_preview: sql_preview(sql),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn query(&self, sql: &str, params: &QueryParams) -> Result<Vec<Row>, StoreError> {
        let statement = with_row_format(sql);
        let response = self.send(sql, params, statement).await?;
        let text = response.text().await.map_err(|e| StoreError::Decode { message: e.to_string() })?;

        let mut rows = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rows.push(parse_row(line)?);
        }
        debug!(rows = rows.len(), "store response decoded");
        Ok(rows)
    }

    async fn query_stream(&self, sql: &str, params: &QueryParams) -> Result<RowStream, StoreError> {
        let statement = with_row_format(sql);
        let response = self.send(sql, params, statement).await?;
        let bytes = response.bytes_stream();

        // Incremental line splitting over the byte stream; at no point is
        // the full result set buffered.
        let stream = futures::stream::unfold((bytes, BytesMut::new(), false), |(mut bytes, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((parse_row(line), (bytes, buf, done)));
                }
                if done {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    buf.clear();
                    if line.is_empty() {
                        return None;
                    }
                    return Some((parse_row(&line), (bytes, buf, done)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((
                            Err(StoreError::Decode { message: e.to_string() }),
                            (bytes, buf, true),
                        ));
                    }
                    None => done = true,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn insert(&self, sql: &str, body: String) -> Result<(), StoreError> {
        let statement = format!("{sql}\n{body}");
        self.send(sql, &QueryParams::new(), statement).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.query("SELECT 1", &QueryParams::new()).await?;
        Ok(())
    }
}

/// Append the row format unless the statement already carries one.
fn with_row_format(sql: &str) -> String {
    if sql.contains("FORMAT ") {
        sql.to_string()
    } else {
        format!("{sql} FORMAT JSONEachRow")
    }
}

fn parse_row(line: &str) -> Result<Row, StoreError> {
    serde_json::from_str::<Row>(line).map_err(|e| StoreError::Decode { message: e.to_string() })
}

fn truncate_body(text: &str) -> String {
    if text.len() <= ERROR_BODY_LEN {
        text.to_string()
    } else {
        let mut end = ERROR_BODY_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_format_appended_once() {
        assert_eq!(with_row_format("SELECT 1"), "SELECT 1 FORMAT JSONEachRow");
        assert_eq!(
            with_row_format("INSERT INTO t (a) FORMAT JSONEachRow"),
            "INSERT INTO t (a) FORMAT JSONEachRow"
        );
    }

    #[test]
    fn parse_row_decodes_json_objects() {
        let row = parse_row(r#"{"time_bucket":"2024-01-01 00:00:00","request_count":2}"#).unwrap();
        assert_eq!(row.get("request_count").unwrap().as_i64(), Some(2));
        assert!(parse_row("not json").is_err());
    }

    #[test]
    fn endpoint_carries_database_and_bind_params() {
        let conn = HttpConnection {
            client: reqwest::Client::new(),
            store: StoreConfig::default(),
        };
        let mut params = QueryParams::new();
        params.insert("from_date".to_string(), "2024-01-01 00:00:00.000".to_string());
        params.insert("to_date".to_string(), "2024-01-02 00:00:00.000".to_string());

        let url = conn.endpoint(&params);
        let query = url.query().unwrap();
        assert!(query.contains("database=telemetry"));
        assert!(query.contains("output_format_json_quote_64bit_integers=0"));
        assert!(query.contains("param_from_date=2024-01-01+00%3A00%3A00.000"));
        assert!(query.contains("param_to_date="));
    }

    #[test]
    fn error_bodies_are_truncated() {
        let long = "x".repeat(2_000);
        let truncated = truncate_body(&long);
        assert!(truncated.chars().count() <= ERROR_BODY_LEN + 1);
    }
}
