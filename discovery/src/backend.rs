use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::PingError;
use crate::liveness::PING_PATH;
use crate::{BackendRecord, Error};

/// Build the HTTP client shared by every backend handle.
///
/// Connection reuse is pooled per destination host, so one client serves the
/// whole membership table.
pub fn http_client(request_timeout: Duration, max_idle_per_host: usize) -> Result<Client, Error> {
    let client = Client::builder()
        .timeout(request_timeout)
        .pool_max_idle_per_host(max_idle_per_host)
        .build()?;
    Ok(client)
}

/// A live entry in the membership table: the registration plus the transport
/// used to reach it.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    record: BackendRecord,
    client: Client,
}

impl BackendHandle {
    pub fn new(record: BackendRecord, client: Client) -> Self {
        Self { record, client }
    }

    pub fn record(&self) -> &BackendRecord {
        &self.record
    }

    pub fn instance_id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    /// Issue one liveness request. Only `200 OK` counts as success.
    pub async fn ping(&self) -> Result<(), PingError> {
        let url = format!("{}{}", self.record.address.trim_end_matches('/'), PING_PATH);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                PingError::Timeout {
                    address: self.record.address.clone(),
                }
            } else {
                PingError::Transport {
                    address: self.record.address.clone(),
                    source: e,
                }
            }
        })?;

        if resp.status() != StatusCode::OK {
            return Err(PingError::Status {
                address: self.record.address.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
