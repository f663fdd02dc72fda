// SPDX-License-Identifier: GPL-2.0-or-later

use common::time::{Duration, UnixNano};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;

pub const DEFAULT_REQUEST_LOG_CAPACITY: usize = 1000;

/// One served HTTP request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub time: UnixNano,
    pub method: String,
    pub path: String,
    pub status: u16,

    #[serde(rename = "remoteIp")]
    pub remote_ip: String,

    // Wall time spent in the handler chain, nanoseconds.
    pub duration: Duration,

    #[serde(rename = "requestBody", skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    #[serde(rename = "responseBody", skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestLogQuery {
    // Only records whose path starts with this prefix.
    #[serde(rename = "path-prefix")]
    pub path_prefix: Option<String>,

    // Only records with this exact method.
    pub method: Option<String>,

    // Only records with status >= this value.
    #[serde(rename = "min-status")]
    pub min_status: Option<u16>,

    // Maximum number of records to return, newest first.
    pub limit: Option<usize>,
}

const DEFAULT_QUERY_LIMIT: usize = 100;

/// Bounded in-memory ring of recent requests. The oldest record is evicted
/// on overflow.
pub struct RequestLog {
    state: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl RequestLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn record(&self, record: RequestRecord) {
        let mut state = self.state.lock().await;
        if state.len() == self.capacity {
            state.pop_front();
        }
        state.push_back(record);
    }

    /// Matching records, newest first.
    pub async fn query(&self, query: &RequestLogQuery) -> Vec<RequestRecord> {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let state = self.state.lock().await;
        state
            .iter()
            .rev()
            .filter(|record| {
                if let Some(prefix) = &query.path_prefix {
                    if !record.path.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                if let Some(method) = &query.method {
                    if record.method != *method {
                        return false;
                    }
                }
                if let Some(min_status) = query.min_status {
                    if record.status < min_status {
                        return false;
                    }
                }
                true
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(path: &str, status: u16) -> RequestRecord {
        RequestRecord {
            time: UnixNano::new(0),
            method: "GET".to_owned(),
            path: path.to_owned(),
            status,
            remote_ip: "127.0.0.1".to_owned(),
            duration: Duration::new(0),
            request_body: None,
            response_body: None,
        }
    }

    #[tokio::test]
    async fn test_eviction() {
        let log = RequestLog::new(2);
        log.record(record("/a", 200)).await;
        log.record(record("/b", 200)).await;
        log.record(record("/c", 200)).await;

        let got = log.query(&RequestLogQuery::default()).await;
        let paths: Vec<&str> = got.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(vec!["/c", "/b"], paths);
    }

    #[tokio::test]
    async fn test_filters() {
        let log = RequestLog::new(10);
        log.record(record("/stream/hd/index.m3u8", 200)).await;
        log.record(record("/stream/hd/segment0.ts", 404)).await;
        log.record(record("/health", 200)).await;

        let got = log
            .query(&RequestLogQuery {
                path_prefix: Some("/stream".to_owned()),
                ..Default::default()
            })
            .await;
        assert_eq!(2, got.len());

        let got = log
            .query(&RequestLogQuery {
                min_status: Some(400),
                ..Default::default()
            })
            .await;
        assert_eq!(1, got.len());
        assert_eq!("/stream/hd/segment0.ts", got[0].path);

        let got = log
            .query(&RequestLogQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(1, got.len());
        assert_eq!("/health", got[0].path);
    }
}
