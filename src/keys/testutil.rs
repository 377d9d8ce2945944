/// Test doubles for key databases and fetchers
use crate::{
    error::{ServerKeyError, ServerKeyResult},
    keys::{
        KeyDatabase, KeyFetcher, KeyIdentifier, KeyLookupResult, LookupRequests, LookupResults,
        Timestamp, VerifyKey,
    },
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

pub(crate) fn lookup(valid_until: u64, expired: Option<u64>) -> KeyLookupResult {
    KeyLookupResult {
        verify_key: VerifyKey(valid_until.to_be_bytes().to_vec()),
        valid_until_ts: Timestamp(valid_until),
        expired_ts: expired.map(Timestamp),
    }
}

pub(crate) fn key(server: &str) -> KeyIdentifier {
    KeyIdentifier::new(server, "ed25519:auto")
}

pub(crate) fn requests_for(ids: &[KeyIdentifier], valid_at: u64) -> LookupRequests {
    ids.iter().map(|id| (id.clone(), Timestamp(valid_at))).collect()
}

/// HashMap-backed key database with call counters and injectable failures
#[derive(Default)]
pub(crate) struct MemoryKeyDatabase {
    pub entries: Mutex<HashMap<KeyIdentifier, KeyLookupResult>>,
    pub fetch_calls: AtomicUsize,
    pub store_calls: AtomicUsize,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub write_delay: Option<Duration>,
}

impl MemoryKeyDatabase {
    pub fn with_entries(entries: LookupResults) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Default::default()
        }
    }

    pub fn get(&self, id: &KeyIdentifier) -> Option<KeyLookupResult> {
        self.entries.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl KeyDatabase for MemoryKeyDatabase {
    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            return Err(ServerKeyError::Internal("read failed".to_string()));
        }
        let entries = self.entries.lock().unwrap();
        Ok(requests
            .keys()
            .filter_map(|id| entries.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(ServerKeyError::StorePersistence("disk full".to_string()));
        }
        let mut entries = self.entries.lock().unwrap();
        for (id, result) in results {
            entries.insert(id.clone(), result.clone());
        }
        Ok(())
    }
}

/// Fetcher answering from a fixed table and recording what it was asked
pub(crate) struct StaticKeyFetcher {
    pub name: String,
    pub known: LookupResults,
    pub fail: bool,
    pub calls: AtomicUsize,
    pub received: Mutex<Vec<LookupRequests>>,
    pub call_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl StaticKeyFetcher {
    pub fn new(name: &str, known: LookupResults) -> Self {
        Self {
            name: name.to_string(),
            known,
            fail: false,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            call_log: None,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, LookupResults::new())
        }
    }

    pub fn with_call_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.call_log = Some(log);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyFetcher for StaticKeyFetcher {
    fn fetcher_name(&self) -> &str {
        &self.name
    }

    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(requests.clone());
        if let Some(log) = &self.call_log {
            log.lock().unwrap().push(self.name.clone());
        }
        if self.fail {
            return Err(ServerKeyError::Fetcher {
                fetcher: self.name.clone(),
                message: "unreachable".to_string(),
            });
        }
        Ok(requests
            .keys()
            .filter_map(|id| self.known.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }
}
