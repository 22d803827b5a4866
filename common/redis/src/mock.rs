use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{BloomParams, Client, CustomRedisError};

/// In-memory `Client` for tests. Values written with `setex` are readable with
/// `get`, bloom filters are exact sets, and every call is recorded.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    get_ret: HashMap<String, Result<String, CustomRedisError>>,
    setex_ret: HashMap<String, Result<(), CustomRedisError>>,
    bf_insert_error: Option<CustomRedisError>,
    bf_insert_transient_errors: Arc<Mutex<Vec<CustomRedisError>>>,
    values: Arc<Mutex<HashMap<String, String>>>,
    filters: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the result of `get` for `key`, taking precedence over stored values.
    pub fn get_ret(&mut self, key: &str, ret: Result<String, CustomRedisError>) -> Self {
        self.get_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn setex_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.setex_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    /// Every bloom insert fails with `err`.
    pub fn bf_insert_error(&mut self, err: CustomRedisError) -> Self {
        self.bf_insert_error = Some(err);
        self.clone()
    }

    /// The next `times` bloom inserts fail with `err`, later ones succeed.
    pub fn bf_insert_error_times(&mut self, err: CustomRedisError, times: usize) -> Self {
        lock(&self.bf_insert_transient_errors).extend(std::iter::repeat(err).take(times));
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None);

        if let Some(ret) = self.get_ret.get(&key) {
            return ret.clone();
        }
        lock(&self.values)
            .get(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );

        if let Some(ret) = self.setex_ret.get(&key) {
            return ret.clone();
        }
        lock(&self.values).insert(key, value);
        Ok(())
    }

    async fn bf_insert_expire_nx(
        &self,
        key: String,
        item: String,
        params: BloomParams,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "bf_insert_expire_nx",
            &key,
            MockRedisValue::BloomItem(item.clone(), params),
        );

        if let Some(err) = &self.bf_insert_error {
            return Err(err.clone());
        }
        if let Some(err) = lock(&self.bf_insert_transient_errors).pop() {
            return Err(err);
        }
        Ok(lock(&self.filters).entry(key).or_default().insert(item))
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    StringWithTTL(String, u64),
    BloomItem(String, BloomParams),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}
