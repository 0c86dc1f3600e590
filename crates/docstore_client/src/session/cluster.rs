//! Compare-exchange operations of a cluster-wide session.

use super::DocumentSession;
use crate::compare_exchange::{CompareExchangeSessionValue, CompareExchangeState};
use crate::error::{ClientError, ClientResult};
use docstore_protocol::CompareExchangeValue;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::trace;

/// Compare-exchange view of a cluster-wide [`DocumentSession`].
///
/// Changes are staged in the session and sent by the next
/// [`save_changes`](DocumentSession::save_changes).
#[derive(Debug)]
pub struct ClusterTransactionOperations<'a> {
    session: &'a mut DocumentSession,
}

impl<'a> ClusterTransactionOperations<'a> {
    pub(super) fn new(session: &'a mut DocumentSession) -> Self {
        Self { session }
    }

    /// Stages creation of `key` with `item` as its value.
    ///
    /// Fails if the key is already tracked with a value or already staged
    /// for creation or deletion in this session.
    pub fn create_compare_exchange_value<T: Serialize>(
        &mut self,
        key: &str,
        item: &T,
    ) -> ClientResult<&mut CompareExchangeValue> {
        ensure_key(key)?;
        let value = serde_json::to_value(item)?;
        trace!(key = %key, "staging compare-exchange create");
        self.session
            .compare_exchange
            .entry(key.to_string())
            .or_insert_with(|| CompareExchangeSessionValue::new(key, 0, CompareExchangeState::None))
            .create(value)
    }

    /// Stages deletion of `key`, expected to be at `index` on the server.
    pub fn delete_compare_exchange_value(&mut self, key: &str, index: i64) -> ClientResult<()> {
        ensure_key(key)?;
        trace!(key = %key, index, "staging compare-exchange delete");
        self.session
            .compare_exchange
            .entry(key.to_string())
            .or_insert_with(|| {
                CompareExchangeSessionValue::new(key, index, CompareExchangeState::None)
            })
            .delete(index)
    }

    /// Returns the tracked value of `key`, fetching it on first access.
    ///
    /// Returns `None` if the key does not exist or is staged for deletion.
    pub fn get_compare_exchange_value(
        &mut self,
        key: &str,
    ) -> ClientResult<Option<&mut CompareExchangeValue>> {
        ensure_key(key)?;
        if !self.is_tracked(key) {
            self.fetch(&[key.to_string()])?;
        }
        Ok(self
            .session
            .compare_exchange
            .get_mut(key)
            .and_then(CompareExchangeSessionValue::value_mut))
    }

    /// Returns the values of `keys`, fetching untracked ones in one request.
    pub fn get_compare_exchange_values(
        &mut self,
        keys: &[&str],
    ) -> ClientResult<IndexMap<String, Option<CompareExchangeValue>>> {
        keys.iter().try_for_each(|key| ensure_key(key))?;
        let missing: Vec<String> = keys
            .iter()
            .filter(|key| !self.is_tracked(key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            self.fetch(&missing)?;
        }

        let mut values = IndexMap::with_capacity(keys.len());
        for key in keys {
            let value = self
                .session
                .compare_exchange
                .get_mut(*key)
                .and_then(CompareExchangeSessionValue::value_mut)
                .map(|value| value.clone());
            values.insert(key.to_string(), value);
        }
        Ok(values)
    }

    /// Returns `true` if `key` is tracked by the session.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.session.compare_exchange.contains_key(key)
    }

    /// Returns the number of tracked keys.
    pub fn number_of_tracked(&self) -> usize {
        self.session.compare_exchange.len()
    }

    /// Forgets every tracked key, staged changes included.
    pub fn clear(&mut self) {
        self.session.compare_exchange.clear();
    }

    fn fetch(&mut self, keys: &[String]) -> ClientResult<()> {
        self.session.before_request()?;
        let response = self
            .session
            .executor
            .get_compare_exchange_values(keys, Some(&self.session.session_info()))?;

        let mut found: IndexMap<String, CompareExchangeValue> = response
            .into_values()?
            .into_iter()
            .map(|value| (value.key.clone(), value))
            .collect();
        for key in keys {
            let tracked = match found.shift_remove(key) {
                Some(value) => CompareExchangeSessionValue::from_value(value),
                None => CompareExchangeSessionValue::missing(key.as_str()),
            };
            self.session.compare_exchange.insert(key.clone(), tracked);
        }
        Ok(())
    }
}

fn ensure_key(key: &str) -> ClientResult<()> {
    if key.is_empty() {
        return Err(ClientError::IllegalArgument(
            "compare exchange key cannot be empty".into(),
        ));
    }
    Ok(())
}
