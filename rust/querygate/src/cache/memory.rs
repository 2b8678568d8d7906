use super::store::{CacheError, CacheStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// In-process stand-in for Valkey. Sorted sets keep members in lexical order, which is
/// what the server does when every score is 0. Scans hand out at most `page_size`
/// members per cursor step, with the cursor being the offset of the next member.
#[derive(Default)]
pub struct InMemoryCacheStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    strings: BTreeMap<String, String>,
    sorted_sets: BTreeMap<String, BTreeSet<String>>,
    scan_pages: usize,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().strings.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().strings.keys().cloned().collect()
    }

    pub fn members(&self, index: &str) -> Vec<String> {
        self.inner
            .lock()
            .sorted_sets
            .get(index)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of cursor steps served so far.
    pub fn scan_pages(&self) -> usize {
        self.inner.lock().scan_pages
    }

    /// Writes raw entries, bypassing the reconciler.
    pub fn seed(&self, data_key: &str, json: &str, index: &str, member: &str) {
        let mut inner = self.inner.lock();
        inner.strings.insert(data_key.to_string(), json.to_string());
        inner
            .sorted_sets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string());
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn scan_page(
        &self,
        index: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut inner = self.inner.lock();
        inner.scan_pages += 1;
        let offset = usize::try_from(cursor)
            .map_err(|_| CacheError::Other(format!("invalid scan cursor {cursor}")))?;
        let Some(set) = inner.sorted_sets.get(index) else {
            return Ok((0, Vec::new()));
        };
        let page: Vec<String> = set.iter().skip(offset).take(page_size.max(1)).cloned().collect();
        let consumed = offset + page.len();
        let next = if consumed < set.len() { consumed as u64 } else { 0 };
        Ok((next, page))
    }

    async fn upsert_entry(
        &self,
        data_key: &str,
        json: &str,
        index: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        self.seed(data_key, json, index, member);
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.strings.remove(key);
        }
        Ok(())
    }

    async fn remove_members(&self, index: &str, members: &[String]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.sorted_sets.get_mut(index) {
            for member in members {
                set.remove(member);
            }
            if set.is_empty() {
                inner.sorted_sets.remove(index);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
