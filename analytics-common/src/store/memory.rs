use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{EventStore, PathViews, StatsFilter, StoreError};
use crate::event::EventRecord;

/// What the next inserts should fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    Rejected,
}

impl InjectedFailure {
    fn to_error(self) -> StoreError {
        match self {
            InjectedFailure::Unavailable => StoreError::Unavailable(sqlx::Error::PoolTimedOut),
            InjectedFailure::Rejected => StoreError::Rejected(sqlx::Error::Protocol(
                "record rejected by memory store".to_owned(),
            )),
        }
    }
}

#[derive(Default)]
struct State {
    records: Vec<EventRecord>,
    failures: Vec<InjectedFailure>,
    unavailable: bool,
}

/// An in-process `EventStore`, mostly for tests. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lock().records.clone()
    }

    /// Fail the next `count` inserts with `failure`, then go back to normal.
    pub fn fail_next_inserts(&self, count: usize, failure: InjectedFailure) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail every operation, reads included, until turned off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn matching(&self, filter: &StatsFilter) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.lock();
        if state.unavailable {
            return Err(InjectedFailure::Unavailable.to_error());
        }

        Ok(state
            .records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(InjectedFailure::Unavailable.to_error());
        }
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0).to_error());
        }
        state.records.push(record.clone());

        Ok(())
    }

    async fn count(&self, filter: &StatsFilter) -> Result<i64, StoreError> {
        Ok(self.matching(filter)?.len() as i64)
    }

    async fn unique_users(&self, filter: &StatsFilter) -> Result<i64, StoreError> {
        let records = self.matching(filter)?;
        let users: HashSet<&str> = records
            .iter()
            .filter_map(|record| record.user_id.as_deref())
            .filter(|user_id| !user_id.is_empty())
            .collect();

        Ok(users.len() as i64)
    }

    async fn top_paths(
        &self,
        filter: &StatsFilter,
        limit: usize,
    ) -> Result<Vec<PathViews>, StoreError> {
        let mut views: HashMap<String, i64> = HashMap::new();
        for record in self.matching(filter)? {
            *views.entry(record.path).or_default() += 1;
        }

        let mut paths: Vec<PathViews> = views
            .into_iter()
            .map(|(path, views)| PathViews { path, views })
            .collect();
        paths.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
        paths.truncate(limit);

        Ok(paths)
    }
}
