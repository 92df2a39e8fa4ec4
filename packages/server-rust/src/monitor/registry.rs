//! Concurrent store of observed service instances.

use dashmap::DashMap;
use microbus_core::ServiceRecord;

/// Records keyed by instance id. Shared by every discovery window and
/// listener; all operations are safe to interleave.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: DashMap<String, ServiceRecord>,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record. Returns `true` if the id was not known.
    pub fn upsert(&self, record: ServiceRecord) -> bool {
        self.records.insert(record.id.clone(), record).is_none()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<ServiceRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Removes every record running on the given client connection.
    ///
    /// When both the record and the advisory name an account they must
    /// agree: client ids are only unique per account on a shared server.
    pub fn remove_by_client(&self, client_id: u64, account: Option<&str>) -> Vec<ServiceRecord> {
        let ids: Vec<String> = self
            .records
            .iter()
            .filter(|entry| {
                entry.value().connection.as_ref().is_some_and(|conn| {
                    conn.client_id == client_id
                        && match (conn.account.as_deref(), account) {
                            (Some(ours), Some(theirs)) => ours == theirs,
                            _ => true,
                        }
                })
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed: Vec<ServiceRecord> = ids.iter().filter_map(|id| self.remove(id)).collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));
        removed
    }

    pub fn clear(&self) {
        self.records.clear();
    }

    /// All records, sorted by service name then instance id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
