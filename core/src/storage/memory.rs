//! In-memory backend
//!
//! Rows live in per-table ordered maps keyed by id. Plans are always
//! evaluated with the fallback filter, which is the reference semantics the
//! SQL backends are tested against.

use super::{record_id, strip_hidden, PredicatePlan, RecordScope, Storage, StorageError, StorageResult};
use crate::interpreter::types::{Record, RecordSchema, Val, ID_FIELD, TENANT_FIELD};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct Table {
    /// Last id handed out; ids are never reused
    last_id: i64,
    rows: BTreeMap<i64, Record>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: BTreeMap<String, Table>,
    state: Option<Val>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Snapshot,
    /// Copy taken at `begin`, restored on `rollback`
    saved: Option<Snapshot>,
    depth: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&mut self, schema: &RecordSchema) -> &mut Table {
        self.data.tables.entry(schema.table_name()).or_default()
    }

    fn matching_ids(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> Vec<i64> {
        self.table(schema)
            .rows
            .iter()
            .filter(|(_, row)| scope.admits(schema, row) && plan.matches(row))
            .map(|(id, _)| *id)
            .collect()
    }

    fn insert(&mut self, schema: &RecordSchema, mut row: Record, scope: &RecordScope) -> Record {
        if let Some(tenant) = scope.column_value(schema) {
            row.insert(TENANT_FIELD.to_string(), tenant);
        }
        let table = self.table(schema);
        table.last_id += 1;
        let id = table.last_id;
        row.insert(ID_FIELD.to_string(), Val::Num(id as f64));
        table.rows.insert(id, row.clone());
        strip_hidden(row)
    }
}

impl Storage for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn begin(&mut self) -> StorageResult<()> {
        if self.depth == 0 {
            self.saved = Some(self.data.clone());
        }
        self.depth += 1;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        match self.depth {
            0 => Err(StorageError::NoTransaction("commit")),
            1 => {
                self.depth = 0;
                self.saved = None;
                Ok(())
            }
            _ => {
                self.depth -= 1;
                Ok(())
            }
        }
    }

    fn rollback(&mut self) -> StorageResult<()> {
        let saved = self.saved.take().ok_or(StorageError::NoTransaction("roll back"))?;
        self.data = saved;
        self.depth = 0;
        Ok(())
    }

    fn create(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record> {
        let row = schema.normalize_record(values)?;
        Ok(self.insert(schema, row, scope))
    }

    fn find(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>> {
        let ids = self.matching_ids(schema, plan, scope);
        let table = self.table(schema);
        Ok(ids
            .into_iter()
            .filter_map(|id| table.rows.get(&id).cloned())
            .map(strip_hidden)
            .collect())
    }

    fn update(
        &mut self,
        schema: &RecordSchema,
        plan: &PredicatePlan,
        changes: &Record,
        scope: &RecordScope,
    ) -> StorageResult<Vec<Record>> {
        let changes = schema.normalize_changes(changes)?;
        let ids = self.matching_ids(schema, plan, scope);
        let table = self.table(schema);
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = table.rows.get_mut(&id) {
                row.extend(changes.clone());
                updated.push(strip_hidden(row.clone()));
            }
        }
        Ok(updated)
    }

    fn delete(&mut self, schema: &RecordSchema, plan: &PredicatePlan, scope: &RecordScope) -> StorageResult<Vec<Record>> {
        let ids = self.matching_ids(schema, plan, scope);
        let table = self.table(schema);
        Ok(ids
            .into_iter()
            .filter_map(|id| table.rows.remove(&id))
            .map(strip_hidden)
            .collect())
    }

    fn save(&mut self, schema: &RecordSchema, values: &Record, scope: &RecordScope) -> StorageResult<Record> {
        let mut row = schema.normalize_record(values)?;
        let existing = record_id(values).filter(|id| {
            self.table(schema)
                .rows
                .get(id)
                .is_some_and(|r| scope.admits(schema, r))
        });
        let Some(id) = existing else {
            return Ok(self.insert(schema, row, scope));
        };
        row.insert(ID_FIELD.to_string(), Val::Num(id as f64));
        if let Some(tenant) = scope.column_value(schema) {
            row.insert(TENANT_FIELD.to_string(), tenant);
        }
        self.table(schema).rows.insert(id, row.clone());
        Ok(strip_hidden(row))
    }

    fn load_state(&mut self) -> StorageResult<Option<Val>> {
        Ok(self.data.state.clone())
    }

    fn save_state(&mut self, state: &Val) -> StorageResult<()> {
        self.data.state = Some(state.clone());
        Ok(())
    }
}
