//! The fixed set of partitions a run locks into.

use std::sync::Arc;

use gcprobe_kv::SchemaResolver;
use gcprobe_types::TableId;
use tracing::info;

use crate::Result;

/// Name of the `index`-th partition.
pub fn table_name(index: usize) -> String {
    format!("t{index}")
}

/// Partition ids, resolved once before the first round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    tables: Arc<[TableId]>,
}

impl KeySpace {
    pub fn new(tables: impl Into<Arc<[TableId]>>) -> Self {
        Self {
            tables: tables.into(),
        }
    }

    /// Resolves `t0..t{count-1}` in `db`, one at a time.
    pub async fn resolve<S: SchemaResolver>(resolver: &S, db: &str, count: usize) -> Result<Self> {
        let mut tables = Vec::with_capacity(count);
        for index in 0..count {
            tables.push(resolver.table_id(db, &table_name(index)).await?);
        }
        info!(db, partitions = tables.len(), "resolved key space");
        Ok(Self::new(tables))
    }

    pub fn tables(&self) -> Arc<[TableId]> {
        Arc::clone(&self.tables)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcprobe_kv::SimCluster;

    #[tokio::test]
    async fn test_resolves_partitions_in_order() {
        let sim = SimCluster::new();
        let existing = sim.create_table("t1");

        let keyspace = KeySpace::resolve(&sim, "resolve_lock", 3).await.unwrap();
        assert_eq!(keyspace.len(), 3);

        let tables = keyspace.tables();
        assert_eq!(tables[1], existing);
        assert_ne!(tables[0], tables[2]);
        assert_eq!(sim.region_count(), 4);
    }

    #[tokio::test]
    async fn test_empty_key_space() {
        let sim = SimCluster::new();
        let keyspace = KeySpace::resolve(&sim, "resolve_lock", 0).await.unwrap();
        assert!(keyspace.is_empty());
    }
}
