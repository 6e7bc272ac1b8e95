use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per tenant, created on first use. A tenant is the database name
/// a client connects to; each gets its own WAL file and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn wal_file_stem(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        let stem = wal_file_stem(tenant);
        if stem.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        // The entry lock keeps two first connections from opening the same WAL twice.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let engine = Arc::new(Engine::new(self.data_dir.join(format!("{stem}.wal")))?);
        tokio::spawn(compactor::run_compactor(
            Arc::downgrade(&engine),
            self.compact_threshold,
        ));
        entry.or_insert(engine.clone());

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("freqd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenants_have_independent_ledgers() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let a = tm.get_or_create("region_a").unwrap();
        let b = tm.get_or_create("region_b").unwrap();

        let band_id = Ulid::new();
        a.create_band(band_id, "2m".into(), 100, 200, 10).await.unwrap();
        b.create_band(band_id, "2m".into(), 100, 200, 10).await.unwrap();

        let holder = Holder::new("u", "u@example.org", Location::default());
        a.confirm(&[100, 110], &holder).await.unwrap();

        let free_b = b.available_channels(band_id, ChannelRange::new(100, 110)).await.unwrap();
        assert_eq!(free_b, vec![100, 110]);
        let free_a = a.available_channels(band_id, ChannelRange::new(100, 110)).await.unwrap();
        assert!(free_a.is_empty());
    }

    #[tokio::test]
    async fn lazy_creation_writes_wal_file() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same"), 1000);
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _engine = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn name_length_limit() {
        let tm = TenantManager::new(test_data_dir("too_long"), 1000);
        let err = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = TenantManager::new(test_data_dir("count_limit"), 1000);
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
