//! In-memory storage driver.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use rand::RngCore;

use crate::{
    document::Document,
    error::StorageError,
    keys::{base32, AuthorAddress, ShareAddress},
    query::Query,
    store::{DocDriver, CONFIG_SCHEMA_VERSION, CONFIG_SHARE, SCHEMA_VERSION},
};

/// An in-memory [`DocDriver`].
///
/// Documents are stored by path, then author. Cheap to clone; all clones see
/// the same store.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    share: ShareAddress,
    storage_id: String,
    state: std::sync::Arc<RwLock<State>>,
}

#[derive(Debug, Default)]
struct State {
    /// path -> author -> the single surviving document.
    docs: BTreeMap<String, BTreeMap<AuthorAddress, Document>>,
    config: HashMap<String, String>,
    max_local_index: u64,
    closed: bool,
}

impl MemoryDriver {
    /// Create an empty driver for a share.
    pub fn new(share: ShareAddress) -> Self {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let mut state = State::default();
        state
            .config
            .insert(CONFIG_SHARE.to_string(), share.to_string());
        state
            .config
            .insert(CONFIG_SCHEMA_VERSION.to_string(), SCHEMA_VERSION.to_string());
        MemoryDriver {
            share,
            storage_id: base32::fmt(id_bytes),
            state: std::sync::Arc::new(RwLock::new(state)),
        }
    }

    fn read(&self) -> Result<parking_lot::RwLockReadGuard<'_, State>, StorageError> {
        let state = self.state.read();
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(state)
    }

    fn write(&self) -> Result<parking_lot::RwLockWriteGuard<'_, State>, StorageError> {
        let state = self.state.write();
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(state)
    }
}

impl DocDriver for MemoryDriver {
    fn share(&self) -> &ShareAddress {
        &self.share
    }

    fn storage_id(&self) -> String {
        self.storage_id.clone()
    }

    fn max_local_index(&self) -> Result<u64, StorageError> {
        Ok(self.read()?.max_local_index)
    }

    fn get(
        &self,
        path: &str,
        author: &AuthorAddress,
    ) -> Result<Option<Document>, StorageError> {
        let state = self.read()?;
        Ok(state
            .docs
            .get(path)
            .and_then(|authors| authors.get(author))
            .cloned())
    }

    fn query_docs(&self, query: &Query, now: u64) -> Result<Vec<Document>, StorageError> {
        let state = self.read()?;
        let docs = state
            .docs
            .values()
            .flat_map(|authors| authors.values().cloned())
            .collect::<Vec<_>>();
        Ok(crate::query::run_query(docs, query, now))
    }

    fn upsert(&self, mut doc: Document) -> Result<Document, StorageError> {
        let mut state = self.write()?;
        state.max_local_index += 1;
        doc.local_index = state.max_local_index;
        state
            .docs
            .entry(doc.path.clone())
            .or_default()
            .insert(doc.author.clone(), doc.clone());
        Ok(doc)
    }

    fn purge_expired(&self, now: u64) -> Result<usize, StorageError> {
        let mut state = self.write()?;
        let mut removed = 0;
        for authors in state.docs.values_mut() {
            let before = authors.len();
            authors.retain(|_, doc| !doc.is_expired(now));
            removed += before - authors.len();
        }
        state.docs.retain(|_, authors| !authors.is_empty());
        Ok(removed)
    }

    fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write()?
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read()?.config.get(key).cloned())
    }

    fn delete_config(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.write()?.config.remove(key).is_some())
    }

    fn list_config_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.read()?.config.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    fn close(&self, erase: bool) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if erase {
            state.docs.clear();
            state.config.clear();
            state.max_local_index = 0;
        }
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        document::DocSignature,
        keys::AuthorKeypair,
        query::{OrderBy, Query},
        validation::{FmtD1, FormatValidator, FORMAT_D1},
    };

    const NOW: u64 = 1_700_000_000_000_000;

    fn share() -> ShareAddress {
        "+test.pals".parse().unwrap()
    }

    fn signed(kp: &AuthorKeypair, path: &str, content: &[u8], timestamp: u64) -> Document {
        FmtD1
            .sign(
                kp,
                Document {
                    format: FORMAT_D1.into(),
                    share: share(),
                    path: path.into(),
                    author: kp.address(),
                    timestamp,
                    delete_after: None,
                    content: Bytes::copy_from_slice(content),
                    content_hash: String::new(),
                    signature: DocSignature::default(),
                    local_index: 0,
                },
            )
            .unwrap()
    }

    #[test]
    fn upsert_assigns_increasing_local_indexes() {
        let driver = MemoryDriver::new(share());
        let kp = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();

        for i in 1..=5u64 {
            let doc = signed(&kp, &format!("/doc/{i}"), b"x", NOW + i);
            let stored = driver.upsert(doc).unwrap();
            assert_eq!(stored.local_index, i);
        }
        assert_eq!(driver.max_local_index().unwrap(), 5);

        // Overwrites keep counting; indexes are never reused.
        let doc = signed(&kp, "/doc/1", b"y", NOW + 10);
        assert_eq!(driver.upsert(doc).unwrap().local_index, 6);
        assert_eq!(driver.max_local_index().unwrap(), 6);
    }

    #[test]
    fn upsert_replaces_per_path_and_author() {
        let driver = MemoryDriver::new(share());
        let suzy = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();
        let devy = AuthorKeypair::generate(&mut rand::thread_rng(), "devy").unwrap();

        driver.upsert(signed(&suzy, "/x", b"1", NOW)).unwrap();
        driver.upsert(signed(&devy, "/x", b"2", NOW + 1)).unwrap();
        driver.upsert(signed(&suzy, "/x", b"3", NOW + 2)).unwrap();

        let docs = driver.query_docs(&Query::all().build(), NOW + 10).unwrap();
        assert_eq!(docs.len(), 2);
        let suzys = driver.get("/x", &suzy.address()).unwrap().unwrap();
        assert_eq!(suzys.content, Bytes::from_static(b"3"));
    }

    #[test]
    fn query_latest_mode_groups_before_filtering() {
        let driver = MemoryDriver::new(share());
        let suzy = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();
        let devy = AuthorKeypair::generate(&mut rand::thread_rng(), "devy").unwrap();

        driver.upsert(signed(&suzy, "/x", b"1", NOW + 10)).unwrap();
        driver.upsert(signed(&devy, "/x", b"2", NOW + 20)).unwrap();

        // Latest mode returns only devy's winner.
        let latest = driver
            .query_docs(&Query::latest_per_path().path_exact("/x").build(), NOW + 100)
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].author, devy.address());

        // An author filter for the loser must not resurrect it.
        let filtered = driver
            .query_docs(
                &Query::latest_per_path()
                    .path_exact("/x")
                    .author(suzy.address())
                    .build(),
                NOW + 100,
            )
            .unwrap();
        assert!(filtered.is_empty());

        // History mode does see both.
        let all = driver
            .query_docs(&Query::all().path_exact("/x").build(), NOW + 100)
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn query_ordering_and_cursor() {
        let driver = MemoryDriver::new(share());
        let kp = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();

        driver.upsert(signed(&kp, "/b", b"1", NOW + 1)).unwrap();
        driver.upsert(signed(&kp, "/a", b"2", NOW + 2)).unwrap();
        driver.upsert(signed(&kp, "/c", b"3", NOW + 3)).unwrap();

        let by_path = driver
            .query_docs(&Query::all().build(), NOW + 100)
            .unwrap();
        let paths: Vec<&str> = by_path.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["/a", "/b", "/c"]);

        let by_index = driver
            .query_docs(
                &Query::all().order_by(OrderBy::LocalIndexAsc).build(),
                NOW + 100,
            )
            .unwrap();
        let indexes: Vec<u64> = by_index.iter().map(|d| d.local_index).collect();
        assert_eq!(indexes, [1, 2, 3]);

        // Cursor pagination over local index.
        let page = driver
            .query_docs(
                &Query::all()
                    .order_by(OrderBy::LocalIndexAsc)
                    .start_after_local_index(1)
                    .limit(1)
                    .build(),
                NOW + 100,
            )
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].local_index, 2);

        // Cursor pagination over path.
        let page = driver
            .query_docs(&Query::all().start_after_path("/a").build(), NOW + 100)
            .unwrap();
        let paths: Vec<&str> = page.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["/b", "/c"]);
    }

    #[test]
    fn query_filters_by_content_length() {
        let driver = MemoryDriver::new(share());
        let kp = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();

        driver.upsert(signed(&kp, "/short", b"hi", NOW)).unwrap();
        driver.upsert(signed(&kp, "/medium", b"hello!", NOW + 1)).unwrap();
        driver
            .upsert(signed(&kp, "/long", b"hello world!", NOW + 2))
            .unwrap();

        // Both bounds are strict.
        let bigger = driver
            .query_docs(&Query::all().content_length_gt(2).build(), NOW + 10)
            .unwrap();
        let paths: Vec<&str> = bigger.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["/long", "/medium"]);

        let window = driver
            .query_docs(
                &Query::all()
                    .content_length_gt(2)
                    .content_length_lt(12)
                    .build(),
                NOW + 10,
            )
            .unwrap();
        let paths: Vec<&str> = window.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, ["/medium"]);
    }

    #[test]
    fn expired_docs_are_invisible_and_purgeable() {
        let driver = MemoryDriver::new(share());
        let kp = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();

        let mut doc = Document {
            format: FORMAT_D1.into(),
            share: share(),
            path: "/chat/!hello".into(),
            author: kp.address(),
            timestamp: NOW,
            delete_after: Some(NOW + 1_000),
            content: Bytes::from_static(b"hi"),
            content_hash: String::new(),
            signature: DocSignature::default(),
            local_index: 0,
        };
        doc = FmtD1.sign(&kp, doc).unwrap();
        driver.upsert(doc).unwrap();
        driver.upsert(signed(&kp, "/keep", b"k", NOW)).unwrap();

        // Visible before expiry, filtered after.
        let docs = driver.query_docs(&Query::all().build(), NOW + 500).unwrap();
        assert_eq!(docs.len(), 2);
        let docs = driver
            .query_docs(&Query::all().build(), NOW + 2_000)
            .unwrap();
        assert_eq!(docs.len(), 1);

        assert_eq!(driver.purge_expired(NOW + 2_000).unwrap(), 1);
        // The purge is physical: the path bucket is gone too.
        assert!(driver.get("/chat/!hello", &kp.address()).unwrap().is_none());
    }

    #[test]
    fn config_roundtrip() {
        let driver = MemoryDriver::new(share());
        assert_eq!(
            driver.get_config(CONFIG_SHARE).unwrap().as_deref(),
            Some("+test.pals")
        );
        driver.set_config("display-name", "My Garden").unwrap();
        assert_eq!(
            driver.get_config("display-name").unwrap().as_deref(),
            Some("My Garden")
        );
        assert!(driver.delete_config("display-name").unwrap());
        assert!(!driver.delete_config("display-name").unwrap());
        assert_eq!(
            driver.list_config_keys().unwrap(),
            vec![CONFIG_SCHEMA_VERSION.to_string(), CONFIG_SHARE.to_string()]
        );
    }

    #[test]
    fn closed_driver_fails_predictably() {
        let driver = MemoryDriver::new(share());
        let kp = AuthorKeypair::generate(&mut rand::thread_rng(), "suzy").unwrap();
        driver.close(false).unwrap();
        assert!(driver.is_closed());
        assert!(matches!(
            driver.max_local_index(),
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            driver.upsert(signed(&kp, "/x", b"1", NOW)),
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            driver.get_config(CONFIG_SHARE),
            Err(StorageError::Closed)
        ));
        // Closing again is fine.
        driver.close(false).unwrap();
    }
}
