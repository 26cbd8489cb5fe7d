//! An embedded, TTL-bound KV store for request counters.
//!
//! Grounded on `internal/limiter/backend.go`'s `BackendService`/`Worker`
//! pair in the original source: `open`/`get`/`update`/`batch_update` mirror
//! `StartBackend`/`Get`/`Update`/`BatchUpdate`, and the compaction worker
//! mirrors `Worker.Run`'s self-adjusting sleep and two-phase shutdown
//! handshake. The backing engine is `sled` rather than `buntdb` since the
//! Rust ecosystem has no equivalent embedded store with native per-key TTL;
//! TTL is therefore derived from the bucket's own `bucket_start` field both
//! on read and during compaction (see §4.5 of the specification).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::counters::{RequestCounters, now};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("failed to open counter store at {path}: {source}")]
	Open {
		path: String,
		#[source]
		source: sled::Error,
	},
	#[error("batch_update received {keys} keys but {counters} counters")]
	BatchLengthMismatch { keys: usize, counters: usize },
	#[error("storage error: {0}")]
	Storage(#[from] sled::Error),
	#[error("transaction error: {0}")]
	Transaction(String),
}

/// The embedded counter store. Cheap to clone; internally `Arc`-backed.
#[derive(Clone)]
pub struct CounterStore {
	db: sled::Db,
	expire_time_secs: u64,
	// Serializes the read-modify-write sequence a caller performs across
	// get() -> policy check -> batch_update() so concurrent requests for
	// the same principal cannot silently lose increments. See §5 of the
	// specification: "the counter store must provide serializable
	// transactions". A single store-wide mutex is the simplest correct
	// implementation of the "acceptable implementation" named there.
	write_lock: Arc<Mutex<()>>,
}

/// RAII guard held across a read-modify-write sequence.
pub struct WriteGuard<'a>(parking_lot::MutexGuard<'a, ()>);

impl CounterStore {
	/// Open or create the on-disk store at `path`. Idempotent.
	pub fn open(path: impl AsRef<Path>, expire_time_secs: u64) -> Result<Self, StoreError> {
		let path_str = path.as_ref().display().to_string();
		let db = sled::open(path.as_ref()).map_err(|source| StoreError::Open {
			path: path_str,
			source,
		})?;
		Ok(Self {
			db,
			expire_time_secs,
			write_lock: Arc::new(Mutex::new(())),
		})
	}

	/// Acquire the serialization guard for a single request's
	/// get -> check -> batch_update sequence.
	pub fn lock(&self) -> WriteGuard<'_> {
		WriteGuard(self.write_lock.lock())
	}

	/// Fetch the counters for `key`. Never reports "not found" to the
	/// caller: a miss, a corrupt record, or an expired bucket all yield a
	/// fresh, empty bucket starting now (fail-open per §7).
	pub fn get(&self, key: &str) -> RequestCounters {
		match self.try_get(key) {
			Ok(Some(counters)) => counters,
			Ok(None) => RequestCounters::fresh(),
			Err(err) => {
				warn!(key, error = %err, "counter store read failed; using a fresh bucket");
				RequestCounters::fresh()
			},
		}
	}

	fn try_get(&self, key: &str) -> Result<Option<RequestCounters>, StoreError> {
		let Some(bytes) = self.db.get(key)? else {
			return Ok(None);
		};
		let counters = match RequestCounters::deserialize(&bytes) {
			Ok(c) => c,
			Err(_) => return Ok(None),
		};
		if self.is_expired(&counters) {
			return Ok(None);
		}
		Ok(Some(counters))
	}

	fn is_expired(&self, counters: &RequestCounters) -> bool {
		now().saturating_sub(counters.bucket_start) >= self.expire_time_secs
	}

	/// Write `counters` under `key` with TTL pinned to the bucket's birth.
	/// A TTL that has already elapsed writes the record and immediately
	/// removes it again, matching the "accept a zero TTL" requirement.
	pub fn update(&self, key: &str, counters: &RequestCounters) -> Result<(), StoreError> {
		self.db.insert(key, counters.serialize())?;
		if self.is_expired(counters) {
			self.db.remove(key)?;
		}
		Ok(())
	}

	/// Atomically write N key/counter pairs in one transaction.
	pub fn batch_update(&self, keys: &[String], counters: &[RequestCounters]) -> Result<(), StoreError> {
		if keys.len() != counters.len() {
			return Err(StoreError::BatchLengthMismatch {
				keys: keys.len(),
				counters: counters.len(),
			});
		}

		let expired: Vec<bool> = counters.iter().map(|c| self.is_expired(c)).collect();
		self
			.db
			.transaction(|tx| {
				for (key, counters) in keys.iter().zip(counters.iter()) {
					tx.insert(key.as_bytes(), counters.serialize())?;
				}
				Ok(())
			})
			.map_err(|e: sled::transaction::TransactionError<sled::Error>| StoreError::Transaction(e.to_string()))?;

		for (key, was_expired) in keys.iter().zip(expired.into_iter()) {
			if was_expired {
				self.db.remove(key)?;
			}
		}
		Ok(())
	}

	/// Remove entries whose bucket has expired. Returns the number removed.
	fn compact(&self) -> Result<usize, StoreError> {
		let mut removed = 0;
		let mut expired_keys = Vec::new();
		for item in self.db.iter() {
			let (key, value) = item?;
			if let Ok(counters) = RequestCounters::deserialize(&value) {
				if self.is_expired(&counters) {
					expired_keys.push(key);
				}
			}
		}
		for key in expired_keys {
			self.db.remove(key)?;
			removed += 1;
		}
		Ok(removed)
	}
}

/// Handle to a running compaction worker; `shutdown` performs the two-phase
/// handshake described in §4.5/§5 of the specification.
pub struct CompactionWorkerHandle {
	shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl CompactionWorkerHandle {
	/// Request the worker stop and wait for its acknowledgment. No
	/// in-flight compaction pass is interrupted.
	pub async fn shutdown(self) {
		let (ack_tx, ack_rx) = oneshot::channel();
		if self.shutdown_tx.send(ack_tx).await.is_ok() {
			let _ = ack_rx.await;
		}
	}
}

/// Spawn the background compaction worker. It wakes on `interval`, scans
/// for expired buckets, and self-adjusts its sleep so the period between
/// wakes never drifts even though compaction itself takes time.
pub fn spawn_compaction_worker(store: CounterStore, interval: Duration) -> CompactionWorkerHandle {
	let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<oneshot::Sender<()>>(1);

	tokio::spawn(async move {
		let mut sleep_for = interval;
		loop {
			tokio::select! {
				ack = shutdown_rx.recv() => {
					if let Some(ack) = ack {
						let _ = ack.send(());
					}
					return;
				}
				_ = tokio::time::sleep(sleep_for) => {}
			}

			let started = Instant::now();
			match store.compact() {
				Ok(removed) => debug!(removed, "compaction pass complete"),
				Err(err) => warn!(error = %err, "compaction pass failed"),
			}
			let elapsed = started.elapsed();
			sleep_for = interval.saturating_sub(elapsed);
			if sleep_for.is_zero() {
				info!("compaction pass took longer than the interval; waking immediately");
			}
		}
	});

	CompactionWorkerHandle { shutdown_tx }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open_temp() -> (tempfile::TempDir, CounterStore) {
		let dir = tempfile::tempdir().unwrap();
		let store = CounterStore::open(dir.path(), 60).unwrap();
		(dir, store)
	}

	#[test]
	fn miss_returns_fresh_bucket() {
		let (_dir, store) = open_temp();
		let counters = store.get("nobody");
		assert_eq!(counters.global, 0);
	}

	#[test]
	fn update_then_get_round_trips() {
		let (_dir, store) = open_temp();
		let mut c = RequestCounters::fresh();
		c.record_request(Some("items"), None, "SELECT");
		store.update("u1", &c).unwrap();
		let back = store.get("u1");
		assert_eq!(back.global, 1);
	}

	#[test]
	fn batch_update_writes_all_keys_atomically() {
		let (_dir, store) = open_temp();
		let mut a = RequestCounters::fresh();
		a.record_request(Some("items"), None, "SELECT");
		let mut b = RequestCounters::fresh();
		b.record_request(None, Some("recompute"), "SELECT");

		store
			.batch_update(&["10.0.0.1".to_string(), "anon".to_string()], &[a.clone(), b.clone()])
			.unwrap();

		assert_eq!(store.get("10.0.0.1").global, 1);
		assert_eq!(store.get("anon").function, 1);
	}

	#[test]
	fn batch_update_rejects_length_mismatch() {
		let (_dir, store) = open_temp();
		let err = store.batch_update(&["a".to_string()], &[]).unwrap_err();
		assert!(matches!(err, StoreError::BatchLengthMismatch { .. }));
	}

	#[test]
	fn expired_bucket_reads_as_miss() {
		let (_dir, store) = open_temp();
		let mut c = RequestCounters::fresh();
		c.bucket_start = 0; // long expired
		c.global = 99;
		store.update("u1", &c).unwrap();
		let back = store.get("u1");
		assert_eq!(back.global, 0);
	}

	#[tokio::test]
	async fn compaction_removes_expired_entries() {
		let (_dir, store) = open_temp();
		let mut c = RequestCounters::fresh();
		c.bucket_start = 0;
		store.update("stale", &c).unwrap();

		let handle = spawn_compaction_worker(store.clone(), Duration::from_millis(5));
		tokio::time::sleep(Duration::from_millis(50)).await;
		handle.shutdown().await;

		assert_eq!(store.db.get("stale").unwrap(), None);
	}
}
