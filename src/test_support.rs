// Shared test fixtures: a deterministic embedding gateway and a seeded
// database. Compiled only for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use crate::database::DatabaseManager;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{EmbeddingGateway, ExtractionRequest};

type Responder = Box<dyn FnMut(i64, &ExtractionRequest) -> EngineResult<Vec<f32>> + Send>;

/// Scriptable gateway double. Calls are counted; responses come from a
/// closure so tests can fail selectively or trigger side effects.
pub struct MockGateway {
    responder: Mutex<Responder>,
    calls: AtomicUsize,
}

impl MockGateway {
    pub fn with(
        responder: impl FnMut(i64, &ExtractionRequest) -> EngineResult<Vec<f32>> + Send + 'static,
    ) -> Self {
        Self {
            responder: Mutex::new(Box::new(responder)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always returns the same embedding.
    pub fn returning(embedding: Vec<f32>) -> Self {
        Self::with(move |_, _| Ok(embedding.clone()))
    }

    /// Fails the first `failures` calls, then returns the embedding.
    pub fn failing_first(failures: usize, embedding: Vec<f32>) -> Self {
        let mut remaining = failures;
        Self::with(move |_, _| {
            if remaining > 0 {
                remaining -= 1;
                Err(EngineError::ExtractionFailed("gateway unavailable".to_string()))
            } else {
                Ok(embedding.clone())
            }
        })
    }

    /// Always fails.
    pub fn unavailable() -> Self {
        Self::with(|_, _| Err(EngineError::ExtractionFailed("gateway unavailable".to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingGateway for MockGateway {
    async fn extract(
        &self,
        recording_id: i64,
        request: ExtractionRequest,
    ) -> EngineResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responder = self
            .responder
            .lock()
            .map_err(|e| EngineError::ExtractionFailed(format!("mock poisoned: {e}")))?;
        responder(recording_id, &request)
    }
}

/// Fresh database with one recording (id 1) already present.
pub fn seeded_db() -> (TempDir, DatabaseManager) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();
    db.create_recording(1, "seeded recording").unwrap();
    (dir, db)
}
