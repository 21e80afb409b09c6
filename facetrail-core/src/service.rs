//! Process-wide recognizer handle, built on first use.

use crate::config::Config;
use crate::{Error, Recognizer};
use std::sync::{Arc, Mutex};

type Factory = Box<dyn Fn() -> Result<Recognizer, Error> + Send + Sync>;

/// Lazily constructed, shared [`Recognizer`].
///
/// The first `get()` builds the recognizer and loads the database;
/// concurrent callers wait for that one construction and every
/// caller gets the same instance. A failed construction is not cached.
pub struct SharedRecognizer {
    factory: Factory,
    slot: Mutex<Option<Arc<Recognizer>>>,
}

impl SharedRecognizer {
    pub fn new(config: Config) -> Self {
        Self::with_factory(move || Recognizer::new(config.clone()))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Recognizer, Error> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Result<Arc<Recognizer>, Error> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| {
            log::warn!("Recognizer slot poisoned, continuing");
            poisoned.into_inner()
        });

        if let Some(recognizer) = slot.as_ref() {
            return Ok(Arc::clone(recognizer));
        }

        log::debug!("Initializing shared recognizer");
        let recognizer = Arc::new((self.factory)()?);
        *slot = Some(Arc::clone(&recognizer));
        Ok(recognizer)
    }

    pub fn is_initialized(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or_else(|poisoned| poisoned.into_inner().is_some())
    }
}
