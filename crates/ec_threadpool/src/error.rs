use thiserror::Error;

// -----------------------------------------------------------------------------
// Error

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("failed to spawn worker thread {worker}: {source}")]
    ThreadSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}
