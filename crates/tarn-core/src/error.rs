//! Error types for the Tarn chain-state engine.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderTreeError {
    #[error("unknown parent header: {0}")] UnknownParent(String),
    #[error("duplicate header: {0}")] DuplicateHeader(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderStoreError {
    #[error("genesis record missing")] GenesisMissing,
    #[error("genesis mismatch: expected {expected}, got {got}")] GenesisMismatch { expected: String, got: String },
    #[error("corrupt header record at height {height}")] CorruptRecord { height: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("cannot rewind past genesis")] RewindAtGenesis,
    #[error("rewind data missing for height {0}")] RewindDataMissing(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("finality violation: rewind index floor {floor} above finalized height {finalized}")]
    FinalityViolation { floor: u64, finalized: u64 },
    #[error("broken header chain at height {height}")] BrokenHeaderChain { height: u64 },
}

#[derive(Error, Debug)]
pub enum TarnError {
    #[error(transparent)] HeaderTree(#[from] HeaderTreeError),
    #[error(transparent)] HeaderStore(#[from] HeaderStoreError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error(transparent)] Consistency(#[from] ConsistencyError),
    #[error("storage: {0}")] Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_variants_display() {
        let errors: Vec<String> = vec![
            HeaderStoreError::GenesisMissing.to_string(),
            HeaderStoreError::CorruptRecord { height: 7 }.to_string(),
            ChainStateError::HeightMismatch { expected: 2, got: 5 }.to_string(),
            ChainStateError::RewindAtGenesis.to_string(),
            ConsistencyError::FinalityViolation { floor: 90, finalized: 80 }.to_string(),
            ConsistencyError::BrokenHeaderChain { height: 3 }.to_string(),
        ];
        for shown in &errors {
            assert!(!shown.is_empty());
        }
    }

    #[test]
    fn error_eq() {
        assert_eq!(ChainStateError::RewindAtGenesis, ChainStateError::RewindAtGenesis);
        assert_ne!(
            ChainStateError::HeightMismatch { expected: 1, got: 2 },
            ChainStateError::HeightMismatch { expected: 1, got: 3 },
        );
    }

    #[test]
    fn top_level_error_wraps_transparently() {
        let err: TarnError = ChainStateError::RewindAtGenesis.into();
        assert_eq!(err.to_string(), "cannot rewind past genesis");
    }
}
