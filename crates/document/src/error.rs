use sheetfield_engine::history::HistoryError;
use sheetfield_engine::position::{Identity, Position};
use sheetfield_engine::sheet::EditError;
use sheetfield_io::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error("no sheet at {0}")]
    NotPlaced(Position),
    #[error("{0} is already occupied")]
    Occupied(Position),
    #[error("sheet at {0} is not materialized")]
    NotMaterialized(Position),
    #[error("sheet {0} is still placed")]
    StillPlaced(Identity),
    #[error("world edit rejected: {0}")]
    WorldRejected(String),
    #[error("save failed: {0}")]
    SaveFailed(String),
    #[error("failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DocumentError>;
