//! CLI exit code registry.
//!
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                         |
//! |------|-------------------------------------------------|
//! | 0    | Success                                         |
//! | 1    | General error                                   |
//! | 2    | Usage error (bad arguments, unreadable file)    |
//! | 3    | Grid conflict (nothing at a position, occupied) |
//! | 4    | Storage error (open, read or save failed)       |

use sheetfield_document::DocumentError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments or an input file that cannot be read.
pub const EXIT_USAGE: u8 = 2;

/// The command named a position that is empty, or a target that is taken.
pub const EXIT_GRID: u8 = 3;

/// The document store could not be opened, read or written.
pub const EXIT_STORAGE: u8 = 4;

pub fn document_exit_code(err: &DocumentError) -> u8 {
    match err {
        DocumentError::NotPlaced(_) | DocumentError::Occupied(_) | DocumentError::WorldRejected(_) => EXIT_GRID,
        DocumentError::Store(_) | DocumentError::SaveFailed(_) => EXIT_STORAGE,
        _ => EXIT_ERROR,
    }
}
