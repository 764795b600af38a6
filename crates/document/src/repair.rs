//! Orphan repair: stored sheets that nothing points at.
//!
//! A crash between writing a new sheet's record and writing the world index
//! leaves a record no position names. Such records are placed in a scratch
//! region of the grid instead of being deleted.

use rustc_hash::FxHashSet;

use sheetfield_config::SCRATCH_WIDTH;
use sheetfield_engine::position::{Identity, Position, WORLD_LIMIT};
use sheetfield_engine::world_ops::World;

/// Stored identities that are neither placed nor reachable through world
/// undo/redo (a removed sheet kept for undo is not an orphan).
pub fn find_orphans(stored: &[Identity], world: &World) -> Vec<Identity> {
    let referenced: FxHashSet<Identity> = world.referenced_identities().into_iter().collect();
    let mut orphans: Vec<Identity> = stored
        .iter()
        .copied()
        .filter(|id| !world.index().is_placed(*id) && !referenced.contains(id))
        .collect();
    orphans.sort();
    orphans.dedup();
    orphans
}

/// Place `orphans` row-major from `origin`, skipping occupied cells. The
/// placements bypass world history so they cannot be undone.
///
/// Cells past the grid edge are skipped; once the rows run off the grid the
/// remaining orphans stay unplaced and are picked up by the next repair.
pub fn repair_orphans(world: &mut World, orphans: &[Identity], origin: Position) -> Vec<(Position, Identity)> {
    let mut placed = Vec::with_capacity(orphans.len());
    let mut cells = scratch_cells(origin);
    for &identity in orphans {
        let Some(position) = cells.find(|p| world.index().identity_at(*p).is_none()) else {
            break;
        };
        world.place_untracked(position, identity);
        placed.push((position, identity));
    }
    if !placed.is_empty() {
        log::warn!(
            target: "sheetfield::repair",
            "placed {} orphaned sheet(s) at scratch region starting {origin}",
            placed.len()
        );
    }
    if placed.len() < orphans.len() {
        log::error!(
            target: "sheetfield::repair",
            "scratch region at {origin} is full; {} orphaned sheet(s) left unplaced",
            orphans.len() - placed.len()
        );
    }
    placed
}

/// Cells of the scratch region in row-major order, ending at the grid edge.
fn scratch_cells(origin: Position) -> impl Iterator<Item = Position> {
    let limit = i64::from(WORLD_LIMIT);
    let (x0, y0) = (i64::from(origin.x), i64::from(origin.y));
    (y0..=limit)
        .flat_map(move |y| (x0..x0 + i64::from(SCRATCH_WIDTH)).map(move |x| (x, y)))
        .filter(move |(x, _)| *x <= limit)
        .map(|(x, y)| Position::new(x as i32, y as i32))
}
