//! Raster previews for positions that are in view but not materialized.
//!
//! Each position keeps the finest image it has received, the image currently
//! shown (that one or a downsample of it), and at most one outstanding decode.
//! The finest image is only ever replaced by one at least as fine, except
//! when a sheet is evicted and its fresh render is back-filled.

use std::sync::Arc;

use image::RgbaImage;
use rustc_hash::FxHashMap;

use sheetfield_engine::content::SheetContent;
use sheetfield_engine::position::{Identity, Position};
use sheetfield_io::preview::downsample;
use sheetfield_io::Tier;

use crate::render::SheetRenderer;
use crate::worker::{CancelToken, Job, WorkerPool};

/// What `ensure` left on screen for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Ready(Tier),
    /// A decode is running; `showing` is the placeholder meanwhile.
    Pending { showing: Option<Tier> },
    /// No stored image exists at the requested tier.
    Unavailable,
}

/// Where an image for `ensure` may come from.
pub enum PreviewSource<'a> {
    /// Content in memory (resident, or staged for the next flush).
    Render(&'a SheetContent, &'a dyn SheetRenderer),
    Stored,
}

#[derive(Debug)]
struct PendingDecode {
    tier: Tier,
    generation: u64,
    token: CancelToken,
}

#[derive(Debug)]
struct PreviewEntry {
    identity: Identity,
    /// Best pixels in hand; coarser requests are cut from these.
    finest: Option<(Tier, Arc<RgbaImage>)>,
    shown: Option<(Tier, Arc<RgbaImage>)>,
    pending: Option<PendingDecode>,
    /// Tier the store had nothing for.
    missing: Option<Tier>,
}

impl PreviewEntry {
    fn new(identity: Identity) -> Self {
        Self { identity, finest: None, shown: None, pending: None, missing: None }
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
        }
    }

    fn showing(&self) -> Option<Tier> {
        self.shown.as_ref().map(|(tier, _)| *tier)
    }

    fn finest_tier(&self) -> Option<Tier> {
        self.finest.as_ref().map(|(tier, _)| *tier)
    }

    fn set_finest(&mut self, tier: Tier, image: Arc<RgbaImage>) {
        self.shown = Some((tier, Arc::clone(&image)));
        self.finest = Some((tier, image));
    }
}

#[derive(Debug, Default)]
pub struct PreviewCache {
    entries: FxHashMap<Position, PreviewEntry>,
    next_generation: u64,
}

impl PreviewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, position: Position) -> Option<(Tier, Arc<RgbaImage>)> {
        self.entries.get(&position)?.shown.clone()
    }

    pub fn is_pending(&self, position: Position) -> bool {
        self.entries.get(&position).is_some_and(|e| e.pending.is_some())
    }

    /// Make sure `position` shows `identity` at `tier`.
    ///
    /// Requests no finer than the best image held are served from it and
    /// never wait, so zooming out and back in does not decode again. Finer
    /// requests keep the current image as a placeholder until the decode
    /// lands.
    pub fn ensure(
        &mut self,
        position: Position,
        identity: Identity,
        tier: Tier,
        source: PreviewSource<'_>,
        pool: &mut WorkerPool,
    ) -> PreviewState {
        let entry = self.entries.entry(position).or_insert_with(|| PreviewEntry::new(identity));
        if entry.identity != identity {
            entry.cancel_pending();
            *entry = PreviewEntry::new(identity);
        }

        if entry.showing() == Some(tier) {
            return PreviewState::Ready(tier);
        }
        if let Some((have, image)) = &entry.finest {
            if *have >= tier {
                let image = if *have == tier { Arc::clone(image) } else { Arc::new(downsample(image, tier)) };
                entry.shown = Some((tier, image));
                entry.cancel_pending();
                return PreviewState::Ready(tier);
            }
        }

        match source {
            PreviewSource::Render(content, renderer) => {
                entry.set_finest(tier, Arc::new(renderer.render(content, tier.pixels())));
                entry.cancel_pending();
                PreviewState::Ready(tier)
            }
            PreviewSource::Stored => {
                let showing = entry.showing();
                if entry.pending.as_ref().is_some_and(|p| p.tier == tier) {
                    return PreviewState::Pending { showing };
                }
                if entry.missing == Some(tier) {
                    return match showing {
                        Some(_) => PreviewState::Pending { showing },
                        None => PreviewState::Unavailable,
                    };
                }

                entry.cancel_pending();
                self.next_generation += 1;
                let generation = self.next_generation;
                let token = CancelToken::new();
                let job = Job::DecodePreview { position, identity, tier, generation, token: token.clone() };
                if !pool.submit(job) {
                    return PreviewState::Unavailable;
                }
                entry.pending = Some(PendingDecode { tier, generation, token });
                PreviewState::Pending { showing }
            }
        }
    }

    /// Install a background decode. Returns true if the image is now shown.
    pub fn install_decoded(
        &mut self,
        position: Position,
        identity: Identity,
        tier: Tier,
        generation: u64,
        image: Option<RgbaImage>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&position) else {
            return false;
        };
        if entry.identity != identity {
            return false;
        }
        match &entry.pending {
            Some(p) if p.generation == generation && !p.token.is_cancelled() => {}
            _ => return false,
        }
        entry.pending = None;

        let Some(image) = image else {
            log::debug!(target: "sheetfield::preview", "no stored {}px preview for {identity}", tier.pixels());
            entry.missing = Some(tier);
            return false;
        };
        if entry.finest_tier().is_some_and(|have| have > tier) {
            return false;
        }
        entry.set_finest(tier, Arc::new(image));
        true
    }

    /// Back-fill from a freshly rendered sheet. Replaces whatever is cached
    /// and abandons decodes of the older stored image.
    pub fn install(&mut self, position: Position, identity: Identity, tier: Tier, image: RgbaImage) {
        let entry = self.entries.entry(position).or_insert_with(|| PreviewEntry::new(identity));
        entry.cancel_pending();
        *entry = PreviewEntry::new(identity);
        entry.set_finest(tier, Arc::new(image));
    }

    pub fn remove(&mut self, position: Position) {
        if let Some(mut entry) = self.entries.remove(&position) {
            entry.cancel_pending();
        }
    }

    /// Drop entries whose position is not in `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(Position, Identity) -> bool) {
        self.entries.retain(|p, entry| {
            let kept = keep(*p, entry.identity);
            if !kept {
                entry.cancel_pending();
            }
            kept
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    use sheetfield_engine::content::Color;
    use sheetfield_io::{Encoding, MemoryByteStore, PersistentStore, PreviewSet, SheetWrite, WriteBatch};

    use crate::render::FlatRenderer;
    use crate::worker::Message;

    fn stored(identity: Identity) -> WorkerPool {
        let store = Arc::new(PersistentStore::new(Arc::new(MemoryByteStore::new()), Encoding::Json));
        let content = SheetContent { background: Color(0x2040_60FF), ..Default::default() };
        let previews = PreviewSet::from_full(FlatRenderer.render(&content, 1024));
        let batch = WriteBatch {
            sheets: vec![SheetWrite {
                identity,
                content: Arc::new(content),
                history: None,
                previews: Some(Arc::new(previews)),
            }],
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();
        WorkerPool::spawn(store, Arc::new(FlatRenderer), 1, 8).unwrap()
    }

    fn pump(cache: &mut PreviewCache, pool: &mut WorkerPool) -> usize {
        let mut installed = 0;
        while let Some(message) = pool.recv() {
            if let Message::PreviewDecoded { position, identity, tier, generation, image } = message {
                if cache.install_decoded(position, identity, tier, generation, image) {
                    installed += 1;
                }
            }
        }
        installed
    }

    #[test]
    fn test_decode_then_coarser_is_immediate() {
        let id = Identity::new();
        let mut pool = stored(id);
        let mut cache = PreviewCache::new();
        let p = Position::ORIGIN;

        assert_eq!(cache.ensure(p, id, Tier::T16, PreviewSource::Stored, &mut pool), PreviewState::Pending { showing: None });
        assert_eq!(pump(&mut cache, &mut pool), 1);
        assert_eq!(cache.ensure(p, id, Tier::T16, PreviewSource::Stored, &mut pool), PreviewState::Ready(Tier::T16));

        assert_eq!(cache.ensure(p, id, Tier::T4, PreviewSource::Stored, &mut pool), PreviewState::Ready(Tier::T4));
        assert_eq!(pool.outstanding(), 0);
        let (tier, image) = cache.get(p).unwrap();
        assert_eq!(tier, Tier::T4);
        assert_eq!(image.get_pixel(0, 0), &Rgba([0x20, 0x40, 0x60, 0xFF]));
    }

    #[test]
    fn test_zoom_out_then_in_keeps_finest() {
        let id = Identity::new();
        let mut pool = stored(id);
        let mut cache = PreviewCache::new();
        let p = Position::ORIGIN;
        cache.ensure(p, id, Tier::T1024, PreviewSource::Stored, &mut pool);
        assert_eq!(pump(&mut cache, &mut pool), 1);

        assert_eq!(cache.ensure(p, id, Tier::T16, PreviewSource::Stored, &mut pool), PreviewState::Ready(Tier::T16));
        let (tier, image) = cache.get(p).unwrap();
        assert_eq!((tier, image.width()), (Tier::T16, 16));

        assert_eq!(cache.ensure(p, id, Tier::T1024, PreviewSource::Stored, &mut pool), PreviewState::Ready(Tier::T1024));
        assert_eq!(pool.outstanding(), 0);
        assert!(!cache.is_pending(p));
        let (tier, image) = cache.get(p).unwrap();
        assert_eq!((tier, image.width()), (Tier::T1024, 1024));
        assert_eq!(image.get_pixel(512, 512), &Rgba([0x20, 0x40, 0x60, 0xFF]));
    }

    #[test]
    fn test_finer_request_keeps_placeholder() {
        let id = Identity::new();
        let mut pool = stored(id);
        let mut cache = PreviewCache::new();
        let p = Position::ORIGIN;
        cache.ensure(p, id, Tier::T4, PreviewSource::Stored, &mut pool);
        pump(&mut cache, &mut pool);

        assert_eq!(
            cache.ensure(p, id, Tier::T256, PreviewSource::Stored, &mut pool),
            PreviewState::Pending { showing: Some(Tier::T4) }
        );
        assert_eq!(cache.get(p).unwrap().0, Tier::T4);
        pump(&mut cache, &mut pool);
        assert_eq!(cache.get(p).unwrap().0, Tier::T256);
    }

    #[test]
    fn test_superseded_decode_is_discarded() {
        let id = Identity::new();
        let mut pool = stored(id);
        let mut cache = PreviewCache::new();
        let p = Position::ORIGIN;
        cache.ensure(p, id, Tier::T256, PreviewSource::Stored, &mut pool);
        let content = SheetContent::new();
        cache.ensure(p, id, Tier::T64, PreviewSource::Render(&content, &FlatRenderer), &mut pool);

        assert_eq!(pump(&mut cache, &mut pool), 0);
        assert_eq!(cache.get(p).unwrap().0, Tier::T64);
    }

    #[test]
    fn test_missing_preview_is_not_retried() {
        let mut pool = stored(Identity::new());
        let mut cache = PreviewCache::new();
        let other = Identity::new();
        cache.ensure(Position::ORIGIN, other, Tier::T64, PreviewSource::Stored, &mut pool);
        assert_eq!(pump(&mut cache, &mut pool), 0);
        assert_eq!(
            cache.ensure(Position::ORIGIN, other, Tier::T64, PreviewSource::Stored, &mut pool),
            PreviewState::Unavailable
        );
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_backfill_replaces_and_identity_change_resets() {
        let id = Identity::new();
        let mut pool = stored(id);
        let mut cache = PreviewCache::new();
        let p = Position::new(3, 3);
        cache.install(p, id, Tier::T1024, RgbaImage::new(1024, 1024));
        assert_eq!(cache.ensure(p, id, Tier::T64, PreviewSource::Stored, &mut pool), PreviewState::Ready(Tier::T64));

        let other = Identity::new();
        cache.ensure(p, other, Tier::T64, PreviewSource::Stored, &mut pool);
        assert!(cache.get(p).is_none());
        cache.remove(p);
        assert!(cache.is_empty());
    }
}
