//! Preview tiers and the five-image preview set stored with each sheet.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fixed preview resolutions, coarsest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    T4,
    T16,
    T64,
    T256,
    T1024,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::T4, Tier::T16, Tier::T64, Tier::T256, Tier::T1024];

    /// Edge length in pixels.
    pub fn pixels(self) -> u32 {
        match self {
            Tier::T4 => 4,
            Tier::T16 => 16,
            Tier::T64 => 64,
            Tier::T256 => 256,
            Tier::T1024 => 1024,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_pixels(px: u32) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| t.pixels() == px)
    }

    /// Smallest tier at least as large as a sheet appears on screen.
    /// Monotonic in `screen_px`.
    pub fn for_scale(screen_px: f64) -> Tier {
        Tier::ALL
            .into_iter()
            .find(|t| f64::from(t.pixels()) >= screen_px)
            .unwrap_or(Tier::T1024)
    }

    pub fn finer(self) -> Option<Tier> {
        Tier::ALL.get(self.index() + 1).copied()
    }

    pub fn coarser(self) -> Option<Tier> {
        self.index().checked_sub(1).map(|i| Tier::ALL[i])
    }

    pub fn key_suffix(self) -> String {
        self.pixels().to_string()
    }
}

/// All five tiers for one sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct PreviewSet {
    images: Vec<RgbaImage>,
}

impl PreviewSet {
    /// Build every tier from a full-resolution render by successive
    /// downsampling (1024, 256, 64, 16, 4).
    pub fn from_full(full: RgbaImage) -> Self {
        let top = Tier::T1024.pixels();
        let mut current = if full.dimensions() == (top, top) {
            full
        } else {
            downsample(&full, Tier::T1024)
        };
        let mut images = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL.into_iter().rev() {
            if current.width() != tier.pixels() {
                current = downsample(&current, tier);
            }
            images.push(current.clone());
        }
        images.reverse();
        Self { images }
    }

    pub fn get(&self, tier: Tier) -> &RgbaImage {
        &self.images[tier.index()]
    }

    pub fn encode(&self) -> Result<Vec<(Tier, Vec<u8>)>> {
        Tier::ALL
            .into_iter()
            .map(|tier| Ok((tier, encode_png(self.get(tier))?)))
            .collect()
    }
}

pub fn downsample(image: &RgbaImage, tier: Tier) -> RgbaImage {
    let px = tier.pixels();
    image::imageops::resize(image, px, px, FilterType::Triangle)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone()).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

pub fn decode_png(bytes: &[u8]) -> Result<RgbaImage> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgba8())
}
