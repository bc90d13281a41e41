// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identification color codes.
//!
//! Every streamed geometry gets a unique RGB color for the off-screen
//! identification pass. Codes come from a monotonically increasing
//! counter decoded base-256 big-endian into (r, g, b), starting at 1 so
//! the cleared background never collides with a geometry.

/// Total number of representable colors, including the reserved black.
pub const COLOR_SPACE: u32 = 256 * 256 * 256;

/// An RGB identification color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorCode(pub [u8; 3]);

impl ColorCode {
    /// Normalized components for a render target clear/write.
    pub fn to_rgb_f32(self) -> [f32; 3] {
        [
            f32::from(self.0[0]) / 255.0,
            f32::from(self.0[1]) / 255.0,
            f32::from(self.0[2]) / 255.0,
        ]
    }
}

/// Hands out identification colors, never repeating one.
#[derive(Debug)]
pub struct ColorCodeAllocator {
    next: u32,
}

impl Default for ColorCodeAllocator {
    fn default() -> Self {
        // 0 is the background
        Self { next: 1 }
    }
}

impl ColorCodeAllocator {
    /// Next unused color, or `None` once the space is exhausted.
    pub fn next_code(&mut self) -> Option<ColorCode> {
        if self.next >= COLOR_SPACE {
            tracing::warn!("Color space exhausted, geometry will not be tracked");
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(ColorCode([
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ]))
    }

    /// How many codes were handed out so far.
    pub fn assigned(&self) -> u32 {
        self.next - 1
    }

    #[cfg(test)]
    fn skip_to(&mut self, next: u32) {
        self.next = next;
    }
}
