// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Occlusion sampling interface.
//!
//! The visibility engine only needs a way to render identification-colored
//! bounding-box proxies off screen and get the pixels back. The GPU
//! implementation lives in [`crate::gpu`]; tests substitute synthetic
//! buffers.

use crate::color::ColorCode;
use crate::error::Result;

/// Off-screen render target configuration.
#[derive(Debug, Clone)]
pub struct OffscreenConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for OffscreenConfig {
    fn default() -> Self {
        // Identification passes are low resolution on purpose: pixel
        // counts drive load priority, not image quality.
        Self {
            width: 512,
            height: 512,
        }
    }
}

/// Camera pose for one sampling pass.
#[derive(Debug, Clone)]
pub struct CameraPose {
    pub position: [f32; 3],
    /// Orientation quaternion as (x, y, z, w).
    pub quaternion: [f32; 4],
    /// Viewport of the real view, used only for the aspect ratio.
    pub viewport_width: u32,
    pub viewport_height: u32,
}

/// One bounding-box proxy: a unit cube transform plus its color code.
#[derive(Debug, Clone)]
pub struct ProxyInstance {
    /// Column-major world transform mapping the unit cube onto the
    /// geometry's oriented bounding box.
    pub transform: [f32; 16],
    pub code: ColorCode,
}

/// RGBA8 pixels read back from an identification pass.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA rows, length `width * height * 4`.
    pub rgba: Vec<u8>,
}

impl PixelBuffer {
    /// All-background buffer of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![0; (width * height * 4) as usize],
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }
}

/// Renders identification-colored proxies and reads the pixels back.
pub trait OcclusionRenderer: Send {
    /// Register a model's proxy instances under its index. The
    /// coordination matrix places the model in the shared scene.
    fn add_model(
        &mut self,
        model_index: u32,
        coordination: [f32; 16],
        instances: Vec<ProxyInstance>,
    ) -> Result<()>;

    /// Drop all proxies of a model.
    fn remove_model(&mut self, model_index: u32);

    /// Render one identification pass and read the pixels back.
    fn sample(&mut self, pose: &CameraPose) -> Result<PixelBuffer>;
}
