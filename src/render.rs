//! the frame payload: a slowly drifting solid colour
use rand::Rng;

/// one 8-bit colour channel walking up or down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub value: u8,
    pub up: bool,
}

impl Channel {
    /// move by `step` in the current direction
    ///
    /// a step that would leave the 8-bit range turns the channel around
    /// and keeps the previous value for this frame
    pub fn advance(&mut self, step: u8) {
        let next = if self.up {
            self.value.checked_add(step)
        } else {
            self.value.checked_sub(step)
        };

        match next {
            Some(value) => self.value = value,
            None => self.up = !self.up,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: Channel,
    pub g: Channel,
    pub b: Channel,
}

impl Color {
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut channel = || Channel {
            value: rng.random_range(0..u8::MAX),
            up: true,
        };
        Self {
            r: channel(),
            g: channel(),
            b: channel(),
        }
    }

    /// advance every channel by a random step in `0..modulus`
    pub fn advance(&mut self, rng: &mut impl Rng, modulus: u8) {
        let modulus = modulus.max(1);
        for channel in [&mut self.r, &mut self.g, &mut self.b] {
            channel.advance(rng.random_range(0..modulus));
        }
    }

    pub fn xrgb8888(&self) -> u32 {
        u32::from(self.r.value) << 16 | u32::from(self.g.value) << 8 | u32::from(self.b.value)
    }
}

/// fill a `width`x`height` xrgb8888 image laid out with `stride` bytes per row
pub fn fill(pixels: &mut [u8], width: u32, height: u32, stride: u32, pixel: u32) {
    let row_len = width as usize * 4;
    let stride = stride as usize;
    if stride < row_len {
        tracing::warn!("stride {stride} is shorter than a {width} pixel row, not painting");
        return;
    }

    let bytes = pixel.to_ne_bytes();
    for row in pixels.chunks_mut(stride).take(height as usize) {
        let Some(row) = row.get_mut(..row_len) else {
            break;
        };
        for px in row.chunks_exact_mut(4) {
            px.copy_from_slice(&bytes);
        }
    }
}
