//! off-screen scanout buffers
use std::ops::DerefMut;

use kms_device::{DumbBuffer, FramebufferId, KmsDevice};

use crate::Error;

/// bits per pixel of the packed xrgb8888 layout
pub const BPP: u32 = 32;
/// colour depth of the packed xrgb8888 layout
pub const DEPTH: u32 = 24;

/// a mapped dumb buffer registered as a framebuffer
pub struct PixelBuffer<M> {
    pub width: u32,
    pub height: u32,
    /// bytes per row
    pub stride: u32,
    pub size: u64,
    pub fb: FramebufferId,
    dumb: DumbBuffer,
    map: M,
}

impl<M> PixelBuffer<M>
where
    M: DerefMut<Target = [u8]>,
{
    /// create, register, map and zero a buffer
    ///
    /// on failure everything created so far is destroyed again
    pub fn allocate<D>(device: &D, width: u32, height: u32) -> Result<Self, Error>
    where
        D: KmsDevice<Mapping = M>,
    {
        let dumb = device
            .create_dumb_buffer(width, height, BPP)
            .map_err(Error::CreateDumb)?;

        let fb = match device.add_framebuffer(&dumb, DEPTH) {
            Ok(fb) => fb,
            Err(err) => {
                destroy_dumb(device, dumb);
                return Err(Error::AddFramebuffer(err));
            }
        };

        let mut map = match device.map_dumb_buffer(&dumb) {
            Ok(map) => map,
            Err(err) => {
                destroy_fb(device, fb);
                destroy_dumb(device, dumb);
                return Err(Error::MapDumb(err));
            }
        };

        map.fill(0);

        Ok(Self {
            width,
            height,
            stride: dumb.pitch,
            size: dumb.size,
            fb,
            dumb,
            map,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.map
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// unmap, remove the framebuffer and destroy the buffer, in that order
    ///
    /// must not be called while a commit referencing [`Self::fb`] is in flight
    pub fn release(self, device: &impl KmsDevice) {
        drop(self.map);
        destroy_fb(device, self.fb);
        destroy_dumb(device, self.dumb);
    }
}

fn destroy_fb(device: &impl KmsDevice, fb: FramebufferId) {
    if let Err(err) = device.destroy_framebuffer(fb) {
        tracing::warn!("failed to remove framebuffer {fb}: {err}");
    }
}

fn destroy_dumb(device: &impl KmsDevice, dumb: DumbBuffer) {
    let handle = dumb.handle;
    if let Err(err) = device.destroy_dumb_buffer(dumb) {
        tracing::warn!("failed to destroy dumb buffer {handle}: {err}");
    }
}

/// two buffers trading the displayed and the drawn role
pub struct SwapChain<M> {
    buffers: [PixelBuffer<M>; 2],
    front: usize,
}

impl<M> SwapChain<M>
where
    M: DerefMut<Target = [u8]>,
{
    pub fn allocate<D>(device: &D, width: u32, height: u32) -> Result<Self, Error>
    where
        D: KmsDevice<Mapping = M>,
    {
        let first = PixelBuffer::allocate(device, width, height)?;
        let second = match PixelBuffer::allocate(device, width, height) {
            Ok(buffer) => buffer,
            Err(err) => {
                first.release(device);
                return Err(err);
            }
        };

        Ok(Self {
            buffers: [first, second],
            front: 0,
        })
    }

    pub fn front_index(&self) -> usize {
        self.front
    }

    pub fn back_index(&self) -> usize {
        self.front ^ 1
    }

    pub fn front(&self) -> &PixelBuffer<M> {
        &self.buffers[self.front]
    }

    pub fn back(&self) -> &PixelBuffer<M> {
        &self.buffers[self.back_index()]
    }

    pub fn back_mut(&mut self) -> &mut PixelBuffer<M> {
        let back = self.back_index();
        &mut self.buffers[back]
    }

    /// the back buffer becomes the front one
    pub fn swap(&mut self) {
        self.front ^= 1;
    }

    pub fn release(self, device: &impl KmsDevice) {
        let [first, second] = self.buffers;
        first.release(device);
        second.release(device);
    }
}
