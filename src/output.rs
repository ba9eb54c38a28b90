//! a single display pipeline, from mode selection to page-flips
use std::ops::DerefMut;

use kms_device::{
    BlobId, ConnectorInfo, CrtcId, FlipEvent, KmsDevice, ModeInfo, Object, PlaneId, Resources,
};
use rand::Rng;

use crate::{
    atomic::{AtomicRequest, CommitMode},
    props::PropertyCache,
    render::{self, Color},
    swapchain::SwapChain,
    utils::drm_scanner::{Assignment, CrtcMapper, DrmScanner},
    Error,
};

/// where an output is in its commit cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    /// nothing in flight
    Idle,
    /// a transaction is being submitted
    Committing,
    /// the device accepted a transaction, its completion event is outstanding
    FlipPending,
}

pub struct Output<M> {
    name: String,
    assignment: Assignment,
    connector: PropertyCache,
    crtc: PropertyCache,
    plane: PropertyCache,
    mode: ModeInfo,
    mode_blob: BlobId,
    swapchain: SwapChain<M>,
    state: FlipState,
    cleanup: bool,
    needs_modeset: bool,
    color: Color,
    frames: u64,
}

/// the mode to drive `connector` with, the preferred one if flagged
pub fn select_mode(connector: &ConnectorInfo) -> Result<&ModeInfo, Error> {
    connector
        .modes
        .iter()
        .find(|mode| mode.preferred)
        .or_else(|| connector.modes.first())
        .ok_or(Error::NoModes(connector.id))
}

impl<M> Output<M>
where
    M: DerefMut<Target = [u8]>,
{
    /// build the whole pipeline for a connected connector
    ///
    /// on failure the scanner claim and every kernel object created here are released
    pub fn create<D, C>(
        device: &D,
        res: &Resources,
        connector: &ConnectorInfo,
        scanner: &mut DrmScanner<C>,
        rng: &mut impl Rng,
    ) -> Result<Self, Error>
    where
        D: KmsDevice<Mapping = M>,
        C: CrtcMapper,
    {
        let mode = select_mode(connector)?;
        let assignment = scanner.claim(device, res, connector)?;

        match Self::with_assignment(device, connector, assignment, mode.clone(), rng) {
            Ok(output) => Ok(output),
            Err(err) => {
                scanner.release(&assignment);
                Err(err)
            }
        }
    }

    fn with_assignment<D>(
        device: &D,
        connector: &ConnectorInfo,
        assignment: Assignment,
        mode: ModeInfo,
        rng: &mut impl Rng,
    ) -> Result<Self, Error>
    where
        D: KmsDevice<Mapping = M>,
    {
        let mode_blob = device.create_mode_blob(&mode).map_err(Error::ModeBlob)?;

        tracing::info!(
            "mode for {} is {}x{}@{}",
            connector.name,
            mode.width,
            mode.height,
            mode.vrefresh
        );

        let objects = (|| {
            let props = (
                PropertyCache::load(device, Object::Connector(assignment.connector))?,
                PropertyCache::load(device, Object::Crtc(assignment.crtc))?,
                PropertyCache::load(device, Object::Plane(assignment.plane))?,
            );
            let (width, height) = mode.size();
            let swapchain = SwapChain::allocate(device, width, height)?;
            Ok::<_, Error>((props, swapchain))
        })();

        let ((connector_props, crtc, plane), swapchain) = match objects {
            Ok(objects) => objects,
            Err(err) => {
                if let Err(err) = device.destroy_blob(mode_blob) {
                    tracing::warn!("failed to destroy mode blob {mode_blob}: {err}");
                }
                return Err(err);
            }
        };

        Ok(Self {
            name: connector.name.clone(),
            assignment,
            connector: connector_props,
            crtc,
            plane,
            mode,
            mode_blob,
            swapchain,
            state: FlipState::Idle,
            cleanup: false,
            needs_modeset: true,
            color: Color::random(rng),
            frames: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crtc_id(&self) -> CrtcId {
        self.assignment.crtc
    }

    pub fn plane_id(&self) -> PlaneId {
        self.assignment.plane
    }

    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    pub fn swapchain(&self) -> &SwapChain<M> {
        &self.swapchain
    }

    pub fn state(&self) -> FlipState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn is_pending(&self) -> bool {
        self.state == FlipState::FlipPending
    }

    /// idle and not winding down
    pub fn wants_frame(&self) -> bool {
        self.state == FlipState::Idle && !self.cleanup
    }

    /// stop submitting frames, the next completion event leaves the output idle for good
    pub fn request_cleanup(&mut self) {
        self.cleanup = true;
    }

    /// append this output's full configuration, scanning out the back buffer
    pub fn prepare_commit(&self, req: &mut AtomicRequest) -> Result<(), Error> {
        let back = self.swapchain.back();
        let (width, height) = (u64::from(back.width), u64::from(back.height));
        let crtc = u64::from(u32::from(self.assignment.crtc));

        req.set(&self.connector, "CRTC_ID", crtc)?;

        req.set(&self.crtc, "MODE_ID", u64::from(u32::from(self.mode_blob)))?
            .set(&self.crtc, "ACTIVE", 1)?;

        req.set(&self.plane, "FB_ID", u64::from(u32::from(back.fb)))?
            .set(&self.plane, "CRTC_ID", crtc)?
            .set(&self.plane, "SRC_X", 0)?
            .set(&self.plane, "SRC_Y", 0)?
            .set(&self.plane, "SRC_W", width << 16)?
            .set(&self.plane, "SRC_H", height << 16)?
            .set(&self.plane, "CRTC_X", 0)?
            .set(&self.plane, "CRTC_Y", 0)?
            .set(&self.plane, "CRTC_W", width)?
            .set(&self.plane, "CRTC_H", height)?;

        Ok(())
    }

    /// paint the back buffer and submit it
    ///
    /// does nothing unless the output [wants a frame](Self::wants_frame);
    /// on failure the output stays idle and front/back keep their roles
    pub fn draw(
        &mut self,
        device: &impl KmsDevice,
        rng: &mut impl Rng,
        color_step: u8,
    ) -> Result<(), Error> {
        if !self.wants_frame() {
            return Ok(());
        }

        self.color.advance(rng, color_step);
        let pixel = self.color.xrgb8888();
        let back = self.swapchain.back_mut();
        let (width, height, stride) = (back.width, back.height, back.stride);
        render::fill(back.pixels_mut(), width, height, stride, pixel);

        self.state = FlipState::Committing;

        let mode = match self.needs_modeset {
            true => CommitMode::Modeset,
            false => CommitMode::Flip,
        };
        let mut req = AtomicRequest::new();
        let result = self
            .prepare_commit(&mut req)
            .and_then(|()| req.commit(device, mode));

        if let Err(err) = result {
            self.state = FlipState::Idle;
            return Err(err);
        }

        self.swapchain.swap();
        self.state = FlipState::FlipPending;
        self.needs_modeset = false;
        self.frames += 1;
        tracing::trace!("{}: frame {} submitted, color {pixel:06x}", self.name, self.frames);
        Ok(())
    }

    /// the flip submitted last is on screen
    ///
    /// returns whether a new frame should be drawn
    pub fn page_flip(&mut self, event: &FlipEvent) -> bool {
        if self.state != FlipState::FlipPending {
            tracing::warn!("{}: unexpected page-flip for frame {}", self.name, event.frame);
            return false;
        }

        tracing::trace!("{}: page-flip, sequence {} at {:?}", self.name, event.frame, event.time);
        self.state = FlipState::Idle;
        !self.cleanup
    }

    /// free buffers then the mode blob
    ///
    /// the output must not have a flip pending
    pub fn release(self, device: &impl KmsDevice) {
        tracing::info!("{}: presented {} frames", self.name, self.frames);
        self.swapchain.release(device);
        if let Err(err) = device.destroy_blob(self.mode_blob) {
            tracing::warn!("{}: failed to destroy mode blob {}: {err}", self.name, self.mode_blob);
        }
    }
}
