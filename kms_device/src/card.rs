use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::c_char,
    fs::{File, OpenOptions},
    io,
    num::NonZeroU32,
    os::fd::{AsFd, BorrowedFd},
    path::Path,
};

use drm::{
    buffer::{Buffer, DrmFourcc},
    control::{
        atomic::AtomicModeReq, connector, crtc, dumbbuffer, encoder, framebuffer, plane, property,
        AtomicCommitFlags, Device as ControlDevice, Event, Mode, ModeTypeFlags, RawResourceHandle,
    },
    Device,
};
use drm_ffi::drm_mode_modeinfo;

use crate::{
    AtomicProperty, BlobId, ClientCapability, CommitFlags, ConnectionState, ConnectorId,
    ConnectorInfo, CrtcId, DriverCapability, DumbBuffer, DumbMapping, EncoderId, EncoderInfo,
    FlipEvent, FramebufferId, KmsDevice, ModeInfo, ModeTimings, Object, PlaneId, PlaneInfo,
    PropertyId, PropertyInfo, Resources,
};

/// the opened device node, what the `drm` traits operate on
struct Node(File);

impl AsFd for Node {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Node { }
impl ControlDevice for Node { }

/// a primary DRM node, e.g. `/dev/dri/card0`
pub struct Card {
    node: Node,
    /// dumb buffers by handle, `drm` wants its own value back to register or destroy one
    dumbs: RefCell<HashMap<u32, dumbbuffer::DumbBuffer>>,
}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Card> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Card {
            node: Node(file),
            dumbs: RefCell::default(),
        })
    }
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.node.as_fd()
    }
}

fn handle<T: From<RawResourceHandle>>(id: u32) -> io::Result<T> {
    NonZeroU32::new(id)
        .map(T::from)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

fn raw(handle: impl Into<RawResourceHandle>) -> u32 {
    handle.into().get()
}

fn mask(res: &drm::control::ResourceHandles, filter: drm::control::CrtcListFilter) -> u32 {
    let possible = res.filter_crtcs(filter);
    res.crtcs()
        .iter()
        .enumerate()
        .filter(|(_, crtc)| possible.contains(crtc))
        .fold(0, |mask, (index, _)| mask | 1 << index)
}

fn mode_info(mode: &Mode) -> ModeInfo {
    let raw = drm_mode_modeinfo::from(*mode);
    ModeInfo {
        name: mode.name().to_string_lossy().into_owned(),
        width: raw.hdisplay,
        height: raw.vdisplay,
        vrefresh: raw.vrefresh,
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
        timings: ModeTimings {
            clock: raw.clock,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            flags: raw.flags,
            kind: raw.type_,
        },
    }
}

fn kernel_mode(mode: &ModeInfo) -> Mode {
    let mut name = [0 as c_char; 32];
    for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
        *dst = src as c_char;
    }

    let timings = &mode.timings;
    Mode::from(drm_mode_modeinfo {
        clock: timings.clock,
        hdisplay: mode.width,
        hsync_start: timings.hsync_start,
        hsync_end: timings.hsync_end,
        htotal: timings.htotal,
        hskew: timings.hskew,
        vdisplay: mode.height,
        vsync_start: timings.vsync_start,
        vsync_end: timings.vsync_end,
        vtotal: timings.vtotal,
        vscan: timings.vscan,
        vrefresh: mode.vrefresh,
        flags: timings.flags,
        type_: timings.kind,
        name,
    })
}

impl KmsDevice for Card {
    type Mapping = DumbMapping;

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        let cap = match cap {
            ClientCapability::UniversalPlanes => drm::ClientCapability::UniversalPlanes,
            ClientCapability::Atomic => drm::ClientCapability::Atomic,
        };
        self.node.set_client_capability(cap, enable)
    }

    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64> {
        let cap = match cap {
            DriverCapability::DumbBuffer => drm::DriverCapability::DumbBuffer,
            DriverCapability::CrtcInVBlankEvent => drm::DriverCapability::CRTCInVBlankEvent,
        };
        self.node.get_driver_capability(cap)
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.node.resource_handles()?;
        Ok(Resources {
            connectors: res.connectors().iter().map(|h| ConnectorId(raw(*h))).collect(),
            encoders: res.encoders().iter().map(|h| EncoderId(raw(*h))).collect(),
            crtcs: res.crtcs().iter().map(|h| CrtcId(raw(*h))).collect(),
        })
    }

    fn plane_ids(&self) -> io::Result<Vec<PlaneId>> {
        let planes = self.node.plane_handles()?;
        Ok(planes.into_iter().map(|h| PlaneId(raw(h))).collect())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let info = self.node.get_connector(handle::<connector::Handle>(id.0)?, true)?;

        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            connector::State::Unknown => ConnectionState::Unknown,
        };

        let modes = info.modes().iter().map(mode_info).collect();

        Ok(ConnectorInfo {
            id,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            state,
            modes,
            encoders: info.encoders().iter().map(|h| EncoderId(raw(*h))).collect(),
            current_encoder: info.current_encoder().map(|h| EncoderId(raw(h))),
        })
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        let res = self.node.resource_handles()?;
        let info = self.node.get_encoder(handle::<encoder::Handle>(id.0)?)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|h| CrtcId(raw(h))),
            possible_crtcs: mask(&res, info.possible_crtcs()),
        })
    }

    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo> {
        let res = self.node.resource_handles()?;
        let info = self.node.get_plane(handle::<plane::Handle>(id.0)?)?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: mask(&res, info.possible_crtcs()),
        })
    }

    fn properties(&self, object: Object) -> io::Result<Vec<PropertyInfo>> {
        let props = match object {
            Object::Connector(id) => self.node.get_properties(handle::<connector::Handle>(id.0)?)?,
            Object::Crtc(id) => self.node.get_properties(handle::<crtc::Handle>(id.0)?)?,
            Object::Plane(id) => self.node.get_properties(handle::<plane::Handle>(id.0)?)?,
        };

        props
            .into_iter()
            .map(|(handle, value)| {
                let info = self.node.get_property(handle)?;
                Ok(PropertyInfo {
                    id: PropertyId(raw(handle)),
                    name: info.name().to_string_lossy().into_owned(),
                    value,
                })
            })
            .collect()
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<BlobId> {
        match self.node.create_property_blob(&kernel_mode(mode))? {
            property::Value::Blob(id) => Ok(BlobId(id as u32)),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        self.node.destroy_property_blob(blob.0 as u64)
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let created = self
            .node
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, bpp)?;
        let handle = raw(created.handle());
        let pitch = created.pitch();
        self.dumbs.borrow_mut().insert(handle, created);

        Ok(DumbBuffer {
            handle,
            width,
            height,
            bpp,
            pitch,
            size: u64::from(pitch) * u64::from(height),
        })
    }

    fn add_framebuffer(&self, buffer: &DumbBuffer, depth: u32) -> io::Result<FramebufferId> {
        let dumbs = self.dumbs.borrow();
        let created = dumbs
            .get(&buffer.handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let fb = self.node.add_framebuffer(created, depth, buffer.bpp)?;
        Ok(FramebufferId(raw(fb)))
    }

    // `drm`'s own mapping borrows the buffer for its lifetime, the pixel
    // buffers keep theirs for as long as they live
    fn map_dumb_buffer(&self, buffer: &DumbBuffer) -> io::Result<DumbMapping> {
        let map = drm_ffi::mode::dumbbuffer::map(self.as_fd(), buffer.handle, 0, 0)?;
        DumbMapping::new(self.as_fd(), map.offset, buffer.size as usize)
    }

    fn destroy_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        self.node.destroy_framebuffer(handle::<framebuffer::Handle>(fb.0)?)
    }

    fn destroy_dumb_buffer(&self, buffer: DumbBuffer) -> io::Result<()> {
        let created = self
            .dumbs
            .borrow_mut()
            .remove(&buffer.handle)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        self.node.destroy_dumb_buffer(created)
    }

    fn atomic_commit(&self, flags: CommitFlags, properties: &[AtomicProperty]) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in properties {
            let prop = handle::<property::Handle>(prop.0)?;
            let value = property::Value::UnsignedRange(*value);
            match *object {
                Object::Connector(id) => {
                    req.add_property(handle::<connector::Handle>(id.0)?, prop, value)
                }
                Object::Crtc(id) => req.add_property(handle::<crtc::Handle>(id.0)?, prop, value),
                Object::Plane(id) => req.add_property(handle::<plane::Handle>(id.0)?, prop, value),
            }
        }

        let mut drm_flags = AtomicCommitFlags::empty();
        for (flag, drm_flag) in [
            (CommitFlags::PAGE_FLIP_EVENT, AtomicCommitFlags::PAGE_FLIP_EVENT),
            (CommitFlags::NONBLOCK, AtomicCommitFlags::NONBLOCK),
            (CommitFlags::TEST_ONLY, AtomicCommitFlags::TEST_ONLY),
            (CommitFlags::ALLOW_MODESET, AtomicCommitFlags::ALLOW_MODESET),
        ] {
            drm_flags.set(drm_flag, flags.contains(flag));
        }

        self.node.atomic_commit(drm_flags, req)
    }

    fn flip_events(&self) -> io::Result<Vec<FlipEvent>> {
        let events = self.node.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(FlipEvent {
                    crtc: CrtcId(raw(flip.crtc)),
                    frame: flip.frame,
                    time: flip.duration,
                }),
                _ => None,
            })
            .collect())
    }
}
