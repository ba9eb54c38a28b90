//! kernel mode-setting device interface
//!
//! [`KmsDevice`] is everything the output pipeline needs from a display
//! device: object enumeration, property introspection, dumb buffers,
//! framebuffers, mode blobs and atomic commits with page-flip events.
//!
//! [`Card`] implements it on top of a `/dev/dri/card*` node.
use std::{fmt, io, ops::DerefMut, os::fd::AsFd, time::Duration};

mod card;
mod mapping;

pub use card::Card;
pub use mapping::DumbMapping;

macro_rules! object_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    )*};
}

object_id! {
    ConnectorId,
    EncoderId,
    CrtcId,
    PlaneId,
    PropertyId,
    FramebufferId,
    /// kernel resident property blob, e.g. a copy of a display mode
    BlobId,
}

/// a kernel object that carries properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Object {
    Connector(ConnectorId),
    Crtc(CrtcId),
    Plane(PlaneId),
}

impl Object {
    pub fn id(&self) -> u32 {
        match *self {
            Object::Connector(id) => id.0,
            Object::Crtc(id) => id.0,
            Object::Plane(id) => id.0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Object::Connector(_) => "connector",
            Object::Crtc(_) => "CRTC",
            Object::Plane(_) => "plane",
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// value of the plane `type` property for primary planes
pub const PLANE_TYPE_PRIMARY: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCapability {
    UniversalPlanes,
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCapability {
    DumbBuffer,
    CrtcInVBlankEvent,
}

bitflags::bitflags! {
    /// atomic commit behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 1 << 0;
        const NONBLOCK = 1 << 1;
        const TEST_ONLY = 1 << 2;
        const ALLOW_MODESET = 1 << 3;
    }
}

/// object ids in kernel enumeration order
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub connectors: Vec<ConnectorId>,
    pub encoders: Vec<EncoderId>,
    pub crtcs: Vec<CrtcId>,
}

impl Resources {
    /// position of `crtc` in the crtc list, the bit it occupies in `possible_crtcs` masks
    pub fn crtc_index(&self, crtc: CrtcId) -> Option<usize> {
        self.crtcs.iter().position(|c| *c == crtc)
    }

    /// crtcs selected by a `possible_crtcs` bitmask, with their index
    pub fn filter_crtcs(&self, mask: u32) -> impl Iterator<Item = (usize, CrtcId)> + '_ {
        self.crtcs
            .iter()
            .copied()
            .enumerate()
            .filter(move |(index, _)| *index < 32 && mask & (1 << index) != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// the parts of a display mode the pipeline does not look at, kept so the
/// mode can be handed back to the kernel unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeTimings {
    /// pixel clock in kHz
    pub clock: u32,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub flags: u32,
    pub kind: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub vrefresh: u32,
    pub preferred: bool,
    pub timings: ModeTimings,
}

impl ModeInfo {
    pub fn size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    /// `<interface>-<interface id>`, e.g. `HDMI-A-1`
    pub name: String,
    pub state: ConnectionState,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<EncoderId>,
    pub current_encoder: Option<EncoderId>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaneInfo {
    pub id: PlaneId,
    pub possible_crtcs: u32,
}

/// a property of an object with its current value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub name: String,
    pub value: u64,
}

/// kernel side of a dumb buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// bytes per row
    pub pitch: u32,
    pub size: u64,
}

/// completion of a commit submitted with [`CommitFlags::PAGE_FLIP_EVENT`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: CrtcId,
    pub frame: u32,
    pub time: Duration,
}

/// one `(object, property, value)` entry of an atomic request
pub type AtomicProperty = (Object, PropertyId, u64);

pub trait KmsDevice: AsFd {
    /// process memory view of a dumb buffer, unmapped on drop
    type Mapping: DerefMut<Target = [u8]>;

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;
    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64>;

    fn resources(&self) -> io::Result<Resources>;
    fn plane_ids(&self) -> io::Result<Vec<PlaneId>>;
    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo>;
    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo>;
    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo>;

    fn properties(&self, object: Object) -> io::Result<Vec<PropertyInfo>>;

    /// copy `mode` into a kernel blob, usable as a crtc `MODE_ID`
    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<BlobId>;
    fn destroy_blob(&self, blob: BlobId) -> io::Result<()>;

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer>;
    fn add_framebuffer(&self, buffer: &DumbBuffer, depth: u32) -> io::Result<FramebufferId>;
    fn map_dumb_buffer(&self, buffer: &DumbBuffer) -> io::Result<Self::Mapping>;
    fn destroy_framebuffer(&self, fb: FramebufferId) -> io::Result<()>;
    fn destroy_dumb_buffer(&self, buffer: DumbBuffer) -> io::Result<()>;

    fn atomic_commit(&self, flags: CommitFlags, properties: &[AtomicProperty]) -> io::Result<()>;

    /// read one batch of pending completion events
    fn flip_events(&self) -> io::Result<Vec<FlipEvent>>;
}
