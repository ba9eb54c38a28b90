use std::io;

use kms_device::{ClientCapability, ConnectorId, CrtcId, Object};

/// how far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// the whole run is aborted
    FatalSetup,
    /// the affected connector is skipped
    ResourceUnavailable,
    /// the affected output does not advance this cycle
    TransactionRejected,
    /// the device lacks a property the pipeline relies on, fatal
    PropertyResolution,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open '{path}': {source}")]
    Open { path: String, source: io::Error },
    #[error("failed to set {cap:?} client cap: {source}")]
    ClientCap { cap: ClientCapability, source: io::Error },
    #[error("drm device does not support {0}")]
    Unsupported(&'static str),
    #[error("cannot retrieve DRM resources: {0}")]
    Resources(io::Error),
    #[error("cannot get {object} properties: {source}")]
    Properties { object: Object, source: io::Error },
    #[error("{0} reported no properties")]
    NoProperties(Object),
    #[error("no object property {name} on {object}")]
    PropertyNotFound { object: Object, name: String },
    #[error("connector {0} has no modes")]
    NoModes(ConnectorId),
    #[error("cannot find suitable crtc for connector {0}")]
    NoCrtc(ConnectorId),
    #[error("couldn't find a primary plane for crtc {0}")]
    NoPlane(CrtcId),
    #[error("cannot retrieve plane resources: {0}")]
    PlaneResources(io::Error),
    #[error("couldn't create a mode blob: {0}")]
    ModeBlob(io::Error),
    #[error("cannot create dumb buffer: {0}")]
    CreateDumb(io::Error),
    #[error("cannot create framebuffer: {0}")]
    AddFramebuffer(io::Error),
    #[error("cannot map dumb buffer: {0}")]
    MapDumb(io::Error),
    #[error("test-only atomic commit failed: {0}")]
    ValidationRejected(io::Error),
    #[error("atomic commit failed: {0}")]
    CommitRejected(io::Error),
    #[error("couldn't create any outputs")]
    NoOutputs,
    #[error("failed to read drm events: {0}")]
    ReadEvents(io::Error),
    #[error("event loop failed: {0}")]
    EventLoop(io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. }
            | Error::ClientCap { .. }
            | Error::Unsupported(_)
            | Error::Resources(_)
            | Error::ValidationRejected(_)
            | Error::NoOutputs
            | Error::ReadEvents(_)
            | Error::EventLoop(_) => ErrorKind::FatalSetup,
            Error::Properties { .. }
            | Error::NoProperties(_)
            | Error::NoModes(_)
            | Error::NoCrtc(_)
            | Error::NoPlane(_)
            | Error::PlaneResources(_)
            | Error::ModeBlob(_)
            | Error::CreateDumb(_)
            | Error::AddFramebuffer(_)
            | Error::MapDumb(_) => ErrorKind::ResourceUnavailable,
            Error::CommitRejected(_) => ErrorKind::TransactionRejected,
            Error::PropertyNotFound { .. } => ErrorKind::PropertyResolution,
        }
    }

    /// OS error code behind the failure, if there is one
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. }
            | Error::ClientCap { source, .. }
            | Error::Properties { source, .. } => source.raw_os_error(),
            Error::Resources(err)
            | Error::PlaneResources(err)
            | Error::ModeBlob(err)
            | Error::CreateDumb(err)
            | Error::AddFramebuffer(err)
            | Error::MapDumb(err)
            | Error::ValidationRejected(err)
            | Error::CommitRejected(err)
            | Error::ReadEvents(err)
            | Error::EventLoop(err) => err.raw_os_error(),
            Error::Unsupported(_) => Some(libc::EOPNOTSUPP),
            Error::NoProperties(_) => Some(libc::ENOMEM),
            Error::PropertyNotFound { .. } => Some(libc::EINVAL),
            Error::NoCrtc(_) | Error::NoPlane(_) | Error::NoModes(_) => Some(libc::ENOENT),
            Error::NoOutputs => None,
        }
    }
}

/// process exit status for a failed run: the negated errno, as the shell sees it
pub fn exit_status(err: &anyhow::Error) -> u8 {
    let errno = err.chain().find_map(|cause| {
        if let Some(err) = cause.downcast_ref::<Error>() {
            return err.errno();
        }
        cause.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error)
    });

    match errno {
        Some(errno) if errno > 0 => (errno as u8).wrapping_neg(),
        _ => 1,
    }
}
