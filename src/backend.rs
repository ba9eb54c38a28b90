//! device access
use std::path::Path;

use kms_device::{Card, ClientCapability, DriverCapability, KmsDevice};

use crate::Error;

pub fn open(path: &Path) -> Result<Card, Error> {
    let card = Card::open(path).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;
    tracing::info!("using card '{}'", path.display());
    Ok(card)
}

/// switch the device to the atomic, plane aware interface and check it can do what we need
pub fn negotiate(device: &impl KmsDevice) -> Result<(), Error> {
    for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
        device
            .set_client_capability(cap, true)
            .map_err(|source| Error::ClientCap { cap, source })?;
    }

    let required = [
        (DriverCapability::DumbBuffer, "dumb buffers"),
        (DriverCapability::CrtcInVBlankEvent, "crtc ids in vblank events"),
    ];
    for (cap, name) in required {
        match device.driver_capability(cap) {
            Ok(value) if value != 0 => {}
            Ok(_) => return Err(Error::Unsupported(name)),
            Err(err) => {
                tracing::debug!("querying {cap:?}: {err}");
                return Err(Error::Unsupported(name));
            }
        }
    }

    Ok(())
}
