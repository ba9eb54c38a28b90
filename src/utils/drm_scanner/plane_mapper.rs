use std::collections::HashSet;

use kms_device::{KmsDevice, Object, PlaneId, PLANE_TYPE_PRIMARY};

use crate::{props::PropertyCache, Error};

/// hands out primary planes, each at most once
#[derive(Debug, Default)]
pub struct PlaneMapper {
    claimed: HashSet<PlaneId>,
}

impl PlaneMapper {
    /// first unclaimed primary plane able to scan out from the crtc at `crtc_index`
    pub fn map(
        &mut self,
        device: &impl KmsDevice,
        crtc_index: usize,
    ) -> Result<Option<PlaneId>, Error> {
        let planes = device.plane_ids().map_err(Error::PlaneResources)?;

        for id in planes {
            if self.claimed.contains(&id) {
                continue;
            }

            let plane = match device.plane(id) {
                Ok(plane) => plane,
                Err(err) => {
                    tracing::warn!("cannot retrieve plane {id}: {err}");
                    continue;
                }
            };

            if crtc_index >= 32 || plane.possible_crtcs & (1 << crtc_index) == 0 {
                continue;
            }

            let is_primary = match PropertyCache::load(device, Object::Plane(id)) {
                Ok(props) => props.value("type") == Some(PLANE_TYPE_PRIMARY),
                Err(err) => {
                    tracing::warn!("{err}");
                    false
                }
            };

            if is_primary {
                self.claimed.insert(id);
                return Ok(Some(id));
            }
        }

        Ok(None)
    }

    pub fn unmap(&mut self, plane: PlaneId) {
        self.claimed.remove(&plane);
    }
}
