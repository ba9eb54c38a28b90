//! conflict free connector -> crtc -> plane assignment
use kms_device::{ConnectorId, ConnectorInfo, CrtcId, KmsDevice, PlaneId, Resources};

mod crtc_mapper;
mod plane_mapper;
pub use crtc_mapper::{CrtcMapper, SimpleCrtcMapper};
pub use plane_mapper::PlaneMapper;

use crate::Error;

/// one claimed display pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub connector: ConnectorId,
    pub crtc: CrtcId,
    /// position of `crtc` in the device's crtc list
    pub crtc_index: usize,
    pub plane: PlaneId,
}

#[derive(Debug, Default)]
pub struct DrmScanner<Mapper = SimpleCrtcMapper>
where
    Mapper: CrtcMapper,
{
    crtc_mapper: Mapper,
    plane_mapper: PlaneMapper,
}

impl<Mapper> DrmScanner<Mapper>
where
    Mapper: CrtcMapper + Default,
{
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Mapper> DrmScanner<Mapper>
where
    Mapper: CrtcMapper,
{
    pub fn crtc_for_connector(&self, connector: ConnectorId) -> Option<CrtcId> {
        self.crtc_mapper.crtc_for_connector(connector)
    }

    /// claim a crtc and its primary plane for `connector`
    ///
    /// nothing stays claimed when this fails
    pub fn claim(
        &mut self,
        device: &impl KmsDevice,
        res: &Resources,
        connector: &ConnectorInfo,
    ) -> Result<Assignment, Error> {
        let crtc = self
            .crtc_mapper
            .map(device, res, connector)
            .ok_or(Error::NoCrtc(connector.id))?;

        let Some(crtc_index) = res.crtc_index(crtc) else {
            self.crtc_mapper.unmap(connector.id);
            return Err(Error::NoCrtc(connector.id));
        };

        let plane = match self.plane_mapper.map(device, crtc_index) {
            Ok(Some(plane)) => plane,
            Ok(None) => {
                self.crtc_mapper.unmap(connector.id);
                return Err(Error::NoPlane(crtc));
            }
            Err(err) => {
                self.crtc_mapper.unmap(connector.id);
                return Err(err);
            }
        };

        tracing::debug!(
            "connector {} -> crtc {crtc} (index {crtc_index}) -> plane {plane}",
            connector.id
        );

        Ok(Assignment {
            connector: connector.id,
            crtc,
            crtc_index,
            plane,
        })
    }

    pub fn release(&mut self, assignment: &Assignment) {
        self.crtc_mapper.unmap(assignment.connector);
        self.plane_mapper.unmap(assignment.plane);
    }
}
