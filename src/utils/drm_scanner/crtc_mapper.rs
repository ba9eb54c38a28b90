use std::collections::HashMap;

use kms_device::{ConnectorId, ConnectorInfo, CrtcId, KmsDevice, Resources};

pub trait CrtcMapper {
    /// pick and claim a crtc for `connector`
    fn map(
        &mut self,
        device: &impl KmsDevice,
        res: &Resources,
        connector: &ConnectorInfo,
    ) -> Option<CrtcId>;
    fn unmap(&mut self, connector: ConnectorId);
    fn crtc_for_connector(&self, connector: ConnectorId) -> Option<CrtcId>;
}

/// first fit, preferring whatever crtc the connector is already driven by
#[derive(Debug, Default)]
pub struct SimpleCrtcMapper {
    claims: HashMap<CrtcId, ConnectorId>,
}

impl SimpleCrtcMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_available(&self, crtc: CrtcId) -> bool {
        !self.claims.contains_key(&crtc)
    }

    fn restored_for_connector(
        &self,
        device: &impl KmsDevice,
        connector: &ConnectorInfo,
    ) -> Option<CrtcId> {
        let encoder = device.encoder(connector.current_encoder?).ok()?;
        let crtc = encoder.crtc?;
        self.is_available(crtc).then_some(crtc)
    }

    fn next_available_for_connector(
        &self,
        device: &impl KmsDevice,
        res: &Resources,
        connector: &ConnectorInfo,
    ) -> Option<CrtcId> {
        connector
            .encoders
            .iter()
            .filter_map(|encoder| match device.encoder(*encoder) {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!("cannot retrieve encoder {encoder}: {err}");
                    None
                }
            })
            .find_map(|encoder| {
                res.filter_crtcs(encoder.possible_crtcs)
                    .map(|(_, crtc)| crtc)
                    .find(|crtc| self.is_available(*crtc))
            })
    }
}

impl CrtcMapper for SimpleCrtcMapper {
    fn map(
        &mut self,
        device: &impl KmsDevice,
        res: &Resources,
        connector: &ConnectorInfo,
    ) -> Option<CrtcId> {
        if let Some(crtc) = self.crtc_for_connector(connector.id) {
            return Some(crtc);
        }

        let crtc = self
            .restored_for_connector(device, connector)
            .or_else(|| self.next_available_for_connector(device, res, connector))?;
        self.claims.insert(crtc, connector.id);
        Some(crtc)
    }

    fn unmap(&mut self, connector: ConnectorId) {
        self.claims.retain(|_, owner| *owner != connector);
    }

    fn crtc_for_connector(&self, connector: ConnectorId) -> Option<CrtcId> {
        self.claims
            .iter()
            .find_map(|(crtc, owner)| (*owner == connector).then_some(*crtc))
    }
}
