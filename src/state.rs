//! the set of outputs driven by the process
use std::{collections::HashMap, ops::DerefMut};

use kms_device::{ConnectionState, CrtcId, KmsDevice};
use rand::Rng;

use crate::{
    atomic::{AtomicRequest, CommitMode},
    error::ErrorKind,
    output::Output,
    utils::drm_scanner::{CrtcMapper, DrmScanner},
    Error,
};

/// outputs in discovery order, addressable by the crtc driving them
pub struct Outputs<M> {
    outputs: Vec<Output<M>>,
    by_crtc: HashMap<CrtcId, usize>,
}

impl<M> Default for Outputs<M> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            by_crtc: HashMap::new(),
        }
    }
}

impl<M> Outputs<M>
where
    M: DerefMut<Target = [u8]>,
{
    /// build an output for every usable connector
    ///
    /// connectors that cannot get a pipeline are skipped, having none left is an error
    pub fn discover<D, C>(
        device: &D,
        scanner: &mut DrmScanner<C>,
        rng: &mut impl Rng,
    ) -> Result<Self, Error>
    where
        D: KmsDevice<Mapping = M>,
        C: CrtcMapper,
    {
        let res = device.resources().map_err(Error::Resources)?;
        let mut outputs = Self::default();

        for (index, id) in res.connectors.iter().enumerate() {
            let connector = match device.connector(*id) {
                Ok(connector) => connector,
                Err(err) => {
                    tracing::warn!("cannot retrieve connector {index}:{id}: {err}");
                    continue;
                }
            };

            if connector.state != ConnectionState::Connected {
                tracing::info!("ignoring unused connector {}", connector.name);
                continue;
            }

            match Output::create(device, &res, &connector, scanner, rng) {
                Ok(output) => {
                    tracing::info!(
                        "{}: using crtc {} and plane {}",
                        output.name(),
                        output.crtc_id(),
                        output.plane_id()
                    );
                    outputs.insert(output);
                }
                Err(err) if err.kind() == ErrorKind::ResourceUnavailable => {
                    tracing::warn!("skipping connector {}: {err}", connector.name);
                }
                Err(err) => {
                    outputs.release(device);
                    return Err(err);
                }
            }
        }

        if outputs.is_empty() {
            return Err(Error::NoOutputs);
        }

        Ok(outputs)
    }

    fn insert(&mut self, output: Output<M>) {
        self.by_crtc.insert(output.crtc_id(), self.outputs.len());
        self.outputs.push(output);
    }

    /// dry run of every output's initial configuration in one transaction
    pub fn validate(&self, device: &impl KmsDevice) -> Result<(), Error> {
        let mut req = AtomicRequest::new();
        for output in &self.outputs {
            output.prepare_commit(&mut req)?;
        }
        req.commit(device, CommitMode::Validate)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Output<M>> {
        self.outputs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Output<M>> {
        self.outputs.iter_mut()
    }

    pub fn by_crtc_mut(&mut self, crtc: CrtcId) -> Option<&mut Output<M>> {
        let index = *self.by_crtc.get(&crtc)?;
        self.outputs.get_mut(index)
    }

    pub fn request_cleanup(&mut self) {
        for output in &mut self.outputs {
            output.request_cleanup();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.outputs.iter().any(Output::is_pending)
    }

    /// tear down every output
    ///
    /// an output still waiting for a page-flip is leaked, its kernel objects
    /// go away with the device handle
    pub fn release(&mut self, device: &impl KmsDevice) {
        self.by_crtc.clear();
        for output in self.outputs.drain(..) {
            if output.is_pending() {
                tracing::error!(
                    "{}: page-flip still pending, leaking its buffers",
                    output.name()
                );
                std::mem::forget(output);
                continue;
            }
            output.release(device);
        }
    }
}
