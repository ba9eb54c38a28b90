//! batched property updates, validated and applied as one transaction
use kms_device::{AtomicProperty, CommitFlags, KmsDevice};

use crate::{props::PropertyCache, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// ask whether the configuration would be accepted, change nothing
    Validate,
    /// first real commit of an output, establishes the mode
    Modeset,
    /// steady state page-flip
    Flip,
}

impl CommitMode {
    pub fn flags(self) -> CommitFlags {
        match self {
            CommitMode::Validate => CommitFlags::TEST_ONLY | CommitFlags::ALLOW_MODESET,
            CommitMode::Modeset => {
                CommitFlags::ALLOW_MODESET | CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT
            }
            CommitMode::Flip => CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT,
        }
    }
}

#[derive(Debug, Default)]
pub struct AtomicRequest {
    properties: Vec<AtomicProperty>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// append `name = value` on `object`, failing if the object has no such property
    pub fn set(
        &mut self,
        object: &PropertyCache,
        name: &str,
        value: u64,
    ) -> Result<&mut Self, Error> {
        let prop = object.resolve(name)?;
        self.properties.push((object.object(), prop, value));
        Ok(self)
    }

    pub fn properties(&self) -> &[AtomicProperty] {
        &self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn commit(self, device: &impl KmsDevice, mode: CommitMode) -> Result<(), Error> {
        device
            .atomic_commit(mode.flags(), &self.properties)
            .map_err(|err| match mode {
                CommitMode::Validate => Error::ValidationRejected(err),
                CommitMode::Modeset | CommitMode::Flip => Error::CommitRejected(err),
            })
    }
}
