//! per-object property snapshot
use kms_device::{KmsDevice, Object, PropertyId, PropertyInfo};

use crate::Error;

/// properties of one connector, crtc or plane, read once at setup
///
/// objects carry tens of properties, lookups are a plain scan
#[derive(Debug, Clone)]
pub struct PropertyCache {
    object: Object,
    props: Vec<PropertyInfo>,
}

impl PropertyCache {
    /// an object without properties is treated as stale
    pub fn load(device: &impl KmsDevice, object: Object) -> Result<Self, Error> {
        let props = device
            .properties(object)
            .map_err(|source| Error::Properties { object, source })?;

        if props.is_empty() {
            return Err(Error::NoProperties(object));
        }

        Ok(Self { object, props })
    }

    pub fn object(&self) -> Object {
        self.object
    }

    pub fn resolve(&self, name: &str) -> Result<PropertyId, Error> {
        self.find(name)
            .map(|prop| prop.id)
            .ok_or_else(|| Error::PropertyNotFound {
                object: self.object,
                name: name.to_owned(),
            })
    }

    /// value as read at load time
    pub fn value(&self, name: &str) -> Option<u64> {
        self.find(name).map(|prop| prop.value)
    }

    fn find(&self, name: &str) -> Option<&PropertyInfo> {
        self.props.iter().find(|prop| prop.name == name)
    }
}
