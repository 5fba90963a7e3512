use crate::error::{constants, LdapError, Result};
use crate::protocol::message::{oids, Control};
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A decoded response control, downcast by the caller to its concrete type
pub type DecodedControl = Box<dyn Any + Send>;

type DecoderFn = dyn Fn(&Control) -> Result<DecodedControl> + Send + Sync + 'static;

/// A control a caller attaches to a request.
pub trait RequestControl {
    fn oid(&self) -> &str;

    fn critical(&self) -> bool {
        false
    }

    /// Encoded `controlValue`, if the control carries one
    fn value(&self) -> Option<Vec<u8>> {
        None
    }

    fn to_control(&self) -> Control {
        Control::new(self.oid(), self.critical(), self.value())
    }
}

/// ManageDsaIT (RFC 3296): treat referral objects as ordinary entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManageDsaIt {
    pub critical: bool,
}

impl RequestControl for ManageDsaIt {
    fn oid(&self) -> &str {
        oids::MANAGE_DSA_IT
    }

    fn critical(&self) -> bool {
        self.critical
    }
}

/// OID to decoder mapping for controls returned by the server.
/// Built-ins are keyed by `Cow::Borrowed` so registration allocates nothing for them.
#[derive(Clone)]
pub struct ControlRegistry {
    decoders: Arc<RwLock<HashMap<Cow<'static, str>, Arc<DecoderFn>>>>,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRegistry")
            .field("oids", &self.oids())
            .finish()
    }
}

impl ControlRegistry {
    /// A registry holding the built-in decoders
    pub fn new() -> Self {
        let mut decoders: HashMap<Cow<'static, str>, Arc<DecoderFn>> = HashMap::new();
        decoders.insert(
            Cow::Borrowed(oids::MANAGE_DSA_IT),
            Arc::new(|control: &Control| {
                Ok(Box::new(ManageDsaIt {
                    critical: control.critical,
                }) as DecodedControl)
            }),
        );
        Self {
            decoders: Arc::new(RwLock::new(decoders)),
        }
    }

    /// A registry with no decoders at all
    pub fn empty() -> Self {
        Self {
            decoders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or replace the decoder for `oid`
    pub fn register<F>(&self, oid: &str, decoder: F) -> Result<()>
    where
        F: Fn(&Control) -> Result<DecodedControl> + Send + Sync + 'static,
    {
        let mut decoders = self
            .decoders
            .write()
            .map_err(|_| LdapError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if decoders
            .insert(Cow::Owned(oid.to_string()), Arc::new(decoder))
            .is_some()
        {
            debug!(oid, "Replaced control decoder");
        }
        Ok(())
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.decoders
            .read()
            .map(|d| d.contains_key(oid))
            .unwrap_or(false)
    }

    pub fn oids(&self) -> Vec<String> {
        self.decoders
            .read()
            .map(|d| {
                let mut oids: Vec<String> = d.keys().map(|k| k.to_string()).collect();
                oids.sort();
                oids
            })
            .unwrap_or_default()
    }

    /// Decode `control` with its registered decoder.
    ///
    /// `Ok(None)` when no decoder is registered for the OID; the raw control
    /// remains available on the message.
    pub fn decode(&self, control: &Control) -> Result<Option<DecodedControl>> {
        let decoder = {
            let decoders = self
                .decoders
                .read()
                .map_err(|_| LdapError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string()))?;
            match decoders.get(control.oid.as_str()) {
                Some(d) => Arc::clone(d),
                None => return Ok(None),
            }
        };
        decoder(control).map(Some)
    }

    /// Decode and downcast the first control of type `T` with the given OID
    pub fn find<T: Any>(&self, controls: &[Control], oid: &str) -> Result<Option<T>> {
        for control in controls.iter().filter(|c| c.oid == oid) {
            if let Some(decoded) = self.decode(control)? {
                if let Ok(typed) = decoded.downcast::<T>() {
                    return Ok(Some(*typed));
                }
            }
        }
        Ok(None)
    }
}
