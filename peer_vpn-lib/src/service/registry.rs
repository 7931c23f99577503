use std::collections::HashMap;
use std::sync::Arc;

use crate::market::ServiceProposal;
use crate::service::{Error, Options, Service};

pub type ServiceFactory =
    Box<dyn Fn(&Options) -> Result<(Arc<dyn Service>, ServiceProposal), Error> + Send + Sync>;

/// Maps service types to backend factories. Populated at process init,
/// immutable afterwards; holds factories, never instances.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, ServiceFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, service_type: impl Into<String>, factory: ServiceFactory) {
        self.factories.insert(service_type.into(), factory);
    }

    pub fn create(
        &self,
        service_type: &str,
        options: &Options,
    ) -> Result<(Arc<dyn Service>, ServiceProposal), Error> {
        let factory = self
            .factories
            .get(service_type)
            .ok_or_else(|| Error::UnsupportedType(service_type.to_string()))?;
        factory(options)
    }
}
