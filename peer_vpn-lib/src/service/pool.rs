use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::service::{Error, Id, Instance, Publisher, STOP_TOPIC, State};

/// In-memory registry of running instances.
///
/// Removal from the map happens before any teardown call, so a second stop
/// of the same id observes `NotFound` and teardown runs exactly once.
pub struct Pool {
    instances: Mutex<HashMap<Id, Arc<Instance>>>,
    publisher: Arc<dyn Publisher>,
}

impl Pool {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Pool {
            instances: Mutex::new(HashMap::new()),
            publisher,
        }
    }

    pub fn add(&self, instance: Arc<Instance>) {
        let mut instances = self.instances.lock().expect("pool lock");
        instances.insert(instance.id().clone(), instance);
    }

    /// Stops one instance: tunnel first so no new sessions are born, dialog
    /// waiter next so no half-open negotiations remain, discovery last so the
    /// proposal disappears only after the instance is truly gone.
    pub async fn stop(&self, id: &Id) -> Result<(), Error> {
        let instance = {
            let mut instances = self.instances.lock().expect("pool lock");
            instances.remove(id).ok_or(Error::NotFound)?
        };

        if let Err(e) = instance.service().stop().await {
            tracing::warn!(%id, error = %e, "service stop reported an error");
        }
        instance.dialog_waiter.stop().await;
        instance.discovery.stop();
        instance.set_state(State::NotRunning);

        self.publisher.publish(STOP_TOPIC, instance.clone());
        tracing::info!(%id, service_type = %instance.proposal().service_type, "service stopped");
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<(), Error> {
        let ids: Vec<Id> = {
            let instances = self.instances.lock().expect("pool lock");
            instances.keys().cloned().collect()
        };

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::error!(%id, error = %e, "failed to stop service");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shallow snapshot of the running instances.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let instances = self.instances.lock().expect("pool lock");
        instances.values().cloned().collect()
    }

    pub fn instance(&self, id: &Id) -> Option<Arc<Instance>> {
        let instances = self.instances.lock().expect("pool lock");
        instances.get(id).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub published: Mutex<Vec<(&'static str, Arc<Instance>)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &'static str, instance: Arc<Instance>) {
            self.published.lock().unwrap().push((topic, instance));
        }
    }
}
