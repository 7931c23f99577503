use std::sync::{Arc, Mutex};

use crate::dialog::{DialogHandlerFactory, DialogWaiterFactory};
use crate::discovery::DiscoveryFactory;
use crate::identity::Identity;
use crate::service::{Error, Id, Instance, Options, Pool, Publisher, Registry, State};

/// Orchestrates the start/serve/stop pipeline for pluggable service
/// instances.
pub struct Manager {
    registry: Registry,
    pool: Arc<Pool>,
    dialog_waiter_factory: DialogWaiterFactory,
    dialog_handler_factory: DialogHandlerFactory,
    discovery_factory: DiscoveryFactory,
}

impl Manager {
    pub fn new(
        registry: Registry,
        dialog_waiter_factory: DialogWaiterFactory,
        dialog_handler_factory: DialogHandlerFactory,
        discovery_factory: DiscoveryFactory,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Manager {
            registry,
            pool: Arc::new(Pool::new(publisher)),
            dialog_waiter_factory,
            dialog_handler_factory,
            discovery_factory,
        }
    }

    /// Starts an instance of the given service type, if the registry knows
    /// one. Any failure unwinds the side effects of the preceding steps in
    /// reverse order before surfacing.
    pub async fn start(
        &self,
        provider_id: &Identity,
        service_type: &str,
        options: Options,
    ) -> Result<Id, Error> {
        let (service, mut proposal) = self.registry.create(service_type, &options)?;

        let dialog_waiter = (self.dialog_waiter_factory)(provider_id, service_type)?;
        let contact = dialog_waiter.start().await?;
        proposal.set_provider_contact(provider_id, contact);

        let id = Id::new_random();

        let handler = (self.dialog_handler_factory)(proposal.clone(), service.clone(), id.as_str());
        if let Err(e) = dialog_waiter.serve_dialogs(handler).await {
            dialog_waiter.stop().await;
            return Err(e.into());
        }

        let discovery = Arc::new((self.discovery_factory)());
        discovery.start(provider_id.clone(), proposal.clone());

        let instance = Arc::new(Instance {
            id: id.clone(),
            state: Mutex::new(State::Starting),
            options,
            service: service.clone(),
            proposal,
            dialog_waiter,
            discovery: discovery.clone(),
        });
        self.pool.add(instance.clone());

        let pool = self.pool.clone();
        let provider_id = provider_id.clone();
        let supervisor_id = id.clone();
        tokio::spawn(async move {
            instance.set_state(State::Running);
            tracing::info!(id = %supervisor_id, "service started");

            if let Err(e) = service.serve(&provider_id).await {
                tracing::error!(id = %supervisor_id, error = %e, "service serve failed");
            } else {
                tracing::info!(id = %supervisor_id, "service serve exited");
            }

            instance.set_state(State::NotRunning);

            match pool.stop(&supervisor_id).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => {
                    tracing::error!(id = %supervisor_id, error = %e, "service stop failed");
                }
            }

            discovery.wait().await;
        });

        Ok(id)
    }

    pub async fn stop(&self, id: &Id) -> Result<(), Error> {
        self.pool.stop(id).await
    }

    /// Stops all running instances.
    pub async fn kill(&self) -> Result<(), Error> {
        self.pool.stop_all().await
    }

    pub fn list(&self) -> Vec<Arc<Instance>> {
        self.pool.list()
    }

    pub fn service(&self, id: &Id) -> Option<Arc<Instance>> {
        self.pool.instance(id)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::market::ServiceProposal;
    use crate::service::pool::testing::RecordingPublisher;
    use crate::service::{STOP_TOPIC, Service};
    use crate::services::noop;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const SERVICE_TYPE: &str = "the-very-awesome-test-service-type";

    fn crashing_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            SERVICE_TYPE,
            Box::new(|_options| {
                Ok((
                    Arc::new(MockService {
                        serve_error: Some("some error".to_string()),
                        process: None,
                    }) as Arc<dyn Service>,
                    ServiceProposal::default(),
                ))
            }),
        );
        registry
    }

    fn blocking_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            SERVICE_TYPE,
            Box::new(|_options| {
                Ok((
                    Arc::new(MockService {
                        serve_error: None,
                        process: Some(CancellationToken::new()),
                    }) as Arc<dyn Service>,
                    ServiceProposal::default(),
                ))
            }),
        );
        registry
    }

    async fn wait_until_empty(manager: &Manager) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !manager.list().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not drain in time");
    }

    #[tokio::test]
    async fn start_removes_service_from_pool_if_service_crashes() -> anyhow::Result<()> {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = manager_with(crashing_registry(), publisher);

        manager
            .start(
                &Identity::from_address("0xprovider"),
                SERVICE_TYPE,
                Options::None,
            )
            .await?;

        wait_until_empty(&manager).await;
        Ok(())
    }

    #[tokio::test]
    async fn start_does_not_crash_if_stopped_by_user() -> anyhow::Result<()> {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = manager_with(blocking_registry(), publisher);

        let id = manager
            .start(
                &Identity::from_address("0xprovider"),
                SERVICE_TYPE,
                Options::None,
            )
            .await?;
        let discovery = manager.service(&id).expect("instance tracked").discovery.clone();

        manager.stop(&id).await?;
        discovery.wait().await;
        assert!(manager.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn stop_publishes_exactly_one_event() -> anyhow::Result<()> {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = manager_with(blocking_registry(), publisher.clone());

        let id = manager
            .start(
                &Identity::from_address("0xprovider"),
                SERVICE_TYPE,
                Options::None,
            )
            .await?;
        manager.stop(&id).await?;

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, instance) = &published[0];
        assert_eq!(*topic, STOP_TOPIC);
        assert_eq!(instance.id(), &id);
        Ok(())
    }

    #[tokio::test]
    async fn double_stop_is_not_found_and_stays_silent() -> anyhow::Result<()> {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = manager_with(blocking_registry(), publisher.clone());

        let id = manager
            .start(
                &Identity::from_address("0xprovider"),
                SERVICE_TYPE,
                Options::None,
            )
            .await?;
        manager.stop(&id).await?;

        let second = manager.stop(&id).await;
        assert!(matches!(second, Err(Error::NotFound)));
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_service_type_fails_fast() {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = manager_with(Registry::new(), publisher);

        let result = manager
            .start(&Identity::from_address("0xprovider"), "bogus", Options::None)
            .await;
        assert!(matches!(result, Err(Error::UnsupportedType(_))));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn kill_stops_every_instance() -> anyhow::Result<()> {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut registry = blocking_registry();
        registry.register(
            noop::SERVICE_TYPE,
            Box::new(|_options| {
                Ok((
                    Arc::new(noop::Manager::new()) as Arc<dyn Service>,
                    noop::proposal("LT"),
                ))
            }),
        );
        let manager = manager_with(registry, publisher);
        let provider = Identity::from_address("0xprovider");

        manager.start(&provider, SERVICE_TYPE, Options::None).await?;
        manager.start(&provider, noop::SERVICE_TYPE, Options::None).await?;
        assert_eq!(manager.list().len(), 2);

        manager.kill().await?;
        assert!(manager.list().is_empty());
        Ok(())
    }
}
