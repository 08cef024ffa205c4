//! Registration Agent
//!
//! Component-side half of the protocol: register once, then heartbeat on a
//! fixed interval until stopped.

use super::{ComponentRegistration, RegistryClient};
use crate::error::RegistryClientError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct RegistrationAgent {
    client: Arc<RegistryClient>,

    registration: ComponentRegistration,

    interval: Duration,

    session: Option<String>,
}

impl RegistrationAgent {
    pub fn new(client: Arc<RegistryClient>, registration: ComponentRegistration) -> Self {
        Self {
            client,
            registration,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            session: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Reuse a session token from a previous run so a quick restart is not
    /// rejected as a duplicate.
    pub fn with_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    /// Registers the component and spawns the heartbeat loop.
    pub async fn start(self) -> Result<AgentHandle, RegistryClientError> {
        let ack = self
            .client
            .register(&self.registration, self.session.as_deref())
            .await?;
        info!(component = %ack.id, interval = ?self.interval, "registered with hermes");

        let (shutdown, mut stop) = watch::channel(false);
        let client = Arc::clone(&self.client);
        let registration = self.registration;
        let session = ack.session.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        beat(&client, &registration, &session).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(AgentHandle {
            id: ack.id,
            session: ack.session,
            client: self.client,
            shutdown,
            task,
        })
    }
}

async fn beat(client: &RegistryClient, registration: &ComponentRegistration, session: &str) {
    match client.heartbeat(&registration.id, None, &[]).await {
        Ok(ack) => debug!(component = %ack.id, applied = ack.applied, "heartbeat sent"),
        Err(RegistryClientError::NotFound(_)) => {
            warn!(component = %registration.id, "registration lost, re-registering");
            if let Err(e) = client.register(registration, Some(session)).await {
                warn!(component = %registration.id, error = %e, "re-registration failed");
            }
        }
        Err(e) => warn!(component = %registration.id, error = %e, "heartbeat failed"),
    }
}

pub struct AgentHandle {
    id: String,

    session: String,

    client: Arc<RegistryClient>,

    shutdown: watch::Sender<bool>,

    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops heartbeating and unregisters. A registry that already forgot
    /// the component is not an error.
    pub async fn stop(self) -> Result<(), RegistryClientError> {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(component = %self.id, error = %e, "heartbeat task ended abnormally");
        }

        match self.client.unregister(&self.id).await {
            Ok(()) | Err(RegistryClientError::NotFound(_)) => {
                info!(component = %self.id, "unregistered from hermes");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
