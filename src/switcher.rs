//! Network switching on the active provider.
//!
//! A switch to a chain the wallet does not know is answered with code
//! 4902. The switcher then registers the chain once with the network's
//! metadata and retries the switch once. Every other failure is
//! reported to the user and not retried.

use crate::error::{ConnectError, ErrorClass, ProviderRpcError};
use crate::manager::ConnectionManager;
use crate::network::NetworkDescriptor;
use crate::notice::Notice;
use crate::provider::{ProviderHandle, RequestArguments};

#[derive(Debug, Clone)]
pub struct NetworkSwitcher {
    manager: ConnectionManager,
}

impl NetworkSwitcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Switch the active wallet to `network`. Failures are reported
    /// through the manager's notices.
    pub async fn switch_to(&self, network: &NetworkDescriptor) -> bool {
        match self.try_switch(network).await {
            Ok(()) => true,
            Err(e) => {
                self.report(network, &e);
                false
            }
        }
    }

    /// Ask the active wallet to register `network` without switching.
    pub async fn add_network(&self, network: &NetworkDescriptor) -> bool {
        let result = match self.manager.provider() {
            Some(handle) => add_chain(&handle, network).await,
            None => Err(ConnectError::NotConnected),
        };
        match result {
            Ok(()) => {
                tracing::info!(network = network.slug, "network added");
                true
            }
            Err(e) => {
                self.report(network, &e);
                false
            }
        }
    }

    pub async fn try_switch(&self, network: &NetworkDescriptor) -> Result<(), ConnectError> {
        let handle = self.manager.provider().ok_or(ConnectError::NotConnected)?;

        if let Ok(current) = handle.chain_id().await {
            if current == network.chain_id {
                tracing::debug!(network = network.slug, "already on requested chain");
                self.manager.note_chain(handle.id(), current);
                return Ok(());
            }
        }

        match request_switch(&handle, network).await {
            Ok(()) => {}
            Err(e) if e.class() == ErrorClass::ChainUnknown => {
                tracing::info!(network = network.slug, "chain unknown to wallet, adding it");
                add_chain(&handle, network).await?;
                request_switch(&handle, network).await.map_err(|e| {
                    if e.class() == ErrorClass::ChainUnknown {
                        ConnectError::ChainUnknown {
                            chain_id: network.chain_id,
                        }
                    } else {
                        ConnectError::from(e)
                    }
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(network = network.slug, handle = %handle.id(), "switched network");
        self.manager.note_chain(handle.id(), network.chain_id);
        Ok(())
    }

    fn report(&self, network: &NetworkDescriptor, err: &ConnectError) {
        tracing::warn!(network = network.slug, error = %err, "network request failed");
        let notice = match err {
            ConnectError::NotConnected => Notice::PleaseConnect,
            ConnectError::UserRejected => Notice::UserRejected,
            other => Notice::switch_failed(network, other.to_string()),
        };
        self.manager.notices().notify(notice);
    }
}

async fn request_switch(
    handle: &ProviderHandle,
    network: &NetworkDescriptor,
) -> Result<(), ProviderRpcError> {
    handle
        .request(RequestArguments::new(
            "wallet_switchEthereumChain",
            network.switch_params(),
        ))
        .await
        .map(drop)
}

async fn add_chain(handle: &ProviderHandle, network: &NetworkDescriptor) -> Result<(), ConnectError> {
    handle
        .request(RequestArguments::new(
            "wallet_addEthereumChain",
            network.add_chain_params(),
        ))
        .await
        .map(drop)
        .map_err(ConnectError::from)
}
