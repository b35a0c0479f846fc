//! Object-safe adapter over [`Backend`].

use std::any::{type_name, Any};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use super::Backend;
use crate::config::ManagerConfig;
use crate::node::{Address, BackendId, CmdOutput, NodeSpec, PublicKey};

/// Type-erased backend or node state.
pub(crate) type Opaque = Box<dyn Any + Send + Sync>;

/// A backend was handed an opaque value of the wrong type.
#[derive(Debug, thiserror::Error)]
#[error("expected {expected}")]
pub(crate) struct StateMismatch {
    pub expected: &'static str,
}

fn downcast_ref<T: 'static>(value: &Opaque) -> Result<&T> {
    (**value).downcast_ref::<T>().ok_or_else(|| {
        StateMismatch {
            expected: type_name::<T>(),
        }
        .into()
    })
}

fn downcast_mut<T: 'static>(value: &mut Opaque) -> Result<&mut T> {
    (**value).downcast_mut::<T>().ok_or_else(|| {
        StateMismatch {
            expected: type_name::<T>(),
        }
        .into()
    })
}

fn downcast<T: 'static>(value: Opaque) -> Result<T> {
    value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        StateMismatch {
            expected: type_name::<T>(),
        }
        .into()
    })
}

/// [`Backend`] with its associated types erased to [`Opaque`].
#[async_trait]
pub(crate) trait DynBackend: Send + Sync {
    fn id(&self) -> BackendId;

    async fn start(&self, config: &ManagerConfig) -> Result<Opaque>;
    async fn stop(&self, state: Opaque) -> Result<()>;
    async fn prepare_spec(&self, spec: NodeSpec, state: &Opaque) -> Result<Opaque>;
    fn peer_from_spec(&self, spec: &Opaque, state: &Opaque) -> Result<Address>;
    fn get_peer_address(&self, node: &Opaque) -> Result<Address>;
    async fn setup_node(
        &self,
        spec: Opaque,
        peers: Vec<Address>,
        state: &mut Opaque,
    ) -> Result<Opaque>;
    async fn start_node(&self, node: &mut Opaque) -> Result<()>;
    async fn stop_node(&self, node: &mut Opaque, soft_timeout: Duration) -> Result<()>;
    async fn kill_node(&self, node: &mut Opaque) -> Result<()>;
    async fn delete_node(&self, node: Opaque) -> Result<()>;
    async fn get_service_address(&self, service: &str, node: &Opaque) -> Result<Address>;
    async fn get_node_pubkey(&self, node: &Opaque) -> Result<PublicKey>;
    fn get_log_path(&self, node: &Opaque) -> Result<PathBuf>;
    async fn node_logs(&self, node: &Opaque) -> Result<()>;
    async fn run_cmd_in_node_dir(
        &self,
        node: &mut Opaque,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<CmdOutput>;
    async fn extract_archive(&self, node: &mut Opaque, path: &Path, archive: Bytes) -> Result<()>;
    async fn connect_node(&self, network: &str, node: &mut Opaque) -> Result<()>;
    async fn disconnect_node(&self, network: &str, node: &mut Opaque) -> Result<()>;
}

#[async_trait]
impl<B: Backend> DynBackend for B {
    fn id(&self) -> BackendId {
        Backend::id(self)
    }

    async fn start(&self, config: &ManagerConfig) -> Result<Opaque> {
        let state = Backend::start(self, config).await?;
        Ok(Box::new(state))
    }

    async fn stop(&self, state: Opaque) -> Result<()> {
        Backend::stop(self, downcast::<B::State>(state)?).await
    }

    async fn prepare_spec(&self, spec: NodeSpec, state: &Opaque) -> Result<Opaque> {
        let state = downcast_ref::<B::State>(state)?;
        let prepared = Backend::prepare_spec(self, spec, state).await?;
        Ok(Box::new(prepared))
    }

    fn peer_from_spec(&self, spec: &Opaque, state: &Opaque) -> Result<Address> {
        Backend::peer_from_spec(
            self,
            downcast_ref::<B::Prepared>(spec)?,
            downcast_ref::<B::State>(state)?,
        )
    }

    fn get_peer_address(&self, node: &Opaque) -> Result<Address> {
        Backend::get_peer_address(self, downcast_ref::<B::Node>(node)?)
    }

    async fn setup_node(
        &self,
        spec: Opaque,
        peers: Vec<Address>,
        state: &mut Opaque,
    ) -> Result<Opaque> {
        let spec = downcast::<B::Prepared>(spec)?;
        let state = downcast_mut::<B::State>(state)?;
        let node = Backend::setup_node(self, spec, peers, state).await?;
        Ok(Box::new(node))
    }

    async fn start_node(&self, node: &mut Opaque) -> Result<()> {
        Backend::start_node(self, downcast_mut::<B::Node>(node)?).await
    }

    async fn stop_node(&self, node: &mut Opaque, soft_timeout: Duration) -> Result<()> {
        Backend::stop_node(self, downcast_mut::<B::Node>(node)?, soft_timeout).await
    }

    async fn kill_node(&self, node: &mut Opaque) -> Result<()> {
        Backend::kill_node(self, downcast_mut::<B::Node>(node)?).await
    }

    async fn delete_node(&self, node: Opaque) -> Result<()> {
        Backend::delete_node(self, downcast::<B::Node>(node)?).await
    }

    async fn get_service_address(&self, service: &str, node: &Opaque) -> Result<Address> {
        Backend::get_service_address(self, service, downcast_ref::<B::Node>(node)?).await
    }

    async fn get_node_pubkey(&self, node: &Opaque) -> Result<PublicKey> {
        Backend::get_node_pubkey(self, downcast_ref::<B::Node>(node)?).await
    }

    fn get_log_path(&self, node: &Opaque) -> Result<PathBuf> {
        Ok(Backend::get_log_path(self, downcast_ref::<B::Node>(node)?))
    }

    async fn node_logs(&self, node: &Opaque) -> Result<()> {
        Backend::node_logs(self, downcast_ref::<B::Node>(node)?).await
    }

    async fn run_cmd_in_node_dir(
        &self,
        node: &mut Opaque,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<CmdOutput> {
        Backend::run_cmd_in_node_dir(self, downcast_mut::<B::Node>(node)?, cmd, timeout).await
    }

    async fn extract_archive(&self, node: &mut Opaque, path: &Path, archive: Bytes) -> Result<()> {
        Backend::extract_archive(self, downcast_mut::<B::Node>(node)?, path, archive).await
    }

    async fn connect_node(&self, network: &str, node: &mut Opaque) -> Result<()> {
        Backend::connect_node(self, network, downcast_mut::<B::Node>(node)?).await
    }

    async fn disconnect_node(&self, network: &str, node: &mut Opaque) -> Result<()> {
        Backend::disconnect_node(self, network, downcast_mut::<B::Node>(node)?).await
    }
}
