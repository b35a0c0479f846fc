//! Actor framework and the node manager actor.
//!
//! The node manager is a single actor: every lifecycle operation becomes a
//! message in its mailbox and is handled to completion before the next one.
//! That ordering is what keeps a `start_node` from racing a `cleanup`.

mod framework;
pub mod manager;

pub use framework::{
    spawn, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message,
};
pub use manager::{CleanupReport, ManagerMessage, ManagerStatus, NodeManagerActor, Teardown};
