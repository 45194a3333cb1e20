//! Rank groups and the collectives the synchronizer runs over them.

pub mod collective;
pub mod tcp;

pub use collective::{Collective, LocalCollective, LocalGroup, SingleProcess};
pub use tcp::{RendezvousConfig, TcpCollective};
