//! Raft-replicated key-value store with an HTTP API and peer discovery.
//!
//! A cluster of nodes agrees on an ordered log of [`command::Command`]s through
//! the tikv `raft` crate. Every node applies the log to its own
//! [`fsm::KvStateMachine`], so all nodes converge to the same map.
//!
//! # Architecture
//!
//! - **Engine worker**: one task owns the Raft core. Proposals, peer messages
//!   and ticks all arrive over channels, so the core stays single-threaded.
//! - **Transport tasks**: accept and dial TCP connections for Raft messages.
//! - **HTTP server**: axum router. Reads are local; writes are applied on the
//!   leader and forwarded there from everywhere else.
//! - **Reconciler**: drains peer announcements from discovery and asks the
//!   leader to add them, retrying with a fixed backoff.
//!
//! Reads are served by whichever node receives them and may be stale.
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the log
//! - [`fsm`]: state machine trait and the key-value implementation
//! - [`engine`]: consensus engine trait and its Raft implementation
//! - [`store`]: lifecycle and the get/set/delete/join surface
//! - [`directory`]: Raft address to HTTP address map used for forwarding
//! - [`discovery`]: announcement payload and multicast transport
//! - [`reconciler`]: turns announcements into joins
//! - [`router`]: HTTP routes and leader forwarding
//! - [`service`]: wires everything together with graceful shutdown
//! - [`cli`]: command-line flags

pub mod cli;
pub mod command;
pub mod directory;
pub mod discovery;
pub mod engine;
pub mod fsm;
pub mod reconciler;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;
