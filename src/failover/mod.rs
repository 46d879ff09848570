//! Failover Core
//!
//! Keeps exactly one verified connection to the node holding the configured
//! role, and replaces it when it is lost.
//!
//! # Architecture
//!
//! | Module       | Responsibility                                           |
//! |--------------|----------------------------------------------------------|
//! | `backoff`    | Retry delay between discovery attempts                   |
//! | `role`       | Role inquiry: `ROLE`, falling back to `INFO replication` |
//! | `discovery`  | Ask monitors in order for a node, verify it              |
//! | `verifier`   | Periodic role re-check of the live connection            |
//! | `supervisor` | State machine owning the connection                      |
//! | `proxy`      | Forward commands to the live connection                  |
//! | `events`     | Severity-mapped lifecycle logs and event broadcast       |
//! | `client`     | `FailoverClient`, the public handle                      |

mod backoff;
mod client;
mod discovery;
mod events;
mod proxy;
mod role;
mod supervisor;
mod verifier;

pub use backoff::BackoffPolicy;
pub use client::FailoverClient;
pub use discovery::{Discovered, DiscoveryClient, RandomSource, ThreadRandom};
pub use events::SupervisorEvent;
pub use proxy::CommandProxy;
pub use role::{parse_info, query_role, verify_role};
pub use supervisor::{ConnectionStatus, Phase};
pub use verifier::RoleVerifier;
