//! Authorization and access-scoped querying
//!
//! `OrgResolver` derives what a principal may read; `ScopedGateway`
//! enforces it on every event query.

mod gateway;
mod resolver;

pub use gateway::ScopedGateway;
pub use resolver::{MembershipRule, OrgResolver};
