//! Shard allocation
//!
//! Decides where shard copies may live and computes new routing tables:
//! - `Decision` and the ordered `AllocationDeciders` chain
//! - Concrete deciders (filters, same-shard, throttling, ...)
//! - `RoutingAllocation`: the per-pass context handed to every decider
//! - `BalancedShardsAllocator`: places unassigned copies and moves
//!   copies that may no longer remain where they are
//! - `AllocationService`: applies started/failed batches and reroutes

pub mod allocator;
pub mod decider;
pub mod decision;
pub mod error;
pub mod routing_allocation;
pub mod routing_nodes;
pub mod service;

pub use allocator::{BalancedShardsAllocator, WeightFunction};
pub use decider::{AllocationDecider, AllocationDeciders};
pub use decision::{Decision, DecisionType};
pub use error::AllocationError;
pub use routing_allocation::{DebugMode, RoutingAllocation};
pub use routing_nodes::{RoutingNode, RoutingNodes};
pub use service::{AllocationService, FailedShard, RoutingResult, RoutingResultExt};
