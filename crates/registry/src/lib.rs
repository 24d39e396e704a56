//! uvnet registry library
//!
//! The registry data model and deployment planner: cells, particles, users
//! and keys; backbone topology computation; per-cell configuration packages.

pub mod keymat;
pub mod package;
pub mod planner;
pub mod registry;
pub mod vpn_config;

pub use keymat::{CentralizedVpnKeys, PairedVpnKeys};
pub use package::{AgentPackage, LocalAgentId, PackageManifest};
pub use planner::{P2pLinksMap, PlannerInput};
pub use registry::{Registry, RegistryRecord};
pub use vpn_config::{WgConfig, WgInterfaceConfig, WgPeerConfig};
