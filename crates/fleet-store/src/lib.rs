pub mod etcd;
pub mod memory;
pub mod types;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use types::{ClusterDirectory, ClusterEvent, ClusterWatchStream, FleetStore, NodeInventory};
