pub mod acceptor;
pub mod cm;
pub mod cq;
pub mod endpoint;
pub mod verbs;

#[cfg(feature = "rdma")]
pub mod context;

pub use acceptor::{initialize_from_accept, EndpointTable};
pub use endpoint::{Endpoint, EndpointContext, HandshakeProgress, Status};

#[cfg(feature = "rdma")]
use sideway::ibverbs::device::{DeviceInfo, DeviceList};

#[cfg(feature = "rdma")]
pub fn get_device_list() -> Vec<String> {
    match DeviceList::new() {
        Ok(list) => list.iter().map(|d| d.name()).collect(),
        Err(_) => Vec::new(),
    }
}
