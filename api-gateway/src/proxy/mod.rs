pub mod codec;
pub mod grpc_client;
pub mod service_proxy;
pub mod utils;

pub use grpc_client::GrpcBridge;
pub use service_proxy::ServiceProxy;
