//! Core library for a dynamic HTTP-to-gRPC reverse proxy: discovers each
//! upstream's schema and HTTP bindings through server reflection at
//! runtime, with no generated stubs or compiled `.proto` descriptors.

pub mod codec;
pub mod dial;
pub mod error;
pub mod grpc_codec;
pub mod httprule_ext;
pub mod metadata;
pub mod pathtemplate;
pub mod proxy;
pub mod reflect_client;
pub mod reflection;
pub mod router;

pub use codec::{CodecSet, HttpCodec};
pub use dial::DialOptions;
pub use error::{ProxyError, Result};
pub use proxy::{make_default_path_extractor, Proxy, ProxyConfig};
pub use reflect_client::ReflectClient;
