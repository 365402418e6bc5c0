//! Chain connector implementations.

pub mod jsonrpc;

pub use jsonrpc::{ChainClientConfig, HttpJsonRpcProvider, JsonRpcChainConnector, JsonRpcProvider};
