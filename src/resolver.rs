use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use log::debug;

use crate::address::NetLocation;

type ResolveFuture = Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>>;

pub trait Resolver: Send + Sync + Debug {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture;
}

/// Resolver backed by the system's getaddrinfo.
#[derive(Debug)]
pub struct NativeResolver;

impl NativeResolver {
    pub fn new() -> Self {
        NativeResolver {}
    }
}

impl Default for NativeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for NativeResolver {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture {
        let address = location.address().clone();
        let port = location.port();
        Box::pin(async move {
            let result = tokio::net::lookup_host((address.to_string(), port))
                .await
                .map(|addrs| {
                    addrs
                        .filter(|addr| !addr.ip().is_unspecified())
                        .collect::<Vec<_>>()
                });
            debug!("resolved {address}:{port} -> {result:?}");
            result
        })
    }
}
