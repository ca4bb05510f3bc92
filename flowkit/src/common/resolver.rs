// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::IpAddr;

use futures::{future::BoxFuture, FutureExt};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
  #[error("Lookup of {host} failed: {source}")]
  Lookup {
    host: String,
    #[source]
    source: std::io::Error,
  },
  #[error("{0} resolved to no addresses")]
  NoAddresses(String),
}

/// Name resolution used when routing a session directly to its destination
#[cfg_attr(test, mockall::automock)]
pub trait Resolver {
  fn resolve(&self, hostname: String) -> BoxFuture<'static, Result<Vec<IpAddr>, ResolveError>>;
}

/// Resolves through the operating system's resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
  fn resolve(&self, hostname: String) -> BoxFuture<'static, Result<Vec<IpAddr>, ResolveError>> {
    async move {
      let addresses = tokio::net::lookup_host((hostname.as_str(), 0))
        .await
        .map_err(|source| ResolveError::Lookup {
          host: hostname.clone(),
          source,
        })?;
      let mut ips: Vec<IpAddr> = Vec::new();
      for address in addresses {
        if !ips.contains(&address.ip()) {
          ips.push(address.ip());
        }
      }
      tracing::trace!(host = %hostname, ?ips, "resolved");
      if ips.is_empty() {
        Err(ResolveError::NoAddresses(hostname))
      } else {
        Ok(ips)
      }
    }
    .boxed()
  }
}
