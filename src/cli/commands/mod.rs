//! CLI command implementations.

mod config;
mod db;
mod start;

pub use config::{run_config, ConfigArgs};
pub use db::{run_db, DbArgs};
pub use start::{run_start, StartArgs};

use crate::core::config::Config;
use crate::redis::RedisClient;
use crate::store::{Namespace, RedisBackend, SharedBackend};
use clap::ValueEnum;
use std::sync::Arc;

/// Stack component whose store a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreNamespace {
    /// Network server device registry.
    Ns,
    /// Application server.
    As,
    /// Join server.
    Js,
}

impl StoreNamespace {
    pub fn root(self, config: &Config) -> Namespace {
        Namespace::new(match self {
            Self::Ns => config.namespaces.ns.as_str(),
            Self::As => config.namespaces.r#as.as_str(),
            Self::Js => config.namespaces.js.as_str(),
        })
    }
}

/// Backend for the configured Redis server.
pub fn connect(config: &Config) -> SharedBackend {
    Arc::new(RedisBackend::new(RedisClient::new(config.redis.clone())))
}
