// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Config loading/saving shared by the relayer binaries.
//!
//! Formats are chosen by file extension: `.yaml`/`.yml` are parsed as YAML,
//! anything else as JSON. `save` mirrors `load` so a config round-trips
//! through the same format it was read from.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config at {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config at {:?}", path))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(())
    }
}

pub struct PersistedConfig<C> {
    inner: C,
    path: std::path::PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

pub mod local_ip_utils {
    use std::net::{IpAddr, SocketAddr, TcpListener};

    // Bind to port 0 and let the OS pick a free port.
    pub fn get_available_port(host: &IpAddr) -> u16 {
        let socket_addr = SocketAddr::new(*host, 0);
        let listener = TcpListener::bind(socket_addr).expect("Failed to bind to random port");
        listener
            .local_addr()
            .expect("Failed to get local address")
            .port()
    }

    pub fn get_available_ports(host: &IpAddr, count: usize) -> Vec<u16> {
        (0..count).map(|_| get_available_port(host)).collect()
    }

    pub fn localhost_for_testing() -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))
    }
}
