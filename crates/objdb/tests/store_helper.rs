//! Containerised etcd and Consul instances for backend integration tests.

#![allow(dead_code)]

use contiv_objdb::{ObjdbClient, ObjdbConfig, PluginRegistry};
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

const ETCD_PORT: u16 = 2379;
const CONSUL_PORT: u16 = 8500;

/// A running store container and the URL clients reach it at.
pub struct StoreTestEnv {
    _container: ContainerAsync<GenericImage>,
    pub url: String,
}

impl StoreTestEnv {
    /// Starts a single-member etcd cluster.
    pub async fn etcd() -> Result<Self, Box<dyn std::error::Error>> {
        let container = GenericImage::new("quay.io/coreos/etcd", "v3.5.17")
            .with_exposed_port(ContainerPort::Tcp(ETCD_PORT))
            .with_wait_for(WaitFor::message_on_stderr("ready to serve client requests"))
            .with_cmd([
                "etcd",
                "--listen-client-urls",
                "http://0.0.0.0:2379",
                "--advertise-client-urls",
                "http://0.0.0.0:2379",
            ])
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(ETCD_PORT).await?;
        Ok(Self {
            _container: container,
            url: format!("etcd://{}:{}", host, port),
        })
    }

    /// Starts a Consul agent in dev mode.
    pub async fn consul() -> Result<Self, Box<dyn std::error::Error>> {
        let container = GenericImage::new("hashicorp/consul", "1.20")
            .with_exposed_port(ContainerPort::Tcp(CONSUL_PORT))
            .with_wait_for(WaitFor::message_on_stdout("Consul agent running!"))
            .with_wait_for(WaitFor::seconds(2))
            .with_cmd(["agent", "-dev", "-client", "0.0.0.0"])
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(CONSUL_PORT).await?;
        Ok(Self {
            _container: container,
            url: format!("consul://{}:{}", host, port),
        })
    }

    /// A client with its own registry, as a separate cluster member has.
    pub async fn client(&self) -> ObjdbClient {
        let mut config = ObjdbConfig::default();
        config.watch.wait_secs = 2;
        config.watch.error_backoff_ms = 200;
        PluginRegistry::with_builtin()
            .new_client(&self.url, &config)
            .await
            .expect("Failed to connect to store container")
    }
}
