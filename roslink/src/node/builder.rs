use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};

use tokio::net::TcpListener;
use url::Url;

use crate::{
    node::{
        args::{self, NameResolver},
        Node, NodeError,
    },
    tcpros::subscription::{tcp_dialer, Dialer},
};

const DEFAULT_MASTER_URI: &str = "http://localhost:11311";

/// Builds a [`Node`], resolving every unset value from remappings, the
/// environment, and finally built-in defaults — in that order.
#[derive(Default)]
pub struct NodeBuilder {
    node_name: Option<String>,
    namespace: Option<String>,
    master_url: Option<String>,
    bind_address: Option<SocketAddr>,
    advertise_ip: Option<IpAddr>,
    advertise_hostname: Option<String>,
    log_dir: Option<String>,
    remaps: Vec<(String, String)>,
    non_ros_args: Vec<String>,
    dialer: Option<Dialer>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        NodeBuilder::default()
    }

    /// Seed a builder from `argv`-style arguments, honoring the reserved
    /// `__name`, `__ns`, `__master`, `__ip`, `__hostname` and `__log`
    /// remappings.
    pub fn from_args<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = args::parse_args(args);

        NodeBuilder {
            node_name: Some(parsed.name_override.unwrap_or_else(|| name.to_string())),
            namespace: parsed.namespace,
            master_url: parsed.master_uri,
            advertise_ip: parsed.ip.and_then(|ip| ip.parse().ok()),
            advertise_hostname: parsed.hostname,
            log_dir: parsed.log_dir,
            remaps: parsed.remaps,
            non_ros_args: parsed.non_ros_args,
            ..NodeBuilder::default()
        }
    }

    /// Set the node's name.
    ///
    /// Names must be unique across the graph; registering a duplicate makes
    /// the master shut down the earlier instance.
    pub fn name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Set the namespace relative names resolve in.
    ///
    /// If unset, `ROS_NAMESPACE` is consulted before defaulting to `/`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the ROS master URL.
    ///
    /// If unset, `ROS_MASTER_URI` is consulted before defaulting to
    /// `http://localhost:11311`.
    pub fn master_url(mut self, master_url: impl Into<String>) -> Self {
        self.master_url = Some(master_url.into());
        self
    }

    /// Advertise an IP address instead of a hostname in the node's URLs.
    ///
    /// If both an IP and a hostname are configured, the hostname wins.
    pub fn advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    /// Advertise a specific hostname in the node's URLs.
    pub fn advertise_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.advertise_hostname = Some(hostname.into());
        self
    }

    /// The address the slave API and TCPROS listeners bind to.
    ///
    /// Defaults to `0.0.0.0` with ephemeral ports. The TCPROS listener
    /// always picks its own ephemeral port; only the slave API honors a
    /// non-zero port here.
    pub fn bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Override how subscriptions dial remote publishers. Intended for
    /// tests that splice in a fake transport.
    pub fn dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    fn resolve_namespace(&self) -> String {
        self.namespace
            .clone()
            .or_else(|| env::var("ROS_NAMESPACE").ok())
            .unwrap_or_else(|| String::from("/"))
    }

    fn resolve_master_url(&self) -> Result<Url, NodeError> {
        let url = self
            .master_url
            .clone()
            .or_else(|| env::var("ROS_MASTER_URI").ok())
            .unwrap_or_else(|| String::from(DEFAULT_MASTER_URI));

        Ok(Url::parse(&url)?)
    }

    fn resolve_bind_address(&self) -> SocketAddr {
        self.bind_address
            .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
    }

    fn resolve_advertised_host(&self) -> Result<String, NodeError> {
        if let Some(hostname) = self
            .advertise_hostname
            .clone()
            .or_else(|| env::var("ROS_HOSTNAME").ok())
        {
            return Ok(hostname);
        }

        if let Some(ip) = self
            .advertise_ip
            .or_else(|| env::var("ROS_IP").ok().and_then(|ip| ip.parse().ok()))
        {
            return Ok(ip.to_string());
        }

        gethostname::gethostname()
            .into_string()
            .map_err(|os_str| NodeError::InvalidHostname(os_str.to_string_lossy().into_owned()))
    }

    fn resolve_log_dir(&self) -> Option<String> {
        self.log_dir
            .clone()
            .or_else(|| env::var("ROS_LOG_DIR").ok())
    }

    /// Consume the builder and launch the node.
    pub async fn build(self) -> Result<Node, NodeError> {
        let namespace = self.resolve_namespace();
        let name = self
            .node_name
            .clone()
            .unwrap_or_else(|| String::from("/roslink"));

        let qualified_name = if name.starts_with('/') {
            name
        } else if namespace == "/" {
            format!("/{name}")
        } else {
            format!("{namespace}/{name}")
        };

        let resolver = NameResolver::new(&namespace, &qualified_name, &self.remaps);

        let bind_address = self.resolve_bind_address();
        let api_listener = TcpListener::bind(bind_address).await?;

        let tcpros_bind = SocketAddr::new(bind_address.ip(), 0);
        let tcpros_listener = TcpListener::bind(tcpros_bind).await?;

        Node::from_parts(
            resolver,
            self.resolve_advertised_host()?,
            api_listener,
            tcpros_listener,
            self.resolve_master_url()?,
            self.dialer.clone().unwrap_or_else(tcp_dialer),
            self.non_ros_args.clone(),
            self.resolve_log_dir(),
        )
        .await
    }
}
