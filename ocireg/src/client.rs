use std::sync::Arc;
use std::time::Duration;

use crate::auth::Auther;
use crate::errors::Result;
use crate::hosts::HostMap;
use crate::retry::Transport;

/// Registry client. Cheap to clone: the HTTP connection pools, token cache
/// and host map are shared between clones.
#[derive(Clone)]
pub struct Client {
    pub(crate) transport: Transport,
    pub(crate) hosts: Arc<HostMap>,
}

impl Client {
    pub fn new() -> Result<Client> {
        Client::with_hosts(HostMap::new())
    }

    pub fn with_hosts(hosts: HostMap) -> Result<Client> {
        let builder = || {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .tcp_keepalive(Duration::from_secs(30))
                .pool_idle_timeout(Duration::from_secs(30))
                .redirect(reqwest::redirect::Policy::limited(5))
        };
        let http = builder().build()?;
        let http_insecure = builder().danger_accept_invalid_certs(true).build()?;
        let auther = Auther::new(http.clone());
        Ok(Client {
            transport: Transport {
                http,
                http_insecure,
                auther,
            },
            hosts: Arc::new(hosts),
        })
    }

    /// The process-wide host configuration map.
    pub fn hosts(&self) -> &HostMap {
        &self.hosts
    }
}
