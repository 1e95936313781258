//! Client for the leader directory: a tiny RPC service holding the
//! current leader address. New joiners ask it where the ring is; the
//! elected leader keeps it up to date.

use std::time::Duration;

use stampede_proto::Process;
use stampede_proto::rpc::{
    LookupLeaderResponse, ResponseStatus, UpdateLeaderRequest, UpdateLeaderResponse,
};

use crate::error::{Error, Result};
use crate::rpc::{RpcClient, routes};

const DIRECTORY_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct DirectoryClient {
    addr: String,
    rpc: RpcClient,
}

impl DirectoryClient {
    pub fn new(addr: impl Into<String>, rpc: RpcClient) -> Self {
        Self {
            addr: addr.into(),
            rpc,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current leader address, or `None` when no leader has registered.
    pub async fn lookup(&self) -> Result<Option<String>> {
        let response: LookupLeaderResponse = self
            .rpc
            .post(
                &self.addr,
                routes::DIRECTORY_LOOKUP,
                &serde_json::json!({}),
                DIRECTORY_DEADLINE,
            )
            .await?;
        Ok(response.address.filter(|addr| !addr.is_empty()))
    }

    pub async fn update(&self, leader: &Process) -> Result<()> {
        let response: UpdateLeaderResponse = self
            .rpc
            .post(
                &self.addr,
                routes::DIRECTORY_UPDATE,
                &UpdateLeaderRequest {
                    leader: leader.clone(),
                },
                DIRECTORY_DEADLINE,
            )
            .await?;

        match response.status {
            ResponseStatus::Ok => Ok(()),
            _ => Err(Error::PeerStatus("directory update")),
        }
    }
}
