//! In-process service registry, the stand-in for a remote naming service.
//!
//! Servers bind a named call channel here; clients look the name up and get
//! back a [`ServiceStub`] through which requests travel. Everything stays
//! inside one process, so all the unreliability of the "wire" is simulated
//! at the service side.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::server::{ApiReply, ApiRequest};
use crate::utils::RelibankError;

use tokio::sync::{mpsc, oneshot};

/// Registry name that teller-facing operations resolve to.
pub const ATM_SERVICE: &str = "atm-server";

/// Registry name that branch-facing account management operations resolve to.
pub const BRANCH_SERVICE: &str = "branch-server";

/// One in-flight call on the simulated wire: the request paired with the
/// oneshot channel its reply travels back on.
pub type CallMsg = (ApiRequest, oneshot::Sender<ApiReply>);

/// Name-to-channel bindings shared between services and clients.
#[derive(Debug, Default)]
pub struct Registry {
    /// Map from bound service name -> its call channel sender.
    bindings: Mutex<HashMap<String, mpsc::Sender<CallMsg>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Binds a service name to the sending end of its call channel. Each
    /// name can be bound at most once.
    pub fn bind(
        &self,
        name: &str,
        tx_call: mpsc::Sender<CallMsg>,
    ) -> Result<(), RelibankError> {
        let mut bindings = self.bindings.lock().expect("poisoned registry");
        if bindings.contains_key(name) {
            return logged_err!("service name '{}' already bound", name);
        }
        bindings.insert(name.into(), tx_call);
        Ok(())
    }

    /// Looks a service name up, returning a fresh stub on success. Failure
    /// here is ordinary while a service is still coming up, so it is not
    /// logged at error level.
    pub fn lookup(&self, name: &str) -> Result<ServiceStub, RelibankError> {
        let bindings = self.bindings.lock().expect("poisoned registry");
        match bindings.get(name) {
            Some(tx_call) => Ok(ServiceStub {
                tx_call: tx_call.clone(),
            }),
            None => Err(RelibankError::msg(format!(
                "service '{}' not bound",
                name
            ))),
        }
    }
}

/// Client-side handle to a bound service, good for exactly one call.
#[derive(Debug)]
pub struct ServiceStub {
    /// Sending end of the service's call channel.
    tx_call: mpsc::Sender<CallMsg>,
}

impl ServiceStub {
    /// Sends one request and waits for its reply. Consumes the stub; every
    /// attempt acquires its own from [`Registry::lookup`]. Errors indicate
    /// the service is gone, not a dropped response (those arrive as replies
    /// carrying no result).
    pub async fn call(
        self,
        req: ApiRequest,
    ) -> Result<ApiReply, RelibankError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_call.send((req, tx_reply)).await?;
        Ok(rx_reply.await?)
    }
}
