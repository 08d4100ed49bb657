//! Turns a freshly connected byte stream into a handshaken, (optionally) authenticated
//! [`Connection`](super::conn::Connection), ready to be pooled or used for monitoring.

pub(crate) mod handshake;

use async_trait::async_trait;

use self::handshake::{handshake_command, negotiate_auth_mechanism};
use crate::{
    cmap::conn::{AsyncStream, Connection, ConnectionGeneration},
    error::{Error, ErrorKind, Result},
    hello::{run_hello, HelloReply},
    options::{Credential, ServerApi, ServerAddress},
};

/// Performs the cryptographic half of authenticating a connection for a given mechanism.
///
/// The handshake negotiates *which* mechanism to use (§4.A) and the rest of this crate drives
/// *when* authentication happens; the actual SASL/SCRAM conversation is intentionally left to an
/// implementor of this trait, since evaluating those algorithms is out of scope here.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates `conn` against `credential`, using whichever mechanism
    /// [`negotiate_auth_mechanism`] selected. `conn` has already completed its handshake and has
    /// a populated `stream_description` by the time this is called.
    async fn authenticate(&self, conn: &mut Connection, credential: &Credential) -> Result<()>;
}

/// Options needed to perform the handshake (and, if configured, authentication) on a new
/// connection. Cheap to clone; shared across every connection a pool establishes.
#[derive(Clone)]
pub(crate) struct EstablisherOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) server_api: Option<ServerApi>,
    pub(crate) load_balanced: bool,
    pub(crate) credential: Option<Credential>,
}

/// Drives the handshake and optional authentication of a connection immediately after its
/// transport-level stream is established. Holds no state about any particular connection; it is
/// cloned into every pool worker and reused for the lifetime of the pool.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    options: EstablisherOptions,
    authenticator: Option<std::sync::Arc<dyn Authenticator>>,
}

impl ConnectionEstablisher {
    pub(crate) fn new(
        options: EstablisherOptions,
        authenticator: Option<std::sync::Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            options,
            authenticator,
        }
    }

    /// Runs the handshake on `conn` and, if a credential is configured, authenticates it.
    /// Intended for connections that will be handed back to a pool.
    pub(crate) async fn establish_connection(&self, conn: &mut Connection) -> Result<()> {
        let _reply = self.handshake(conn).await?;

        if let Some(credential) = &self.options.credential {
            let authenticator = self.authenticator.as_ref().ok_or_else(|| {
                Error::from(ErrorKind::Authentication {
                    message: "a credential was configured but no authenticator was provided"
                        .to_string(),
                })
            })?;
            authenticator.authenticate(conn, credential).await?;
        }

        Ok(())
    }

    /// Runs just the handshake, skipping authentication, and returns its `hello` reply. Monitoring
    /// connections issue no application commands, so there's nothing to authenticate for, but the
    /// Monitor needs the reply itself to record as its first scan result.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        conn: &mut Connection,
    ) -> Result<HelloReply> {
        self.handshake(conn).await
    }

    async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let command = handshake_command(
            self.options.app_name.clone(),
            self.options.server_api.as_ref(),
            self.options.load_balanced,
            self.options.credential.as_ref(),
        )?;

        let reply = run_hello(conn, command).await?;
        conn.stream_description = Some(crate::cmap::conn::StreamDescription::from_hello_reply(&reply));

        if let Some(credential) = &self.options.credential {
            let mechanism = negotiate_auth_mechanism(credential, &reply);
            tracing::debug!(
                target: "mongodb_core::establish",
                mechanism = %mechanism,
                server = %reply.server_address,
                "negotiated authentication mechanism"
            );
        }

        Ok(reply)
    }
}

/// Connects a new TCP stream to `address` and drives it through the handshake (and, for pooled
/// connections, authentication), returning a [`Connection`] ready to be used or checked in.
pub(crate) async fn connect(
    id: u32,
    address: ServerAddress,
    generation: ConnectionGeneration,
    stream: Box<dyn AsyncStream>,
    establisher: &ConnectionEstablisher,
    monitoring: bool,
) -> Result<Connection> {
    let mut conn = Connection::new(id, address, generation, stream);

    if monitoring {
        let _reply = establisher.establish_monitoring_connection(&mut conn).await?;
    } else {
        establisher.establish_connection(&mut conn).await?;
    }

    Ok(conn)
}
