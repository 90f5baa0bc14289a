//! Request loop with lifecycle management.

use crate::database::{Connector, DocumentBackend, RelationalBackend};
use crate::error::{GatewayError, ProtocolError, Result};
use crate::gateway::Gateway;
use crate::protocol::handler::Dispatcher;
use crate::protocol::transport::{StdioTransport, Transport};
use crate::protocol::types::Response;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

/// Serves gateway requests from a transport until end of input.
///
/// Requests run concurrently; responses are written as they complete and
/// carry the request id for correlation. At end of input the loop waits for
/// in-flight requests and then closes every pool.
pub struct GatewayService<D: Connector, R: Connector> {
    dispatcher: Dispatcher<D, R>,
}

impl<D, R> GatewayService<D, R>
where
    D: Connector,
    D::Handle: DocumentBackend,
    R: Connector,
    R::Handle: RelationalBackend,
{
    pub fn new(gateway: Arc<Gateway<D, R>>) -> Self {
        Self {
            dispatcher: Dispatcher::new(gateway),
        }
    }

    /// Run with stdin/stdout.
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let transport = Arc::new(StdioTransport::stdio());
        self.run_with_transport(transport).await
    }

    /// Run with a custom transport.
    pub async fn run_with_transport<T: Transport + 'static>(self, transport: Arc<T>) -> Result<()> {
        let config = self.dispatcher.gateway().config();
        info!("Starting {} v{}", config.name, config.version);

        let mut in_flight = JoinSet::new();
        let outcome = loop {
            // Reap finished requests so the set does not grow without bound.
            while in_flight.try_join_next().is_some() {}

            let message = match transport.read_message().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("EOF received, shutting down");
                    break Ok(());
                }
                Err(GatewayError::Protocol(ProtocolError::ParseError)) => {
                    let response =
                        Response::failure(None, &GatewayError::Protocol(ProtocolError::ParseError));
                    if let Err(e) = transport.write_response(&response).await {
                        error!("Failed to send error response: {}", e);
                    }
                    continue;
                }
                Err(e) => {
                    error!("Transport error: {}", e);
                    break Err(e);
                }
            };

            let dispatcher = self.dispatcher.clone();
            let transport = Arc::clone(&transport);
            in_flight.spawn(async move {
                let response = dispatcher.dispatch(message).await;
                if let Err(e) = transport.write_response(&response).await {
                    error!("Failed to send response: {}", e);
                }
            });
        };

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }

        let closed = self.dispatcher.gateway().close_all().await;
        info!("Service stopped, {} pools closed", closed);
        outcome
    }
}
