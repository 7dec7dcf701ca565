pub mod config;
pub mod connection;
pub mod gate;
pub mod identity;
pub mod pipeline;
pub mod registry;
pub mod session;

use lobby_db::Store;

pub use config::{FramePolicy, GatewayConfig};
pub use identity::{AuthError, IdentityVerifier};
pub use registry::SessionRegistry;

/// Everything a chat connection needs, shared by all connection tasks.
#[derive(Clone)]
pub struct Gateway {
    pub store: Store,
    pub verifier: IdentityVerifier,
    pub registry: SessionRegistry,
    pub config: GatewayConfig,
}

impl Gateway {
    pub fn new(store: Store, jwt_secret: &str, config: GatewayConfig) -> Self {
        let verifier = IdentityVerifier::new(jwt_secret, config.token_ttl, store.clone());
        let registry = SessionRegistry::new(config.subscriber_queue_capacity);
        Self {
            store,
            verifier,
            registry,
            config,
        }
    }
}
