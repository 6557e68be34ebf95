pub mod schema;

pub use schema::{
    ChannelsConfig, Config, EngineConfig, GatewayConfig, GeneratorConfig, HandoverConfig,
    StorageConfig, WhatsAppConfig,
};
