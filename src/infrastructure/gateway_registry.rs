//! Exchange Gateway Registry
//!
//! Maps a provider key to a factory building the gateway for one exchange.
//! Factories are registered once at startup; resolving an exchange decodes
//! its stored property bag into the provider's typed configuration.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::domain::entities::exchange::Exchange;
use crate::domain::errors::GatewayError;
use crate::domain::repositories::exchange_gateway::ExchangeGateway;
use crate::domain::services::entry_price::EntryPriceCalculator;
use crate::domain::services::exchange_info_store::ExchangeInfoStore;
use crate::infrastructure::paper_gateway::{
    PaperAccounts, PaperConfig, PaperGateway, PAPER_PROVIDER_KEY,
};
use crate::infrastructure::provider_config::{decode_config, PropertySpec, ProviderConfig};

type GatewayFactory =
    Box<dyn Fn(&Exchange) -> Result<Arc<dyn ExchangeGateway>, GatewayError> + Send + Sync>;

struct RegisteredProvider {
    properties: &'static [PropertySpec],
    factory: GatewayFactory,
}

#[derive(Default)]
pub struct GatewayRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider. Paper gateways keep their
    /// account state in `accounts`, so it survives across resolves.
    pub fn with_builtin(
        store: Arc<ExchangeInfoStore>,
        calculator: Arc<EntryPriceCalculator>,
        accounts: Arc<PaperAccounts>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register::<PaperConfig, _>(PAPER_PROVIDER_KEY, move |config, exchange| {
            Arc::new(PaperGateway::new(
                exchange.id,
                config,
                store.clone(),
                calculator.clone(),
                accounts.clone(),
            )) as Arc<dyn ExchangeGateway>
        });
        registry
    }

    /// Registers `build` under `key`, replacing any previous provider
    pub fn register<C, F>(&mut self, key: &str, build: F)
    where
        C: ProviderConfig + 'static,
        F: Fn(C, &Exchange) -> Arc<dyn ExchangeGateway> + Send + Sync + 'static,
    {
        let factory: GatewayFactory = Box::new(move |exchange: &Exchange| {
            let config = decode_config::<C>(&exchange.properties).map_err(|source| {
                GatewayError::Config {
                    exchange: exchange.label.clone(),
                    source,
                }
            })?;
            Ok(build(config, exchange))
        });

        self.providers.insert(
            key.to_string(),
            RegisteredProvider {
                properties: C::PROPERTIES,
                factory,
            },
        );
        info!("✓ Registered exchange provider {}", key);
    }

    /// Builds the gateway bound to `exchange`
    pub fn resolve(&self, exchange: &Exchange) -> Result<Arc<dyn ExchangeGateway>, GatewayError> {
        let provider = self.providers.get(&exchange.provider_key).ok_or_else(|| {
            error!(
                "✗ No provider {} for exchange {}",
                exchange.provider_key, exchange.id
            );
            GatewayError::UnknownProvider(exchange.provider_key.clone())
        })?;

        (provider.factory)(exchange).map_err(|e| {
            error!("✗ Failed to create gateway for exchange {}: {}", exchange.id, e);
            e
        })
    }

    /// Declared properties of a provider, for configuration forms
    pub fn properties(&self, key: &str) -> Option<&'static [PropertySpec]> {
        self.providers.get(key).map(|p| p.properties)
    }

    pub fn provider_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}
