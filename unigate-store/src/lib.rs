pub mod cache;
pub mod db;
pub mod error;
pub mod keys;
pub mod sessions;
pub mod shard_config;

pub use cache::ApiKeyCache;
pub use error::StoreError;
pub use keys::{ApiKeyRecord, ApiKeyStatus, CachedKeyInfo, KeyStore, PgKeyStore, PricingPlan};
pub use sessions::{PaymentSession, PaymentStore, PgPaymentStore, SessionStatus};
pub use shard_config::{PgShardConfigStore, ShardConfigRecord, ShardConfigStore};
