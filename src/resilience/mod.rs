pub mod classifier;
pub mod key_pool;
pub mod retry;
pub mod tier;


pub use classifier::{ClassifiedFailure, ErrorClassifier, Outcome};
pub use key_pool::{
    KeyRotationPool, KeyState, PoolStatus, ProviderCredentialSet, QuotaReset, mask_key,
};
pub use retry::{RetryEngine, RetryError, RetryPolicy, Retried, Sleeper, TokioSleeper};
pub use tier::{
    CAPABLE_TIER_EXHAUSTED, ModelTier, ModelTierSelector, TierExhaustion, TierSelection,
};
