pub mod config;
pub mod disk;
pub mod logging;

pub use config::Config;

/// A uniformly random 64-bit id.
///
/// Folds both halves of a v4 uuid together so the fixed version and variant
/// bits land on random bits from the other half.
pub fn random_u64() -> u64 {
    let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
    high ^ low
}
