/// Finding intents and committed values that overlap a write set.
pub mod detection;
/// Turning discovered conflicts into a policy decision.
pub mod resolution;
