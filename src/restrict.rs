//! Per-user restriction hook.

// crates.io
use async_trait::async_trait;
// self
use crate::{_prelude::*, cache::state::Value, key::Key};

/// Redacts values a user may not see.
///
/// Invoked on every emission, because permissions may change between
/// iterations; implementations must be pure per call and return one value per
/// input key, substituting the absent marker for redacted slots. Errors abort
/// the current subscription iteration.
#[async_trait]
pub trait Restricter: Send + Sync {
	/// Filter `values` (parallel to `keys`) for the given user.
	async fn restrict(&self, uid: u64, keys: &[Key], values: Vec<Value>) -> Result<Vec<Value>>;
}

/// Restriction policy that lets every value through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;
#[async_trait]
impl Restricter for AllowAll {
	async fn restrict(&self, _: u64, _: &[Key], values: Vec<Value>) -> Result<Vec<Value>> {
		Ok(values)
	}
}
