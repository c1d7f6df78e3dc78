//! Async autoupdate service core — single-flight key cache, change fan-out topic, and per-user
//! restricted push subscriptions over a JSON datastore.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod http;
pub mod metrics;
pub mod topic;

mod datastore;
mod error;
mod key;
mod request;
mod restrict;
mod retry;
mod service;
mod subscription;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use bytes::Bytes;
	pub use chrono::{DateTime, Utc};

	pub use crate::{Error, Result};
}
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	cache::{manager::KeyCache, state::Value},
	datastore::{ChangeBatch, ChangeStream, Datastore, Source},
	error::{Error, Result},
	key::Key,
	request::{FieldRequest, KeyRequest, Selector},
	restrict::{AllowAll, Restricter},
	retry::RetryPolicy,
	service::{Autoupdate, AutoupdateBuilder, ServiceStatus},
	subscription::Subscription,
};
