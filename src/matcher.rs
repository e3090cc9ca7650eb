//! Matcher collaborator seam
//!
//! The expectation engine lives outside this crate. Decoded requests are
//! offered to a [`Matcher`]; a `Some` response is written back to the client
//! and a `None` forwards the request upstream.

use crate::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Decides whether a decoded request is answered locally
#[async_trait]
pub trait Matcher: Send + Sync {
  /// Return the mocked response for `request`, or `None` to forward it
  /// upstream
  async fn matches(&self, request: &Request) -> Option<Response>;
}

/// Adapter turning a plain closure into a [`Matcher`]
pub struct FnMatcher<F>(F);

impl<F> FnMatcher<F>
where
  F: Fn(&Request) -> Option<Response> + Send + Sync,
{
  pub fn new(f: F) -> Arc<Self> {
    Arc::new(Self(f))
  }
}

#[async_trait]
impl<F> Matcher for FnMatcher<F>
where
  F: Fn(&Request) -> Option<Response> + Send + Sync,
{
  async fn matches(&self, request: &Request) -> Option<Response> {
    (self.0)(request)
  }
}
