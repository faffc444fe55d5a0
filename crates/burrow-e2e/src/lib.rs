//! End-to-end test utilities for the Burrow console
//!
//! Runs the real console over HTTP(S) against a mock Cloudflare API and fake
//! `cloudflared`/`xray` executables, so tests need no network access.

pub mod certificates;
pub mod fake_bins;
pub mod harness;
pub mod mock_cloudflare;

pub use certificates::TestCertificates;
pub use fake_bins::{FakeBinaries, QUICK_TUNNEL_URL};
pub use harness::{TestConsole, TestOptions, ADMIN_PASSWORD};
pub use mock_cloudflare::{MockCloudflare, RecordedCall};
