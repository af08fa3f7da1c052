//! # Discussion Service Test Utilities
//!
//! - Server test harness (`TestDsServer` for end-to-end tests over HTTP)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ds_test_utils::TestDsServer;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestDsServer::spawn().await?;
//!     let response = reqwest::get(format!("{}/health", server.url())).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod server_harness;

pub use server_harness::*;
