//! Client library for the Hopper broker.
//!
//! ```no_run
//! # async fn example() -> hopper_client::ClientResult<()> {
//! use hopper_client::Client;
//! use hopper_core::JobSpec;
//!
//! let client = Client::connect("127.0.0.1:7070").await?;
//! let layer = client.push_layer(bytes::Bytes::from_static(b"...")).await?;
//! let handle = client.submit(JobSpec::new("/bin/true", [layer])).await?;
//! let result = client.result(handle).await?;
//! println!("{}", result.outcome);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;

pub use client::{Client, JobHandle, JobResult};
pub use error::{ClientError, ClientResult};
pub use hopper_transport::messages::SubmitOptions;
