//! `capturemock` provides capture/replay mocking to perform black-box
//! testing of applications that interact with external collaborators:
//! command-line child processes, HTTP/FTP/XML-RPC/AMQP endpoints and raw
//! binary TCP services.
//!
//! It interposes between the system-under-test and the real collaborator.
//! In *record* mode every interaction is forwarded to the real thing and
//! journalled to a text file; in *replay* mode responses are served from
//! the journal with no collaborator present, and the first deviation from
//! the recorded conversation fails the test. A third mode replays when an
//! entry exists and falls back to recording otherwise.
//!
//! # Getting started
//! ```rust,no_run
//! use capturemock::{CaptureMode, CaptureServer, DispatcherBuilder, RcConfig};
//!
//! #[tokio::main]
//! async fn main() -> capturemock::Result<()> {
//!     // Serve a previously recorded session, with no backend running.
//!     let config = RcConfig::load(&["test.rc".into()])?;
//!     let dispatcher = DispatcherBuilder::new(CaptureMode::Replay, config.clone())
//!         .replay_file(Some("traffic.journal".into()))
//!         .build()?;
//!     let server = CaptureServer::start(config, dispatcher).await?;
//!
//!     // Point the SUT at server.address(), run the test...
//!     println!("mock collaborator on {}", server.address());
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # The journal
//!
//! Traffic is journalled as text, one block per message: a descriptor
//! line `<-CLI:ping` or `->SRV:pong`, continuation lines for multi-line
//! payloads, and `--HEA:` / `--TIM:` annotation lines for headers and
//! timestamps. The journal written by a record session is the replay
//! input for the next run, and it is deliberately diffable and editable.
//!
//! # Interception
//!
//! Servers are mocked by pointing the SUT at the capture server's
//! address. Command-line collaborators are mocked through `PATH`
//! interception: [`InterceptFactory`] fills a directory with shim
//! executables that divert invocations to the server, which replays
//! stdout, stderr and the exit code.
//!
//! # Test isolation
//!
//! Each [`CaptureServer`] binds a free local port at start-up and owns
//! its journal for its lifetime; run one instance per test. Concurrent
//! requests are linearised in the journal by arrival order, so recorded
//! sessions stay stable under scheduling noise.
pub mod adapters;
pub mod alteration;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod edits;
pub mod error;
pub mod intercept;
pub mod journal;
pub mod recorder;
pub mod replay;
pub mod server;
pub mod traffic;

pub use adapters::ServerProtocol;
pub use config::RcConfig;
pub use dispatcher::{CaptureMode, Dispatcher, DispatcherBuilder};
pub use driver::{DriverOptions, ServerDriver};
pub use error::{Error, Result};
pub use intercept::InterceptFactory;
pub use recorder::RecordFileWriter;
pub use replay::{ReplayIndex, ReplayOutcome};
pub use server::CaptureServer;
pub use traffic::{Direction, TrafficItem, TrafficTag};
