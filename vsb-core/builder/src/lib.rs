//! VSB 构建器
//!
//! 从 vCenter 中已有的虚拟机或模板克隆出新虚拟机，按配置调整硬件，
//! 可选地等待客户机、创建快照、转换为模板，最终产出一个 [`Artifact`]。
//!
//! # 示例
//!
//! ```no_run
//! use vsb_builder::{Builder, BuilderConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BuilderConfig::load("build.json".as_ref())?;
//! let outcome = Builder::new(config)?.run().await;
//! for artifact in outcome.artifacts() {
//!     println!("{}", artifact);
//! }
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod clone;
pub mod config;
pub mod connector;
pub mod error;
pub mod hook;
pub mod report;
pub mod sequencer;

pub use artifact::{Artifact, BUILDER_ID};
pub use clone::{clone_vm, verify_single_datastore, ClonePlacement, LINKED_CLONE_SNAPSHOT};
pub use config::{BuilderConfig, ConfigFormat};
pub use connector::{Connector, HttpConnector, SharedConnector};
pub use error::{BuildError, BuildFailure, Cleanup, CloneError, ConfigError};
pub use hook::{GuestEndpoint, GuestHook, NoopGuestHook};
pub use report::{BuildReport, Stage, StepReport, StepStatus};
pub use sequencer::{BuildOutcome, Builder, BUILD_SNAPSHOT};
