pub mod adaptor;
pub mod admission;
pub mod billing;
pub mod client;
pub mod config;
pub mod monitor;
pub mod pipeline;
pub mod precheck;
pub mod relay;
pub mod tokens;

pub use adaptor::{OpenAIAdaptor, OpenAIOAuthAdaptor, build_registry};
pub use admission::{admit, estimated_amount};
pub use billing::{Billing, ConsumeContext, compute_amount, consume};
pub use config::{MonitorConfig, RelayConfig};
pub use monitor::{Monitor, MonitorOutcome};
pub use pipeline::Pipeline;
pub use precheck::{PreCheckBalanceRequest, pre_check};
pub use relay::{ChannelTestResult, PickError, Relay, RelayRequest};
