pub mod analytics;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod product;
pub mod quota;
pub mod record;

pub use analytics::{AnalyticsManager, AnalyticsOptions};
pub use config::Config;
pub use error::{AnalyticsError, ProductError, QuotaError};
pub use handler::{Action, CheckResult, Handler, HandlerBuilder, Subject, Verdict};
pub use metrics::AdapterMetrics;
pub use product::{Product, ProductManager, QuotaTimeUnit};
pub use quota::{QuotaArgs, QuotaManager, QuotaOptions, QuotaResult};
pub use record::Record;
