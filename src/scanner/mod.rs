pub mod invoker;
pub mod metrics;

pub use invoker::{InvokeError, InvokeRequest, PullFailedKind, ScannerInvoker};
pub use metrics::{extract, ExtractedMetrics, ScannerDocument};
