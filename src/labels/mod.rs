pub mod client;
pub mod parse;
pub mod provider;
pub mod quota;

pub use client::{build_prompt, LabelClient, LabelOutcome};
pub use parse::{parse_response, LabelParse, LabelSet};
pub use provider::{create_provider, VisionProvider};
pub use quota::QuotaLimiter;
