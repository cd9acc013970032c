//! Safety gate rules and classification.
//!
//! Classification is a pure function of the proposed [`Action`](crate::tools::Action)
//! and a [`RuleTable`]. Enforcement (mode checks, confirmation, audit logging)
//! lives in the dispatcher.

mod classifier;
mod rules;

pub use classifier::{Classification, RiskVerdict, SafetyClassifier};
pub use rules::{CommandRule, HazardClass, RuleTable};
